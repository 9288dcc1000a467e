// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Host-resident values.
//!
//! Array data is always stored row-major on the host; device layouts are only
//! applied when bytes cross to device memory.

use std::fmt;

use crate::error::{LocalError, Result};
use crate::shape::{ArrayShape, Layout, PrimitiveType, Shape};

/// Rust element types that map onto a [`PrimitiveType`].
pub trait NativeType: bytemuck::Pod + Send + Sync + 'static {
    const TYPE: PrimitiveType;
}

impl NativeType for i32 {
    const TYPE: PrimitiveType = PrimitiveType::S32;
}

impl NativeType for i64 {
    const TYPE: PrimitiveType = PrimitiveType::S64;
}

impl NativeType for u32 {
    const TYPE: PrimitiveType = PrimitiveType::U32;
}

impl NativeType for f32 {
    const TYPE: PrimitiveType = PrimitiveType::F32;
}

impl NativeType for f64 {
    const TYPE: PrimitiveType = PrimitiveType::F64;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLiteral {
    element_type: PrimitiveType,
    dims: Vec<usize>,
    data: Vec<u8>,
}

impl ArrayLiteral {
    pub fn new(element_type: PrimitiveType, dims: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = dims.iter().product::<usize>() * element_type.byte_size();
        if data.len() != expected {
            return Err(LocalError::Shape(format!(
                "{element_type}{dims:?} needs {expected} bytes but {} were provided",
                data.len()
            )));
        }
        Ok(Self {
            element_type,
            dims,
            data,
        })
    }

    pub fn zeros(element_type: PrimitiveType, dims: Vec<usize>) -> Self {
        let len = dims.iter().product::<usize>() * element_type.byte_size();
        Self {
            element_type,
            dims,
            data: vec![0; len],
        }
    }

    pub fn element_type(&self) -> PrimitiveType {
        self.element_type
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Shape with the row-major layout host data is stored in.
    pub fn shape(&self) -> ArrayShape {
        ArrayShape {
            element_type: self.element_type,
            dims: self.dims.clone(),
            layout: Some(Layout::default_for_rank(self.dims.len())),
        }
    }

    pub fn to_vec<T: NativeType>(&self) -> Result<Vec<T>> {
        if T::TYPE != self.element_type {
            return Err(LocalError::Shape(format!(
                "cannot read {} elements as {}",
                self.element_type,
                T::TYPE
            )));
        }
        Ok(self
            .data
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    pub fn to_preds(&self) -> Result<Vec<bool>> {
        if self.element_type != PrimitiveType::Pred {
            return Err(LocalError::Shape(format!(
                "cannot read {} elements as pred",
                self.element_type
            )));
        }
        Ok(self.data.iter().map(|b| *b != 0).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Array(ArrayLiteral),
    Tuple(Vec<Literal>),
}

impl Literal {
    pub fn scalar<T: NativeType>(value: T) -> Self {
        Literal::Array(ArrayLiteral {
            element_type: T::TYPE,
            dims: Vec::new(),
            data: bytemuck::bytes_of(&value).to_vec(),
        })
    }

    pub fn vector<T: NativeType>(values: &[T]) -> Self {
        Literal::Array(ArrayLiteral {
            element_type: T::TYPE,
            dims: vec![values.len()],
            data: bytemuck::cast_slice(values).to_vec(),
        })
    }

    /// Row-major array; fails when `values` does not fill `dims` exactly.
    pub fn array<T: NativeType>(dims: Vec<usize>, values: &[T]) -> Result<Self> {
        let data = bytemuck::cast_slice(values).to_vec();
        Ok(Literal::Array(ArrayLiteral::new(T::TYPE, dims, data)?))
    }

    pub fn pred(value: bool) -> Self {
        Literal::Array(ArrayLiteral {
            element_type: PrimitiveType::Pred,
            dims: Vec::new(),
            data: vec![u8::from(value)],
        })
    }

    pub fn tuple(elements: Vec<Literal>) -> Self {
        Literal::Tuple(elements)
    }

    /// A zero-filled literal of `shape` (layouts are ignored).
    pub fn zeros(shape: &Shape) -> Self {
        match shape {
            Shape::Array(array) => {
                Literal::Array(ArrayLiteral::zeros(array.element_type, array.dims.clone()))
            }
            Shape::Tuple(elements) => Literal::Tuple(elements.iter().map(Literal::zeros).collect()),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Literal::Array(array) => Shape::Array(array.shape()),
            Literal::Tuple(elements) => Shape::Tuple(elements.iter().map(Literal::shape).collect()),
        }
    }

    pub fn as_array(&self) -> Option<&ArrayLiteral> {
        match self {
            Literal::Array(array) => Some(array),
            Literal::Tuple(_) => None,
        }
    }

    pub fn tuple_elements(&self) -> &[Literal] {
        match self {
            Literal::Tuple(elements) => elements,
            Literal::Array(_) => &[],
        }
    }

    pub fn decompose_tuple(self) -> Result<Vec<Literal>> {
        match self {
            Literal::Tuple(elements) => Ok(elements),
            Literal::Array(array) => Err(LocalError::Shape(format!(
                "cannot decompose non-tuple literal of shape {}",
                Shape::Array(array.shape())
            ))),
        }
    }

    fn expect_array(&self) -> Result<&ArrayLiteral> {
        self.as_array()
            .ok_or_else(|| LocalError::Shape(format!("expected an array, got {}", self.shape())))
    }

    pub fn to_vec<T: NativeType>(&self) -> Result<Vec<T>> {
        self.expect_array()?.to_vec()
    }

    /// The single element of a rank-0 array.
    pub fn get_scalar<T: NativeType>(&self) -> Result<T> {
        let array = self.expect_array()?;
        if array.element_count() != 1 {
            return Err(LocalError::Shape(format!(
                "expected one element, found {}",
                array.element_count()
            )));
        }
        let mut values = array.to_vec::<T>()?;
        values
            .pop()
            .ok_or_else(|| LocalError::Shape("empty array".to_string()))
    }
}

fn write_elements(f: &mut fmt::Formatter<'_>, array: &ArrayLiteral) -> fmt::Result {
    fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, values: &[T]) -> fmt::Result {
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
    match array.element_type {
        PrimitiveType::Pred => join(f, &array.to_preds().map_err(|_| fmt::Error)?),
        PrimitiveType::S32 => join(f, &array.to_vec::<i32>().map_err(|_| fmt::Error)?),
        PrimitiveType::S64 => join(f, &array.to_vec::<i64>().map_err(|_| fmt::Error)?),
        PrimitiveType::U32 => join(f, &array.to_vec::<u32>().map_err(|_| fmt::Error)?),
        PrimitiveType::F32 => join(f, &array.to_vec::<f32>().map_err(|_| fmt::Error)?),
        PrimitiveType::F64 => join(f, &array.to_vec::<f64>().map_err(|_| fmt::Error)?),
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Array(array) => {
                let mut shape = array.shape();
                shape.layout = None;
                write!(f, "{} ", Shape::Array(shape))?;
                if array.dims.is_empty() {
                    write_elements(f, array)
                } else {
                    write!(f, "{{")?;
                    write_elements(f, array)?;
                    write!(f, "}}")
                }
            }
            Literal::Tuple(elements) => {
                write!(f, "(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip_and_type_check() {
        let lit = Literal::scalar(7i32);
        assert_eq!(lit.get_scalar::<i32>().unwrap(), 7);
        assert!(lit.get_scalar::<f32>().is_err());
        assert_eq!(lit.shape(), Shape::Array(lit.as_array().unwrap().shape()));
    }

    #[test]
    fn array_length_is_checked() {
        assert!(Literal::array(vec![2, 2], &[1.0f32, 2.0, 3.0]).is_err());
        let lit = Literal::array(vec![2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(lit.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn display_forms() {
        let lit = Literal::tuple(vec![
            Literal::scalar(1.5f32),
            Literal::vector(&[1i32, 2]),
            Literal::pred(true),
        ]);
        assert_eq!(lit.to_string(), "(f32[] 1.5, s32[2] {1, 2}, pred[] true)");
    }

    #[test]
    fn zeros_follow_shape() {
        let shape = Shape::tuple(vec![
            Shape::array(PrimitiveType::F64, vec![3]),
            Shape::scalar(PrimitiveType::Pred),
        ]);
        let lit = Literal::zeros(&shape);
        assert!(lit.shape().compatible(&shape));
        assert_eq!(lit.tuple_elements()[0].to_vec::<f64>().unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn decompose_rejects_arrays() {
        assert!(Literal::scalar(1u32).decompose_tuple().is_err());
        let parts = Literal::tuple(vec![Literal::scalar(1u32)]).decompose_tuple().unwrap();
        assert_eq!(parts.len(), 1);
    }
}
