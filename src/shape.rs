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

//! Shapes, layouts and shape indices.
//!
//! A [`Shape`] is either a dense array with an element type, dimensions and an
//! optional physical [`Layout`], or a (possibly nested) tuple of shapes. Every
//! subshape is addressed by a [`ShapeIndex`], the path of tuple positions from
//! the root. Walks over a shape are always in canonical pre-order.

use std::fmt;

use crate::error::{LocalError, Result};

/// Element type of an array shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Pred,
    S32,
    S64,
    U32,
    F32,
    F64,
}

impl PrimitiveType {
    pub fn byte_size(self) -> usize {
        match self {
            PrimitiveType::Pred => 1,
            PrimitiveType::S32 | PrimitiveType::U32 | PrimitiveType::F32 => 4,
            PrimitiveType::S64 | PrimitiveType::F64 => 8,
        }
    }

    pub fn is_integral(self) -> bool {
        matches!(self, PrimitiveType::S32 | PrimitiveType::S64 | PrimitiveType::U32)
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, PrimitiveType::F32 | PrimitiveType::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::Pred => "pred",
            PrimitiveType::S32 => "s32",
            PrimitiveType::S64 => "s64",
            PrimitiveType::U32 => "u32",
            PrimitiveType::F32 => "f32",
            PrimitiveType::F64 => "f64",
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical ordering of an array's dimensions, minor-most first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    minor_to_major: Vec<usize>,
}

impl Layout {
    pub fn new(minor_to_major: Vec<usize>) -> Self {
        Self { minor_to_major }
    }

    /// Row-major layout: the last dimension is minor-most.
    pub fn default_for_rank(rank: usize) -> Self {
        Self {
            minor_to_major: (0..rank).rev().collect(),
        }
    }

    pub fn minor_to_major(&self) -> &[usize] {
        &self.minor_to_major
    }

    pub fn is_default_for_rank(&self, rank: usize) -> bool {
        *self == Layout::default_for_rank(rank)
    }

    fn validate(&self, rank: usize) -> Result<()> {
        let mut seen = vec![false; rank];
        if self.minor_to_major.len() != rank {
            return Err(LocalError::Shape(format!(
                "layout {self} has {} entries but the array has rank {rank}",
                self.minor_to_major.len()
            )));
        }
        for &dim in &self.minor_to_major {
            if dim >= rank || seen[dim] {
                return Err(LocalError::Shape(format!(
                    "layout {self} is not a permutation of 0..{rank}"
                )));
            }
            seen[dim] = true;
        }
        Ok(())
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, dim) in self.minor_to_major.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayShape {
    pub element_type: PrimitiveType,
    pub dims: Vec<usize>,
    pub layout: Option<Layout>,
}

impl ArrayShape {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.element_type.byte_size()
    }

    /// The layout, or row-major when none has been assigned.
    pub fn layout_or_default(&self) -> Layout {
        self.layout
            .clone()
            .unwrap_or_else(|| Layout::default_for_rank(self.rank()))
    }

    pub fn compatible(&self, other: &ArrayShape) -> bool {
        self.element_type == other.element_type && self.dims == other.dims
    }
}

/// Path of tuple positions from the root of a shape to one of its subshapes.
pub type ShapeIndex = Vec<usize>;

/// A subshape together with its index in the enclosing shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedShape {
    pub index: ShapeIndex,
    pub shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Array(ArrayShape),
    Tuple(Vec<Shape>),
}

impl Shape {
    /// Array shape without a layout.
    pub fn array(element_type: PrimitiveType, dims: Vec<usize>) -> Self {
        Shape::Array(ArrayShape {
            element_type,
            dims,
            layout: None,
        })
    }

    pub fn scalar(element_type: PrimitiveType) -> Self {
        Shape::array(element_type, Vec::new())
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple(elements)
    }

    /// Array shape with an explicit minor-to-major layout.
    pub fn array_with_layout(
        element_type: PrimitiveType,
        dims: Vec<usize>,
        minor_to_major: Vec<usize>,
    ) -> Result<Self> {
        let layout = Layout::new(minor_to_major);
        layout.validate(dims.len())?;
        Ok(Shape::Array(ArrayShape {
            element_type,
            dims,
            layout: Some(layout),
        }))
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Shape::Array(_))
    }

    pub fn as_array(&self) -> Option<&ArrayShape> {
        match self {
            Shape::Array(array) => Some(array),
            Shape::Tuple(_) => None,
        }
    }

    pub fn tuple_elements(&self) -> &[Shape] {
        match self {
            Shape::Tuple(elements) => elements,
            Shape::Array(_) => &[],
        }
    }

    pub fn tuple_element_count(&self) -> usize {
        self.tuple_elements().len()
    }

    pub fn subshape(&self, index: &[usize]) -> Option<&Shape> {
        let mut current = self;
        for &i in index {
            current = current.tuple_elements().get(i)?;
        }
        Some(current)
    }

    /// Every subshape (tuples included) in canonical pre-order.
    pub fn subshapes(&self) -> Vec<(ShapeIndex, &Shape)> {
        let mut out = Vec::new();
        collect_subshapes(self, &mut Vec::new(), &mut out);
        out
    }

    /// The non-tuple subshapes in canonical pre-order.
    pub fn leaf_shapes(&self) -> Vec<IndexedShape> {
        self.subshapes()
            .into_iter()
            .filter(|(_, shape)| !shape.is_tuple())
            .map(|(index, shape)| IndexedShape {
                index,
                shape: shape.clone(),
            })
            .collect()
    }

    /// Bytes needed on device for this node alone: the element data of an
    /// array, or the index table (one 64-bit address per element) of a tuple.
    pub fn node_byte_size(&self) -> usize {
        match self {
            Shape::Array(array) => array.byte_size(),
            Shape::Tuple(elements) => elements.len() * std::mem::size_of::<u64>(),
        }
    }

    /// Structural equality ignoring layouts.
    pub fn compatible(&self, other: &Shape) -> bool {
        match (self, other) {
            (Shape::Array(a), Shape::Array(b)) => a.compatible(b),
            (Shape::Tuple(a), Shape::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.compatible(y))
            }
            _ => false,
        }
    }

    /// True when every array subshape carries a layout.
    pub fn has_layout(&self) -> bool {
        match self {
            Shape::Array(array) => array.layout.is_some(),
            Shape::Tuple(elements) => elements.iter().all(Shape::has_layout),
        }
    }

    pub fn clear_layout(&mut self) {
        let _ = self.for_each_array_mut(|array| {
            array.layout = None;
            Ok(())
        });
    }

    pub fn for_each_array_mut<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut ArrayShape) -> Result<()>,
    {
        fn walk<F>(shape: &mut Shape, f: &mut F) -> Result<()>
        where
            F: FnMut(&mut ArrayShape) -> Result<()>,
        {
            match shape {
                Shape::Array(array) => f(array),
                Shape::Tuple(elements) => {
                    for element in elements {
                        walk(element, f)?;
                    }
                    Ok(())
                }
            }
        }
        walk(self, &mut f)
    }

    /// Checks every explicit layout is a permutation of its array's dimensions.
    pub fn validate(&self) -> Result<()> {
        match self {
            Shape::Array(array) => match &array.layout {
                Some(layout) => layout.validate(array.rank()),
                None => Ok(()),
            },
            Shape::Tuple(elements) => elements.iter().try_for_each(Shape::validate),
        }
    }
}

fn collect_subshapes<'a>(
    shape: &'a Shape,
    index: &mut ShapeIndex,
    out: &mut Vec<(ShapeIndex, &'a Shape)>,
) {
    out.push((index.clone(), shape));
    if let Shape::Tuple(elements) = shape {
        for (i, element) in elements.iter().enumerate() {
            index.push(i);
            collect_subshapes(element, index, out);
            index.pop();
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array(array) => {
                write!(f, "{}[", array.element_type)?;
                for (i, dim) in array.dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{dim}")?;
                }
                write!(f, "]")?;
                if let Some(layout) = &array.layout {
                    if array.rank() > 0 {
                        write!(f, "{layout}")?;
                    }
                }
                Ok(())
            }
            Shape::Tuple(elements) => {
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

fn physical_strides(dims: &[usize], layout: &Layout) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1;
    for &dim in layout.minor_to_major() {
        strides[dim] = acc;
        acc *= dims[dim];
    }
    strides
}

/// Re-orders the element bytes of an array from one physical layout to another.
pub fn relayout(data: &[u8], array: &ArrayShape, from: &Layout, to: &Layout) -> Vec<u8> {
    if from == to || array.rank() < 2 {
        return data.to_vec();
    }
    let elem = array.element_type.byte_size();
    let src_strides = physical_strides(&array.dims, from);
    let dst_strides = physical_strides(&array.dims, to);
    let mut out = vec![0u8; data.len()];
    let mut index = vec![0usize; array.rank()];
    for _ in 0..array.element_count() {
        let src: usize = index.iter().zip(&src_strides).map(|(i, s)| i * s).sum();
        let dst: usize = index.iter().zip(&dst_strides).map(|(i, s)| i * s).sum();
        out[dst * elem..(dst + 1) * elem].copy_from_slice(&data[src * elem..(src + 1) * elem]);
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < array.dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> Shape {
        Shape::tuple(vec![
            Shape::scalar(PrimitiveType::F32),
            Shape::tuple(vec![
                Shape::array(PrimitiveType::S32, vec![2]),
                Shape::tuple(vec![]),
            ]),
            Shape::array(PrimitiveType::F64, vec![2, 3]),
        ])
    }

    #[test]
    fn subshapes_are_pre_order() {
        let shape = nested();
        let indices: Vec<ShapeIndex> = shape.subshapes().into_iter().map(|(i, _)| i).collect();
        assert_eq!(
            indices,
            vec![vec![], vec![0], vec![1], vec![1, 0], vec![1, 1], vec![2]]
        );
    }

    #[test]
    fn empty_tuples_are_not_leaves() {
        let leaves = nested().leaf_shapes();
        let indices: Vec<ShapeIndex> = leaves.iter().map(|l| l.index.clone()).collect();
        assert_eq!(indices, vec![vec![0], vec![1, 0], vec![2]]);
    }

    #[test]
    fn node_sizes() {
        let shape = nested();
        assert_eq!(shape.node_byte_size(), 24);
        assert_eq!(shape.subshape(&[2]).map(Shape::node_byte_size), Some(48));
        assert_eq!(shape.subshape(&[1, 1]).map(Shape::node_byte_size), Some(0));
        assert!(shape.subshape(&[3]).is_none());
    }

    #[test]
    fn display_matches_human_form() {
        let mut shape = nested();
        shape
            .for_each_array_mut(|a| {
                a.layout = Some(Layout::default_for_rank(a.rank()));
                Ok(())
            })
            .unwrap();
        assert_eq!(shape.to_string(), "(f32[], (s32[2]{0}, ()), f64[2,3]{1,0})");
        assert!(shape.has_layout());
        shape.clear_layout();
        assert!(!shape.has_layout());
    }

    #[test]
    fn bad_layout_rejected() {
        assert!(Shape::array_with_layout(PrimitiveType::F32, vec![2, 3], vec![0, 0]).is_err());
        assert!(Shape::array_with_layout(PrimitiveType::F32, vec![2, 3], vec![0]).is_err());
        assert!(Shape::array_with_layout(PrimitiveType::F32, vec![2, 3], vec![0, 1]).is_ok());
    }

    #[test]
    fn relayout_transposes_column_major() {
        let array = ArrayShape {
            element_type: PrimitiveType::U32,
            dims: vec![2, 3],
            layout: None,
        };
        let row_major: Vec<u32> = vec![1, 2, 3, 4, 5, 6];
        let bytes: &[u8] = bytemuck::cast_slice(&row_major);
        let col = relayout(
            bytes,
            &array,
            &Layout::default_for_rank(2),
            &Layout::new(vec![0, 1]),
        );
        let col_values: Vec<u32> = col
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(col_values, vec![1, 4, 2, 5, 3, 6]);
        let back = relayout(&col, &array, &Layout::new(vec![0, 1]), &Layout::default_for_rank(2));
        assert_eq!(back, bytes);
    }
}
