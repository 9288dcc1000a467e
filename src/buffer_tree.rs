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

//! Canonical decomposition of host values into a shape plus leaf byte regions.

use std::sync::Arc;

use crate::error::{LocalError, Result};
use crate::literal::{ArrayLiteral, Literal};
use crate::shape::Shape;

/// A host value flattened for transfer: its shape and one row-major byte
/// region per leaf subshape, in canonical pre-order.
#[derive(Debug, Clone)]
pub struct BufferTree {
    pub shape: Shape,
    pub leaves: Vec<Arc<[u8]>>,
}

impl BufferTree {
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Reassembles the host value.
    pub fn into_literal(self) -> Result<Literal> {
        let mut leaves = self.leaves.into_iter();
        let literal = rebuild(&self.shape, &mut leaves)?;
        if leaves.next().is_some() {
            return Err(LocalError::Shape(format!(
                "buffer tree for {} has more leaves than leaf subshapes",
                self.shape
            )));
        }
        Ok(literal)
    }
}

fn rebuild(shape: &Shape, leaves: &mut impl Iterator<Item = Arc<[u8]>>) -> Result<Literal> {
    match shape {
        Shape::Array(array) => {
            let bytes = leaves.next().ok_or_else(|| {
                LocalError::Shape(format!("missing leaf for subshape {shape}"))
            })?;
            Ok(Literal::Array(ArrayLiteral::new(
                array.element_type,
                array.dims.clone(),
                bytes.to_vec(),
            )?))
        }
        Shape::Tuple(elements) => Ok(Literal::Tuple(
            elements
                .iter()
                .map(|element| rebuild(element, leaves))
                .collect::<Result<_>>()?,
        )),
    }
}

fn flatten(literal: &Literal, leaves: &mut Vec<Arc<[u8]>>) {
    match literal {
        Literal::Array(array) => leaves.push(Arc::from(array.data())),
        Literal::Tuple(elements) => {
            for element in elements {
                flatten(element, leaves);
            }
        }
    }
}

/// Builds the buffer tree of a host value.
pub fn to_buffer_tree(literal: &Literal) -> Result<BufferTree> {
    let shape = literal.shape();
    shape.validate()?;
    let mut leaves = Vec::with_capacity(shape.leaf_shapes().len());
    flatten(literal, &mut leaves);
    Ok(BufferTree { shape, leaves })
}
