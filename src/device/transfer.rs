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

//! Host/device copies, device allocation of shaped values and layout choice.

use std::sync::Arc;

use crate::device::memory::DeviceMemoryAllocator;
use crate::device::shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};
use crate::device::stream::Stream;
use crate::error::{LocalError, Result};
use crate::literal::{ArrayLiteral, Literal};
use crate::shape::{relayout, Layout, Shape};

/// Per-device layout policy.
pub trait LayoutPreference: Send + Sync {
    /// The compact on-device form of `shape`: the same shape with a layout
    /// on every array subshape.
    fn preferred_layout(&self, shape: &Shape) -> Result<Shape>;
}

/// Row-major layout on every array.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowMajorLayout;

impl LayoutPreference for RowMajorLayout {
    fn preferred_layout(&self, shape: &Shape) -> Result<Shape> {
        let mut out = shape.clone();
        out.for_each_array_mut(|array| {
            array.layout = Some(Layout::default_for_rank(array.rank()));
            Ok(())
        })?;
        Ok(out)
    }
}

pub struct TransferManager {
    allocator: Arc<DeviceMemoryAllocator>,
    layouts: Vec<Arc<dyn LayoutPreference>>,
}

impl TransferManager {
    pub fn new(allocator: Arc<DeviceMemoryAllocator>) -> Self {
        let layouts = (0..allocator.device_count())
            .map(|_| Arc::new(RowMajorLayout) as Arc<dyn LayoutPreference>)
            .collect();
        Self { allocator, layouts }
    }

    pub fn allocator(&self) -> &Arc<DeviceMemoryAllocator> {
        &self.allocator
    }

    pub fn choose_compact_layout_for_shape(
        &self,
        shape: &Shape,
        device_ordinal: usize,
    ) -> Result<Shape> {
        let preference = self.layouts.get(device_ordinal).ok_or_else(|| {
            LocalError::InvalidArgument(format!("no device with ordinal {device_ordinal}"))
        })?;
        preference.preferred_layout(shape)
    }

    /// Host-emulated devices store values exactly as described by the host
    /// shape.
    pub fn host_shape_to_device_shape(&self, host_shape: &Shape) -> Shape {
        host_shape.clone()
    }

    pub fn allocate_scoped_shaped_buffer(
        &self,
        on_host_shape: &Shape,
        device_ordinal: usize,
    ) -> Result<ScopedShapedBuffer> {
        let device_shape = self.host_shape_to_device_shape(on_host_shape);
        allocate_shaped_buffer(&self.allocator, on_host_shape, &device_shape, device_ordinal)
    }

    /// Enqueues the writes of every tuple node's index table.
    pub fn write_tuple_index_tables_async(
        &self,
        stream: &Stream,
        buffer: &ShapedBuffer,
    ) -> Result<()> {
        for (index, table, mem) in tuple_index_tables(buffer)? {
            let allocator = Arc::clone(&self.allocator);
            let ordinal = buffer.device_ordinal();
            tracing::trace!(?index, bytes = table.len(), "enqueue tuple index table");
            stream.enqueue(move || allocator.write(ordinal, mem, &table))?;
        }
        Ok(())
    }

    /// Enqueues a copy of one row-major host array into the array-shaped
    /// `dest`, converting to the destination layout on the stream.
    pub fn transfer_array_to_device_async(
        &self,
        stream: &Stream,
        host_bytes: Arc<[u8]>,
        dest: &ShapedBuffer,
    ) -> Result<()> {
        let array = dest.on_device_shape().as_array().cloned().ok_or_else(|| {
            LocalError::Shape(format!(
                "array transfer into non-array shape {}",
                dest.on_device_shape()
            ))
        })?;
        if host_bytes.len() != array.byte_size() {
            return Err(LocalError::Shape(format!(
                "host data has {} bytes but {} needs {}",
                host_bytes.len(),
                dest.on_device_shape(),
                array.byte_size()
            )));
        }
        let mem = dest.root_buffer();
        let ordinal = dest.device_ordinal();
        let allocator = Arc::clone(&self.allocator);
        stream.enqueue(move || {
            let row_major = Layout::default_for_rank(array.rank());
            let device_bytes = relayout(&host_bytes, &array, &row_major, &array.layout_or_default());
            allocator.write(ordinal, mem, &device_bytes)
        })
    }

    /// Synchronous read of a whole device value back to the host.
    pub fn shaped_buffer_to_literal(&self, buffer: &ShapedBuffer) -> Result<Literal> {
        read_literal(&self.allocator, buffer)
    }
}

/// Allocates device memory for every subshape of `device_shape`. Partially
/// allocated buffers are freed if a later allocation fails.
pub(crate) fn allocate_shaped_buffer(
    allocator: &Arc<DeviceMemoryAllocator>,
    on_host_shape: &Shape,
    device_shape: &Shape,
    device_ordinal: usize,
) -> Result<ScopedShapedBuffer> {
    let buffer = ShapedBuffer::new(on_host_shape.clone(), device_shape.clone(), device_ordinal);
    let mut scoped = ScopedShapedBuffer::new(buffer, Arc::clone(allocator));
    for (index, subshape) in device_shape.subshapes() {
        let mem = allocator.allocate(device_ordinal, subshape.node_byte_size())?;
        scoped.buffers_mut().set(&index, mem)?;
    }
    Ok(scoped)
}

fn tuple_index_tables(
    buffer: &ShapedBuffer,
) -> Result<Vec<(Vec<usize>, Vec<u8>, crate::device::DeviceMemoryBase)>> {
    let mut tables = Vec::new();
    for (index, subshape) in buffer.on_device_shape().subshapes() {
        if !subshape.is_tuple() {
            continue;
        }
        let mut table = Vec::with_capacity(subshape.node_byte_size());
        for i in 0..subshape.tuple_element_count() {
            let mut child = index.clone();
            child.push(i);
            let mem = buffer.buffer(&child).unwrap_or_default();
            table.extend_from_slice(&mem.opaque().to_le_bytes());
        }
        let mem = buffer.buffer(&index).unwrap_or_default();
        tables.push((index, table, mem));
    }
    Ok(tables)
}

/// Synchronously writes `literal` into a freshly allocated `dest`: index
/// tables first, then each leaf in its device layout.
pub(crate) fn write_literal(
    allocator: &DeviceMemoryAllocator,
    literal: &Literal,
    dest: &ShapedBuffer,
) -> Result<()> {
    if !literal.shape().compatible(dest.on_device_shape()) {
        return Err(LocalError::Shape(format!(
            "cannot write a {} value into a {} buffer",
            literal.shape(),
            dest.on_device_shape()
        )));
    }
    let ordinal = dest.device_ordinal();
    for (_, table, mem) in tuple_index_tables(dest)? {
        allocator.write(ordinal, mem, &table)?;
    }
    for leaf in dest.on_device_shape().leaf_shapes() {
        let Some(array) = leaf.shape.as_array() else {
            continue;
        };
        let value = literal_at(literal, &leaf.index)?;
        let mem = dest.buffer(&leaf.index).unwrap_or_default();
        let row_major = Layout::default_for_rank(array.rank());
        let bytes = relayout(value.data(), array, &row_major, &array.layout_or_default());
        allocator.write(ordinal, mem, &bytes)?;
    }
    Ok(())
}

fn literal_at<'a>(literal: &'a Literal, index: &[usize]) -> Result<&'a ArrayLiteral> {
    let mut current = literal;
    for &i in index {
        current = current
            .tuple_elements()
            .get(i)
            .ok_or_else(|| LocalError::Shape(format!("literal has no element at {index:?}")))?;
    }
    current
        .as_array()
        .ok_or_else(|| LocalError::Shape(format!("literal element at {index:?} is a tuple")))
}

/// Reads every leaf of `buffer` and reassembles a row-major host literal.
pub(crate) fn read_literal(
    allocator: &DeviceMemoryAllocator,
    buffer: &ShapedBuffer,
) -> Result<Literal> {
    fn read(
        allocator: &DeviceMemoryAllocator,
        buffer: &ShapedBuffer,
        shape: &Shape,
        index: &mut Vec<usize>,
    ) -> Result<Literal> {
        match shape {
            Shape::Array(array) => {
                let mem = buffer.buffer(index).unwrap_or_default();
                if mem.is_null() {
                    return Err(LocalError::Transfer(format!(
                        "subshape {index:?} of {} has no device memory",
                        buffer.on_device_shape()
                    )));
                }
                let device_bytes = allocator.read(buffer.device_ordinal(), mem)?;
                let row_major = Layout::default_for_rank(array.rank());
                let host_bytes =
                    relayout(&device_bytes, array, &array.layout_or_default(), &row_major);
                Ok(Literal::Array(ArrayLiteral::new(
                    array.element_type,
                    array.dims.clone(),
                    host_bytes,
                )?))
            }
            Shape::Tuple(elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for (i, element) in elements.iter().enumerate() {
                    index.push(i);
                    out.push(read(allocator, buffer, element, index)?);
                    index.pop();
                }
                Ok(Literal::Tuple(out))
            }
        }
    }
    read(allocator, buffer, buffer.on_device_shape(), &mut Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_tree::to_buffer_tree;
    use crate::shape::PrimitiveType;

    fn manager() -> TransferManager {
        TransferManager::new(Arc::new(DeviceMemoryAllocator::new("cpu", 2, None)))
    }

    #[test]
    fn compact_layout_is_row_major() {
        let tm = manager();
        let shape = Shape::tuple(vec![Shape::array(PrimitiveType::F32, vec![2, 3])]);
        let chosen = tm.choose_compact_layout_for_shape(&shape, 1).unwrap();
        assert_eq!(chosen.to_string(), "(f32[2,3]{1,0})");
        assert!(tm.choose_compact_layout_for_shape(&shape, 2).is_err());
    }

    #[test]
    fn async_writes_land_after_stream_sync() {
        let tm = manager();
        let literal = Literal::tuple(vec![Literal::scalar(3i32), Literal::vector(&[1.0f64, 2.0])]);
        let tree = to_buffer_tree(&literal).unwrap();
        let shape = tm.choose_compact_layout_for_shape(&tree.shape, 0).unwrap();
        let buffer = tm.allocate_scoped_shaped_buffer(&shape, 0).unwrap();
        let stream = Stream::new(0, 0).unwrap();
        tm.write_tuple_index_tables_async(&stream, &buffer).unwrap();
        for (leaf, bytes) in shape.leaf_shapes().iter().zip(tree.leaves.iter()) {
            let view = buffer.sub_buffer(&leaf.index).unwrap();
            tm.transfer_array_to_device_async(&stream, Arc::clone(bytes), &view)
                .unwrap();
        }
        stream.block_host_until_done().unwrap();
        assert_eq!(tm.shaped_buffer_to_literal(&buffer).unwrap(), literal);

        let table = tm.allocator().read(0, buffer.root_buffer()).unwrap();
        let first = u64::from_le_bytes(table[..8].try_into().unwrap());
        assert_eq!(first, buffer.buffer(&[0]).unwrap().opaque());
    }

    #[test]
    fn write_then_read_with_column_major_layout() {
        let tm = manager();
        let shape = Shape::array_with_layout(PrimitiveType::S32, vec![2, 2], vec![0, 1]).unwrap();
        let buffer = tm.allocate_scoped_shaped_buffer(&shape, 0).unwrap();
        let literal = Literal::array(vec![2, 2], &[1i32, 2, 3, 4]).unwrap();
        write_literal(tm.allocator(), &literal, &buffer).unwrap();
        let raw = tm.allocator().read(0, buffer.root_buffer()).unwrap();
        let stored: Vec<i32> = raw.chunks_exact(4).map(bytemuck::pod_read_unaligned).collect();
        assert_eq!(stored, vec![1, 3, 2, 4]);
        assert_eq!(tm.shaped_buffer_to_literal(&buffer).unwrap(), literal);
    }

    #[test]
    fn failed_allocation_releases_partial_buffers() {
        let allocator = Arc::new(DeviceMemoryAllocator::new("cpu", 1, Some(16)));
        let tm = TransferManager::new(Arc::clone(&allocator));
        let shape = Shape::tuple(vec![
            Shape::array(PrimitiveType::F32, vec![2]),
            Shape::array(PrimitiveType::F32, vec![4]),
        ]);
        assert!(tm.allocate_scoped_shaped_buffer(&shape, 0).is_err());
        assert_eq!(allocator.live_allocations(0), 0);
    }
}
