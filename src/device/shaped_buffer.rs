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

//! Allocation records: which device memory range backs each subshape.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::device::memory::{DeviceMemoryAllocator, DeviceMemoryBase};
use crate::error::{LocalError, Result};
use crate::shape::{Shape, ShapeIndex};

/// One device memory range per subshape. `BTreeMap` ordering of shape
/// indices is exactly canonical pre-order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShapeTree {
    entries: BTreeMap<ShapeIndex, DeviceMemoryBase>,
}

impl ShapeTree {
    /// A tree with a null entry for every subshape of `shape`.
    pub fn for_shape(shape: &Shape) -> Self {
        Self {
            entries: shape
                .subshapes()
                .into_iter()
                .map(|(index, _)| (index, DeviceMemoryBase::null()))
                .collect(),
        }
    }

    pub fn element(&self, index: &[usize]) -> Option<DeviceMemoryBase> {
        self.entries.get(index).copied()
    }

    pub fn set(&mut self, index: &[usize], mem: DeviceMemoryBase) -> Result<()> {
        match self.entries.get_mut(index) {
            Some(slot) => {
                *slot = mem;
                Ok(())
            }
            None => Err(LocalError::Shape(format!("no subshape at index {index:?}"))),
        }
    }

    /// Returns the entry at `index` and nulls it in place.
    pub fn take(&mut self, index: &[usize]) -> Option<DeviceMemoryBase> {
        self.entries.get_mut(index).map(std::mem::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShapeIndex, &DeviceMemoryBase)> {
        self.entries.iter()
    }

    /// Copies the entries under `source_base` in `source` into this tree
    /// rooted at the empty index.
    pub fn copy_subtree_from(&mut self, source: &ShapeTree, source_base: &[usize]) -> Result<()> {
        for (index, mem) in source.entries.range(source_base.to_vec()..) {
            if !index.starts_with(source_base) {
                break;
            }
            self.set(&index[source_base.len()..], *mem)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for mem in self.entries.values_mut() {
            *mem = DeviceMemoryBase::null();
        }
    }
}

/// Non-owning view of a device-resident value.
#[derive(Debug, Clone)]
pub struct ShapedBuffer {
    on_host_shape: Shape,
    on_device_shape: Shape,
    device_ordinal: usize,
    buffers: ShapeTree,
}

impl ShapedBuffer {
    pub fn new(on_host_shape: Shape, on_device_shape: Shape, device_ordinal: usize) -> Self {
        let buffers = ShapeTree::for_shape(&on_device_shape);
        Self {
            on_host_shape,
            on_device_shape,
            device_ordinal,
            buffers,
        }
    }

    pub fn on_host_shape(&self) -> &Shape {
        &self.on_host_shape
    }

    pub fn on_device_shape(&self) -> &Shape {
        &self.on_device_shape
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn buffers(&self) -> &ShapeTree {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut ShapeTree {
        &mut self.buffers
    }

    pub fn buffer(&self, index: &[usize]) -> Option<DeviceMemoryBase> {
        self.buffers.element(index)
    }

    pub fn root_buffer(&self) -> DeviceMemoryBase {
        self.buffers.element(&[]).unwrap_or_default()
    }

    pub fn set_buffer(&mut self, mem: DeviceMemoryBase, index: &[usize]) -> Result<()> {
        self.buffers.set(index, mem)
    }

    /// View of the subtree rooted at `index`.
    pub fn sub_buffer(&self, index: &[usize]) -> Result<ShapedBuffer> {
        let host = self.on_host_shape.subshape(index);
        let device = self.on_device_shape.subshape(index);
        let (Some(host), Some(device)) = (host, device) else {
            return Err(LocalError::Shape(format!(
                "no subshape at index {index:?} of {}",
                self.on_device_shape
            )));
        };
        let mut view = ShapedBuffer::new(host.clone(), device.clone(), self.device_ordinal);
        view.buffers.copy_subtree_from(&self.buffers, index)?;
        Ok(view)
    }
}

/// A [`ShapedBuffer`] that owns its device memory and frees it on drop.
pub struct ScopedShapedBuffer {
    buffer: ShapedBuffer,
    allocator: Arc<DeviceMemoryAllocator>,
}

impl ScopedShapedBuffer {
    pub fn new(buffer: ShapedBuffer, allocator: Arc<DeviceMemoryAllocator>) -> Self {
        Self { buffer, allocator }
    }

    pub fn allocator(&self) -> &Arc<DeviceMemoryAllocator> {
        &self.allocator
    }

    pub fn buffers_mut(&mut self) -> &mut ShapeTree {
        &mut self.buffer.buffers
    }

    /// Gives up ownership of the device memory without freeing it.
    pub fn release(mut self) -> ShapedBuffer {
        let released = self.buffer.clone();
        self.buffer.buffers.clear();
        released
    }
}

impl Deref for ScopedShapedBuffer {
    type Target = ShapedBuffer;

    fn deref(&self) -> &ShapedBuffer {
        &self.buffer
    }
}

impl std::fmt::Debug for ScopedShapedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedShapedBuffer")
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl Drop for ScopedShapedBuffer {
    fn drop(&mut self) {
        let ordinal = self.buffer.device_ordinal;
        for (index, mem) in self.buffer.buffers.iter() {
            if mem.is_null() {
                continue;
            }
            if let Err(err) = self.allocator.deallocate(ordinal, *mem) {
                tracing::error!(device_ordinal = ordinal, ?index, error = %err, "failed to free device buffer");
            }
        }
    }
}
