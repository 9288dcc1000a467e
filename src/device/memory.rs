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

//! Device memory for host-emulated devices.
//!
//! Each device ordinal owns a heap of opaque allocations. Addresses are unique
//! across all devices of one allocator and `0` is reserved for the null range.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{LocalError, Result};

/// A range of device memory. Copyable and non-owning; ownership lives in
/// [`ScopedShapedBuffer`](crate::device::ScopedShapedBuffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceMemoryBase {
    opaque: u64,
    size: usize,
}

impl DeviceMemoryBase {
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.opaque == 0
    }

    pub fn opaque(&self) -> u64 {
        self.opaque
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

type Block = Arc<RwLock<Vec<u8>>>;

#[derive(Default)]
struct HeapState {
    blocks: HashMap<u64, Block>,
    bytes_in_use: usize,
}

struct DeviceHeap {
    limit: Option<usize>,
    state: Mutex<HeapState>,
}

pub struct DeviceMemoryAllocator {
    platform: String,
    heaps: Vec<DeviceHeap>,
    next_opaque: AtomicU64,
}

impl std::fmt::Debug for DeviceMemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemoryAllocator")
            .field("platform", &self.platform)
            .field("devices", &self.heaps.len())
            .finish()
    }
}

impl DeviceMemoryAllocator {
    pub fn new(platform: &str, device_count: usize, limit_bytes: Option<usize>) -> Self {
        let heaps = (0..device_count)
            .map(|_| DeviceHeap {
                limit: limit_bytes,
                state: Mutex::new(HeapState::default()),
            })
            .collect();
        Self {
            platform: platform.to_string(),
            heaps,
            next_opaque: AtomicU64::new(1),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn device_count(&self) -> usize {
        self.heaps.len()
    }

    fn heap(&self, ordinal: usize) -> Result<&DeviceHeap> {
        self.heaps.get(ordinal).ok_or_else(|| {
            LocalError::InvalidArgument(format!(
                "device ordinal {ordinal} out of range; platform {} has {} devices",
                self.platform,
                self.heaps.len()
            ))
        })
    }

    fn block(&self, ordinal: usize, mem: DeviceMemoryBase) -> Result<Block> {
        let heap = self.heap(ordinal)?;
        let state = heap.state.lock();
        state.blocks.get(&mem.opaque).cloned().ok_or_else(|| {
            LocalError::Transfer(format!(
                "device {ordinal}: address {:#x} is not a live allocation",
                mem.opaque
            ))
        })
    }

    pub fn allocate(&self, ordinal: usize, size: usize) -> Result<DeviceMemoryBase> {
        let heap = self.heap(ordinal)?;
        let mut state = heap.state.lock();
        if let Some(limit) = heap.limit {
            if state.bytes_in_use + size > limit {
                return Err(LocalError::Transfer(format!(
                    "resource exhausted on device {ordinal}: cannot allocate {size} bytes \
                     ({} of {limit} in use)",
                    state.bytes_in_use
                )));
            }
        }
        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        state
            .blocks
            .insert(opaque, Arc::new(RwLock::new(vec![0; size])));
        state.bytes_in_use += size;
        Ok(DeviceMemoryBase { opaque, size })
    }

    /// Frees one allocation. Freeing an address that is not live is an error,
    /// which makes double frees observable.
    pub fn deallocate(&self, ordinal: usize, mem: DeviceMemoryBase) -> Result<()> {
        if mem.is_null() {
            return Ok(());
        }
        let heap = self.heap(ordinal)?;
        let mut state = heap.state.lock();
        match state.blocks.remove(&mem.opaque) {
            Some(_) => {
                state.bytes_in_use -= mem.size;
                Ok(())
            }
            None => Err(LocalError::InvalidArgument(format!(
                "device {ordinal}: double free of address {:#x}",
                mem.opaque
            ))),
        }
    }

    /// Overwrites the whole allocation with `bytes`.
    pub fn write(&self, ordinal: usize, mem: DeviceMemoryBase, bytes: &[u8]) -> Result<()> {
        let block = self.block(ordinal, mem)?;
        let mut data = block.write();
        if data.len() != bytes.len() {
            return Err(LocalError::Transfer(format!(
                "device {ordinal}: writing {} bytes into a {}-byte allocation",
                bytes.len(),
                data.len()
            )));
        }
        data.copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, ordinal: usize, mem: DeviceMemoryBase) -> Result<Vec<u8>> {
        let block = self.block(ordinal, mem)?;
        let data = block.read();
        Ok(data.clone())
    }

    pub fn live_allocations(&self, ordinal: usize) -> usize {
        self.heaps
            .get(ordinal)
            .map_or(0, |heap| heap.state.lock().blocks.len())
    }

    pub fn bytes_in_use(&self, ordinal: usize) -> usize {
        self.heaps
            .get(ordinal)
            .map_or(0, |heap| heap.state.lock().bytes_in_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_write_read_free() {
        let allocator = DeviceMemoryAllocator::new("cpu", 2, None);
        let mem = allocator.allocate(1, 4).unwrap();
        assert!(!mem.is_null());
        allocator.write(1, mem, &[1, 2, 3, 4]).unwrap();
        assert_eq!(allocator.read(1, mem).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(allocator.live_allocations(1), 1);
        assert_eq!(allocator.bytes_in_use(1), 4);
        // Wrong device.
        assert!(allocator.read(0, mem).is_err());
        allocator.deallocate(1, mem).unwrap();
        assert_eq!(allocator.live_allocations(1), 0);
        assert!(matches!(
            allocator.deallocate(1, mem),
            Err(LocalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn addresses_are_unique_across_devices() {
        let allocator = DeviceMemoryAllocator::new("cpu", 2, None);
        let a = allocator.allocate(0, 0).unwrap();
        let b = allocator.allocate(1, 0).unwrap();
        assert_ne!(a.opaque(), b.opaque());
    }

    #[test]
    fn limit_is_enforced() {
        let allocator = DeviceMemoryAllocator::new("cpu", 1, Some(8));
        let a = allocator.allocate(0, 6).unwrap();
        assert!(matches!(allocator.allocate(0, 4), Err(LocalError::Transfer(_))));
        allocator.deallocate(0, a).unwrap();
        assert!(allocator.allocate(0, 8).is_ok());
    }

    #[test]
    fn size_mismatch_on_write() {
        let allocator = DeviceMemoryAllocator::new("cpu", 1, None);
        let mem = allocator.allocate(0, 2).unwrap();
        assert!(allocator.write(0, mem, &[1, 2, 3]).is_err());
    }

    #[test]
    fn bad_ordinal() {
        let allocator = DeviceMemoryAllocator::new("cpu", 1, None);
        assert!(matches!(
            allocator.allocate(3, 1),
            Err(LocalError::InvalidArgument(_))
        ));
    }
}
