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

//! Platform lookup and the per-platform backend bundle.

use std::sync::Arc;

use crate::compiler::{Compiler, ExecutionServices};
use crate::config::{canonical_platform_name, PlatformConfig, RuntimeConfig};
use crate::device::memory::DeviceMemoryAllocator;
use crate::device::placer::ComputationPlacer;
use crate::device::stream::{BorrowedStream, StreamPool};
use crate::device::transfer::TransferManager;
use crate::error::{LocalError, Result};

/// Resolves `name` against the configured platforms.
pub fn lookup_platform<'c>(config: &'c RuntimeConfig, name: &str) -> Result<&'c PlatformConfig> {
    let platform = config
        .platform(name)
        .ok_or_else(|| LocalError::NoSuchPlatform(name.to_string()))?;
    if platform.device_count == 0 {
        return Err(LocalError::NoVisibleDevices(canonical_platform_name(name)));
    }
    Ok(platform)
}

/// Device services of one platform: memory, streams, transfers, placement,
/// compilation and the shared intra-op pool.
pub struct Backend {
    platform: String,
    allocator: Arc<DeviceMemoryAllocator>,
    transfer_manager: TransferManager,
    stream_pools: Vec<Arc<StreamPool>>,
    intra_op_pool: Arc<rayon::ThreadPool>,
    placer: ComputationPlacer,
    compiler: Compiler,
    services: Arc<ExecutionServices>,
}

impl Backend {
    pub fn new(name: &str, config: &RuntimeConfig) -> Result<Self> {
        let platform_config = lookup_platform(config, name)?;
        let platform = canonical_platform_name(name);
        let device_count = platform_config.device_count;

        let allocator = Arc::new(DeviceMemoryAllocator::new(
            &platform,
            device_count,
            platform_config.memory_limit_bytes,
        ));
        let intra_op_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.intra_op_threads)
            .thread_name(|i| format!("intra-op-{i}"))
            .build()
            .map_err(|e| LocalError::Config(format!("failed to build intra-op pool: {e}")))?;
        let services = Arc::new(ExecutionServices::new(device_count));

        tracing::debug!(platform = %platform, device_count, "created backend");
        Ok(Self {
            transfer_manager: TransferManager::new(Arc::clone(&allocator)),
            stream_pools: (0..device_count)
                .map(|ordinal| Arc::new(StreamPool::new(ordinal)))
                .collect(),
            intra_op_pool: Arc::new(intra_op_pool),
            placer: ComputationPlacer::new(device_count),
            compiler: Compiler::new(Arc::clone(&services)),
            platform,
            allocator,
            services,
        })
    }

    pub fn platform_name(&self) -> &str {
        &self.platform
    }

    pub fn device_count(&self) -> usize {
        self.stream_pools.len()
    }

    pub fn memory_allocator(&self) -> &Arc<DeviceMemoryAllocator> {
        &self.allocator
    }

    pub fn transfer_manager(&self) -> &TransferManager {
        &self.transfer_manager
    }

    pub fn stream_pool(&self, device_ordinal: usize) -> Result<&Arc<StreamPool>> {
        self.stream_pools.get(device_ordinal).ok_or_else(|| {
            LocalError::InvalidArgument(format!(
                "device ordinal {device_ordinal} out of range; {} has {} devices",
                self.platform,
                self.stream_pools.len()
            ))
        })
    }

    pub fn borrow_stream(&self, device_ordinal: usize) -> Result<BorrowedStream> {
        self.stream_pool(device_ordinal)?.borrow_stream()
    }

    pub fn intra_op_pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.intra_op_pool
    }

    pub fn computation_placer(&self) -> &ComputationPlacer {
        &self.placer
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn services(&self) -> &Arc<ExecutionServices> {
        &self.services
    }
}
