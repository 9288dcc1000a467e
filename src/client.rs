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

//! The local client: one platform backend plus the threads that drive it.

use std::sync::Arc;

use crate::buffer::LocalBuffer;
use crate::compiler::ExecutableBuildOptions;
use crate::config::RuntimeConfig;
use crate::device::{Backend, BorrowedStream, DeviceMemoryAllocator};
use crate::error::{LocalError, Result};
use crate::executable::LocalExecutable;
use crate::ir::Computation;
use crate::literal::Literal;
use crate::shape::Shape;
use crate::worker::WorkerThread;

struct ClientInner {
    backend: Backend,
    config: RuntimeConfig,
    transfer_pool: rayon::ThreadPool,
    workers: Vec<WorkerThread>,
}

/// Handle to an opened platform. Cloning is cheap and shares the backend,
/// the transfer pool and the execution workers.
#[derive(Clone)]
pub struct LocalClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for LocalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalClient")
            .field("platform", &self.platform_name())
            .field("device_count", &self.device_count())
            .finish()
    }
}

impl LocalClient {
    /// Opens `platform_name` using [`RuntimeConfig::from_env`].
    pub fn open(platform_name: &str) -> Result<Self> {
        Self::open_with_config(platform_name, RuntimeConfig::from_env()?)
    }

    pub fn open_with_config(platform_name: &str, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let backend = Backend::new(platform_name, &config)?;
        let device_count = backend.device_count();

        let transfer_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(device_count)
            .thread_name(|i| format!("h2d-transfer-{i}"))
            .build()
            .map_err(|e| LocalError::Config(format!("failed to build transfer pool: {e}")))?;
        let workers = (0..device_count)
            .map(|ordinal| {
                WorkerThread::new(format!("execute-{}-{ordinal}", backend.platform_name()))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            platform = backend.platform_name(),
            device_count,
            "opened local client"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                backend,
                config,
                transfer_pool,
                workers,
            }),
        })
    }

    pub fn platform_name(&self) -> &str {
        self.inner.backend.platform_name()
    }

    pub fn device_count(&self) -> usize {
        self.inner.backend.device_count()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    pub fn memory_allocator(&self) -> &Arc<DeviceMemoryAllocator> {
        self.inner.backend.memory_allocator()
    }

    pub fn borrow_stream(&self, device_ordinal: usize) -> Result<BorrowedStream> {
        self.inner.backend.borrow_stream(device_ordinal)
    }

    /// The shared host-to-device transfer pool, one thread per device.
    pub fn transfer_pool(&self) -> &rayon::ThreadPool {
        &self.inner.transfer_pool
    }

    /// The persistent execution worker of `device_ordinal`.
    pub fn worker(&self, device_ordinal: usize) -> Result<&WorkerThread> {
        self.inner.workers.get(device_ordinal).ok_or_else(|| {
            LocalError::InvalidArgument(format!(
                "no execution worker for device {device_ordinal}; {} devices are visible",
                self.inner.workers.len()
            ))
        })
    }

    pub fn transfer_to_device(&self, literal: &Literal, device_ordinal: usize) -> Result<LocalBuffer> {
        LocalBuffer::from_literal(self, literal, device_ordinal)
    }

    pub fn transfer_to_device_batch(&self, items: &[(Literal, usize)]) -> Result<Vec<LocalBuffer>> {
        LocalBuffer::from_literals(self, items)
    }

    pub fn compile(
        &self,
        computation: &Computation,
        argument_shapes: &[Shape],
        options: &ExecutableBuildOptions,
    ) -> Result<LocalExecutable> {
        LocalExecutable::compile(self, computation, argument_shapes, options)
    }

    /// Queues `literal` for the next `Infeed` executed on `device_ordinal`.
    pub fn transfer_to_infeed(&self, literal: Literal, device_ordinal: usize) -> Result<()> {
        tracing::debug!(device_ordinal, shape = %literal.shape(), "transfer to infeed");
        self.inner
            .backend
            .services()
            .feeds
            .infeed(device_ordinal)?
            .push(literal);
        Ok(())
    }

    /// Blocks until `device_ordinal` produces an outfeed value and checks it
    /// against `shape`.
    pub fn transfer_from_outfeed(&self, shape: &Shape, device_ordinal: usize) -> Result<Literal> {
        let literal = self
            .inner
            .backend
            .services()
            .feeds
            .outfeed(device_ordinal)?
            .pop();
        if !literal.shape().compatible(shape) {
            return Err(LocalError::Shape(format!(
                "outfeed on device {device_ordinal} produced {} but {shape} was requested",
                literal.shape()
            )));
        }
        Ok(literal)
    }

    /// Makes `target` callable from programs as `CustomCall { target: name }`.
    pub fn register_custom_call_target<F>(&self, name: &str, target: F) -> Result<()>
    where
        F: Fn(&[Literal]) -> std::result::Result<Literal, String> + Send + Sync + 'static,
    {
        self.inner
            .backend
            .services()
            .custom_calls
            .register(name, Arc::new(target))
    }
}
