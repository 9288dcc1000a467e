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

//! Compiled executables and the replicated execution coordinator.
//!
//! A replicated launch hands one job per replica to that device's persistent
//! worker and waits on a monitor. The first failure starts a grace window;
//! replicas still running when it closes are assumed to be stuck in a
//! collective and the process is aborted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::buffer::LocalBuffer;
use crate::client::LocalClient;
use crate::compiler::{
    infer_program_shape, CompiledProgram, ExecutableBuildOptions, ExecutableRunOptions,
};
use crate::device::{DeviceAssignment, ScopedShapedBuffer, ShapedBuffer, TransferManager};
use crate::error::{LocalError, Result};
use crate::ir::Computation;
use crate::shape::{Layout, Shape};

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Fills in a layout for a shape that lacks one: the platform default first,
/// then the device's preferred compact layout.
fn assign_layout(transfer_manager: &TransferManager, shape: &Shape) -> Result<Shape> {
    if shape.has_layout() {
        shape.validate()?;
        return Ok(shape.clone());
    }
    let mut with_default = shape.clone();
    with_default.for_each_array_mut(|array| {
        if array.layout.is_none() {
            array.layout = Some(Layout::default_for_rank(array.rank()));
        }
        Ok(())
    })?;
    with_default.validate()?;
    transfer_manager.choose_compact_layout_for_shape(&with_default, 0)
}

struct MonitorState {
    running: usize,
    failed: usize,
    first_failure: Option<(usize, String)>,
    results: Vec<Option<Result<ScopedShapedBuffer>>>,
}

struct ReplicaMonitor {
    state: Mutex<MonitorState>,
    changed: Condvar,
}

impl ReplicaMonitor {
    fn new(replica_count: usize) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                running: replica_count,
                failed: 0,
                first_failure: None,
                results: (0..replica_count).map(|_| None).collect(),
            }),
            changed: Condvar::new(),
        }
    }

    fn complete(&self, replica: usize, result: Result<ScopedShapedBuffer>) {
        let mut state = self.state.lock();
        if let Err(err) = &result {
            tracing::error!(replica, error = %err, "replica failed");
            state.failed += 1;
            state
                .first_failure
                .get_or_insert_with(|| (replica, err.to_string()));
        }
        if let Some(slot) = state.results.get_mut(replica) {
            *slot = Some(result);
        }
        state.running -= 1;
        self.changed.notify_all();
    }
}

/// Reports a replica as failed if its job is dropped or unwinds before
/// producing a result.
struct CompletionGuard {
    monitor: Arc<ReplicaMonitor>,
    replica: usize,
    done: bool,
}

impl CompletionGuard {
    fn finish(mut self, result: Result<ScopedShapedBuffer>) {
        self.done = true;
        self.monitor.complete(self.replica, result);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.done {
            self.monitor.complete(
                self.replica,
                Err(LocalError::execution("replica job ended without a result")),
            );
        }
    }
}

/// A compiled program bound to its replica-to-device assignment.
pub struct LocalExecutable {
    program: Arc<CompiledProgram>,
    device_assignment: Arc<DeviceAssignment>,
    client: LocalClient,
}

impl LocalExecutable {
    pub fn compile(
        client: &LocalClient,
        computation: &Computation,
        argument_shapes: &[Shape],
        options: &ExecutableBuildOptions,
    ) -> Result<Self> {
        let _span = tracing::debug_span!(
            "LocalExecutable::compile",
            computation = %computation.name,
            replicas = options.num_replicas()
        )
        .entered();
        let backend = client.backend();
        let transfer_manager = backend.transfer_manager();

        let argument_layouts = argument_shapes
            .iter()
            .map(|shape| assign_layout(transfer_manager, shape))
            .collect::<Result<Vec<_>>>()?;
        let result_shape = match options.result_layout() {
            Some(shape) => shape.clone(),
            None => infer_program_shape(computation, &backend.services().custom_calls)?.result,
        };
        let result_layout = assign_layout(transfer_manager, &result_shape)?;

        let device_assignment = backend
            .computation_placer()
            .assign_devices(options.num_replicas(), 1)?;
        let program = backend.compiler().compile(
            computation,
            &argument_layouts,
            &result_layout,
            options.num_replicas(),
        )?;
        tracing::debug!(assignment = %device_assignment, "device assignment");

        Ok(Self {
            program: Arc::new(program),
            device_assignment: Arc::new(device_assignment),
            client: client.clone(),
        })
    }

    pub fn replica_count(&self) -> usize {
        self.device_assignment.replica_count()
    }

    /// Device ordinal of each replica, in replica order.
    pub fn device_ordinals(&self) -> Vec<usize> {
        self.device_assignment.replica_devices()
    }

    pub fn device_assignment(&self) -> &DeviceAssignment {
        &self.device_assignment
    }

    pub fn program(&self) -> &CompiledProgram {
        &self.program
    }

    fn run_options(&self, device_ordinal: usize, run_id: u64) -> ExecutableRunOptions {
        let backend = self.client.backend();
        ExecutableRunOptions {
            device_ordinal,
            allocator: Arc::clone(backend.memory_allocator()),
            intra_op_pool: Arc::clone(backend.intra_op_pool()),
            device_assignment: Arc::clone(&self.device_assignment),
            run_id,
        }
    }

    fn shaped_arguments(arguments: &[&LocalBuffer]) -> Result<Vec<ShapedBuffer>> {
        arguments
            .iter()
            .map(|buffer| buffer.shaped_buffer().cloned())
            .collect()
    }

    /// Runs a single-replica executable on the calling thread.
    pub fn execute(&self, arguments: &[&LocalBuffer]) -> Result<LocalBuffer> {
        if self.replica_count() != 1 {
            return Err(LocalError::Shape(format!(
                "execute requires a single replica; this executable has {} (use execute_replicated)",
                self.replica_count()
            )));
        }
        let device_ordinal = self.device_assignment[(0, 0)];
        let _span = tracing::debug_span!("LocalExecutable::execute", device_ordinal).entered();
        let args = Self::shaped_arguments(arguments)?;
        let refs: Vec<&ShapedBuffer> = args.iter().collect();
        let options = self.run_options(device_ordinal, NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed));
        let result = self.program.run(&refs, &options)?;
        Ok(LocalBuffer::new(result, self.client.clone()))
    }

    /// Runs every replica on its own device and returns one result per
    /// replica, in replica order.
    ///
    /// Fails if any replica fails. If a replica fails and the others do not
    /// all finish within the configured grace period, the process is aborted.
    pub fn execute_replicated(&self, per_replica_arguments: &[Vec<&LocalBuffer>]) -> Result<Vec<LocalBuffer>> {
        let replica_count = self.replica_count();
        if per_replica_arguments.len() != replica_count {
            return Err(LocalError::Shape(format!(
                "attempted to execute with {} argument lists when replica count is {replica_count}",
                per_replica_arguments.len()
            )));
        }
        if per_replica_arguments.len() > self.client.device_count() {
            return Err(LocalError::Shape(format!(
                "attempted to execute with {} replicas when device count is {}",
                per_replica_arguments.len(),
                self.client.device_count()
            )));
        }
        let _span = tracing::debug_span!("LocalExecutable::execute_replicated", replica_count).entered();
        let run_id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);

        if replica_count == 1 {
            let device_ordinal = self.device_assignment[(0, 0)];
            let args = Self::shaped_arguments(&per_replica_arguments[0])?;
            let refs: Vec<&ShapedBuffer> = args.iter().collect();
            let result = self
                .program
                .run(&refs, &self.run_options(device_ordinal, run_id))
                .map_err(|err| err.in_replica(0))?;
            return Ok(vec![LocalBuffer::new(result, self.client.clone())]);
        }

        let replica_args = per_replica_arguments
            .iter()
            .map(|arguments| Self::shaped_arguments(arguments))
            .collect::<Result<Vec<_>>>()?;

        let monitor = Arc::new(ReplicaMonitor::new(replica_count));
        for (replica, args) in replica_args.into_iter().enumerate() {
            let device_ordinal = self.device_assignment[(replica, 0)];
            let guard = CompletionGuard {
                monitor: Arc::clone(&monitor),
                replica,
                done: false,
            };
            let program = Arc::clone(&self.program);
            let options = self.run_options(device_ordinal, run_id);
            let scheduled = self.client.worker(device_ordinal).and_then(|worker| {
                worker.schedule(move || {
                    let refs: Vec<&ShapedBuffer> = args.iter().collect();
                    let result = program.run(&refs, &options);
                    guard.finish(result);
                })
            });
            // A job that could not be queued was dropped, and its guard has
            // already recorded a failure for this replica.
            if let Err(err) = scheduled {
                tracing::error!(replica, error = %err, "failed to schedule replica");
            }
        }

        self.wait_for_replicas(&monitor)
    }

    fn wait_for_replicas(&self, monitor: &ReplicaMonitor) -> Result<Vec<LocalBuffer>> {
        let grace = self.client.config().deadlock_grace();
        let mut state = monitor.state.lock();
        monitor
            .changed
            .wait_while(&mut state, |s| s.running > 0 && s.failed == 0);

        if state.running > 0 {
            monitor
                .changed
                .wait_while_for(&mut state, |s| s.running > 0, grace);
            if state.running > 0 {
                abort_on_deadlock(&state, grace);
            }
        }

        let results = std::mem::take(&mut state.results);
        drop(state);

        // Report the lowest failing replica; the other results are dropped.
        let mut buffers = Vec::with_capacity(results.len());
        for (replica, result) in results.into_iter().enumerate() {
            let buffer = result
                .unwrap_or_else(|| {
                    Err(LocalError::execution(format!("replica {replica} produced no result")))
                })
                .map_err(|err| err.in_replica(replica))?;
            buffers.push(LocalBuffer::new(buffer, self.client.clone()));
        }
        Ok(buffers)
    }
}

fn abort_on_deadlock(state: &MonitorState, grace: Duration) -> ! {
    let (replica, message) = state
        .first_failure
        .clone()
        .unwrap_or_else(|| (0, "unknown failure".to_string()));
    tracing::error!(
        replica,
        still_running = state.running,
        grace_ms = grace.as_millis() as u64,
        "Replicated computation launch failed, but not all replicas terminated. \
         Aborting process to work around deadlock. Failure message (there may have \
         been multiple failures, see the error log for all failures): {message}"
    );
    std::process::abort()
}
