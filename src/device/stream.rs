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

//! In-order device streams and per-device stream pools.
//!
//! A stream runs its enqueued work on a dedicated thread, strictly in FIFO
//! order. Once a task fails the stream is poisoned: later tasks are skipped and
//! the first error is reported by [`Stream::block_host_until_done`].

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::{LocalError, Result};

type StreamTask = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Default)]
struct StreamState {
    pending: usize,
    error: Option<String>,
}

#[derive(Default)]
struct StreamShared {
    state: Mutex<StreamState>,
    idle: Condvar,
}

pub struct Stream {
    device_ordinal: usize,
    id: u64,
    shared: Arc<StreamShared>,
    sender: Option<Sender<StreamTask>>,
    thread: Option<JoinHandle<()>>,
}

impl Stream {
    pub fn new(device_ordinal: usize, id: u64) -> Result<Self> {
        let shared = Arc::new(StreamShared::default());
        let (sender, receiver) = channel::<StreamTask>();
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("stream-{device_ordinal}-{id}"))
            .spawn(move || {
                for task in receiver {
                    let poisoned = worker_shared.state.lock().error.is_some();
                    let outcome = if poisoned { Ok(()) } else { task() };
                    let mut state = worker_shared.state.lock();
                    if let Err(err) = outcome {
                        tracing::debug!(device_ordinal, stream = id, error = %err, "stream task failed");
                        state.error.get_or_insert_with(|| err.to_string());
                    }
                    state.pending -= 1;
                    if state.pending == 0 {
                        worker_shared.idle.notify_all();
                    }
                }
            })
            .map_err(|e| {
                LocalError::Transfer(format!(
                    "failed to start stream thread for device {device_ordinal}: {e}"
                ))
            })?;
        Ok(Self {
            device_ordinal,
            id,
            shared,
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues `task` behind all previously enqueued work and returns at once.
    pub fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or_else(|| {
            LocalError::Transfer(format!("stream {} is shut down", self.id))
        })?;
        self.shared.state.lock().pending += 1;
        if sender.send(Box::new(task)).is_err() {
            let mut state = self.shared.state.lock();
            state.pending -= 1;
            return Err(LocalError::Transfer(format!(
                "stream {} on device {} is no longer running",
                self.id, self.device_ordinal
            )));
        }
        Ok(())
    }

    /// Blocks until every enqueued task has run, then reports the first
    /// failure the stream has seen.
    pub fn block_host_until_done(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.idle.wait_while(&mut state, |s| s.pending > 0);
        match &state.error {
            Some(message) => Err(LocalError::Transfer(format!(
                "stream {} on device {}: {message}",
                self.id, self.device_ordinal
            ))),
            None => Ok(()),
        }
    }

    pub fn ok(&self) -> bool {
        self.shared.state.lock().error.is_none()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Idle streams of one device, created on demand.
pub struct StreamPool {
    device_ordinal: usize,
    idle: Mutex<Vec<Stream>>,
    next_id: AtomicU64,
}

impl StreamPool {
    pub fn new(device_ordinal: usize) -> Self {
        Self {
            device_ordinal,
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Hands out an idle stream, or a new one when none is idle. The stream
    /// goes back to the pool when the borrow is dropped.
    pub fn borrow_stream(self: &Arc<Self>) -> Result<BorrowedStream> {
        let reused = self.idle.lock().pop();
        let stream = match reused {
            Some(stream) => stream,
            None => Stream::new(
                self.device_ordinal,
                self.next_id.fetch_add(1, Ordering::Relaxed),
            )?,
        };
        Ok(BorrowedStream {
            stream: Some(stream),
            pool: Arc::clone(self),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

pub struct BorrowedStream {
    stream: Option<Stream>,
    pool: Arc<StreamPool>,
}

impl Deref for BorrowedStream {
    type Target = Stream;

    fn deref(&self) -> &Stream {
        match &self.stream {
            Some(stream) => stream,
            None => unreachable!("stream is only taken on drop"),
        }
    }
}

impl Drop for BorrowedStream {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if stream.ok() {
                self.pool.idle.lock().push(stream);
            } else {
                tracing::debug!(
                    device_ordinal = stream.device_ordinal(),
                    stream = stream.id(),
                    "discarding failed stream"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn tasks_run_in_order() {
        let stream = Stream::new(0, 0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream
                .enqueue(move || {
                    if i == 0 {
                        thread::sleep(Duration::from_millis(10));
                    }
                    log.lock().push(i);
                    Ok(())
                })
                .unwrap();
        }
        stream.block_host_until_done().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn failure_poisons_later_tasks() {
        let stream = Stream::new(0, 0).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        stream
            .enqueue(|| Err(LocalError::Transfer("boom".into())))
            .unwrap();
        let counter = Arc::clone(&ran);
        stream
            .enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        let err = stream.block_host_until_done().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!stream.ok());
    }

    #[test]
    fn pool_recycles_healthy_streams_only() {
        let pool = Arc::new(StreamPool::new(0));
        {
            let stream = pool.borrow_stream().unwrap();
            stream.block_host_until_done().unwrap();
        }
        assert_eq!(pool.idle_count(), 1);
        {
            let stream = pool.borrow_stream().unwrap();
            assert_eq!(pool.idle_count(), 0);
            stream
                .enqueue(|| Err(LocalError::Transfer("bad".into())))
                .unwrap();
            assert!(stream.block_host_until_done().is_err());
        }
        assert_eq!(pool.idle_count(), 0);
    }
}
