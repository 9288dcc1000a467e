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

//! Long-lived execution threads, one per device.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::thread::{self, JoinHandle};

use crate::error::{LocalError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A dedicated thread that runs scheduled jobs one at a time, in order.
pub struct WorkerThread {
    name: String,
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = channel::<Job>();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in receiver {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!(worker = %thread_name, "job panicked");
                    }
                }
            })
            .map_err(|e| LocalError::Config(format!("failed to spawn worker {name}: {e}")))?;
        Ok(Self {
            name,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or_else(|| {
            LocalError::execution(format!("worker {} is shut down", self.name))
        })?;
        sender
            .send(Box::new(job))
            .map_err(|_| LocalError::execution(format!("worker {} has exited", self.name)))
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn jobs_run_in_order_on_one_thread() {
        let worker = WorkerThread::new("test-worker").unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            worker
                .schedule(move || {
                    let name = thread::current().name().map(str::to_string);
                    tx.send((i, name)).unwrap();
                })
                .unwrap();
        }
        let seen: Vec<_> = (0..4).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(seen.iter().all(|(_, n)| n.as_deref() == Some("test-worker")));
    }

    #[test]
    fn survives_a_panicking_job() {
        let worker = WorkerThread::new("panicky").unwrap();
        worker.schedule(|| panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        worker.schedule(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv().unwrap(), 7);
    }
}
