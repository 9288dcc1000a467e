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

//! Per-device infeed and outfeed queues.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::error::{LocalError, Result};
use crate::literal::Literal;

/// Blocking FIFO of host literals.
#[derive(Default)]
pub struct FeedQueue {
    items: Mutex<VecDeque<Literal>>,
    ready: Condvar,
}

impl FeedQueue {
    pub fn push(&self, literal: Literal) {
        self.items.lock().push_back(literal);
        self.ready.notify_one();
    }

    /// Waits until a value is available.
    pub fn pop(&self) -> Literal {
        let mut items = self.items.lock();
        loop {
            if let Some(literal) = items.pop_front() {
                return literal;
            }
            self.ready.wait(&mut items);
        }
    }

    pub fn try_pop(&self) -> Option<Literal> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One infeed and one outfeed queue per device.
pub struct DeviceFeeds {
    infeed: Vec<FeedQueue>,
    outfeed: Vec<FeedQueue>,
}

impl DeviceFeeds {
    pub fn new(device_count: usize) -> Self {
        Self {
            infeed: (0..device_count).map(|_| FeedQueue::default()).collect(),
            outfeed: (0..device_count).map(|_| FeedQueue::default()).collect(),
        }
    }

    fn check(queues: &[FeedQueue], device_ordinal: usize) -> Result<&FeedQueue> {
        queues.get(device_ordinal).ok_or_else(|| {
            LocalError::InvalidArgument(format!(
                "no device with ordinal {device_ordinal}; {} devices are visible",
                queues.len()
            ))
        })
    }

    pub fn infeed(&self, device_ordinal: usize) -> Result<&FeedQueue> {
        Self::check(&self.infeed, device_ordinal)
    }

    pub fn outfeed(&self, device_ordinal: usize) -> Result<&FeedQueue> {
        Self::check(&self.outfeed, device_ordinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pop_waits_for_push() {
        let feeds = Arc::new(DeviceFeeds::new(1));
        let producer = Arc::clone(&feeds);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            producer.infeed(0).unwrap().push(Literal::scalar(5i32));
        });
        let value = feeds.infeed(0).unwrap().pop();
        handle.join().unwrap();
        assert_eq!(value.get_scalar::<i32>().unwrap(), 5);
        assert!(feeds.infeed(0).unwrap().is_empty());
    }

    #[test]
    fn bad_ordinal_is_rejected() {
        let feeds = DeviceFeeds::new(2);
        assert!(feeds.outfeed(1).is_ok());
        assert!(matches!(feeds.outfeed(2), Err(LocalError::InvalidArgument(_))));
    }
}
