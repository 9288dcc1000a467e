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

//! Cross-replica rendezvous.
//!
//! Every replica of one run that reaches the same collective instruction
//! deposits its operand and waits. The last arrival computes the reduction
//! and wakes the rest. There is no timeout: a replica that never arrives
//! stalls its peers forever.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::compiler::interp::elementwise_binary;
use crate::error::{LocalError, Result};
use crate::ir::BinOp;
use crate::literal::Literal;

/// Identifies one collective instance: the run id and the instruction's
/// value id.
pub type RendezvousKey = (u64, usize);

struct Rendezvous {
    contributions: Vec<Option<Literal>>,
    arrived: usize,
    departed: usize,
    outcome: Option<std::result::Result<Literal, String>>,
}

#[derive(Default)]
pub struct CollectiveHub {
    pending: Mutex<HashMap<RendezvousKey, Rendezvous>>,
    changed: Condvar,
}

impl CollectiveHub {
    pub fn cross_replica_sum(
        &self,
        key: RendezvousKey,
        replica: usize,
        replica_count: usize,
        value: Literal,
        pool: &rayon::ThreadPool,
    ) -> Result<Literal> {
        if replica_count <= 1 {
            return Ok(value);
        }
        let mut pending = self.pending.lock();
        let entry = pending.entry(key).or_insert_with(|| Rendezvous {
            contributions: vec![None; replica_count],
            arrived: 0,
            departed: 0,
            outcome: None,
        });
        let slot = entry
            .contributions
            .get_mut(replica)
            .filter(|slot| slot.is_none())
            .ok_or_else(|| {
                LocalError::execution(format!(
                    "replica {replica} joined collective {key:?} twice or out of range"
                ))
            })?;
        *slot = Some(value);
        entry.arrived += 1;
        tracing::trace!(?key, replica, arrived = entry.arrived, "collective arrival");
        if entry.arrived == replica_count {
            let values: Vec<Literal> = entry.contributions.iter_mut().filter_map(Option::take).collect();
            // Every contribution is in, so the entry is stable while unlocked.
            let outcome = MutexGuard::unlocked(&mut pending, || {
                sum_all(values, pool).map_err(|err| err.to_string())
            });
            if let Some(entry) = pending.get_mut(&key) {
                entry.outcome = Some(outcome);
            }
            self.changed.notify_all();
        }

        while pending.get(&key).map_or(false, |r| r.outcome.is_none()) {
            self.changed.wait(&mut pending);
        }
        let entry = pending.get_mut(&key).ok_or_else(|| {
            LocalError::execution(format!("collective {key:?} vanished before completion"))
        })?;
        entry.departed += 1;
        let outcome = entry.outcome.clone();
        if entry.departed == replica_count {
            pending.remove(&key);
        }
        match outcome {
            Some(Ok(sum)) => Ok(sum),
            Some(Err(message)) => Err(LocalError::execution(message)),
            None => Err(LocalError::execution(format!("collective {key:?} has no result"))),
        }
    }

    /// Collectives still waiting for arrivals or departures.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

fn sum_all(values: Vec<Literal>, pool: &rayon::ThreadPool) -> Result<Literal> {
    let mut iter = values.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| LocalError::execution("collective with no contributions"))?;
    let mut acc = first
        .as_array()
        .cloned()
        .ok_or_else(|| LocalError::execution("cross-replica sum of a tuple"))?;
    for value in iter {
        let array = value
            .as_array()
            .ok_or_else(|| LocalError::execution("cross-replica sum of a tuple"))?;
        if array.dims() != acc.dims() {
            return Err(LocalError::execution(format!(
                "replicas contributed mismatched dimensions {:?} and {:?}",
                acc.dims(),
                array.dims()
            )));
        }
        acc = elementwise_binary(pool, BinOp::Add, &acc, array)?;
    }
    Ok(Literal::Array(acc))
}
