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

//! Replica to device placement.

use std::fmt;
use std::ops::Index;

use crate::error::{LocalError, Result};

/// Device ordinal for each (replica, computation) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAssignment {
    replica_count: usize,
    computation_count: usize,
    devices: Vec<usize>,
}

impl DeviceAssignment {
    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn computation_count(&self) -> usize {
        self.computation_count
    }

    /// Device ordinals of computation 0, indexed by replica.
    pub fn replica_devices(&self) -> Vec<usize> {
        (0..self.replica_count).map(|r| self[(r, 0)]).collect()
    }

    pub fn replica_for_device(&self, device_ordinal: usize) -> Option<usize> {
        (0..self.replica_count).find(|&r| {
            (0..self.computation_count).any(|c| self[(r, c)] == device_ordinal)
        })
    }
}

impl Index<(usize, usize)> for DeviceAssignment {
    type Output = usize;

    fn index(&self, (replica, computation): (usize, usize)) -> &usize {
        &self.devices[replica * self.computation_count + computation]
    }
}

impl fmt::Display for DeviceAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for r in 0..self.replica_count {
            if r > 0 {
                write!(f, "; ")?;
            }
            for c in 0..self.computation_count {
                if c > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", self[(r, c)])?;
            }
        }
        write!(f, "]")
    }
}

/// Assigns computations to devices for one platform.
#[derive(Debug, Clone)]
pub struct ComputationPlacer {
    device_count: usize,
}

impl ComputationPlacer {
    pub fn new(device_count: usize) -> Self {
        Self { device_count }
    }

    /// Replica `r` of computation `c` runs on device `c * replica_count + r`.
    pub fn device_id(&self, replica: usize, computation: usize, replica_count: usize) -> usize {
        computation * replica_count + replica
    }

    pub fn assign_devices(
        &self,
        replica_count: usize,
        computation_count: usize,
    ) -> Result<DeviceAssignment> {
        if replica_count == 0 || computation_count == 0 {
            return Err(LocalError::Shape(format!(
                "cannot place {replica_count} replicas of {computation_count} computations"
            )));
        }
        let needed = replica_count * computation_count;
        if needed > self.device_count {
            return Err(LocalError::Shape(format!(
                "requested {replica_count} replicas of {computation_count} computations, \
                 but only {} devices are available",
                self.device_count
            )));
        }
        let mut devices = Vec::with_capacity(needed);
        for r in 0..replica_count {
            for c in 0..computation_count {
                devices.push(self.device_id(r, c, replica_count));
            }
        }
        Ok(DeviceAssignment {
            replica_count,
            computation_count,
            devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicas_take_consecutive_devices() {
        let placer = ComputationPlacer::new(4);
        let assignment = placer.assign_devices(3, 1).unwrap();
        assert_eq!(assignment.replica_devices(), vec![0, 1, 2]);
        assert_eq!(assignment.replica_for_device(2), Some(2));
        assert_eq!(assignment.replica_for_device(3), None);
        assert_eq!(assignment.to_string(), "[0; 1; 2]");
    }

    #[test]
    fn too_many_replicas_is_a_shape_error() {
        let placer = ComputationPlacer::new(2);
        assert!(matches!(placer.assign_devices(3, 1), Err(LocalError::Shape(_))));
        assert!(matches!(placer.assign_devices(0, 1), Err(LocalError::Shape(_))));
    }

    #[test]
    fn multiple_computations_are_strided_by_replica_count() {
        let assignment = ComputationPlacer::new(4).assign_devices(2, 2).unwrap();
        assert_eq!(assignment[(0, 1)], 2);
        assert_eq!(assignment[(1, 1)], 3);
    }
}
