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

//! Host functions callable from programs through `CustomCall`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{LocalError, Result};
use crate::literal::Literal;

pub type CustomCallTarget =
    Arc<dyn Fn(&[Literal]) -> std::result::Result<Literal, String> + Send + Sync>;

#[derive(Default)]
pub struct CustomCallRegistry {
    targets: RwLock<HashMap<String, CustomCallTarget>>,
}

impl CustomCallRegistry {
    pub fn register(&self, name: &str, target: CustomCallTarget) -> Result<()> {
        if name.trim().is_empty() {
            return Err(LocalError::InvalidArgument(
                "custom call target name must not be empty".to_string(),
            ));
        }
        let mut targets = self.targets.write();
        if targets.contains_key(name) {
            return Err(LocalError::InvalidArgument(format!(
                "custom call target '{name}' is already registered"
            )));
        }
        targets.insert(name.to_string(), target);
        tracing::debug!(target_name = name, "registered custom call target");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<CustomCallTarget> {
        self.targets.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.read().contains_key(name)
    }
}
