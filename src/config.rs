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

//! Runtime configuration, read from a TOML file.
//!
//! ```toml
//! deadlock_grace_ms = 10000
//! intra_op_threads = 0
//!
//! [platforms.cpu]
//! device_count = 2
//! memory_limit_bytes = 1073741824
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LocalError, Result};

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "MIND_LOCAL_CONFIG";
/// Environment variable overriding every platform's device count.
pub const DEVICE_COUNT_ENV: &str = "MIND_LOCAL_DEVICE_COUNT";

const DEFAULT_DEADLOCK_GRACE_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// How long a replicated launch waits for the surviving replicas after the
    /// first failure before aborting the process.
    #[serde(default = "default_deadlock_grace_ms")]
    pub deadlock_grace_ms: u64,
    /// Threads in the shared intra-op pool; 0 picks one per logical CPU.
    #[serde(default)]
    pub intra_op_threads: usize,
    #[serde(default = "default_platforms")]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_device_count")]
    pub device_count: usize,
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,
}

fn default_deadlock_grace_ms() -> u64 {
    DEFAULT_DEADLOCK_GRACE_MS
}

fn default_device_count() -> usize {
    1
}

fn default_platforms() -> BTreeMap<String, PlatformConfig> {
    let mut platforms = BTreeMap::new();
    platforms.insert("cpu".to_string(), PlatformConfig::with_devices(1));
    platforms.insert("interpreter".to_string(), PlatformConfig::with_devices(1));
    platforms
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            deadlock_grace_ms: DEFAULT_DEADLOCK_GRACE_MS,
            intra_op_threads: 0,
            platforms: default_platforms(),
        }
    }
}

impl PlatformConfig {
    pub fn with_devices(device_count: usize) -> Self {
        Self {
            device_count,
            memory_limit_bytes: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let src = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&src)
    }

    /// Loads the file named by `MIND_LOCAL_CONFIG` (defaults otherwise) and
    /// applies the `MIND_LOCAL_DEVICE_COUNT` override.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Ok(raw) = std::env::var(DEVICE_COUNT_ENV) {
            let count: usize = raw.trim().parse().map_err(|_| {
                LocalError::Config(format!("{DEVICE_COUNT_ENV} must be an integer, got '{raw}'"))
            })?;
            for platform in config.platforms.values_mut() {
                platform.device_count = count;
            }
        }
        Ok(config)
    }

    /// Builder-style helper used by tests and the CLI.
    pub fn with_platform(mut self, name: &str, device_count: usize) -> Self {
        self.platforms
            .entry(name.to_string())
            .or_insert_with(|| PlatformConfig::with_devices(device_count))
            .device_count = device_count;
        self
    }

    pub fn with_deadlock_grace(mut self, grace: Duration) -> Self {
        self.deadlock_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn deadlock_grace(&self) -> Duration {
        Duration::from_millis(self.deadlock_grace_ms)
    }

    /// Resolves a platform by name; `host` is an alias for `cpu`.
    pub fn platform(&self, name: &str) -> Option<&PlatformConfig> {
        let canonical = canonical_platform_name(name);
        self.platforms.get(canonical.as_str())
    }

    /// Rejects a zero grace period, empty platform names and zero memory limits.
    pub fn validate(&self) -> Result<()> {
        if self.deadlock_grace_ms == 0 {
            return Err(LocalError::Config(
                "deadlock_grace_ms must be positive".to_string(),
            ));
        }
        for (name, platform) in &self.platforms {
            if name.trim().is_empty() {
                return Err(LocalError::Config("platform names must not be empty".into()));
            }
            if platform.memory_limit_bytes == Some(0) {
                return Err(LocalError::Config(format!(
                    "platform {name}: memory_limit_bytes must be positive"
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn canonical_platform_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "host" => "cpu".to_string(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_single_device_platforms() {
        let config = RuntimeConfig::default();
        assert_eq!(config.platform("cpu").map(|p| p.device_count), Some(1));
        assert_eq!(config.platform("HOST").map(|p| p.device_count), Some(1));
        assert!(config.platform("tpu").is_none());
        assert_eq!(config.deadlock_grace(), Duration::from_secs(10));
    }

    #[test]
    fn parses_partial_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            deadlock_grace_ms = 250
            [platforms.cpu]
            device_count = 4
            memory_limit_bytes = 4096
            "#,
        )
        .expect("parse");
        assert_eq!(config.deadlock_grace_ms, 250);
        assert_eq!(config.intra_op_threads, 0);
        let cpu = config.platform("cpu").expect("cpu platform");
        assert_eq!(cpu.device_count, 4);
        assert_eq!(cpu.memory_limit_bytes, Some(4096));
        // An explicit platform table replaces the defaults.
        assert!(config.platform("interpreter").is_none());
    }

    #[test]
    fn rejects_zero_grace() {
        let err = RuntimeConfig::from_toml_str("deadlock_grace_ms = 0").unwrap_err();
        assert!(matches!(err, LocalError::Config(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = RuntimeConfig::from_toml_str("deadlock_grace_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, LocalError::Toml(_)));
    }

    #[test]
    fn with_platform_overrides_count() {
        let config = RuntimeConfig::default().with_platform("cpu", 3);
        assert_eq!(config.platform("cpu").map(|p| p.device_count), Some(3));
    }
}
