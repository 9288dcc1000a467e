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

//! Error type shared by every layer of the local client.

/// Structured error returned by client, transfer, compilation and execution
/// entry points.
///
/// A replicated computation that stalls after a replica failure is not
/// represented here: the coordinator terminates the process instead.
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    /// No platform with this name is registered in the runtime configuration.
    #[error("no platform named '{0}' is registered")]
    NoSuchPlatform(String),
    /// The platform exists but exposes zero devices.
    #[error("platform {0} has no visible devices")]
    NoVisibleDevices(String),
    /// The runtime configuration is malformed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Shape or replica/device count mismatch.
    #[error("shape error: {0}")]
    Shape(String),
    /// The program or its argument shapes were rejected by the compiler.
    #[error("compilation failed: {0}")]
    Compilation(String),
    /// A host/device copy failed.
    #[error("transfer failed: {0}")]
    Transfer(String),
    /// A program failed while running, optionally attributed to a replica.
    #[error("execution failed: {message}")]
    Execution {
        replica: Option<usize>,
        message: String,
    },
    /// The caller passed an unusable handle, ordinal or name.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl LocalError {
    pub(crate) fn execution(message: impl Into<String>) -> Self {
        LocalError::Execution {
            replica: None,
            message: message.into(),
        }
    }

    /// Attributes an execution failure to `replica`, keeping the original
    /// message and noting that sibling replicas may have failed too.
    pub(crate) fn in_replica(self, replica: usize) -> Self {
        let message = match self {
            LocalError::Execution { message, .. } => message,
            other => other.to_string(),
        };
        LocalError::Execution {
            replica: Some(replica),
            message: format!(
                "{message}; while running replica {replica} of a replicated computation \
                 (other replicas may have failed as well)"
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, LocalError>;

#[cfg(test)]
mod tests {
    use super::LocalError;

    #[test]
    fn replica_annotation_keeps_message() {
        let err = LocalError::execution("division by zero").in_replica(1);
        match err {
            LocalError::Execution { replica, message } => {
                assert_eq!(replica, Some(1));
                assert!(message.starts_with("division by zero"));
                assert!(message.contains("replica 1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn non_execution_errors_are_rewrapped() {
        let err = LocalError::Transfer("out of memory".into()).in_replica(0);
        assert!(matches!(err, LocalError::Execution { replica: Some(0), .. }));
        assert!(err.to_string().contains("out of memory"));
    }
}
