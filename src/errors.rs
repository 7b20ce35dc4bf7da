// Copyright 2025 Lablup Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Structured error kinds shared across the engine.

use thiserror::Error;

/// Connecting to a single endpoint failed.
#[derive(Debug, Error)]
#[error(r#"Connect("{user}@{host}"): {reason}"#)]
pub struct ErrConnect {
    pub user: String,
    pub host: String,
    pub reason: String,
}

/// Starting a task on an endpoint failed.
#[derive(Debug, Error)]
#[error(r#"Run("{command}"): {reason}"#)]
pub struct ErrTask {
    pub command: String,
    pub reason: String,
}

/// A remote command exited non-zero. The controller process adopts this
/// status as its own exit code, from the top of `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("remote command exited with status {status}")]
pub struct RemoteExit {
    pub status: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_format() {
        let err = ErrConnect {
            user: "deploy".to_string(),
            host: "api1.example.com:22".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            r#"Connect("deploy@api1.example.com:22"): connection refused"#
        );
    }

    #[test]
    fn test_task_error_format() {
        let err = ErrTask {
            command: "uptime".to_string(),
            reason: "session already running".to_string(),
        };
        assert_eq!(err.to_string(), r#"Run("uptime"): session already running"#);
    }

    #[test]
    fn test_remote_exit_is_downcastable_through_anyhow() {
        let err: anyhow::Error = anyhow::Error::new(RemoteExit { status: 7 });
        let err = err.context("running task failed");
        let found = err
            .chain()
            .find_map(|e| e.downcast_ref::<RemoteExit>())
            .copied();
        assert_eq!(found, Some(RemoteExit { status: 7 }));
    }
}
