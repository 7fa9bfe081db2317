// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

//! Error taxonomy shared by every layer of the engine.
//!
//! Non-zero exit codes are not errors: they live in
//! [`CommandResult::return_code`](crate::executor::CommandResult). The
//! orchestrator decides whether an error aborts the run by looking at
//! [`Error::is_network`] (governed by `skip_bad_hosts`) versus everything else
//! (governed by `warn_only`).

use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection-level failure: DNS, timeouts, auth exhaustion, host keys.
    #[error("{message}")]
    Network {
        host: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Timed out after {} seconds of silence while executing '{command}' on {host}", .timeout.as_secs_f64())]
    CommandTimeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    #[error("{which}() received nonzero return code {return_code} while executing!\n\nRequested: {command}\nExecuted: {real_command}")]
    CommandFailed {
        host: String,
        which: &'static str,
        command: String,
        real_command: String,
        return_code: i32,
    },

    /// Deliberate abort raised by a task or by a policy check.
    #[error("{0}")]
    Abort(String),

    /// A host failure that stopped the whole run.
    #[error("{host}: {source}")]
    Aborted {
        host: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Interrupted by user")]
    Interrupted,

    #[error("No hosts found. Please specify (single) host string for connection")]
    NoHosts,

    #[error("Trying to run a job queue that has not been closed")]
    QueueNotClosed,

    #[error("Worker for {host} panicked: {message}")]
    WorkerPanicked { host: String, message: String },

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Task(#[from] anyhow::Error),
}

impl Error {
    pub fn network(host: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Network {
            host: host.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn network_with_source<E>(host: impl Into<String>, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Network {
            host: host.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for connection-level failures, which `skip_bad_hosts` governs.
    pub fn is_network(&self) -> bool {
        match self {
            Error::Network { .. } => true,
            Error::Aborted { source, .. } => source.is_network(),
            _ => false,
        }
    }

    /// Host the error is attributed to, when known.
    pub fn host(&self) -> Option<&str> {
        match self {
            Error::Network { host, .. }
            | Error::CommandTimeout { host, .. }
            | Error::CommandFailed { host, .. }
            | Error::Aborted { host, .. }
            | Error::WorkerPanicked { host, .. } => Some(host),
            _ => None,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        match self {
            Error::Interrupted => true,
            Error::Aborted { source, .. } => source.is_interrupt(),
            _ => false,
        }
    }
}
