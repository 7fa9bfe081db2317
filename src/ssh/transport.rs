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

//! Transport seam between the engine and an SSH implementation.
//!
//! A [`Connector`] opens authenticated [`Session`]s. A session starts remote
//! processes, each exposed as a pair of channels: events flowing in from the
//! remote side and input flowing out to it. Keeping both directions as
//! channels lets the executor select over them without borrowing the
//! underlying SSH channel twice.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::Password;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::host::HostSpec;

/// Buffer size for the per-process event and input channels.
pub const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Why a connect attempt failed, as far as the transport can tell.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Name lookup failed for {host}")]
    NameLookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out trying to connect to {host}")]
    Timeout { host: String },

    #[error("Low level socket error connecting to host {host} on port {port}: {source}")]
    Socket {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Error reading SSH protocol banner from {host}: {reason}")]
    Banner { host: String, reason: String },

    #[error("Host key for {host} did not match pre-existing key! Server's key was changed recently, or possible man-in-the-middle attack.")]
    HostKeyMismatch { host: String },

    #[error("Server '{host}' not found in known_hosts")]
    UnknownHostKey { host: String },

    #[error("Authentication failed")]
    AuthRejected,

    #[error("Private key file is encrypted")]
    PassphraseRequired,

    /// Anything the transport could not classify more precisely.
    #[error("{0}")]
    Protocol(String),
}

/// What the negotiator hands to the transport for one attempt.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub password: Option<Password>,
    pub key_files: Vec<PathBuf>,
    pub use_agent: bool,
    pub look_for_keys: bool,
}

impl Credentials {
    pub fn from_context(ctx: &ExecutionContext, password: Option<Password>) -> Self {
        Self {
            password,
            key_files: ctx.key_filenames.clone(),
            use_agent: !ctx.no_agent,
            look_for_keys: !ctx.no_keys,
        }
    }

    pub fn has_password(&self) -> bool {
        self.password.as_ref().is_some_and(|p| !p.is_empty())
    }
}

/// Transport-level knobs taken from the execution context.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub keepalive: Option<Duration>,
    pub disable_known_hosts: bool,
    pub reject_unknown_hosts: bool,
}

impl ConnectOptions {
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        Self {
            timeout: ctx.timeout,
            keepalive: ctx.keepalive,
            disable_known_hosts: ctx.disable_known_hosts,
            reject_unknown_hosts: ctx.reject_unknown_hosts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessKind {
    Exec(String),
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub kind: ProcessKind,
    pub pty: Option<PtyRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelInput {
    Data(Vec<u8>),
    Eof,
}

/// A started remote process.
///
/// `events` closes once the remote side closes the channel. Dropping `input`
/// asks the transport to close the channel from our side.
pub struct RemoteProcess {
    pub events: mpsc::Receiver<ChannelEvent>,
    pub input: mpsc::Sender<ChannelInput>,
}

impl RemoteProcess {
    /// Creates the channel pairs: the process handle plus the transport's ends.
    pub fn pair() -> (
        Self,
        mpsc::Sender<ChannelEvent>,
        mpsc::Receiver<ChannelInput>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        (
            Self {
                events: event_rx,
                input: input_tx,
            },
            event_tx,
            input_rx,
        )
    }
}

impl fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProcess").finish_non_exhaustive()
    }
}

/// One authenticated connection to a host.
#[async_trait]
pub trait Session: Send + Sync {
    async fn start(&self, request: ChannelRequest) -> Result<RemoteProcess>;

    fn is_closed(&self) -> bool;

    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &HostSpec,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> std::result::Result<Arc<dyn Session>, ConnectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_follow_context_flags() {
        let ctx = ExecutionContext {
            no_agent: true,
            key_filenames: vec![PathBuf::from("/keys/id_ed25519")],
            ..Default::default()
        };
        let creds = Credentials::from_context(&ctx, Some(Password::new("")));
        assert!(!creds.use_agent);
        assert!(creds.look_for_keys);
        assert!(!creds.has_password());
        assert_eq!(creds.key_files.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_process_pair_is_wired() {
        let (mut process, event_tx, mut input_rx) = RemoteProcess::pair();
        event_tx.send(ChannelEvent::ExitStatus(3)).await.unwrap();
        drop(event_tx);
        assert_eq!(process.events.recv().await, Some(ChannelEvent::ExitStatus(3)));
        assert_eq!(process.events.recv().await, None);

        process.input.send(ChannelInput::Eof).await.unwrap();
        assert_eq!(input_rx.recv().await, Some(ChannelInput::Eof));
    }
}
