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

//! russh-backed implementation of the transport traits.

use async_trait::async_trait;
use directories::BaseDirs;
use russh::client::{Handle, Handler};
use russh::ChannelMsg;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use super::known_hosts::{self, HostKeyPolicy, HostKeyStatus};
use super::transport::{
    ChannelEvent, ChannelInput, ChannelRequest, ConnectError, ConnectOptions, Connector,
    Credentials, ProcessKind, RemoteProcess, Session,
};
use crate::error::{Error, Result};
use crate::host::HostSpec;

/// Keys tried when `look_for_keys` is on, in order.
const DEFAULT_KEY_NAMES: &[&str] = &["id_ed25519", "id_rsa", "id_ecdsa"];

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error("host key changed")]
    HostKeyMismatch,
    #[error("host key unknown")]
    UnknownHostKey,
}

pub struct ClientHandler {
    hostname: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl Handler for ClientHandler {
    type Error = HandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::NoCheck {
            return Ok(true);
        }
        let status = known_hosts::lookup(&self.hostname, self.port, server_public_key);
        match known_hosts::verdict(self.policy, status) {
            Ok(()) => {
                if status == HostKeyStatus::Unknown {
                    tracing::debug!("Accepting unknown host key for {}", self.hostname);
                }
                Ok(true)
            }
            Err(HostKeyStatus::Changed) => Err(HandlerError::HostKeyMismatch),
            Err(_) => Err(HandlerError::UnknownHostKey),
        }
    }
}

fn classify_io(host: &HostSpec, error: io::Error) -> ConnectError {
    match error.kind() {
        io::ErrorKind::TimedOut => ConnectError::Timeout {
            host: host.host.clone(),
        },
        io::ErrorKind::UnexpectedEof => ConnectError::Banner {
            host: host.host.clone(),
            reason: error.to_string(),
        },
        _ => ConnectError::Socket {
            host: host.host.clone(),
            port: host.port,
            source: error,
        },
    }
}

fn classify_ssh(host: &HostSpec, error: russh::Error) -> ConnectError {
    match error {
        russh::Error::IO(e) => classify_io(host, e),
        russh::Error::ConnectionTimeout => ConnectError::Timeout {
            host: host.host.clone(),
        },
        russh::Error::Disconnect | russh::Error::HUP => ConnectError::Banner {
            host: host.host.clone(),
            reason: error.to_string(),
        },
        russh::Error::UnknownKey => ConnectError::UnknownHostKey {
            host: host.host.clone(),
        },
        other => ConnectError::Protocol(other.to_string()),
    }
}

fn classify_handler(host: &HostSpec, error: HandlerError) -> ConnectError {
    match error {
        HandlerError::Ssh(e) => classify_ssh(host, e),
        HandlerError::HostKeyMismatch => ConnectError::HostKeyMismatch {
            host: host.host.clone(),
        },
        HandlerError::UnknownHostKey => ConnectError::UnknownHostKey {
            host: host.host.clone(),
        },
    }
}

fn key_candidates(credentials: &Credentials) -> Vec<PathBuf> {
    let mut keys = credentials.key_files.clone();
    if credentials.look_for_keys {
        if let Some(dirs) = BaseDirs::new() {
            let ssh_dir = dirs.home_dir().join(".ssh");
            keys.extend(
                DEFAULT_KEY_NAMES
                    .iter()
                    .map(|name| ssh_dir.join(name))
                    .filter(|path| path.exists() && !credentials.key_files.contains(path)),
            );
        }
    }
    keys
}

/// Tries password, identity files, then agent keys.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    host: &HostSpec,
    credentials: &Credentials,
) -> std::result::Result<(), ConnectError> {
    let user = host.user.as_str();
    let mut attempted = false;
    let mut needs_passphrase = false;

    if let Some(password) = credentials.password.as_ref().filter(|p| !p.is_empty()) {
        attempted = true;
        let result = handle
            .authenticate_password(user, password.expose())
            .await
            .map_err(|e| classify_ssh(host, e))?;
        if result.success() {
            return Ok(());
        }
    }

    let passphrase = credentials.password.as_ref().map(|p| p.expose());
    for key_path in key_candidates(credentials) {
        let key = match russh::keys::load_secret_key(&key_path, passphrase) {
            Ok(key) => key,
            Err(russh::keys::Error::KeyIsEncrypted) => {
                tracing::debug!("Key {key_path:?} is encrypted and no passphrase was given");
                needs_passphrase = true;
                continue;
            }
            Err(e) => {
                tracing::debug!("Skipping key {key_path:?}: {e}");
                continue;
            }
        };
        attempted = true;
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| classify_ssh(host, e))?
            .flatten();
        let result = handle
            .authenticate_publickey(
                user,
                russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| classify_ssh(host, e))?;
        if result.success() {
            return Ok(());
        }
    }

    #[cfg(not(target_os = "windows"))]
    if credentials.use_agent {
        match russh::keys::agent::client::AgentClient::connect_env().await {
            Ok(mut agent) => {
                let identities = agent.request_identities().await.unwrap_or_default();
                for identity in identities {
                    attempted = true;
                    let hash_alg = handle
                        .best_supported_rsa_hash()
                        .await
                        .map_err(|e| classify_ssh(host, e))?
                        .flatten();
                    let result = handle
                        .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
                        .await;
                    if matches!(result, Ok(ref auth) if auth.success()) {
                        return Ok(());
                    }
                }
            }
            Err(e) => tracing::debug!("SSH agent unavailable: {e}"),
        }
    }

    if needs_passphrase {
        Err(ConnectError::PassphraseRequired)
    } else if !attempted {
        Err(ConnectError::Protocol(
            "No authentication methods available".to_string(),
        ))
    } else {
        Err(ConnectError::AuthRejected)
    }
}

/// Opens real SSH connections through russh.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        host: &HostSpec,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> std::result::Result<Arc<dyn Session>, ConnectError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.host.as_str(), host.port))
            .await
            .map_err(|source| ConnectError::NameLookup {
                host: host.host.clone(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectError::NameLookup {
                host: host.host.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            });
        }

        let config = Arc::new(russh::client::Config {
            keepalive_interval: options.keepalive,
            ..Default::default()
        });
        let policy = HostKeyPolicy::from_options(options);

        let mut last_error = None;
        let mut connected = None;
        for addr in addrs {
            let handler = ClientHandler {
                hostname: host.host.clone(),
                port: host.port,
                policy,
            };
            match russh::client::connect(config.clone(), addr, handler).await {
                Ok(handle) => {
                    connected = Some(handle);
                    break;
                }
                Err(e) => {
                    tracing::debug!("Connect to {addr} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        let mut handle = match (connected, last_error) {
            (Some(handle), _) => handle,
            (None, Some(e)) => return Err(classify_handler(host, e)),
            (None, None) => {
                return Err(ConnectError::Protocol(format!(
                    "could not connect to {}",
                    host.host
                )))
            }
        };

        authenticate(&mut handle, host, credentials).await?;
        tracing::debug!("Authenticated to {host}");

        Ok(Arc::new(RusshSession {
            label: host.key(),
            handle,
        }))
    }
}

struct RusshSession {
    label: String,
    handle: Handle<ClientHandler>,
}

fn channel_error(e: russh::Error) -> Error {
    Error::Channel(e.to_string())
}

#[async_trait]
impl Session for RusshSession {
    async fn start(&self, request: ChannelRequest) -> Result<RemoteProcess> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(channel_error)?;

        if let Some(pty) = &request.pty {
            channel
                .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
                .await
                .map_err(channel_error)?;
        }
        match &request.kind {
            ProcessKind::Exec(command) => channel.exec(true, command.as_str()).await,
            ProcessKind::Shell => channel.request_shell(true).await,
        }
        .map_err(channel_error)?;

        let (process, events, mut input) = RemoteProcess::pair();
        let label = self.label.clone();

        tokio::spawn(async move {
            let mut input_open = true;
            loop {
                tokio::select! {
                    msg = channel.wait() => {
                        let event = match msg {
                            Some(ChannelMsg::Data { ref data }) => ChannelEvent::Stdout(data.to_vec()),
                            Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                                ChannelEvent::Stderr(data.to_vec())
                            }
                            Some(ChannelMsg::ExitStatus { exit_status }) => ChannelEvent::ExitStatus(exit_status),
                            Some(ChannelMsg::Eof) => ChannelEvent::Eof,
                            Some(ChannelMsg::Close) | None => break,
                            Some(_) => continue,
                        };
                        if events.send(event).await.is_err() {
                            let _ = channel.close().await;
                            break;
                        }
                    }
                    input_msg = input.recv(), if input_open => {
                        match input_msg {
                            Some(ChannelInput::Data(bytes)) => {
                                if let Err(e) = channel.data(bytes.as_slice()).await {
                                    tracing::warn!("[{label}] failed to write to channel: {e}");
                                }
                            }
                            Some(ChannelInput::Eof) => {
                                let _ = channel.eof().await;
                            }
                            None => {
                                input_open = false;
                                let _ = channel.close().await;
                            }
                        }
                    }
                }
            }
            tracing::trace!("[{label}] channel closed");
        });

        Ok(process)
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
            .map_err(channel_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> HostSpec {
        HostSpec::new("deploy", "web1", 22)
    }

    #[test]
    fn test_io_errors_are_classified() {
        let timeout = classify_io(&spec(), io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(timeout, ConnectError::Timeout { .. }));

        let banner = classify_io(&spec(), io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(matches!(banner, ConnectError::Banner { .. }));

        let refused = classify_io(
            &spec(),
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(refused.to_string().contains("on port 22"));
    }

    #[test]
    fn test_handler_errors_are_classified() {
        let mismatch = classify_handler(&spec(), HandlerError::HostKeyMismatch);
        assert!(mismatch.to_string().contains("did not match"));
        let unknown = classify_handler(&spec(), HandlerError::UnknownHostKey);
        assert!(matches!(unknown, ConnectError::UnknownHostKey { .. }));
    }

    #[test]
    fn test_explicit_keys_come_first() {
        let credentials = Credentials {
            key_files: vec![PathBuf::from("/nonexistent/deploy_key")],
            look_for_keys: false,
            ..Default::default()
        };
        assert_eq!(
            key_candidates(&credentials),
            vec![PathBuf::from("/nonexistent/deploy_key")]
        );
    }
}
