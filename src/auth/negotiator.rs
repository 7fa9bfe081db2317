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

//! Connect-retry loop.
//!
//! ```text
//! Init -> Connecting -> Authenticated
//!             |  ^
//!             v  |
//!          AuthRetry          (prompt, cache, retry; bounded by auth_attempts)
//!             |
//!             v
//!           Fatal             (NetworkError)
//! ```
//!
//! Transient network failures loop back into `Connecting` up to
//! `connection_attempts` times before going `Fatal`.

use std::fmt;
use std::sync::Arc;

use super::password::{Password, PasswordCache};
use super::prompt::{request_password, Prompter};
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::host::HostSpec;
use crate::ssh::transport::{ConnectError, ConnectOptions, Connector, Credentials, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Init,
    Connecting,
    AuthRetry,
    Authenticated,
    Fatal,
}

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Retry the whole connect; `sleep` asks for a pause first.
    Transient { sleep: bool },
    /// Prompt for a (better) password and retry.
    Auth { passphrase: bool },
    Fatal,
}

/// Sorts a transport error into retry classes.
///
/// A generic protocol error with no password supplied counts as an auth
/// failure: servers report "no key, no password" that way.
pub fn classify(error: &ConnectError, password_given: bool) -> Failure {
    match error {
        ConnectError::Timeout { .. } | ConnectError::Banner { .. } => Failure::Transient { sleep: false },
        ConnectError::NameLookup { .. } | ConnectError::Socket { .. } => Failure::Transient { sleep: true },
        ConnectError::AuthRejected => Failure::Auth { passphrase: false },
        ConnectError::PassphraseRequired => Failure::Auth { passphrase: true },
        ConnectError::HostKeyMismatch { .. } | ConnectError::UnknownHostKey { .. } => Failure::Fatal,
        ConnectError::Protocol(msg) => {
            if password_given || msg.starts_with("Unknown server") || msg.contains("not a valid ") {
                Failure::Fatal
            } else {
                Failure::Auth { passphrase: false }
            }
        }
    }
}

/// Opens authenticated sessions, prompting and retrying as needed.
#[derive(Clone)]
pub struct AuthNegotiator {
    connector: Arc<dyn Connector>,
    prompter: Arc<dyn Prompter>,
    passwords: PasswordCache,
}

impl AuthNegotiator {
    pub fn new(
        connector: Arc<dyn Connector>,
        prompter: Arc<dyn Prompter>,
        passwords: PasswordCache,
    ) -> Self {
        Self {
            connector,
            prompter,
            passwords,
        }
    }

    pub fn passwords(&self) -> &PasswordCache {
        &self.passwords
    }

    pub fn prompter(&self) -> Arc<dyn Prompter> {
        self.prompter.clone()
    }

    /// Same transport and prompter, private copy of the password cache.
    pub fn isolated(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            prompter: self.prompter.clone(),
            passwords: self.passwords.snapshot(),
        }
    }

    async fn prompt(&self, text: String, host: String, abort_on_prompts: bool) -> Result<Password> {
        let prompter = self.prompter.clone();
        tokio::task::spawn_blocking(move || {
            request_password(prompter.as_ref(), &text, &host, abort_on_prompts)
        })
        .await
        .map_err(|e| Error::Task(anyhow::anyhow!("password prompt failed: {e}")))?
    }

    pub async fn connect(&self, host: &HostSpec, ctx: &ExecutionContext) -> Result<Arc<dyn Session>> {
        let key = host.key();
        let display = ctx.display_key(host);
        let options = ConnectOptions::from_context(ctx);
        let attempts = ctx.connection_attempts.max(1);

        let mut password = self.passwords.get(&key);
        let mut state = NegotiationState::Init;
        let mut tries = 0u32;
        let mut prompts = 0u32;

        loop {
            state = transition(&display, state, NegotiationState::Connecting);
            let credentials = Credentials::from_context(ctx, password.clone());
            let outcome = tokio::time::timeout(
                ctx.timeout,
                self.connector.connect(host, &credentials, &options),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ConnectError::Timeout {
                    host: host.host.clone(),
                })
            });

            let error = match outcome {
                Ok(session) => {
                    transition(&display, state, NegotiationState::Authenticated);
                    if let Some(password) = password.filter(|p| !p.is_empty()) {
                        self.passwords.set(&key, password);
                    }
                    return Ok(session);
                }
                Err(error) => error,
            };

            match classify(&error, credentials.has_password()) {
                Failure::Transient { sleep } => {
                    tries += 1;
                    if tries >= attempts {
                        transition(&display, state, NegotiationState::Fatal);
                        let plural = if attempts > 1 { "s" } else { "" };
                        let message = format!("{error} (tried {attempts} time{plural})");
                        return Err(Error::network_with_source(display, message, error));
                    }
                    tracing::warn!("{error} (attempt {tries} of {attempts})");
                    if sleep {
                        tokio::time::sleep(ctx.retry_delay()).await;
                    }
                }
                Failure::Auth { passphrase } => {
                    state = transition(&display, state, NegotiationState::AuthRetry);
                    if prompts >= ctx.auth_attempts {
                        transition(&display, state, NegotiationState::Fatal);
                        let message = format!(
                            "Authentication failed for {display} after {prompts} password attempt(s)"
                        );
                        return Err(Error::network_with_source(display, message, error));
                    }
                    prompts += 1;
                    let text = if passphrase {
                        format!("[{display}] Passphrase for private key: ")
                    } else {
                        format!("[{display}] Login password for '{}': ", host.user)
                    };
                    let entered = self
                        .prompt(text, display.clone(), ctx.abort_on_prompts)
                        .await?;
                    self.passwords.set(&key, entered.clone());
                    password = Some(entered);
                }
                Failure::Fatal => {
                    transition(&display, state, NegotiationState::Fatal);
                    let message = error.to_string();
                    return Err(Error::network_with_source(display, message, error));
                }
            }
        }
    }
}

fn transition(host: &str, from: NegotiationState, to: NegotiationState) -> NegotiationState {
    if from != to {
        tracing::debug!("[{host}] auth state {from:?} -> {to:?}");
    }
    to
}

impl fmt::Debug for AuthNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthNegotiator")
            .field("passwords", &self.passwords)
            .finish_non_exhaustive()
    }
}
