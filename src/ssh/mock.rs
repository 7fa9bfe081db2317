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

//! Scripted in-memory transport.
//!
//! Every remote process runs a [`Script`] chosen by a responder closure from
//! the command line it was started with. Hosts can be made unreachable,
//! flaky, or password-protected. Connect and command counts are recorded so
//! tests can assert on reuse.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::transport::{
    ChannelEvent, ChannelInput, ChannelRequest, ConnectError, ConnectOptions, Connector,
    Credentials, ProcessKind, RemoteProcess, Session,
};
use crate::error::{Error, Result};
use crate::host::HostSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Wait until the given bytes have been written to the process.
    Expect(Vec<u8>),
    Sleep(Duration),
    /// Never produce anything again.
    Hang,
    Exit(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    steps: Vec<Step>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, data: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::Stdout(data.as_ref().to_vec()));
        self
    }

    pub fn stderr(mut self, data: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::Stderr(data.as_ref().to_vec()));
        self
    }

    pub fn expect(mut self, data: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::Expect(data.as_ref().to_vec()));
        self
    }

    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Sleep(duration));
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }

    pub fn exit(mut self, code: u32) -> Self {
        self.steps.push(Step::Exit(code));
        self
    }
}

pub type Responder = Arc<dyn Fn(&str) -> Script + Send + Sync>;

/// Recovers the payload of `/bin/bash -l -c "..."` style wrapping.
pub fn shell_payload(command: &str) -> String {
    match (command.find('"'), command.rfind('"')) {
        (Some(start), Some(end)) if end > start => command[start + 1..end]
            .replace("\\\"", "\"")
            .replace("\\$", "$")
            .replace("\\`", "`"),
        _ => command.to_string(),
    }
}

/// Answers `echo X` with `X\n` and everything else with silence; exit 0.
pub fn echo_responder() -> Responder {
    Arc::new(|command: &str| {
        let payload = shell_payload(command);
        let last = payload.rsplit(" && ").next().unwrap_or_default().trim();
        match last.strip_prefix("echo ") {
            Some(text) => Script::new().stdout(format!("{text}\n")).exit(0),
            None => Script::new().exit(0),
        }
    })
}

#[derive(Default)]
struct HostBehavior {
    unreachable: bool,
    transient_failures: usize,
    password: Option<String>,
    responder: Option<Responder>,
}

#[derive(Default)]
struct Journal {
    attempts: HashMap<String, usize>,
    connects: HashMap<String, usize>,
    commands: Vec<(String, String)>,
    input: HashMap<String, Vec<u8>>,
}

pub struct MockConnector {
    hosts: Mutex<HashMap<String, HostBehavior>>,
    default_responder: Responder,
    journal: Arc<Mutex<Journal>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            default_responder: echo_responder(),
            journal: Arc::new(Mutex::new(Journal::default())),
        }
    }

    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Script + Send + Sync + 'static,
    {
        self.default_responder = Arc::new(f);
        self
    }

    fn behavior<F: FnOnce(&mut HostBehavior)>(self, host: &str, f: F) -> Self {
        if let Ok(mut hosts) = self.hosts.lock() {
            f(hosts.entry(host.to_string()).or_default());
        }
        self
    }

    pub fn unreachable(self, host: &str) -> Self {
        self.behavior(host, |b| b.unreachable = true)
    }

    /// The first `failures` connects to `host` time out.
    pub fn flaky(self, host: &str, failures: usize) -> Self {
        self.behavior(host, |b| b.transient_failures = failures)
    }

    pub fn require_password(self, host: &str, password: &str) -> Self {
        let password = password.to_string();
        self.behavior(host, |b| b.password = Some(password))
    }

    pub fn respond_on<F>(self, host: &str, f: F) -> Self
    where
        F: Fn(&str) -> Script + Send + Sync + 'static,
    {
        let responder: Responder = Arc::new(f);
        self.behavior(host, |b| b.responder = Some(responder))
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Successful connects per host key.
    pub fn connects(&self, key: &str) -> usize {
        self.journal().connects.get(key).copied().unwrap_or(0)
    }

    pub fn total_connects(&self) -> usize {
        self.journal().connects.values().sum()
    }

    /// Connect attempts per host key, successful or not.
    pub fn attempts(&self, key: &str) -> usize {
        self.journal().attempts.get(key).copied().unwrap_or(0)
    }

    /// `(host key, command)` for every process started, in order.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.journal().commands.clone()
    }

    /// Bytes written to processes on `key`.
    pub fn input(&self, key: &str) -> Vec<u8> {
        self.journal().input.get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host: &HostSpec,
        credentials: &Credentials,
        _options: &ConnectOptions,
    ) -> std::result::Result<Arc<dyn Session>, ConnectError> {
        let key = host.key();
        *self.journal().attempts.entry(key.clone()).or_default() += 1;

        let responder = {
            let mut hosts = self.hosts.lock().unwrap_or_else(|p| p.into_inner());
            let behavior = hosts.entry(host.host.clone()).or_default();
            if behavior.unreachable {
                return Err(ConnectError::Socket {
                    host: host.host.clone(),
                    port: host.port,
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "Connection refused"),
                });
            }
            if behavior.transient_failures > 0 {
                behavior.transient_failures -= 1;
                return Err(ConnectError::Timeout {
                    host: host.host.clone(),
                });
            }
            if let Some(expected) = &behavior.password {
                match credentials.password.as_ref().filter(|p| !p.is_empty()) {
                    None => {
                        return Err(ConnectError::Protocol(
                            "No authentication methods available".to_string(),
                        ))
                    }
                    Some(given) if given.expose() != expected => {
                        return Err(ConnectError::AuthRejected)
                    }
                    Some(_) => {}
                }
            }
            behavior
                .responder
                .clone()
                .unwrap_or_else(|| self.default_responder.clone())
        };

        *self.journal().connects.entry(key.clone()).or_default() += 1;
        Ok(Arc::new(MockSession {
            key,
            closed: AtomicBool::new(false),
            responder,
            journal: self.journal.clone(),
        }))
    }
}

struct MockSession {
    key: String,
    closed: AtomicBool,
    responder: Responder,
    journal: Arc<Mutex<Journal>>,
}

fn record_input(journal: &Mutex<Journal>, key: &str, bytes: &[u8]) {
    if let Ok(mut journal) = journal.lock() {
        journal
            .input
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(bytes);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[async_trait]
impl Session for MockSession {
    async fn start(&self, request: ChannelRequest) -> Result<RemoteProcess> {
        if self.is_closed() {
            return Err(Error::Channel("SSH session not active".to_string()));
        }
        let command = match &request.kind {
            ProcessKind::Exec(command) => command.clone(),
            ProcessKind::Shell => String::new(),
        };
        if let Ok(mut journal) = self.journal.lock() {
            journal.commands.push((self.key.clone(), command.clone()));
        }

        let script = (self.responder)(&command);
        let (process, events, mut input) = RemoteProcess::pair();
        let journal = self.journal.clone();
        let key = self.key.clone();

        tokio::spawn(async move {
            let mut received: Vec<u8> = Vec::new();
            for step in script.steps {
                match step {
                    Step::Stdout(data) => {
                        if events.send(ChannelEvent::Stdout(data)).await.is_err() {
                            return;
                        }
                    }
                    Step::Stderr(data) => {
                        if events.send(ChannelEvent::Stderr(data)).await.is_err() {
                            return;
                        }
                    }
                    Step::Sleep(duration) => tokio::time::sleep(duration).await,
                    Step::Hang => {
                        while let Some(msg) = input.recv().await {
                            if let ChannelInput::Data(bytes) = msg {
                                record_input(&journal, &key, &bytes);
                            }
                        }
                        return;
                    }
                    Step::Expect(expected) => loop {
                        if let Some(pos) = find(&received, &expected) {
                            received.drain(..pos + expected.len());
                            break;
                        }
                        match input.recv().await {
                            Some(ChannelInput::Data(bytes)) => {
                                record_input(&journal, &key, &bytes);
                                received.extend_from_slice(&bytes);
                            }
                            Some(ChannelInput::Eof) => {}
                            None => return,
                        }
                    },
                    Step::Exit(code) => {
                        let _ = events.send(ChannelEvent::ExitStatus(code)).await;
                        let _ = events.send(ChannelEvent::Eof).await;
                        break;
                    }
                }
            }
            while let Ok(msg) = input.try_recv() {
                if let ChannelInput::Data(bytes) = msg {
                    record_input(&journal, &key, &bytes);
                }
            }
        });

        Ok(process)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
