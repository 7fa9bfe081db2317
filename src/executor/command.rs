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

//! Running one command over an open session.
//!
//! The executor starts the remote process and hands each output stream to an
//! [`OutputRelay`] running on a blocking thread. A single select loop moves
//! bytes between the channel, the relays and local stdin, and watches the
//! silence deadline and Ctrl-C. Relay failures come back over an error
//! channel and end the loop immediately.
//!
//! With `remote_interrupt` and a pty, Ctrl-C is sent to the remote process
//! as `0x03` and the command keeps running; otherwise it ends the command
//! with [`Error::Interrupted`].

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::input::{spawn_stdin_pump, stdin_is_terminal, CbreakGuard};
use super::output_sync::{OutputSink, Stream};
use super::relay::{OutputRelay, RelayMode, SudoResponder};
use super::result::ExecOutput;
use crate::context::{ExecutionContext, PromptMatch};
use crate::error::{Error, Result};
use crate::utils::interrupt::Interrupts;
use crate::ssh::{
    ChannelEvent, ChannelInput, ChannelRequest, ProcessKind, PtyRequest, Session,
    transport::CHANNEL_BUFFER_SIZE,
};

const DEFAULT_TERM: &str = "vt100";
const FALLBACK_COLS: u32 = 80;
const FALLBACK_ROWS: u32 = 24;
const CTRL_C: u8 = 0x03;

/// Per-invocation knobs for [`RemoteCommandExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOptions {
    pub pty: bool,
    pub combine_stderr: bool,
    /// Maximum silence before the command is considered hung.
    pub timeout: Option<Duration>,
    pub invoke_shell: bool,
    pub remote_interrupt: bool,
    pub forward_stdin: bool,
    pub echo_stdin: bool,
    pub linewise: bool,
    pub output_prefix: bool,
    pub show_stdout: bool,
    pub show_stderr: bool,
}

impl ExecOptions {
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        Self {
            pty: ctx.always_use_pty,
            combine_stderr: ctx.combine_stderr,
            timeout: ctx.command_timeout,
            invoke_shell: false,
            remote_interrupt: ctx.remote_interrupt,
            forward_stdin: !ctx.parallel,
            echo_stdin: ctx.echo_stdin,
            linewise: ctx.linewise || ctx.parallel,
            output_prefix: ctx.output_prefix,
            show_stdout: ctx.output.stdout,
            show_stderr: ctx.output.stderr,
        }
    }
}

/// What to run and how to answer its prompts.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Display name for prefixes and errors.
    pub host: String,
    /// Command line to execute, or the line typed into an interactive shell.
    pub command: String,
    pub options: ExecOptions,
    pub prompts: Vec<(String, String)>,
    pub prompt_match: PromptMatch,
    pub sudo: Option<SudoResponder>,
}

fn pty_request() -> PtyRequest {
    let (cols, rows) = crossterm::terminal::size()
        .map(|(c, r)| (u32::from(c), u32::from(r)))
        .unwrap_or((FALLBACK_COLS, FALLBACK_ROWS));
    PtyRequest {
        term: DEFAULT_TERM.to_string(),
        cols,
        rows,
    }
}

type RelayHandle = JoinHandle<Result<Vec<u8>>>;

/// Runs `relay` on a blocking thread until `chunks` closes.
///
/// A failure is sent on `errors` for the select loop and also returned.
fn spawn_relay(
    mut relay: OutputRelay,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<ChannelInput>,
    errors: mpsc::Sender<Error>,
    stream: Stream,
) -> RelayHandle {
    tokio::task::spawn_blocking(move || {
        let mut pump = || -> Result<()> {
            while let Some(chunk) = chunks.blocking_recv() {
                for reply in relay.feed(&chunk)? {
                    if outbound.blocking_send(ChannelInput::Data(reply)).is_err() {
                        tracing::debug!("{stream:?} relay reply dropped: channel closed");
                    }
                }
            }
            relay.finish()
        };
        match pump() {
            Ok(()) => Ok(relay.into_capture()),
            Err(e) => {
                let summary = format!("{stream:?} relay failed: {e}");
                let _ = errors.blocking_send(e);
                Err(Error::Channel(summary))
            }
        }
    })
}

async fn join_relay(handle: RelayHandle) -> Result<Vec<u8>> {
    handle
        .await
        .map_err(|e| Error::Task(anyhow::anyhow!("output relay panicked: {e}")))?
}

async fn wait_for_interrupt(interrupts: Option<&Interrupts>) {
    match interrupts {
        Some(interrupts) => interrupts.recv().await,
        None => std::future::pending().await,
    }
}

pub struct RemoteCommandExecutor {
    sink: Arc<dyn OutputSink>,
    interrupts: Option<Interrupts>,
}

impl RemoteCommandExecutor {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            interrupts: None,
        }
    }

    pub fn with_interrupts(mut self, interrupts: Interrupts) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    pub async fn execute(&self, session: &dyn Session, request: ExecRequest) -> Result<ExecOutput> {
        let options = &request.options;
        let pty = options.pty || options.invoke_shell;
        let kind = if options.invoke_shell {
            ProcessKind::Shell
        } else {
            ProcessKind::Exec(request.command.clone())
        };
        let mut process = session
            .start(ChannelRequest {
                kind,
                pty: pty.then(pty_request),
            })
            .await?;

        if options.invoke_shell && !request.command.is_empty() {
            let line = format!("{}\n", request.command).into_bytes();
            process
                .input
                .send(ChannelInput::Data(line))
                .await
                .map_err(|_| Error::Channel("channel closed before command was sent".into()))?;
        }

        let mode = if options.invoke_shell {
            RelayMode::Passthrough
        } else if options.linewise {
            RelayMode::Linewise
        } else {
            RelayMode::Bytewise
        };
        let input_enabled = Arc::new(AtomicBool::new(true));
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ChannelInput>(CHANNEL_BUFFER_SIZE);
        let (error_tx, mut error_rx) = mpsc::channel::<Error>(4);

        let make_relay = |stream: Stream, visible: bool| {
            OutputRelay::new(stream, self.sink.clone(), mode)
                .with_prefix(&request.host, options.output_prefix)
                .visible(visible)
                .with_prompts(&request.prompts, request.prompt_match)
                .with_sudo(request.sudo.clone())
                .with_input_flag(input_enabled.clone())
        };
        let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER_SIZE);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER_SIZE);
        let stdout_relay = spawn_relay(
            make_relay(Stream::Stdout, options.show_stdout),
            stdout_rx,
            outbound_tx.clone(),
            error_tx.clone(),
            Stream::Stdout,
        );
        let stderr_relay = spawn_relay(
            make_relay(Stream::Stderr, options.show_stderr),
            stderr_rx,
            outbound_tx.clone(),
            error_tx.clone(),
            Stream::Stderr,
        );
        drop(error_tx);

        let cancel = CancellationToken::new();
        let interactive = options.forward_stdin && stdin_is_terminal();
        let _terminal_mode = (interactive && pty).then(CbreakGuard::enable);
        let stdin_pump = interactive.then(|| {
            let echo = (!pty && options.echo_stdin).then(|| self.sink.clone());
            spawn_stdin_pump(outbound_tx.clone(), cancel.clone(), input_enabled.clone(), echo)
        });
        drop(outbound_tx);

        let silence = options.timeout;
        let far_future = Instant::now() + Duration::from_secs(86_400 * 365);
        let deadline = tokio::time::sleep_until(silence.map_or(far_future, |t| Instant::now() + t));
        tokio::pin!(deadline);
        let mut interrupts = self.interrupts.clone();

        let mut exit_status = None;
        let outcome: Result<()> = loop {
            tokio::select! {
                event = process.events.recv() => {
                    if let Some(t) = silence {
                        deadline.as_mut().reset(Instant::now() + t);
                    }
                    match event {
                        Some(ChannelEvent::Stdout(data)) => {
                            let _ = stdout_tx.send(data).await;
                        }
                        Some(ChannelEvent::Stderr(data)) => {
                            let target = if options.combine_stderr { &stdout_tx } else { &stderr_tx };
                            let _ = target.send(data).await;
                        }
                        Some(ChannelEvent::ExitStatus(code)) => exit_status = Some(code),
                        Some(ChannelEvent::Eof) => {}
                        None => break Ok(()),
                    }
                }
                Some(msg) = outbound_rx.recv() => {
                    if process.input.send(msg).await.is_err() {
                        tracing::debug!("[{}] dropped input for closed channel", request.host);
                    }
                }
                Some(err) = error_rx.recv() => break Err(err),
                _ = &mut deadline, if silence.is_some() => {
                    break Err(Error::CommandTimeout {
                        host: request.host.clone(),
                        command: request.command.clone(),
                        timeout: silence.unwrap_or_default(),
                    });
                }
                _ = wait_for_interrupt(interrupts.as_ref()) => {
                    match interrupts.as_mut() {
                        Some(interrupts) if options.remote_interrupt && pty => {
                            tracing::debug!("[{}] forwarding interrupt", request.host);
                            interrupts.absorb();
                            let _ = process.input.send(ChannelInput::Data(vec![CTRL_C])).await;
                        }
                        _ => break Err(Error::Interrupted),
                    }
                }
            }
        };

        cancel.cancel();
        drop(stdout_tx);
        drop(stderr_tx);

        if let Err(e) = outcome {
            drop(process);
            return Err(e);
        }

        let stdout = join_relay(stdout_relay).await;
        let stderr = join_relay(stderr_relay).await;
        if let Ok(err) = error_rx.try_recv() {
            return Err(err);
        }
        if let Some(pump) = stdin_pump {
            let _ = pump.await;
        }
        drop(process);

        Ok(ExecOutput {
            stdout: stdout?,
            stderr: stderr?,
            exit_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::interrupt::InterruptSource;
    use crate::executor::output_sync::BufferSink;
    use crate::ssh::mock::{MockConnector, Script};
    use crate::ssh::{ConnectOptions, Connector, Credentials};
    use crate::host::HostSpec;

    fn options() -> ExecOptions {
        ExecOptions {
            pty: false,
            combine_stderr: false,
            timeout: None,
            invoke_shell: false,
            remote_interrupt: false,
            forward_stdin: false,
            echo_stdin: false,
            linewise: true,
            output_prefix: true,
            show_stdout: true,
            show_stderr: true,
        }
    }

    fn request(command: &str, options: ExecOptions) -> ExecRequest {
        ExecRequest {
            host: "web1".to_string(),
            command: command.to_string(),
            options,
            prompts: Vec::new(),
            prompt_match: PromptMatch::Suffix,
            sudo: None,
        }
    }

    async fn session(connector: &MockConnector) -> Arc<dyn Session> {
        connector
            .connect(
                &HostSpec::new("u", "web1", 22),
                &Credentials::default(),
                &ConnectOptions::from_context(&ExecutionContext::default()),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_streams_are_relayed_and_captured() {
        let connector = MockConnector::new().with_responder(|_| {
            Script::new().stdout("out line\n").stderr("err line\n").exit(3)
        });
        let session = session(&connector).await;
        let sink = Arc::new(BufferSink::new());
        let executor = RemoteCommandExecutor::new(sink.clone());

        let output = executor
            .execute(session.as_ref(), request("anything", options()))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"out line\n");
        assert_eq!(output.stderr, b"err line\n");
        assert_eq!(output.return_code(), 3);
        assert_eq!(sink.stdout(), "[web1] out: out line\n");
        assert_eq!(sink.stderr(), "[web1] err: err line\n");
    }

    #[tokio::test]
    async fn test_combine_stderr_merges_into_stdout() {
        let connector = MockConnector::new()
            .with_responder(|_| Script::new().stdout("a\n").stderr("b\n").exit(0));
        let session = session(&connector).await;
        let executor = RemoteCommandExecutor::new(Arc::new(BufferSink::new()));
        let output = executor
            .execute(
                session.as_ref(),
                request("x", ExecOptions { combine_stderr: true, ..options() }),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, b"a\nb\n");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_missing_exit_status_is_minus_one() {
        let connector = MockConnector::new().with_responder(|_| Script::new().stdout("partial"));
        let session = session(&connector).await;
        let executor = RemoteCommandExecutor::new(Arc::new(BufferSink::new()));
        let output = executor
            .execute(session.as_ref(), request("x", options()))
            .await
            .unwrap();
        assert_eq!(output.return_code(), -1);
    }

    #[tokio::test]
    async fn test_silence_timeout() {
        let connector = MockConnector::new().with_responder(|_| Script::new().stdout("start\n").hang());
        let session = session(&connector).await;
        let executor = RemoteCommandExecutor::new(Arc::new(BufferSink::new()));
        let opts = ExecOptions {
            timeout: Some(Duration::from_millis(200)),
            ..options()
        };
        let started = std::time::Instant::now();
        let err = executor
            .execute(session.as_ref(), request("sleep 100", opts))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_prompt_reply_reaches_remote() {
        let connector = MockConnector::new().with_responder(|_| {
            Script::new()
                .stdout("Proceed? ")
                .expect("yes\n")
                .stdout("ok\n")
                .exit(0)
        });
        let session = session(&connector).await;
        let executor = RemoteCommandExecutor::new(Arc::new(BufferSink::new()));
        let mut req = request("install", options());
        req.prompts = vec![("Proceed? ".to_string(), "yes".to_string())];

        let output = executor.execute(session.as_ref(), req).await.unwrap();
        assert_eq!(output.stdout, b"ok\n");
        assert_eq!(connector.input("u@web1:22"), b"yes\n");
    }

    #[tokio::test]
    async fn test_interactive_shell_sends_command_line() {
        let connector = MockConnector::new()
            .with_responder(|_| Script::new().expect("uptime\n").stdout("up 3 days\r\n").exit(0));
        let session = session(&connector).await;
        let sink = Arc::new(BufferSink::new());
        let executor = RemoteCommandExecutor::new(sink.clone());
        let opts = ExecOptions {
            invoke_shell: true,
            ..options()
        };
        let output = executor
            .execute(session.as_ref(), request("uptime", opts))
            .await
            .unwrap();
        assert_eq!(sink.stdout(), "up 3 days\r\n");
        assert!(output.stdout.is_empty());
        assert_eq!(connector.commands()[0].1, "");
    }

    #[tokio::test]
    async fn test_interrupt_ends_command() {
        let connector = MockConnector::new().with_responder(|_| Script::new().stdout("working\n").hang());
        let session = session(&connector).await;
        let source = InterruptSource::new();
        let executor = RemoteCommandExecutor::new(Arc::new(BufferSink::new()))
            .with_interrupts(source.subscribe());

        let raiser = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            raiser.raise();
        });
        let err = executor
            .execute(session.as_ref(), request("make", options()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[tokio::test]
    async fn test_remote_interrupt_is_forwarded() {
        let connector = MockConnector::new().with_responder(|_| {
            Script::new()
                .stdout("tailing\n")
                .expect([CTRL_C])
                .stdout("stopped\n")
                .exit(130)
        });
        let session = session(&connector).await;
        let source = InterruptSource::new();
        let watcher = source.subscribe();
        let executor = RemoteCommandExecutor::new(Arc::new(BufferSink::new()))
            .with_interrupts(source.subscribe());
        let opts = ExecOptions {
            pty: true,
            remote_interrupt: true,
            ..options()
        };

        let raiser = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            raiser.raise();
        });
        let output = executor
            .execute(session.as_ref(), request("tail -f log", opts))
            .await
            .unwrap();
        assert_eq!(output.return_code(), 130);
        assert_eq!(connector.input("u@web1:22"), vec![CTRL_C]);
        // handled remotely, so nothing is left pending for the caller
        assert!(!watcher.pending());
    }
}
