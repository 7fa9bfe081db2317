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

//! Local stdin forwarding for a running remote command.

use std::io::{self, Read};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::output_sync::{OutputSink, Stream};
use crate::ssh::ChannelInput;

const INPUT_POLL_TIMEOUT_MS: u16 = 100;
const INPUT_BUFFER_SIZE: usize = 8192;

pub fn stdin_is_terminal() -> bool {
    atty::is(atty::Stream::Stdin)
}

/// Wait up to `timeout` for stdin to become readable.
fn poll_stdin(timeout: Duration) -> io::Result<bool> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let stdin = io::stdin();
    let mut poll_fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
    let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;

    match poll(&mut poll_fds, PollTimeout::from(timeout_ms)) {
        Ok(n) => Ok(n > 0),
        Err(nix::errno::Errno::EINTR) => Ok(false),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

/// Puts the local terminal in character-buffered, no-echo mode until dropped.
///
/// Signals stay enabled so Ctrl-C still reaches the process.
pub struct CbreakGuard {
    original: Option<Termios>,
}

impl CbreakGuard {
    pub fn enable() -> Self {
        let stdin = io::stdin();
        let original = match termios::tcgetattr(stdin.as_fd()) {
            Ok(original) => original,
            Err(e) => {
                tracing::debug!("Not switching terminal mode: {e}");
                return Self { original: None };
            }
        };
        let mut cbreak = original.clone();
        cbreak.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        if let Err(e) = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &cbreak) {
            tracing::debug!("Failed to enable cbreak mode: {e}");
            return Self { original: None };
        }
        Self {
            original: Some(original),
        }
    }
}

impl Drop for CbreakGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            let stdin = io::stdin();
            if let Err(e) = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &original) {
                tracing::warn!("Failed to restore terminal mode: {e}");
            }
        }
    }
}

/// Forwards local keystrokes to the remote process until `cancel` fires.
///
/// Reading pauses while `input_enabled` is cleared, so a password prompt
/// owns the terminal. With `echo` set, forwarded bytes are also written to
/// the local stdout.
pub fn spawn_stdin_pump(
    outbound: mpsc::Sender<ChannelInput>,
    cancel: CancellationToken,
    input_enabled: Arc<AtomicBool>,
    echo: Option<Arc<dyn OutputSink>>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut stdin = io::stdin();
        let mut buffer = [0u8; INPUT_BUFFER_SIZE];
        let poll_timeout = Duration::from_millis(INPUT_POLL_TIMEOUT_MS as u64);

        while !cancel.is_cancelled() {
            if !input_enabled.load(Ordering::SeqCst) {
                std::thread::sleep(poll_timeout);
                continue;
            }
            match poll_stdin(poll_timeout) {
                Ok(true) => match stdin.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!("EOF received on stdin");
                        break;
                    }
                    Ok(n) => {
                        let data = buffer[..n].to_vec();
                        if let Some(sink) = &echo {
                            let _ = sink.write(Stream::Stdout, &data);
                        }
                        if outbound.blocking_send(ChannelInput::Data(data)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("stdin read failed: {e}");
                        break;
                    }
                },
                Ok(false) => continue,
                Err(e) => {
                    tracing::debug!("stdin poll failed: {e}");
                    break;
                }
            }
        }
    })
}
