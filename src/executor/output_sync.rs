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

//! Serialized access to the local output streams.
//!
//! Every byte the engine shows the user goes through an [`OutputSink`]. The
//! terminal sink takes a process-wide lock per write so concurrent hosts never
//! tear each other's writes apart.

use once_cell::sync::Lazy;
use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard};

/// Global stdout mutex to prevent interleaved output
static STDOUT_MUTEX: Lazy<Mutex<io::Stdout>> = Lazy::new(|| Mutex::new(io::stdout()));

/// Global stderr mutex to prevent interleaved output
static STDERR_MUTEX: Lazy<Mutex<io::Stderr>> = Lazy::new(|| Mutex::new(io::stderr()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    /// Tag used in line prefixes: `[host] out: ` / `[host] err: `.
    pub fn tag(self) -> &'static str {
        match self {
            Stream::Stdout => "out",
            Stream::Stderr => "err",
        }
    }
}

pub trait OutputSink: Send + Sync {
    fn write(&self, stream: Stream, bytes: &[u8]) -> io::Result<()>;

    /// Writes `text` plus a newline in a single locked write.
    fn line(&self, stream: Stream, text: &str) -> io::Result<()> {
        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.extend_from_slice(text.as_bytes());
        buf.push(b'\n');
        self.write(stream, &buf)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The process's real stdout/stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalSink;

impl OutputSink for TerminalSink {
    fn write(&self, stream: Stream, bytes: &[u8]) -> io::Result<()> {
        match stream {
            Stream::Stdout => {
                let mut stdout = lock(&STDOUT_MUTEX);
                stdout.write_all(bytes)?;
                stdout.flush()
            }
            Stream::Stderr => {
                let mut stderr = lock(&STDERR_MUTEX);
                stderr.write_all(bytes)?;
                stderr.flush()
            }
        }
    }
}

/// In-memory sink, for callers that want to inspect what would be shown.
#[derive(Debug, Default)]
pub struct BufferSink {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, stream: Stream) -> String {
        let buf = match stream {
            Stream::Stdout => lock(&self.stdout),
            Stream::Stderr => lock(&self.stderr),
        };
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn stdout(&self) -> String {
        self.contents(Stream::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.contents(Stream::Stderr)
    }
}

impl OutputSink for BufferSink {
    fn write(&self, stream: Stream, bytes: &[u8]) -> io::Result<()> {
        match stream {
            Stream::Stdout => lock(&self.stdout).extend_from_slice(bytes),
            Stream::Stderr => lock(&self.stderr).extend_from_slice(bytes),
        }
        Ok(())
    }
}
