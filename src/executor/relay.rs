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

//! Per-stream output relay.
//!
//! An [`OutputRelay`] is fed raw chunks from one remote stream. For each chunk
//! it mirrors the bytes to the local sink with a `[host] out: ` style prefix,
//! appends them to the capture buffer, and answers any prompt that the
//! capture now ends with. Replies are returned to the caller, which owns the
//! channel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::output_sync::{OutputSink, Stream};
use crate::auth::{request_password, Password, PasswordCache, Prompter};
use crate::context::PromptMatch;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Write as soon as bytes arrive.
    Bytewise,
    /// Write complete lines only.
    Linewise,
    /// Raw bytes, no prefix, no capture, no prompts (interactive shells).
    Passthrough,
}

/// Answers sudo password prompts from the cache, or by asking the user.
#[derive(Clone)]
pub struct SudoResponder {
    pub prompt: String,
    pub again_prompt: String,
    /// Display name used in abort messages.
    pub host: String,
    /// Password cache key.
    pub key: String,
    pub passwords: PasswordCache,
    pub prompter: Arc<dyn Prompter>,
    pub abort_on_prompts: bool,
}

impl fmt::Debug for SudoResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SudoResponder")
            .field("prompt", &self.prompt)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

pub struct OutputRelay {
    stream: Stream,
    sink: Arc<dyn OutputSink>,
    mode: RelayMode,
    visible: bool,
    prefix: Vec<u8>,

    // last prefix.len() bytes written
    ring: VecDeque<u8>,
    last_byte: Option<u8>,
    seen_cr: bool,
    line_started: bool,
    pending: Vec<u8>,

    capture: Vec<u8>,
    prompts: Vec<(Vec<u8>, String)>,
    prompt_match: PromptMatch,
    sudo: Option<SudoResponder>,
    reprompt: bool,
    input_enabled: Arc<AtomicBool>,
}

impl OutputRelay {
    pub fn new(stream: Stream, sink: Arc<dyn OutputSink>, mode: RelayMode) -> Self {
        Self {
            stream,
            sink,
            mode,
            visible: true,
            prefix: Vec::new(),
            ring: VecDeque::new(),
            last_byte: None,
            seen_cr: false,
            line_started: false,
            pending: Vec::new(),
            capture: Vec::new(),
            prompts: Vec::new(),
            prompt_match: PromptMatch::Suffix,
            sudo: None,
            reprompt: false,
            input_enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Sets the line prefix to `[host] out: ` (or `err`), or none at all.
    pub fn with_prefix(mut self, host: &str, enabled: bool) -> Self {
        self.prefix = if enabled {
            format!("[{host}] {}: ", self.stream.tag()).into_bytes()
        } else {
            Vec::new()
        };
        self.ring = VecDeque::with_capacity(self.prefix.len());
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn with_prompts(mut self, prompts: &[(String, String)], matching: PromptMatch) -> Self {
        self.prompts = prompts
            .iter()
            .filter(|(prompt, _)| !prompt.is_empty())
            .map(|(prompt, response)| (prompt.as_bytes().to_vec(), response.clone()))
            .collect();
        self.prompt_match = matching;
        self
    }

    pub fn with_sudo(mut self, sudo: Option<SudoResponder>) -> Self {
        self.sudo = sudo.filter(|s| !s.prompt.is_empty());
        self
    }

    /// Flag cleared while the relay is reading a password from the user.
    pub fn with_input_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.input_enabled = flag;
        self
    }

    pub fn capture(&self) -> &[u8] {
        &self.capture
    }

    pub fn into_capture(self) -> Vec<u8> {
        self.capture
    }

    /// Processes one chunk and returns the replies to send to the remote side.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        if self.mode == RelayMode::Passthrough {
            if self.visible {
                self.write_out(chunk)?;
            }
            return Ok(Vec::new());
        }

        if self.visible {
            self.print(chunk)?;
        }

        let mut replies = Vec::new();
        for fragment in fragments(chunk) {
            self.capture.extend_from_slice(fragment);
            if let Some(reply) = self.respond()? {
                replies.push(reply);
            }
        }
        Ok(replies)
    }

    /// Flushes buffered output and ties off a dangling line.
    pub fn finish(&mut self) -> Result<()> {
        if !self.visible || self.mode == RelayMode::Passthrough {
            return Ok(());
        }
        if !self.pending.is_empty() {
            let mut line = self.prefix.clone();
            line.append(&mut self.pending);
            line.push(b'\n');
            self.write_out(&line)?;
            return Ok(());
        }
        let dangling_prefix = !self.prefix.is_empty() && self.ring.iter().eq(self.prefix.iter());
        let mid_line = self.last_byte.is_some_and(|b| b != b'\n');
        if dangling_prefix || mid_line {
            self.write_out(b"\n")?;
        }
        Ok(())
    }

    fn write_out(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.sink.write(self.stream, bytes)?;
        let cap = self.prefix.len();
        if cap > 0 {
            for &b in bytes.iter().skip(bytes.len().saturating_sub(cap)) {
                if self.ring.len() == cap {
                    self.ring.pop_front();
                }
                self.ring.push_back(b);
            }
        }
        self.last_byte = bytes.last().copied();
        Ok(())
    }

    fn print(&mut self, chunk: &[u8]) -> Result<()> {
        let mut data = chunk;
        if self.seen_cr && data.first() == Some(&b'\n') {
            data = &data[1..];
        }
        self.seen_cr = chunk.last() == Some(&b'\r');

        while let Some((start, end)) = find_line_break(data) {
            let line = &data[..start];
            data = &data[end..];
            match self.mode {
                RelayMode::Linewise => {
                    let mut out = self.prefix.clone();
                    out.append(&mut self.pending);
                    out.extend_from_slice(line);
                    out.push(b'\n');
                    self.write_out(&out)?;
                }
                _ => {
                    let mut out = if self.line_started {
                        Vec::new()
                    } else {
                        self.prefix.clone()
                    };
                    out.extend_from_slice(line);
                    out.push(b'\n');
                    self.write_out(&out)?;
                    self.line_started = false;
                }
            }
        }

        match self.mode {
            RelayMode::Linewise => self.pending.extend_from_slice(data),
            _ => {
                if !self.line_started {
                    let prefix = self.prefix.clone();
                    self.write_out(&prefix)?;
                    self.line_started = true;
                }
                self.write_out(data)?;
            }
        }
        Ok(())
    }

    fn matches(&self, prompt: &[u8]) -> bool {
        if !self.capture.ends_with(prompt) {
            return false;
        }
        match self.prompt_match {
            PromptMatch::Suffix => true,
            PromptMatch::LineAnchored => {
                let start = self.capture.len() - prompt.len();
                start == 0 || matches!(self.capture[start - 1], b'\n' | b'\r')
            }
        }
    }

    fn respond(&mut self) -> Result<Option<Vec<u8>>> {
        let hit = self
            .prompts
            .iter()
            .find(|(prompt, _)| self.matches(prompt))
            .map(|(prompt, response)| (prompt.len(), response.clone()));
        if let Some((len, response)) = hit {
            self.capture.truncate(self.capture.len() - len);
            tracing::debug!("Answering registered prompt on {:?}", self.stream);
            let mut reply = response.into_bytes();
            reply.push(b'\n');
            return Ok(Some(reply));
        }

        let Some(sudo) = self.sudo.clone() else {
            return Ok(None);
        };
        if self.capture.ends_with(sudo.prompt.as_bytes()) {
            self.capture.truncate(self.capture.len() - sudo.prompt.len());
            let password = self.sudo_password(&sudo)?;
            return Ok(Some(password.with_newline().to_vec()));
        }
        let again = sudo.again_prompt.as_bytes();
        if !again.is_empty()
            && (self.capture.ends_with(&[again, &b"\n"[..]].concat())
                || self.capture.ends_with(&[again, &b"\r\n"[..]].concat()))
        {
            self.reprompt = true;
        }
        Ok(None)
    }

    fn sudo_password(&mut self, sudo: &SudoResponder) -> Result<Password> {
        if !self.reprompt {
            if let Some(password) = sudo.passwords.get(&sudo.key).filter(|p| !p.is_empty()) {
                return Ok(password);
            }
        }

        if !self.visible {
            let mut notice = self.prefix.clone();
            if self.reprompt {
                notice.extend_from_slice(sudo.again_prompt.as_bytes());
                notice.push(b'\n');
                notice.extend_from_slice(&self.prefix);
            }
            notice.extend_from_slice(sudo.prompt.as_bytes());
            self.write_out(&notice)?;
        }

        self.input_enabled.store(false, Ordering::SeqCst);
        let entered = request_password(
            sudo.prompter.as_ref(),
            " ",
            &sudo.host,
            sudo.abort_on_prompts,
        );
        self.input_enabled.store(true, Ordering::SeqCst);

        let password = entered?;
        sudo.passwords.set(&sudo.key, password.clone());
        self.reprompt = false;
        Ok(password)
    }
}

impl fmt::Debug for OutputRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRelay")
            .field("stream", &self.stream)
            .field("mode", &self.mode)
            .field("visible", &self.visible)
            .field("captured", &self.capture.len())
            .finish_non_exhaustive()
    }
}

/// Position of the first `\r\n`, `\r` or `\n` as `(start, end)`.
fn find_line_break(data: &[u8]) -> Option<(usize, usize)> {
    let start = data.iter().position(|&b| b == b'\r' || b == b'\n')?;
    if data[start] == b'\r' && data.get(start + 1) == Some(&b'\n') {
        Some((start, start + 2))
    } else {
        Some((start, start + 1))
    }
}

/// Splits `chunk` into text runs and single line-break bytes.
fn fragments(chunk: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in chunk.iter().enumerate() {
        if b == b'\r' || b == b'\n' {
            if start < i {
                out.push(&chunk[start..i]);
            }
            out.push(&chunk[i..=i]);
            start = i + 1;
        }
    }
    if start < chunk.len() {
        out.push(&chunk[start..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ScriptedPrompter;
    use crate::error::Error;
    use crate::executor::output_sync::BufferSink;

    fn new_relay(mode: RelayMode) -> (OutputRelay, Arc<BufferSink>) {
        let sink = Arc::new(BufferSink::new());
        let relay = OutputRelay::new(Stream::Stdout, sink.clone(), mode).with_prefix("web1", true);
        (relay, sink)
    }

    fn sudo(passwords: PasswordCache, prompter: Arc<ScriptedPrompter>) -> SudoResponder {
        SudoResponder {
            prompt: "sudo password:".to_string(),
            again_prompt: "Sorry, try again.".to_string(),
            host: "web1".to_string(),
            key: "deploy@web1:22".to_string(),
            passwords,
            prompter,
            abort_on_prompts: false,
        }
    }

    #[test]
    fn test_fragments() {
        let parts = fragments(b"ab\r\ncd\nef");
        assert_eq!(parts, vec![&b"ab"[..], b"\r", b"\n", b"cd", b"\n", b"ef"]);
    }

    #[test]
    fn test_linewise_buffers_partial_lines() {
        let (mut relay, sink) = new_relay(RelayMode::Linewise);
        relay.feed(b"hel").unwrap();
        assert_eq!(sink.stdout(), "");
        relay.feed(b"lo\nwor").unwrap();
        assert_eq!(sink.stdout(), "[web1] out: hello\n");
        relay.feed(b"ld").unwrap();
        relay.finish().unwrap();
        assert_eq!(sink.stdout(), "[web1] out: hello\n[web1] out: world\n");
        assert_eq!(relay.capture(), b"hello\nworld");
    }

    #[test]
    fn test_bytewise_ties_off_dangling_prefix() {
        let (mut relay, sink) = new_relay(RelayMode::Bytewise);
        relay.feed(b"hi\n").unwrap();
        relay.finish().unwrap();
        assert_eq!(sink.stdout(), "[web1] out: hi\n[web1] out: \n");
    }

    #[test]
    fn test_bytewise_prefixes_once_per_line() {
        let (mut relay, sink) = new_relay(RelayMode::Bytewise);
        for chunk in [&b"a"[..], b"b", b"\n", b"c"] {
            relay.feed(chunk).unwrap();
        }
        relay.finish().unwrap();
        assert_eq!(sink.stdout(), "[web1] out: ab\n[web1] out: c\n");
    }

    #[test]
    fn test_crlf_split_across_chunks_is_one_break() {
        let (mut relay, sink) = new_relay(RelayMode::Linewise);
        relay.feed(b"one\r").unwrap();
        relay.feed(b"\ntwo\r\n").unwrap();
        relay.finish().unwrap();
        assert_eq!(sink.stdout(), "[web1] out: one\n[web1] out: two\n");
    }

    #[test]
    fn test_no_prefix() {
        let sink = Arc::new(BufferSink::new());
        let mut relay = OutputRelay::new(Stream::Stderr, sink.clone(), RelayMode::Linewise)
            .with_prefix("web1", false);
        relay.feed(b"oops\n").unwrap();
        relay.finish().unwrap();
        assert_eq!(sink.stderr(), "oops\n");
    }

    #[test]
    fn test_hidden_output_is_still_captured() {
        let (relay, sink) = new_relay(RelayMode::Bytewise);
        let mut relay = relay.visible(false);
        relay.feed(b"secret\n").unwrap();
        relay.finish().unwrap();
        assert_eq!(sink.stdout(), "");
        assert_eq!(relay.capture(), b"secret\n");
    }

    #[test]
    fn test_prompt_answered_once_and_stripped() {
        let (relay, _) = new_relay(RelayMode::Bytewise);
        let prompts = vec![("Continue? [y/n] ".to_string(), "y".to_string())];
        let mut relay = relay.with_prompts(&prompts, PromptMatch::Suffix);

        let replies = relay.feed(b"Checking...\nContinue? [y/n] ").unwrap();
        assert_eq!(replies, vec![b"y\n".to_vec()]);
        assert!(relay.feed(b"done\n").unwrap().is_empty());
        assert_eq!(relay.capture(), b"Checking...\ndone\n");
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let (relay, _) = new_relay(RelayMode::Bytewise);
        let prompts = vec![("Password: ".to_string(), "hunter2".to_string())];
        let mut relay = relay.with_prompts(&prompts, PromptMatch::Suffix);
        assert!(relay.feed(b"Pass").unwrap().is_empty());
        assert_eq!(relay.feed(b"word: ").unwrap(), vec![b"hunter2\n".to_vec()]);
    }

    #[test]
    fn test_line_anchored_matching() {
        let prompts = vec![("y/n] ".to_string(), "y".to_string())];

        let (relay, _) = new_relay(RelayMode::Bytewise);
        let mut anchored = relay.with_prompts(&prompts, PromptMatch::LineAnchored);
        assert!(anchored.feed(b"say y/n] ").unwrap().is_empty());
        assert_eq!(anchored.feed(b"\ny/n] ").unwrap(), vec![b"y\n".to_vec()]);

        let (relay, _) = new_relay(RelayMode::Bytewise);
        let mut suffix = relay.with_prompts(&prompts, PromptMatch::Suffix);
        assert_eq!(suffix.feed(b"say y/n] ").unwrap(), vec![b"y\n".to_vec()]);
    }

    #[test]
    fn test_sudo_uses_cached_password() {
        let passwords = PasswordCache::new();
        passwords.set("deploy@web1:22", Password::new("cached"));
        let prompter = Arc::new(ScriptedPrompter::default());
        let (relay, _) = new_relay(RelayMode::Bytewise);
        let mut relay = relay.with_sudo(Some(sudo(passwords, prompter.clone())));

        let replies = relay.feed(b"sudo password:").unwrap();
        assert_eq!(replies, vec![b"cached\n".to_vec()]);
        assert!(prompter.asked().is_empty());
        assert!(relay.capture().is_empty());
    }

    #[test]
    fn test_sudo_reprompts_after_rejection() {
        let passwords = PasswordCache::new();
        let prompter = Arc::new(ScriptedPrompter::new(["first", "second"]));
        let flag = Arc::new(AtomicBool::new(true));
        let (relay, _) = new_relay(RelayMode::Linewise);
        let mut relay = relay
            .with_sudo(Some(sudo(passwords.clone(), prompter.clone())))
            .with_input_flag(flag.clone());

        assert_eq!(relay.feed(b"sudo password:").unwrap(), vec![b"first\n".to_vec()]);
        assert_eq!(passwords.get("deploy@web1:22").unwrap().expose(), "first");

        relay.feed(b"\r\nSorry, try again.\r\n").unwrap();
        assert_eq!(relay.feed(b"sudo password:").unwrap(), vec![b"second\n".to_vec()]);
        assert_eq!(prompter.asked().len(), 2);
        assert_eq!(passwords.get("deploy@web1:22").unwrap().expose(), "second");
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_hidden_sudo_prompt_is_echoed() {
        let prompter = Arc::new(ScriptedPrompter::new(["pw"]));
        let (relay, sink) = new_relay(RelayMode::Bytewise);
        let mut relay = relay
            .visible(false)
            .with_sudo(Some(sudo(PasswordCache::new(), prompter)));
        relay.feed(b"sudo password:").unwrap();
        assert_eq!(sink.stdout(), "[web1] out: sudo password:");
    }

    #[test]
    fn test_sudo_abort_on_prompts() {
        let prompter = Arc::new(ScriptedPrompter::new(["pw"]));
        let mut responder = sudo(PasswordCache::new(), prompter);
        responder.abort_on_prompts = true;
        let (relay, _) = new_relay(RelayMode::Bytewise);
        let mut relay = relay.with_sudo(Some(responder));
        let err = relay.feed(b"sudo password:").unwrap_err();
        assert!(matches!(err, Error::Abort(_)));
    }

    #[test]
    fn test_passthrough_writes_raw() {
        let (mut relay, sink) = new_relay(RelayMode::Passthrough);
        relay.feed(b"$ ls\r\n").unwrap();
        relay.finish().unwrap();
        assert_eq!(sink.stdout(), "$ ls\r\n");
        assert!(relay.capture().is_empty());
    }
}
