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

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use super::password::Password;
use crate::error::{Error, Result};

/// Source of interactively entered passwords.
///
/// Implementations block; async callers go through `spawn_blocking`.
pub trait Prompter: Send + Sync {
    fn prompt_password(&self, prompt: &str) -> io::Result<String>;
}

/// Reads from the controlling terminal without echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn prompt_password(&self, prompt: &str) -> io::Result<String> {
        loop {
            let password = rpassword::prompt_password(prompt)?;
            if !password.is_empty() {
                return Ok(password);
            }
            eprintln!("Sorry, you can't enter an empty password. Please try again.");
        }
    }
}

/// Answers prompts from a fixed list and records what was asked.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Prompts shown so far, in order.
    pub fn asked(&self) -> Vec<String> {
        self.asked
            .lock()
            .map(|asked| asked.clone())
            .unwrap_or_default()
    }
}

impl Prompter for ScriptedPrompter {
    fn prompt_password(&self, prompt: &str) -> io::Result<String> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(prompt.to_string());
        }
        self.answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop_front())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted answer left"))
    }
}

/// Asks for a password unless prompting is disabled for this run.
pub fn request_password(
    prompter: &dyn Prompter,
    prompt: &str,
    host: &str,
    abort_on_prompts: bool,
) -> Result<Password> {
    if abort_on_prompts {
        return Err(Error::Abort(format!(
            "Needed to prompt for a connection or sudo password (host: {host}), but abort-on-prompts was set to True"
        )));
    }
    let password = prompter.prompt_password(prompt)?;
    Ok(Password::new(password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_prompter_records_prompts() {
        let prompter = ScriptedPrompter::new(["first", "second"]);
        assert_eq!(prompter.prompt_password("a: ").unwrap(), "first");
        assert_eq!(prompter.prompt_password("b: ").unwrap(), "second");
        assert!(prompter.prompt_password("c: ").is_err());
        assert_eq!(prompter.asked(), vec!["a: ", "b: ", "c: "]);
    }

    #[test]
    fn test_abort_on_prompts_never_asks() {
        let prompter = ScriptedPrompter::new(["unused"]);
        let err = request_password(&prompter, "pw: ", "web1", true).unwrap_err();
        assert!(err.to_string().contains("abort-on-prompts"));
        assert!(err.to_string().contains("web1"));
        assert!(prompter.asked().is_empty());

        let password = request_password(&prompter, "pw: ", "web1", false).unwrap();
        assert_eq!(password.expose(), "unused");
    }
}
