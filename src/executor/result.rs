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

use std::fmt;

/// Exit status used when the remote side never reported one.
pub const UNKNOWN_EXIT_STATUS: i32 = -1;

/// Raw outcome of one remote process, before any policy is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn return_code(&self) -> i32 {
        self.exit_status
            .map(|code| i32::try_from(code).unwrap_or(i32::MAX))
            .unwrap_or(UNKNOWN_EXIT_STATUS)
    }
}

/// Result of `run()`, `sudo()` or `local()`.
///
/// A non-zero return code is data here; whether it is an error depends on
/// the context's `ok_ret_codes` and `warn_only`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// The command as the caller wrote it.
    pub command: String,
    /// The command line actually executed, after wrapping.
    pub real_command: String,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub failed: bool,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        !self.failed
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stdout)
    }
}
