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

//! Execution context: the explicit configuration value threaded through the
//! orchestrator, the executor and every task.
//!
//! A context is plain data. Parallel workers receive their own clone and never
//! write back. Scoped changes go through [`Overrides`] and the RAII
//! [`Scoped`] guard, which restores the previous values on drop.

mod overrides;
mod roles;

pub use overrides::{ContextScope, Overrides, Scoped, Settings};
pub use roles::{RoleSource, Roledefs};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::host::{local_user, HostSpec, DEFAULT_PORT};

pub const DEFAULT_SHELL: &str = "/bin/bash -l -c";
pub const DEFAULT_SUDO_PREFIX: &str = "sudo -S -p '%(sudo_prompt)s' ";
pub const DEFAULT_SUDO_PROMPT: &str = "sudo password:";
pub const DEFAULT_AGAIN_PROMPT: &str = "Sorry, try again.";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// How `path()` combines its value with the remote `$PATH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathBehavior {
    #[default]
    Append,
    Prepend,
    Replace,
}

impl FromStr for PathBehavior {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "append" => Ok(PathBehavior::Append),
            "prepend" => Ok(PathBehavior::Prepend),
            "replace" => Ok(PathBehavior::Replace),
            other => Err(Error::Config(format!("unknown path behavior '{other}'"))),
        }
    }
}

/// How registered prompts are matched against captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptMatch {
    /// The capture ends with the prompt text.
    #[default]
    Suffix,
    /// The capture ends with the prompt text and the prompt starts a line.
    LineAnchored,
}

/// Output groups that can be hidden or shown independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputGroups {
    pub status: bool,
    pub aborts: bool,
    pub warnings: bool,
    pub running: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub user: bool,
    pub debug: bool,
}

impl Default for OutputGroups {
    fn default() -> Self {
        Self {
            status: true,
            aborts: true,
            warnings: true,
            running: true,
            stdout: true,
            stderr: true,
            user: true,
            debug: false,
        }
    }
}

impl OutputGroups {
    fn expand(group: &str) -> Result<&'static [&'static str]> {
        Ok(match group {
            "everything" => &["warnings", "running", "user", "stdout", "stderr"],
            "output" => &["stdout", "stderr"],
            "commands" => &["running"],
            "status" => &["status"],
            "aborts" => &["aborts"],
            "warnings" => &["warnings"],
            "running" => &["running"],
            "stdout" => &["stdout"],
            "stderr" => &["stderr"],
            "user" => &["user"],
            "debug" => &["debug"],
            other => return Err(Error::Config(format!("unknown output group '{other}'"))),
        })
    }

    fn flag(&mut self, name: &str) -> &mut bool {
        match name {
            "status" => &mut self.status,
            "aborts" => &mut self.aborts,
            "warnings" => &mut self.warnings,
            "running" => &mut self.running,
            "stdout" => &mut self.stdout,
            "stderr" => &mut self.stderr,
            "user" => &mut self.user,
            _ => &mut self.debug,
        }
    }

    pub fn set<S: AsRef<str>>(&mut self, groups: &[S], visible: bool) -> Result<()> {
        for group in groups {
            for name in Self::expand(group.as_ref().trim())? {
                *self.flag(name) = visible;
            }
        }
        Ok(())
    }

    pub fn hidden<S: AsRef<str>>(mut self, groups: &[S]) -> Result<Self> {
        self.set(groups, false)?;
        Ok(self)
    }

    pub fn shown<S: AsRef<str>>(mut self, groups: &[S]) -> Result<Self> {
        self.set(groups, true)?;
        Ok(self)
    }
}

/// Snapshot of everything that shapes how a task talks to its hosts.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    // connection
    pub user: String,
    pub port: u16,
    pub key_filenames: Vec<PathBuf>,
    pub no_agent: bool,
    pub no_keys: bool,
    pub disable_known_hosts: bool,
    pub reject_unknown_hosts: bool,
    pub timeout: Duration,
    pub connection_attempts: u32,
    pub auth_attempts: u32,
    pub retry_delay: Option<Duration>,
    pub keepalive: Option<Duration>,
    pub abort_on_prompts: bool,

    // command shaping
    pub cwd: String,
    pub lcwd: String,
    pub command_prefixes: Vec<String>,
    pub shell_env: BTreeMap<String, String>,
    pub path: Option<String>,
    pub path_behavior: PathBehavior,
    pub shell: String,
    pub use_shell: bool,
    pub shell_escape: bool,
    pub sudo_prefix: String,
    pub sudo_user: Option<String>,
    pub sudo_group: Option<String>,
    pub sudo_prompt: String,
    pub again_prompt: String,
    pub prompts: Vec<(String, String)>,
    pub prompt_match: PromptMatch,
    pub always_use_pty: bool,
    pub combine_stderr: bool,
    pub command_timeout: Option<Duration>,
    pub remote_interrupt: bool,
    pub echo_stdin: bool,
    pub ok_ret_codes: Vec<i32>,

    // policy
    pub warn_only: bool,
    pub skip_bad_hosts: bool,

    // output
    pub output: OutputGroups,
    pub output_prefix: bool,
    pub linewise: bool,

    // dispatch
    pub hosts: Vec<String>,
    pub roles: Vec<String>,
    pub exclude_hosts: Vec<String>,
    pub roledefs: Roledefs,
    pub dedupe_hosts: bool,
    pub parallel: bool,
    pub pool_size: usize,
    pub eagerly_disconnect: bool,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            user: local_user(),
            port: DEFAULT_PORT,
            key_filenames: Vec::new(),
            no_agent: false,
            no_keys: false,
            disable_known_hosts: false,
            reject_unknown_hosts: false,
            timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            connection_attempts: 1,
            auth_attempts: 3,
            retry_delay: None,
            keepalive: None,
            abort_on_prompts: false,

            cwd: String::new(),
            lcwd: String::new(),
            command_prefixes: Vec::new(),
            shell_env: BTreeMap::new(),
            path: None,
            path_behavior: PathBehavior::Append,
            shell: DEFAULT_SHELL.to_string(),
            use_shell: true,
            shell_escape: true,
            sudo_prefix: DEFAULT_SUDO_PREFIX.to_string(),
            sudo_user: None,
            sudo_group: None,
            sudo_prompt: DEFAULT_SUDO_PROMPT.to_string(),
            again_prompt: DEFAULT_AGAIN_PROMPT.to_string(),
            prompts: Vec::new(),
            prompt_match: PromptMatch::Suffix,
            always_use_pty: true,
            combine_stderr: true,
            command_timeout: None,
            remote_interrupt: false,
            echo_stdin: true,
            ok_ret_codes: vec![0],

            warn_only: false,
            skip_bad_hosts: false,

            output: OutputGroups::default(),
            output_prefix: true,
            linewise: false,

            hosts: Vec::new(),
            roles: Vec::new(),
            exclude_hosts: Vec::new(),
            roledefs: Roledefs::new(),
            dedupe_hosts: true,
            parallel: false,
            pool_size: 0,
            eagerly_disconnect: false,
        }
    }
}

impl ExecutionContext {
    /// Normalize a host string against this context's default user and port.
    pub fn host_spec(&self, host_string: &str) -> Result<HostSpec> {
        HostSpec::parse(host_string, &self.user, self.port)
    }

    /// Result-map key for a host: defaults stripped.
    pub fn display_key(&self, host: &HostSpec) -> String {
        host.denormalize(&self.user, self.port)
    }

    /// Delay between transient connection retries.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay.unwrap_or(self.timeout)
    }

    pub fn is_ok_return_code(&self, code: i32) -> bool {
        self.ok_ret_codes.contains(&code)
    }

    pub(crate) fn joined_cwd(current: &str, path: &str) -> String {
        let path = path.replace(' ', "\\ ");
        if !current.is_empty() && !path.starts_with('/') && !path.starts_with('~') {
            format!("{current}/{path}")
        } else {
            path
        }
    }
}
