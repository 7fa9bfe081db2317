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

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::expand_tilde;
use crate::context::ExecutionContext;
use crate::error::Result;

#[derive(Parser, Debug, Default)]
#[command(
    name = "fanout",
    version,
    about = "Run commands and tasks over SSH on many hosts at once",
    long_about = "fanout runs shell commands and built-in tasks on one or more remote hosts,\nserially or in parallel, relaying each host's output with a [host] prefix.\nIt answers sudo and configured prompts automatically and caches passwords per host.",
    after_help = "EXAMPLES:\n  Ad-hoc command:             fanout -H web1,web2 -- uptime\n  Parallel, pool of 5:        fanout -P -z 5 -R web -- 'df -h'\n  sudo as another user:       fanout -H db1 'sudo:whoami,user=postgres'\n  Per-task hosts:             fanout 'run:hostname,hosts=a;b'\n  Interactive shell:          fanout -H web1 shell\n\nExit codes: 0 (all hosts succeeded), 1 (any failure or abort)"
)]
pub struct Cli {
    #[arg(
        short = 'H',
        long,
        value_delimiter = ',',
        help = "Comma-separated list of hosts in [user@]hostname[:port] format"
    )]
    pub hosts: Vec<String>,

    #[arg(short = 'R', long, value_delimiter = ',', help = "Comma-separated list of roles")]
    pub roles: Vec<String>,

    #[arg(short = 'x', long, value_delimiter = ',', help = "Comma-separated list of hosts to exclude")]
    pub exclude_hosts: Vec<String>,

    #[arg(short = 'u', long, help = "Default username for SSH connections")]
    pub user: Option<String>,

    #[arg(long, help = "Default SSH port")]
    pub port: Option<u16>,

    #[arg(short = 'i', help = "SSH private key file (repeatable)")]
    pub identity: Vec<PathBuf>,

    #[arg(short = 'a', long, help = "Don't use the SSH agent")]
    pub no_agent: bool,

    #[arg(short = 'k', long, help = "Don't load private keys from ~/.ssh/")]
    pub no_keys: bool,

    #[arg(short = 'I', long, help = "Prompt for a default password before connecting")]
    pub initial_password_prompt: bool,

    #[arg(short = 'P', long, help = "Run tasks in parallel by default")]
    pub parallel: bool,

    #[arg(short = 'z', long, help = "Number of concurrent hosts in parallel mode")]
    pub pool_size: Option<usize>,

    #[arg(long, help = "Skip over hosts that can't be reached")]
    pub skip_bad_hosts: bool,

    #[arg(short = 'w', long, help = "Warn, instead of abort, when commands fail")]
    pub warn_only: bool,

    #[arg(short = 't', long, help = "Connect timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(
        short = 'T',
        long,
        help = "Seconds of silence after which a remote command is timed out (0 for unlimited)"
    )]
    pub command_timeout: Option<u64>,

    #[arg(short = 'n', long, help = "Number of times to attempt each connection")]
    pub connection_attempts: Option<u32>,

    #[arg(long, help = "Abort instead of prompting (for passwords, sudo, etc.)")]
    pub abort_on_prompts: bool,

    #[arg(long, help = "Print output line by line instead of byte by byte")]
    pub linewise: bool,

    #[arg(long, help = "Don't request a remote pseudo-terminal")]
    pub no_pty: bool,

    #[arg(long, help = "Don't load ~/.ssh/known_hosts")]
    pub disable_known_hosts: bool,

    #[arg(long, help = "Reject hosts whose key is not in known_hosts")]
    pub reject_unknown_hosts: bool,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Comma-separated output groups to hide (status, aborts, warnings, running, stdout, stderr, user, debug, everything, output, commands)"
    )]
    pub hide: Vec<String>,

    #[arg(long, value_delimiter = ',', help = "Comma-separated output groups to show")]
    pub show: Vec<String>,

    #[arg(long, help = "Don't prefix output lines with [host]")]
    pub no_output_prefix: bool,

    #[arg(
        short = 'F',
        long,
        help = "Configuration file path\nWithout it, ./fanout.yaml and then the per-user config directory are tried"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'v',
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    #[arg(help = "Tasks to run: name[:arg,key=value,host=h,hosts=a;b,role=r,...]")]
    pub tasks: Vec<String>,

    #[arg(last = true, help = "Ad-hoc command to run on every host")]
    pub command: Vec<String>,
}

impl Cli {
    /// The command given after `--`, if any.
    pub fn adhoc_command(&self) -> Option<String> {
        (!self.command.is_empty()).then(|| self.command.join(" "))
    }

    /// Layer command-line flags over `ctx`. Flags that were not given leave
    /// the configured value in place.
    pub fn apply_to(&self, ctx: &mut ExecutionContext) -> Result<()> {
        if !self.hosts.is_empty() {
            ctx.hosts = self.hosts.clone();
        }
        if !self.roles.is_empty() {
            ctx.roles = self.roles.clone();
        }
        ctx.exclude_hosts.extend(self.exclude_hosts.iter().cloned());
        if let Some(user) = &self.user {
            ctx.user = user.clone();
        }
        if let Some(port) = self.port {
            ctx.port = port;
        }
        ctx.key_filenames
            .extend(self.identity.iter().map(|p| expand_tilde(p)));

        ctx.no_agent |= self.no_agent;
        ctx.no_keys |= self.no_keys;
        ctx.parallel |= self.parallel;
        ctx.skip_bad_hosts |= self.skip_bad_hosts;
        ctx.warn_only |= self.warn_only;
        ctx.abort_on_prompts |= self.abort_on_prompts;
        ctx.linewise |= self.linewise;
        ctx.disable_known_hosts |= self.disable_known_hosts;
        ctx.reject_unknown_hosts |= self.reject_unknown_hosts;
        if self.no_pty {
            ctx.always_use_pty = false;
        }
        if self.no_output_prefix {
            ctx.output_prefix = false;
        }

        if let Some(pool_size) = self.pool_size {
            ctx.pool_size = pool_size;
        }
        if let Some(secs) = self.timeout {
            ctx.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.command_timeout {
            ctx.command_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(attempts) = self.connection_attempts {
            ctx.connection_attempts = attempts.max(1);
        }

        ctx.output.set(&self.hide[..], false)?;
        ctx.output.set(&self.show[..], true)?;
        Ok(())
    }
}
