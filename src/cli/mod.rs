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

//! CLI module for fanout
//!
//! - `args.rs` - clap parser and the flag-to-context layering
//! - `invocation.rs` - `name:arg,key=value` task strings
//! - `builtins.rs` - the `run`, `sudo` and `shell` tasks
//!
//! [`CliRunner`] ties them together: configuration file, then flags, then
//! one orchestrated execution per task string.

mod args;
pub mod builtins;
pub mod invocation;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::sync::Arc;

pub use args::Cli;
pub use builtins::{builtin_task, resolve_tasks, BUILTIN_TASKS};
pub use invocation::{parse_invocation, parse_invocations, Invocation};

use crate::auth::{request_password, Password, PasswordCache, Prompter, TerminalPrompter};
use crate::config::Config;
use crate::context::{ContextScope, ExecutionContext};
use crate::error::Error;
use crate::executor::{OutputSink, Stream, TerminalSink};
use crate::orchestrator::Orchestrator;
use crate::ssh::{Connector, RusshConnector};

/// Runs a parsed command line to completion and returns the exit code.
pub struct CliRunner {
    connector: Arc<dyn Connector>,
    prompter: Arc<dyn Prompter>,
    sink: Arc<dyn OutputSink>,
}

impl Default for CliRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CliRunner {
    pub fn new() -> Self {
        Self {
            connector: Arc::new(RusshConnector),
            prompter: Arc::new(TerminalPrompter),
            sink: Arc::new(TerminalSink),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Builds the execution context: built-in defaults, then the config
    /// file, then command-line flags.
    pub async fn build_context(&self, cli: &Cli) -> Result<ExecutionContext> {
        let config = Config::load_with_priority(cli.config.as_deref())
            .await
            .context("Failed to load configuration")?;
        let mut ctx = ExecutionContext::default();
        config.apply_to(&mut ctx);
        cli.apply_to(&mut ctx).context("Invalid command-line option")?;
        Ok(ctx)
    }

    async fn initial_passwords(&self, cli: &Cli, ctx: &ExecutionContext) -> Result<PasswordCache> {
        if cli.initial_password_prompt {
            let prompter = self.prompter.clone();
            let abort_on_prompts = ctx.abort_on_prompts;
            let password = tokio::task::spawn_blocking(move || {
                request_password(
                    prompter.as_ref(),
                    "Initial value for the default password: ",
                    "*",
                    abort_on_prompts,
                )
            })
            .await
            .context("Password prompt task failed")??;
            return Ok(PasswordCache::with_default(password));
        }
        Ok(match Password::from_env()? {
            Some(password) => PasswordCache::with_default(password),
            None => PasswordCache::new(),
        })
    }

    fn fatal(&self, error: &Error) {
        let _ = self.sink.line(
            Stream::Stderr,
            &format!("\n{} {error}\n\n{}", "Fatal error:".red().bold(), "Aborting.".red()),
        );
    }

    pub async fn run(&self, cli: &Cli) -> Result<i32> {
        let ctx = self.build_context(cli).await?;

        let mut invocations = parse_invocations(&cli.tasks)?;
        if let Some(command) = cli.adhoc_command() {
            invocations.push(Invocation::run(command));
        }
        if invocations.is_empty() {
            anyhow::bail!("No tasks or command given. Try 'fanout --help'.");
        }
        let tasks = match resolve_tasks(&invocations) {
            Ok(tasks) => tasks,
            Err(e) => {
                if ctx.output.aborts {
                    self.fatal(&e);
                }
                return Ok(1);
            }
        };

        let passwords = self.initial_passwords(cli, &ctx).await?;
        let orchestrator = Orchestrator::new(ctx, self.connector.clone())
            .with_prompter(self.prompter.clone())
            .with_sink(self.sink.clone())
            .with_passwords(passwords);

        let mut exit_code = 0;
        for (invocation, task) in invocations.into_iter().zip(tasks) {
            tracing::debug!("Running task '{}'", invocation.name);
            match orchestrator
                .execute(task, invocation.selection, invocation.args)
                .await
            {
                Ok(results) => exit_code = exit_code.max(results.exit_code()),
                Err(e) => {
                    // Aborted errors were already reported by the orchestrator.
                    if !matches!(e, Error::Aborted { .. }) && orchestrator.context().output.aborts {
                        self.fatal(&e);
                    }
                    exit_code = 1;
                    break;
                }
            }
        }

        if exit_code == 0 && orchestrator.context().output.status {
            let _ = self.sink.line(Stream::Stdout, "\nDone.");
        }
        orchestrator.disconnect_all().await;
        Ok(exit_code)
    }
}
