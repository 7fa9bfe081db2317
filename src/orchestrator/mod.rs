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

//! Running a task across its resolved hosts.
//!
//! Serial runs share this orchestrator's connection registry and password
//! cache. Parallel runs hand every host job its own registry, a snapshot of
//! the password cache and a private copy of the context, so nothing a job
//! learns or changes leaks into its siblings.
//!
//! Creating an orchestrator installs the process-wide Ctrl-C handler. A press
//! at any point afterwards, including during a connect or between hosts,
//! aborts the current run.

mod context;
mod hosts;
mod results;
mod task;

use futures::FutureExt;
use owo_colors::OwoColorize;
use std::sync::Arc;
use tracing::{debug, info};

pub use context::{HostContext, RunOptions};
pub use hosts::{resolve_hosts, HostSelection};
pub use results::{ExecutionResults, LOCAL_ONLY};
pub use task::{task_fn, FnTask, Task, TaskArgs, TaskMetadata, TaskValue};

use crate::auth::{AuthNegotiator, PasswordCache, Prompter, TerminalPrompter};
use crate::context::{ContextScope, ExecutionContext};
use crate::error::{Error, Result};
use crate::executor::{OutputSink, Stream, TerminalSink};
use crate::host::HostSpec;
use crate::scheduler::HostScheduler;
use crate::ssh::{ConnectionRegistry, Connector};
use crate::utils::interrupt::{self, Interrupts};

pub struct Orchestrator {
    context: ExecutionContext,
    connector: Arc<dyn Connector>,
    prompter: Arc<dyn Prompter>,
    passwords: PasswordCache,
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn OutputSink>,
    interrupts: Interrupts,
}

impl Orchestrator {
    pub fn new(context: ExecutionContext, connector: Arc<dyn Connector>) -> Self {
        Self {
            context,
            connector,
            prompter: Arc::new(TerminalPrompter),
            passwords: PasswordCache::new(),
            registry: Arc::new(ConnectionRegistry::new()),
            sink: Arc::new(TerminalSink),
            interrupts: interrupt::subscribe(),
        }
    }

    /// Replaces the process-wide Ctrl-C feed.
    pub fn with_interrupts(mut self, interrupts: Interrupts) -> Self {
        self.interrupts = interrupts;
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

    pub fn with_passwords(mut self, passwords: PasswordCache) -> Self {
        self.passwords = passwords;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn passwords(&self) -> &PasswordCache {
        &self.passwords
    }

    fn negotiator(&self) -> AuthNegotiator {
        AuthNegotiator::new(self.connector.clone(), self.prompter.clone(), self.passwords.clone())
    }

    fn host_context(
        &self,
        host: Option<HostSpec>,
        context: ExecutionContext,
        registry: Arc<ConnectionRegistry>,
        negotiator: AuthNegotiator,
    ) -> HostContext {
        HostContext::new(host, context, registry, negotiator, self.sink.clone())
            .with_interrupts(self.interrupts.clone())
    }

    fn announce(&self, display: &str, task: &str) {
        if self.context.output.running && !task.is_empty() {
            let _ = self
                .sink
                .line(Stream::Stdout, &format!("[{display}] Executing task '{task}'"));
        }
    }

    /// Whether the failure policy lets a serial run continue past `error`.
    fn tolerates(&self, error: &Error) -> bool {
        if error.is_interrupt() {
            false
        } else if error.is_network() {
            self.context.skip_bad_hosts
        } else {
            self.context.warn_only
        }
    }

    /// A parallel job's failure stays in its host slot when either
    /// `skip_bad_hosts` or `warn_only` is set.
    fn tolerates_job(&self, error: &Error) -> bool {
        !error.is_interrupt() && (self.context.skip_bad_hosts || self.context.warn_only)
    }

    fn record(&self, results: &mut ExecutionResults, host: &str, error: Error) {
        self.warn(&error);
        results.push(host, Err(error));
    }

    fn warn(&self, error: &Error) {
        if self.context.output.warnings {
            let _ = self
                .sink
                .line(Stream::Stderr, &format!("\n{} {error}\n", "Warning:".yellow()));
        }
    }

    fn abort(&self, host: &str, error: Error) -> Error {
        if self.context.output.aborts {
            let _ = self.sink.line(
                Stream::Stderr,
                &format!("\n{} {error}\n\n{}", "Fatal error:".red().bold(), "Aborting.".red()),
            );
        }
        Error::Aborted {
            host: host.to_string(),
            source: Box::new(error),
        }
    }

    /// Records `result` under `host`, or turns it into the run's abort.
    fn settle(
        &self,
        results: &mut ExecutionResults,
        host: &str,
        result: Result<TaskValue>,
    ) -> Result<()> {
        match result {
            Ok(value) => results.push(host, Ok(value)),
            Err(error) if self.tolerates(&error) => self.record(results, host, error),
            Err(error) => return Err(self.abort(host, error)),
        }
        Ok(())
    }

    /// Runs `task` on every host it resolves to.
    ///
    /// Returns `Error::Aborted` when a host failure is not tolerated by
    /// `skip_bad_hosts`/`warn_only`. Interrupts always abort.
    pub async fn execute(
        &self,
        task: Arc<dyn Task>,
        call: HostSelection,
        args: TaskArgs,
    ) -> Result<ExecutionResults> {
        self.interrupts.check()?;
        let meta = task.metadata().clone();
        let hosts = resolve_hosts(&call, &meta, &self.context)?;

        if hosts.is_empty() {
            return self.run_local_only(task, args).await;
        }

        let parallel = meta.parallel || (self.context.parallel && !meta.serial);
        debug!(
            "Executing '{}' on {} host(s), {}",
            meta.name,
            hosts.len(),
            if parallel { "parallel" } else { "serial" }
        );
        if parallel {
            let pool = meta
                .pool_size
                .or((self.context.pool_size > 0).then_some(self.context.pool_size))
                .unwrap_or(hosts.len())
                .min(hosts.len());
            self.run_parallel(task, hosts, args, pool).await
        } else {
            self.run_serial(task, hosts, args).await
        }
    }

    async fn run_local_only(&self, task: Arc<dyn Task>, args: TaskArgs) -> Result<ExecutionResults> {
        let mut host_ctx =
            self.host_context(None, self.context.clone(), self.registry.clone(), self.negotiator());
        let result = task.run(&mut host_ctx, &args).await;
        let mut results = ExecutionResults::new();
        self.settle(&mut results, LOCAL_ONLY, result)?;
        Ok(results)
    }

    async fn run_serial(
        &self,
        task: Arc<dyn Task>,
        hosts: Vec<HostSpec>,
        args: TaskArgs,
    ) -> Result<ExecutionResults> {
        let negotiator = self.negotiator();
        let mut results = ExecutionResults::new();
        let name = task.metadata().name.clone();

        for host in hosts {
            let display = self.context.display_key(&host);
            self.announce(&display, &name);
            let key = host.key();
            let result = if self.interrupts.pending() {
                Err(Error::Interrupted)
            } else {
                let mut host_ctx = self.host_context(
                    Some(host),
                    self.context.clone(),
                    self.registry.clone(),
                    negotiator.clone(),
                );
                task.run(&mut host_ctx, &args).await
            };
            if self.context.eagerly_disconnect {
                if let Err(e) = self.registry.disconnect(&key).await {
                    debug!("Error while disconnecting from {key}: {e}");
                }
            }
            self.settle(&mut results, &display, result)?;
        }
        Ok(results)
    }

    async fn run_parallel(
        &self,
        task: Arc<dyn Task>,
        hosts: Vec<HostSpec>,
        args: TaskArgs,
        pool: usize,
    ) -> Result<ExecutionResults> {
        let negotiator = self.negotiator();
        let mut scheduler = HostScheduler::new(pool).with_interrupts(self.interrupts.clone());
        let name = task.metadata().name.clone();

        for host in hosts {
            let display = self.context.display_key(&host);
            let task = task.clone();
            let args = args.clone();
            let sink = self.sink.clone();
            let mut context = self.context.clone();
            context.parallel = true;
            let running = context.output.running;
            let registry = Arc::new(ConnectionRegistry::new());
            let mut host_ctx =
                self.host_context(Some(host), context, registry.clone(), negotiator.isolated());
            let name = name.clone();
            let label = display.clone();

            scheduler.submit(
                display,
                async move {
                    if running && !name.is_empty() {
                        let _ = sink.line(Stream::Stdout, &format!("[{label}] Executing task '{name}'"));
                    }
                    let result = task.run(&mut host_ctx, &args).await;
                    registry.disconnect_all().await;
                    result
                }
                .boxed(),
            );
        }
        scheduler.close();
        let outcomes = scheduler.run().await?;

        let mut results = ExecutionResults::new();
        let mut aborted = None;
        for (host, outcome) in outcomes {
            match outcome.result {
                Ok(value) => results.push(&host, Ok(value)),
                Err(error) if self.tolerates_job(&error) => self.record(&mut results, &host, error),
                Err(error) if aborted.is_none() => aborted = Some((host, error)),
                Err(error) => debug!("Additional failure on {host}: {error}"),
            }
        }
        match aborted {
            Some((host, error)) => Err(self.abort(&host, error)),
            None => Ok(results),
        }
    }

    /// Closes every session this orchestrator opened, printing one line per host.
    pub async fn disconnect_all(&self) -> Vec<String> {
        let keys = self.registry.disconnect_all().await;
        for key in &keys {
            let shown = HostSpec::parse(key, &self.context.user, self.context.port)
                .map(|host| self.context.display_key(&host))
                .unwrap_or_else(|_| key.clone());
            info!("Disconnected from {shown}");
            if self.context.output.status {
                let _ = self
                    .sink
                    .line(Stream::Stdout, &format!("Disconnecting from {shown}... done."));
            }
        }
        keys
    }
}

impl ContextScope for Orchestrator {
    fn context(&self) -> &ExecutionContext {
        &self.context
    }

    fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }
}
