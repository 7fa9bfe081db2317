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

//! What a task sees while it runs on one host.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthNegotiator;
use crate::context::{ContextScope, ExecutionContext};
use crate::error::{Error, Result};
use crate::executor::wrap::{wrap_local, wrap_remote};
use crate::executor::{
    CommandResult, ExecOptions, ExecOutput, ExecRequest, OutputSink, RemoteCommandExecutor,
    Stream, SudoResponder,
};
use crate::host::HostSpec;
use crate::ssh::{ConnectionRegistry, Session};
use crate::utils::interrupt::Interrupts;

const LOCAL_SHELL: &str = "/bin/sh";

/// Per-call tweaks for [`HostContext::run_with`] and [`HostContext::sudo_with`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    /// Skip the `/bin/bash -l -c "..."` wrapping.
    pub no_shell: bool,
    pub pty: Option<bool>,
    pub combine_stderr: Option<bool>,
    /// Hide all output and treat non-zero exits as warnings.
    pub quiet: bool,
    pub warn_only: Option<bool>,
    pub timeout: Option<Duration>,
    pub shell_escape: Option<bool>,
    /// `sudo -u`; falls back to the context's `sudo_user`.
    pub user: Option<String>,
    /// `sudo -g`; falls back to the context's `sudo_group`.
    pub group: Option<String>,
}

impl RunOptions {
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Default::default()
        }
    }

    pub fn warn_only() -> Self {
        Self {
            warn_only: Some(true),
            ..Default::default()
        }
    }

    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Default::default()
        }
    }

    fn apply(&self, ctx: &mut ExecutionContext) {
        if self.quiet {
            let output = &mut ctx.output;
            output.warnings = false;
            output.running = false;
            output.stdout = false;
            output.stderr = false;
            ctx.warn_only = true;
        }
        if let Some(warn_only) = self.warn_only {
            ctx.warn_only = warn_only;
        }
        if let Some(escape) = self.shell_escape {
            ctx.shell_escape = escape;
        }
        if let Some(pty) = self.pty {
            ctx.always_use_pty = pty;
        }
        if let Some(combine) = self.combine_stderr {
            ctx.combine_stderr = combine;
        }
        if self.timeout.is_some() {
            ctx.command_timeout = self.timeout;
        }
    }
}

pub struct HostContext {
    host: Option<HostSpec>,
    display: String,
    context: ExecutionContext,
    registry: Arc<ConnectionRegistry>,
    negotiator: AuthNegotiator,
    sink: Arc<dyn OutputSink>,
    interrupts: Option<Interrupts>,
}

impl HostContext {
    pub fn new(
        host: Option<HostSpec>,
        context: ExecutionContext,
        registry: Arc<ConnectionRegistry>,
        negotiator: AuthNegotiator,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let display = host
            .as_ref()
            .map(|h| context.display_key(h))
            .unwrap_or_default();
        Self {
            host,
            display,
            context,
            registry,
            negotiator,
            sink,
            interrupts: None,
        }
    }

    /// Ctrl-C ends connects, prompts and commands with `Error::Interrupted`.
    pub fn with_interrupts(mut self, interrupts: Interrupts) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    fn check_interrupted(&self) -> Result<()> {
        self.interrupts.as_ref().map_or(Ok(()), Interrupts::check)
    }

    async fn interruptible<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match &self.interrupts {
            Some(interrupts) => interrupts.guard(future).await,
            None => future.await,
        }
    }

    /// The host this context is bound to, if any.
    pub fn host(&self) -> Option<&HostSpec> {
        self.host.as_ref()
    }

    /// Host string with default user and port stripped; empty when local-only.
    pub fn host_string(&self) -> &str {
        &self.display
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    fn status(&self, text: &str) {
        if let Err(e) = self.sink.line(Stream::Stdout, text) {
            tracing::debug!("failed to write status line: {e}");
        }
    }

    async fn session(&self) -> Result<(HostSpec, Arc<dyn Session>)> {
        let host = self.host.clone().ok_or(Error::NoHosts)?;
        let session = self
            .interruptible(self.registry.get_or_connect(&host, &self.negotiator, &self.context))
            .await?;
        Ok((host, session))
    }

    pub async fn run(&mut self, command: &str) -> Result<CommandResult> {
        self.run_with(command, RunOptions::default()).await
    }

    pub async fn run_with(&mut self, command: &str, options: RunOptions) -> Result<CommandResult> {
        self.run_command("run", command, options, false).await
    }

    pub async fn sudo(&mut self, command: &str) -> Result<CommandResult> {
        self.sudo_with(command, RunOptions::default()).await
    }

    pub async fn sudo_with(&mut self, command: &str, options: RunOptions) -> Result<CommandResult> {
        self.run_command("sudo", command, options, true).await
    }

    fn sudo_responder(&self, ctx: &ExecutionContext, host: &HostSpec) -> SudoResponder {
        SudoResponder {
            prompt: ctx.sudo_prompt.clone(),
            again_prompt: ctx.again_prompt.clone(),
            host: self.display.clone(),
            key: host.key(),
            passwords: self.negotiator.passwords().clone(),
            prompter: self.negotiator.prompter(),
            abort_on_prompts: ctx.abort_on_prompts,
        }
    }

    /// Runs `request`, reopening the connection once if the cached session
    /// turned out to be dead.
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut executor = RemoteCommandExecutor::new(self.sink.clone());
        if let Some(interrupts) = &self.interrupts {
            executor = executor.with_interrupts(interrupts.clone());
        }
        let (host, session) = self.session().await?;
        match executor.execute(session.as_ref(), request.clone()).await {
            Err(Error::Channel(message)) if session.is_closed() => {
                tracing::debug!("[{}] session closed ({message}); reconnecting", self.display);
                self.registry.invalidate(&host.key()).await;
                let (_, session) = self.session().await?;
                executor.execute(session.as_ref(), request).await
            }
            other => other,
        }
    }

    async fn run_command(
        &mut self,
        which: &'static str,
        command: &str,
        options: RunOptions,
        sudo: bool,
    ) -> Result<CommandResult> {
        let host = self.host.clone().ok_or(Error::NoHosts)?;
        self.check_interrupted()?;
        let mut ctx = self.context.clone();
        options.apply(&mut ctx);

        let sudo_target = sudo.then(|| {
            (
                options.user.as_deref().or(ctx.sudo_user.as_deref()),
                options.group.as_deref().or(ctx.sudo_group.as_deref()),
            )
        });
        let real_command = wrap_remote(command, &ctx, !options.no_shell, sudo_target);

        if ctx.output.debug {
            self.status(&format!("[{}] {which}: {real_command}", self.display));
        } else if ctx.output.running {
            self.status(&format!("[{}] {which}: {command}", self.display));
        }

        let request = ExecRequest {
            host: self.display.clone(),
            command: real_command.clone(),
            options: ExecOptions::from_context(&ctx),
            prompts: ctx.prompts.clone(),
            prompt_match: ctx.prompt_match,
            sudo: Some(self.sudo_responder(&ctx, &host)),
        };
        let output = self.execute(request).await?;

        let return_code = output.return_code();
        let failed = !ctx.is_ok_return_code(return_code);
        let result = CommandResult {
            command: command.to_string(),
            real_command: real_command.clone(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            return_code,
            failed,
        };

        if failed {
            if !ctx.warn_only {
                return Err(Error::CommandFailed {
                    host: self.display.clone(),
                    which,
                    command: command.to_string(),
                    real_command,
                    return_code,
                });
            }
            if ctx.output.warnings {
                let _ = self.sink.line(
                    Stream::Stderr,
                    &format!(
                        "\nWarning: {which}() received nonzero return code {return_code} while executing '{command}'!\n"
                    ),
                );
            }
        }
        Ok(result)
    }

    /// Starts an interactive shell, optionally typing `command` into it.
    pub async fn open_shell(&mut self, command: Option<&str>) -> Result<()> {
        let host = self.host.clone().ok_or(Error::NoHosts)?;
        self.check_interrupted()?;
        let mut options = ExecOptions::from_context(&self.context);
        options.invoke_shell = true;
        options.pty = true;
        options.combine_stderr = true;
        options.forward_stdin = true;
        let request = ExecRequest {
            host: self.display.clone(),
            command: command.unwrap_or_default().to_string(),
            options,
            prompts: Vec::new(),
            prompt_match: self.context.prompt_match,
            sudo: Some(self.sudo_responder(&self.context, &host)),
        };
        self.execute(request).await.map(|_| ())
    }

    /// Runs `command` on the local machine through `/bin/sh`.
    ///
    /// With `capture` the output is returned instead of printed.
    pub async fn local(&mut self, command: &str, capture: bool) -> Result<CommandResult> {
        self.check_interrupted()?;
        let ctx = &self.context;
        let real_command = wrap_local(command, ctx);
        if ctx.output.debug {
            self.status(&format!("[localhost] local: {real_command}"));
        } else if ctx.output.running {
            self.status(&format!("[localhost] local: {command}"));
        }

        let mut process = tokio::process::Command::new(LOCAL_SHELL);
        process.arg("-c").arg(&real_command).kill_on_drop(true);
        let (stdout, stderr, status) = if capture {
            process.stdin(Stdio::null());
            let output = self
                .interruptible(async { process.output().await.map_err(Error::from) })
                .await?;
            (output.stdout, output.stderr, output.status)
        } else {
            if !ctx.output.stdout {
                process.stdout(Stdio::null());
            }
            if !ctx.output.stderr {
                process.stderr(Stdio::null());
            }
            let status = self
                .interruptible(async { process.status().await.map_err(Error::from) })
                .await?;
            (Vec::new(), Vec::new(), status)
        };

        let return_code = status.code().unwrap_or(crate::executor::UNKNOWN_EXIT_STATUS);
        let failed = !ctx.is_ok_return_code(return_code);
        if failed && !ctx.warn_only {
            return Err(Error::CommandFailed {
                host: "localhost".to_string(),
                which: "local",
                command: command.to_string(),
                real_command,
                return_code,
            });
        }
        if failed && ctx.output.warnings {
            let _ = self.sink.line(
                Stream::Stderr,
                &format!(
                    "\nWarning: local() encountered an error (return code {return_code}) while executing '{command}'\n"
                ),
            );
        }

        Ok(CommandResult {
            command: command.to_string(),
            real_command,
            stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            return_code,
            failed,
        })
    }

    /// Closes this host's connection. The next command reconnects.
    pub async fn disconnect(&mut self) -> Result<()> {
        match &self.host {
            Some(host) => self.registry.disconnect(&host.key()).await,
            None => Ok(()),
        }
    }
}

impl ContextScope for HostContext {
    fn context(&self) -> &ExecutionContext {
        &self.context
    }

    fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("host", &self.host)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Password, PasswordCache, ScriptedPrompter};
    use crate::context::OutputGroups;
    use crate::executor::BufferSink;
    use crate::ssh::mock::{shell_payload, MockConnector, Script};

    struct Fixture {
        connector: Arc<MockConnector>,
        sink: Arc<BufferSink>,
        passwords: PasswordCache,
        ctx: HostContext,
    }

    fn fixture(connector: MockConnector) -> Fixture {
        let connector = Arc::new(connector);
        let sink = Arc::new(BufferSink::new());
        let passwords = PasswordCache::new();
        let negotiator = AuthNegotiator::new(
            connector.clone(),
            Arc::new(ScriptedPrompter::default()),
            passwords.clone(),
        );
        let context = ExecutionContext {
            user: "deploy".to_string(),
            always_use_pty: false,
            ..Default::default()
        };
        let host = context.host_spec("web1").unwrap();
        let ctx = HostContext::new(
            Some(host),
            context,
            Arc::new(ConnectionRegistry::new()),
            negotiator,
            sink.clone(),
        );
        Fixture {
            connector,
            sink,
            passwords,
            ctx,
        }
    }

    #[tokio::test]
    async fn test_run_prints_and_trims() {
        let mut f = fixture(MockConnector::new());
        let result = f.ctx.run("echo hi").await.unwrap();
        assert_eq!(result.stdout, "hi");
        assert_eq!(result.real_command, "/bin/bash -l -c \"echo hi\"");
        assert!(result.succeeded());
        let shown = f.sink.stdout();
        assert!(shown.starts_with("[web1] run: echo hi\n"));
        assert!(shown.contains("[web1] out: hi\n"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_unless_warn_only() {
        let connector = MockConnector::new().with_responder(|_| Script::new().stderr("nope\n").exit(2));
        let mut f = fixture(connector);

        let err = f.ctx.run("false").await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { return_code: 2, .. }));

        let result = f.ctx.run_with("false", RunOptions::warn_only()).await.unwrap();
        assert!(result.failed);
        assert_eq!(result.return_code, 2);
        assert!(f.sink.stderr().contains("Warning: run() received nonzero return code 2"));
    }

    #[tokio::test]
    async fn test_ok_ret_codes() {
        let connector = MockConnector::new().with_responder(|_| Script::new().exit(1));
        let mut f = fixture(connector);
        f.ctx.context_mut().ok_ret_codes = vec![0, 1];
        assert!(f.ctx.run("grep -q x file").await.unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_quiet_hides_everything() {
        let connector = MockConnector::new().with_responder(|_| Script::new().stdout("noise\n").exit(1));
        let mut f = fixture(connector);
        let result = f.ctx.run_with("noisy", RunOptions::quiet()).await.unwrap();
        assert_eq!(result.stdout, "noise");
        assert_eq!(f.sink.stdout(), "");
        assert_eq!(f.sink.stderr(), "");
    }

    #[tokio::test]
    async fn test_cd_scope_applies_and_reverts() {
        let mut f = fixture(MockConnector::new());
        {
            let mut scoped = f.ctx.cd("/srv/app");
            scoped.run("echo in").await.unwrap();
        }
        f.ctx.run("echo out").await.unwrap();

        let commands = f.connector.commands();
        assert_eq!(shell_payload(&commands[0].1), "cd /srv/app >/dev/null && echo in");
        assert_eq!(shell_payload(&commands[1].1), "echo out");
        assert_eq!(f.connector.total_connects(), 1);
    }

    #[tokio::test]
    async fn test_sudo_answers_prompt_from_cache() {
        let connector = MockConnector::new().with_responder(|command| {
            assert!(command.starts_with("sudo -S -p 'sudo password:' -u \"postgres\""));
            Script::new()
                .stderr("sudo password:")
                .expect("letmein\n")
                .stdout("postgres\n")
                .exit(0)
        });
        let mut f = fixture(connector);
        f.passwords.set("deploy@web1:22", Password::new("letmein"));

        let result = f.ctx.sudo_with("whoami", RunOptions::user("postgres")).await.unwrap();
        assert_eq!(result.stdout, "postgres");
        assert_eq!(f.connector.input("deploy@web1:22"), b"letmein\n");
    }

    #[tokio::test]
    async fn test_dead_session_is_reopened_once() {
        let mut f = fixture(MockConnector::new());
        f.ctx.run("echo one").await.unwrap();
        let (_, session) = f.ctx.session().await.unwrap();
        session.disconnect().await.unwrap();

        f.ctx.run("echo two").await.unwrap();
        assert_eq!(f.connector.total_connects(), 2);
    }

    #[tokio::test]
    async fn test_no_host_means_no_remote_commands() {
        let f = fixture(MockConnector::new());
        let mut local = HostContext::new(
            None,
            ExecutionContext::default(),
            Arc::new(ConnectionRegistry::new()),
            AuthNegotiator::new(
                f.connector.clone(),
                Arc::new(ScriptedPrompter::default()),
                PasswordCache::new(),
            ),
            f.sink.clone(),
        );
        assert!(matches!(local.run("ls").await, Err(Error::NoHosts)));
        assert_eq!(local.host_string(), "");
    }

    #[tokio::test]
    async fn test_local_capture() {
        let mut f = fixture(MockConnector::new());
        f.ctx.context_mut().output = OutputGroups::default().hidden(&["running"]).unwrap();
        let result = f.ctx.local("echo local-ok", true).await.unwrap();
        assert_eq!(result.stdout, "local-ok");
        assert_eq!(result.return_code, 0);

        let err = f.ctx.local("exit 3", true).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { which: "local", return_code: 3, .. }));
    }
}
