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

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::time::Duration;

use super::{ExecutionContext, OutputGroups, PathBehavior, PromptMatch, Roledefs};
use crate::error::Result;

macro_rules! overrides {
    ($($field:ident: $ty:ty),* $(,)?) => {
        /// A partial [`ExecutionContext`]: every `Some` field replaces the
        /// context value while a [`Scoped`] guard is alive.
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct Overrides {
            $(pub $field: Option<$ty>,)*
        }

        impl Overrides {
            $(
                pub fn $field(mut self, value: impl Into<$ty>) -> Self {
                    self.$field = Some(value.into());
                    self
                }
            )*

            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }

            /// Writes every set field into `ctx` and returns the replaced values.
            fn apply_to(&self, ctx: &mut ExecutionContext) -> Overrides {
                let mut previous = Overrides::default();
                $(
                    if let Some(value) = &self.$field {
                        previous.$field = Some(std::mem::replace(&mut ctx.$field, value.clone()));
                    }
                )*
                previous
            }

            /// Puts `previous` back. With `clean`, a field that was changed
            /// again inside the scope keeps its newer value.
            fn restore(&self, ctx: &mut ExecutionContext, previous: &Overrides, clean: bool) {
                $(
                    if let (Some(old), Some(set)) = (&previous.$field, &self.$field) {
                        if !clean || ctx.$field == *set {
                            ctx.$field = old.clone();
                        }
                    }
                )*
            }
        }
    };
}

overrides! {
    user: String,
    port: u16,
    key_filenames: Vec<PathBuf>,
    no_agent: bool,
    no_keys: bool,
    disable_known_hosts: bool,
    reject_unknown_hosts: bool,
    timeout: Duration,
    connection_attempts: u32,
    auth_attempts: u32,
    retry_delay: Option<Duration>,
    keepalive: Option<Duration>,
    abort_on_prompts: bool,
    cwd: String,
    lcwd: String,
    command_prefixes: Vec<String>,
    shell_env: BTreeMap<String, String>,
    path: Option<String>,
    path_behavior: PathBehavior,
    shell: String,
    use_shell: bool,
    shell_escape: bool,
    sudo_prefix: String,
    sudo_user: Option<String>,
    sudo_group: Option<String>,
    sudo_prompt: String,
    again_prompt: String,
    prompts: Vec<(String, String)>,
    prompt_match: PromptMatch,
    always_use_pty: bool,
    combine_stderr: bool,
    command_timeout: Option<Duration>,
    remote_interrupt: bool,
    echo_stdin: bool,
    ok_ret_codes: Vec<i32>,
    warn_only: bool,
    skip_bad_hosts: bool,
    output: OutputGroups,
    output_prefix: bool,
    linewise: bool,
    hosts: Vec<String>,
    roles: Vec<String>,
    exclude_hosts: Vec<String>,
    roledefs: Roledefs,
    dedupe_hosts: bool,
    parallel: bool,
    pool_size: usize,
    eagerly_disconnect: bool,
}

/// Anything that carries an [`ExecutionContext`] and can be scoped.
pub trait ContextScope {
    fn context(&self) -> &ExecutionContext;
    fn context_mut(&mut self) -> &mut ExecutionContext;

    fn with_overrides(&mut self, overrides: Overrides) -> Scoped<'_, Self>
    where
        Self: Sized,
    {
        Scoped::new(self, overrides, false)
    }

    /// Like [`with_overrides`](Self::with_overrides), but fields changed
    /// again inside the scope are not reverted.
    fn with_clean_overrides(&mut self, overrides: Overrides) -> Scoped<'_, Self>
    where
        Self: Sized,
    {
        Scoped::new(self, overrides, true)
    }

    /// Change the remote working directory. Relative paths nest.
    fn cd(&mut self, path: &str) -> Scoped<'_, Self>
    where
        Self: Sized,
    {
        let cwd = ExecutionContext::joined_cwd(&self.context().cwd, path);
        self.with_overrides(Overrides::default().cwd(cwd))
    }

    fn lcd(&mut self, path: &str) -> Scoped<'_, Self>
    where
        Self: Sized,
    {
        let lcwd = ExecutionContext::joined_cwd(&self.context().lcwd, path);
        self.with_overrides(Overrides::default().lcwd(lcwd))
    }

    /// Prefix every command with `command && `.
    fn prefix(&mut self, command: &str) -> Scoped<'_, Self>
    where
        Self: Sized,
    {
        let mut prefixes = self.context().command_prefixes.clone();
        prefixes.push(command.to_string());
        self.with_overrides(Overrides::default().command_prefixes(prefixes))
    }

    fn shell_env<I, K, V>(&mut self, vars: I) -> Scoped<'_, Self>
    where
        Self: Sized,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env = self.context().shell_env.clone();
        env.extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self.with_overrides(Overrides::default().shell_env(env))
    }

    fn path(&mut self, path: &str, behavior: PathBehavior) -> Scoped<'_, Self>
    where
        Self: Sized,
    {
        self.with_overrides(
            Overrides::default()
                .path(Some(path.to_string()))
                .path_behavior(behavior),
        )
    }

    fn hide(&mut self, groups: &[&str]) -> Result<Scoped<'_, Self>>
    where
        Self: Sized,
    {
        let output = self.context().output.hidden(groups)?;
        Ok(self.with_overrides(Overrides::default().output(output)))
    }

    fn show(&mut self, groups: &[&str]) -> Result<Scoped<'_, Self>>
    where
        Self: Sized,
    {
        let output = self.context().output.shown(groups)?;
        Ok(self.with_overrides(Overrides::default().output(output)))
    }

    /// Hide everything and keep going on non-zero exits.
    fn quiet(&mut self) -> Scoped<'_, Self>
    where
        Self: Sized,
    {
        let mut output = self.context().output;
        output.warnings = false;
        output.running = false;
        output.user = false;
        output.stdout = false;
        output.stderr = false;
        self.with_overrides(Overrides::default().output(output).warn_only(true))
    }

    fn warn_only(&mut self) -> Scoped<'_, Self>
    where
        Self: Sized,
    {
        self.with_overrides(Overrides::default().warn_only(true))
    }
}

impl ContextScope for ExecutionContext {
    fn context(&self) -> &ExecutionContext {
        self
    }

    fn context_mut(&mut self) -> &mut ExecutionContext {
        self
    }
}

/// Guard returned by the scoping helpers; reverts on drop.
pub struct Scoped<'a, C: ContextScope> {
    inner: &'a mut C,
    applied: Overrides,
    previous: Overrides,
    clean_revert: bool,
}

impl<'a, C: ContextScope> Scoped<'a, C> {
    fn new(inner: &'a mut C, applied: Overrides, clean_revert: bool) -> Self {
        let previous = applied.apply_to(inner.context_mut());
        Self {
            inner,
            applied,
            previous,
            clean_revert,
        }
    }
}

impl<C: ContextScope> Deref for Scoped<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.inner
    }
}

impl<C: ContextScope> DerefMut for Scoped<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.inner
    }
}

impl<C: ContextScope> Drop for Scoped<'_, C> {
    fn drop(&mut self) {
        self.applied
            .restore(self.inner.context_mut(), &self.previous, self.clean_revert);
    }
}

/// Process-level configuration overlay: the base context that the
/// orchestrator snapshots for each run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    context: ExecutionContext,
}

impl Settings {
    pub fn new(context: ExecutionContext) -> Self {
        Self { context }
    }

    pub fn current(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn into_inner(self) -> ExecutionContext {
        self.context
    }
}

impl ContextScope for Settings {
    fn context(&self) -> &ExecutionContext {
        &self.context
    }

    fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_revert_on_drop() {
        let mut settings = Settings::default();
        let before = settings.current().clone();
        {
            let scoped = settings.with_overrides(
                Overrides::default()
                    .user("ops")
                    .warn_only(true)
                    .command_timeout(Duration::from_secs(5)),
            );
            assert_eq!(scoped.current().user, "ops");
            assert!(scoped.current().warn_only);
            assert_eq!(scoped.current().command_timeout, Some(Duration::from_secs(5)));
        }
        assert_eq!(settings.current(), &before);
    }

    #[test]
    fn test_nested_cd_and_prefix() {
        let mut ctx = ExecutionContext::default();
        {
            let mut outer = ctx.cd("/srv");
            {
                let mut inner = outer.cd("app");
                assert_eq!(inner.cwd, "/srv/app");
                let stacked = inner.prefix("source venv/bin/activate");
                assert_eq!(stacked.command_prefixes, vec!["source venv/bin/activate"]);
            }
            assert_eq!(outer.cwd, "/srv");
            assert!(outer.command_prefixes.is_empty());
        }
        assert_eq!(ctx.cwd, "");
    }

    #[test]
    fn test_clean_revert_keeps_inner_changes() {
        let mut ctx = ExecutionContext::default();
        {
            let mut scoped = ctx.with_clean_overrides(Overrides::default().cwd("/tmp").user("ops"));
            scoped.cwd = "/var".to_string();
        }
        assert_eq!(ctx.cwd, "/var");
        assert_eq!(ctx.user, ExecutionContext::default().user);

        {
            let mut scoped = ctx.with_overrides(Overrides::default().cwd("/tmp"));
            scoped.cwd = "/etc".to_string();
        }
        assert_eq!(ctx.cwd, "/var");
    }

    #[test]
    fn test_shell_env_merges() {
        let mut ctx = ExecutionContext::default();
        let mut outer = ctx.shell_env([("A", "1")]);
        let inner = outer.shell_env([("B", "2")]);
        assert_eq!(inner.shell_env.len(), 2);
        assert_eq!(inner.shell_env["A"], "1");
    }

    #[test]
    fn test_quiet_and_hide() {
        let mut ctx = ExecutionContext::default();
        {
            let quiet = ctx.quiet();
            assert!(quiet.warn_only);
            assert!(!quiet.output.stdout);
            assert!(quiet.output.aborts);
        }
        assert!(ctx.hide(&["nonsense"]).is_err());
        let hidden = ctx.hide(&["running"]).unwrap();
        assert!(!hidden.output.running);
        assert!(hidden.output.stdout);
    }

    #[test]
    fn test_empty_overrides() {
        assert!(Overrides::default().is_empty());
        assert!(!Overrides::default().pool_size(2usize).is_empty());
    }
}
