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

//! Configuration loading and layering onto an execution context.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use super::types::Config;
use super::utils::{expand_env_vars, expand_path, expand_tilde};
use crate::context::{ExecutionContext, RoleSource};

pub const CONFIG_FILE_NAME: &str = "fanout.yaml";

impl Config {
    /// Load configuration from a file.
    pub async fn load(path: &Path) -> Result<Self> {
        let expanded_path = expand_tilde(path);

        let content = fs::read_to_string(&expanded_path).await.with_context(|| {
            format!(
                "Failed to read configuration file at {}",
                expanded_path.display()
            )
        })?;

        Self::from_yaml(&content).with_context(|| {
            format!(
                "Failed to parse YAML configuration file at {}",
                expanded_path.display()
            )
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Per-user config file, e.g. `~/.config/fanout/fanout.yaml` on Linux.
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "fanout").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load configuration with priority order:
    /// 1. Explicit `--config` path (must exist)
    /// 2. `./fanout.yaml`
    /// 3. The per-user config directory
    /// 4. Built-in defaults
    pub async fn load_with_priority(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            tracing::debug!("Using explicitly specified config file: {:?}", path);
            return Self::load(path).await;
        }

        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
        candidates.extend(Self::user_config_path());

        for candidate in candidates {
            if candidate.exists() {
                tracing::debug!("Found config at {:?}", candidate);
                return Self::load(&candidate).await;
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Layer this file's settings over `ctx`.
    ///
    /// Only keys present in the file are touched; command-line flags are
    /// expected to be applied afterwards.
    pub fn apply_to(&self, ctx: &mut ExecutionContext) {
        let d = &self.defaults;

        if let Some(user) = &d.user {
            ctx.user = expand_env_vars(user);
        }
        if let Some(port) = d.port {
            ctx.port = port;
        }
        if let Some(parallel) = d.parallel {
            ctx.parallel = parallel;
        }
        if let Some(pool_size) = d.pool_size {
            ctx.pool_size = pool_size;
        }
        if let Some(secs) = d.timeout {
            ctx.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = d.command_timeout {
            ctx.command_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(attempts) = d.connection_attempts {
            ctx.connection_attempts = attempts.max(1);
        }
        if let Some(skip) = d.skip_bad_hosts {
            ctx.skip_bad_hosts = skip;
        }
        if let Some(warn_only) = d.warn_only {
            ctx.warn_only = warn_only;
        }
        if let Some(keys) = &d.key_filename {
            ctx.key_filenames = keys
                .clone()
                .into_vec()
                .iter()
                .map(|k| expand_path(k))
                .collect();
        }
        if let Some(shell) = &d.shell {
            ctx.shell = shell.clone();
        }
        if let Some(pty) = d.always_use_pty {
            ctx.always_use_pty = pty;
        }
        if let Some(linewise) = d.linewise {
            ctx.linewise = linewise;
        }
        if let Some(abort) = d.abort_on_prompts {
            ctx.abort_on_prompts = abort;
        }
        if let Some(disable) = d.disable_known_hosts {
            ctx.disable_known_hosts = disable;
        }
        if let Some(reject) = d.reject_unknown_hosts {
            ctx.reject_unknown_hosts = reject;
        }
        if let Some(secs) = d.keepalive {
            ctx.keepalive = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if !self.hosts.is_empty() {
            ctx.hosts = self.hosts.clone();
        }
        for (name, role) in &self.roledefs {
            ctx.roledefs
                .insert(name.clone(), RoleSource::Static(role.hosts().to_vec()));
        }
        for (prompt, reply) in &self.prompts {
            ctx.prompts.retain(|(p, _)| p != prompt);
            ctx.prompts.push((prompt.clone(), reply.clone()));
        }
    }
}
