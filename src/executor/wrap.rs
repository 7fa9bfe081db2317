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

//! Turning a user command into the command line actually executed.
//!
//! The layers, innermost first:
//!
//! ```text
//! cd <cwd> >/dev/null && <prefix> && ... && <command>       prefix_commands
//! export PATH="..." K="v" && <above>                         prefix_env_vars
//! sudo -S -p '<prompt>' /bin/bash -l -c "<above, escaped>"   shell_wrap
//! ```

use std::collections::BTreeMap;

use crate::context::{ExecutionContext, PathBehavior};

/// Which working directory a command is prefixed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Remote,
    Local,
}

/// Escapes `"`, `$` and backticks for use inside double quotes.
pub fn shell_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn prefix_commands(command: &str, target: Target, ctx: &ExecutionContext) -> String {
    let cwd = match target {
        Target::Remote => &ctx.cwd,
        Target::Local => &ctx.lcwd,
    };
    let mut prefixes: Vec<String> = Vec::with_capacity(ctx.command_prefixes.len() + 1);
    if !cwd.is_empty() {
        prefixes.push(format!("cd {cwd} >/dev/null"));
    }
    prefixes.extend(ctx.command_prefixes.iter().cloned());

    if prefixes.is_empty() {
        command.to_string()
    } else {
        format!("{} && {command}", prefixes.join(" && "))
    }
}

pub fn prefix_env_vars(command: &str, ctx: &ExecutionContext) -> String {
    let mut vars: BTreeMap<&str, String> = BTreeMap::new();
    if let Some(path) = ctx.path.as_deref().filter(|p| !p.is_empty()) {
        let value = match ctx.path_behavior {
            PathBehavior::Append => format!("$PATH:\"{path}\""),
            PathBehavior::Prepend => format!("\"{path}\":$PATH"),
            PathBehavior::Replace => path.to_string(),
        };
        vars.insert("PATH", value);
    }
    for (key, value) in &ctx.shell_env {
        vars.insert(key, value.clone());
    }
    if vars.is_empty() {
        return command.to_string();
    }

    let exports: Vec<String> = vars
        .iter()
        .map(|(key, value)| {
            if *key == "PATH" {
                format!("{key}=\"{value}\"")
            } else {
                format!("{key}=\"{}\"", shell_escape(value))
            }
        })
        .collect();
    format!("export {} && {command}", exports.join(" "))
}

fn sudo_argument(flag: &str, value: Option<&str>) -> String {
    match value {
        None => String::new(),
        Some(v) if !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()) => {
            format!(" {flag} \"#{v}\"")
        }
        Some(v) => format!(" {flag} \"{v}\""),
    }
}

/// Expands the context's sudo prefix template for the given target account.
pub fn sudo_prefix(ctx: &ExecutionContext, user: Option<&str>, group: Option<&str>) -> String {
    let prefix = ctx.sudo_prefix.replace("%(sudo_prompt)s", &ctx.sudo_prompt);
    if user.is_none() && group.is_none() {
        return prefix;
    }
    format!(
        "{}{}{} ",
        prefix.trim_end(),
        sudo_argument("-u", user),
        sudo_argument("-g", group)
    )
}

pub fn shell_wrap(command: &str, escape: bool, shell: Option<&str>, sudo_prefix: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(prefix) = sudo_prefix {
        out.push_str(prefix.trim_end());
        out.push(' ');
    }
    match shell {
        Some(shell) => {
            let body = if escape {
                shell_escape(command)
            } else {
                command.to_string()
            };
            out.push_str(shell);
            out.push_str(" \"");
            out.push_str(&body);
            out.push('"');
        }
        None => out.push_str(command),
    }
    out
}

/// The full remote command line for `command` under `ctx`.
pub fn wrap_remote(
    command: &str,
    ctx: &ExecutionContext,
    shell: bool,
    sudo: Option<(Option<&str>, Option<&str>)>,
) -> String {
    let prefix = sudo.map(|(user, group)| sudo_prefix(ctx, user, group));
    let shell = (shell && ctx.use_shell).then_some(ctx.shell.as_str());
    let inner = prefix_env_vars(&prefix_commands(command, Target::Remote, ctx), ctx);
    shell_wrap(&inner, ctx.shell_escape, shell, prefix.as_deref())
}

/// The command line handed to the local shell.
pub fn wrap_local(command: &str, ctx: &ExecutionContext) -> String {
    prefix_env_vars(&prefix_commands(command, Target::Local, ctx), ctx)
}
