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

//! Tasks available from the command line without any task file.

use std::sync::Arc;

use super::invocation::Invocation;
use crate::error::{Error, Result};
use crate::orchestrator::{task_fn, RunOptions, Task, TaskValue};

pub const BUILTIN_TASKS: &[&str] = &["run", "sudo", "shell"];

fn required_command(invocation: &Invocation) -> Result<String> {
    invocation
        .raw
        .clone()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            Error::Abort(format!(
                "Task '{0}' needs a command, e.g. {0}:uptime",
                invocation.name
            ))
        })
}

/// `run:<cmd>`: the whole text after `:` is the command.
fn run_task(command: String) -> Arc<dyn Task> {
    Arc::new(task_fn("run", move |ctx, _| {
        let command = command.clone();
        Box::pin(async move { Ok(ctx.run(&command).await?.into()) })
    }))
}

/// `sudo:<cmd>[,user=..][,group=..]`.
fn sudo_task(command: String) -> Arc<dyn Task> {
    Arc::new(task_fn("sudo", move |ctx, args| {
        let command = command.clone();
        Box::pin(async move {
            let options = RunOptions {
                user: args.kwarg("user").map(String::from),
                group: args.kwarg("group").map(String::from),
                ..Default::default()
            };
            Ok(ctx.sudo_with(&command, options).await?.into())
        })
    }))
}

/// `shell[:cmd]`: interactive shell, optionally typing `cmd` first.
fn shell_task(command: Option<String>) -> Arc<dyn Task> {
    Arc::new(task_fn("shell", move |ctx, _| {
        let command = command.clone();
        Box::pin(async move {
            ctx.open_shell(command.as_deref()).await?;
            Ok(TaskValue::None)
        })
    }))
}

/// Looks up the built-in task an invocation names.
pub fn builtin_task(invocation: &Invocation) -> Result<Arc<dyn Task>> {
    match invocation.name.as_str() {
        "run" => Ok(run_task(required_command(invocation)?)),
        "sudo" => {
            if invocation.args.positional.is_empty() {
                return Err(Error::Abort(
                    "Task 'sudo' needs a command, e.g. sudo:uptime".to_string(),
                ));
            }
            Ok(sudo_task(invocation.args.joined()))
        }
        "shell" => Ok(shell_task(invocation.raw.clone().filter(|c| !c.is_empty()))),
        _ => Err(Error::Abort(format!(
            "Command(s) not found:\n    {}",
            invocation.name
        ))),
    }
}

/// Checks every invocation up front so nothing runs when one name is wrong.
pub fn resolve_tasks(invocations: &[Invocation]) -> Result<Vec<Arc<dyn Task>>> {
    let unknown: Vec<&str> = invocations
        .iter()
        .map(|i| i.name.as_str())
        .filter(|name| !BUILTIN_TASKS.contains(name))
        .collect();
    if !unknown.is_empty() {
        return Err(Error::Abort(format!(
            "Command(s) not found:\n    {}",
            unknown.join("\n    ")
        )));
    }
    invocations.iter().map(builtin_task).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::invocation::parse_invocation;

    #[test]
    fn test_known_tasks_resolve() {
        let invs = vec![
            parse_invocation("run:uname -a").unwrap(),
            parse_invocation("sudo:whoami,user=postgres").unwrap(),
            parse_invocation("shell").unwrap(),
        ];
        let tasks = resolve_tasks(&invs).unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.metadata().name.as_str()).collect();
        assert_eq!(names, vec!["run", "sudo", "shell"]);
    }

    #[test]
    fn test_unknown_tasks_are_all_listed() {
        let invs = vec![
            parse_invocation("deploy").unwrap(),
            parse_invocation("run:ls").unwrap(),
            parse_invocation("rollback:1").unwrap(),
        ];
        let err = resolve_tasks(&invs).err().unwrap();
        assert_eq!(err.to_string(), "Command(s) not found:\n    deploy\n    rollback");
    }

    #[test]
    fn test_run_requires_command() {
        assert!(builtin_task(&parse_invocation("run").unwrap()).is_err());
        assert!(builtin_task(&parse_invocation("run:").unwrap()).is_err());
        assert!(builtin_task(&parse_invocation("sudo:user=root").unwrap()).is_err());
    }
}
