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

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;

use super::context::HostContext;
use crate::error::Result;
use crate::executor::CommandResult;

/// Per-task dispatch settings that override the context defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetadata {
    pub name: String,
    pub hosts: Vec<String>,
    pub roles: Vec<String>,
    pub exclude_hosts: Vec<String>,
    /// Always run in parallel.
    pub parallel: bool,
    /// Never run in parallel, even when the context asks for it.
    pub serial: bool,
    pub pool_size: Option<usize>,
}

impl TaskMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self.serial = false;
        self
    }

    pub fn serial(mut self) -> Self {
        self.serial = true;
        self.parallel = false;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }
}

/// Positional and keyword arguments handed to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskArgs {
    pub positional: Vec<String>,
    pub keyword: BTreeMap<String, String>,
}

impl TaskArgs {
    pub fn positional<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            positional: args.into_iter().map(Into::into).collect(),
            keyword: BTreeMap::new(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    pub fn kwarg(&self, key: &str) -> Option<&str> {
        self.keyword.get(key).map(String::as_str)
    }

    /// Joins the positional arguments with `,`, the separator they were split on.
    pub fn joined(&self) -> String {
        self.positional.join(",")
    }
}

/// Value a task produced for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TaskValue {
    #[default]
    None,
    Text(String),
    Command(CommandResult),
}

impl From<()> for TaskValue {
    fn from(_: ()) -> Self {
        TaskValue::None
    }
}

impl From<String> for TaskValue {
    fn from(text: String) -> Self {
        TaskValue::Text(text)
    }
}

impl From<CommandResult> for TaskValue {
    fn from(result: CommandResult) -> Self {
        TaskValue::Command(result)
    }
}

#[async_trait]
pub trait Task: Send + Sync {
    fn metadata(&self) -> &TaskMetadata;

    async fn run(&self, ctx: &mut HostContext, args: &TaskArgs) -> Result<TaskValue>;
}

type TaskBody =
    dyn for<'a> Fn(&'a mut HostContext, &'a TaskArgs) -> BoxFuture<'a, Result<TaskValue>> + Send + Sync;

/// A task backed by a closure.
pub struct FnTask {
    metadata: TaskMetadata,
    body: Box<TaskBody>,
}

impl FnTask {
    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        let name = std::mem::take(&mut self.metadata.name);
        self.metadata = TaskMetadata {
            name: if metadata.name.is_empty() { name } else { metadata.name.clone() },
            ..metadata
        };
        self
    }
}

/// Wraps a closure as a [`Task`].
///
/// ```ignore
/// let uptime = task_fn("uptime", |ctx, _args| {
///     Box::pin(async move { Ok(ctx.run("uptime").await?.into()) })
/// });
/// ```
pub fn task_fn<F>(name: impl Into<String>, body: F) -> FnTask
where
    F: for<'a> Fn(&'a mut HostContext, &'a TaskArgs) -> BoxFuture<'a, Result<TaskValue>>
        + Send
        + Sync
        + 'static,
{
    FnTask {
        metadata: TaskMetadata::named(name),
        body: Box::new(body),
    }
}

#[async_trait]
impl Task for FnTask {
    fn metadata(&self) -> &TaskMetadata {
        &self.metadata
    }

    async fn run(&self, ctx: &mut HostContext, args: &TaskArgs) -> Result<TaskValue> {
        (self.body)(ctx, args).await
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_builders() {
        let meta = TaskMetadata::named("deploy")
            .hosts(["web1", "web2"])
            .roles(["db"])
            .parallel()
            .pool_size(4);
        assert!(meta.parallel);
        assert!(!meta.serial);
        assert_eq!(meta.hosts.len(), 2);
        assert_eq!(meta.pool_size, Some(4));
        assert!(TaskMetadata::named("x").parallel().serial().serial);
    }

    #[test]
    fn test_with_metadata_keeps_name() {
        let task = task_fn("noop", |_, _| Box::pin(async { Ok(TaskValue::None) }))
            .with_metadata(TaskMetadata::default().parallel());
        assert_eq!(task.metadata().name, "noop");
        assert!(task.metadata().parallel);
    }

    #[test]
    fn test_task_args_accessors() {
        let mut args = TaskArgs::positional(["a", "b"]);
        args.keyword.insert("mode".into(), "fast".into());
        assert_eq!(args.get(1), Some("b"));
        assert_eq!(args.get(2), None);
        assert_eq!(args.kwarg("mode"), Some("fast"));
        assert_eq!(args.joined(), "a,b");
    }
}
