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

//! Working out which hosts a task runs on.
//!
//! Hosts and roles come from the first non-empty source among the call
//! itself, the task's metadata, and the execution context. Exclusions from
//! all three are applied together.

use std::collections::HashSet;

use super::task::TaskMetadata;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::host::HostSpec;

/// Host selection given explicitly for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSelection {
    pub hosts: Vec<String>,
    pub roles: Vec<String>,
    pub exclude_hosts: Vec<String>,
}

impl HostSelection {
    pub fn hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    fn selects(&self) -> bool {
        !self.hosts.is_empty() || !self.roles.is_empty()
    }
}

pub fn resolve_hosts(
    call: &HostSelection,
    meta: &TaskMetadata,
    ctx: &ExecutionContext,
) -> Result<Vec<HostSpec>> {
    let (hosts, roles) = if call.selects() {
        (&call.hosts, &call.roles)
    } else if !meta.hosts.is_empty() || !meta.roles.is_empty() {
        (&meta.hosts, &meta.roles)
    } else {
        (&ctx.hosts, &ctx.roles)
    };

    let unknown: Vec<&str> = roles
        .iter()
        .filter(|role| !ctx.roledefs.contains_key(role.as_str()))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(Error::Abort(format!(
            "The following specified roles do not exist:\n    {}",
            unknown.join(", ")
        )));
    }

    let mut candidates: Vec<String> = hosts.clone();
    for role in roles {
        if let Some(source) = ctx.roledefs.get(role) {
            candidates.extend(source.hosts());
        }
    }

    let mut excluded: HashSet<String> = HashSet::new();
    for raw in call
        .exclude_hosts
        .iter()
        .chain(&meta.exclude_hosts)
        .chain(&ctx.exclude_hosts)
    {
        let raw = raw.trim();
        if !raw.is_empty() {
            excluded.insert(ctx.host_spec(raw)?.key());
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut resolved = Vec::with_capacity(candidates.len());
    for raw in candidates {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let spec = ctx.host_spec(raw)?;
        let key = spec.key();
        if excluded.contains(&key) {
            tracing::debug!("Excluding {key}");
            continue;
        }
        if ctx.dedupe_hosts && !seen.insert(key) {
            continue;
        }
        resolved.push(spec);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RoleSource;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext {
            user: "deploy".to_string(),
            ..Default::default()
        };
        ctx.roledefs.insert(
            "web".to_string(),
            RoleSource::Static(vec!["web1".into(), " web2 ".into()]),
        );
        ctx.roledefs
            .insert("db".to_string(), RoleSource::dynamic(|| vec!["db1".to_string()]));
        ctx
    }

    fn keys(hosts: &[HostSpec]) -> Vec<String> {
        hosts.iter().map(HostSpec::key).collect()
    }

    #[test]
    fn test_call_hosts_take_precedence() {
        let mut ctx = ctx();
        ctx.hosts = vec!["ctxhost".into()];
        let meta = TaskMetadata::named("t").hosts(["metahost"]);

        let hosts = resolve_hosts(&HostSelection::hosts(["callhost"]), &meta, &ctx).unwrap();
        assert_eq!(keys(&hosts), vec!["deploy@callhost:22"]);

        let hosts = resolve_hosts(&HostSelection::default(), &meta, &ctx).unwrap();
        assert_eq!(keys(&hosts), vec!["deploy@metahost:22"]);

        let hosts = resolve_hosts(&HostSelection::default(), &TaskMetadata::default(), &ctx).unwrap();
        assert_eq!(keys(&hosts), vec!["deploy@ctxhost:22"]);
    }

    #[test]
    fn test_roles_expand_and_dedupe() {
        let call = HostSelection {
            hosts: vec!["web1".into(), "deploy@web1:22".into()],
            roles: vec!["web".into(), "db".into()],
            exclude_hosts: vec![],
        };
        let hosts = resolve_hosts(&call, &TaskMetadata::default(), &ctx()).unwrap();
        assert_eq!(
            keys(&hosts),
            vec!["deploy@web1:22", "deploy@web2:22", "deploy@db1:22"]
        );
    }

    #[test]
    fn test_dedupe_disabled_keeps_duplicates() {
        let mut ctx = ctx();
        ctx.dedupe_hosts = false;
        let hosts =
            resolve_hosts(&HostSelection::hosts(["a", "a"]), &TaskMetadata::default(), &ctx).unwrap();
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn test_exclusions_use_normalized_keys() {
        let mut ctx = ctx();
        ctx.exclude_hosts = vec!["deploy@web2:22".into()];
        let call = HostSelection {
            roles: vec!["web".into()],
            exclude_hosts: vec!["web1".into()],
            ..Default::default()
        };
        let hosts = resolve_hosts(&call, &TaskMetadata::default(), &ctx).unwrap();
        assert!(hosts.is_empty());
    }

    #[test]
    fn test_unknown_roles_abort() {
        let call = HostSelection {
            roles: vec!["web".into(), "cache".into(), "queue".into()],
            ..Default::default()
        };
        let err = resolve_hosts(&call, &TaskMetadata::default(), &ctx()).unwrap_err();
        assert!(err.to_string().contains("cache, queue"));
    }

    #[test]
    fn test_nothing_selected_is_empty() {
        let hosts =
            resolve_hosts(&HostSelection::default(), &TaskMetadata::default(), &ctx()).unwrap();
        assert!(hosts.is_empty());
    }
}
