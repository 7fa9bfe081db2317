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
use std::fmt;
use std::sync::Arc;

type RoleFn = dyn Fn() -> Vec<String> + Send + Sync;

/// Hosts belonging to a role, either listed up front or computed on demand.
#[derive(Clone)]
pub enum RoleSource {
    Static(Vec<String>),
    Dynamic(Arc<RoleFn>),
}

impl RoleSource {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        RoleSource::Dynamic(Arc::new(f))
    }

    /// Evaluates the role. Dynamic roles are called every time.
    pub fn hosts(&self) -> Vec<String> {
        match self {
            RoleSource::Static(hosts) => hosts.clone(),
            RoleSource::Dynamic(f) => f(),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for RoleSource {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        RoleSource::Static(iter.into_iter().map(Into::into).collect())
    }
}

impl PartialEq for RoleSource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RoleSource::Static(a), RoleSource::Static(b)) => a == b,
            (RoleSource::Dynamic(a), RoleSource::Dynamic(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            _ => false,
        }
    }
}

impl fmt::Debug for RoleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleSource::Static(hosts) => f.debug_tuple("Static").field(hosts).finish(),
            RoleSource::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

pub type Roledefs = BTreeMap<String, RoleSource>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dynamic_role_is_evaluated_lazily() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let role = RoleSource::dynamic(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            vec!["db1".to_string()]
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(role.hosts(), vec!["db1"]);
        assert_eq!(role.hosts(), vec!["db1"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_role_equality() {
        let a: RoleSource = ["web1", "web2"].into_iter().collect();
        let b: RoleSource = ["web1", "web2"].into_iter().collect();
        assert_eq!(a, b);

        let dynamic = RoleSource::dynamic(Vec::new);
        assert_eq!(dynamic, dynamic.clone());
        assert_ne!(dynamic, RoleSource::dynamic(Vec::new));
        assert_ne!(a, dynamic);
    }
}
