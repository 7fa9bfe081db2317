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

use super::task::TaskValue;
use crate::error::{Error, Result};

/// Result key used when a task ran without any host.
pub const LOCAL_ONLY: &str = "<local-only>";

/// Per-host results of one task execution, in host order.
///
/// Only errors the failure policy chose to record show up here; an error
/// that aborts the run is returned from `execute` instead.
#[derive(Debug)]
pub struct ExecutionResults<T = TaskValue> {
    entries: Vec<(String, Result<T>)>,
}

impl<T> Default for ExecutionResults<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> ExecutionResults<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, host: impl Into<String>, result: Result<T>) {
        self.entries.push((host.into(), result));
    }

    /// First entry recorded for `host`.
    pub fn get(&self, host: &str) -> Option<&Result<T>> {
        self.entries
            .iter()
            .find(|(key, _)| key == host)
            .map(|(_, result)| result)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<T>)> {
        self.entries.iter().map(|(key, result)| (key.as_str(), result))
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.entries.iter().filter_map(|(key, result)| match result {
            Err(e) => Some((key.as_str(), e)),
            Ok(_) => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|(_, result)| result.is_err())
    }

    pub fn exit_code(&self) -> i32 {
        i32::from(self.has_failures())
    }
}

impl<T> IntoIterator for ExecutionResults<T> {
    type Item = (String, Result<T>);
    type IntoIter = std::vec::IntoIter<(String, Result<T>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
