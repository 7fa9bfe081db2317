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

//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,

    /// Default host list, used when neither the command line nor the task names any.
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub roledefs: BTreeMap<String, RoleConfig>,

    /// Prompt text to the reply sent when the remote side prints it.
    #[serde(default)]
    pub prompts: BTreeMap<String, String>,
}

/// A role's host list.
///
/// Accepts either a plain list or a `{hosts: [...]}` mapping.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum RoleConfig {
    Detailed { hosts: Vec<String> },
    Simple(Vec<String>),
}

impl RoleConfig {
    pub fn hosts(&self) -> &[String] {
        match self {
            RoleConfig::Detailed { hosts } | RoleConfig::Simple(hosts) => hosts,
        }
    }
}

/// One path or a list of them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

/// Global default settings. Durations are in seconds.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Defaults {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub parallel: Option<bool>,
    pub pool_size: Option<usize>,
    /// Connect timeout.
    pub timeout: Option<u64>,
    /// Silence allowed before a running command is timed out.
    pub command_timeout: Option<u64>,
    pub connection_attempts: Option<u32>,
    pub skip_bad_hosts: Option<bool>,
    pub warn_only: Option<bool>,
    #[serde(alias = "key_filenames")]
    pub key_filename: Option<OneOrMany>,
    pub shell: Option<String>,
    pub always_use_pty: Option<bool>,
    pub linewise: Option<bool>,
    pub abort_on_prompts: Option<bool>,
    pub disable_known_hosts: Option<bool>,
    pub reject_unknown_hosts: Option<bool>,
    /// SSH keepalive interval. 0 disables it.
    pub keepalive: Option<u64>,
}
