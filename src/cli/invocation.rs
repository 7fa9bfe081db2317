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

//! Task strings: `name[:arg,arg,key=value,host=h,hosts=a;b,...]`.
//!
//! `\,` and `\=` stand for a literal comma and equals sign. The keys `host`,
//! `hosts`, `role`, `roles` and `exclude_hosts` select targets for that one
//! invocation instead of being passed to the task; their values are
//! `;`-separated.

use crate::error::{Error, Result};
use crate::orchestrator::{HostSelection, TaskArgs};

/// One task call parsed from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub name: String,
    pub args: TaskArgs,
    pub selection: HostSelection,
    /// Text after the first `:`, unescaped but otherwise untouched.
    pub raw: Option<String>,
}

impl Invocation {
    /// An ad-hoc `run` of `command`, as given after `--`.
    pub fn run(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            name: "run".to_string(),
            args: TaskArgs::positional([command.clone()]),
            selection: HostSelection::default(),
            raw: Some(command),
        }
    }
}

/// Splits on `sep` unless the preceding character is a backslash.
fn split_unescaped(input: &str, sep: char, limit: Option<usize>) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut prev = None;
    for (i, c) in input.char_indices() {
        if c == sep && prev != Some('\\') && limit.map_or(true, |l| parts.len() + 1 < l) {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
        prev = Some(c);
    }
    parts.push(&input[start..]);
    parts
}

fn unescape(value: &str) -> String {
    value.replace("\\,", ",").replace("\\=", "=")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn parse_invocation(input: &str) -> Result<Invocation> {
    let (name, rest) = match input.split_once(':') {
        Some((name, rest)) => (name.trim(), Some(rest)),
        None => (input.trim(), None),
    };
    if name.is_empty() {
        return Err(Error::Abort(format!("Invalid task string '{input}': missing task name")));
    }

    let mut invocation = Invocation {
        name: name.to_string(),
        raw: rest.map(unescape),
        ..Default::default()
    };

    let Some(rest) = rest else {
        return Ok(invocation);
    };
    if rest.is_empty() {
        return Ok(invocation);
    }

    for piece in split_unescaped(rest, ',', None) {
        let kv = split_unescaped(piece, '=', Some(2));
        match kv.as_slice() {
            [key, value] => {
                let key = unescape(key);
                let value = unescape(value);
                match key.as_str() {
                    "host" => invocation.selection.hosts.push(value),
                    "hosts" => invocation.selection.hosts.extend(split_list(&value)),
                    "role" => invocation.selection.roles.push(value),
                    "roles" => invocation.selection.roles.extend(split_list(&value)),
                    "exclude_hosts" => invocation.selection.exclude_hosts.extend(split_list(&value)),
                    _ => {
                        invocation.args.keyword.insert(key, value);
                    }
                }
            }
            _ => invocation.args.positional.push(unescape(piece)),
        }
    }
    Ok(invocation)
}

pub fn parse_invocations<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<Invocation>> {
    inputs.iter().map(|s| parse_invocation(s.as_ref())).collect()
}
