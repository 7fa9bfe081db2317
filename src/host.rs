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

//! Host string parsing and normalization.
//!
//! Accepted formats:
//! - `host`
//! - `host:port`
//! - `user@host`
//! - `user@host:port`
//! - `user@[v6addr]:port` (a bare IPv6 address carries no port)

use std::fmt;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 22;

/// Raw pieces of a host string before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostParts {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl HostParts {
    pub fn parse(host_string: &str) -> Result<Self> {
        let host_string = host_string.trim();
        if host_string.is_empty() {
            return Err(Error::Config("empty host string".to_string()));
        }

        let (user, hostport) = match host_string.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some((_, rest)) => (None, rest),
            None => (None, host_string),
        };

        let (host, port) = if hostport.matches(':').count() > 1 {
            split_ipv6(hostport)?
        } else {
            match hostport.rsplit_once(':') {
                Some((host, port)) if !port.is_empty() => (host.to_string(), Some(parse_port(port)?)),
                Some((host, _)) => (host.to_string(), None),
                None => (hostport.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(Error::Config(format!("no host in host string '{host_string}'")));
        }

        Ok(Self { user, host, port })
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| Error::Config(format!("Invalid port number '{port}'")))
}

fn split_ipv6(hostport: &str) -> Result<(String, Option<u16>)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Config(format!("unterminated IPv6 literal '{hostport}'")))?;
        let port = match tail.strip_prefix(':') {
            Some(p) if !p.is_empty() => Some(parse_port(p)?),
            Some(_) => None,
            None if tail.is_empty() => None,
            None => return Err(Error::Config(format!("unexpected text after IPv6 literal '{hostport}'"))),
        };
        Ok((host.to_string(), port))
    } else {
        Ok((hostport.to_string(), None))
    }
}

/// A normalized `user@host:port` target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostSpec {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl HostSpec {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse `host_string`, filling the user and port from the given defaults.
    pub fn parse(host_string: &str, default_user: &str, default_port: u16) -> Result<Self> {
        let parts = HostParts::parse(host_string)?;
        Ok(Self {
            user: parts.user.unwrap_or_else(|| default_user.to_string()),
            host: parts.host,
            port: parts.port.unwrap_or(default_port),
        })
    }

    fn is_ipv6(&self) -> bool {
        self.host.matches(':').count() > 1
    }

    /// Canonical `user@host:port` key used by the registry and password cache.
    pub fn key(&self) -> String {
        if self.is_ipv6() {
            format!("{}@[{}]:{}", self.user, self.host, self.port)
        } else {
            format!("{}@{}:{}", self.user, self.host, self.port)
        }
    }

    /// Short display form with the default user and port stripped.
    ///
    /// Parsing the result with the same defaults gives back `self`.
    pub fn denormalize(&self, default_user: &str, default_port: u16) -> String {
        let user = if self.user != default_user {
            format!("{}@", self.user)
        } else {
            String::new()
        };
        if self.port == default_port {
            format!("{user}{}", self.host)
        } else if self.is_ipv6() {
            format!("{user}[{}]:{}", self.host, self.port)
        } else {
            format!("{user}{}:{}", self.host, self.port)
        }
    }

    pub fn address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Local username used when neither a host string nor the context names one.
pub fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
        .or_else(|| whoami::fallible::username().ok())
        .unwrap_or_else(|| "root".to_string())
}
