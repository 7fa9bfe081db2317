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

use directories::BaseDirs;
use std::path::PathBuf;

use super::transport::ConnectOptions;

/// Get the default known_hosts file path
pub fn default_known_hosts_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".ssh").join("known_hosts"))
}

/// How a server's host key is checked against `~/.ssh/known_hosts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any key without looking at known_hosts.
    NoCheck,
    /// Reject mismatches, accept (but do not record) unknown hosts.
    AcceptUnknown,
    /// Reject mismatches and unknown hosts.
    Strict,
}

impl HostKeyPolicy {
    pub fn from_options(options: &ConnectOptions) -> Self {
        if options.disable_known_hosts {
            HostKeyPolicy::NoCheck
        } else if options.reject_unknown_hosts {
            HostKeyPolicy::Strict
        } else {
            HostKeyPolicy::AcceptUnknown
        }
    }
}

/// Outcome of looking a key up in known_hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    Known,
    Unknown,
    Changed,
}

/// Verdict of `policy` for a key with the given `status`.
pub fn verdict(policy: HostKeyPolicy, status: HostKeyStatus) -> Result<(), HostKeyStatus> {
    match (policy, status) {
        (HostKeyPolicy::NoCheck, _) | (_, HostKeyStatus::Known) => Ok(()),
        (HostKeyPolicy::AcceptUnknown, HostKeyStatus::Unknown) => Ok(()),
        (_, rejected) => Err(rejected),
    }
}

/// Look up `key` for `hostname:port` in the user's known_hosts.
pub fn lookup(hostname: &str, port: u16, key: &russh::keys::PublicKey) -> HostKeyStatus {
    match russh::keys::check_known_hosts(hostname, port, key) {
        Ok(true) => HostKeyStatus::Known,
        Ok(false) => HostKeyStatus::Unknown,
        Err(russh::keys::Error::KeyChanged { line }) => {
            tracing::warn!("Host key for {hostname} changed (known_hosts line {line})");
            HostKeyStatus::Changed
        }
        Err(e) => {
            tracing::debug!("Could not read known_hosts for {hostname}: {e}");
            HostKeyStatus::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(disable: bool, reject: bool) -> ConnectOptions {
        ConnectOptions {
            timeout: Duration::from_secs(1),
            keepalive: None,
            disable_known_hosts: disable,
            reject_unknown_hosts: reject,
        }
    }

    #[test]
    fn test_policy_from_options() {
        assert_eq!(HostKeyPolicy::from_options(&options(true, true)), HostKeyPolicy::NoCheck);
        assert_eq!(HostKeyPolicy::from_options(&options(false, true)), HostKeyPolicy::Strict);
        assert_eq!(
            HostKeyPolicy::from_options(&options(false, false)),
            HostKeyPolicy::AcceptUnknown
        );
    }

    #[test]
    fn test_verdicts() {
        use HostKeyPolicy::*;
        use HostKeyStatus::*;

        assert!(verdict(NoCheck, Changed).is_ok());
        assert!(verdict(AcceptUnknown, Unknown).is_ok());
        assert_eq!(verdict(AcceptUnknown, Changed), Err(Changed));
        assert_eq!(verdict(Strict, Unknown), Err(Unknown));
        assert!(verdict(Strict, Known).is_ok());
    }

    #[test]
    fn test_default_known_hosts_path() {
        if let Some(path) = default_known_hosts_path() {
            assert!(path.ends_with(".ssh/known_hosts"));
        }
    }
}
