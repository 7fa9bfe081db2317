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

//! Password storage shared by login authentication and sudo prompts.
//!
//! Passwords are held as [`SecretString`] and only leave the cache inside
//! zeroizing buffers. They are never logged.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub const PASSWORD_ENV_VAR: &str = "FANOUT_PASSWORD";

/// A password that is cleared from memory on drop.
#[derive(Clone)]
pub struct Password {
    inner: SecretString,
}

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        let password: String = password.into();
        Self {
            inner: SecretString::new(password.into_boxed_str()),
        }
    }

    pub fn expose(&self) -> &str {
        self.inner.expose_secret()
    }

    /// Password bytes followed by `\n`, ready to send down a channel.
    pub fn with_newline(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = self.inner.expose_secret().as_bytes().to_vec();
        bytes.push(b'\n');
        Zeroizing::new(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.expose_secret().is_empty()
    }

    /// Reads [`PASSWORD_ENV_VAR`]. A set-but-empty variable is an error.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(PASSWORD_ENV_VAR) {
            Ok(password) if !password.is_empty() => Ok(Some(Self::new(password))),
            Ok(_) => Err(Error::Config(format!(
                "{PASSWORD_ENV_VAR} is set but empty. Empty passwords are not allowed."
            ))),
            Err(_) => Ok(None),
        }
    }
}

impl PartialEq for Password {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Password")
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Default)]
struct CacheInner {
    default: Option<Password>,
    per_host: HashMap<String, Password>,
}

/// Host key → last-known-good password, plus a default used for any host.
///
/// Cloning shares the underlying map. Use [`snapshot`](Self::snapshot) for an
/// independent copy.
#[derive(Clone, Default)]
pub struct PasswordCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl PasswordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(password: Password) -> Self {
        let cache = Self::default();
        cache.write().default = Some(password);
        cache
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Password for `key`, falling back to the default password.
    pub fn get(&self, key: &str) -> Option<Password> {
        let inner = self.read();
        inner
            .per_host
            .get(key)
            .or(inner.default.as_ref())
            .cloned()
    }

    /// Records `password` for `key` and makes it the new default.
    pub fn set(&self, key: &str, password: Password) {
        let mut inner = self.write();
        inner.per_host.insert(key.to_string(), password.clone());
        inner.default = Some(password);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().per_host.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().per_host.len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.read();
        inner.per_host.is_empty() && inner.default.is_none()
    }

    /// Independent deep copy. Writes to the copy never reach `self`.
    pub fn snapshot(&self) -> Self {
        let inner = self.read();
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                default: inner.default.clone(),
                per_host: inner.per_host.clone(),
            })),
        }
    }
}

impl fmt::Debug for PasswordCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        f.debug_struct("PasswordCache")
            .field("hosts", &inner.per_host.keys().collect::<Vec<_>>())
            .field("has_default", &inner.default.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_password_with_newline() {
        let password = Password::new("hunter2");
        assert_eq!(&*password.with_newline(), b"hunter2\n");
    }

    #[test]
    fn test_debug_redaction() {
        let password = Password::new("secret");
        let debug_output = format!("{password:?}");
        assert!(!debug_output.contains("secret"));
        assert!(debug_output.contains("[REDACTED]"));

        let cache = PasswordCache::new();
        cache.set("u@h:22", password);
        assert!(!format!("{cache:?}").contains("secret"));
    }

    #[test]
    fn test_cache_falls_back_to_default() {
        let cache = PasswordCache::with_default(Password::new("fallback"));
        assert_eq!(cache.get("u@a:22").unwrap().expose(), "fallback");

        cache.set("u@b:22", Password::new("b-pass"));
        assert_eq!(cache.get("u@b:22").unwrap().expose(), "b-pass");
        // set() also moves the default
        assert_eq!(cache.get("u@a:22").unwrap().expose(), "b-pass");
    }

    #[test]
    fn test_clone_shares_but_snapshot_isolates() {
        let cache = PasswordCache::new();
        let shared = cache.clone();
        let snapshot = cache.snapshot();

        shared.set("u@a:22", Password::new("one"));
        assert!(cache.contains("u@a:22"));
        assert!(!snapshot.contains("u@a:22"));

        snapshot.set("u@b:22", Password::new("two"));
        assert!(!cache.contains("u@b:22"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    #[serial]
    fn test_password_from_env() {
        std::env::remove_var(PASSWORD_ENV_VAR);
        assert!(Password::from_env().unwrap().is_none());

        std::env::set_var(PASSWORD_ENV_VAR, "");
        assert!(Password::from_env().is_err());

        std::env::set_var(PASSWORD_ENV_VAR, "from-env");
        assert_eq!(Password::from_env().unwrap().unwrap().expose(), "from-env");
        std::env::remove_var(PASSWORD_ENV_VAR);
    }
}
