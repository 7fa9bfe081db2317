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

//! Process-wide cache of open sessions, keyed by normalized host string.
//!
//! Each key owns an async slot lock, so two callers asking for the same host
//! at once produce a single connect while other hosts proceed untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as SlotLock;
use tracing::{debug, warn};

use super::transport::Session;
use crate::auth::AuthNegotiator;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::host::HostSpec;

type Slot = Arc<SlotLock<Option<Arc<dyn Session>>>>;

#[derive(Default)]
pub struct ConnectionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(SlotLock::new(None)))
            .clone()
    }

    /// Returns the live session for `host`, connecting if there is none.
    pub async fn get_or_connect(
        &self,
        host: &HostSpec,
        negotiator: &AuthNegotiator,
        ctx: &ExecutionContext,
    ) -> Result<Arc<dyn Session>> {
        let key = host.key();
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            debug!("Cached session for {key} is closed; reconnecting");
        }

        let session = negotiator.connect(host, ctx).await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Forgets the session for `key` so the next lookup reconnects.
    pub async fn invalidate(&self, key: &str) {
        let slot = self.slots().get(key).cloned();
        if let Some(slot) = slot {
            slot.lock().await.take();
        }
    }

    /// Closes one host's session, if any.
    pub async fn disconnect(&self, key: &str) -> Result<()> {
        let slot = self.slots().remove(key);
        if let Some(slot) = slot {
            if let Some(session) = slot.lock().await.take() {
                session.disconnect().await?;
            }
        }
        Ok(())
    }

    /// Closes every cached session. Individual failures are logged and skipped.
    ///
    /// Returns the keys that were disconnected, in sorted order.
    pub async fn disconnect_all(&self) -> Vec<String> {
        let mut drained: Vec<(String, Slot)> = self.slots().drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        let mut closed = Vec::new();
        for (key, slot) in drained {
            let Some(session) = slot.lock().await.take() else {
                continue;
            };
            match session.disconnect().await {
                Ok(()) => debug!("Disconnected from {key}"),
                Err(e) => warn!("Error while disconnecting from {key}: {e}"),
            }
            closed.push(key);
        }
        closed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots()
            .get(key)
            .and_then(|slot| slot.try_lock().ok().map(|s| s.is_some()))
            .unwrap_or(false)
    }

    /// Number of keys with a slot (connected or being connected).
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self.slots().keys().cloned().collect();
        keys.sort();
        f.debug_struct("ConnectionRegistry").field("keys", &keys).finish()
    }
}
