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

//! Process-wide Ctrl-C handling.
//!
//! A single `ctrlc` handler is installed the first time anything calls
//! [`subscribe`]. From then on SIGINT no longer kills the process; every
//! press is recorded here instead, and each [`Interrupts`] handle sees the
//! presses that arrived after it was created. A press stays pending until a
//! command forwards it to the remote side with [`Interrupts::absorb`], so it
//! is noticed even when it lands between commands or during a handshake.

use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::{Arc, Once};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
struct State {
    raised: u64,
    /// Sequence number of the newest press nobody has absorbed.
    unhandled: Option<u64>,
}

fn is_pending(state: &State, seen: u64) -> bool {
    state.unhandled.is_some_and(|n| n > seen)
}

/// Where interrupts are recorded. The process has one, fed by SIGINT.
#[derive(Debug, Clone)]
pub struct InterruptSource {
    state: Arc<watch::Sender<State>>,
}

impl Default for InterruptSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::channel(State::default()).0),
        }
    }

    /// Records one press, exactly as Ctrl-C would.
    pub fn raise(&self) {
        self.state.send_modify(|state| {
            state.raised += 1;
            state.unhandled = Some(state.raised);
        });
    }

    pub fn subscribe(&self) -> Interrupts {
        let seen = self.state.borrow().raised;
        Interrupts {
            source: self.clone(),
            seen,
        }
    }
}

static PROCESS: Lazy<InterruptSource> = Lazy::new(InterruptSource::new);
static INSTALL: Once = Once::new();

/// Installs the SIGINT handler (once) and returns a handle on it.
pub fn subscribe() -> Interrupts {
    INSTALL.call_once(|| {
        let result = ctrlc::set_handler(|| {
            info!("Received Ctrl+C signal");
            PROCESS.raise();
        });
        if let Err(e) = result {
            debug!("Could not set Ctrl-C handler: {e}");
        }
    });
    PROCESS.subscribe()
}

/// A view of the interrupts raised since it was created.
#[derive(Debug, Clone)]
pub struct Interrupts {
    source: InterruptSource,
    seen: u64,
}

impl Interrupts {
    pub fn pending(&self) -> bool {
        is_pending(&self.source.state.borrow(), self.seen)
    }

    /// `Err(Error::Interrupted)` once a press is pending.
    pub fn check(&self) -> Result<()> {
        if self.pending() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Resolves as soon as a press is pending. Cancel safe.
    pub async fn recv(&self) {
        let mut rx = self.source.state.subscribe();
        if rx.wait_for(|state| is_pending(state, self.seen)).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Marks every press so far as handled elsewhere (forwarded to a
    /// remote process) and only watches for later ones.
    pub fn absorb(&mut self) {
        let mut raised = 0;
        self.source.state.send_modify(|state| {
            state.unhandled = None;
            raised = state.raised;
        });
        self.seen = raised;
    }

    /// Runs `future` to completion unless a press comes first.
    pub async fn guard<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            result = future => result,
            _ = self.recv() => Err(Error::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_only_later_presses_are_seen() {
        let source = InterruptSource::new();
        source.raise();
        let interrupts = source.subscribe();
        assert!(!interrupts.pending());
        source.raise();
        assert!(interrupts.pending());
        assert!(matches!(interrupts.check(), Err(Error::Interrupted)));
    }

    #[test]
    fn test_press_stays_pending_for_every_handle() {
        let source = InterruptSource::new();
        let a = source.subscribe();
        let b = a.clone();
        source.raise();
        assert!(a.pending());
        assert!(b.pending());
        // a later subscriber does not inherit it
        assert!(!source.subscribe().pending());
    }

    #[test]
    fn test_absorbed_press_is_cleared() {
        let source = InterruptSource::new();
        let mut forwarding = source.subscribe();
        let watcher = source.subscribe();
        source.raise();
        forwarding.absorb();
        assert!(!forwarding.pending());
        assert!(!watcher.pending());
        source.raise();
        assert!(forwarding.pending());
        assert!(watcher.pending());
    }

    #[tokio::test]
    async fn test_guard_interrupts_a_stuck_future() {
        let source = InterruptSource::new();
        let interrupts = source.subscribe();
        let raiser = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            raiser.raise();
        });
        let result = interrupts
            .guard(async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Interrupted)));
    }

    #[tokio::test]
    async fn test_guard_passes_results_through() {
        let interrupts = InterruptSource::new().subscribe();
        assert_eq!(interrupts.guard(async { Ok(7) }).await.unwrap(), 7);
    }
}
