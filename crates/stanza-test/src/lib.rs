// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Test utilities for stanza flow tests.
//!
//! The central piece is [`TestLatch`]: a terminator resolves it with the
//! data and state it observed, and the test thread waits on it instead of
//! polling queues. The latch re-arms after each consumed result so one
//! latch can serve a whole test.

#![deny(missing_docs)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::sync::Notify;

/// Default wait window for [`TestLatch::wait`].
pub const DEFAULT_LATCH_TIMEOUT: Duration = Duration::from_millis(2500);

/// What a terminator observed, handed back to the waiting test.
#[derive(Debug, Clone, PartialEq)]
pub struct LatchResult<D, S> {
    /// The incoming message the terminator received.
    pub data: D,
    /// The state the terminator received.
    pub state: S,
    /// Binary sideband of the terminating message.
    pub binaries: BTreeMap<String, Vec<u8>>,
    /// String sideband of the terminating message.
    pub strings: BTreeMap<String, String>,
}

struct LatchInner<D, S> {
    slot: Mutex<Option<LatchResult<D, S>>>,
    notify: Notify,
}

/// Latch for handing one result from a terminator back to the test
/// thread.
///
/// Cheap to clone; all clones share the slot.
pub struct TestLatch<D, S> {
    inner: Arc<LatchInner<D, S>>,
}

impl<D, S> Clone for TestLatch<D, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D, S> Default for TestLatch<D, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, S> TestLatch<D, S> {
    /// Create an unresolved latch.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LatchInner {
                slot: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolve the latch, releasing the waiting test.
    ///
    /// # Panics
    ///
    /// Panics when a previous result was never consumed - that is a test
    /// bug, not a race to paper over.
    pub fn resolve(&self, data: D, state: S) {
        self.resolve_with_sideband(data, state, BTreeMap::new(), BTreeMap::new());
    }

    /// Resolve the latch including the terminating message's sideband.
    ///
    /// # Panics
    ///
    /// Panics when a previous result was never consumed.
    pub fn resolve_with_sideband(
        &self,
        data: D,
        state: S,
        binaries: BTreeMap<String, Vec<u8>>,
        strings: BTreeMap<String, String>,
    ) {
        let mut slot = self.inner.slot.lock().expect("latch lock poisoned");
        if slot.is_some() {
            panic!("latch already resolved but not consumed: cannot resolve again");
        }
        *slot = Some(LatchResult {
            data,
            state,
            binaries,
            strings,
        });
        drop(slot);
        self.inner.notify.notify_waiters();
    }

    /// Wait for the result with the default timeout.
    ///
    /// # Panics
    ///
    /// Panics when the latch is not resolved in time.
    pub async fn wait(&self) -> LatchResult<D, S> {
        self.wait_timeout(DEFAULT_LATCH_TIMEOUT).await
    }

    /// Wait for the result, consuming it and re-arming the latch.
    ///
    /// # Panics
    ///
    /// Panics when the latch is not resolved within `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> LatchResult<D, S> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self
                .inner
                .slot
                .lock()
                .expect("latch lock poisoned")
                .take()
            {
                return result;
            }

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    panic!("latch was not resolved within {timeout:?}");
                }
            }
        }
    }
}

static INIT_LOGGING: Once = Once::new();

/// Install the test logging subscriber once per process. The filter comes
/// from `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .init();
    });
}
