// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transactional in-memory broker.
//!
//! One FIFO queue per queue id, created on first use. Sends are buffered in
//! the session and published at commit; receives are leased and either
//! consumed at commit or requeued at the front on rollback, flagged as
//! redelivered. A message that exceeds the redelivery cap is routed to
//! `DLQ.<queue>` instead of looping forever.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;

use crate::{Broker, BrokerError, BrokerSession, RawMessage};

/// Default redelivery cap before a message is dead-lettered.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 6;

#[derive(Debug)]
struct QueuedMessage {
    message: RawMessage,
    redeliveries: u32,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<QueuedMessage>>,
}

struct BrokerShared {
    state: Mutex<BrokerState>,
    notify: Notify,
    max_redeliveries: u32,
}

/// In-process broker with transactional sessions.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl MemoryBroker {
    /// Create a broker with the default redelivery cap.
    pub fn new() -> Self {
        Self::with_max_redeliveries(DEFAULT_MAX_REDELIVERIES)
    }

    /// Create a broker that dead-letters after `max_redeliveries`
    /// redeliveries of the same message.
    pub fn with_max_redeliveries(max_redeliveries: u32) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                max_redeliveries,
            }),
        }
    }

    /// The dead-letter queue id for `queue`.
    pub fn dlq(queue: &str) -> String {
        format!("DLQ.{queue}")
    }

    /// Number of committed messages waiting on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        let state = self.shared.state.lock().expect("broker state lock poisoned");
        state.queues.get(queue).map(VecDeque::len).unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn session(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            leased: Vec::new(),
            pending: Vec::new(),
            closed: false,
        }))
    }
}

struct MemorySession {
    shared: Arc<BrokerShared>,
    /// Received but not yet committed messages, with their queue of origin.
    leased: Vec<(String, QueuedMessage)>,
    /// Sent but not yet committed messages.
    pending: Vec<(String, RawMessage)>,
    closed: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::SessionClosed);
        }
        Ok(())
    }

    fn try_pop(&mut self, queue: &str) -> Option<RawMessage> {
        let mut state = self.shared.state.lock().expect("broker state lock poisoned");
        let queued = state.queues.get_mut(queue)?.pop_front()?;
        let message = queued.message.clone();
        self.leased.push((queue.to_string(), queued));
        Some(message)
    }

    /// Rollback that can run from both async paths and `Drop`.
    fn rollback_sync(&mut self) {
        self.pending.clear();
        if self.leased.is_empty() {
            return;
        }
        let max = self.shared.max_redeliveries;
        let mut state = self.shared.state.lock().expect("broker state lock poisoned");
        // Requeue in reverse so the oldest lease ends up at the very front.
        for (queue, mut queued) in self.leased.drain(..).rev() {
            queued.redeliveries += 1;
            queued.message.redelivered = true;
            if queued.redeliveries > max {
                warn!(
                    queue = %queue,
                    redeliveries = queued.redeliveries,
                    "message exceeded redelivery cap, dead-lettering"
                );
                state
                    .queues
                    .entry(MemoryBroker::dlq(&queue))
                    .or_default()
                    .push_back(queued);
            } else {
                state.queues.entry(queue).or_default().push_front(queued);
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn receive(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, BrokerError> {
        self.ensure_open()?;
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        loop {
            // Register for wakeups before checking, so a concurrent commit
            // between the check and the await cannot be missed.
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_pop(queue) {
                return Ok(Some(message));
            }

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn send(&mut self, queue: &str, message: RawMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.pending.push((queue.to_string(), message));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.leased.clear();
        if self.pending.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.shared.state.lock().expect("broker state lock poisoned");
            for (queue, message) in self.pending.drain(..) {
                state.queues.entry(queue).or_default().push_back(QueuedMessage {
                    message,
                    redeliveries: 0,
                });
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.rollback_sync();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.rollback_sync();
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        // An abandoned session (worker aborted mid-scope) must not strand
        // its leases.
        if !self.closed {
            self.rollback_sync();
        }
    }
}
