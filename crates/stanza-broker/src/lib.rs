// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stanza Broker - the broker capability the stage runtime is written
//! against.
//!
//! The runtime needs exactly one thing from a message broker: transactional
//! sessions on which it can receive, send, commit and roll back. Everything
//! else (connection management, redelivery policy, dead-lettering) is the
//! broker's business. [`MemoryBroker`] is the in-process implementation used
//! by tests and embedded deployments.

#![deny(missing_docs)]

mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use memory::MemoryBroker;

/// Well-known header names stamped on broker messages.
pub mod headers {
    /// The flow's trace id, duplicated out of the body for broker-side
    /// filtering and logging.
    pub const TRACE_ID: &str = "trace_id";
    /// Stage id the message was sent from.
    pub const FROM: &str = "from";
}

/// A message as it travels over the broker.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Opaque message body (an encoded trace).
    pub body: Bytes,
    /// Broker headers. The runtime stamps at least
    /// [`headers::TRACE_ID`]; brokers may add their own.
    pub headers: HashMap<String, String>,
    /// True when the broker delivered this message before and rolled back.
    pub redelivered: bool,
}

impl RawMessage {
    /// Create a fresh (not redelivered) message.
    pub fn new(body: Bytes, headers: HashMap<String, String>) -> Self {
        Self {
            body,
            headers,
            redelivered: false,
        }
    }
}

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker itself has been shut down.
    #[error("broker is closed")]
    Closed,

    /// The session was closed and cannot be used further.
    #[error("session is closed")]
    SessionClosed,

    /// The underlying transport failed.
    #[error("broker transport failure: {0}")]
    Transport(String),
}

/// A transactional broker session.
///
/// All receives and sends since the last commit form one transaction. On
/// rollback the broker redelivers received messages and discards buffered
/// sends; the runtime treats a redelivered message as simply received again.
#[async_trait]
pub trait BrokerSession: Send {
    /// Receive the next message from `queue`, waiting at most `timeout`.
    /// Returns `Ok(None)` when the poll window elapses with nothing to do.
    async fn receive(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, BrokerError>;

    /// Buffer a message for `queue`; it becomes visible at commit.
    async fn send(&mut self, queue: &str, message: RawMessage) -> Result<(), BrokerError>;

    /// Commit the transaction: consume receives, publish buffered sends.
    async fn commit(&mut self) -> Result<(), BrokerError>;

    /// Roll back the transaction: redeliver receives, discard buffered
    /// sends.
    async fn rollback(&mut self) -> Result<(), BrokerError>;

    /// Close the session. An uncommitted transaction is rolled back.
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// A broker that can open transactional sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new session. Each stage worker holds its own.
    async fn session(&self) -> Result<Box<dyn BrokerSession>, BrokerError>;
}
