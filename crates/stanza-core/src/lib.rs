// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stanza Core - staged, stateless, transactional, message-driven services.
//!
//! A service is an **endpoint**: an ordered sequence of **stages**, each
//! consuming from its own queue, processing one message inside a
//! transactional scope, and typically emitting exactly one message. The
//! flow between stages and services uses request/reply semantics carried in
//! a flow trace, giving the developer the feel of a synchronous call stack
//! even though every stage runs on a different worker, and possibly a
//! different node.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────┐  send/request   ┌──────────────────────────────────────┐
//!  │ Initiator  │ ───────────────▶│               Broker                 │
//!  └────────────┘                 │   one queue per stage id             │
//!                                 └──────┬───────────────────────▲───────┘
//!                                        │ receive               │ send
//!                                 ┌──────▼───────────────────────┴───────┐
//!                                 │           Stage runtime              │
//!                                 │  N workers, each:                    │
//!                                 │   decode trace ─ run processor ─     │
//!                                 │   build outgoing ─ commit scope      │
//!                                 └──────┬───────────────────────────────┘
//!                                        │ lazy, per scope
//!                                 ┌──────▼───────┐
//!                                 │  SQL (sqlx)  │  commit before broker
//!                                 └──────────────┘
//! ```
//!
//! # The transactional scope
//!
//! Every received message is processed under Best-Effort One-Phase-Commit:
//!
//! | Step | On success | On failure |
//! |------|------------|------------|
//! | 1 | run processor | - |
//! | 2 | send outgoing messages | roll back SQL |
//! | 3 | commit SQL | roll back broker |
//! | 4 | commit broker | message redelivered |
//!
//! The SQL commit strictly precedes the broker commit. If the broker
//! commit then fails, the database effects stand and the message is
//! redelivered - the documented one-phase-commit window. Write idempotent
//! processors.
//!
//! # Assembling services
//!
//! ```ignore
//! use std::sync::Arc;
//! use stanza_broker::MemoryBroker;
//! use stanza_core::{FactoryConfig, StanzaFactory};
//!
//! let factory = StanzaFactory::new(
//!     "worknode",
//!     Arc::new(MemoryBroker::new()),
//!     FactoryConfig::from_env()?,
//! );
//!
//! // A stateless request/reply service:
//! factory.single("calc.double", DoubleProcessor);
//!
//! // A multi-stage service with shared state:
//! let orders = factory.staged::<OrderState, OrderReply>("orders.place");
//! orders.stage::<OrderRequest, _>(ReserveStock);
//! orders.last_stage::<StockReply, _>(ConfirmOrder);
//!
//! // A terminator receiving the final replies of flows:
//! factory.terminator("orders.done", RecordOutcome);
//!
//! factory.start();
//! factory
//!     .initiator("orders.web")
//!     .initiate(|init| {
//!         init.to("orders.place").reply_to("orders.done");
//!         init.request(&order)
//!     })
//!     .await?;
//! ```
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `STANZA_CONCURRENCY` | hardware threads | default workers per stage |
//! | `STANZA_POLL_INTERVAL_MS` | `250` | receive poll window |
//! | `STANZA_STOP_GRACE_MS` | `10000` | wait before aborting workers on stop |
//!
//! Concurrency is inherited stage ← endpoint ← factory; `0` at any level
//! means "inherit".
//!
//! # Delivery semantics
//!
//! At-least-once. A scope that rolls back (refused message, processing
//! failure, serialization failure, database failure) is redelivered by the
//! broker; dead-lettering is broker policy, not library policy.

#![deny(missing_docs)]

mod config;
mod context;
mod endpoint;
mod error;
mod factory;
mod initiator;
mod stage;
mod tx;

/// SQL transaction capability: supplier/transaction traits plus the SQLite
/// and PostgreSQL implementations.
pub mod sql;

pub use config::{ConfigError, FactoryConfig};
pub use context::ProcessContext;
pub use endpoint::{
    Endpoint, Message, ReplyProcessor, StageHandle, StageProcessor, State,
};
pub use error::{ProcessError, Result, SqlOp};
pub use factory::StanzaFactory;
pub use initiator::{Initiate, Initiator};

// The wire-contract types users touch when configuring a factory.
pub use stanza_trace::{FlowTrace, JsonTraceCodec, Payload, TraceCodec};
