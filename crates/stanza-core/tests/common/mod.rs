// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stanza-core flow tests.
//!
//! Provides a harness wiring an in-memory broker, a factory with quick
//! test timings, and the latch-resolving terminator most tests end in.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stanza_broker::MemoryBroker;
use stanza_core::sql::SqliteTxSupplier;
use stanza_core::{
    FactoryConfig, ProcessContext, Result, StageProcessor, StanzaFactory,
};
use stanza_test::{init_logging, TestLatch};

pub const INITIATOR: &str = "test.initiator";
pub const TERMINATOR: &str = "test.terminator";

/// The data value flowing through test services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataDto {
    pub number: i64,
    pub string: String,
}

impl DataDto {
    pub fn new(number: i64, string: impl Into<String>) -> Self {
        Self {
            number,
            string: string.into(),
        }
    }
}

/// The state value initiators send along for the terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StateDto {
    pub n1: i64,
    pub n2: f64,
}

impl StateDto {
    pub fn new(n1: i64, n2: f64) -> Self {
        Self { n1, n2 }
    }
}

/// Terminator that resolves the harness latch with everything it observed.
pub struct LatchTerminator {
    pub latch: TestLatch<DataDto, StateDto>,
}

#[async_trait]
impl StageProcessor<StateDto, DataDto> for LatchTerminator {
    async fn process(&self, ctx: &mut ProcessContext<StateDto>, msg: DataDto) -> Result<()> {
        self.latch.resolve_with_sideband(
            msg,
            ctx.state.clone(),
            ctx.trace().binaries().clone(),
            ctx.trace().strings().clone(),
        );
        Ok(())
    }
}

/// One broker + factory + latch, with timings tightened for tests.
pub struct TestHarness {
    pub broker: MemoryBroker,
    pub factory: StanzaFactory,
    pub latch: TestLatch<DataDto, StateDto>,
}

impl TestHarness {
    pub fn new() -> Self {
        init_logging();
        let broker = MemoryBroker::new();
        let factory = StanzaFactory::new(
            "test-factory",
            Arc::new(broker.clone()),
            test_config(),
        );
        Self {
            broker,
            factory,
            latch: TestLatch::new(),
        }
    }

    /// Harness whose stages may open SQLite transactions from `pool`.
    pub fn with_sqlite(pool: sqlx::SqlitePool) -> Self {
        init_logging();
        let broker = MemoryBroker::new();
        let factory = StanzaFactory::with_sql_supplier(
            "test-factory",
            Arc::new(broker.clone()),
            Arc::new(SqliteTxSupplier::new(pool)),
            test_config(),
        );
        Self {
            broker,
            factory,
            latch: TestLatch::new(),
        }
    }

    /// Register the standard latch terminator under [`TERMINATOR`].
    pub fn register_terminator(&self) {
        self.factory.terminator::<DataDto, StateDto, _>(
            TERMINATOR,
            LatchTerminator {
                latch: self.latch.clone(),
            },
        );
    }
}

pub fn test_config() -> FactoryConfig {
    FactoryConfig {
        default_concurrency: 2,
        poll_interval: Duration::from_millis(25),
        stop_grace: Duration::from_secs(2),
    }
}
