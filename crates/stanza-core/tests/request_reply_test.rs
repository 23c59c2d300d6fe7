// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single request/reply through one service.
//!
//! ```text
//! [Initiator] -> [Service] -> [Terminator]
//! ```

mod common;

use async_trait::async_trait;
use common::{DataDto, StateDto, TestHarness, INITIATOR, TERMINATOR};
use stanza_core::{ProcessContext, ReplyProcessor, Result, StageProcessor};

const SERVICE: &str = "test.service";

/// Doubles the number and marks the string, like any good service does.
struct DoublingService;

#[async_trait]
impl ReplyProcessor<(), DataDto, DataDto> for DoublingService {
    async fn process(&self, _ctx: &mut ProcessContext<()>, msg: DataDto) -> Result<DataDto> {
        Ok(DataDto::new(msg.number * 2, format!("{}:S", msg.string)))
    }
}

#[tokio::test]
async fn test_request_reply_with_reply_state() {
    let harness = TestHarness::new();
    harness.factory.single::<DataDto, DataDto, _>(SERVICE, DoublingService);
    harness.register_terminator();
    harness.factory.start();

    let dto = DataDto::new(42, "A");
    let sto = StateDto::new(420, 420.024);
    harness
        .factory
        .initiator(INITIATOR)
        .initiate(|init| {
            init.from(INITIATOR).to(SERVICE).reply_to(TERMINATOR);
            init.reply_state(&sto)?;
            init.request(&dto)
        })
        .await
        .unwrap();

    let result = harness.latch.wait().await;
    assert_eq!(result.data, DataDto::new(84, "A:S"));
    // The reply restores exactly the state the initiator sent along.
    assert_eq!(result.state, sto);

    harness.factory.stop().await;
}

/// First stage of a two-stage endpoint that answers directly, skipping its
/// own second stage.
struct EarlyReturnStage;

#[async_trait]
impl StageProcessor<StateDto, DataDto> for EarlyReturnStage {
    async fn process(&self, ctx: &mut ProcessContext<StateDto>, msg: DataDto) -> Result<()> {
        ctx.reply(&DataDto::new(msg.number, format!("{}:early", msg.string)))
    }
}

/// Second stage that must never run in this test.
struct UnreachableStage;

#[async_trait]
impl ReplyProcessor<StateDto, DataDto, DataDto> for UnreachableStage {
    async fn process(&self, _ctx: &mut ProcessContext<StateDto>, _msg: DataDto) -> Result<DataDto> {
        panic!("the early-returning endpoint must not reach its second stage");
    }
}

#[tokio::test]
async fn test_early_return_from_non_terminal_stage() {
    let harness = TestHarness::new();
    let endpoint = harness.factory.staged::<StateDto, DataDto>(SERVICE);
    endpoint.stage::<DataDto, _>(EarlyReturnStage);
    endpoint.last_stage::<DataDto, _>(UnreachableStage);
    harness.register_terminator();
    harness.factory.start();

    harness
        .factory
        .initiator(INITIATOR)
        .initiate(|init| {
            init.from(INITIATOR).to(SERVICE).reply_to(TERMINATOR);
            init.request(&DataDto::new(7, "A"))
        })
        .await
        .unwrap();

    let result = harness.latch.wait().await;
    assert_eq!(result.data, DataDto::new(7, "A:early"));

    harness.factory.stop().await;
}
