// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minimal end-to-end flow on the in-memory broker: an initiator requests
//! a greeting service, and a terminator receives the reply.
//!
//! Run with: `cargo run -p stanza-examples --bin greeting-flow`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use stanza_broker::MemoryBroker;
use stanza_core::{
    FactoryConfig, ProcessContext, ReplyProcessor, Result, StageProcessor, StanzaFactory,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GreetingRequest {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GreetingReply {
    text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RequesterState {
    request_number: u64,
}

struct GreetingService;

#[async_trait]
impl ReplyProcessor<(), GreetingRequest, GreetingReply> for GreetingService {
    async fn process(
        &self,
        _ctx: &mut ProcessContext<()>,
        msg: GreetingRequest,
    ) -> Result<GreetingReply> {
        Ok(GreetingReply {
            text: format!("Hello, {}!", msg.name),
        })
    }
}

struct PrintReply;

#[async_trait]
impl StageProcessor<RequesterState, GreetingReply> for PrintReply {
    async fn process(
        &self,
        ctx: &mut ProcessContext<RequesterState>,
        msg: GreetingReply,
    ) -> Result<()> {
        info!(
            reply = %msg.text,
            request_number = ctx.state.request_number,
            trace_id = %ctx.trace_id(),
            "flow finished"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let factory = StanzaFactory::new(
        "greeting-demo",
        Arc::new(MemoryBroker::new()),
        FactoryConfig::from_env()?,
    );

    factory.single::<GreetingRequest, GreetingReply, _>("greet.service", GreetingService);
    factory.terminator::<GreetingReply, RequesterState, _>("greet.done", PrintReply);
    factory.start();

    factory
        .initiator("greet.main")
        .initiate(|init| {
            init.trace_id("demo-1")
                .from("greet.main")
                .to("greet.service")
                .reply_to("greet.done");
            init.reply_state(&RequesterState { request_number: 1 })?;
            init.request(&GreetingRequest {
                name: "stanza".to_string(),
            })
        })
        .await?;

    // Give the flow a moment to run through its three stages.
    tokio::time::sleep(Duration::from_millis(500)).await;
    factory.stop().await;
    Ok(())
}
