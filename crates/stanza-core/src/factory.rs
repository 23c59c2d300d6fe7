// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The factory: registry of endpoints, creator of initiators, owner of the
//! shared runtime pieces (broker, codec, SQL supplier, configuration).
//!
//! Endpoints register during setup; `start` brings every finalized
//! endpoint up, and endpoints finalized while the factory is running start
//! immediately. Endpoint ids are unique - a duplicate registration is a
//! programming error and panics.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::FactoryConfig;
use crate::endpoint::{
    Endpoint, EndpointShared, Message, ReplyProcessor, StageProcessor, State,
};
use crate::initiator::Initiator;
use crate::sql::SqlTxSupplier;
use stanza_broker::Broker;
use stanza_trace::{JsonTraceCodec, TraceCodec};

/// Shared runtime of one factory: everything workers and initiators need.
pub(crate) struct FactoryInner {
    pub name: String,
    pub broker: Arc<dyn Broker>,
    pub codec: Arc<dyn TraceCodec>,
    pub sql_supplier: Option<Arc<dyn SqlTxSupplier>>,
    pub config: FactoryConfig,
    pub endpoints: Mutex<HashMap<String, Arc<EndpointShared>>>,
    pub started: AtomicBool,
}

/// Registry and lifecycle root of a set of endpoints.
///
/// Cheap to clone; all clones drive the same factory.
#[derive(Clone)]
pub struct StanzaFactory {
    inner: Arc<FactoryInner>,
}

impl StanzaFactory {
    /// Create a factory without database integration, using the JSON wire
    /// codec.
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>, config: FactoryConfig) -> Self {
        Self::with_codec(name, broker, Arc::new(JsonTraceCodec::new()), None, config)
    }

    /// Create a factory whose stages may open SQL transactions through
    /// `sql_supplier`, coordinated with each scope's broker transaction.
    pub fn with_sql_supplier(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        sql_supplier: Arc<dyn SqlTxSupplier>,
        config: FactoryConfig,
    ) -> Self {
        Self::with_codec(
            name,
            broker,
            Arc::new(JsonTraceCodec::new()),
            Some(sql_supplier),
            config,
        )
    }

    /// Fully general constructor with an explicit wire codec.
    pub fn with_codec(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        codec: Arc<dyn TraceCodec>,
        sql_supplier: Option<Arc<dyn SqlTxSupplier>>,
        config: FactoryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                name: name.into(),
                broker,
                codec,
                sql_supplier,
                config,
                endpoints: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// The factory name, used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The factory configuration.
    pub fn config(&self) -> &FactoryConfig {
        &self.inner.config
    }

    /// Register a multi-stage endpoint with state type `S` and reply type
    /// `R`. Define its stages on the returned handle, ending with
    /// `last_stage`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered.
    pub fn staged<S: State, R: Message>(&self, id: impl Into<String>) -> Endpoint<S, R> {
        let id = id.into();
        let shared = Arc::new(EndpointShared::new(
            id.clone(),
            type_name::<S>(),
            type_name::<R>(),
        ));
        {
            let mut endpoints = self
                .inner
                .endpoints
                .lock()
                .expect("endpoint registry lock poisoned");
            if endpoints.contains_key(&id) {
                panic!("endpoint id '{id}' is already registered");
            }
            endpoints.insert(id.clone(), Arc::clone(&shared));
        }
        debug!(factory = %self.inner.name, endpoint = %id, "endpoint registered");
        Endpoint::new(shared, Arc::clone(&self.inner))
    }

    /// Register a stateless single-stage endpoint whose processor's return
    /// value is its reply.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered.
    pub fn single<I, R, P>(&self, id: impl Into<String>, processor: P) -> Endpoint<(), R>
    where
        I: Message,
        R: Message,
        P: ReplyProcessor<(), I, R> + 'static,
    {
        let endpoint = self.staged::<(), R>(id);
        endpoint.last_stage::<I, P>(processor);
        endpoint
    }

    /// Register a terminator: a single-stage endpoint with state but no
    /// reply, typically the final destination of a flow.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered.
    pub fn terminator<I, S, P>(&self, id: impl Into<String>, processor: P) -> Endpoint<S, ()>
    where
        I: Message,
        S: State,
        P: StageProcessor<S, I> + 'static,
    {
        let endpoint = self.staged::<S, ()>(id);
        endpoint.terminal_stage_raw::<I, P>(processor);
        endpoint
    }

    /// Create an initiator. The id becomes the default `from` on its
    /// messages.
    pub fn initiator(&self, id: impl Into<String>) -> Initiator {
        Initiator::new(id.into(), Arc::clone(&self.inner))
    }

    /// Start every finalized endpoint. Idempotent; requires a tokio
    /// runtime. Endpoints finalized later start on their own.
    pub fn start(&self) {
        let first = !self.inner.started.swap(true, Ordering::SeqCst);
        for endpoint in self.endpoints_snapshot() {
            endpoint.start(&self.inner);
        }
        if first {
            info!(factory = %self.inner.name, "factory started");
        }
    }

    /// Stop every endpoint, waiting out the configured grace period for
    /// in-flight scopes. Idempotent.
    pub async fn stop(&self) {
        let grace = self.inner.config.stop_grace;
        for endpoint in self.endpoints_snapshot() {
            endpoint.stop(grace).await;
        }
        if self.inner.started.swap(false, Ordering::SeqCst) {
            info!(factory = %self.inner.name, "factory stopped");
        }
    }

    /// True while any endpoint is running.
    pub fn is_running(&self) -> bool {
        self.endpoints_snapshot()
            .iter()
            .any(|endpoint| endpoint.is_running())
    }

    /// Stop all endpoints and release broker resources. Per-worker
    /// sessions close as their workers exit.
    pub async fn close(&self) {
        self.stop().await;
        debug!(factory = %self.inner.name, "factory closed");
    }

    /// Ids of all registered endpoints, sorted.
    pub fn endpoint_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .endpoints
            .lock()
            .expect("endpoint registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn endpoints_snapshot(&self) -> Vec<Arc<EndpointShared>> {
        self.inner
            .endpoints
            .lock()
            .expect("endpoint registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}
