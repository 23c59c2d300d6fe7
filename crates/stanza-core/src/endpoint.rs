// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoints: ordered compositions of stages sharing a state and reply
//! type.
//!
//! An endpoint is assembled during factory setup: any number of `stage`
//! calls followed by exactly one `last_stage`, which finalizes it (and
//! starts it, if the factory is already running). The first stage listens
//! on the endpoint id itself; later stages listen on `"{endpoint}.{index}"`.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::{ProcessContext, StageMeta};
use crate::error::Result;
use crate::factory::FactoryInner;
use crate::stage::{erase_processor, ErasedProcessor, StageShared};

/// Marker for types that travel as message payloads.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Marker for endpoint state types. A stage entered without seeded state
/// starts from `Default`.
pub trait State: Serialize + DeserializeOwned + Default + Send + 'static {}

impl<T> State for T where T: Serialize + DeserializeOwned + Default + Send + 'static {}

/// A stage's processing logic.
#[async_trait]
pub trait StageProcessor<S, I>: Send + Sync {
    /// Process one incoming message within the stage's transactional
    /// scope.
    async fn process(&self, ctx: &mut ProcessContext<S>, msg: I) -> Result<()>;
}

/// Processing logic for a last stage: the returned value is the endpoint's
/// reply.
#[async_trait]
pub trait ReplyProcessor<S, I, R>: Send + Sync {
    /// Process one incoming message; the `Ok` value is passed to `reply`.
    async fn process(&self, ctx: &mut ProcessContext<S>, msg: I) -> Result<R>;
}

/// Adapts a [`ReplyProcessor`] into a plain stage that replies with the
/// returned value.
struct ReplyAdapter<P, R> {
    inner: P,
    _reply: PhantomData<fn() -> R>,
}

#[async_trait]
impl<S, I, R, P> StageProcessor<S, I> for ReplyAdapter<P, R>
where
    S: State,
    I: Message,
    R: Message,
    P: ReplyProcessor<S, I, R>,
{
    async fn process(&self, ctx: &mut ProcessContext<S>, msg: I) -> Result<()> {
        let reply = self.inner.process(ctx, msg).await?;
        ctx.reply(&reply)
    }
}

/// Shared, type-erased registration of one endpoint.
pub(crate) struct EndpointShared {
    pub id: String,
    pub state_type: &'static str,
    pub reply_type: &'static str,
    /// Worker count all stages inherit; `0` inherits the factory default.
    pub concurrency: AtomicUsize,
    stages: Mutex<Vec<Arc<StageShared>>>,
    finalized: AtomicBool,
}

impl EndpointShared {
    pub(crate) fn new(id: String, state_type: &'static str, reply_type: &'static str) -> Self {
        Self {
            id,
            state_type,
            reply_type,
            concurrency: AtomicUsize::new(0),
            stages: Mutex::new(Vec::new()),
            finalized: AtomicBool::new(false),
        }
    }

    pub(crate) fn stages(&self) -> Vec<Arc<StageShared>> {
        self.stages
            .lock()
            .expect("endpoint stage list lock poisoned")
            .clone()
    }

    /// Append a stage.
    ///
    /// # Panics
    ///
    /// Panics when the endpoint is already finalized - stages can only be
    /// added before `last_stage`.
    fn add_stage(&self, incoming_type: &'static str, processor: ErasedProcessor) -> Arc<StageShared> {
        if self.finalized.load(Ordering::SeqCst) {
            panic!(
                "endpoint '{}' is finalized; stages cannot be added after last_stage",
                self.id
            );
        }
        let mut stages = self
            .stages
            .lock()
            .expect("endpoint stage list lock poisoned");
        let stage = StageShared::new(&self.id, stages.len(), incoming_type, processor);
        stages.push(Arc::clone(&stage));
        stage
    }

    /// Freeze the stage list and hand each stage its identity.
    fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            panic!("endpoint '{}' was finalized twice", self.id);
        }
        let stages = self.stages();
        for (index, stage) in stages.iter().enumerate() {
            let next_stage_id = stages.get(index + 1).map(|next| next.stage_id.clone());
            stage.set_meta(Arc::new(StageMeta {
                endpoint_id: self.id.clone(),
                stage_id: stage.stage_id.clone(),
                next_stage_id,
            }));
        }
        debug!(endpoint = %self.id, stages = stages.len(), "endpoint finalized");
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Start all stages. Idempotent; a no-op (with a warning) before
    /// finalization.
    pub(crate) fn start(&self, rt: &Arc<FactoryInner>) {
        if !self.is_finalized() {
            warn!(
                endpoint = %self.id,
                "endpoint started before last_stage was defined, deferring"
            );
            return;
        }
        let endpoint_concurrency = self.concurrency.load(Ordering::SeqCst);
        for stage in self.stages() {
            stage.start(rt, endpoint_concurrency);
        }
    }

    /// Stop all stages. Idempotent.
    pub(crate) async fn stop(&self, grace: Duration) {
        for stage in self.stages() {
            stage.stop(grace).await;
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.stages().iter().any(|stage| stage.is_running())
    }
}

/// Typed handle to a registered endpoint.
///
/// Cheap to clone; all clones configure the same registration.
pub struct Endpoint<S, R> {
    shared: Arc<EndpointShared>,
    factory: Arc<FactoryInner>,
    _types: PhantomData<fn(S, R)>,
}

impl<S, R> Clone for Endpoint<S, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            factory: Arc::clone(&self.factory),
            _types: PhantomData,
        }
    }
}

impl<S: State, R: Message> Endpoint<S, R> {
    pub(crate) fn new(shared: Arc<EndpointShared>, factory: Arc<FactoryInner>) -> Self {
        Self {
            shared,
            factory,
            _types: PhantomData,
        }
    }

    /// Append a non-terminal stage consuming messages of type `I`.
    ///
    /// # Panics
    ///
    /// Panics if the endpoint is already finalized.
    pub fn stage<I, P>(&self, processor: P) -> StageHandle
    where
        I: Message,
        P: StageProcessor<S, I> + 'static,
    {
        let stage = self
            .shared
            .add_stage(type_name::<I>(), erase_processor::<S, I, P>(processor));
        StageHandle { shared: stage }
    }

    /// Append the terminal stage and finalize the endpoint. The
    /// processor's return value becomes the endpoint's reply. Also starts
    /// the endpoint when the factory is already running.
    ///
    /// # Panics
    ///
    /// Panics if the endpoint is already finalized.
    pub fn last_stage<I, P>(&self, processor: P) -> StageHandle
    where
        I: Message,
        P: ReplyProcessor<S, I, R> + 'static,
    {
        let adapter = ReplyAdapter {
            inner: processor,
            _reply: PhantomData,
        };
        self.finish_with(
            type_name::<I>(),
            erase_processor::<S, I, ReplyAdapter<P, R>>(adapter),
        )
    }

    /// Append a terminal stage that never replies (terminator form) and
    /// finalize.
    pub(crate) fn terminal_stage_raw<I, P>(&self, processor: P) -> StageHandle
    where
        I: Message,
        P: StageProcessor<S, I> + 'static,
    {
        self.finish_with(type_name::<I>(), erase_processor::<S, I, P>(processor))
    }

    fn finish_with(&self, incoming_type: &'static str, processor: ErasedProcessor) -> StageHandle {
        let stage = self.shared.add_stage(incoming_type, processor);
        self.shared.finalize();
        if self.factory.started.load(Ordering::SeqCst) {
            self.shared.start(&self.factory);
        }
        StageHandle { shared: stage }
    }

    /// The endpoint id.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Start all stages of this endpoint. Requires a tokio runtime.
    pub fn start(&self) {
        self.shared.start(&self.factory);
    }

    /// Stop all stages, honoring the factory's stop grace period.
    pub async fn stop(&self) {
        self.shared.stop(self.factory.config.stop_grace).await;
    }

    /// True while any stage of this endpoint is running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Set the worker count all stages inherit. `0` means "inherit the
    /// factory default". Takes effect on the next start.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.shared
            .concurrency
            .store(concurrency, Ordering::SeqCst);
    }

    /// The configured endpoint concurrency (`0` = inherit).
    pub fn concurrency(&self) -> usize {
        self.shared.concurrency.load(Ordering::SeqCst)
    }

    /// True while the endpoint inherits the factory's default concurrency.
    pub fn is_concurrency_default(&self) -> bool {
        self.concurrency() == 0
    }

    /// Type name of the endpoint's state.
    pub fn state_type(&self) -> &'static str {
        self.shared.state_type
    }

    /// Type name of the endpoint's reply.
    pub fn reply_type(&self) -> &'static str {
        self.shared.reply_type
    }

    /// Type name of the first stage's incoming message, once a stage
    /// exists.
    pub fn incoming_type(&self) -> Option<&'static str> {
        self.shared.stages().first().map(|stage| stage.incoming_type)
    }

    /// Stage ids in invocation order.
    pub fn stage_ids(&self) -> Vec<String> {
        self.shared
            .stages()
            .iter()
            .map(|stage| stage.stage_id.clone())
            .collect()
    }

    /// Handles to all stages, in invocation order.
    pub fn stages(&self) -> Vec<StageHandle> {
        self.shared
            .stages()
            .into_iter()
            .map(|shared| StageHandle { shared })
            .collect()
    }
}

/// Handle for per-stage configuration and introspection.
#[derive(Clone)]
pub struct StageHandle {
    shared: Arc<StageShared>,
}

impl StageHandle {
    /// The stage id, which is also its queue id.
    pub fn stage_id(&self) -> &str {
        &self.shared.stage_id
    }

    /// Type name of this stage's incoming message.
    pub fn incoming_type(&self) -> &'static str {
        self.shared.incoming_type
    }

    /// Set this stage's worker count. `0` means "inherit". Takes effect on
    /// the next start.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.shared
            .concurrency
            .store(concurrency, Ordering::SeqCst);
    }

    /// The configured worker count (`0` = inherit).
    pub fn concurrency(&self) -> usize {
        self.shared.concurrency.load(Ordering::SeqCst)
    }

    /// True while this stage inherits its concurrency.
    pub fn is_concurrency_default(&self) -> bool {
        self.shared.is_concurrency_default()
    }

    /// True while this stage's workers are running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}
