// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The stage runtime: worker groups and the per-message processing loop.
//!
//! Each stage owns `concurrency` long-lived worker tasks. A worker holds
//! its own broker session and loops: receive with a poll timeout, decode,
//! process inside the coordinator's scope, repeat. Workers never die on
//! processing errors; transport errors make them reopen their session. Stop
//! is cooperative with a bounded grace period, after which workers are
//! aborted and their in-flight scope rolls back.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{ProcessContext, StageMeta};
use crate::endpoint::{Message, StageProcessor, State};
use crate::factory::FactoryInner;
use crate::sql::SqlTxSupplier;
use crate::tx::{run_scope, FinishedStage, StageFailure};
use stanza_trace::FlowTrace;

/// How long a worker pauses before retrying a failed session open.
const SESSION_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Everything a stage invocation needs besides the processor itself.
pub(crate) struct StageInvocation {
    pub trace: FlowTrace,
    pub meta: Arc<StageMeta>,
    pub sql_supplier: Option<Arc<dyn SqlTxSupplier>>,
}

/// A stage processor with its types erased, ready for the worker loop.
pub(crate) type ErasedProcessor = Arc<
    dyn Fn(StageInvocation) -> BoxFuture<'static, Result<FinishedStage, StageFailure>>
        + Send
        + Sync,
>;

/// Wrap a typed processor into the erased form: decode the incoming
/// payload and state, run the processor, then turn the context into
/// outgoing messages.
pub(crate) fn erase_processor<S, I, P>(processor: P) -> ErasedProcessor
where
    S: State,
    I: Message,
    P: StageProcessor<S, I> + 'static,
{
    let processor = Arc::new(processor);
    Arc::new(
        move |invocation: StageInvocation| -> BoxFuture<'static, Result<FinishedStage, StageFailure>> {
            let processor = Arc::clone(&processor);
            Box::pin(async move {
                let incoming: I = {
                    let call = invocation.trace.current_call().ok_or_else(|| {
                        StageFailure::bare(crate::error::ProcessError::Invariant(
                            "received a trace without any call".to_string(),
                        ))
                    })?;
                    call.data
                        .decode()
                        .map_err(|e| StageFailure::bare(e.into()))?
                };
                let state: S = match invocation.trace.current_state() {
                    Some(payload) => payload.decode().map_err(|e| StageFailure::bare(e.into()))?,
                    None => S::default(),
                };

                let mut ctx = ProcessContext::new(
                    state,
                    invocation.trace,
                    invocation.meta,
                    invocation.sql_supplier,
                );
                match processor.process(&mut ctx, incoming).await {
                    Ok(()) => ctx.finish(),
                    Err(error) => Err(StageFailure {
                        error,
                        sql: ctx.take_sql(),
                    }),
                }
            })
        },
    )
}

/// Shared, erased registration of one stage.
pub(crate) struct StageShared {
    pub stage_id: String,
    pub incoming_type: &'static str,
    pub processor: ErasedProcessor,
    /// Worker count override; `0` inherits from endpoint, then factory.
    pub concurrency: AtomicUsize,
    running: AtomicBool,
    meta: OnceLock<Arc<StageMeta>>,
    /// Lifecycle lock: start/stop serialize here, the hot path never takes
    /// it.
    workers: Mutex<Option<WorkerGroup>>,
}

impl StageShared {
    pub(crate) fn new(
        endpoint_id: &str,
        index: usize,
        incoming_type: &'static str,
        processor: ErasedProcessor,
    ) -> Arc<Self> {
        let stage_id = if index == 0 {
            endpoint_id.to_string()
        } else {
            format!("{endpoint_id}.{index}")
        };
        Arc::new(Self {
            stage_id,
            incoming_type,
            processor,
            concurrency: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            meta: OnceLock::new(),
            workers: Mutex::new(None),
        })
    }

    pub(crate) fn set_meta(&self, meta: Arc<StageMeta>) {
        // Finalization runs once; a second set is a no-op.
        let _ = self.meta.set(meta);
    }

    /// Start this stage's workers. Idempotent; must run inside a tokio
    /// runtime.
    pub(crate) fn start(self: &Arc<Self>, rt: &Arc<FactoryInner>, endpoint_concurrency: usize) {
        let Some(meta) = self.meta.get().cloned() else {
            warn!(
                stage = %self.stage_id,
                "stage started before its endpoint was finalized, deferring"
            );
            return;
        };
        let mut workers = self.workers.lock().expect("stage lifecycle lock poisoned");
        if workers.is_some() {
            debug!(stage = %self.stage_id, "stage already running");
            return;
        }
        let count = self.effective_concurrency(endpoint_concurrency, rt);
        *workers = Some(WorkerGroup::spawn(
            Arc::clone(self),
            meta,
            Arc::clone(rt),
            count,
        ));
        self.running.store(true, Ordering::SeqCst);
        info!(stage = %self.stage_id, workers = count, "stage started");
    }

    /// Stop this stage's workers, waiting up to `grace` for in-flight
    /// scopes. Idempotent.
    pub(crate) async fn stop(&self, grace: Duration) {
        let group = self
            .workers
            .lock()
            .expect("stage lifecycle lock poisoned")
            .take();
        if let Some(group) = group {
            group.shutdown(&self.stage_id, grace).await;
            info!(stage = %self.stage_id, "stage stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn is_concurrency_default(&self) -> bool {
        self.concurrency.load(Ordering::SeqCst) == 0
    }

    fn effective_concurrency(&self, endpoint_concurrency: usize, rt: &FactoryInner) -> usize {
        let own = self.concurrency.load(Ordering::SeqCst);
        if own > 0 {
            own
        } else if endpoint_concurrency > 0 {
            endpoint_concurrency
        } else {
            rt.config.resolved_default_concurrency()
        }
    }
}

/// The running workers of one stage.
struct WorkerGroup {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    fn spawn(
        stage: Arc<StageShared>,
        meta: Arc<StageMeta>,
        rt: Arc<FactoryInner>,
        workers: usize,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handles = (0..workers)
            .map(|worker_id| {
                let stage = Arc::clone(&stage);
                let meta = Arc::clone(&meta);
                let rt = Arc::clone(&rt);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, stage, meta, rt, cancel).await;
                })
            })
            .collect();
        Self { cancel, handles }
    }

    async fn shutdown(self, stage_id: &str, grace: Duration) {
        let Self { cancel, handles } = self;
        cancel.cancel();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                stage = %stage_id,
                grace_ms = grace.as_millis() as u64,
                "workers exceeded the stop grace period, aborting; in-flight scopes roll back"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    stage: Arc<StageShared>,
    meta: Arc<StageMeta>,
    rt: Arc<FactoryInner>,
    cancel: CancellationToken,
) {
    debug!(stage = %stage.stage_id, worker_id, "stage worker started");
    'sessions: while !cancel.is_cancelled() {
        let mut session = match rt.broker.session().await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    stage = %stage.stage_id,
                    error = %e,
                    "could not open broker session, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break 'sessions,
                    _ = tokio::time::sleep(SESSION_RETRY_PAUSE) => continue 'sessions,
                }
            }
        };

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = session.receive(&stage.stage_id, rt.config.poll_interval) => received,
            };

            match received {
                Ok(Some(raw)) => {
                    let codec = Arc::clone(&rt.codec);
                    let processor = Arc::clone(&stage.processor);
                    let sql_supplier = rt.sql_supplier.clone();
                    let invocation_meta = Arc::clone(&meta);
                    let work = async move {
                        let trace = codec
                            .decode_trace(&raw.body)
                            .map_err(|e| StageFailure::bare(e.into()))?;
                        processor(StageInvocation {
                            trace,
                            meta: invocation_meta,
                            sql_supplier,
                        })
                        .await
                    };
                    if run_scope(&stage.stage_id, &mut session, rt.codec.as_ref(), work)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {
                    // Nothing received inside the poll window: commit the
                    // empty transaction and poll again.
                    if let Err(e) = session.commit().await {
                        error!(
                            stage = %stage.stage_id,
                            error = %e,
                            "empty commit failed, reopening session"
                        );
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        stage = %stage.stage_id,
                        error = %e,
                        "receive failed, reopening session"
                    );
                    break;
                }
            }
        }

        let _ = session.close().await;
    }
    debug!(stage = %stage.stage_id, worker_id, "stage worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_processor() -> ErasedProcessor {
        Arc::new(|_invocation| {
            Box::pin(async {
                Ok(FinishedStage {
                    outgoing: Vec::new(),
                    sql: None,
                })
            })
        })
    }

    #[test]
    fn test_first_stage_id_equals_endpoint_id() {
        let stage = StageShared::new("orders", 0, "i64", noop_processor());
        assert_eq!(stage.stage_id, "orders");
    }

    #[test]
    fn test_later_stage_ids_carry_the_index() {
        let stage = StageShared::new("orders", 2, "i64", noop_processor());
        assert_eq!(stage.stage_id, "orders.2");
    }

    #[test]
    fn test_concurrency_defaults_to_inherit() {
        let stage = StageShared::new("orders", 0, "i64", noop_processor());
        assert!(stage.is_concurrency_default());
        stage.concurrency.store(4, Ordering::SeqCst);
        assert!(!stage.is_concurrency_default());
    }
}
