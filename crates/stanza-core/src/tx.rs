// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Best-Effort One-Phase-Commit coordinator.
//!
//! Each received message is processed inside one scope that binds the
//! broker transaction to at most one SQL transaction. The demarcation
//! order is fixed:
//!
//! 1. broker transaction is already open in the session
//! 2. processing runs (it may lazily open the SQL transaction)
//! 3. outgoing messages are sent into the broker transaction
//! 4. SQL commit
//! 5. broker commit
//!
//! If the broker commit fails after a successful SQL commit, the message is
//! redelivered while the database effects stand - that narrow window is the
//! price of not running two-phase commit, and user code is expected to be
//! idempotent. Any failure before step 4 rolls back SQL first, then the
//! broker; rollback failures are logged without masking the original error.
//! A panic escaping the processing future is an unaccounted exit path: it
//! is caught, logged as an invariant violation, and forces rollback.

use std::collections::HashMap;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::error::ProcessError;
use crate::sql::SqlTx;
use stanza_broker::{headers, BrokerError, BrokerSession, RawMessage};
use stanza_trace::{FlowTrace, TraceCodec};

/// One message bound for the broker, with its destination queue.
pub(crate) struct OutboundMessage {
    pub queue: String,
    pub message: RawMessage,
}

/// What a successfully processed stage hands to the coordinator.
pub(crate) struct FinishedStage {
    /// Outgoing flow messages (at most one flow continuation, plus any
    /// initiations), joining this scope's broker transaction.
    pub outgoing: Vec<FlowTrace>,
    /// The SQL transaction, if the stage opened one.
    pub sql: Option<Box<dyn SqlTx>>,
}

/// What a failed stage hands to the coordinator.
pub(crate) struct StageFailure {
    pub error: ProcessError,
    /// The SQL transaction, if one was opened before the failure.
    pub sql: Option<Box<dyn SqlTx>>,
}

impl StageFailure {
    /// A failure raised before any SQL transaction could exist.
    pub fn bare(error: ProcessError) -> Self {
        Self { error, sql: None }
    }
}

/// Encode a trace for the wire. The destination queue is the current
/// call's target; the trace id is duplicated into the headers.
pub(crate) fn to_raw_message(
    trace: &FlowTrace,
    codec: &dyn TraceCodec,
) -> Result<OutboundMessage, ProcessError> {
    let call = trace.current_call().ok_or_else(|| {
        ProcessError::Invariant("outgoing trace has no current call".to_string())
    })?;
    let body = codec.encode_trace(trace)?;
    let mut header_map = HashMap::new();
    header_map.insert(headers::TRACE_ID.to_string(), trace.trace_id().to_string());
    header_map.insert(headers::FROM.to_string(), call.from.clone());
    Ok(OutboundMessage {
        queue: call.to.clone(),
        message: RawMessage::new(body, header_map),
    })
}

/// Run one transactional scope around `work`.
///
/// Returns `Err` only when the broker session itself became unusable (the
/// caller should reopen it); every processing outcome is fully handled
/// here.
pub(crate) async fn run_scope<W>(
    stage_id: &str,
    session: &mut Box<dyn BrokerSession>,
    codec: &dyn TraceCodec,
    work: W,
) -> Result<(), BrokerError>
where
    W: Future<Output = Result<FinishedStage, StageFailure>>,
{
    match std::panic::AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(finished)) => commit_scope(stage_id, session, codec, finished).await,
        Ok(Err(failure)) => rollback_scope(stage_id, session, failure).await,
        Err(panic) => {
            // The SQL transaction, if any, was dropped with the future and
            // rolled back by its driver.
            let detail = panic_detail(panic);
            error!(
                stage = %stage_id,
                panic = %detail,
                "processing left the scope through an unaccounted path, forcing rollback"
            );
            finish_rollback(stage_id, session).await
        }
    }
}

async fn commit_scope(
    stage_id: &str,
    session: &mut Box<dyn BrokerSession>,
    codec: &dyn TraceCodec,
    finished: FinishedStage,
) -> Result<(), BrokerError> {
    let FinishedStage { outgoing, sql } = finished;

    // Encode everything up front so a codec failure takes the plain
    // rollback path with nothing sent.
    let mut messages = Vec::with_capacity(outgoing.len());
    for trace in &outgoing {
        match to_raw_message(trace, codec) {
            Ok(outbound) => messages.push(outbound),
            Err(error) => {
                return rollback_scope(stage_id, session, StageFailure { error, sql }).await;
            }
        }
    }

    for outbound in messages {
        if let Err(broker_err) = session.send(&outbound.queue, outbound.message).await {
            return rollback_scope(
                stage_id,
                session,
                StageFailure {
                    error: ProcessError::Broker(broker_err),
                    sql,
                },
            )
            .await;
        }
    }

    if let Some(sql) = sql {
        if let Err(sql_err) = sql.commit().await {
            error!(
                stage = %stage_id,
                error = %sql_err,
                "SQL commit failed, rolling back the broker transaction"
            );
            return finish_rollback(stage_id, session).await;
        }
        debug!(stage = %stage_id, "SQL transaction committed");
    }

    match session.commit().await {
        Ok(()) => {
            debug!(stage = %stage_id, "scope committed");
            Ok(())
        }
        Err(broker_err) => {
            // The one-phase-commit window: database effects stand, the
            // message will come back.
            error!(
                stage = %stage_id,
                error = %broker_err,
                "broker commit failed after SQL commit; expect a duplicate delivery"
            );
            let _ = session.rollback().await;
            Err(broker_err)
        }
    }
}

async fn rollback_scope(
    stage_id: &str,
    session: &mut Box<dyn BrokerSession>,
    failure: StageFailure,
) -> Result<(), BrokerError> {
    // The single log line for this error; everything downstream only adds
    // its own rollback problems.
    match &failure.error {
        ProcessError::Refused(reason) => {
            warn!(stage = %stage_id, reason = %reason, "message refused, rolling back");
        }
        other => {
            error!(
                stage = %stage_id,
                kind = other.kind(),
                error = %other,
                "stage processing failed, rolling back"
            );
        }
    }

    if let Some(sql) = failure.sql {
        if let Err(sql_err) = sql.rollback().await {
            error!(
                stage = %stage_id,
                error = %sql_err,
                "SQL rollback failed (original error already reported)"
            );
        }
    }

    finish_rollback(stage_id, session).await
}

async fn finish_rollback(
    stage_id: &str,
    session: &mut Box<dyn BrokerSession>,
) -> Result<(), BrokerError> {
    match session.rollback().await {
        Ok(()) => Ok(()),
        Err(broker_err) => {
            error!(
                stage = %stage_id,
                error = %broker_err,
                "broker rollback failed, abandoning session"
            );
            Err(broker_err)
        }
    }
}

fn panic_detail(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::SqlError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use stanza_trace::{JsonTraceCodec, Payload};

    type Ops = Arc<Mutex<Vec<String>>>;

    fn record(ops: &Ops, op: impl Into<String>) {
        ops.lock().unwrap().push(op.into());
    }

    struct RecordingSession {
        ops: Ops,
        fail_commit: bool,
    }

    #[async_trait]
    impl BrokerSession for RecordingSession {
        async fn receive(
            &mut self,
            _queue: &str,
            _timeout: Duration,
        ) -> Result<Option<RawMessage>, BrokerError> {
            Ok(None)
        }

        async fn send(&mut self, queue: &str, _message: RawMessage) -> Result<(), BrokerError> {
            record(&self.ops, format!("send:{queue}"));
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), BrokerError> {
            record(&self.ops, "broker.commit");
            if self.fail_commit {
                return Err(BrokerError::Transport("commit refused".to_string()));
            }
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), BrokerError> {
            record(&self.ops, "broker.rollback");
            Ok(())
        }

        async fn close(&mut self) -> Result<(), BrokerError> {
            record(&self.ops, "broker.close");
            Ok(())
        }
    }

    struct RecordingSqlTx {
        ops: Ops,
        fail_commit: bool,
    }

    #[async_trait]
    impl SqlTx for RecordingSqlTx {
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }

        async fn commit(self: Box<Self>) -> Result<(), SqlError> {
            record(&self.ops, "sql.commit");
            if self.fail_commit {
                return Err(SqlError::backend(std::io::Error::other("sql down")));
            }
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), SqlError> {
            record(&self.ops, "sql.rollback");
            Ok(())
        }
    }

    fn outgoing_trace() -> FlowTrace {
        FlowTrace::new_send(
            "t1",
            "svc",
            "term",
            Payload::encode(&1i64).unwrap(),
            None,
        )
    }

    fn session(ops: &Ops, fail_commit: bool) -> Box<dyn BrokerSession> {
        Box::new(RecordingSession {
            ops: Arc::clone(ops),
            fail_commit,
        })
    }

    fn sql_tx(ops: &Ops, fail_commit: bool) -> Box<dyn SqlTx> {
        Box::new(RecordingSqlTx {
            ops: Arc::clone(ops),
            fail_commit,
        })
    }

    #[tokio::test]
    async fn test_success_commits_sql_before_broker() {
        let ops: Ops = Arc::default();
        let mut session = session(&ops, false);
        let codec = JsonTraceCodec::new();

        let work = async {
            Ok(FinishedStage {
                outgoing: vec![outgoing_trace()],
                sql: Some(sql_tx(&ops, false)),
            })
        };
        run_scope("svc", &mut session, &codec, work).await.unwrap();

        assert_eq!(
            *ops.lock().unwrap(),
            vec!["send:term", "sql.commit", "broker.commit"]
        );
    }

    #[tokio::test]
    async fn test_failure_rolls_back_sql_then_broker() {
        let ops: Ops = Arc::default();
        let mut session = session(&ops, false);
        let codec = JsonTraceCodec::new();

        let work = async {
            Err(StageFailure {
                error: ProcessError::refused("bad message"),
                sql: Some(sql_tx(&ops, false)),
            })
        };
        run_scope("svc", &mut session, &codec, work).await.unwrap();

        assert_eq!(*ops.lock().unwrap(), vec!["sql.rollback", "broker.rollback"]);
    }

    #[tokio::test]
    async fn test_sql_commit_failure_rolls_back_broker() {
        let ops: Ops = Arc::default();
        let mut session = session(&ops, false);
        let codec = JsonTraceCodec::new();

        let work = async {
            Ok(FinishedStage {
                outgoing: vec![outgoing_trace()],
                sql: Some(sql_tx(&ops, true)),
            })
        };
        run_scope("svc", &mut session, &codec, work).await.unwrap();

        assert_eq!(
            *ops.lock().unwrap(),
            vec!["send:term", "sql.commit", "broker.rollback"]
        );
    }

    #[tokio::test]
    async fn test_broker_commit_failure_after_sql_commit_surfaces() {
        let ops: Ops = Arc::default();
        let mut session = session(&ops, true);
        let codec = JsonTraceCodec::new();

        let work = async {
            Ok(FinishedStage {
                outgoing: vec![outgoing_trace()],
                sql: Some(sql_tx(&ops, false)),
            })
        };
        let result = run_scope("svc", &mut session, &codec, work).await;

        // SQL committed, broker commit failed: the caller must reopen.
        assert!(result.is_err());
        assert_eq!(
            *ops.lock().unwrap(),
            vec!["send:term", "sql.commit", "broker.commit", "broker.rollback"]
        );
    }

    #[tokio::test]
    async fn test_panic_forces_rollback_and_is_contained() {
        let ops: Ops = Arc::default();
        let mut session = session(&ops, false);
        let codec = JsonTraceCodec::new();

        let work = async {
            if ops.lock().unwrap().is_empty() {
                panic!("stage exploded");
            }
            Ok(FinishedStage {
                outgoing: Vec::new(),
                sql: None,
            })
        };
        run_scope("svc", &mut session, &codec, work).await.unwrap();

        assert_eq!(*ops.lock().unwrap(), vec!["broker.rollback"]);
    }

    #[tokio::test]
    async fn test_empty_success_still_commits() {
        let ops: Ops = Arc::default();
        let mut session = session(&ops, false);
        let codec = JsonTraceCodec::new();

        let work = async {
            Ok(FinishedStage {
                outgoing: Vec::new(),
                sql: None,
            })
        };
        run_scope("svc", &mut session, &codec, work).await.unwrap();

        assert_eq!(*ops.lock().unwrap(), vec!["broker.commit"]);
    }
}
