// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The process context handed to every stage processor.
//!
//! The context owns the stage's decoded state, exposes the incoming trace,
//! and collects everything the stage wants to go out: at most one flow
//! continuation (request / reply / next), any number of nested initiations,
//! trace properties, sideband, a trace-id suffix, and the lazily opened SQL
//! transaction. After the processor returns, the runtime turns the context
//! into the outgoing messages of this scope.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{ProcessError, Result, SqlOp};
use crate::initiator::Initiate;
use crate::sql::{SqlTx, SqlTxSupplier};
use crate::tx::{FinishedStage, StageFailure};
use stanza_trace::{FlowTrace, Payload};

/// Identity of the stage an invocation runs in.
#[derive(Debug)]
pub(crate) struct StageMeta {
    pub endpoint_id: String,
    pub stage_id: String,
    /// Id of the following stage of this endpoint; `None` for the last
    /// stage.
    pub next_stage_id: Option<String>,
}

/// The one outgoing flow message a stage may produce.
enum OutgoingDraft {
    Request { to: String, data: Payload },
    Reply { data: Payload },
    /// A reply with no frame to return to: the permitted silent no-op. It
    /// still occupies the outgoing slot so a later request/next fails.
    ReplyDropped,
    Next { data: Payload },
}

/// Stage-side view of one message's processing.
///
/// `state` is the endpoint's state for this call, decoded from the trace
/// (or fresh). Mutate it directly; the value left when the processor
/// returns is what travels on `request` and `next`.
pub struct ProcessContext<S> {
    /// The endpoint's state for this call.
    pub state: S,
    trace: FlowTrace,
    meta: Arc<StageMeta>,
    outgoing: Option<OutgoingDraft>,
    initiations: Vec<FlowTrace>,
    trace_id_suffix: String,
    new_properties: BTreeMap<String, Payload>,
    out_binaries: BTreeMap<String, Vec<u8>>,
    out_strings: BTreeMap<String, String>,
    sql_supplier: Option<Arc<dyn SqlTxSupplier>>,
    sql: Option<Box<dyn SqlTx>>,
}

impl<S> ProcessContext<S> {
    pub(crate) fn new(
        state: S,
        trace: FlowTrace,
        meta: Arc<StageMeta>,
        sql_supplier: Option<Arc<dyn SqlTxSupplier>>,
    ) -> Self {
        Self {
            state,
            trace,
            meta,
            outgoing: None,
            initiations: Vec::new(),
            trace_id_suffix: String::new(),
            new_properties: BTreeMap::new(),
            out_binaries: BTreeMap::new(),
            out_strings: BTreeMap::new(),
            sql_supplier,
            sql: None,
        }
    }

    /// Id of the endpoint being processed.
    pub fn endpoint_id(&self) -> &str {
        &self.meta.endpoint_id
    }

    /// Id of the stage being processed. Equals the endpoint id for the
    /// first stage.
    pub fn stage_id(&self) -> &str {
        &self.meta.stage_id
    }

    /// The incoming trace.
    pub fn trace(&self) -> &FlowTrace {
        &self.trace
    }

    /// The flow's trace id.
    pub fn trace_id(&self) -> &str {
        self.trace.trace_id()
    }

    /// Append a suffix to the outgoing trace id. The id itself is immutable
    /// along the flow; appending is the only permitted change.
    pub fn append_trace_id(&mut self, suffix: &str) {
        self.trace_id_suffix.push_str(suffix);
    }

    /// Set a trace property visible to every later hop of this flow until
    /// overwritten.
    pub fn set_trace_property<T: Serialize + ?Sized>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        self.new_properties.insert(name.into(), Payload::encode(value)?);
        Ok(())
    }

    /// Read a trace property, seeing this stage's own writes first.
    pub fn trace_property<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let payload = self
            .new_properties
            .get(name)
            .or_else(|| self.trace.property(name));
        match payload {
            Some(payload) => Ok(Some(payload.decode()?)),
            None => Ok(None),
        }
    }

    /// A binary sideband entry of the incoming message.
    pub fn binary(&self, key: &str) -> Option<&[u8]> {
        self.trace.binary(key)
    }

    /// A string sideband entry of the incoming message.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.trace.string(key)
    }

    /// Attach a binary sideband entry to the outgoing message. Sideband
    /// lives for exactly one hop.
    pub fn add_binary(&mut self, key: impl Into<String>, payload: Vec<u8>) {
        self.out_binaries.insert(key.into(), payload);
    }

    /// Attach a string sideband entry to the outgoing message.
    pub fn add_string(&mut self, key: impl Into<String>, payload: impl Into<String>) {
        self.out_strings.insert(key.into(), payload.into());
    }

    /// Request another endpoint; its reply is routed to this endpoint's
    /// next stage, which resumes with the state left on the context.
    ///
    /// Fails on the last stage (there is no next stage to reply to) and
    /// when an outgoing flow message was already produced.
    pub fn request<T: Serialize + ?Sized>(&mut self, endpoint_id: &str, msg: &T) -> Result<()> {
        self.ensure_no_outgoing()?;
        if self.meta.next_stage_id.is_none() {
            return Err(ProcessError::IllegalOperation(format!(
                "request from '{}': the last stage has no next stage to receive the reply",
                self.meta.stage_id
            )));
        }
        let data = Payload::encode(msg)?;
        self.outgoing = Some(OutgoingDraft::Request {
            to: endpoint_id.to_string(),
            data,
        });
        Ok(())
    }

    /// Reply to the caller recorded on the reply stack.
    ///
    /// With nothing on the stack (terminator, or an endpoint invoked by a
    /// direct send) the reply is silently dropped, per the reply contract.
    pub fn reply<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<()> {
        self.ensure_no_outgoing()?;
        let data = Payload::encode(msg)?;
        if self.trace.stack().is_empty() {
            debug!(
                stage = %self.meta.stage_id,
                "reply with empty stack ignored"
            );
            self.outgoing = Some(OutgoingDraft::ReplyDropped);
            return Ok(());
        }
        self.outgoing = Some(OutgoingDraft::Reply { data });
        Ok(())
    }

    /// Pass directly to the next stage of this endpoint, carrying the state
    /// left on the context. Fails on the last stage.
    pub fn next<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<()> {
        self.ensure_no_outgoing()?;
        if self.meta.next_stage_id.is_none() {
            return Err(ProcessError::IllegalOperation(format!(
                "next from '{}': the last stage has no next stage",
                self.meta.stage_id
            )));
        }
        let data = Payload::encode(msg)?;
        self.outgoing = Some(OutgoingDraft::Next { data });
        Ok(())
    }

    /// Initiate messages of a new flow from within this stage. They join
    /// this scope's broker transaction, so they are only published if the
    /// stage commits.
    pub fn initiate<F>(&mut self, configure: F) -> Result<()>
    where
        F: FnOnce(&mut Initiate) -> Result<()>,
    {
        let mut builder = Initiate::in_flow(
            self.meta.stage_id.clone(),
            self.trace.trace_id().to_string(),
        );
        configure(&mut builder)?;
        self.initiations.extend(builder.into_drafts());
        Ok(())
    }

    /// The scope's SQL transaction, opened on first use and committed or
    /// rolled back by the coordinator together with the broker transaction.
    ///
    /// `T` is the concrete transaction type of the factory's supplier, e.g.
    /// [`crate::sql::SqliteTx`].
    pub async fn sql_tx<T: SqlTx + 'static>(&mut self) -> Result<&mut T> {
        if self.sql.is_none() {
            let supplier = self.sql_supplier.clone().ok_or_else(|| {
                ProcessError::IllegalOperation(
                    "no SQL supplier configured on this factory".to_string(),
                )
            })?;
            let tx = supplier.begin().await.map_err(|source| ProcessError::Sql {
                op: SqlOp::Begin,
                source,
            })?;
            self.sql = Some(tx);
        }
        self.sql
            .as_mut()
            .and_then(|tx| tx.as_any_mut().downcast_mut::<T>())
            .ok_or_else(|| {
                ProcessError::IllegalOperation(
                    "the scope's SQL transaction is not of the requested type".to_string(),
                )
            })
    }

    pub(crate) fn take_sql(&mut self) -> Option<Box<dyn SqlTx>> {
        self.sql.take()
    }

    fn ensure_no_outgoing(&self) -> Result<()> {
        if self.outgoing.is_some() {
            return Err(ProcessError::MultipleOutgoing {
                stage: self.meta.stage_id.clone(),
            });
        }
        Ok(())
    }
}

impl<S: Serialize> ProcessContext<S> {
    /// Turn the finished context into the scope's outgoing messages.
    pub(crate) fn finish(self) -> std::result::Result<FinishedStage, StageFailure> {
        let Self {
            state,
            trace,
            meta,
            outgoing,
            initiations,
            trace_id_suffix,
            new_properties,
            out_binaries,
            out_strings,
            sql_supplier: _,
            sql,
        } = self;

        match build_outgoing(
            &state,
            trace,
            &meta,
            outgoing,
            initiations,
            trace_id_suffix,
            new_properties,
            out_binaries,
            out_strings,
        ) {
            Ok(outgoing) => Ok(FinishedStage { outgoing, sql }),
            Err(error) => Err(StageFailure { error, sql }),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_outgoing<S: Serialize>(
    state: &S,
    trace: FlowTrace,
    meta: &StageMeta,
    outgoing: Option<OutgoingDraft>,
    initiations: Vec<FlowTrace>,
    trace_id_suffix: String,
    new_properties: BTreeMap<String, Payload>,
    out_binaries: BTreeMap<String, Vec<u8>>,
    out_strings: BTreeMap<String, String>,
) -> Result<Vec<FlowTrace>> {
    let continuation = match outgoing {
        None | Some(OutgoingDraft::ReplyDropped) => None,
        Some(OutgoingDraft::Request { to, data }) => {
            let next_stage = next_stage_of(meta)?;
            let caller_state = Payload::encode(state)?;
            Some(trace.add_call_request(&meta.stage_id, to, data, next_stage, Some(caller_state)))
        }
        Some(OutgoingDraft::Reply { data }) => Some(
            trace
                .add_call_reply(&meta.stage_id, data)
                .map_err(|_| {
                    ProcessError::Invariant(
                        "a reply with an empty stack slipped past the outgoing builder".to_string(),
                    )
                })?,
        ),
        Some(OutgoingDraft::Next { data }) => {
            let next_stage = next_stage_of(meta)?;
            let next_state = Payload::encode(state)?;
            Some(trace.add_call_next(&meta.stage_id, next_stage, data, Some(next_state)))
        }
    };

    let mut messages = Vec::new();
    if let Some(mut outgoing_trace) = continuation {
        if !trace_id_suffix.is_empty() {
            outgoing_trace.append_trace_id(&trace_id_suffix);
        }
        for (name, value) in new_properties {
            outgoing_trace.set_property(name, value);
        }
        for (key, payload) in out_binaries {
            outgoing_trace.add_binary(key, payload);
        }
        for (key, payload) in out_strings {
            outgoing_trace.add_string(key, payload);
        }
        messages.push(outgoing_trace);
    }
    messages.extend(initiations);
    Ok(messages)
}

fn next_stage_of(meta: &StageMeta) -> Result<String> {
    meta.next_stage_id.clone().ok_or_else(|| {
        ProcessError::Invariant(format!(
            "stage '{}' produced a flow continuation without a next stage",
            meta.stage_id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanza_trace::CallKind;

    fn meta(next: Option<&str>) -> Arc<StageMeta> {
        Arc::new(StageMeta {
            endpoint_id: "svc".to_string(),
            stage_id: "svc".to_string(),
            next_stage_id: next.map(str::to_string),
        })
    }

    fn incoming_request() -> FlowTrace {
        FlowTrace::new_request(
            "t1",
            "init",
            "svc",
            Payload::encode(&42i64).unwrap(),
            "term",
            None,
        )
    }

    fn ctx(next: Option<&str>, trace: FlowTrace) -> ProcessContext<i64> {
        ProcessContext::new(0i64, trace, meta(next), None)
    }

    #[test]
    fn test_second_outgoing_call_fails() {
        let mut ctx = ctx(Some("svc.1"), incoming_request());
        ctx.request("leaf", &1i64).unwrap();
        assert!(matches!(
            ctx.next(&2i64),
            Err(ProcessError::MultipleOutgoing { .. })
        ));
        assert!(matches!(
            ctx.reply(&3i64),
            Err(ProcessError::MultipleOutgoing { .. })
        ));
    }

    #[test]
    fn test_request_from_last_stage_fails() {
        let mut ctx = ctx(None, incoming_request());
        assert!(matches!(
            ctx.request("leaf", &1i64),
            Err(ProcessError::IllegalOperation(_))
        ));
    }

    #[test]
    fn test_next_from_last_stage_fails() {
        let mut ctx = ctx(None, incoming_request());
        assert!(matches!(
            ctx.next(&1i64),
            Err(ProcessError::IllegalOperation(_))
        ));
    }

    #[test]
    fn test_reply_with_empty_stack_is_silently_dropped() {
        let trace = FlowTrace::new_send("t1", "init", "term", Payload::encode(&1i64).unwrap(), None);
        let mut ctx = ctx(None, trace);
        ctx.reply(&1i64).unwrap();
        // The dropped reply still occupies the outgoing slot.
        assert!(matches!(
            ctx.reply(&2i64),
            Err(ProcessError::MultipleOutgoing { .. })
        ));
        let finished = ctx.finish().map_err(|f| f.error).unwrap();
        assert!(finished.outgoing.is_empty());
    }

    #[test]
    fn test_request_serializes_state_into_pushed_frame() {
        let mut ctx = ctx(Some("svc.1"), incoming_request());
        ctx.state = 99;
        ctx.request("leaf", &7i64).unwrap();
        let finished = ctx.finish().map_err(|f| f.error).unwrap();
        assert_eq!(finished.outgoing.len(), 1);
        let out = &finished.outgoing[0];
        let call = out.current_call().unwrap();
        assert_eq!(call.kind, CallKind::Request);
        assert_eq!(call.to, "leaf");
        let frame = out.current_frame().unwrap();
        assert_eq!(frame.reply_to, "svc.1");
        assert_eq!(
            frame.state.as_ref().unwrap().decode::<i64>().unwrap(),
            99
        );
    }

    #[test]
    fn test_reply_routes_to_popped_frame() {
        let mut ctx = ctx(None, incoming_request());
        ctx.reply(&84i64).unwrap();
        let finished = ctx.finish().map_err(|f| f.error).unwrap();
        let out = &finished.outgoing[0];
        let call = out.current_call().unwrap();
        assert_eq!(call.kind, CallKind::Reply);
        assert_eq!(call.to, "term");
        assert!(out.stack().is_empty());
    }

    #[test]
    fn test_next_carries_current_state() {
        let mut ctx = ctx(Some("svc.1"), incoming_request());
        ctx.state = 5;
        ctx.next(&1i64).unwrap();
        let finished = ctx.finish().map_err(|f| f.error).unwrap();
        let out = &finished.outgoing[0];
        let call = out.current_call().unwrap();
        assert_eq!(call.kind, CallKind::Next);
        assert_eq!(call.to, "svc.1");
        assert_eq!(out.current_state().unwrap().decode::<i64>().unwrap(), 5);
        // NEXT neither pushes nor pops.
        assert_eq!(out.stack().len(), 1);
    }

    #[test]
    fn test_properties_and_sideband_land_on_continuation() {
        let mut ctx = ctx(None, incoming_request());
        ctx.set_trace_property("user", "alice").unwrap();
        ctx.add_binary("blob", vec![9]);
        ctx.add_string("note", "hi");
        ctx.append_trace_id("|leg");
        ctx.reply(&1i64).unwrap();
        let finished = ctx.finish().map_err(|f| f.error).unwrap();
        let out = &finished.outgoing[0];
        assert_eq!(out.trace_id(), "t1|leg");
        assert_eq!(
            out.property("user").unwrap().decode::<String>().unwrap(),
            "alice"
        );
        assert_eq!(out.binary("blob"), Some(&[9u8][..]));
        assert_eq!(out.string("note"), Some("hi"));
    }

    #[test]
    fn test_own_property_writes_visible_to_reads() {
        let mut ctx = ctx(None, incoming_request());
        ctx.set_trace_property("user", "alice").unwrap();
        assert_eq!(
            ctx.trace_property::<String>("user").unwrap().as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn test_initiations_join_outgoing_without_continuation() {
        let mut ctx = ctx(None, incoming_request());
        ctx.initiate(|init| {
            init.to("audit");
            init.send(&1i64)
        })
        .unwrap();
        let finished = ctx.finish().map_err(|f| f.error).unwrap();
        assert_eq!(finished.outgoing.len(), 1);
        let out = &finished.outgoing[0];
        assert_eq!(out.current_call().unwrap().kind, CallKind::Send);
        assert_eq!(out.current_call().unwrap().from, "svc");
        assert_eq!(out.trace_id(), "t1");
    }

    #[tokio::test]
    async fn test_sql_without_supplier_is_illegal() {
        let mut ctx = ctx(None, incoming_request());
        let result = ctx.sql_tx::<crate::sql::SqliteTx>().await;
        assert!(matches!(result, Err(ProcessError::IllegalOperation(_))));
    }
}
