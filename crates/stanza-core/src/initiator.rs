// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow initiation: the entry point that puts the first message of a flow
//! on the wire.
//!
//! An [`Initiator`] is a zero-stage producer. Each `initiate` call opens a
//! transactional scope containing only sends; every message built through
//! the [`Initiate`] builder inside one scope is committed or rolled back as
//! a unit. Stages use the same builder for nested initiations, which join
//! the stage's own transaction instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ProcessError, Result};
use crate::factory::FactoryInner;
use crate::tx::to_raw_message;
use stanza_trace::{FlowTrace, Payload};

/// Builder for the messages of one initiation scope.
///
/// Addressing (`from`/`to`/`reply_to`/`trace_id`) and attachments
/// (properties, sideband) are plain setters; each `send`/`request` call
/// stamps the current settings onto one new flow message. Several messages
/// may be built in one scope and share its transaction.
pub struct Initiate {
    default_from: String,
    /// Set for in-stage initiations: user trace ids append to this.
    base_trace_id: Option<String>,
    trace_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    reply_to: Option<String>,
    reply_state: Option<Payload>,
    properties: BTreeMap<String, Payload>,
    binaries: BTreeMap<String, Vec<u8>>,
    strings: BTreeMap<String, String>,
    drafts: Vec<FlowTrace>,
}

impl Initiate {
    pub(crate) fn new(default_from: String) -> Self {
        Self {
            default_from,
            base_trace_id: None,
            trace_id: None,
            from: None,
            to: None,
            reply_to: None,
            reply_state: None,
            properties: BTreeMap::new(),
            binaries: BTreeMap::new(),
            strings: BTreeMap::new(),
            drafts: Vec::new(),
        }
    }

    pub(crate) fn in_flow(stage_id: String, flow_trace_id: String) -> Self {
        let mut initiate = Self::new(stage_id);
        initiate.base_trace_id = Some(flow_trace_id);
        initiate
    }

    /// Set the trace id for subsequent messages. Unset, a fresh UUID is
    /// used; inside a stage, the id is appended to the current flow's id so
    /// log tracking stays connected.
    pub fn trace_id(&mut self, trace_id: impl Into<String>) -> &mut Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Set the originator id recorded on subsequent messages.
    pub fn from(&mut self, from: impl Into<String>) -> &mut Self {
        self.from = Some(from.into());
        self
    }

    /// Set the target endpoint for subsequent messages.
    pub fn to(&mut self, to: impl Into<String>) -> &mut Self {
        self.to = Some(to.into());
        self
    }

    /// Set the endpoint a request's reply should be routed to, typically a
    /// terminator.
    pub fn reply_to(&mut self, endpoint_id: impl Into<String>) -> &mut Self {
        self.reply_to = Some(endpoint_id.into());
        self
    }

    /// Set the state the reply-to endpoint will observe when the reply
    /// arrives.
    pub fn reply_state<T: Serialize + ?Sized>(&mut self, state: &T) -> Result<&mut Self> {
        self.reply_state = Some(Payload::encode(state)?);
        Ok(self)
    }

    /// Set a trace property on subsequent messages.
    pub fn set_property<T: Serialize + ?Sized>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self> {
        self.properties.insert(name.into(), Payload::encode(value)?);
        Ok(self)
    }

    /// Attach a binary sideband entry to subsequent messages.
    pub fn add_binary(&mut self, key: impl Into<String>, payload: Vec<u8>) -> &mut Self {
        self.binaries.insert(key.into(), payload);
        self
    }

    /// Attach a string sideband entry to subsequent messages.
    pub fn add_string(&mut self, key: impl Into<String>, payload: impl Into<String>) -> &mut Self {
        self.strings.insert(key.into(), payload.into());
        self
    }

    /// Build a fire-and-forget message to the configured target.
    pub fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<()> {
        let data = Payload::encode(msg)?;
        let (from, to) = self.addressing()?;
        let trace = FlowTrace::new_send(self.effective_trace_id(), from, to, data, None);
        self.push_draft(trace);
        Ok(())
    }

    /// Build a fire-and-forget message that also seeds the target
    /// endpoint's state.
    pub fn send_with_state<T, St>(&mut self, msg: &T, state: &St) -> Result<()>
    where
        T: Serialize + ?Sized,
        St: Serialize + ?Sized,
    {
        let data = Payload::encode(msg)?;
        let state = Payload::encode(state)?;
        let (from, to) = self.addressing()?;
        let trace = FlowTrace::new_send(self.effective_trace_id(), from, to, data, Some(state));
        self.push_draft(trace);
        Ok(())
    }

    /// Build a request to the configured target, with the reply routed to
    /// the configured reply-to endpoint.
    pub fn request<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<()> {
        let data = Payload::encode(msg)?;
        let (from, to) = self.addressing()?;
        let reply_to = self.reply_to.clone().ok_or_else(|| {
            ProcessError::IllegalOperation(
                "request requires reply_to: a reply with nowhere to go would be lost".to_string(),
            )
        })?;
        let trace = FlowTrace::new_request(
            self.effective_trace_id(),
            from,
            to,
            data,
            reply_to,
            self.reply_state.clone(),
        );
        self.push_draft(trace);
        Ok(())
    }

    pub(crate) fn into_drafts(self) -> Vec<FlowTrace> {
        self.drafts
    }

    fn addressing(&self) -> Result<(String, String)> {
        let from = self
            .from
            .clone()
            .unwrap_or_else(|| self.default_from.clone());
        let to = self.to.clone().ok_or_else(|| {
            ProcessError::IllegalOperation("no target endpoint set (call to(..) first)".to_string())
        })?;
        Ok((from, to))
    }

    fn effective_trace_id(&self) -> String {
        match (&self.base_trace_id, &self.trace_id) {
            (Some(base), Some(user)) => format!("{base}|{user}"),
            (Some(base), None) => base.clone(),
            (None, Some(user)) => user.clone(),
            (None, None) => Uuid::new_v4().to_string(),
        }
    }

    fn push_draft(&mut self, mut trace: FlowTrace) {
        for (name, value) in &self.properties {
            trace.set_property(name.clone(), value.clone());
        }
        for (key, payload) in &self.binaries {
            trace.add_binary(key.clone(), payload.clone());
        }
        for (key, payload) in &self.strings {
            trace.add_string(key.clone(), payload.clone());
        }
        self.drafts.push(trace);
    }
}

/// Entry point that starts flows from outside any stage.
///
/// Obtained from the factory by id; cheap to clone and share.
#[derive(Clone)]
pub struct Initiator {
    id: String,
    inner: Arc<FactoryInner>,
}

impl Initiator {
    pub(crate) fn new(id: String, inner: Arc<FactoryInner>) -> Self {
        Self { id, inner }
    }

    /// This initiator's id, used as the default `from` on its messages.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run one initiation scope: build messages with the closure, then send
    /// and commit them as one broker transaction.
    pub async fn initiate<F>(&self, configure: F) -> Result<()>
    where
        F: FnOnce(&mut Initiate) -> Result<()>,
    {
        let mut builder = Initiate::new(self.id.clone());
        configure(&mut builder)?;
        let drafts = builder.into_drafts();

        let mut session = self.inner.broker.session().await?;
        let result = send_all(&mut session, self.inner.codec.as_ref(), &drafts).await;
        if result.is_err() {
            if let Err(rollback_err) = session.rollback().await {
                warn!(
                    initiator = %self.id,
                    error = %rollback_err,
                    "rollback after failed initiation also failed"
                );
            }
        }
        let _ = session.close().await;
        result
    }
}

async fn send_all(
    session: &mut Box<dyn stanza_broker::BrokerSession>,
    codec: &dyn stanza_trace::TraceCodec,
    drafts: &[FlowTrace],
) -> Result<()> {
    for trace in drafts {
        let outbound = to_raw_message(trace, codec)?;
        session.send(&outbound.queue, outbound.message).await?;
    }
    session.commit().await?;
    debug!(messages = drafts.len(), "initiation committed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanza_trace::CallKind;

    #[test]
    fn test_send_requires_target() {
        let mut initiate = Initiate::new("init".to_string());
        assert!(matches!(
            initiate.send(&42i64),
            Err(ProcessError::IllegalOperation(_))
        ));
    }

    #[test]
    fn test_request_requires_reply_to() {
        let mut initiate = Initiate::new("init".to_string());
        initiate.to("svc");
        assert!(matches!(
            initiate.request(&42i64),
            Err(ProcessError::IllegalOperation(_))
        ));
    }

    #[test]
    fn test_send_builds_send_trace_with_generated_id() {
        let mut initiate = Initiate::new("init".to_string());
        initiate.to("term");
        initiate.send(&42i64).unwrap();
        let drafts = initiate.into_drafts();
        assert_eq!(drafts.len(), 1);
        let call = drafts[0].current_call().unwrap();
        assert_eq!(call.kind, CallKind::Send);
        assert_eq!(call.from, "init");
        assert_eq!(call.to, "term");
        assert!(!drafts[0].trace_id().is_empty());
        assert!(drafts[0].stack().is_empty());
    }

    #[test]
    fn test_request_builds_frame_with_reply_state() {
        let mut initiate = Initiate::new("init".to_string());
        initiate.to("svc").reply_to("term");
        initiate.reply_state(&7i64).unwrap();
        initiate.trace_id("flow-1");
        initiate.request(&42i64).unwrap();
        let drafts = initiate.into_drafts();
        let trace = &drafts[0];
        assert_eq!(trace.trace_id(), "flow-1");
        assert_eq!(trace.stack().len(), 1);
        assert_eq!(trace.current_frame().unwrap().reply_to, "term");
        assert!(trace.current_frame().unwrap().state.is_some());
        // The requested endpoint itself starts fresh.
        assert!(trace.current_state().is_none());
    }

    #[test]
    fn test_in_flow_trace_ids_append() {
        let mut initiate = Initiate::in_flow("svc.1".to_string(), "flow-1".to_string());
        initiate.to("audit");
        initiate.send(&1i64).unwrap();

        let mut with_user_id = Initiate::in_flow("svc.1".to_string(), "flow-1".to_string());
        with_user_id.to("audit").trace_id("audit-leg");
        with_user_id.send(&1i64).unwrap();

        assert_eq!(initiate.into_drafts()[0].trace_id(), "flow-1");
        assert_eq!(with_user_id.into_drafts()[0].trace_id(), "flow-1|audit-leg");
    }

    #[test]
    fn test_properties_and_sideband_stamped_on_drafts() {
        let mut initiate = Initiate::new("init".to_string());
        initiate.to("term");
        initiate.set_property("user", "alice").unwrap();
        initiate.add_binary("blob", vec![1, 2]);
        initiate.add_string("note", "hi");
        initiate.send(&1i64).unwrap();
        let drafts = initiate.into_drafts();
        assert_eq!(
            drafts[0]
                .property("user")
                .unwrap()
                .decode::<String>()
                .unwrap(),
            "alice"
        );
        assert_eq!(drafts[0].binary("blob"), Some(&[1u8, 2][..]));
        assert_eq!(drafts[0].string("note"), Some("hi"));
    }

    #[test]
    fn test_multiple_sends_in_one_scope() {
        let mut initiate = Initiate::new("init".to_string());
        initiate.to("a");
        initiate.send(&1i64).unwrap();
        initiate.to("b");
        initiate.send(&2i64).unwrap();
        assert_eq!(initiate.into_drafts().len(), 2);
    }
}
