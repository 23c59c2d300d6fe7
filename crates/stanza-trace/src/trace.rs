// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The flow trace: the envelope carried with every message of a flow.
//!
//! A trace records the full call chain of a flow (append-only), the reply
//! stack that simulates a synchronous call stack across stages, dynamically
//! scoped properties, and single-hop sideband payloads. The operations that
//! move a flow forward are pure: each produces a new trace value for the next
//! hop, leaving the incoming trace untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, TraceError};

/// The kind of a call in the flow's call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallKind {
    /// Invoke an endpoint, pushing a return frame onto the reply stack.
    Request,
    /// Return to the endpoint recorded in the popped return frame.
    Reply,
    /// Pass directly to the next stage of the same endpoint.
    Next,
    /// Fire-and-forget to an endpoint; the stack is untouched.
    Send,
}

impl CallKind {
    /// Wire/diagnostic name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Reply => "REPLY",
            Self::Next => "NEXT",
            Self::Send => "SEND",
        }
    }
}

/// An encoded value together with the type name it was declared as.
///
/// The type name is diagnostic: decoding trusts the declared Rust type of the
/// receiving stage, not the name recorded by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Type name recorded at encode time.
    #[serde(rename = "type")]
    pub type_name: String,
    /// The encoded value.
    pub value: serde_json::Value,
}

impl Payload {
    /// Encode a value into a payload, recording its type name.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Ok(Self {
            type_name: std::any::type_name::<T>().to_string(),
            value: serde_json::to_value(value).map_err(CodecError::Encode)?,
        })
    }

    /// Decode the payload into the receiver's declared type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.value.clone()).map_err(CodecError::Decode)
    }
}

/// One hop in the flow's call chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// What kind of hop this is.
    pub kind: CallKind,
    /// Stage id the call was made from.
    pub from: String,
    /// Stage or endpoint id the call targets.
    pub to: String,
    /// The message payload.
    pub data: Payload,
}

/// A return-address frame on the reply stack.
///
/// The frame's state belongs to the endpoint that will resume when the frame
/// is popped by a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Stage id a reply should be routed to.
    pub reply_to: String,
    /// State to restore for the replied-to stage, if any was recorded.
    pub state: Option<Payload>,
}

/// The in-flight envelope of one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTrace {
    trace_id: String,
    calls: Vec<Call>,
    stack: Vec<StackFrame>,
    current_state: Option<Payload>,
    properties: BTreeMap<String, Payload>,
    binaries: BTreeMap<String, Vec<u8>>,
    strings: BTreeMap<String, String>,
}

impl FlowTrace {
    fn empty(trace_id: String) -> Self {
        Self {
            trace_id,
            calls: Vec::new(),
            stack: Vec::new(),
            current_state: None,
            properties: BTreeMap::new(),
            binaries: BTreeMap::new(),
            strings: BTreeMap::new(),
        }
    }

    /// Start a new flow with a single SEND call.
    ///
    /// With `initial_state` set, the receiving endpoint observes that state;
    /// the reply stack stays empty either way, so a reply from the receiver
    /// is a no-op.
    pub fn new_send(
        trace_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        data: Payload,
        initial_state: Option<Payload>,
    ) -> Self {
        let mut trace = Self::empty(trace_id.into());
        trace.calls.push(Call {
            kind: CallKind::Send,
            from: from.into(),
            to: to.into(),
            data,
        });
        trace.current_state = initial_state;
        trace
    }

    /// Start a new flow with a single REQUEST call.
    ///
    /// Pushes one return frame `{reply_to, reply_state}`; the requested
    /// endpoint itself starts with zero state.
    pub fn new_request(
        trace_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        data: Payload,
        reply_to: impl Into<String>,
        reply_state: Option<Payload>,
    ) -> Self {
        let mut trace = Self::empty(trace_id.into());
        trace.calls.push(Call {
            kind: CallKind::Request,
            from: from.into(),
            to: to.into(),
            data,
        });
        trace.stack.push(StackFrame {
            reply_to: reply_to.into(),
            state: reply_state,
        });
        trace
    }

    // Every add_call_* op produces the envelope of the *next* message: calls
    // grow by one, sideband is not inherited, properties and trace id are.
    fn next_hop(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            calls: self.calls.clone(),
            stack: self.stack.clone(),
            current_state: None,
            properties: self.properties.clone(),
            binaries: BTreeMap::new(),
            strings: BTreeMap::new(),
        }
    }

    /// Append a REQUEST call, pushing a return frame for the caller.
    ///
    /// `caller_state` is the caller's state, restored when the frame is
    /// popped by the matching reply. The requested endpoint starts fresh.
    pub fn add_call_request(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        data: Payload,
        reply_to: impl Into<String>,
        caller_state: Option<Payload>,
    ) -> Self {
        let mut next = self.next_hop();
        next.stack.push(StackFrame {
            reply_to: reply_to.into(),
            state: caller_state,
        });
        next.calls.push(Call {
            kind: CallKind::Request,
            from: from.into(),
            to: to.into(),
            data,
        });
        next
    }

    /// Append a REPLY call, popping the top return frame.
    ///
    /// The reply is routed to the popped frame's `reply_to`, and the frame's
    /// state becomes the state observed by the receiving stage.
    pub fn add_call_reply(
        &self,
        from: impl Into<String>,
        data: Payload,
    ) -> Result<Self, TraceError> {
        let mut next = self.next_hop();
        let frame = next.stack.pop().ok_or(TraceError::EmptyStack)?;
        next.current_state = frame.state;
        next.calls.push(Call {
            kind: CallKind::Reply,
            from: from.into(),
            to: frame.reply_to,
            data,
        });
        Ok(next)
    }

    /// Append a NEXT call, handing `state` to the next stage of the same
    /// endpoint. The stack is untouched.
    pub fn add_call_next(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        data: Payload,
        state: Option<Payload>,
    ) -> Self {
        let mut next = self.next_hop();
        next.current_state = state;
        next.calls.push(Call {
            kind: CallKind::Next,
            from: from.into(),
            to: to.into(),
            data,
        });
        next
    }

    /// Append a SEND call. The stack is untouched and the receiver starts
    /// with zero state.
    pub fn add_call_send(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        data: Payload,
    ) -> Self {
        let mut next = self.next_hop();
        next.calls.push(Call {
            kind: CallKind::Send,
            from: from.into(),
            to: to.into(),
            data,
        });
        next
    }

    /// The flow's trace id.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Append a suffix to the trace id. The id is otherwise immutable along
    /// the flow; appends are the only permitted change.
    pub fn append_trace_id(&mut self, suffix: &str) {
        self.trace_id.push_str(suffix);
    }

    /// The full call chain, oldest first. One entry per hop.
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// The call this message delivers, i.e. the most recent one.
    pub fn current_call(&self) -> Option<&Call> {
        self.calls.last()
    }

    /// The reply stack, bottom first.
    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }

    /// The top return frame, if any.
    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.stack.last()
    }

    /// State for the stage receiving the current call, if any was seeded.
    pub fn current_state(&self) -> Option<&Payload> {
        self.current_state.as_ref()
    }

    /// Look up a trace property.
    pub fn property(&self, name: &str) -> Option<&Payload> {
        self.properties.get(name)
    }

    /// All trace properties.
    pub fn properties(&self) -> &BTreeMap<String, Payload> {
        &self.properties
    }

    /// Set a trace property. Last write along the flow wins.
    pub fn set_property(&mut self, name: impl Into<String>, value: Payload) {
        self.properties.insert(name.into(), value);
    }

    /// Binary sideband of this message.
    pub fn binaries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.binaries
    }

    /// Look up a binary sideband entry.
    pub fn binary(&self, key: &str) -> Option<&[u8]> {
        self.binaries.get(key).map(Vec::as_slice)
    }

    /// Attach a binary sideband entry to this message. Sideband lives for
    /// exactly one hop.
    pub fn add_binary(&mut self, key: impl Into<String>, payload: Vec<u8>) {
        self.binaries.insert(key.into(), payload);
    }

    /// String sideband of this message.
    pub fn strings(&self) -> &BTreeMap<String, String> {
        &self.strings
    }

    /// Look up a string sideband entry.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(String::as_str)
    }

    /// Attach a string sideband entry to this message.
    pub fn add_string(&mut self, key: impl Into<String>, payload: impl Into<String>) {
        self.strings.insert(key.into(), payload.into());
    }
}
