// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire codec for the flow trace.
//!
//! The trace travels as a versioned envelope. Two processes interoperate iff
//! they agree on the wire version and codec; decoding a foreign version is
//! rejected up front instead of producing a half-parsed trace.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::trace::FlowTrace;

/// Wire schema version produced and accepted by this build.
pub const WIRE_VERSION: u16 = 1;

/// Encodes and decodes the trace envelope for the broker wire.
pub trait TraceCodec: Send + Sync {
    /// Encode a trace into wire bytes.
    fn encode_trace(&self, trace: &FlowTrace) -> Result<Bytes, CodecError>;

    /// Decode wire bytes into a trace.
    fn decode_trace(&self, bytes: &[u8]) -> Result<FlowTrace, CodecError>;
}

#[derive(Serialize)]
struct WireOut<'a> {
    v: u16,
    #[serde(flatten)]
    trace: &'a FlowTrace,
}

#[derive(Deserialize)]
struct WireIn {
    v: u16,
    #[serde(flatten)]
    trace: FlowTrace,
}

/// The JSON wire codec. Map keys are ordered, so equal traces encode to
/// identical bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTraceCodec;

impl JsonTraceCodec {
    /// Create the codec.
    pub fn new() -> Self {
        Self
    }
}

impl TraceCodec for JsonTraceCodec {
    fn encode_trace(&self, trace: &FlowTrace) -> Result<Bytes, CodecError> {
        let body = serde_json::to_vec(&WireOut {
            v: WIRE_VERSION,
            trace,
        })
        .map_err(CodecError::Encode)?;
        Ok(Bytes::from(body))
    }

    fn decode_trace(&self, bytes: &[u8]) -> Result<FlowTrace, CodecError> {
        let wire: WireIn = serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
        if wire.v != WIRE_VERSION {
            return Err(CodecError::Version {
                found: wire.v,
                expected: WIRE_VERSION,
            });
        }
        Ok(wire.trace)
    }
}
