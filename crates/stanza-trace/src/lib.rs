// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stanza Trace - the flow envelope and its wire codec.
//!
//! Every message of a stanza flow carries a [`FlowTrace`]: the reified call
//! stack of what would be a synchronous call chain if all stages ran in one
//! process. The trace records:
//!
//! - `calls`: the append-only chain of hops (REQUEST / REPLY / NEXT / SEND);
//! - `stack`: the LIFO return frames pushed by requests and popped by
//!   replies, each holding the state of the endpoint that resumes when the
//!   frame pops;
//! - `properties`: dynamically scoped key/values that propagate through the
//!   rest of the flow;
//! - `binaries` / `strings`: sideband payloads that live for exactly one hop;
//! - the flow's trace id, which may only ever grow by appended suffixes.
//!
//! The [`TraceCodec`] trait is the wire contract; [`JsonTraceCodec`] is the
//! provided implementation (versioned, deterministic JSON).

#![deny(missing_docs)]

mod codec;
mod error;
mod trace;

pub use codec::{JsonTraceCodec, TraceCodec, WIRE_VERSION};
pub use error::{CodecError, TraceError};
pub use trace::{Call, CallKind, FlowTrace, Payload, StackFrame};
