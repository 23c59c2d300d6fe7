// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for trace construction and wire encoding.

use thiserror::Error;

/// Errors from flow-trace operations that violate the call/stack contract.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A reply was appended while the reply stack was empty.
    #[error("cannot append a reply call: the reply stack is empty")]
    EmptyStack,
}

/// Errors from encoding or decoding traces and payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A value could not be encoded.
    #[error("encode failure: {0}")]
    Encode(#[source] serde_json::Error),

    /// Wire bytes or a payload value could not be decoded.
    #[error("decode failure: {0}")]
    Decode(#[source] serde_json::Error),

    /// The wire envelope carries an unsupported schema version.
    #[error("unsupported wire version {found} (this build speaks {expected})")]
    Version {
        /// Version found in the envelope.
        found: u16,
        /// Version this build produces and accepts.
        expected: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stack_display() {
        let err = TraceError::EmptyStack;
        assert_eq!(
            err.to_string(),
            "cannot append a reply call: the reply stack is empty"
        );
    }

    #[test]
    fn test_version_display() {
        let err = CodecError::Version {
            found: 7,
            expected: 1,
        };
        assert_eq!(
            err.to_string(),
            "unsupported wire version 7 (this build speaks 1)"
        );
    }
}
