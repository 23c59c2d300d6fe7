// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error taxonomy for stage processing.
//!
//! Everything that can go wrong inside a transactional scope maps to one
//! [`ProcessError`] kind. The coordinator catches each error exactly once,
//! logs it with its kind, and turns it into the commit/rollback decision.

use std::fmt;

use thiserror::Error;

use crate::sql::SqlError;
use stanza_broker::BrokerError;
use stanza_trace::CodecError;

/// Result alias for stage processing.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Which SQL operation a database failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOp {
    /// Acquiring the connection and entering the transaction.
    Begin,
    /// Committing the transaction.
    Commit,
    /// Rolling the transaction back.
    Rollback,
    /// Releasing the connection.
    Close,
}

impl fmt::Display for SqlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Close => "close",
        })
    }
}

/// Errors surfacing from (or into) a stage's transactional scope.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// User code signalled that the incoming message is unprocessable. The
    /// scope rolls back and the broker's redelivery policy applies.
    #[error("message refused: {0}")]
    Refused(String),

    /// User code failed.
    #[error("processing failure: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Inbound decode or outbound encode failed.
    #[error("serialization failure: {0}")]
    Serialization(#[from] CodecError),

    /// A database operation failed.
    #[error("database failure during {op}: {source}")]
    Sql {
        /// The operation that failed.
        op: SqlOp,
        /// The underlying failure.
        #[source]
        source: SqlError,
    },

    /// A broker operation failed.
    #[error("broker failure: {0}")]
    Broker(#[from] BrokerError),

    /// More than one of request/reply/next was invoked in one stage.
    #[error("stage '{stage}' attempted more than one outgoing flow message")]
    MultipleOutgoing {
        /// The offending stage.
        stage: String,
    },

    /// An operation was invoked where its preconditions do not hold.
    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    /// Control left the transactional scope along an unaccounted path.
    #[error("internal invariant violation: {0}")]
    Invariant(String),
}

impl ProcessError {
    /// Refuse the current message, rolling back the scope.
    pub fn refused(reason: impl Into<String>) -> Self {
        Self::Refused(reason.into())
    }

    /// Wrap a user-code failure.
    pub fn failed(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(source.into())
    }

    /// Short kind tag used in structured logs.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Refused(_) => "refused",
            Self::Failed(_) => "user",
            Self::Serialization(_) => "serialization",
            Self::Sql { .. } => "database",
            Self::Broker(_) => "broker",
            Self::MultipleOutgoing { .. } => "multiple-outgoing",
            Self::IllegalOperation(_) => "illegal-operation",
            Self::Invariant(_) => "invariant",
        }
    }
}

impl From<sqlx::Error> for ProcessError {
    fn from(err: sqlx::Error) -> Self {
        ProcessError::failed(err)
    }
}
