// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The connection-supplier capability for database work inside a stage.
//!
//! A stage that wants database access asks its process context for the
//! transaction; the supplier is only consulted on that first ask. The
//! coordinator then owns the demarcation: commit strictly before the broker
//! commit on success, rollback on any failure. Implementations are provided
//! for SQLite and PostgreSQL over `sqlx` pools; anything else can implement
//! the two traits.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::{PostgresTx, PostgresTxSupplier};
pub use self::sqlite::{SqliteTx, SqliteTxSupplier};

use std::any::Any;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the SQL capability.
#[derive(Debug, Error)]
pub enum SqlError {
    /// The underlying database driver failed.
    #[error("database backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SqlError {
    /// Wrap a driver error.
    pub fn backend(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Backend(source.into())
    }
}

impl From<sqlx::Error> for SqlError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend(err)
    }
}

/// An open database transaction bound to one stage scope.
///
/// `commit` and `rollback` consume the transaction; dropping it without
/// either must behave like rollback (the `sqlx` implementations do).
#[async_trait]
pub trait SqlTx: Send {
    /// Downcast hook so user code can reach the concrete driver handle.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Commit and release the connection.
    async fn commit(self: Box<Self>) -> Result<(), SqlError>;

    /// Roll back and release the connection.
    async fn rollback(self: Box<Self>) -> Result<(), SqlError>;
}

/// Lazily supplies one transaction per stage scope that asks for one.
#[async_trait]
pub trait SqlTxSupplier: Send + Sync {
    /// Acquire a connection and enter a transaction (auto-commit off).
    async fn begin(&self) -> Result<Box<dyn SqlTx>, SqlError>;
}
