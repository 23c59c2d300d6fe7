// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed SQL transaction supplier.

use std::any::Any;

use async_trait::async_trait;
use sqlx::postgres::PgConnection;
use sqlx::{PgPool, Postgres, Transaction};

use super::{SqlError, SqlTx, SqlTxSupplier};

/// Supplies PostgreSQL transactions from a shared pool.
#[derive(Clone)]
pub struct PostgresTxSupplier {
    pool: PgPool,
}

impl PostgresTxSupplier {
    /// Create a supplier over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlTxSupplier for PostgresTxSupplier {
    async fn begin(&self) -> Result<Box<dyn SqlTx>, SqlError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTx { tx }))
    }
}

/// An open PostgreSQL transaction. Rolls back when dropped uncommitted.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTx {
    /// The transaction's connection, for running queries.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl SqlTx for PostgresTx {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), SqlError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SqlError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
