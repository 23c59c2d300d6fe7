// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed SQL transaction supplier.

use std::any::Any;

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::{SqlError, SqlTx, SqlTxSupplier};

/// Supplies SQLite transactions from a shared pool.
#[derive(Clone)]
pub struct SqliteTxSupplier {
    pool: SqlitePool,
}

impl SqliteTxSupplier {
    /// Create a supplier over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlTxSupplier for SqliteTxSupplier {
    async fn begin(&self) -> Result<Box<dyn SqlTx>, SqlError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx { tx }))
    }
}

/// An open SQLite transaction. Rolls back when dropped uncommitted.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteTx {
    /// The transaction's connection, for running queries.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

#[async_trait]
impl SqlTx for SqliteTx {
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

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        sqlx::query("CREATE TABLE entries (id INTEGER PRIMARY KEY, label TEXT NOT NULL)")
            .execute(&pool)
            .await
            .expect("Failed to create table");

        pool
    }

    async fn count(pool: &SqlitePool) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries")
            .fetch_one(pool)
            .await
            .expect("count query failed");
        row.0
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let pool = test_pool().await;
        let supplier = SqliteTxSupplier::new(pool.clone());

        let mut tx = supplier.begin().await.unwrap();
        let sqlite = tx
            .as_any_mut()
            .downcast_mut::<SqliteTx>()
            .expect("sqlite transaction");
        sqlx::query("INSERT INTO entries (label) VALUES ('a')")
            .execute(&mut *sqlite.conn())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count(&pool).await, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let pool = test_pool().await;
        let supplier = SqliteTxSupplier::new(pool.clone());

        let mut tx = supplier.begin().await.unwrap();
        let sqlite = tx
            .as_any_mut()
            .downcast_mut::<SqliteTx>()
            .expect("sqlite transaction");
        sqlx::query("INSERT INTO entries (label) VALUES ('a')")
            .execute(&mut *sqlite.conn())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(count(&pool).await, 0);
    }

    #[tokio::test]
    async fn test_drop_behaves_like_rollback() {
        let pool = test_pool().await;
        let supplier = SqliteTxSupplier::new(pool.clone());

        {
            let mut tx = supplier.begin().await.unwrap();
            let sqlite = tx.as_any_mut().downcast_mut::<SqliteTx>().unwrap();
            sqlx::query("INSERT INTO entries (label) VALUES ('a')")
                .execute(&mut *sqlite.conn())
                .await
                .unwrap();
            // Dropped without commit.
        }

        assert_eq!(count(&pool).await, 0);
    }
}
