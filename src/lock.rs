use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend,
    IsolationLevel, Statement, TransactionTrait, Value,
};

use crate::config::ClosureIndexConfig;
use crate::error::ClosureIndexError;

/// Transaction scoping one closure-index operation.
///
/// Mutations open it with [`ScopedTransaction::mutation`], which on
/// PostgreSQL applies the configured isolation level and takes a
/// transaction-scoped advisory lock. Reads open a read-only snapshot.
/// Dropping the guard without [`ScopedTransaction::finish`] rolls back.
pub struct ScopedTransaction {
    txn: DatabaseTransaction,
}

impl ScopedTransaction {
    pub async fn mutation(
        config: &ClosureIndexConfig,
        db: &DatabaseConnection,
    ) -> Result<Self, ClosureIndexError> {
        if db.get_database_backend() != DbBackend::Postgres {
            return Ok(Self { txn: db.begin().await? });
        }

        let txn = db
            .begin_with_config(Some(config.isolation().into()), None)
            .await?;

        if let Some(key) = config.advisory_lock_strategy().key() {
            if let Err(err) = acquire_lock(&txn, key.as_str()).await {
                let _ = txn.rollback().await;
                return Err(err);
            }
            tracing::trace!(
                entity = config.entity_name(),
                hierarchy = config.hierarchy_name(),
                key = key.as_str(),
                "acquired advisory lock"
            );
        }

        Ok(Self { txn })
    }

    pub async fn snapshot(db: &DatabaseConnection) -> Result<Self, ClosureIndexError> {
        let txn = match db.get_database_backend() {
            DbBackend::Postgres => {
                db.begin_with_config(
                    Some(IsolationLevel::RepeatableRead),
                    Some(AccessMode::ReadOnly),
                )
                .await?
            }
            _ => db.begin().await?,
        };
        Ok(Self { txn })
    }

    pub fn connection(&self) -> &DatabaseTransaction {
        &self.txn
    }

    /// Commit when `result` is `Ok`, otherwise roll back and hand the
    /// original error back.
    pub async fn finish<T>(
        self,
        result: Result<T, ClosureIndexError>,
    ) -> Result<T, ClosureIndexError> {
        match result {
            Ok(value) => {
                self.txn.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.txn.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed after {err}");
                }
                Err(err)
            }
        }
    }
}

async fn acquire_lock(txn: &DatabaseTransaction, key: &str) -> Result<(), ClosureIndexError> {
    txn.execute(Statement::from_sql_and_values(
        DbBackend::Postgres,
        "SELECT pg_advisory_xact_lock(hashtext($1))",
        vec![Value::from(key)],
    ))
    .await?;
    Ok(())
}
