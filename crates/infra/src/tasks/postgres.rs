//! Postgres-backed claim store.
//!
//! A claim is an open transaction holding a row lock taken with
//! `FOR UPDATE SKIP LOCKED`, so concurrent claimants skip each other's rows instead
//! of blocking. Completing the claim deletes the row and commits; releasing it (or
//! dropping the claim) rolls back, which also releases the lock.
//!
//! Expected table:
//!
//! ```sql
//! CREATE TABLE billing_tasks (
//!     id          UUID PRIMARY KEY,
//!     account_id  UUID NOT NULL,
//!     task_type   TEXT NOT NULL,
//!     created     TIMESTAMPTZ NOT NULL,
//!     task_data   JSONB
//! );
//! CREATE INDEX billing_tasks_created_idx ON billing_tasks (created, id);
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tracing::{instrument, warn};
use uuid::Uuid;

use reckon_core::{AccountId, TaskId};

use super::store::{ClaimStore, ClaimTransaction, ClaimedTask};
use super::types::{TaskRecord, TaskType, TaskValue};
use crate::db::{map_sqlx_error, PgBridge};
use crate::error::StoreError;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS billing_tasks (
    id          UUID PRIMARY KEY,
    account_id  UUID NOT NULL,
    task_type   TEXT NOT NULL,
    created     TIMESTAMPTZ NOT NULL,
    task_data   JSONB
);
CREATE INDEX IF NOT EXISTS billing_tasks_created_idx ON billing_tasks (created, id);
"#;

/// Postgres claim store over the `billing_tasks` table.
#[derive(Debug, Clone)]
pub struct PostgresClaimStore {
    db: PgBridge,
}

impl PostgresClaimStore {
    pub fn new(db: PgBridge) -> Self {
        Self { db }
    }

    /// Create the table and index if missing.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.db.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            Ok(())
        })
    }
}

impl ClaimStore for PostgresClaimStore {
    #[instrument(skip(self), err)]
    fn claim(&self) -> Result<Option<ClaimedTask>, StoreError> {
        self.db.block_on(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            let row = sqlx::query(
                r#"
                SELECT id, account_id, task_type, created, task_data
                FROM billing_tasks
                ORDER BY created ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_task", e))?;

            let Some(row) = row else {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Ok(None);
            };

            let task = decode_task(
                row.try_get("id").map_err(|e| map_sqlx_error("decode_task", e))?,
                row.try_get("account_id").map_err(|e| map_sqlx_error("decode_task", e))?,
                row.try_get("task_type").map_err(|e| map_sqlx_error("decode_task", e))?,
                row.try_get("created").map_err(|e| map_sqlx_error("decode_task", e))?,
                row.try_get("task_data").map_err(|e| map_sqlx_error("decode_task", e))?,
            );

            let claim = PostgresClaim {
                db: self.db.clone(),
                tx,
                task_id: task.id,
            };
            Ok(Some(ClaimedTask::new(task, Box::new(claim))))
        })
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    fn delete(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.db.block_on(async {
            sqlx::query("DELETE FROM billing_tasks WHERE id = $1")
                .bind(task_id.as_uuid())
                .execute(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("delete_task", e))?;
            Ok(())
        })
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type), err)]
    fn save(&self, task: TaskRecord) -> Result<TaskId, StoreError> {
        let data = encode_task_data(&task.task_data)?;
        self.db.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO billing_tasks (id, account_id, task_type, created, task_data)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET
                    account_id = EXCLUDED.account_id,
                    task_type = EXCLUDED.task_type,
                    created = EXCLUDED.created,
                    task_data = EXCLUDED.task_data
                "#,
            )
            .bind(task.id.as_uuid())
            .bind(task.account_id.as_uuid())
            .bind(task.task_type.as_str())
            .bind(task.created)
            .bind(data)
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("save_task", e))?;
            Ok(task.id)
        })
    }
}

struct PostgresClaim {
    db: PgBridge,
    tx: Transaction<'static, Postgres>,
    task_id: TaskId,
}

impl ClaimTransaction for PostgresClaim {
    fn delete_and_commit(self: Box<Self>) -> Result<(), StoreError> {
        let PostgresClaim { db, mut tx, task_id } = *self;
        db.block_on(async move {
            sqlx::query("DELETE FROM billing_tasks WHERE id = $1")
                .bind(task_id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("complete_task", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))
        })
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let PostgresClaim { db, tx, .. } = *self;
        db.block_on(async move { tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e)) })
    }
}

fn encode_task_data(data: &BTreeMap<String, TaskValue>) -> Result<Option<serde_json::Value>, StoreError> {
    if data.is_empty() {
        return Ok(None);
    }
    serde_json::to_value(data)
        .map(Some)
        .map_err(|e| StoreError::storage(format!("failed to encode task data: {e}")))
}

/// Build a task from a stored row.
///
/// Unknown type tags and undecodable data do not fail the claim: the task is
/// handed out anyway so the runner can drain it.
fn decode_task(
    id: Uuid,
    account_id: Uuid,
    task_type: String,
    created: DateTime<Utc>,
    task_data: Option<serde_json::Value>,
) -> TaskRecord {
    let task_data = match task_data {
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!(task_id = %id, error = %e, "undecodable task data, ignoring");
            BTreeMap::new()
        }),
        None => BTreeMap::new(),
    };

    TaskRecord {
        id: TaskId::from_uuid(id),
        account_id: AccountId::from_uuid(account_id),
        task_type: TaskType::from_tag(&task_type),
        created,
        task_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn decodes_rows_with_unknown_tags_and_bad_data() {
        let created = Utc.with_ymd_and_hms(2020, 1, 1, 5, 0, 0).unwrap();
        let task = decode_task(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "SEND_REMINDER".to_string(),
            created,
            Some(json!(["not", "a", "map"])),
        );
        assert_eq!(task.task_type, TaskType::Unknown);
        assert!(task.task_data.is_empty());
        assert_eq!(task.created, created);
    }

    #[test]
    fn task_data_survives_encode_decode() {
        let mut data = BTreeMap::new();
        data.insert("period".to_string(), TaskValue::from("2020-01-01"));
        data.insert("attempt".to_string(), TaskValue::from(2i64));

        let encoded = encode_task_data(&data).unwrap();
        let task = decode_task(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "GENERATE_INVOICE".to_string(),
            Utc::now(),
            encoded,
        );
        assert_eq!(task.task_type, TaskType::GenerateInvoice);
        assert_eq!(task.data_str("period"), Some("2020-01-01"));
        assert_eq!(task.data_i64("attempt"), Some(2));
    }

    #[test]
    fn empty_task_data_is_stored_as_null() {
        assert_eq!(encode_task_data(&BTreeMap::new()).unwrap(), None);
    }
}
