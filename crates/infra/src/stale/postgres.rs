//! Postgres adapters for stale-state reconciliation.
//!
//! - `PostgresStaleMarkerStore`: marker cursors over `stale_stream_markers`, locked
//!   with `FOR UPDATE SKIP LOCKED` inside a held transaction.
//! - `PostgresStaleBatchResolver`: calls a stored function that resolves one batch
//!   of stale rows for a tier and returns the count.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tracing::{instrument, warn};
use uuid::Uuid;

use reckon_core::StreamId;

use super::marker::{MarkerCursor, StaleMarker, StaleMarkerKey, StaleMarkerStore};
use super::tiered::StaleBatchResolver;
use crate::db::{is_safe_identifier, map_sqlx_error, PgBridge};
use crate::error::{ResolveError, StoreError};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stale_stream_markers (
    stream_id   UUID NOT NULL,
    kind        TEXT NOT NULL,
    created     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (stream_id, kind)
);
CREATE INDEX IF NOT EXISTS stale_stream_markers_kind_idx ON stale_stream_markers (kind, created);
"#;

#[derive(Debug, Clone)]
pub struct PostgresStaleMarkerStore {
    db: PgBridge,
}

impl PostgresStaleMarkerStore {
    pub fn new(db: PgBridge) -> Self {
        Self { db }
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.db.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            Ok(())
        })
    }

    /// Record that `(stream_id, kind)` is stale.
    ///
    /// The upsert waits on a cursor holding the same marker; if that cursor deletes
    /// it, the insert is retried and the new marker survives.
    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    pub fn mark(&self, stream_id: StreamId, kind: &str) -> Result<(), StoreError> {
        self.db.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO stale_stream_markers (stream_id, kind, created)
                VALUES ($1, $2, NOW())
                ON CONFLICT (stream_id, kind) DO UPDATE SET created = stale_stream_markers.created
                "#,
            )
            .bind(stream_id.as_uuid())
            .bind(kind)
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("mark_stale", e))?;
            Ok(())
        })
    }
}

impl StaleMarkerStore for PostgresStaleMarkerStore {
    #[instrument(skip(self, skip), fields(skipped = skip.len()), err)]
    fn open_cursor(
        &self,
        kind: &str,
        limit: usize,
        skip: &[StreamId],
    ) -> Result<Box<dyn MarkerCursor>, StoreError> {
        let skip: Vec<Uuid> = skip.iter().map(|s| *s.as_uuid()).collect();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.db.block_on(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            let rows = sqlx::query(
                r#"
                SELECT stream_id, kind, created
                FROM stale_stream_markers
                WHERE kind = $1 AND stream_id <> ALL($2)
                ORDER BY created ASC, stream_id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(kind)
            .bind(&skip)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("open_marker_cursor", e))?;

            let mut markers = Vec::with_capacity(rows.len());
            for row in rows {
                let stream_id: Uuid = row
                    .try_get("stream_id")
                    .map_err(|e| map_sqlx_error("decode_marker", e))?;
                let kind: String = row
                    .try_get("kind")
                    .map_err(|e| map_sqlx_error("decode_marker", e))?;
                let created: DateTime<Utc> = row
                    .try_get("created")
                    .map_err(|e| map_sqlx_error("decode_marker", e))?;
                markers.push(StaleMarker {
                    stream_id: StreamId::from_uuid(stream_id),
                    kind,
                    created,
                });
            }

            Ok(Box::new(PostgresMarkerCursor {
                db: self.db.clone(),
                tx: Some(tx),
                markers,
            }) as Box<dyn MarkerCursor>)
        })
    }
}

struct PostgresMarkerCursor {
    db: PgBridge,
    tx: Option<Transaction<'static, Postgres>>,
    markers: Vec<StaleMarker>,
}

impl MarkerCursor for PostgresMarkerCursor {
    fn markers(&self) -> &[StaleMarker] {
        &self.markers
    }

    fn delete(&mut self, key: &StaleMarkerKey) -> Result<(), StoreError> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::storage("marker cursor already closed"))?;
        self.db.block_on(async {
            sqlx::query("DELETE FROM stale_stream_markers WHERE stream_id = $1 AND kind = $2")
                .bind(key.stream_id.as_uuid())
                .bind(&key.kind)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete_marker", e))?;
            Ok(())
        })
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => self.db.block_on(async move {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for PostgresMarkerCursor {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let result = self.db.block_on(async move { tx.rollback().await });
            if let Err(e) = result {
                warn!(error = %map_sqlx_error("rollback", e), "failed to roll back marker cursor");
            }
        }
    }
}

/// Resolves stale rows by calling `<function>(tier TEXT, max_rows BIGINT) -> BIGINT`.
#[derive(Debug, Clone)]
pub struct PostgresStaleBatchResolver {
    db: PgBridge,
    sql: String,
}

impl PostgresStaleBatchResolver {
    /// `function` may be schema-qualified; anything other than a plain identifier
    /// is rejected.
    pub fn new(db: PgBridge, function: &str) -> Result<Self, StoreError> {
        Ok(Self {
            db,
            sql: sweep_sql(function)?,
        })
    }
}

fn sweep_sql(function: &str) -> Result<String, StoreError> {
    if !is_safe_identifier(function) {
        return Err(StoreError::storage(format!(
            "invalid stale resolver function name: {function:?}"
        )));
    }
    Ok(format!("SELECT {function}($1, $2)::bigint AS processed"))
}

impl StaleBatchResolver for PostgresStaleBatchResolver {
    #[instrument(skip(self), err)]
    fn process_batch(&self, tier: &str, max_rows: Option<usize>) -> Result<usize, ResolveError> {
        let max_rows = max_rows.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let processed: Option<i64> = self.db.block_on(async {
            let row = sqlx::query(&self.sql)
                .bind(tier)
                .bind(max_rows)
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("process_stale_batch", e))?;
            row.try_get("processed")
                .map_err(|e| map_sqlx_error("decode_processed", e))
        })?;
        Ok(processed.map_or(0, |n| usize::try_from(n).unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_sql_uses_validated_function() {
        assert_eq!(
            sweep_sql("agg.resolve_stale_tier").unwrap(),
            "SELECT agg.resolve_stale_tier($1, $2)::bigint AS processed"
        );
        assert!(sweep_sql("x(); DROP TABLE stale_stream_markers").is_err());
    }
}
