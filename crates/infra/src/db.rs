//! Postgres plumbing shared by the durable adapters.
//!
//! The engine's store contracts are synchronous (worker loops are plain threads),
//! while `sqlx` is async. `PgBridge` keeps a handle to the tokio runtime that owns
//! the pool and drives each query to completion with `block_on`.
//!
//! `block_on` must not be called from inside an async task; the adapters are meant
//! to be used from the engine's worker threads.
//!
//! ## Error mapping
//!
//! | SQLx error | SQLSTATE | StoreError |
//! |---|---|---|
//! | Database (deadlock detected) | `40P01` | `LockConflict` |
//! | Database (lock not available, e.g. `NOWAIT`) | `55P03` | `LockConflict` |
//! | Database (serialization failure) | `40001` | `LockConflict` |
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | any other | `Storage` |
//! | PoolTimedOut / PoolClosed / other | N/A | `Storage` |

use std::future::Future;

use sqlx::PgPool;
use tokio::runtime::Handle;

use crate::error::StoreError;

/// Connection pool plus the runtime it lives on.
#[derive(Debug, Clone)]
pub struct PgBridge {
    pool: PgPool,
    handle: Handle,
}

impl PgBridge {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Capture the runtime of the calling async context.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn from_current(pool: PgPool) -> Option<Self> {
        Handle::try_current().ok().map(|handle| Self::new(pool, handle))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}

/// Map a SQLSTATE code to the engine's error taxonomy.
pub fn classify_sqlstate(code: &str, msg: String) -> StoreError {
    match code {
        "40P01" | "55P03" | "40001" => StoreError::LockConflict(msg),
        "23505" => StoreError::AlreadyExists(msg),
        _ => StoreError::Storage(msg),
    }
}

pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) => classify_sqlstate(code.as_ref(), msg),
                None => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("connection pool timed out in {}", operation))
        }
        other => StoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

/// True when `name` is safe to splice into SQL as a (schema-qualified) identifier.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
