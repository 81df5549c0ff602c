//! SQLite-backed idempotency cache.
//!
//! One table, `idempotency_cache`, keyed by the idempotency key. The database
//! runs in WAL mode so readers are never blocked by the single active writer,
//! and several OS processes can open the same file without extra locking. A
//! crash mid-write rolls back to the prior committed state; the worst case is
//! an in-flight claim left `pending`, which later claimants reclaim once its
//! TTL lapses.
//!
//! ## Atomic claim
//!
//! `try_claim` is one upsert statement:
//!
//! ```sql
//! INSERT ... VALUES (...)
//! ON CONFLICT (idempotency_key) DO UPDATE SET ...
//! WHERE idempotency_cache.expires_at_ms <= excluded.created_at_ms
//! RETURNING owner_token
//! ```
//!
//! A row comes back only if this statement inserted or reclaimed the entry,
//! so exactly one of any set of concurrent claimants wins. Losers re-read the
//! row to report what they lost to.
//!
//! ## Timestamps
//!
//! Stored as unix milliseconds (`*_at_ms` INTEGER columns) so expiry checks are
//! plain integer comparisons inside SQL.
//!
//! ## Blocking
//!
//! The `CacheStore` API is synchronous. The store owns a small tokio runtime
//! and drives sqlx futures with `block_on`, so it must not be called from
//! inside an async task (use `spawn_blocking`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tokio::runtime::Runtime;
use tracing::{debug, info, instrument};

use skillrun_core::{ErrorClass, IdempotencyKey, OperationScope, OwnerToken, RetryAttempt};

use super::r#trait::{
    CacheEntry, CacheStats, CacheStore, ClaimOutcome, ClaimRequest, CommitOutcome, EntryStatus,
    StoreError, TerminalOutcome, TerminalRecord, deadline,
};
use crate::config::CacheConfig;

/// Upper bound on claim retries when the row vanishes between the upsert and
/// the follow-up read (a concurrent purge).
const CLAIM_READ_RETRIES: usize = 3;

const SELECT_COLUMNS: &str = r#"
    idempotency_key,
    tenant_id,
    module_id,
    operation_name,
    status,
    output,
    error_class,
    error_message,
    attempt_count,
    total_duration_ms,
    attempts,
    created_at_ms,
    updated_at_ms,
    expires_at_ms,
    owner_token
"#;

/// SQLite (WAL) cache store with a bounded connection pool.
///
/// Cheap to clone; clones share the pool and runtime.
#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    pool: SqlitePool,
    acquire_timeout: Duration,
    path: PathBuf,
    runtime: Arc<Runtime>,
}

impl SqliteCacheStore {
    /// Open (creating if needed) the cache database described by `config`.
    ///
    /// This is the explicit initialization step: the parent directory and the
    /// table are created if absent.
    pub fn open(config: &CacheConfig) -> Result<Self, StoreError> {
        let path = config.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Io(format!("failed to create cache directory {parent:?}: {e}"))
            })?;
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("skillrun-cache")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Io(format!("failed to start cache runtime: {e}")))?;

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout());

        let acquire_timeout = config.acquire_timeout();
        let pool = runtime.block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(config.pool_size.max(1))
                .acquire_timeout(acquire_timeout)
                .connect_with(options)
                .await
                .map_err(|e| map_sqlx_error("connect", e, acquire_timeout))?;
            init_schema(&pool)
                .await
                .map_err(|e| map_sqlx_error("init_schema", e, acquire_timeout))?;
            Ok::<_, StoreError>(pool)
        })?;

        info!(path = ?path, pool_size = config.pool_size, "opened sqlite cache store");

        Ok(Self {
            pool,
            acquire_timeout,
            path,
            runtime: Arc::new(runtime),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map_err(&self, op: &'static str, e: sqlx::Error) -> StoreError {
        map_sqlx_error(op, e, self.acquire_timeout)
    }

    /// Read one row. With `live_at = None` expired rows are returned too.
    fn fetch_entry(
        &self,
        key: &IdempotencyKey,
        live_at: Option<i64>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM idempotency_cache \
             WHERE idempotency_key = ?1 AND expires_at_ms > ?2"
        );
        let floor_ms = live_at.unwrap_or(i64::MIN);

        let row = self.runtime.block_on(async {
            sqlx::query(&sql)
                .bind(key.as_str())
                .bind(floor_ms)
                .fetch_optional(&self.pool)
                .await
        });

        match row.map_err(|e| self.map_err("get", e))? {
            Some(row) => Ok(Some(entry_from_row(&row)?)),
            None => Ok(None),
        }
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_cache (
            idempotency_key   TEXT PRIMARY KEY NOT NULL,
            tenant_id         TEXT NOT NULL,
            module_id         TEXT NOT NULL,
            operation_name    TEXT NOT NULL,
            status            TEXT NOT NULL CHECK (status IN ('pending', 'succeeded', 'failed')),
            output            TEXT NULL,
            error_class       TEXT NULL,
            error_message     TEXT NULL,
            attempt_count     INTEGER NOT NULL CHECK (attempt_count >= 1),
            total_duration_ms INTEGER NOT NULL DEFAULT 0,
            attempts          TEXT NOT NULL DEFAULT '[]',
            created_at_ms     INTEGER NOT NULL,
            updated_at_ms     INTEGER NOT NULL,
            expires_at_ms     INTEGER NOT NULL,
            owner_token       TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_idempotency_cache_expires
            ON idempotency_cache (expires_at_ms)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

impl CacheStore for SqliteCacheStore {
    fn get(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        self.fetch_entry(key, Some(now.timestamp_millis()))
    }

    #[instrument(skip(self, request, now), fields(key = %request.key.short(), owner = %request.owner), err)]
    fn try_claim(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let now_ms = now.timestamp_millis();
        let expires_ms = deadline(now, request.claim_ttl).timestamp_millis();
        let owner = request.owner.to_string();

        for _ in 0..CLAIM_READ_RETRIES {
            let won = self
                .runtime
                .block_on(async {
                    sqlx::query(
                        r#"
                        INSERT INTO idempotency_cache (
                            idempotency_key,
                            tenant_id,
                            module_id,
                            operation_name,
                            status,
                            output,
                            error_class,
                            error_message,
                            attempt_count,
                            total_duration_ms,
                            attempts,
                            created_at_ms,
                            updated_at_ms,
                            expires_at_ms,
                            owner_token
                        )
                        VALUES (?1, ?2, ?3, ?4, 'pending', NULL, NULL, NULL, 1, 0, '[]', ?5, ?6, ?7, ?8)
                        ON CONFLICT (idempotency_key) DO UPDATE SET
                            tenant_id = excluded.tenant_id,
                            module_id = excluded.module_id,
                            operation_name = excluded.operation_name,
                            status = 'pending',
                            output = NULL,
                            error_class = NULL,
                            error_message = NULL,
                            attempt_count = 1,
                            total_duration_ms = 0,
                            attempts = '[]',
                            created_at_ms = excluded.created_at_ms,
                            updated_at_ms = excluded.updated_at_ms,
                            expires_at_ms = excluded.expires_at_ms,
                            owner_token = excluded.owner_token
                        WHERE idempotency_cache.expires_at_ms <= excluded.created_at_ms
                        RETURNING owner_token
                        "#,
                    )
                    .bind(request.key.as_str())
                    .bind(request.scope.tenant_id.as_str())
                    .bind(request.scope.module_id.as_str())
                    .bind(request.scope.operation_name.as_str())
                    .bind(now_ms)
                    .bind(now_ms)
                    .bind(expires_ms)
                    .bind(&owner)
                    .fetch_optional(&self.pool)
                    .await
                })
                .map_err(|e| self.map_err("try_claim", e))?;

            if won.is_some() {
                debug!("claim acquired");
                return Ok(ClaimOutcome::Claimed(CacheEntry::pending(request, now)));
            }

            // Lost: report the live entry we lost to. `None` means it was purged
            // between the two statements; try again.
            if let Some(existing) = self.fetch_entry(&request.key, None)? {
                return Ok(match existing.status {
                    EntryStatus::Pending => ClaimOutcome::AlreadyPending(existing),
                    _ => ClaimOutcome::AlreadyTerminal(existing),
                });
            }
        }

        Err(StoreError::Unavailable(format!(
            "claim on {} did not settle after {CLAIM_READ_RETRIES} tries",
            request.key.short()
        )))
    }

    #[instrument(skip(self, record, now), fields(key = %key.short(), owner = %owner, status = record.status().as_str()), err)]
    fn commit(
        &self,
        key: &IdempotencyKey,
        owner: OwnerToken,
        record: TerminalRecord,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        let status = record.status();
        let (output, error_class, error_message) = match &record.outcome {
            TerminalOutcome::Succeeded { output } => (Some(to_json(key, output)?), None, None),
            TerminalOutcome::Failed { class, message } => {
                (None, Some(class.as_str()), Some(message.clone()))
            }
        };
        let attempts = to_json(key, &record.attempts)?;
        let total_duration_ms = i64::try_from(record.total_duration_ms).unwrap_or(i64::MAX);

        let result = self
            .runtime
            .block_on(async {
                sqlx::query(
                    r#"
                    UPDATE idempotency_cache
                    SET status = ?1,
                        output = ?2,
                        error_class = ?3,
                        error_message = ?4,
                        attempt_count = ?5,
                        total_duration_ms = ?6,
                        attempts = ?7,
                        updated_at_ms = ?8,
                        expires_at_ms = ?9
                    WHERE idempotency_key = ?10
                      AND status = 'pending'
                      AND owner_token = ?11
                    "#,
                )
                .bind(status.as_str())
                .bind(output)
                .bind(error_class)
                .bind(error_message)
                .bind(i64::from(record.attempt_count.max(1)))
                .bind(total_duration_ms)
                .bind(attempts)
                .bind(now.timestamp_millis())
                .bind(record.expires_at.timestamp_millis())
                .bind(key.as_str())
                .bind(owner.to_string())
                .execute(&self.pool)
                .await
            })
            .map_err(|e| self.map_err("commit", e))?;

        if result.rows_affected() == 1 {
            Ok(CommitOutcome::Committed)
        } else {
            Ok(CommitOutcome::StaleOwner)
        }
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = self
            .runtime
            .block_on(async {
                sqlx::query("DELETE FROM idempotency_cache WHERE expires_at_ms <= ?1")
                    .bind(now.timestamp_millis())
                    .execute(&self.pool)
                    .await
            })
            .map_err(|e| self.map_err("purge_expired", e))?;
        Ok(result.rows_affected())
    }

    fn invalidate(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let result = self
            .runtime
            .block_on(async {
                sqlx::query("DELETE FROM idempotency_cache WHERE idempotency_key = ?1")
                    .bind(key.as_str())
                    .execute(&self.pool)
                    .await
            })
            .map_err(|e| self.map_err("invalidate", e))?;
        Ok(result.rows_affected() > 0)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats, StoreError> {
        let row = self
            .runtime
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT
                        COALESCE(SUM(CASE WHEN expires_at_ms > ?1 AND status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                        COALESCE(SUM(CASE WHEN expires_at_ms > ?1 AND status = 'succeeded' THEN 1 ELSE 0 END), 0) AS succeeded,
                        COALESCE(SUM(CASE WHEN expires_at_ms > ?1 AND status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                        COALESCE(SUM(CASE WHEN expires_at_ms <= ?1 THEN 1 ELSE 0 END), 0) AS expired
                    FROM idempotency_cache
                    "#,
                )
                .bind(now.timestamp_millis())
                .fetch_one(&self.pool)
                .await
            })
            .map_err(|e| self.map_err("stats", e))?;

        let count = |col: &str| -> Result<u64, StoreError> {
            let n: i64 = row
                .try_get(col)
                .map_err(|e| StoreError::Serialization(format!("stats column {col}: {e}")))?;
            Ok(u64::try_from(n).unwrap_or(0))
        };

        Ok(CacheStats {
            pending: count("pending")?,
            succeeded: count("succeeded")?,
            failed: count("failed")?,
            expired: count("expired")?,
        })
    }
}

fn to_json<T: serde::Serialize + ?Sized>(
    key: &IdempotencyKey,
    value: &T,
) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Serialization(format!("{}: {e}", key.short())))
}

fn entry_from_row(row: &SqliteRow) -> Result<CacheEntry, StoreError> {
    let raw_key: String = row
        .try_get("idempotency_key")
        .map_err(|e| StoreError::Serialization(format!("idempotency_key column: {e}")))?;

    let corrupt = |reason: String| StoreError::Corrupt {
        key: raw_key.clone(),
        reason,
    };
    let text = |col: &str| -> Result<String, StoreError> {
        row.try_get::<String, _>(col)
            .map_err(|e| corrupt(format!("{col}: {e}")))
    };
    let opt_text = |col: &str| -> Result<Option<String>, StoreError> {
        row.try_get::<Option<String>, _>(col)
            .map_err(|e| corrupt(format!("{col}: {e}")))
    };
    let int = |col: &str| -> Result<i64, StoreError> {
        row.try_get::<i64, _>(col)
            .map_err(|e| corrupt(format!("{col}: {e}")))
    };
    let timestamp = |col: &str| -> Result<DateTime<Utc>, StoreError> {
        let ms = int(col)?;
        DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| corrupt(format!("{col}: out-of-range timestamp {ms}")))
    };

    let key = IdempotencyKey::from_hex(&raw_key).map_err(|e| corrupt(e.to_string()))?;
    let scope = OperationScope::parse(
        text("tenant_id")?,
        text("module_id")?,
        text("operation_name")?,
    )
    .map_err(|e| corrupt(e.to_string()))?;

    let status_raw = text("status")?;
    let status = EntryStatus::parse(&status_raw)
        .ok_or_else(|| corrupt(format!("unknown status {status_raw:?}")))?;

    let output = opt_text("output")?
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| corrupt(format!("output: {e}")))?;

    let error_class = opt_text("error_class")?
        .map(|s| s.parse::<ErrorClass>())
        .transpose()
        .map_err(|e| corrupt(e.to_string()))?;

    let attempts: Vec<RetryAttempt> = serde_json::from_str(&text("attempts")?)
        .map_err(|e| corrupt(format!("attempts: {e}")))?;

    let owner_token = text("owner_token")?
        .parse::<OwnerToken>()
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(CacheEntry {
        key,
        scope,
        status,
        output,
        error_class,
        error_message: opt_text("error_message")?,
        attempt_count: u32::try_from(int("attempt_count")?).unwrap_or(1).max(1),
        total_duration_ms: u64::try_from(int("total_duration_ms")?).unwrap_or(0),
        attempts,
        created_at: timestamp("created_at_ms")?,
        updated_at: timestamp("updated_at_ms")?,
        expires_at: timestamp("expires_at_ms")?,
        owner_token,
    })
}

/// Map sqlx errors onto the store taxonomy.
///
/// | sqlx error | StoreError |
/// |---|---|
/// | `PoolTimedOut` | `PoolExhausted` (bounded wait elapsed) |
/// | `PoolClosed` | `Unavailable` |
/// | `Io` | `Io` |
/// | `Database` (incl. `SQLITE_BUSY` after `busy_timeout`) | `Unavailable` |
/// | decode errors | `Serialization` |
/// | anything else | `Unavailable` |
fn map_sqlx_error(op: &'static str, e: sqlx::Error, acquire_timeout: Duration) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => StoreError::PoolExhausted(acquire_timeout),
        sqlx::Error::PoolClosed => StoreError::Unavailable(format!("{op}: pool closed")),
        sqlx::Error::Io(io) => StoreError::Io(format!("{op}: {io}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("{op}: {e}"))
        }
        other => StoreError::Unavailable(format!("{op}: {other}")),
    }
}
