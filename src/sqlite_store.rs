use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;
use time::OffsetDateTime;

use crate::audit::{AuditError, AuditQuery, AuditSink, AuditStatus, UsageLogEntry};
use crate::clock::unix_millis;
use crate::quota::window::{CounterState, usage_status};
use crate::quota::{
    DEFAULT_RESERVATION_TTL, QuotaLimits, QuotaPeriod, QuotaSnapshot, QuotaStore, QuotaStoreError,
    QuotaSubject, UsageLimitStatus,
};

/// SQLite-backed quota counters and usage log. Each call opens its own
/// connection on the blocking pool; check-and-mutate operations run inside a
/// `BEGIN IMMEDIATE` transaction so concurrent writers serialize on the
/// database lock.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
    reservation_ttl: Duration,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<SqliteStoreError> for QuotaStoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::Corrupt(message) => QuotaStoreError::Corrupt(message),
            SqliteStoreError::Duplicate(key) => {
                QuotaStoreError::Corrupt(format!("reservation {key} already exists"))
            }
            other => QuotaStoreError::backend(other),
        }
    }
}

impl From<SqliteStoreError> for AuditError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::Duplicate(id) => AuditError::Duplicate(id),
            other => AuditError::Backend(other.to_string()),
        }
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reservation_ttl: DEFAULT_RESERVATION_TTL,
        }
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.reservation_ttl.as_millis()).unwrap_or(i64::MAX)
    }

    /// Seeds (or overwrites) one counter for the window containing `now`.
    pub async fn set_quota_counter(
        &self,
        subject: &QuotaSubject,
        period: QuotaPeriod,
        limit: u64,
        used: u64,
        now: OffsetDateTime,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let key = subject.key();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut counter = load_counter(&tx, &key, period)?
                .unwrap_or_else(|| CounterState::provision(period, limit, now));
            counter.limit = limit;
            counter.used = used;
            save_counter(&tx, &key, period, &counter, unix_millis(now))?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn quota_counter(
        &self,
        subject: &QuotaSubject,
        period: QuotaPeriod,
    ) -> Result<Option<CounterState>, SqliteStoreError> {
        let path = self.path.clone();
        let key = subject.key();
        tokio::task::spawn_blocking(move || -> Result<Option<CounterState>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            load_counter(&conn, &key, period)
        })
        .await?
    }

    pub async fn check_usage(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<UsageLimitStatus, SqliteStoreError> {
        let path = self.path.clone();
        let key = subject.key();
        let ttl_ms = self.ttl_ms();
        tokio::task::spawn_blocking(move || -> Result<UsageLimitStatus, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            reap_expired(&tx, unix_millis(now), ttl_ms)?;
            let [daily, monthly] = load_window(&tx, &key, limits, now)?;
            tx.commit()?;
            Ok(usage_status(&daily, &monthly))
        })
        .await?
    }

    pub async fn increment_usage(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        tokens_used: u64,
        now: OffsetDateTime,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let key = subject.key();
        let ttl_ms = self.ttl_ms();
        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_ms = unix_millis(now);
            reap_expired(&tx, now_ms, ttl_ms)?;
            let [mut daily, mut monthly] = load_window(&tx, &key, limits, now)?;
            if !usage_status(&daily, &monthly).can_use {
                tx.commit()?;
                return Ok(false);
            }
            for counter in [&mut daily, &mut monthly] {
                counter.used += 1;
                counter.tokens_used = counter.tokens_used.saturating_add(tokens_used);
            }
            save_window(&tx, &key, [daily, monthly], now_ms)?;
            tx.commit()?;
            Ok(true)
        })
        .await?
    }

    pub async fn reserve_usage_slot(
        &self,
        reservation_id: &str,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<UsageLimitStatus, SqliteStoreError> {
        let path = self.path.clone();
        let reservation_id = reservation_id.to_string();
        let key = subject.key();
        let ttl_ms = self.ttl_ms();
        tokio::task::spawn_blocking(move || -> Result<UsageLimitStatus, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_ms = unix_millis(now);
            reap_expired(&tx, now_ms, ttl_ms)?;
            let [mut daily, mut monthly] = load_window(&tx, &key, limits, now)?;
            let status = usage_status(&daily, &monthly);
            if !status.can_use {
                tx.commit()?;
                return Ok(status);
            }

            tx.execute(
                "INSERT INTO quota_reservations (reservation_id, subject_key, created_at_ms)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![reservation_id, key, now_ms],
            )
            .map_err(|err| duplicate_or(err, &reservation_id))?;
            daily.reserved += 1;
            monthly.reserved += 1;
            save_window(&tx, &key, [daily, monthly], now_ms)?;
            tx.commit()?;
            Ok(status)
        })
        .await?
    }

    pub async fn commit_usage_reservation(
        &self,
        reservation_id: &str,
        tokens_used: u64,
        now: OffsetDateTime,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let reservation_id = reservation_id.to_string();
        let ttl_ms = self.ttl_ms();
        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_ms = unix_millis(now);
            reap_expired(&tx, now_ms, ttl_ms)?;
            let Some(key) = take_reservation(&tx, &reservation_id)? else {
                tx.commit()?;
                return Ok(false);
            };

            let mut counters = Vec::with_capacity(2);
            for period in QuotaPeriod::ALL {
                let mut counter = load_counter(&tx, &key, period)?.ok_or_else(|| {
                    SqliteStoreError::Corrupt(format!(
                        "reservation {reservation_id} has no {} counter",
                        period.as_str()
                    ))
                })?;
                counter.roll_forward(period, now);
                counter.reserved = counter.reserved.saturating_sub(1);
                counter.used += 1;
                counter.tokens_used = counter.tokens_used.saturating_add(tokens_used);
                counters.push((period, counter));
            }
            for (period, counter) in counters {
                save_counter(&tx, &key, period, &counter, now_ms)?;
            }
            tx.commit()?;
            Ok(true)
        })
        .await?
    }

    pub async fn release_usage_reservation(
        &self,
        reservation_id: &str,
        now: OffsetDateTime,
    ) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let reservation_id = reservation_id.to_string();
        let ttl_ms = self.ttl_ms();
        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_ms = unix_millis(now);
            reap_expired(&tx, now_ms, ttl_ms)?;
            let Some(key) = take_reservation(&tx, &reservation_id)? else {
                tx.commit()?;
                return Ok(false);
            };
            unreserve(&tx, &key, now_ms)?;
            tx.commit()?;
            Ok(true)
        })
        .await?
    }

    pub async fn snapshot_usage(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<QuotaSnapshot, SqliteStoreError> {
        let path = self.path.clone();
        let key = subject.key();
        let ttl_ms = self.ttl_ms();
        tokio::task::spawn_blocking(move || -> Result<QuotaSnapshot, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            reap_expired(&tx, unix_millis(now), ttl_ms)?;
            let [daily, monthly] = load_window(&tx, &key, limits, now)?;
            tx.commit()?;
            Ok(QuotaSnapshot {
                daily_used: daily.used,
                daily_limit: daily.limit,
                monthly_used: monthly.used,
                monthly_limit: monthly.limit,
                remaining_today: daily.remaining(),
                remaining_month: monthly.remaining(),
                last_reset: daily.window_start(),
            })
        })
        .await?
    }

    pub async fn append_usage_log(&self, entry: &UsageLogEntry) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let entry = entry.clone();
        let request_json = serde_json::to_string(&entry.request_snapshot)?;
        let response_json = serde_json::to_string(&entry.response_snapshot)?;

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_logs (
                    id, request_id, user_id, workflow_id, run_id, tokens_used, elapsed_ms,
                    status, error_message, request_json, response_json, created_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    entry.id,
                    entry.request_id,
                    entry.user_id,
                    entry.workflow_id,
                    entry.run_id,
                    tokens_to_i64(entry.tokens_used),
                    tokens_to_i64(entry.elapsed_ms),
                    entry.status.as_str(),
                    entry.error_message,
                    request_json,
                    response_json,
                    entry.created_at_ms,
                ],
            )
            .map_err(|err| duplicate_or(err, &entry.id))?;
            Ok(())
        })
        .await?
    }

    pub async fn list_usage_logs(
        &self,
        query: &AuditQuery,
    ) -> Result<Vec<UsageLogEntry>, SqliteStoreError> {
        let path = self.path.clone();
        let limit = i64::try_from(query.effective_limit()).unwrap_or(i64::MAX);
        let since_ts_ms = query.since_ts_ms;
        let user_id = query.user_id.clone();
        let workflow_id = query.workflow_id.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<UsageLogEntry>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, request_id, user_id, workflow_id, run_id, tokens_used, elapsed_ms,
                        status, error_message, request_json, response_json, created_at_ms
                 FROM usage_logs
                 WHERE (?1 IS NULL OR created_at_ms >= ?1)
                   AND (?2 IS NULL OR user_id = ?2)
                   AND (?3 IS NULL OR workflow_id = ?3)
                 ORDER BY created_at_ms DESC, rowid DESC
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![since_ts_ms, user_id, workflow_id, limit],
                |row| {
                    Ok(UsageLogRow {
                        id: row.get(0)?,
                        request_id: row.get(1)?,
                        user_id: row.get(2)?,
                        workflow_id: row.get(3)?,
                        run_id: row.get(4)?,
                        tokens_used: row.get(5)?,
                        elapsed_ms: row.get(6)?,
                        status: row.get(7)?,
                        error_message: row.get(8)?,
                        request_json: row.get(9)?,
                        response_json: row.get(10)?,
                        created_at_ms: row.get(11)?,
                    })
                },
            )?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_entry()?);
            }
            Ok(out)
        })
        .await?
    }
}

struct UsageLogRow {
    id: String,
    request_id: String,
    user_id: String,
    workflow_id: String,
    run_id: Option<String>,
    tokens_used: i64,
    elapsed_ms: i64,
    status: String,
    error_message: Option<String>,
    request_json: String,
    response_json: String,
    created_at_ms: i64,
}

impl UsageLogRow {
    fn into_entry(self) -> Result<UsageLogEntry, SqliteStoreError> {
        let status = AuditStatus::parse(&self.status).ok_or_else(|| {
            SqliteStoreError::Corrupt(format!("usage log {} has status {}", self.id, self.status))
        })?;
        Ok(UsageLogEntry {
            request_snapshot: serde_json::from_str(&self.request_json)?,
            response_snapshot: serde_json::from_str(&self.response_json)?,
            id: self.id,
            request_id: self.request_id,
            user_id: self.user_id,
            workflow_id: self.workflow_id,
            run_id: self.run_id,
            tokens_used: i64_to_u64(self.tokens_used),
            elapsed_ms: i64_to_u64(self.elapsed_ms),
            status,
            error_message: self.error_message,
            created_at_ms: self.created_at_ms,
        })
    }
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn check_usage_limit(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<UsageLimitStatus, QuotaStoreError> {
        Ok(self.check_usage(subject, limits, now).await?)
    }

    async fn increment_usage_count(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        tokens_used: u64,
        now: OffsetDateTime,
    ) -> Result<bool, QuotaStoreError> {
        Ok(self.increment_usage(subject, limits, tokens_used, now).await?)
    }

    async fn reserve_usage(
        &self,
        reservation_id: &str,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<UsageLimitStatus, QuotaStoreError> {
        Ok(self
            .reserve_usage_slot(reservation_id, subject, limits, now)
            .await?)
    }

    async fn commit_reservation(
        &self,
        reservation_id: &str,
        tokens_used: u64,
        now: OffsetDateTime,
    ) -> Result<bool, QuotaStoreError> {
        Ok(self
            .commit_usage_reservation(reservation_id, tokens_used, now)
            .await?)
    }

    async fn release_reservation(
        &self,
        reservation_id: &str,
        now: OffsetDateTime,
    ) -> Result<bool, QuotaStoreError> {
        Ok(self.release_usage_reservation(reservation_id, now).await?)
    }

    async fn usage_snapshot(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<QuotaSnapshot, QuotaStoreError> {
        Ok(self.snapshot_usage(subject, limits, now).await?)
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn append(&self, entry: UsageLogEntry) -> Result<(), AuditError> {
        Ok(self.append_usage_log(&entry).await?)
    }

    async fn list(&self, query: &AuditQuery) -> Result<Vec<UsageLogEntry>, AuditError> {
        Ok(self.list_usage_logs(query).await?)
    }
}

fn load_counter(
    conn: &rusqlite::Connection,
    key: &str,
    period: QuotaPeriod,
) -> Result<Option<CounterState>, SqliteStoreError> {
    let row = conn
        .query_row(
            "SELECT limit_count, used, reserved, tokens_used, window_start_ms, reset_at_ms
             FROM quota_counters
             WHERE subject_key = ?1 AND period = ?2",
            rusqlite::params![key, period.as_str()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(
        |(limit, used, reserved, tokens_used, window_start_ms, reset_at_ms)| CounterState {
            limit: i64_to_u64(limit),
            used: i64_to_u64(used),
            reserved: i64_to_u64(reserved),
            tokens_used: i64_to_u64(tokens_used),
            window_start_ms,
            reset_at_ms,
        },
    ))
}

fn save_counter(
    tx: &Transaction<'_>,
    key: &str,
    period: QuotaPeriod,
    counter: &CounterState,
    now_ms: i64,
) -> Result<(), SqliteStoreError> {
    tx.execute(
        "INSERT INTO quota_counters (
            subject_key, period, limit_count, used, reserved, tokens_used,
            window_start_ms, reset_at_ms, updated_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(subject_key, period) DO UPDATE SET
            limit_count = excluded.limit_count,
            used = excluded.used,
            reserved = excluded.reserved,
            tokens_used = excluded.tokens_used,
            window_start_ms = excluded.window_start_ms,
            reset_at_ms = excluded.reset_at_ms,
            updated_at_ms = excluded.updated_at_ms",
        rusqlite::params![
            key,
            period.as_str(),
            tokens_to_i64(counter.limit),
            tokens_to_i64(counter.used),
            tokens_to_i64(counter.reserved),
            tokens_to_i64(counter.tokens_used),
            counter.window_start_ms,
            counter.reset_at_ms,
            now_ms,
        ],
    )?;
    Ok(())
}

/// Provisions missing counters and rolls both into the window containing `now`.
fn load_window(
    tx: &Transaction<'_>,
    key: &str,
    limits: QuotaLimits,
    now: OffsetDateTime,
) -> Result<[CounterState; 2], SqliteStoreError> {
    let now_ms = unix_millis(now);
    let mut out = [CounterState::provision(QuotaPeriod::Daily, limits.daily, now); 2];
    for (slot, period) in out.iter_mut().zip(QuotaPeriod::ALL) {
        let (mut counter, dirty) = match load_counter(tx, key, period)? {
            Some(counter) => (counter, false),
            None => (
                CounterState::provision(period, limits.for_period(period), now),
                true,
            ),
        };
        if counter.roll_forward(period, now) || dirty {
            save_counter(tx, key, period, &counter, now_ms)?;
        }
        *slot = counter;
    }
    Ok(out)
}

fn save_window(
    tx: &Transaction<'_>,
    key: &str,
    counters: [CounterState; 2],
    now_ms: i64,
) -> Result<(), SqliteStoreError> {
    for (period, counter) in QuotaPeriod::ALL.into_iter().zip(counters) {
        save_counter(tx, key, period, &counter, now_ms)?;
    }
    Ok(())
}

fn take_reservation(
    tx: &Transaction<'_>,
    reservation_id: &str,
) -> Result<Option<String>, SqliteStoreError> {
    let key: Option<String> = tx
        .query_row(
            "SELECT subject_key FROM quota_reservations WHERE reservation_id = ?1",
            rusqlite::params![reservation_id],
            |row| row.get(0),
        )
        .optional()?;
    if key.is_some() {
        tx.execute(
            "DELETE FROM quota_reservations WHERE reservation_id = ?1",
            rusqlite::params![reservation_id],
        )?;
    }
    Ok(key)
}

fn unreserve(tx: &Transaction<'_>, key: &str, now_ms: i64) -> Result<(), SqliteStoreError> {
    tx.execute(
        "UPDATE quota_counters
         SET reserved = MAX(reserved - 1, 0),
             updated_at_ms = ?2
         WHERE subject_key = ?1",
        rusqlite::params![key, now_ms],
    )?;
    Ok(())
}

fn reap_expired(tx: &Transaction<'_>, now_ms: i64, ttl_ms: i64) -> Result<(), SqliteStoreError> {
    let cutoff = now_ms.saturating_sub(ttl_ms);
    let expired: Vec<(String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT reservation_id, subject_key FROM quota_reservations WHERE created_at_ms <= ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![cutoff], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };
    for (reservation_id, key) in expired {
        tracing::debug!(%reservation_id, subject = %key, "reaping expired quota reservation");
        tx.execute(
            "DELETE FROM quota_reservations WHERE reservation_id = ?1",
            rusqlite::params![reservation_id],
        )?;
        unreserve(tx, &key, now_ms)?;
    }
    Ok(())
}

fn duplicate_or(err: rusqlite::Error, key: &str) -> SqliteStoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            SqliteStoreError::Duplicate(key.to_string())
        }
        _ => SqliteStoreError::Sqlite(err),
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS quota_counters (
            subject_key TEXT NOT NULL,
            period TEXT NOT NULL,
            limit_count INTEGER NOT NULL,
            used INTEGER NOT NULL,
            reserved INTEGER NOT NULL,
            tokens_used INTEGER NOT NULL,
            window_start_ms INTEGER NOT NULL,
            reset_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (subject_key, period)
        );
        CREATE TABLE IF NOT EXISTS quota_reservations (
            reservation_id TEXT PRIMARY KEY,
            subject_key TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_quota_reservations_created_at_ms
            ON quota_reservations(created_at_ms);
        CREATE TABLE IF NOT EXISTS usage_logs (
            id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            run_id TEXT,
            tokens_used INTEGER NOT NULL,
            elapsed_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            request_json TEXT NOT NULL,
            response_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_logs_created_at_ms
            ON usage_logs(created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_usage_logs_user_id_created_at_ms
            ON usage_logs(user_id, created_at_ms);",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn tokens_to_i64(tokens: u64) -> i64 {
    if tokens > i64::MAX as u64 {
        i64::MAX
    } else {
        tokens as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value < 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests;
