//! SQLite store backed by sqlx
//!
//! Timestamps are kept as integer Unix milliseconds so that staleness and
//! recency windows are plain integer comparisons. Every public operation runs
//! under the configured timeout; when it fires the in-flight future is
//! dropped, which rolls back any open transaction.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::RouterStore;
use crate::config::DatabaseConfig;
use crate::error::{Result, RouterError};
use crate::stats::{CallCounts, DidCounts};
use crate::types::{CallRecord, CallState, Did, Provider};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS providers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        host TEXT NOT NULL,
        port INTEGER NOT NULL DEFAULT 5060,
        username TEXT,
        password TEXT,
        realm TEXT,
        transport TEXT NOT NULL DEFAULT 'udp',
        codecs TEXT NOT NULL DEFAULT '[]',
        max_channels INTEGER NOT NULL DEFAULT 100,
        active INTEGER NOT NULL DEFAULT 1,
        country TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_providers_name ON providers(name)",
    "CREATE INDEX IF NOT EXISTS idx_providers_active ON providers(active)",
    r#"CREATE TABLE IF NOT EXISTS dids (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        did TEXT NOT NULL,
        provider_id INTEGER NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
        provider_name TEXT NOT NULL,
        in_use INTEGER NOT NULL DEFAULT 0,
        destination TEXT,
        country TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (provider_id, did)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_dids_did ON dids(did)",
    "CREATE INDEX IF NOT EXISTS idx_dids_provider ON dids(provider_id)",
    "CREATE INDEX IF NOT EXISTS idx_dids_in_use ON dids(in_use)",
    r#"CREATE TABLE IF NOT EXISTS call_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        call_id TEXT NOT NULL UNIQUE,
        original_ani TEXT NOT NULL,
        original_dnis TEXT NOT NULL,
        assigned_did TEXT NOT NULL,
        provider_id INTEGER NOT NULL,
        provider_name TEXT NOT NULL,
        status TEXT NOT NULL,
        start_time INTEGER NOT NULL,
        end_time INTEGER,
        duration INTEGER NOT NULL DEFAULT 0,
        recording_path TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_calls_call_id ON call_records(call_id)",
    "CREATE INDEX IF NOT EXISTS idx_calls_did ON call_records(assigned_did)",
    "CREATE INDEX IF NOT EXISTS idx_calls_provider ON call_records(provider_id)",
    "CREATE INDEX IF NOT EXISTS idx_calls_status ON call_records(status)",
    "CREATE INDEX IF NOT EXISTS idx_calls_start_time ON call_records(start_time)",
];

const CALL_COLUMNS: &str = "call_id, original_ani, original_dnis, assigned_did, provider_id, \
     provider_name, status, start_time, end_time, duration, recording_path";

const PROVIDER_COLUMNS: &str = "id, name, host, port, username, password, realm, transport, \
     codecs, max_channels, active, country, created_at, updated_at";

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[derive(sqlx::FromRow, Debug)]
struct ProviderRow {
    id: i64,
    name: String,
    host: String,
    port: i64,
    username: Option<String>,
    password: Option<String>,
    realm: Option<String>,
    transport: String,
    codecs: String,
    max_channels: i64,
    active: i64,
    country: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<ProviderRow> for Provider {
    type Error = RouterError;

    fn try_from(row: ProviderRow) -> Result<Self> {
        Ok(Provider {
            id: row.id,
            name: row.name,
            host: row.host,
            port: u16::try_from(row.port).unwrap_or(crate::types::DEFAULT_SIP_PORT),
            username: row.username,
            password: row.password,
            realm: row.realm,
            transport: row.transport,
            codecs: serde_json::from_str(&row.codecs)?,
            max_channels: u32::try_from(row.max_channels).unwrap_or(0),
            active: row.active != 0,
            country: row.country,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct DidRow {
    id: i64,
    did: String,
    provider_id: i64,
    provider_name: String,
    in_use: i64,
    destination: Option<String>,
    country: Option<String>,
}

impl From<DidRow> for Did {
    fn from(row: DidRow) -> Self {
        Did {
            id: row.id,
            did: row.did,
            provider_id: row.provider_id,
            provider_name: row.provider_name,
            in_use: row.in_use != 0,
            destination: row.destination,
            country: row.country,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct CallRow {
    call_id: String,
    original_ani: String,
    original_dnis: String,
    assigned_did: String,
    provider_id: i64,
    provider_name: String,
    status: String,
    start_time: i64,
    end_time: Option<i64>,
    duration: i64,
    recording_path: Option<String>,
}

impl TryFrom<CallRow> for CallRecord {
    type Error = RouterError;

    fn try_from(row: CallRow) -> Result<Self> {
        let status = CallState::parse(&row.status).ok_or_else(|| {
            RouterError::internal(format!("call {} has unknown status {}", row.call_id, row.status))
        })?;
        Ok(CallRecord {
            call_id: row.call_id,
            original_ani: row.original_ani,
            original_dnis: row.original_dnis,
            assigned_did: row.assigned_did,
            provider_id: row.provider_id,
            provider_name: row.provider_name,
            status,
            start_time: from_millis(row.start_time),
            end_time: row.end_time.map(from_millis),
            duration: row.duration,
            recording_path: row.recording_path,
        })
    }
}

/// sqlx-backed SQLite implementation of [`RouterStore`]
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    op_timeout: Duration,
}

impl SqliteStore {
    /// Connect using the database section of the router configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(config.operation_timeout());

        // An in-memory database lives and dies with its connection, so the
        // pool must hold exactly one and never recycle it.
        let pool = if is_memory_url(&config.url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(options)
                .await?
        };

        info!("Connected to store at {}", config.url);
        Ok(Self {
            pool,
            op_timeout: config.operation_timeout(),
        })
    }

    /// Fresh in-memory store with the schema applied
    pub async fn in_memory() -> Result<Self> {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        };
        let store = Self::connect(&config).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Store schema ready");
        Ok(())
    }

    /// Underlying pool, for diagnostics and tests
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn timed<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Store operation {} abandoned after {:?}", operation, self.op_timeout);
                Err(RouterError::StoreTimeout {
                    operation,
                    timeout_ms: self.op_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn do_upsert_provider(&self, provider: &Provider) -> Result<Provider> {
        let now = Utc::now();
        let codecs = serde_json::to_string(&provider.codecs)?;
        let mut tx = self.pool.begin().await?;

        let (id, created_at): (i64, i64) = sqlx::query_as(
            "INSERT INTO providers (name, host, port, username, password, realm, transport, codecs, \
                                    max_channels, active, country, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
                host = excluded.host, port = excluded.port, username = excluded.username, \
                password = excluded.password, realm = excluded.realm, transport = excluded.transport, \
                codecs = excluded.codecs, max_channels = excluded.max_channels, \
                active = excluded.active, country = excluded.country, updated_at = excluded.updated_at \
             RETURNING id, created_at",
        )
        .bind(&provider.name)
        .bind(&provider.host)
        .bind(i64::from(provider.port))
        .bind(&provider.username)
        .bind(&provider.password)
        .bind(&provider.realm)
        .bind(&provider.transport)
        .bind(codecs)
        .bind(i64::from(provider.max_channels))
        .bind(provider.active)
        .bind(&provider.country)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .fetch_one(&mut *tx)
        .await?;

        // Rows that predate a rename of this provider keep its old name otherwise
        sqlx::query("UPDATE dids SET provider_name = ? WHERE provider_id = ? AND provider_name <> ?")
            .bind(&provider.name)
            .bind(id)
            .bind(&provider.name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Provider {
            id,
            created_at: from_millis(created_at),
            updated_at: now,
            ..provider.clone()
        })
    }

    async fn do_load_active_providers(&self) -> Result<Vec<Provider>> {
        let rows: Vec<ProviderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM providers WHERE active = 1 ORDER BY id",
            PROVIDER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Provider::try_from).collect()
    }

    async fn do_provider_dids(&self, provider_id: i64) -> Result<Vec<Did>> {
        let rows: Vec<DidRow> = sqlx::query_as(
            "SELECT id, did, provider_id, provider_name, in_use, destination, country \
             FROM dids WHERE provider_id = ? ORDER BY id",
        )
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Did::from).collect())
    }

    async fn do_upsert_dids(&self, provider: &Provider, dids: &[String], country: Option<&str>) -> Result<()> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        for did in dids {
            sqlx::query(
                "INSERT INTO dids (did, provider_id, provider_name, country, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(provider_id, did) DO UPDATE SET \
                    provider_name = excluded.provider_name, country = excluded.country, \
                    updated_at = excluded.updated_at",
            )
            .bind(did)
            .bind(provider.id)
            .bind(&provider.name)
            .bind(country)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn do_lease_did(&self, did_id: i64, destination: &str, call: Option<&CallRecord>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            "UPDATE dids SET in_use = 1, destination = ?, updated_at = ? \
             WHERE id = ? AND in_use = 0 \
               AND NOT EXISTS (SELECT 1 FROM dids AS other WHERE other.did = dids.did AND other.in_use = 1)",
        )
        .bind(destination)
        .bind(to_millis(Utc::now()))
        .bind(did_id)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(call) = call {
            let inserted = sqlx::query(&format!(
                "INSERT INTO call_records ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                CALL_COLUMNS
            ))
            .bind(&call.call_id)
            .bind(&call.original_ani)
            .bind(&call.original_dnis)
            .bind(&call.assigned_did)
            .bind(call.provider_id)
            .bind(&call.provider_name)
            .bind(call.status.as_str())
            .bind(to_millis(call.start_time))
            .bind(call.end_time.map(to_millis))
            .bind(call.duration)
            .bind(&call.recording_path)
            .execute(&mut *tx)
            .await;

            // Dropping the transaction on the error path rolls back the DID mark
            if let Err(err) = inserted {
                return Err(match err {
                    sqlx::Error::Database(db) if db.is_unique_violation() => {
                        RouterError::DuplicateCall(call.call_id.clone())
                    }
                    other => RouterError::Store(other),
                });
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn do_release_did(&self, did: &str) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await?;

        let holder: Option<(String,)> = sqlx::query_as(
            "SELECT call_id FROM call_records \
             WHERE assigned_did = ? AND status IN ('ACTIVE', 'FORWARDED', 'RETURNED') \
             ORDER BY start_time DESC LIMIT 1",
        )
        .bind(did)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((call_id,)) = holder {
            tx.rollback().await?;
            return Ok(Some(call_id));
        }

        sqlx::query("UPDATE dids SET in_use = 0, destination = NULL, updated_at = ? WHERE did = ? AND in_use = 1")
            .bind(to_millis(Utc::now()))
            .bind(did)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(None)
    }

    async fn do_update_call_status(&self, call_id: &str, from: CallState, to: CallState) -> Result<bool> {
        let result = sqlx::query("UPDATE call_records SET status = ? WHERE call_id = ? AND status = ?")
            .bind(to.as_str())
            .bind(call_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn do_finish_call(
        &self,
        call_id: &str,
        from: CallState,
        to: CallState,
        end_time: DateTime<Utc>,
        duration: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let finished = sqlx::query(
            "UPDATE call_records SET status = ?, end_time = ?, duration = ? WHERE call_id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(to_millis(end_time))
        .bind(duration)
        .bind(call_id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;

        if finished.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        // Leave the number leased if another open call holds it
        sqlx::query(
            "UPDATE dids SET in_use = 0, destination = NULL, updated_at = ?1 \
             WHERE did = (SELECT assigned_did FROM call_records WHERE call_id = ?2) \
               AND NOT EXISTS (SELECT 1 FROM call_records AS other \
                               WHERE other.assigned_did = dids.did AND other.call_id <> ?2 \
                                 AND other.status IN ('ACTIVE', 'FORWARDED', 'RETURNED'))",
        )
        .bind(to_millis(end_time))
        .bind(call_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn do_get_call(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let row: Option<CallRow> =
            sqlx::query_as(&format!("SELECT {} FROM call_records WHERE call_id = ?", CALL_COLUMNS))
                .bind(call_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(CallRecord::try_from).transpose()
    }

    async fn do_find_open_call_by_did(&self, did: &str, since: DateTime<Utc>) -> Result<Option<CallRecord>> {
        let row: Option<CallRow> = sqlx::query_as(&format!(
            "SELECT {} FROM call_records \
             WHERE assigned_did = ? AND status IN ('ACTIVE', 'FORWARDED', 'RETURNED') AND start_time > ? \
             ORDER BY start_time DESC LIMIT 1",
            CALL_COLUMNS
        ))
        .bind(did)
        .bind(to_millis(since))
        .fetch_optional(&self.pool)
        .await?;

        row.map(CallRecord::try_from).transpose()
    }

    async fn do_load_open_calls(&self, since: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        let rows: Vec<CallRow> = sqlx::query_as(&format!(
            "SELECT {} FROM call_records \
             WHERE status IN ('ACTIVE', 'FORWARDED', 'RETURNED') AND start_time > ? \
             ORDER BY start_time",
            CALL_COLUMNS
        ))
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CallRecord::try_from).collect()
    }

    async fn do_stale_calls(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        let rows: Vec<CallRow> = sqlx::query_as(&format!(
            "SELECT {} FROM call_records \
             WHERE status IN ('ACTIVE', 'FORWARDED') AND start_time < ? \
             ORDER BY start_time",
            CALL_COLUMNS
        ))
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CallRecord::try_from).collect()
    }

    async fn do_did_counts(&self, provider_id: Option<i64>) -> Result<DidCounts> {
        let (total, used): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN in_use = 1 THEN 1 ELSE 0 END), 0) \
             FROM dids WHERE (?1 IS NULL OR provider_id = ?1)",
        )
        .bind(provider_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(DidCounts { total, used })
    }

    async fn do_call_counts(&self, provider_id: Option<i64>, since: DateTime<Utc>) -> Result<CallCounts> {
        let (total, completed, active): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN status IN ('ACTIVE', 'FORWARDED') THEN 1 ELSE 0 END), 0) \
             FROM call_records WHERE start_time >= ?1 AND (?2 IS NULL OR provider_id = ?2)",
        )
        .bind(to_millis(since))
        .bind(provider_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(CallCounts { total, completed, active })
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[async_trait]
impl RouterStore for SqliteStore {
    async fn upsert_provider(&self, provider: &Provider) -> Result<Provider> {
        self.timed("upsert_provider", self.do_upsert_provider(provider)).await
    }

    async fn load_active_providers(&self) -> Result<Vec<Provider>> {
        self.timed("load_active_providers", self.do_load_active_providers()).await
    }

    async fn provider_dids(&self, provider_id: i64) -> Result<Vec<Did>> {
        self.timed("provider_dids", self.do_provider_dids(provider_id)).await
    }

    async fn upsert_dids(&self, provider: &Provider, dids: &[String], country: Option<&str>) -> Result<()> {
        self.timed("upsert_dids", self.do_upsert_dids(provider, dids, country)).await
    }

    async fn lease_did(&self, did_id: i64, destination: &str, call: Option<&CallRecord>) -> Result<bool> {
        self.timed("lease_did", self.do_lease_did(did_id, destination, call)).await
    }

    async fn release_did(&self, did: &str) -> Result<Option<String>> {
        self.timed("release_did", self.do_release_did(did)).await
    }

    async fn update_call_status(&self, call_id: &str, from: CallState, to: CallState) -> Result<bool> {
        self.timed("update_call_status", self.do_update_call_status(call_id, from, to)).await
    }

    async fn finish_call(
        &self,
        call_id: &str,
        from: CallState,
        to: CallState,
        end_time: DateTime<Utc>,
        duration: i64,
    ) -> Result<bool> {
        self.timed("finish_call", self.do_finish_call(call_id, from, to, end_time, duration)).await
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>> {
        self.timed("get_call", self.do_get_call(call_id)).await
    }

    async fn find_open_call_by_did(&self, did: &str, since: DateTime<Utc>) -> Result<Option<CallRecord>> {
        self.timed("find_open_call_by_did", self.do_find_open_call_by_did(did, since)).await
    }

    async fn load_open_calls(&self, since: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        self.timed("load_open_calls", self.do_load_open_calls(since)).await
    }

    async fn stale_calls(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        self.timed("stale_calls", self.do_stale_calls(cutoff)).await
    }

    async fn did_counts(&self, provider_id: Option<i64>) -> Result<DidCounts> {
        self.timed("did_counts", self.do_did_counts(provider_id)).await
    }

    async fn call_counts(&self, provider_id: Option<i64>, since: DateTime<Utc>) -> Result<CallCounts> {
        self.timed("call_counts", self.do_call_counts(provider_id, since)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn provider(name: &str) -> Provider {
        let now = Utc::now();
        Provider {
            id: 0,
            name: name.to_string(),
            host: "10.0.0.1".to_string(),
            port: 5060,
            username: None,
            password: None,
            realm: None,
            transport: "udp".to_string(),
            codecs: vec!["ulaw".to_string()],
            max_channels: 100,
            active: true,
            country: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn call(call_id: &str, did: &str, provider: &Provider, start_time: DateTime<Utc>) -> CallRecord {
        CallRecord {
            call_id: call_id.to_string(),
            original_ani: "7135550000".to_string(),
            original_dnis: "8005551234".to_string(),
            assigned_did: did.to_string(),
            provider_id: provider.id,
            provider_name: provider.name.clone(),
            status: CallState::Active,
            start_time,
            end_time: None,
            duration: 0,
            recording_path: None,
        }
    }

    #[tokio::test]
    async fn upsert_provider_keeps_id_stable() {
        let store = SqliteStore::in_memory().await.unwrap();
        let first = store.upsert_provider(&provider("p1")).await.unwrap();

        let mut changed = provider("p1");
        changed.host = "10.0.0.2".to_string();
        let second = store.upsert_provider(&changed).await.unwrap();

        assert_eq!(first.id, second.id);
        let loaded = store.load_active_providers().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].host, "10.0.0.2");
        assert_eq!(loaded[0].codecs, vec!["ulaw".to_string()]);
    }

    #[tokio::test]
    async fn upsert_provider_resyncs_did_provider_name() {
        let store = SqliteStore::in_memory().await.unwrap();
        let p1 = store.upsert_provider(&provider("p1")).await.unwrap();
        store.upsert_dids(&p1, &["100".to_string()], None).await.unwrap();
        sqlx::query("UPDATE dids SET provider_name = 'old-name' WHERE provider_id = ?")
            .bind(p1.id)
            .execute(store.pool())
            .await
            .unwrap();

        store.upsert_provider(&provider("p1")).await.unwrap();

        let (name,): (String,) = sqlx::query_as("SELECT provider_name FROM dids WHERE did = '100'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(name, "p1");
        assert_eq!(store.provider_dids(p1.id).await.unwrap()[0].provider_name, "p1");
    }

    #[tokio::test]
    async fn duplicate_call_rolls_back_did_mark() {
        let store = SqliteStore::in_memory().await.unwrap();
        let p1 = store.upsert_provider(&provider("p1")).await.unwrap();
        store
            .upsert_dids(&p1, &["100".to_string(), "200".to_string()], None)
            .await
            .unwrap();
        let dids = store.provider_dids(p1.id).await.unwrap();

        let now = Utc::now();
        assert!(store
            .lease_did(dids[0].id, "8005551234", Some(&call("c1", "100", &p1, now)))
            .await
            .unwrap());

        let err = store
            .lease_did(dids[1].id, "8005551234", Some(&call("c1", "200", &p1, now)))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::DuplicateCall(ref id) if id == "c1"));

        let dids = store.provider_dids(p1.id).await.unwrap();
        assert!(dids[0].in_use);
        assert!(!dids[1].in_use, "failed insert must not leave the DID marked");
    }

    #[tokio::test]
    async fn finish_call_frees_did_in_same_step() {
        let store = SqliteStore::in_memory().await.unwrap();
        let p1 = store.upsert_provider(&provider("p1")).await.unwrap();
        store.upsert_dids(&p1, &["100".to_string()], None).await.unwrap();
        let did = store.provider_dids(p1.id).await.unwrap().remove(0);

        let start = Utc::now() - ChronoDuration::seconds(42);
        store
            .lease_did(did.id, "8005551234", Some(&call("c1", "100", &p1, start)))
            .await
            .unwrap();

        let end = Utc::now();
        assert!(store
            .finish_call("c1", CallState::Active, CallState::Failed, end, 42)
            .await
            .unwrap());
        // second attempt sees the call already terminal
        assert!(!store
            .finish_call("c1", CallState::Active, CallState::Failed, end, 42)
            .await
            .unwrap());

        let record = store.get_call("c1").await.unwrap().unwrap();
        assert_eq!(record.status, CallState::Failed);
        assert_eq!(record.duration, 42);
        assert!(record.end_time.is_some());
        assert!(!store.provider_dids(p1.id).await.unwrap()[0].in_use);
    }

    #[tokio::test]
    async fn release_refuses_did_held_by_open_call() {
        let store = SqliteStore::in_memory().await.unwrap();
        let p1 = store.upsert_provider(&provider("p1")).await.unwrap();
        store.upsert_dids(&p1, &["100".to_string()], None).await.unwrap();
        let did = store.provider_dids(p1.id).await.unwrap().remove(0);
        store
            .lease_did(did.id, "8005551234", Some(&call("c1", "100", &p1, Utc::now())))
            .await
            .unwrap();

        assert_eq!(store.release_did("100").await.unwrap().as_deref(), Some("c1"));
        assert!(store.provider_dids(p1.id).await.unwrap()[0].in_use);

        store
            .finish_call("c1", CallState::Active, CallState::Completed, Utc::now(), 0)
            .await
            .unwrap();
        assert_eq!(store.release_did("100").await.unwrap(), None);
    }

    #[tokio::test]
    async fn finish_call_keeps_did_held_by_another_open_call() {
        let store = SqliteStore::in_memory().await.unwrap();
        let p1 = store.upsert_provider(&provider("p1")).await.unwrap();
        store.upsert_dids(&p1, &["100".to_string()], None).await.unwrap();
        let did = store.provider_dids(p1.id).await.unwrap().remove(0);
        store
            .lease_did(did.id, "8005551234", Some(&call("c1", "100", &p1, Utc::now())))
            .await
            .unwrap();

        // A second open row on the same number, as left behind by an older build
        sqlx::query(&format!(
            "INSERT INTO call_records ({}) VALUES ('c2', '1', '2', '100', ?, 'p1', 'ACTIVE', ?, NULL, 0, NULL)",
            CALL_COLUMNS
        ))
        .bind(p1.id)
        .bind(to_millis(Utc::now()))
        .execute(store.pool())
        .await
        .unwrap();

        assert!(store
            .finish_call("c1", CallState::Active, CallState::Failed, Utc::now(), 0)
            .await
            .unwrap());
        assert!(store.provider_dids(p1.id).await.unwrap()[0].in_use);

        assert!(store
            .finish_call("c2", CallState::Active, CallState::Failed, Utc::now(), 0)
            .await
            .unwrap());
        assert!(!store.provider_dids(p1.id).await.unwrap()[0].in_use);
    }

    #[tokio::test]
    async fn counts_on_empty_store_are_zero() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.did_counts(None).await.unwrap(), DidCounts::default());
        assert_eq!(
            store.call_counts(Some(7), Utc::now()).await.unwrap(),
            CallCounts::default()
        );
    }
}
