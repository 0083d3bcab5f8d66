//! SQLite-backed queue handle: connection, migrations, event channel.
//!
//! Job reads and writes live in `jobs`.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

use crate::error::GateResult;

use super::types::JobEvent;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Percent-encode a path for use in a sqlite:// URI so spaces and special chars don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

/// Handle to the job queue.
///
/// Cloning is cheap; clones share the connection pool and the event channel.
/// The database file lives under the XDG state directory:
/// `~/.local/state/clipgate/jobs.db`.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pub(super) pool: Pool<Sqlite>,
    pub(super) events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    fn from_pool(pool: Pool<Sqlite>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { pool, events }
    }

    /// Open (or create) the default queue database and run migrations.
    pub async fn open_default() -> anyhow::Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("clipgate")?;
        let db_path = xdg_dirs.get_state_home().join("jobs.db");
        Ok(Self::open_at(&db_path).await?)
    }

    /// Open (or create) the database at a specific path. Creates parent dirs if needed.
    pub async fn open_at(path: impl AsRef<Path>) -> GateResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(sqlx::Error::Io)?;
        }
        let uri = path_to_sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await?;
        let queue = Self::from_pool(pool);
        queue.migrate().await?;
        Ok(queue)
    }

    /// Open an in-memory queue (no disk I/O). A single connection keeps the
    /// database alive for the lifetime of the pool.
    pub async fn open_memory() -> GateResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let queue = Self::from_pool(pool);
        queue.migrate().await?;
        Ok(queue)
    }

    /// Subscribe to status-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub(super) fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn migrate(&self) -> GateResult<()> {
        // The partial unique index enforces at most one in-flight job per
        // (user, url); terminal jobs drop out of it so the pair can be resubmitted.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                source_url TEXT NOT NULL,
                platform TEXT NOT NULL,
                with_subtitles INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                stage TEXT,
                error TEXT,
                last_error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_proxy_id TEXT,
                file_url TEXT,
                thumbnail_url TEXT,
                duration_secs REAL,
                processing_time_ms INTEGER,
                created_at INTEGER NOT NULL,
                admitted_at INTEGER,
                completed_at INTEGER,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_in_flight
            ON jobs (user_id, source_url)
            WHERE status NOT IN ('completed', 'failed')
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Current time as Unix seconds (for DB timestamps).
pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
