use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

use crate::queue::{Broker, Delivery, DeliveryTag};
use crate::vm::VmTerminationEvent;

const DATABASE_NAME: &str = "vmexec.sqlite3";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Local data directory, created on first use
pub fn get_data_dir() -> Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs =
        ProjectDirs::from("", "", "vmexec").context("Unable to find user directory")?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).context("Failed to create local data dir")?;

    Ok(data_dir.to_path_buf())
}

pub fn get_db_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMAs cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS queues (
            name          TEXT     PRIMARY KEY
        );",
        r"
        CREATE TABLE IF NOT EXISTS messages (
            id            INTEGER  PRIMARY KEY AUTOINCREMENT,
            queue         TEXT     NOT NULL,
            body          BLOB     NOT NULL,
            state         TEXT     NOT NULL DEFAULT 'ready',
            redelivered   INTEGER  NOT NULL DEFAULT 0,
            created_time  TEXT     NOT NULL
        );",
        "CREATE INDEX IF NOT EXISTS messages_by_queue ON messages (queue, state, id);",
        r"
        CREATE TABLE IF NOT EXISTS vm_terminations (
            vm_id          TEXT     PRIMARY KEY,
            role           TEXT     NOT NULL,
            reason         TEXT     NOT NULL,
            terminated_at  TEXT     NOT NULL,
            lifetime_ms    INTEGER  NOT NULL,
            affected_jobs  TEXT     NOT NULL
        );",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    // deliveries outstanding when the last process died go out again
    let recovered = sqlx::query(
        "UPDATE messages SET state = 'ready', redelivered = 1 WHERE state = 'unacked'",
    )
    .execute(tx.as_mut())
    .await?
    .rows_affected();

    tx.commit().await?;

    if recovered > 0 {
        log::warn!("Returned {recovered} unacknowledged message(s) to their queues");
    }
    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    body: Vec<u8>,
    redelivered: bool,
}

/// Durable queues in a SQLite table.
///
/// Consumers in this process are woken on publish; rows written by other
/// processes are picked up on the next poll.
pub struct SqliteBroker {
    pool: SqlitePool,
    poll_interval: Duration,
    published: Notify,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool, poll_interval: Option<Duration>) -> Self {
        Self {
            pool,
            poll_interval: poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            published: Notify::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Atomically moves the oldest ready message of `queue` to unacked
    async fn claim(&self, queue: &str) -> sqlx::Result<Option<MessageRow>> {
        sqlx::query_as::<_, MessageRow>(
            r"
            UPDATE messages SET state = 'unacked'
            WHERE id = (
                SELECT id FROM messages
                WHERE queue = ? AND state = 'ready'
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, body, redelivered
            ",
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
    }

    /// Number of messages of `queue` in `state`
    pub async fn count(&self, queue: &str, state: &str) -> sqlx::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE queue = ? AND state = ?")
            .bind(queue)
            .bind(state)
            .fetch_one(&self.pool)
            .await
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO queues (name) VALUES (?)")
            .bind(queue)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to declare queue {queue}"))?;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        sqlx::query("INSERT INTO messages (queue, body, created_time) VALUES (?, ?, ?)")
            .bind(queue)
            .bind(body)
            .bind(crate::create_timestamp())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to publish to {queue}"))?;
        self.published.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Delivery> {
        loop {
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(row) = self
                .claim(queue)
                .await
                .with_context(|| format!("Failed to consume from {queue}"))?
            {
                return Ok(Delivery {
                    tag: row.id as DeliveryTag,
                    body: row.body,
                    redelivered: row.redelivered,
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()> {
        let affected = sqlx::query(
            "DELETE FROM messages WHERE id = ? AND queue = ? AND state = 'unacked'",
        )
        .bind(tag as i64)
        .bind(queue)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            bail!("Unknown delivery tag {tag} on {queue}");
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let sql = if requeue {
            "UPDATE messages SET state = 'ready', redelivered = 1 WHERE id = ? AND queue = ? AND state = 'unacked'"
        } else {
            "UPDATE messages SET state = 'dead' WHERE id = ? AND queue = ? AND state = 'unacked'"
        };
        let affected = sqlx::query(sql)
            .bind(tag as i64)
            .bind(queue)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            bail!("Unknown delivery tag {tag} on {queue}");
        }
        if requeue {
            self.published.notify_waiters();
        }
        Ok(())
    }
}

/// A row of the VM termination audit log
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TerminationRecord {
    pub vm_id: String,
    pub role: String,
    pub reason: String,
    pub terminated_at: String,
    pub lifetime_ms: i64,
    pub affected_jobs: String,
}

pub async fn record_termination(
    event: &VmTerminationEvent,
    pool: &SqlitePool,
) -> sqlx::Result<()> {
    let affected_jobs = serde_json::to_string(&event.affected_jobs).unwrap_or_else(|_| "[]".into());
    sqlx::query(
        r"
        INSERT OR REPLACE INTO vm_terminations
            (vm_id, role, reason, terminated_at, lifetime_ms, affected_jobs)
        VALUES (?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(event.vm_id.to_string())
    .bind(event.role.as_str())
    .bind(format!("{:?}", event.reason))
    .bind(event.terminated_at.to_rfc3339())
    .bind(event.lifetime_ms as i64)
    .bind(affected_jobs)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent_terminations(
    limit: u32,
    pool: &SqlitePool,
) -> sqlx::Result<Vec<TerminationRecord>> {
    sqlx::query_as::<_, TerminationRecord>(
        r"
        SELECT vm_id, role, reason, terminated_at, lifetime_ms, affected_jobs
        FROM vm_terminations
        ORDER BY terminated_at DESC
        LIMIT ?
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Persists every termination event until `token` fires
pub async fn audit_terminations(
    pool: SqlitePool,
    mut events: broadcast::Receiver<VmTerminationEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                while let Ok(event) = events.try_recv() {
                    if let Err(e) = record_termination(&event, &pool).await {
                        log::error!("Failed to record termination of VM {}: {e}", event.vm_id);
                    }
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Err(e) = record_termination(&event, &pool).await {
                        log::error!("Failed to record termination of VM {}: {e}", event.vm_id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Termination audit fell behind, {missed} event(s) not recorded");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    log::debug!("Termination audit stopped");
}
