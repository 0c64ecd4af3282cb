//! Best-effort RDBMS write-through behind the JSON state files.
//!
//! The JSON files stay authoritative: every mirror write is fire-and-forget,
//! failures are logged and ignored, and startup reconciliation never reads
//! from the database.

use sqlx::SqlitePool;
use tracing::{info, warn};

use super::{ProjectState, UsageRecord};

/// Write-through sink for project state and usage. Implementations must be
/// non-blocking from the caller's perspective.
pub trait StateMirror: Send + Sync {
    fn upsert_project(&self, state: &ProjectState);
    fn log_usage(&self, record: &UsageRecord);
}

/// sqlx-backed mirror. Writes are spawned onto the runtime so a slow or
/// down database never stalls the feedback loop.
pub struct SqlxMirror {
    pool: SqlitePool,
}

impl SqlxMirror {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePool::connect(url).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS projects (
                name TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                max_iterations INTEGER NOT NULL,
                quality_threshold REAL NOT NULL,
                last_score REAL,
                error TEXT,
                is_running INTEGER NOT NULL,
                last_update TEXT NOT NULL,
                state_json TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_records (
                id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                agent TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost REAL NOT NULL,
                provider TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        info!(url, "State mirror connected");
        Ok(Self { pool })
    }
}

impl StateMirror for SqlxMirror {
    fn upsert_project(&self, state: &ProjectState) {
        let pool = self.pool.clone();
        let state = state.clone();
        let state_json = match serde_json::to_string(&state) {
            Ok(json) => json,
            Err(e) => {
                warn!("Mirror skipped state write (serialize failed): {e}");
                return;
            }
        };
        tokio::spawn(async move {
            let result = sqlx::query(
                "INSERT INTO projects
                   (name, phase, iteration, max_iterations, quality_threshold,
                    last_score, error, is_running, last_update, state_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(name) DO UPDATE SET
                   phase = excluded.phase,
                   iteration = excluded.iteration,
                   max_iterations = excluded.max_iterations,
                   quality_threshold = excluded.quality_threshold,
                   last_score = excluded.last_score,
                   error = excluded.error,
                   is_running = excluded.is_running,
                   last_update = excluded.last_update,
                   state_json = excluded.state_json",
            )
            .bind(&state.name)
            .bind(state.phase.as_str())
            .bind(state.iteration as i64)
            .bind(state.max_iterations as i64)
            .bind(state.quality_threshold)
            .bind(state.last_score)
            .bind(&state.error)
            .bind(state.is_running as i32)
            .bind(&state.last_update)
            .bind(&state_json)
            .execute(&pool)
            .await;
            if let Err(e) = result {
                warn!(project = %state.name, "DB write failed for state (JSON is primary): {e}");
            }
        });
    }

    fn log_usage(&self, record: &UsageRecord) {
        let pool = self.pool.clone();
        let record = record.clone();
        tokio::spawn(async move {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO usage_records
                   (id, project, timestamp, agent, iteration,
                    input_tokens, output_tokens, cost, provider)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(&record.project)
            .bind(&record.timestamp)
            .bind(&record.agent)
            .bind(record.iteration as i64)
            .bind(record.input_tokens as i64)
            .bind(record.output_tokens as i64)
            .bind(record.cost)
            .bind(&record.provider)
            .execute(&pool)
            .await;
            if let Err(e) = result {
                warn!(project = %record.project, "DB write failed for usage (JSON is primary): {e}");
            }
        });
    }
}
