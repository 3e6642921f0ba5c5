use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use super::store::StepStore;
use super::types::{StatusUpdate, StepKey, StepStatus, VersionKey, WorkflowStep};
use crate::error::StoreError;

const STEP_COLUMNS: &str = "object_id, workflow, version, process, status, attempts, lane, \
     lifecycle, error_msg, error_txt, note, elapsed, active_version, created_at, updated_at";

/// Step store backed by SQLite.
///
/// Claims and optimistic status updates are single conditional `UPDATE ...
/// RETURNING` statements, so the database serializes racing writers and a
/// row can only ever be claimed once.
pub struct SqliteStepStore {
    pool: SqlitePool,
}

impl SqliteStepStore {
    /// Connect (creating the database file if needed) and optionally run
    /// migrations.
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        auto_migrate: bool,
    ) -> Result<Self, StoreError> {
        if !Sqlite::database_exists(database_url).await? {
            info!("Creating step database at {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        if auto_migrate {
            info!("Running step store migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Step store migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn shutdown(&self) {
        info!("Shutting down step store connections...");
        self.pool.close().await;
        info!("Step store connections closed");
    }

    async fn current_status(&self, key: &StepKey) -> Result<Option<StepStatus>, StoreError> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            SELECT status FROM workflow_steps
            WHERE object_id = ?1 AND workflow = ?2 AND version = ?3 AND process = ?4
            "#,
        )
        .bind(&key.object_id)
        .bind(&key.workflow)
        .bind(key.version as i64)
        .bind(&key.process)
        .fetch_optional(&self.pool)
        .await?;

        status.map(|s| parse_status(&s)).transpose()
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn parse_status(raw: &str) -> Result<StepStatus, StoreError> {
    raw.parse().map_err(StoreError::Corrupt)
}

fn step_from_row(row: &SqliteRow) -> Result<WorkflowStep, StoreError> {
    let version: i64 = row.try_get("version")?;
    let attempts: i64 = row.try_get("attempts")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(WorkflowStep {
        key: StepKey {
            object_id: row.try_get("object_id")?,
            workflow: row.try_get("workflow")?,
            version: u32::try_from(version)
                .map_err(|_| StoreError::Corrupt(format!("bad version {version}")))?,
            process: row.try_get("process")?,
        },
        status: parse_status(&status)?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        lane: row.try_get("lane")?,
        lifecycle: row.try_get("lifecycle")?,
        error_message: row.try_get("error_msg")?,
        error_text: row.try_get("error_txt")?,
        note: row.try_get("note")?,
        elapsed_seconds: row.try_get("elapsed")?,
        active_version: row.try_get("active_version")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn steps_from_rows(rows: &[SqliteRow]) -> Result<Vec<WorkflowStep>, StoreError> {
    rows.iter().map(step_from_row).collect()
}

#[async_trait]
impl StepStore for SqliteStepStore {
    async fn instantiate(&self, steps: Vec<WorkflowStep>) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for step in &steps {
            let max_version: Option<i64> =
                sqlx::query_scalar("SELECT MAX(version) FROM workflow_steps WHERE object_id = ?1")
                    .bind(&step.key.object_id)
                    .fetch_one(&mut *tx)
                    .await?;
            let newest = max_version.map_or(true, |max| i64::from(step.key.version) >= max);

            let result = sqlx::query(
                r#"
                INSERT INTO workflow_steps
                    (object_id, workflow, version, process, status, attempts, lane,
                     lifecycle, error_msg, error_txt, note, elapsed, active_version,
                     created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT (object_id, workflow, version, process) DO NOTHING
                "#,
            )
            .bind(&step.key.object_id)
            .bind(&step.key.workflow)
            .bind(step.key.version as i64)
            .bind(&step.key.process)
            .bind(step.status.as_str())
            .bind(step.attempts as i64)
            .bind(&step.lane)
            .bind(&step.lifecycle)
            .bind(&step.error_message)
            .bind(&step.error_text)
            .bind(&step.note)
            .bind(step.elapsed_seconds)
            .bind(newest)
            .bind(timestamp(step.created_at))
            .bind(timestamp(step.updated_at))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }
            inserted += 1;

            if newest {
                sqlx::query(
                    "UPDATE workflow_steps SET active_version = (version = ?2) WHERE object_id = ?1",
                )
                .bind(&step.key.object_id)
                .bind(step.key.version as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(inserted, "Instantiated workflow steps");
        Ok(inserted)
    }

    async fn find(&self, key: &StepKey) -> Result<WorkflowStep, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps \
             WHERE object_id = ?1 AND workflow = ?2 AND version = ?3 AND process = ?4"
        );
        let row = sqlx::query(&sql)
            .bind(&key.object_id)
            .bind(&key.workflow)
            .bind(key.version as i64)
            .bind(&key.process)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => step_from_row(&row),
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    async fn steps_for(&self, version: &VersionKey) -> Result<Vec<WorkflowStep>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps \
             WHERE object_id = ?1 AND workflow = ?2 AND version = ?3 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(&version.object_id)
            .bind(&version.workflow)
            .bind(version.version as i64)
            .fetch_all(&self.pool)
            .await?;
        steps_from_rows(&rows)
    }

    async fn steps_for_object(&self, object_id: &str) -> Result<Vec<WorkflowStep>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE object_id = ?1 ORDER BY version, id"
        );
        let rows = sqlx::query(&sql)
            .bind(object_id)
            .fetch_all(&self.pool)
            .await?;
        steps_from_rows(&rows)
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<WorkflowStep, StoreError> {
        let key = &update.key;
        let sql = format!(
            r#"
            UPDATE workflow_steps SET
                status = ?5,
                attempts = attempts + CASE WHEN ?5 = 'started' THEN 1 ELSE 0 END,
                error_msg = CASE WHEN ?5 = 'error' THEN error_msg ELSE NULL END,
                error_txt = CASE WHEN ?5 = 'error' THEN error_txt ELSE NULL END,
                elapsed = ?6,
                lifecycle = COALESCE(?7, lifecycle),
                note = COALESCE(?8, note),
                updated_at = ?9
            WHERE object_id = ?1 AND workflow = ?2 AND version = ?3 AND process = ?4
              AND (?10 IS NULL OR status = ?10)
            RETURNING {STEP_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&key.object_id)
            .bind(&key.workflow)
            .bind(key.version as i64)
            .bind(&key.process)
            .bind(update.status.as_str())
            .bind(update.elapsed_seconds)
            .bind(&update.lifecycle)
            .bind(&update.note)
            .bind(timestamp(Utc::now()))
            .bind(update.expected_current.map(|s| s.as_str()))
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return step_from_row(&row);
        }

        // Nothing matched: either the step does not exist or the optimistic
        // check failed.
        match (self.current_status(key).await?, update.expected_current) {
            (None, _) => Err(StoreError::NotFound(key.clone())),
            (Some(actual), Some(expected)) => Err(StoreError::Conflict {
                key: key.clone(),
                expected,
                actual,
            }),
            (Some(_), None) => Err(StoreError::Corrupt(format!(
                "unconditional update of {key} matched no row"
            ))),
        }
    }

    async fn update_error(
        &self,
        key: &StepKey,
        message: &str,
        text: Option<&str>,
    ) -> Result<WorkflowStep, StoreError> {
        let sql = format!(
            r#"
            UPDATE workflow_steps SET
                status = 'error', error_msg = ?5, error_txt = ?6, updated_at = ?7
            WHERE object_id = ?1 AND workflow = ?2 AND version = ?3 AND process = ?4
            RETURNING {STEP_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&key.object_id)
            .bind(&key.workflow)
            .bind(key.version as i64)
            .bind(&key.process)
            .bind(message)
            .bind(text)
            .bind(timestamp(Utc::now()))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => step_from_row(&row),
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    async fn claim_waiting(
        &self,
        version: &VersionKey,
        processes: &[String],
    ) -> Result<Vec<WorkflowStep>, StoreError> {
        if processes.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE workflow_steps SET status = 'queued', updated_at = ");
        builder.push_bind(timestamp(Utc::now()));
        builder.push(" WHERE status = 'waiting' AND object_id = ");
        builder.push_bind(version.object_id.clone());
        builder.push(" AND workflow = ");
        builder.push_bind(version.workflow.clone());
        builder.push(" AND version = ");
        builder.push_bind(version.version as i64);
        builder.push(" AND process IN (");
        let mut names = builder.separated(", ");
        for process in processes {
            names.push_bind(process.clone());
        }
        names.push_unseparated(") RETURNING ");
        builder.push(STEP_COLUMNS);

        let rows = builder.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        steps_from_rows(&rows)
    }

    async fn stale_steps(
        &self,
        status: StepStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowStep>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps \
             WHERE status = ?1 AND updated_at < ?2 ORDER BY updated_at LIMIT ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(timestamp(updated_before))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        steps_from_rows(&rows)
    }
}
