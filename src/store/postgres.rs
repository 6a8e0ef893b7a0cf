//! PostgreSQL store implementation.
//!
//! Persists records, evaluations, and batch summaries with sqlx. Batch
//! progress is derived from the `responses` table on demand rather than kept
//! as authoritative counters, so the projection can always be recomputed from
//! record statuses.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::dimension::Dimension;
use crate::record::{BatchProgress, BatchStatus, Evaluation, RecordStatus, ResponseRecord};

use super::migrations::MigrationRunner;
use super::{Store, StoreError};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

/// PostgreSQL-backed store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects to the database.
    ///
    /// # Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<ResponseRecord, StoreError> {
        let status_str: String = row.get("status");
        let status: RecordStatus = status_str.parse().map_err(StoreError::Query)?;
        let retry_count: i32 = row.get("retry_count");

        Ok(ResponseRecord {
            response_id: row.get("response_id"),
            batch_id: row.get("batch_id"),
            agent_id: row.get("agent_id"),
            prompt: row.get("prompt"),
            response_text: row.get("response_text"),
            context: row.get("context"),
            reference: row.get("reference"),
            metadata: row.get("metadata"),
            status,
            retry_count: retry_count.max(0) as u32,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_batch(&self, batch_id: &str, total: u64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO batches (batch_id, status, total, pending)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (batch_id) DO NOTHING
            "#,
        )
        .bind(batch_id)
        .bind(BatchStatus::Processing.as_str())
        .bind(total as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "batch {} already exists",
                batch_id
            )));
        }

        Ok(())
    }

    async fn insert_record(&self, record: &ResponseRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO responses (
                response_id, batch_id, agent_id, prompt, response_text,
                context, reference, metadata, status, retry_count, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (response_id) DO NOTHING
            "#,
        )
        .bind(&record.response_id)
        .bind(&record.batch_id)
        .bind(&record.agent_id)
        .bind(&record.prompt)
        .bind(&record.response_text)
        .bind(&record.context)
        .bind(&record.reference)
        .bind(&record.metadata)
        .bind(record.status.as_str())
        .bind(record.retry_count as i32)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "record {} already exists",
                record.response_id
            )));
        }

        Ok(())
    }

    async fn get_record(&self, response_id: &str) -> Result<ResponseRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT response_id, batch_id, agent_id, prompt, response_text,
                   context, reference, metadata, status, retry_count, created_at
            FROM responses
            WHERE response_id = $1
            "#,
        )
        .bind(response_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_record(&row),
            None => Err(StoreError::NotFound(format!("record {}", response_id))),
        }
    }

    async fn mark_record_status(
        &self,
        response_id: &str,
        status: RecordStatus,
    ) -> Result<bool, StoreError> {
        // Terminal statuses are sticky; only the requeue path (back to
        // `queued`) may leave them.
        let result = sqlx::query(
            r#"
            UPDATE responses
            SET status = $2
            WHERE response_id = $1
              AND (status NOT IN ('completed', 'failed', 'cancelled') OR $2 = 'queued')
            "#,
        )
        .bind(response_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM responses WHERE response_id = $1")
                .bind(response_id)
                .fetch_optional(&self.pool)
                .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("record {}", response_id))),
        }
    }

    async fn set_retry_count(
        &self,
        response_id: &str,
        retry_count: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE responses SET retry_count = $2 WHERE response_id = $1")
            .bind(response_id)
            .bind(retry_count as i32)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("record {}", response_id)));
        }

        Ok(())
    }

    async fn write_evaluation(&self, evaluation: &Evaluation) -> Result<(), StoreError> {
        let scores = serde_json::to_value(&evaluation.scores)?;
        let errors = serde_json::to_value(&evaluation.processing_errors)?;

        let result = sqlx::query(
            r#"
            INSERT INTO evaluations (
                response_id, batch_id, agent_id, scores, final_score,
                processing_errors, processing_time_ms, processed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (response_id) DO NOTHING
            "#,
        )
        .bind(&evaluation.response_id)
        .bind(&evaluation.batch_id)
        .bind(&evaluation.agent_id)
        .bind(&scores)
        .bind(evaluation.final_score)
        .bind(&errors)
        .bind(evaluation.processing_time_ms as i64)
        .bind(evaluation.processed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "evaluation for {} already exists",
                evaluation.response_id
            )));
        }

        Ok(())
    }

    async fn get_evaluation(&self, response_id: &str) -> Result<Option<Evaluation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT response_id, batch_id, agent_id, scores, final_score,
                   processing_errors, processing_time_ms, processed_at
            FROM evaluations
            WHERE response_id = $1
            "#,
        )
        .bind(response_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let scores_json: serde_json::Value = row.get("scores");
        let scores: BTreeMap<Dimension, f64> = serde_json::from_value(scores_json)?;
        let errors_json: serde_json::Value = row.get("processing_errors");
        let processing_errors: Vec<String> = serde_json::from_value(errors_json)?;
        let processing_time_ms: i64 = row.get("processing_time_ms");

        Ok(Some(Evaluation {
            response_id: row.get("response_id"),
            batch_id: row.get("batch_id"),
            agent_id: row.get("agent_id"),
            scores,
            final_score: row.get("final_score"),
            processing_errors,
            processing_time_ms: processing_time_ms.max(0) as u64,
            processed_at: row.get("processed_at"),
        }))
    }

    async fn get_batch_progress(&self, batch_id: &str) -> Result<BatchProgress, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM responses
            WHERE batch_id = $1
            GROUP BY status
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut progress = BatchProgress::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            let count = count.max(0) as u64;

            progress.total += count;
            match status.as_str() {
                "pending" | "queued" => progress.pending += count,
                "processing" => progress.processing += count,
                "completed" => progress.completed += count,
                "failed" => progress.failed += count,
                "cancelled" => progress.cancelled += count,
                other => {
                    return Err(StoreError::Query(format!(
                        "unknown record status '{}' in batch {}",
                        other, batch_id
                    )))
                }
            }
        }

        Ok(progress)
    }

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatus, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM batches WHERE batch_id = $1")
                .bind(batch_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((status,)) => status.parse().map_err(StoreError::Query),
            None => Err(StoreError::NotFound(format!("batch {}", batch_id))),
        }
    }

    async fn set_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        progress: &BatchProgress,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO batches (
                batch_id, status, total, pending, processing, completed,
                failed, cancelled, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (batch_id) DO UPDATE SET
                status = EXCLUDED.status,
                total = EXCLUDED.total,
                pending = EXCLUDED.pending,
                processing = EXCLUDED.processing,
                completed = EXCLUDED.completed,
                failed = EXCLUDED.failed,
                cancelled = EXCLUDED.cancelled,
                updated_at = NOW()
            "#,
        )
        .bind(batch_id)
        .bind(status.as_str())
        .bind(progress.total as i64)
        .bind(progress.pending as i64)
        .bind(progress.processing as i64)
        .bind(progress.completed as i64)
        .bind(progress.failed as i64)
        .bind(progress.cancelled as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_pending_records(&self, batch_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE responses
            SET status = 'cancelled'
            WHERE batch_id = $1 AND status IN ('pending', 'queued')
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
