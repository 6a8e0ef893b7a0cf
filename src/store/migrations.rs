//! Database schema and migration helpers.
//!
//! This module holds the SQL schema for the store and a small idempotent
//! migration runner that applies it at startup.

use sqlx::PgPool;
use thiserror::Error;

/// SQL schema for creating the batches table.
const CREATE_BATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    batch_id VARCHAR(255) PRIMARY KEY,
    status VARCHAR(20) NOT NULL,
    total BIGINT NOT NULL,
    pending BIGINT NOT NULL DEFAULT 0,
    processing BIGINT NOT NULL DEFAULT 0,
    completed BIGINT NOT NULL DEFAULT 0,
    failed BIGINT NOT NULL DEFAULT 0,
    cancelled BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the responses table.
const CREATE_RESPONSES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS responses (
    response_id VARCHAR(255) PRIMARY KEY,
    batch_id VARCHAR(255) NOT NULL,
    agent_id VARCHAR(255) NOT NULL,
    prompt TEXT NOT NULL,
    response_text TEXT NOT NULL,
    context TEXT,
    reference TEXT,
    metadata JSONB,
    status VARCHAR(20) NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the evaluations table.
///
/// The primary key on `response_id` is the uniqueness constraint the
/// finaliser's idempotence rests on: a second finalisation for the same
/// record is rejected here rather than deduplicated anywhere upstream.
const CREATE_EVALUATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS evaluations (
    response_id VARCHAR(255) PRIMARY KEY REFERENCES responses(response_id) ON DELETE CASCADE,
    batch_id VARCHAR(255) NOT NULL,
    agent_id VARCHAR(255) NOT NULL,
    scores JSONB NOT NULL,
    final_score DOUBLE PRECISION NOT NULL,
    processing_errors JSONB NOT NULL,
    processing_time_ms BIGINT NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_RESPONSES_BATCH_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_responses_batch_id ON responses(batch_id)";

const CREATE_RESPONSES_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_responses_batch_status ON responses(batch_id, status)";

const CREATE_EVALUATIONS_BATCH_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_evaluations_batch_id ON evaluations(batch_id)";

const CREATE_EVALUATIONS_AGENT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_evaluations_agent_id ON evaluations(agent_id)";

/// Returns all schema statements in the correct order.
fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_BATCHES_TABLE,
        CREATE_RESPONSES_TABLE,
        CREATE_EVALUATIONS_TABLE,
        CREATE_RESPONSES_BATCH_INDEX,
        CREATE_RESPONSES_STATUS_INDEX,
        CREATE_EVALUATIONS_BATCH_INDEX,
        CREATE_EVALUATIONS_AGENT_INDEX,
    ]
}

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    /// Creates a new migration runner.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations.
    ///
    /// Idempotent: running it multiple times will not cause errors or
    /// duplicate schema objects.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        self.ensure_migrations_table().await?;

        for (idx, statement) in all_schema_statements().iter().enumerate() {
            let migration_name = format!("schema_v1_part_{}", idx);

            if !self.is_migration_applied(&migration_name).await? {
                self.apply_migration(&migration_name, statement).await?;
            }
        }

        Ok(())
    }

    /// Ensures the migrations tracking table exists.
    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Checks if a migration has already been applied.
    async fn is_migration_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let result: Option<(i32,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(result.is_some())
    }

    /// Applies a single migration inside a transaction.
    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Returns a list of applied migrations.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_migrations_table().await?;

        let migrations: Vec<AppliedMigration> =
            sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY applied_at")
                .fetch_all(&self.pool)
                .await?;

        Ok(migrations)
    }
}

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    /// Name of the migration.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statement_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 7);
        // Responses must exist before evaluations reference them.
        assert!(statements[1].contains("responses"));
        assert!(statements[2].contains("REFERENCES responses"));
        // Indexes come after tables.
        assert!(statements[3].starts_with("CREATE INDEX"));
    }

    #[test]
    fn test_evaluations_unique_per_response() {
        // The finaliser depends on this constraint for idempotence.
        assert!(CREATE_EVALUATIONS_TABLE.contains("response_id VARCHAR(255) PRIMARY KEY"));
    }

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed("test error".to_string());
        assert!(err.to_string().contains("test error"));
    }
}
