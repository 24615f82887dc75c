use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use casefile_core::{Finding, FindingId, InvestigationId};

use super::{InvestigationReadError, InvestigationReader};

/// Reads the application's `investigations` and `findings` tables.
#[derive(Debug, Clone)]
pub struct PostgresInvestigationReader {
    pool: Arc<PgPool>,
}

impl PostgresInvestigationReader {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> InvestigationReadError {
    InvestigationReadError::Unavailable(format!("sqlx error in {}: {}", operation, err))
}

#[async_trait]
impl InvestigationReader for PostgresInvestigationReader {
    #[instrument(skip(self), err)]
    async fn investigation_exists(&self, id: InvestigationId) -> Result<bool, InvestigationReadError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM investigations WHERE id = $1)")
            .bind(id.get())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("investigation_exists", e))
    }

    #[instrument(skip(self), err)]
    async fn findings(&self, id: InvestigationId) -> Result<Vec<Finding>, InvestigationReadError> {
        let rows = sqlx::query(
            r#"
            SELECT id, investigation_id, tool_name, data_type, summary, raw_data, collected_at
            FROM findings
            WHERE investigation_id = $1
            ORDER BY collected_at ASC, id ASC
            "#,
        )
        .bind(id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("findings", e))?;

        rows.iter()
            .map(|row| {
                let decode = |e: sqlx::Error| map_sqlx_error("findings", e);
                Ok(Finding {
                    id: FindingId::new(row.try_get("id").map_err(decode)?),
                    investigation_id: InvestigationId::new(
                        row.try_get("investigation_id").map_err(decode)?,
                    ),
                    tool_name: row.try_get("tool_name").map_err(decode)?,
                    data_type: row.try_get("data_type").map_err(decode)?,
                    summary: row.try_get("summary").map_err(decode)?,
                    raw_data: row.try_get("raw_data").map_err(decode)?,
                    collected_at: row
                        .try_get::<DateTime<Utc>, _>("collected_at")
                        .map_err(decode)?,
                })
            })
            .collect()
    }
}
