//! PostgreSQL state manager

use super::{LogStats, SubmissionLog};
use crate::config::DatabaseConfig;
use crate::error::{SubmitterError, SubmitterResult};
use crate::tx::{FeeQuote, RecordStatus, SubmissionRecord};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> SubmitterResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SubmitterResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS submission_records (
                id UUID PRIMARY KEY,
                request_id UUID NOT NULL,
                sender VARCHAR(42) NOT NULL,
                attempt INTEGER NOT NULL,
                nonce BIGINT,
                quote JSONB,
                tx_hash VARCHAR(66),
                status VARCHAR(20) NOT NULL,
                block_number BIGINT,
                position BIGINT,
                cost VARCHAR(78),
                error TEXT,
                replaces VARCHAR(66),
                description TEXT NOT NULL DEFAULT '',
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_records_request
            ON submission_records (request_id, recorded_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_records_tx_hash
            ON submission_records (tx_hash, recorded_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> SubmitterResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionLog for StateManager {
    async fn append(&self, record: &SubmissionRecord) -> SubmitterResult<()> {
        let quote = record
            .quote
            .map(|q| serde_json::to_value(q))
            .transpose()
            .map_err(|e| SubmitterError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO submission_records
                (id, request_id, sender, attempt, nonce, quote, tx_hash, status,
                 block_number, position, cost, error, replaces, description, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(record.id)
        .bind(record.request_id)
        .bind(format!("{:?}", record.sender))
        .bind(record.attempt as i32)
        .bind(record.nonce.map(|n| n as i64))
        .bind(quote)
        .bind(record.tx_hash.map(|h| format!("{:?}", h)))
        .bind(record.status.as_str())
        .bind(record.block_number.map(|b| b as i64))
        .bind(record.position.map(|p| p as i64))
        .bind(record.cost.map(|c| c.to_string()))
        .bind(&record.error)
        .bind(record.replaces.map(|h| format!("{:?}", h)))
        .bind(&record.description)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        debug!(
            request_id = %record.request_id,
            status = record.status.as_str(),
            "Appended submission record"
        );
        Ok(())
    }

    async fn get(&self, request_id: Uuid) -> SubmitterResult<Vec<SubmissionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM submission_records
            WHERE request_id = $1
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn unresolved(&self) -> SubmitterResult<Vec<SubmissionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT DISTINCT ON (tx_hash) *
                FROM submission_records
                WHERE tx_hash IS NOT NULL
                ORDER BY tx_hash, recorded_at DESC
            ) latest
            WHERE status = 'broadcast'
            ORDER BY recorded_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn stats(&self) -> SubmitterResult<LogStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'broadcast') as broadcast,
                COUNT(*) FILTER (WHERE status = 'confirmed') as confirmed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'replaced') as replaced
            FROM submission_records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LogStats {
            broadcast: row.try_get::<i64, _>("broadcast")? as u64,
            confirmed: row.try_get::<i64, _>("confirmed")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            replaced: row.try_get::<i64, _>("replaced")? as u64,
        })
    }
}

fn record_from_row(row: &PgRow) -> SubmitterResult<SubmissionRecord> {
    let status: String = row.try_get("status")?;
    let status = RecordStatus::parse(&status)
        .ok_or_else(|| SubmitterError::Internal(format!("Unknown record status {}", status)))?;

    let quote: Option<serde_json::Value> = row.try_get("quote")?;
    let quote = quote
        .map(serde_json::from_value::<FeeQuote>)
        .transpose()
        .map_err(|e| SubmitterError::Internal(format!("Corrupt fee quote: {}", e)))?;

    let cost: Option<String> = row.try_get("cost")?;
    let cost = cost
        .map(|c| U256::from_dec_str(&c))
        .transpose()
        .map_err(|e| SubmitterError::Internal(format!("Corrupt cost: {}", e)))?;

    let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;

    Ok(SubmissionRecord {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        sender: parse_hex::<Address>(&row.try_get::<String, _>("sender")?)?,
        attempt: row.try_get::<i32, _>("attempt")? as u32,
        nonce: row.try_get::<Option<i64>, _>("nonce")?.map(|n| n as u64),
        quote,
        tx_hash: row
            .try_get::<Option<String>, _>("tx_hash")?
            .map(|h| parse_hex::<H256>(&h))
            .transpose()?,
        status,
        block_number: row.try_get::<Option<i64>, _>("block_number")?.map(|b| b as u64),
        position: row.try_get::<Option<i64>, _>("position")?.map(|p| p as u64),
        cost,
        error: row.try_get("error")?,
        replaces: row
            .try_get::<Option<String>, _>("replaces")?
            .map(|h| parse_hex::<H256>(&h))
            .transpose()?,
        description: row.try_get("description")?,
        recorded_at,
    })
}

fn parse_hex<T: std::str::FromStr>(value: &str) -> SubmitterResult<T> {
    value
        .parse::<T>()
        .map_err(|_| SubmitterError::Internal(format!("Corrupt hex value {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_columns_round_trip_through_debug_format() {
        let address = Address::repeat_byte(0xab);
        let hash = H256::repeat_byte(0xcd);

        assert_eq!(parse_hex::<Address>(&format!("{:?}", address)).unwrap(), address);
        assert_eq!(parse_hex::<H256>(&format!("{:?}", hash)).unwrap(), hash);
        assert!(parse_hex::<H256>("not-hex").is_err());
    }
}
