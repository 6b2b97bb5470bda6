/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! PostgreSQL / TimescaleDB backends

use crate::{
    catalog::HypertableCatalog,
    chunk::ChunkDescriptor,
    error::{RetentionError, Result},
    pending::{Claim, PendingConfirmation, PendingStore},
    policy::{RetentionPolicy, TablePolicy},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde::{Deserialize, Serialize};
use tokio_postgres::{types::Json, NoTls, Row};
use tracing::{debug, info, warn};

const LIST_CHUNKS_SQL: &str = "\
    SELECT format('%I.%I', chunk_schema, chunk_name) AS chunk_name, range_start, range_end \
    FROM timescaledb_information.chunks \
    WHERE hypertable_name = $2 \
      AND ($1::text IS NULL OR hypertable_schema = $1::text) \
      AND range_start IS NOT NULL \
      AND range_end IS NOT NULL \
    ORDER BY range_start, chunk_name";

// A chunk that is already gone resolves to NULL and is skipped.
const DROP_CHUNK_SQL: &str = "\
    SELECT _timescaledb_functions.drop_chunk(c) \
    FROM to_regclass($1::text) AS c \
    WHERE c IS NOT NULL";

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: usize,
    /// Table holding `table_name, enabled, retention_period_days` rows
    pub policy_table: String,
    /// Table used by the durable pending store
    pub pending_table: String,
    /// Persist pending confirmations so they survive restarts
    pub durable_pending: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost:5432/postgres".to_string(),
            max_connections: 8,
            policy_table: "hypertable_retention_policies".to_string(),
            pending_table: "archival_pending".to_string(),
            durable_pending: true,
        }
    }
}

/// Create a connection pool from configuration
pub fn create_pool(config: &DatabaseConfig) -> Result<Pool> {
    let mut cfg = deadpool_postgres::Config::new();
    cfg.url = Some(config.url.clone());
    cfg.pool = Some(PoolConfig::new(config.max_connections));
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    Ok(cfg.create_pool(Some(Runtime::Tokio1), NoTls)?)
}

/// Split `schema.table` into its parts
fn split_table_name(table_name: &str) -> (Option<&str>, &str) {
    match table_name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, table_name),
    }
}

/// Hypertable catalog backed by TimescaleDB information views
#[derive(Debug, Clone)]
pub struct PostgresCatalog {
    pool: Pool,
    policy_table: String,
}

impl PostgresCatalog {
    pub fn new(pool: Pool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            policy_table: config.policy_table.clone(),
        }
    }
}

#[async_trait]
impl HypertableCatalog for PostgresCatalog {
    async fn retention_policies(&self) -> Result<Vec<TablePolicy>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT table_name, enabled, retention_period_days FROM {} ORDER BY table_name",
            self.policy_table
        );

        client
            .query(sql.as_str(), &[])
            .await?
            .iter()
            .map(|row| -> Result<TablePolicy> {
                Ok(TablePolicy::new(
                    row.try_get::<_, String>("table_name")?,
                    RetentionPolicy::new(
                        row.try_get("enabled")?,
                        row.try_get("retention_period_days")?,
                    ),
                ))
            })
            .collect()
    }

    async fn list_chunks(&self, table_name: &str) -> Result<Vec<ChunkDescriptor>> {
        let (schema, table) = split_table_name(table_name);
        let client = self.pool.get().await?;

        client
            .query(LIST_CHUNKS_SQL, &[&schema, &table])
            .await?
            .iter()
            .map(|row| -> Result<ChunkDescriptor> {
                Ok(ChunkDescriptor::new(
                    row.try_get::<_, String>("chunk_name")?,
                    row.try_get::<_, DateTime<Utc>>("range_start")?,
                    row.try_get::<_, DateTime<Utc>>("range_end")?,
                ))
            })
            .collect()
    }

    async fn drop_chunks(
        &self,
        event_id: &str,
        table_name: &str,
        chunks: &[ChunkDescriptor],
    ) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Returning early drops `tx`, which rolls the whole batch back.
        for chunk in chunks {
            debug!("Dropping chunk {} of {}", chunk.chunk_name, table_name);
            tx.execute(DROP_CHUNK_SQL, &[&chunk.chunk_name])
                .await
                .map_err(|e| RetentionError::DropFailed {
                    event_id: event_id.to_string(),
                    chunk: chunk.chunk_name.clone(),
                    reason: e.to_string(),
                })?;
        }

        tx.commit().await?;
        info!(
            "Dropped {} chunks of {} for event {}",
            chunks.len(),
            table_name,
            event_id
        );
        Ok(())
    }
}

/// Pending store persisted in a database table.
///
/// Outstanding requests survive a restart, so a confirmation arriving after
/// the coordinator came back up still finds its entry.
#[derive(Debug, Clone)]
pub struct PostgresPendingStore {
    pool: Pool,
    table: String,
}

impl PostgresPendingStore {
    /// Open the store, creating its table if needed
    pub async fn open(pool: Pool, config: &DatabaseConfig) -> Result<Self> {
        let store = Self {
            pool,
            table: config.pending_table.clone(),
        };
        store.ensure_schema().await?;

        let released = store.release_all_claims().await?;
        if released > 0 {
            warn!(
                "Released {} pending confirmations claimed before the last shutdown",
                released
            );
        }

        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                event_id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                chunks JSONB NOT NULL,
                submitted_at TIMESTAMPTZ NOT NULL,
                claimed BOOLEAN NOT NULL DEFAULT FALSE
            )",
            self.table
        );
        client.batch_execute(sql.as_str()).await?;
        Ok(())
    }

    /// Claims belong to confirmations handled by a previous process
    async fn release_all_claims(&self) -> Result<u64> {
        let client = self.pool.get().await?;
        let sql = format!("UPDATE {} SET claimed = FALSE WHERE claimed", self.table);
        Ok(client.execute(sql.as_str(), &[]).await?)
    }
}

fn pending_from_row(row: &Row) -> Result<PendingConfirmation> {
    Ok(PendingConfirmation {
        table_name: row.try_get("table_name")?,
        chunks: row.try_get::<_, Json<Vec<ChunkDescriptor>>>("chunks")?.0,
        timestamp: row.try_get("submitted_at")?,
    })
}

#[async_trait]
impl PendingStore for PostgresPendingStore {
    async fn insert(&self, event_id: &str, pending: PendingConfirmation) -> Result<()> {
        let client = self.pool.get().await?;
        let sql = format!(
            "INSERT INTO {} (event_id, table_name, chunks, submitted_at, claimed) \
             VALUES ($1, $2, $3, $4, FALSE)",
            self.table
        );
        client
            .execute(
                sql.as_str(),
                &[
                    &event_id,
                    &pending.table_name,
                    &Json(&pending.chunks),
                    &pending.timestamp,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<PendingConfirmation>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT table_name, chunks, submitted_at FROM {} WHERE event_id = $1",
            self.table
        );
        client
            .query_opt(sql.as_str(), &[&event_id])
            .await?
            .as_ref()
            .map(pending_from_row)
            .transpose()
    }

    async fn claim(&self, event_id: &str) -> Result<Claim> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE {} SET claimed = TRUE WHERE event_id = $1 AND NOT claimed \
             RETURNING table_name, chunks, submitted_at",
            self.table
        );
        if let Some(row) = client.query_opt(sql.as_str(), &[&event_id]).await? {
            return Ok(Claim::Claimed(pending_from_row(&row)?));
        }

        let sql = format!("SELECT 1 FROM {} WHERE event_id = $1", self.table);
        Ok(match client.query_opt(sql.as_str(), &[&event_id]).await? {
            Some(_) => Claim::InFlight,
            None => Claim::Unknown,
        })
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        let client = self.pool.get().await?;
        let sql = format!("UPDATE {} SET claimed = FALSE WHERE event_id = $1", self.table);
        client.execute(sql.as_str(), &[&event_id]).await?;
        Ok(())
    }

    async fn remove(&self, event_id: &str) -> Result<Option<PendingConfirmation>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "DELETE FROM {} WHERE event_id = $1 RETURNING table_name, chunks, submitted_at",
            self.table
        );
        client
            .query_opt(sql.as_str(), &[&event_id])
            .await?
            .as_ref()
            .map(pending_from_row)
            .transpose()
    }

    async fn expire_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, PendingConfirmation)>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "DELETE FROM {} WHERE NOT claimed AND submitted_at < $1 \
             RETURNING event_id, table_name, chunks, submitted_at",
            self.table
        );
        client
            .query(sql.as_str(), &[&cutoff])
            .await?
            .iter()
            .map(|row| -> Result<(String, PendingConfirmation)> {
                Ok((row.try_get("event_id")?, pending_from_row(row)?))
            })
            .collect()
    }

    async fn entries(&self) -> Result<Vec<(String, PendingConfirmation)>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT event_id, table_name, chunks, submitted_at FROM {} ORDER BY submitted_at",
            self.table
        );
        client
            .query(sql.as_str(), &[])
            .await?
            .iter()
            .map(|row| -> Result<(String, PendingConfirmation)> {
                Ok((row.try_get("event_id")?, pending_from_row(row)?))
            })
            .collect()
    }

    async fn len(&self) -> Result<usize> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT count(*) FROM {}", self.table);
        let count: i64 = client.query_one(sql.as_str(), &[]).await?.try_get(0)?;
        Ok(count as usize)
    }
}
