/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Storage engine abstraction for hypertable metadata and chunk drops

use crate::{chunk::ChunkDescriptor, error::Result, policy::TablePolicy};
use async_trait::async_trait;

/// Access to the hypertable catalog of the storage engine
#[async_trait]
pub trait HypertableCatalog: Send + Sync + std::fmt::Debug {
    /// Retention configuration of every known table
    async fn retention_policies(&self) -> Result<Vec<TablePolicy>>;

    /// All chunks currently backing `table_name`
    async fn list_chunks(&self, table_name: &str) -> Result<Vec<ChunkDescriptor>>;

    /// Drop `chunks` in the given order inside a single transaction.
    ///
    /// Either every chunk is gone when this returns `Ok`, or the transaction
    /// was rolled back and none of them were dropped. Chunks that no longer
    /// exist are skipped.
    async fn drop_chunks(
        &self,
        event_id: &str,
        table_name: &str,
        chunks: &[ChunkDescriptor],
    ) -> Result<()>;
}
