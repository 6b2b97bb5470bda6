/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Chunk descriptors and retention eligibility

use crate::{catalog::HypertableCatalog, error::Result, policy::RetentionPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// One physical time partition of a hypertable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Schema-qualified chunk name, unique within its hypertable
    pub chunk_name: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}

impl ChunkDescriptor {
    pub fn new(
        chunk_name: impl Into<String>,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Self {
        Self {
            chunk_name: chunk_name.into(),
            range_start,
            range_end,
        }
    }

    /// The whole range lies at or before `cutoff`
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.range_end <= cutoff
    }
}

/// Finds chunks whose time range falls entirely outside a retention window.
///
/// Read-only: the identifier never mutates or drops anything.
#[derive(Debug, Clone)]
pub struct ChunkIdentifier {
    catalog: Arc<dyn HypertableCatalog>,
}

impl ChunkIdentifier {
    pub fn new(catalog: Arc<dyn HypertableCatalog>) -> Self {
        Self { catalog }
    }

    /// Eligible chunks of `table_name`, ordered by range start
    pub async fn eligible_chunks(
        &self,
        table_name: &str,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChunkDescriptor>> {
        if !policy.enabled {
            return Ok(Vec::new());
        }
        policy.validate(table_name)?;

        let Some(cutoff) = policy.cutoff(now) else {
            debug!(
                "Table {} keeps data for {} days, nothing can be outside its window",
                table_name, policy.retention_period_days
            );
            return Ok(Vec::new());
        };

        let chunks = self.catalog.list_chunks(table_name).await?;
        let eligible = select_expired(chunks, cutoff);

        debug!(
            "Table {} has {} chunks outside its {} day window",
            table_name,
            eligible.len(),
            policy.retention_period_days
        );
        Ok(eligible)
    }
}

/// Keep expired chunks, ordered by range start then name
pub fn select_expired(
    chunks: Vec<ChunkDescriptor>,
    cutoff: DateTime<Utc>,
) -> Vec<ChunkDescriptor> {
    let mut eligible: Vec<ChunkDescriptor> = chunks
        .into_iter()
        .filter(|chunk| chunk.is_expired(cutoff))
        .collect();
    eligible.sort_by(|a, b| {
        a.range_start
            .cmp(&b.range_start)
            .then_with(|| a.chunk_name.cmp(&b.chunk_name))
    });
    eligible
}
