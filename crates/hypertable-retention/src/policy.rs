/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Per-table retention policies

use crate::{
    catalog::HypertableCatalog,
    error::{RetentionError, Result},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Retention configuration of a single hypertable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub enabled: bool,
    pub retention_period_days: i32,
}

/// A retention policy bound to the table it governs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePolicy {
    pub table_name: String,
    pub policy: RetentionPolicy,
}

impl RetentionPolicy {
    pub fn new(enabled: bool, retention_period_days: i32) -> Self {
        Self {
            enabled,
            retention_period_days,
        }
    }

    /// Chunks ending at or before this instant are outside the window.
    ///
    /// `None` when the window reaches before the earliest representable
    /// instant, in which case no chunk can be outside it.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::try_days(i64::from(self.retention_period_days))
            .and_then(|window| now.checked_sub_signed(window))
    }

    pub fn validate(&self, table_name: &str) -> Result<()> {
        if self.retention_period_days <= 0 {
            return Err(RetentionError::InvalidPolicy {
                table: table_name.to_string(),
                reason: format!(
                    "retention_period_days must be positive, got {}",
                    self.retention_period_days
                ),
            });
        }
        Ok(())
    }
}

impl TablePolicy {
    pub fn new(table_name: impl Into<String>, policy: RetentionPolicy) -> Self {
        Self {
            table_name: table_name.into(),
            policy,
        }
    }
}

/// Reads retention policies from catalog metadata.
///
/// Policies are fetched on every call, nothing is cached between cycles.
#[derive(Debug, Clone)]
pub struct PolicyReader {
    catalog: Arc<dyn HypertableCatalog>,
}

impl PolicyReader {
    pub fn new(catalog: Arc<dyn HypertableCatalog>) -> Self {
        Self { catalog }
    }

    /// Tables with retention enabled and a usable window
    pub async fn enabled_policies(&self) -> Result<Vec<TablePolicy>> {
        let policies = self.catalog.retention_policies().await?;
        let total = policies.len();

        let enabled: Vec<TablePolicy> = policies
            .into_iter()
            .filter(|entry| entry.policy.enabled)
            .filter(|entry| match entry.policy.validate(&entry.table_name) {
                Ok(()) => true,
                Err(err) => {
                    warn!("Skipping table {}: {}", entry.table_name, err);
                    false
                }
            })
            .collect();

        debug!(
            "Read {} retention policies, {} enabled",
            total,
            enabled.len()
        );
        Ok(enabled)
    }
}
