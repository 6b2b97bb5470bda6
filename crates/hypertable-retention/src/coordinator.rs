/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Identify, publish and confirm: the retention cycle

use crate::{
    bus::MessageBus,
    catalog::HypertableCatalog,
    chunk::ChunkIdentifier,
    config::ArchivalConfig,
    confirmation::{ConfirmationHandler, ConfirmationOutcome},
    error::{Result, RetentionError},
    event::ArchivalConfirmation,
    metrics::RetentionMetrics,
    pending::PendingStore,
    policy::{PolicyReader, TablePolicy},
    publisher::ArchivalPublisher,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Summary of one identification cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub tables_scanned: usize,
    pub tables_failed: usize,
    pub requests_published: usize,
    pub chunks_requested: usize,
    pub pending_expired: usize,
    /// Event ids published during the cycle
    pub event_ids: Vec<String>,
    pub duration_seconds: f64,
}

impl CycleReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            tables_scanned: 0,
            tables_failed: 0,
            requests_published: 0,
            chunks_requested: 0,
            pending_expired: 0,
            event_ids: Vec::new(),
            duration_seconds: 0.0,
        }
    }
}

/// Owns the collaborators of the retention workflow.
///
/// The scheduler drives [`run_cycle`](Self::run_cycle) and the confirmation
/// listener drives [`handle_payload`](Self::handle_payload); both may run at
/// the same time.
#[derive(Debug)]
pub struct RetentionCoordinator {
    policies: PolicyReader,
    identifier: ChunkIdentifier,
    publisher: ArchivalPublisher,
    handler: ConfirmationHandler,
    pending: Arc<dyn PendingStore>,
    pending_expiry: Option<Duration>,
    metrics: Arc<RwLock<RetentionMetrics>>,
}

impl RetentionCoordinator {
    pub fn new(
        catalog: Arc<dyn HypertableCatalog>,
        bus: Arc<dyn MessageBus>,
        pending: Arc<dyn PendingStore>,
        config: &ArchivalConfig,
    ) -> Self {
        Self {
            policies: PolicyReader::new(catalog.clone()),
            identifier: ChunkIdentifier::new(catalog.clone()),
            publisher: ArchivalPublisher::new(bus, pending.clone(), config.request_topic.clone()),
            handler: ConfirmationHandler::new(catalog, pending.clone()),
            pending,
            pending_expiry: config.pending_expiry(),
            metrics: Arc::new(RwLock::new(RetentionMetrics::new())),
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as of `now`.
    ///
    /// Fails only if the retention policies cannot be read. Failures of a
    /// single table are logged and counted; the remaining tables still run.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let started = std::time::Instant::now();
        let mut report = CycleReport::new(now);

        // No cutoff means no entry can be old enough to expire.
        if let Some(cutoff) = self
            .pending_expiry
            .and_then(|expiry| now.checked_sub_signed(expiry))
        {
            match self.expire_pending(cutoff).await {
                Ok(expired) => report.pending_expired = expired,
                Err(err) => error!("Pending confirmation expiry sweep failed: {}", err),
            }
        }

        let policies = self.policies.enabled_policies().await?;
        debug!("Running retention cycle over {} tables", policies.len());

        for table in &policies {
            report.tables_scanned += 1;
            match self.process_table(table, now).await {
                Ok(Some((event_id, chunks))) => {
                    report.requests_published += 1;
                    report.chunks_requested += chunks;
                    report.event_ids.push(event_id);
                }
                Ok(None) => {}
                Err(err) => {
                    report.tables_failed += 1;
                    if err.is_retryable() {
                        warn!(
                            "Retention cycle for {} failed ({}), retrying next cycle: {}",
                            table.table_name,
                            err.category(),
                            err
                        );
                    } else {
                        error!(
                            "Retention cycle for {} failed ({}): {}",
                            table.table_name,
                            err.category(),
                            err
                        );
                    }
                }
            }
        }

        report.duration_seconds = started.elapsed().as_secs_f64();
        {
            let mut metrics = self.metrics.write().await;
            metrics.record_cycle(&report);
            if let Ok(pending) = self.pending.len().await {
                metrics.update_pending(pending);
            }
        }

        info!(
            "Retention cycle finished in {:.2}s: {} tables, {} requests, {} failures",
            report.duration_seconds,
            report.tables_scanned,
            report.requests_published,
            report.tables_failed
        );
        Ok(report)
    }

    /// Identify and publish for one table; returns the published event id
    async fn process_table(
        &self,
        table: &TablePolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, usize)>> {
        let eligible = self
            .identifier
            .eligible_chunks(&table.table_name, &table.policy, now)
            .await?;
        if eligible.is_empty() {
            return Ok(None);
        }

        let outstanding = self.pending.pending_chunk_names(&table.table_name).await?;
        let (awaiting, chunks): (Vec<_>, Vec<_>) = eligible
            .into_iter()
            .partition(|chunk| outstanding.contains(&chunk.chunk_name));
        if !awaiting.is_empty() {
            debug!(
                "{} chunks of {} are already awaiting confirmation",
                awaiting.len(),
                table.table_name
            );
        }
        if chunks.is_empty() {
            return Ok(None);
        }

        let request = self.publisher.publish(&table.table_name, chunks).await?;
        Ok(Some((request.event_id, request.chunks.len())))
    }

    /// Treat unconfirmed requests submitted before `cutoff` as failed
    pub async fn expire_pending(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let expired = self.pending.expire_before(cutoff).await?;
        for (event_id, pending) in &expired {
            warn!(
                "Archival request {} for {} ({} chunks) was not confirmed since {}, keeping data",
                event_id,
                pending.table_name,
                pending.chunks.len(),
                pending.timestamp
            );
        }
        Ok(expired.len())
    }

    pub async fn handle_confirmation(
        &self,
        confirmation: &ArchivalConfirmation,
    ) -> Result<ConfirmationOutcome> {
        match self.handler.handle(confirmation).await {
            Ok(outcome) => {
                self.metrics.write().await.record_confirmation(&outcome);
                Ok(outcome)
            }
            Err(err) => {
                let mut metrics = self.metrics.write().await;
                match &err {
                    RetentionError::DropFailed { .. } => metrics.record_drop_error(),
                    _ => metrics.record_confirmation_error(err.category()),
                }
                drop(metrics);
                Err(err)
            }
        }
    }

    /// Decode and handle a raw confirmation message.
    ///
    /// Never fails: malformed messages and handling errors are logged.
    pub async fn handle_payload(&self, payload: &[u8]) -> Option<ConfirmationOutcome> {
        let confirmation = match ArchivalConfirmation::from_json(payload) {
            Ok(confirmation) => confirmation,
            Err(err) => {
                warn!("Discarding malformed archival confirmation: {}", err);
                self.metrics.write().await.record_malformed();
                return None;
            }
        };

        match self.handle_confirmation(&confirmation).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(
                    "Handling confirmation {} failed ({}): {}",
                    confirmation.event_id,
                    err.category(),
                    err
                );
                None
            }
        }
    }

    pub fn pending_store(&self) -> Arc<dyn PendingStore> {
        self.pending.clone()
    }

    pub async fn record_resubscribe(&self) {
        self.metrics.write().await.record_resubscribe();
    }

    pub async fn metrics(&self) -> RetentionMetrics {
        self.metrics.read().await.clone()
    }
}
