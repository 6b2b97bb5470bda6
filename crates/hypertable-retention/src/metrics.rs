/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Metrics collection for retention cycles and archival confirmations

use crate::{confirmation::ConfirmationOutcome, coordinator::CycleReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retention and archival metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionMetrics {
    pub cycle_stats: CycleStats,
    pub confirmation_stats: ConfirmationStats,
}

/// Identification cycle statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleStats {
    pub total_cycles: u64,
    pub tables_scanned: u64,
    pub table_failures: u64,
    pub requests_published: u64,
    pub chunks_requested: u64,
    pub pending_expired: u64,
    pub average_cycle_duration: f64,
    pub last_cycle_time: Option<DateTime<Utc>>,
}

/// Confirmation handling statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmationStats {
    pub completed: u64,
    pub failed: u64,
    pub unknown: u64,
    pub in_flight: u64,
    pub malformed: u64,
    pub drop_errors: u64,
    /// Handling errors other than drop failures, e.g. bookkeeping store errors
    pub handler_errors: u64,
    /// Times the confirmation subscription ended and was opened again
    pub resubscribes: u64,
    pub chunks_dropped: u64,
    pub last_confirmation_time: Option<DateTime<Utc>>,
}

impl RetentionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished identification cycle
    pub fn record_cycle(&mut self, report: &CycleReport) {
        let stats = &mut self.cycle_stats;
        stats.total_cycles += 1;
        stats.tables_scanned += report.tables_scanned as u64;
        stats.table_failures += report.tables_failed as u64;
        stats.requests_published += report.requests_published as u64;
        stats.chunks_requested += report.chunks_requested as u64;
        stats.pending_expired += report.pending_expired as u64;

        let total_duration = stats.average_cycle_duration * (stats.total_cycles - 1) as f64;
        stats.average_cycle_duration =
            (total_duration + report.duration_seconds) / stats.total_cycles as f64;
        stats.last_cycle_time = Some(report.started_at);

        metrics::counter!("retention_cycles_total").increment(1);
        metrics::counter!("retention_table_failures_total").increment(report.tables_failed as u64);
        metrics::counter!("retention_requests_published_total")
            .increment(report.requests_published as u64);
        metrics::counter!("retention_pending_expired_total")
            .increment(report.pending_expired as u64);
        metrics::histogram!("retention_cycle_duration_seconds").record(report.duration_seconds);
    }

    /// Record the outcome of a handled confirmation
    pub fn record_confirmation(&mut self, outcome: &ConfirmationOutcome) {
        let stats = &mut self.confirmation_stats;
        match outcome {
            ConfirmationOutcome::Dropped { chunks, .. } => {
                stats.completed += 1;
                stats.chunks_dropped += *chunks as u64;
                metrics::counter!("retention_chunks_dropped_total").increment(*chunks as u64);
            }
            ConfirmationOutcome::Retained { .. } => stats.failed += 1,
            ConfirmationOutcome::Unknown { .. } => stats.unknown += 1,
            ConfirmationOutcome::InFlight { .. } => stats.in_flight += 1,
        }
        stats.last_confirmation_time = Some(Utc::now());

        metrics::counter!("retention_confirmations_total", "outcome" => outcome.label())
            .increment(1);
    }

    /// Record a confirmation that could not be decoded
    pub fn record_malformed(&mut self) {
        self.confirmation_stats.malformed += 1;
        metrics::counter!("retention_confirmations_total", "outcome" => "malformed").increment(1);
    }

    /// Record a drop transaction that was rolled back
    pub fn record_drop_error(&mut self) {
        self.confirmation_stats.drop_errors += 1;
        metrics::counter!("retention_drop_errors_total").increment(1);
    }

    pub fn record_resubscribe(&mut self) {
        self.confirmation_stats.resubscribes += 1;
        metrics::counter!("retention_confirmation_resubscribes_total").increment(1);
    }

    /// Record a confirmation that failed before or after the drop itself
    pub fn record_confirmation_error(&mut self, category: &'static str) {
        self.confirmation_stats.handler_errors += 1;
        metrics::counter!("retention_confirmation_errors_total", "category" => category)
            .increment(1);
    }

    pub fn update_pending(&self, pending: usize) {
        metrics::gauge!("retention_pending_confirmations").set(pending as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_cycle_average() {
        let mut metrics = RetentionMetrics::new();
        let mut report = CycleReport::new(Utc::now());
        report.tables_scanned = 2;
        report.requests_published = 1;
        report.duration_seconds = 2.0;
        metrics.record_cycle(&report);

        report.duration_seconds = 4.0;
        metrics.record_cycle(&report);

        assert_eq!(metrics.cycle_stats.total_cycles, 2);
        assert_eq!(metrics.cycle_stats.tables_scanned, 4);
        assert_eq!(metrics.cycle_stats.requests_published, 2);
        assert!((metrics.cycle_stats.average_cycle_duration - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_confirmation() {
        let mut metrics = RetentionMetrics::new();
        metrics.record_confirmation(&ConfirmationOutcome::Dropped {
            event_id: "evt-1".into(),
            table_name: "metrics".into(),
            chunks: 3,
        });
        metrics.record_confirmation(&ConfirmationOutcome::Unknown {
            event_id: "evt-2".into(),
        });
        metrics.record_malformed();

        assert_eq!(metrics.confirmation_stats.completed, 1);
        assert_eq!(metrics.confirmation_stats.chunks_dropped, 3);
        assert_eq!(metrics.confirmation_stats.unknown, 1);
        assert_eq!(metrics.confirmation_stats.malformed, 1);
    }
}
