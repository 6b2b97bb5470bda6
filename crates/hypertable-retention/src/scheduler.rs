/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Periodic retention cycles

use crate::{
    config::ScheduleConfig,
    coordinator::{CycleReport, RetentionCoordinator},
    error::Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retention cycle scheduler
#[derive(Debug)]
pub struct RetentionScheduler {
    config: ScheduleConfig,
    coordinator: Arc<RetentionCoordinator>,
    running: Arc<RwLock<bool>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
}

/// Scheduler state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub last_report: Option<CycleReport>,
}

impl RetentionScheduler {
    pub fn new(config: &ScheduleConfig, coordinator: Arc<RetentionCoordinator>) -> Self {
        Self {
            config: config.clone(),
            coordinator,
            running: Arc::new(RwLock::new(false)),
            task: Mutex::new(None),
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the cycle loop.
    ///
    /// Cycles run back to back at most: a cycle that overruns the interval
    /// delays the next tick instead of overlapping with it.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            warn!("Retention scheduler is already running");
            return Ok(());
        }
        if !self.config.enabled {
            info!("Retention scheduler is disabled");
            return Ok(());
        }

        *running = true;
        info!(
            "Starting retention scheduler with a {}s interval",
            self.config.interval_secs
        );

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let coordinator = self.coordinator.clone();
        let last_report = self.last_report.clone();
        let period = self.config.interval();
        let run_on_start = self.config.run_on_start;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !run_on_start {
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                // Not raced against cancellation, stop waits for it.
                match coordinator.run_cycle().await {
                    Ok(report) => {
                        *last_report.write().await = Some(report);
                    }
                    Err(err) => {
                        error!("Retention cycle failed ({}): {}", err.category(), err);
                    }
                }
            }

            debug!("Retention scheduler loop exited");
        });

        *self.task.lock().await = Some((token, handle));
        Ok(())
    }

    /// Stop the loop, waiting for an in-flight cycle to finish
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !*running {
            warn!("Retention scheduler is not running");
            return Ok(());
        }

        *running = false;
        info!("Stopping retention scheduler");

        if let Some((token, handle)) = self.task.lock().await.take() {
            token.cancel();
            if let Err(err) = handle.await {
                error!("Retention scheduler task ended abnormally: {}", err);
            }
        }

        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running().await,
            interval_secs: self.config.interval_secs,
            last_report: self.last_report().await,
        }
    }
}
