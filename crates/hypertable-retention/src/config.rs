/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Configuration for the retention coordinator
//!
//! Settings are read from a TOML file, then overridden by `RETENTION_*`
//! environment variables, then validated.

use crate::{
    bus::BusConfig,
    error::{RetentionError, Result},
    event::{ARCHIVAL_TOPIC, CONFIRMATION_TOPIC},
    postgres::DatabaseConfig,
};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tracing::{debug, info};

/// Main retention coordinator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub schedule: ScheduleConfig,
    pub archival: ArchivalConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub logging: LoggingConfig,
}

/// Cycle scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Seconds between the start of two cycles
    pub interval_secs: u64,
    /// Run a cycle immediately when the scheduler starts
    pub run_on_start: bool,
}

/// Archival request and confirmation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivalConfig {
    pub request_topic: String,
    pub confirmation_topic: String,
    /// Unconfirmed requests older than this are treated as failed
    pub pending_expiry_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `hypertable_retention=debug`
    pub level: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            run_on_start: true,
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            request_topic: ARCHIVAL_TOPIC.to_string(),
            confirmation_topic: CONFIRMATION_TOPIC.to_string(),
            pending_expiry_secs: Some(24 * 3600),
        }
    }
}

impl ArchivalConfig {
    /// `None` when expiry is disabled or the configured value is out of range
    pub fn pending_expiry(&self) -> Option<chrono::Duration> {
        self.pending_expiry_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RetentionConfig {
    /// Load from `path`, apply environment overrides and validate
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path).await?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from file: {}", path.display());

        if !path.exists() {
            return Err(RetentionError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| RetentionError::Config(format!("TOML parse error: {}", e)))
    }

    /// Override settings from `RETENTION_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("RETENTION_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(max) = var("RETENTION_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_var("RETENTION_DATABASE_MAX_CONNECTIONS", &max)?;
        }
        if let Some(table) = var("RETENTION_POLICY_TABLE") {
            self.database.policy_table = table;
        }
        if let Some(durable) = var("RETENTION_DURABLE_PENDING") {
            self.database.durable_pending = parse_var("RETENTION_DURABLE_PENDING", &durable)?;
        }
        if let Some(url) = var("RETENTION_BUS_URL") {
            self.bus.url = url;
        }
        if let Some(topic) = var("RETENTION_REQUEST_TOPIC") {
            self.archival.request_topic = topic;
        }
        if let Some(topic) = var("RETENTION_CONFIRMATION_TOPIC") {
            self.archival.confirmation_topic = topic;
        }
        if let Some(secs) = var("RETENTION_PENDING_EXPIRY_SECS") {
            self.archival.pending_expiry_secs = match secs.as_str() {
                "" | "0" | "none" => None,
                _ => Some(parse_var("RETENTION_PENDING_EXPIRY_SECS", &secs)?),
            };
        }
        if let Some(secs) = var("RETENTION_INTERVAL_SECS") {
            self.schedule.interval_secs = parse_var("RETENTION_INTERVAL_SECS", &secs)?;
        }
        if let Some(level) = var("RETENTION_LOG_LEVEL") {
            self.logging.level = level;
        }

        debug!("Applied environment overrides");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.schedule.interval_secs == 0 {
            return Err(RetentionError::Config(
                "schedule.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(RetentionError::Config(
                "database.max_connections must be greater than zero".to_string(),
            ));
        }
        for (key, value) in [
            ("database.policy_table", &self.database.policy_table),
            ("database.pending_table", &self.database.pending_table),
        ] {
            if !is_identifier(value) {
                return Err(RetentionError::Config(format!(
                    "{} is not a valid table name: {:?}",
                    key, value
                )));
            }
        }
        for (key, value) in [
            ("archival.request_topic", &self.archival.request_topic),
            ("archival.confirmation_topic", &self.archival.confirmation_topic),
        ] {
            if value.trim().is_empty() {
                return Err(RetentionError::Config(format!("{} must not be empty", key)));
            }
        }
        if let Some(secs) = self.archival.pending_expiry_secs {
            if secs == 0 || self.archival.pending_expiry().is_none() {
                return Err(RetentionError::Config(format!(
                    "archival.pending_expiry_secs out of range: {}",
                    secs
                )));
            }
        }
        if self.archival.request_topic == self.archival.confirmation_topic {
            return Err(RetentionError::Config(
                "request and confirmation topics must differ".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| RetentionError::Config(format!("Invalid {}: {}", key, e)))
}

/// `name` or `schema.name`, made of ASCII alphanumerics and underscores.
/// These names are interpolated into SQL.
fn is_identifier(value: &str) -> bool {
    let mut parts = 0;
    for part in value.split('.') {
        parts += 1;
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
    }
    parts <= 2
}
