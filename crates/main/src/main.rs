/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hypertable_retention::{RetentionConfig, RetentionService};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Hypertable retention and archival coordinator
#[derive(Parser)]
#[command(name = "retention-coordinator")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run a single cycle, print its report and exit
    #[arg(long)]
    once: bool,

    /// Validate configuration only
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise the configured level replaces this default once loaded.
    let env_filter = EnvFilter::try_from_default_env().ok();
    let level_from_env = env_filter.is_some();
    let (filter, log_level) =
        reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let config = match &cli.config {
        Some(path) => RetentionConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = RetentionConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            config
        }
    };

    if !level_from_env {
        apply_log_level(&log_level, &config.logging.level)?;
    }

    if cli.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let service = RetentionService::new(config)
        .await
        .context("initializing retention service")?;

    if cli.once {
        let report = service.run_cycle().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    service.start().await?;
    info!("Retention coordinator running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutdown requested");
    service.stop().await?;

    Ok(())
}

/// Replace the active log filter with the configured level
fn apply_log_level(
    handle: &reload::Handle<EnvFilter, Registry>,
    level: &str,
) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level {:?}", level))?;
    handle.reload(filter).context("applying log level")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_configured_level_replaces_default() {
        let (_layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));

        apply_log_level(&handle, "debug").unwrap();
        assert_eq!(
            handle.with_current(|filter| filter.max_level_hint()).unwrap(),
            Some(LevelFilter::DEBUG)
        );

        assert!(apply_log_level(&handle, "retention=loud").is_err());
        assert_eq!(
            handle.with_current(|filter| filter.max_level_hint()).unwrap(),
            Some(LevelFilter::DEBUG)
        );
    }
}
