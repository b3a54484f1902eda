/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use vidfed_core::config::FedConfig;
use vidfed_core::runtime;

fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("net", "vidfed", "Vidfed").context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("config.json"))
}

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("VIDFED_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let cfg_path = parse_config_path()?;
    info!("vidfed core service {} starting", vidfed_core::version());
    info!("config: {}", cfg_path.display());
    let text = std::fs::read_to_string(&cfg_path).with_context(|| format!("read {}", cfg_path.display()))?;
    let cfg = FedConfig::from_json(&text)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });
    runtime::run(cfg, shutdown_rx).await
}
