/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::model::{host_of, RedundancyStrategy};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SERVER_ACTOR_NAME: &str = "vidfed";
const TWO_DAYS_SECS: u64 = 2 * 24 * 3600;

#[derive(Clone, Debug, Deserialize)]
pub struct FedConfig {
    #[serde(alias = "base_url")]
    pub public_base_url: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub server_actor_name: Option<String>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_date_skew_secs: Option<u64>,
    #[serde(default)]
    pub actor_refresh_interval_secs: Option<u64>,
    #[serde(default)]
    pub video_refresh_interval_secs: Option<u64>,
    #[serde(default)]
    pub inbox_workers: Option<usize>,
    /// Crawl outboxes and video collections of newly known actors and videos.
    #[serde(default)]
    pub sync_collections: Option<bool>,
    #[serde(default)]
    pub follow_score_interval_secs: Option<u64>,
    /// WebFinger over plain http, for local test networks.
    #[serde(default)]
    pub plain_http_webfinger: Option<bool>,
    #[serde(default)]
    pub redundancy: RedundancyConfig,
    #[serde(default)]
    pub jobs: JobOverrides,
}

fn default_bind() -> String {
    "127.0.0.1:9000".to_string()
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RedundancyConfig {
    #[serde(default)]
    pub check_interval_secs: Option<u64>,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StrategyConfig {
    pub strategy: RedundancyStrategy,
    pub size_bytes: u64,
    pub min_lifetime_secs: u64,
    /// Only videos published within this window are eligible; none means no limit.
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub min_views: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct JobOverrides {
    #[serde(default)]
    pub broadcast: Option<JobOverride>,
    #[serde(default)]
    pub unicast: Option<JobOverride>,
    #[serde(default)]
    pub fetch: Option<JobOverride>,
    #[serde(default)]
    pub follow: Option<JobOverride>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct JobOverride {
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl FedConfig {
    pub fn for_base_url(public_base_url: &str) -> Self {
        Self {
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            bind: default_bind(),
            data_dir: None,
            server_actor_name: None,
            http_timeout_secs: None,
            max_date_skew_secs: None,
            actor_refresh_interval_secs: None,
            video_refresh_interval_secs: None,
            inbox_workers: None,
            sync_collections: None,
            follow_score_interval_secs: None,
            plain_http_webfinger: None,
            redundancy: RedundancyConfig::default(),
            jobs: JobOverrides::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let mut cfg: FedConfig = serde_json::from_str(text).context("decode FedConfig")?;
        cfg.public_base_url = cfg.public_base_url.trim_end_matches('/').to_string();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if host_of(&self.public_base_url).is_none() {
            return Err(anyhow!("public_base_url is not an absolute url: {}", self.public_base_url));
        }
        for s in &self.redundancy.strategies {
            if matches!(s.strategy, RedundancyStrategy::Manual) {
                return Err(anyhow!("manual redundancy is not a schedulable strategy"));
            }
        }
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        &self.public_base_url
    }

    pub fn local_host(&self) -> String {
        host_of(&self.public_base_url).unwrap_or_default()
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => crate::keys::default_data_dir(),
        }
    }

    pub fn server_actor_name(&self) -> &str {
        self.server_actor_name.as_deref().unwrap_or(DEFAULT_SERVER_ACTOR_NAME)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(7))
    }

    pub fn max_date_skew(&self) -> Duration {
        Duration::from_secs(self.max_date_skew_secs.unwrap_or(12 * 3600))
    }

    pub fn actor_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.actor_refresh_interval_secs.unwrap_or(TWO_DAYS_SECS))
    }

    pub fn video_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.video_refresh_interval_secs.unwrap_or(TWO_DAYS_SECS))
    }

    pub fn inbox_workers(&self) -> usize {
        self.inbox_workers.unwrap_or(4).max(1)
    }

    pub fn sync_collections(&self) -> bool {
        self.sync_collections.unwrap_or(true)
    }

    pub fn follow_score_interval(&self) -> Duration {
        Duration::from_secs(self.follow_score_interval_secs.unwrap_or(3600).max(60))
    }

    pub fn redundancy_interval(&self) -> Duration {
        Duration::from_secs(self.redundancy.check_interval_secs.unwrap_or(3600).max(10))
    }

    pub fn strategy(&self, strategy: RedundancyStrategy) -> Option<&StrategyConfig> {
        self.redundancy.strategies.iter().find(|s| s.strategy == strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = FedConfig::from_json(r#"{"public_base_url": "https://videos.example/"}"#).unwrap();
        assert_eq!(cfg.base_url(), "https://videos.example");
        assert_eq!(cfg.local_host(), "videos.example");
        assert_eq!(cfg.server_actor_name(), DEFAULT_SERVER_ACTOR_NAME);
        assert_eq!(cfg.actor_refresh_interval(), Duration::from_secs(TWO_DAYS_SECS));
        assert!(cfg.sync_collections());
    }

    #[test]
    fn parses_strategies() {
        let cfg = FedConfig::from_json(
            r#"{
              "public_base_url": "https://videos.example",
              "redundancy": {
                "check_interval_secs": 60,
                "strategies": [
                  {"strategy": "most-views", "size_bytes": 1000, "min_lifetime_secs": 3600},
                  {"strategy": "recently-added", "size_bytes": 50, "min_lifetime_secs": 60, "min_views": 10}
                ]
              },
              "jobs": {"unicast": {"attempts": 3}}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.redundancy.strategies.len(), 2);
        assert_eq!(cfg.strategy(RedundancyStrategy::RecentlyAdded).unwrap().min_views, Some(10));
        assert_eq!(cfg.jobs.unicast.unwrap().attempts, Some(3));
    }

    #[test]
    fn rejects_manual_strategy_and_relative_url() {
        assert!(FedConfig::from_json(
            r#"{"public_base_url": "https://v.example", "redundancy": {"strategies": [{"strategy": "manual", "size_bytes": 1, "min_lifetime_secs": 1}]}}"#
        )
        .is_err());
        assert!(FedConfig::from_json(r#"{"public_base_url": "videos"}"#).is_err());
    }
}
