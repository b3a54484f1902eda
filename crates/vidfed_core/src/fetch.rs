/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::FedError;
use crate::http_retry::send_with_retry;
use crate::net_metrics::NetMetrics;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use vidfed_protocol::AP_ACCEPT;

#[derive(Debug, Clone)]
pub enum Fetched {
    Found(Value),
    /// 404 or 410.
    Gone,
}

/// Dereferences ActivityPub documents by URL.
#[async_trait]
pub trait ApFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Fetched>;

    /// Like `fetch`, but a gone object is an error.
    async fn fetch_object(&self, url: &str) -> Result<Value> {
        match self.fetch(url).await? {
            Fetched::Found(v) => Ok(v),
            Fetched::Gone => Err(FedError::Gone(url.to_string()).into()),
        }
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    metrics: Arc<NetMetrics>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, metrics: Arc<NetMetrics>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client, metrics })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl ApFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        let resp = send_with_retry(
            || {
                self.client
                    .get(url)
                    .header(ACCEPT, AP_ACCEPT)
                    .header(USER_AGENT, format!("vidfed/{}", env!("CARGO_PKG_VERSION")))
            },
            2,
            &self.metrics,
        )
        .await
        .with_context(|| format!("fetch {url}"))?;

        let status = resp.status();
        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Ok(Fetched::Gone);
        }
        if !status.is_success() {
            return Err(anyhow!("fetch {url}: status {status}"));
        }
        let body = resp
            .json::<Value>()
            .await
            .with_context(|| format!("parse json from {url}"))?;
        Ok(Fetched::Found(body))
    }
}
