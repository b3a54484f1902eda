/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::FedError;
use crate::http_retry::send_with_retry;
use crate::http_sig::signed_post_headers;
use crate::model::Actor;
use crate::net_metrics::NetMetrics;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outbound activity transport. Signs with the signer's current key at send time.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_activity(&self, signer: &Actor, inbox_url: &str, body: &[u8]) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    metrics: Arc<NetMetrics>,
}

impl HttpTransport {
    pub fn new(timeout: Duration, metrics: Arc<NetMetrics>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client, metrics })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_activity(&self, signer: &Actor, inbox_url: &str, body: &[u8]) -> Result<()> {
        let private_key_pem = signer
            .private_key_pem
            .as_deref()
            .ok_or_else(|| FedError::MissingLink(format!("private key of {}", signer.url)))?;
        let headers = signed_post_headers(private_key_pem, &signer.key_id(), inbox_url, body)?;

        let started = Instant::now();
        let resp = send_with_retry(
            || self.client.post(inbox_url).headers(headers.clone()).body(body.to_vec()),
            1,
            &self.metrics,
        )
        .await
        .with_context(|| format!("deliver to {inbox_url}"));
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                self.metrics.delivery(false);
                return Err(e);
            }
        };
        let status = resp.status();
        self.metrics.delivery(status.is_success());
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "delivery to {inbox_url} failed: {status} {}",
                text.chars().take(200).collect::<String>()
            ));
        }
        self.metrics.delivery_rtt_update(started.elapsed().as_millis() as u64);
        Ok(())
    }
}
