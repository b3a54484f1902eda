/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

use crate::net_metrics::NetMetrics;

/// Sends the request built by `build`, retrying transport errors, 429 and 5xx
/// a few times with short jittered backoff. Longer-lived retry belongs to the job queue.
pub async fn send_with_retry<F>(mut build: F, attempts: u32, metrics: &NetMetrics) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let last = attempt >= max_attempts;
        match build().send().await {
            Ok(resp) => {
                if !should_retry_status(resp.status()) {
                    return Ok(resp);
                }
                metrics.http_error();
                if last {
                    return Ok(resp);
                }
            }
            Err(e) => {
                if e.is_timeout() {
                    metrics.http_timeout();
                } else {
                    metrics.http_error();
                }
                if last {
                    return Err(e.into());
                }
            }
        }
        sleep_with_jitter(backoff).await;
        backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}
