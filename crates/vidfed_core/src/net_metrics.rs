/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct NetMetrics {
    pub http_timeouts: AtomicU64,
    pub http_errors: AtomicU64,
    pub deliveries_ok: AtomicU64,
    pub deliveries_failed: AtomicU64,
    pub delivery_rtt_ema_ms: AtomicU64,
    pub activities_processed: AtomicU64,
    pub activities_rejected: AtomicU64,
    pub auth_failures: AtomicU64,
    pub jobs_dead: AtomicU64,
}

impl NetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn http_timeout(&self) {
        self.http_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_error(&self) {
        self.http_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery(&self, ok: bool) {
        if ok {
            self.deliveries_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn delivery_rtt_update(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let prev = self.delivery_rtt_ema_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            ms
        } else {
            (prev.saturating_mul(7).saturating_add(ms)) / 8
        };
        self.delivery_rtt_ema_ms.store(next, Ordering::Relaxed);
    }

    pub fn activity(&self, accepted: bool) {
        if accepted {
            self.activities_processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.activities_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_dead(&self) {
        self.jobs_dead.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ts_ms": now_ms(),
            "delivery": {
                "ok": self.deliveries_ok.load(Ordering::Relaxed),
                "failed": self.deliveries_failed.load(Ordering::Relaxed),
                "rtt_ms": self.delivery_rtt_ema_ms.load(Ordering::Relaxed),
            },
            "inbox": {
                "processed": self.activities_processed.load(Ordering::Relaxed),
                "rejected": self.activities_rejected.load(Ordering::Relaxed),
                "auth_failures": self.auth_failures.load(Ordering::Relaxed),
            },
            "errors": {
                "http_timeouts": self.http_timeouts.load(Ordering::Relaxed),
                "http_errors": self.http_errors.load(Ordering::Relaxed),
                "jobs_dead": self.jobs_dead.load(Ordering::Relaxed),
            },
        })
    }
}
