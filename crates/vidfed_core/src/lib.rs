/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod activity;
pub mod ap;
pub mod audience;
pub mod comments;
pub mod config;
pub mod context;
pub mod crawler;
pub mod db;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod fetch;
pub mod http_retry;
pub mod http_sig;
pub mod inbox;
pub mod job_queue;
pub mod jobs;
pub mod keys;
pub mod model;
pub mod net_metrics;
pub mod outbox;
pub mod peer_health;
pub mod redundancy;
pub mod runtime;
pub mod videos;
pub mod webfinger;

#[cfg(test)]
mod testkit;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
