/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::env;
use std::sync::Arc;
use std::time::Duration;
use vidfed_core::directory::actor_fields;
use vidfed_core::fetch::{ApFetcher, HttpFetcher};
use vidfed_core::net_metrics::NetMetrics;
use vidfed_protocol::ActorDocument;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let actor_url = env::args().nth(1).unwrap_or_default();
    if actor_url.trim().is_empty() {
        anyhow::bail!("usage: dev_resolve_actor <actor_url>");
    }

    let fetcher = HttpFetcher::new(Duration::from_secs(7), Arc::new(NetMetrics::new()))?;
    let doc: ActorDocument = serde_json::from_value(fetcher.fetch_object(actor_url.trim()).await?)?;
    let fields = actor_fields(&doc)?;
    println!("type={}", fields.kind.as_str());
    println!("inbox={}", fields.inbox_url);
    if let Some(shared) = fields.shared_inbox_url.as_deref() {
        println!("shared_inbox={shared}");
    }
    if let Some(outbox) = fields.outbox_url.as_deref() {
        println!("outbox={outbox}");
    }
    println!("public_key_pem_len={}", fields.public_key_pem.len());
    Ok(())
}
