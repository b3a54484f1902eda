/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::ap::{self, ApState};
use crate::config::FedConfig;
use crate::context::{ensure_server_actor, Capabilities, FedContext, ServerActor};
use crate::db::FedDb;
use crate::delivery::HttpTransport;
use crate::fetch::HttpFetcher;
use crate::inbox::InboxQueue;
use crate::job_queue::JobQueue;
use crate::jobs::FedJobHandler;
use crate::net_metrics::NetMetrics;
use crate::peer_health::{start_bad_follow_pruner, FollowScoreBook};
use crate::redundancy::{start_redundancy_scheduler, HttpDownloader, RedundancyScheduler};
use crate::videos::DbViewCounter;
use crate::webfinger::HttpWebFinger;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Batches waiting for an inbox worker before the HTTP layer answers 503.
pub const INBOX_QUEUE_MAX: usize = 4096;

/// Opens storage, wires the capabilities and runs every worker plus the HTTP
/// server until `shutdown` flips to true.
pub async fn run(cfg: FedConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    cfg.validate()?;
    let data_dir = cfg.data_dir()?;
    std::fs::create_dir_all(&data_dir).with_context(|| format!("create {}", data_dir.display()))?;
    info!("data dir: {}", data_dir.display());

    let metrics = Arc::new(NetMetrics::new());
    let db = Arc::new(FedDb::open(data_dir.join("vidfed.db"))?);
    let queue = JobQueue::open(data_dir.join("jobs.db"), metrics.clone())?;
    let server = ensure_server_actor(&cfg, &db)?;

    let fetcher = Arc::new(HttpFetcher::new(cfg.http_timeout(), metrics.clone())?);
    let webfinger = Arc::new(HttpWebFinger::new(
        fetcher.client().clone(),
        cfg.plain_http_webfinger.unwrap_or(false),
    ));
    let score_book = Arc::new(FollowScoreBook::new(db.clone()));
    let caps = Capabilities {
        fetcher,
        webfinger,
        transport: Arc::new(HttpTransport::new(cfg.http_timeout(), metrics.clone())?),
        downloader: Arc::new(HttpDownloader::new(cfg.http_timeout(), metrics.clone())?),
        views: Arc::new(DbViewCounter::new(db.clone())),
        scorer: score_book.clone(),
    };
    let bind = cfg.bind.clone();
    let ctx = FedContext::new(Arc::new(cfg), db, ServerActor::new(server), caps, queue, metrics);
    info!("server actor {}", ctx.server_actor.url);

    ctx.queue.start_workers(
        shutdown.clone(),
        Arc::new(FedJobHandler::new(ctx.clone())),
        &ctx.cfg.jobs,
    );
    let inbox = InboxQueue::start(ctx.clone(), ctx.cfg.inbox_workers(), INBOX_QUEUE_MAX, shutdown.clone());
    start_redundancy_scheduler(
        Arc::new(RedundancyScheduler::new(ctx.clone())),
        ctx.cfg.redundancy_interval(),
        shutdown.clone(),
    );
    start_bad_follow_pruner(score_book, ctx.cfg.follow_score_interval(), shutdown.clone());

    let router = ap::router(Arc::new(ApState { ctx, inbox }));
    let addr: SocketAddr = bind.parse().context("parse bind")?;
    let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
    info!("federation endpoint http://{addr}");

    let mut server_shutdown = shutdown;
    let graceful = async move {
        while !*server_shutdown.borrow() {
            if server_shutdown.changed().await.is_err() {
                break;
            }
        }
    };
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(graceful)
        .await
        .context("http server")?;
    info!("federation endpoint stopped");
    Ok(())
}
