/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::activity::follow_url;
use crate::context::FedContext;
use crate::directory::ResolveOptions;
use crate::error::classify;
use crate::job_queue::{JobHandler, JobOutcome};
use crate::model::{Actor, FollowState};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tracing::{debug, info, warn};
use vidfed_protocol::{BroadcastPayload, FetchPayload, FollowPayload, JobPayload, UnicastPayload};

/// Recipients of one broadcast in flight at once.
pub const BROADCAST_CONCURRENCY: usize = 30;

/// Executes queued jobs against a federation context.
#[derive(Clone)]
pub struct FedJobHandler {
    ctx: FedContext,
}

impl FedJobHandler {
    pub fn new(ctx: FedContext) -> Self {
        Self { ctx }
    }

    fn signer(&self, actor_id: i64) -> Result<Option<Actor>> {
        self.ctx.db.load_actor(actor_id)
    }

    async fn broadcast(&self, job: BroadcastPayload) -> JobOutcome {
        let signer = match self.signer(job.signature_actor_id) {
            Ok(Some(a)) => a,
            Ok(None) => return JobOutcome::Fatal(format!("signer {} no longer exists", job.signature_actor_id)),
            Err(e) => return JobOutcome::retry(format!("{e:#}")),
        };
        let body = match serde_json::to_vec(&job.body) {
            Ok(b) => b,
            Err(e) => return JobOutcome::Fatal(format!("encode body: {e}")),
        };
        let transport = self.ctx.transport.clone();
        let results: Vec<(String, bool)> = stream::iter(job.uris)
            .map(|inbox| {
                let transport = transport.clone();
                let signer = &signer;
                let body = &body;
                async move {
                    match transport.post_activity(signer, &inbox, body).await {
                        Ok(()) => (inbox, true),
                        Err(e) => {
                            debug!("broadcast to {inbox} failed: {e:#}");
                            (inbox, false)
                        }
                    }
                }
            })
            .buffer_unordered(BROADCAST_CONCURRENCY)
            .collect()
            .await;

        let (good, bad): (Vec<_>, Vec<_>) = results.into_iter().partition(|(_, ok)| *ok);
        let good: Vec<String> = good.into_iter().map(|(i, _)| i).collect();
        let bad: Vec<String> = bad.into_iter().map(|(i, _)| i).collect();
        if !bad.is_empty() {
            warn!(ok = good.len(), failed = bad.len(), "broadcast by {} partially failed", signer.url);
        }
        if let Err(e) = self.ctx.scorer.report_batch(&good, &bad).await {
            warn!("peer score update failed: {e:#}");
        }
        JobOutcome::Success
    }

    async fn unicast(&self, job: UnicastPayload) -> JobOutcome {
        let signer = match self.signer(job.signature_actor_id) {
            Ok(Some(a)) => a,
            Ok(None) => return JobOutcome::Fatal(format!("signer {} no longer exists", job.signature_actor_id)),
            Err(e) => return JobOutcome::retry(format!("{e:#}")),
        };
        let body = match serde_json::to_vec(&job.body) {
            Ok(b) => b,
            Err(e) => return JobOutcome::Fatal(format!("encode body: {e}")),
        };
        let res = self.ctx.transport.post_activity(&signer, &job.uri, &body).await;
        if let Err(e) = self.ctx.scorer.report_delivery_outcome(&job.uri, res.is_ok()).await {
            warn!("peer score update failed: {e:#}");
        }
        match res {
            Ok(()) => JobOutcome::Success,
            Err(e) => JobOutcome::retry(format!("{e:#}")),
        }
    }

    async fn fetch(&self, job: FetchPayload) -> JobOutcome {
        match self.ctx.crawler().run_fetch_job(&job).await {
            Ok(pages) => {
                debug!(pages, "crawled {}", job.uri);
                JobOutcome::Success
            }
            Err(e) => outcome_of(e),
        }
    }

    async fn follow(&self, job: FollowPayload) -> JobOutcome {
        let follower = match self.signer(job.follower_actor_id) {
            Ok(Some(a)) => a,
            Ok(None) => return JobOutcome::Fatal(format!("follower {} no longer exists", job.follower_actor_id)),
            Err(e) => return JobOutcome::retry(format!("{e:#}")),
        };
        match self.send_follow(&follower, &job).await {
            Ok(()) => JobOutcome::Success,
            Err(e) => outcome_of(e),
        }
    }

    async fn send_follow(&self, follower: &Actor, job: &FollowPayload) -> Result<()> {
        let target = self
            .ctx
            .directory()
            .resolve_by_handle(&job.name, &job.host, ResolveOptions::synced(self.ctx.cfg.sync_collections()))
            .await?;
        if target.id == follower.id {
            info!("{} can not follow itself", follower.url);
            return Ok(());
        }
        let url = follow_url(follower, &target);
        let (edge, _) = self
            .ctx
            .db
            .find_or_create_follow(follower.id, target.id, FollowState::Pending, Some(&url))?;
        if edge.state == FollowState::Accepted {
            debug!("{} already follows {}", follower.url, target.url);
            return Ok(());
        }
        self.ctx.outbox().send_follow(&edge, follower, &target).await?;
        info!("follow request {} -> {}", follower.url, target.url);
        Ok(())
    }
}

/// Protocol and validation errors never heal on retry.
fn outcome_of(e: anyhow::Error) -> JobOutcome {
    match classify(&e) {
        Some(_) => JobOutcome::Fatal(format!("{e:#}")),
        None => JobOutcome::retry(format!("{e:#}")),
    }
}

#[async_trait]
impl JobHandler for FedJobHandler {
    async fn run(&self, payload: JobPayload) -> JobOutcome {
        match payload {
            JobPayload::Broadcast(job) => self.broadcast(job).await,
            JobPayload::Unicast(job) => self.unicast(job).await,
            JobPayload::Fetch(job) => self.fetch(job).await,
            JobPayload::Follow(job) => self.follow(job).await,
        }
    }
}
