/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::StrategyConfig;
use crate::context::FedContext;
use crate::db::NewRedundancy;
use crate::error::FedError;
use crate::model::{now_ms, RedundancyStrategy, Video, VideoFile, VideoRedundancy};
use crate::net_metrics::NetMetrics;
use crate::videos::VideoState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Candidates considered per strategy tick; one is picked at random.
pub const CANDIDATE_POOL: u32 = 5;

/// Copies a remote video file to local storage.
#[async_trait]
pub trait FileDownloader: Send + Sync {
    /// Returns the number of bytes written to `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

pub struct HttpDownloader {
    client: reqwest::Client,
    metrics: Arc<NetMetrics>,
}

impl HttpDownloader {
    /// `connect_timeout` only; whole-file transfers may take long.
    pub fn new(connect_timeout: Duration, metrics: Arc<NetMetrics>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client, metrics })
    }
}

#[async_trait]
impl FileDownloader for HttpDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                self.metrics.http_timeout();
            } else {
                self.metrics.http_error();
            }
            anyhow::Error::new(e).context(format!("GET {url}"))
        })?;
        let status = resp.status();
        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Err(FedError::Gone(url.to_string()).into());
        }
        if !status.is_success() {
            self.metrics.http_error();
            anyhow::bail!("GET {url} failed: {status}");
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("create {}", partial.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.with_context(|| format!("read {url}"))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, dest)
            .await
            .with_context(|| format!("move {} into place", dest.display()))?;
        Ok(written)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Another tick was still running.
    pub skipped: bool,
    pub mirrored: usize,
    pub evicted: usize,
    pub extended: usize,
    pub retracted: usize,
    pub purged: usize,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Mirrors popular remote videos within per-strategy budgets and keeps the
/// mirror set fresh.
pub struct RedundancyScheduler {
    ctx: FedContext,
    running: AtomicBool,
}

impl RedundancyScheduler {
    pub fn new(ctx: FedContext) -> Self {
        Self {
            ctx,
            running: AtomicBool::new(false),
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("redundancy tick already running");
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        }
        let _guard = TickGuard(&self.running);
        let mut report = TickReport::default();

        for cfg in self.ctx.cfg.redundancy.strategies.clone() {
            if cfg.strategy == RedundancyStrategy::Manual {
                continue;
            }
            match self.mirror_candidate(&cfg, &mut report).await {
                Ok(Some(video)) => info!("mirrored {} for {}", video, cfg.strategy.as_str()),
                Ok(None) => {}
                Err(e) => warn!("{} redundancy failed: {e:#}", cfg.strategy.as_str()),
            }
        }
        self.extend_expired(&mut report).await?;
        self.purge_remote_expired(&mut report)?;
        Ok(report)
    }

    async fn mirror_candidate(&self, cfg: &StrategyConfig, report: &mut TickReport) -> Result<Option<String>> {
        let db = &self.ctx.db;
        let server_id = self.ctx.server_actor.id;
        let published_after = cfg
            .window_secs
            .map(|w| now_ms().saturating_sub((w as i64).saturating_mul(1000)))
            .unwrap_or(0);
        let candidates = db.list_redundancy_candidates(
            cfg.strategy,
            server_id,
            published_after,
            cfg.min_views.unwrap_or(0),
            CANDIDATE_POOL,
        )?;
        let Some(video) = candidates.choose(&mut rand::thread_rng()).cloned() else {
            debug!("no {} candidate", cfg.strategy.as_str());
            return Ok(None);
        };
        let video = match self.ctx.videos().refresh(video, false).await? {
            VideoState::Present(v) => v,
            VideoState::Gone => return Ok(None),
        };
        let files = db.list_video_files(video.id)?;
        let needed: i64 = files.iter().map(|f| f.size).sum();
        if !self.make_room(cfg, needed, report).await? {
            info!(
                needed,
                budget = cfg.size_bytes,
                "{} budget exhausted, skipping {}",
                cfg.strategy.as_str(),
                video.url
            );
            return Ok(None);
        }
        let expires = now_ms().saturating_add((cfg.min_lifetime_secs as i64).saturating_mul(1000));
        let mirrors = self.mirror_video(&video, &files, cfg.strategy, Some(expires)).await?;
        report.mirrored += mirrors.len();
        Ok(Some(video.url))
    }

    /// Evicts expired mirrors of the strategy, oldest first, until `needed` more
    /// bytes fit. False when they never will.
    async fn make_room(&self, cfg: &StrategyConfig, needed: i64, report: &mut TickReport) -> Result<bool> {
        let db = &self.ctx.db;
        let server_id = self.ctx.server_actor.id;
        let budget = cfg.size_bytes as i64;
        if needed > budget {
            return Ok(false);
        }
        loop {
            let used = db.redundancy_total_used(server_id, cfg.strategy)?;
            if used + needed <= budget {
                return Ok(true);
            }
            let Some(oldest) = db.oldest_expired_local_redundancy(server_id, cfg.strategy, now_ms())? else {
                return Ok(false);
            };
            self.destroy(&oldest).await?;
            report.evicted += 1;
        }
    }

    /// Downloads every file of `video` before recording any mirror.
    async fn mirror_video(
        &self,
        video: &Video,
        files: &[VideoFile],
        strategy: RedundancyStrategy,
        expires_on_ms: Option<i64>,
    ) -> Result<Vec<VideoRedundancy>> {
        let dir = self.storage_dir()?;
        let mut stored: Vec<(&VideoFile, PathBuf)> = Vec::with_capacity(files.len());
        for file in files {
            let name = file_name(video, file);
            let dest = dir.join(&name);
            match self.ctx.downloader.download(&file.file_url, &dest).await {
                Ok(bytes) => {
                    debug!(bytes, "downloaded {}", file.file_url);
                    stored.push((file, dest));
                }
                Err(e) => {
                    for (_, path) in &stored {
                        remove_quietly(path).await;
                    }
                    return Err(e.context(format!("download {}", file.file_url)));
                }
            }
        }

        let base = self.ctx.cfg.base_url();
        let mut out = Vec::with_capacity(stored.len());
        for (file, _) in stored {
            let (redundancy, _) = self.ctx.db.upsert_redundancy(&NewRedundancy {
                actor_id: self.ctx.server_actor.id,
                video_file_id: file.id,
                strategy: Some(strategy),
                expires_on_ms,
                file_url: format!("{base}/static/redundancy/{}", file_name(video, file)),
                url: format!("{base}/redundancy/videos/{}/{}", video.uuid, file.resolution),
            })?;
            if let Err(e) = self.ctx.outbox().send_create_cache_file(&redundancy, video).await {
                warn!("cannot announce mirror {}: {e:#}", redundancy.url);
            }
            out.push(redundancy);
        }
        Ok(out)
    }

    async fn extend_expired(&self, report: &mut TickReport) -> Result<()> {
        let db = &self.ctx.db;
        let server_id = self.ctx.server_actor.id;
        for redundancy in db.list_expired_redundancies(server_id, true, now_ms())? {
            match self.extend_one(&redundancy).await {
                Ok(true) => report.extended += 1,
                Ok(false) => report.retracted += 1,
                Err(e) => warn!("cannot extend mirror {}: {e:#}", redundancy.url),
            }
        }
        Ok(())
    }

    /// True when extended, false when the mirror was retracted.
    async fn extend_one(&self, redundancy: &VideoRedundancy) -> Result<bool> {
        let db = &self.ctx.db;
        let Some(video) = db.load_video(redundancy.video_id)? else {
            self.destroy(redundancy).await?;
            return Ok(false);
        };
        let origin_inbox = db
            .load_actor(video.channel_actor_id)?
            .map(|a| a.delivery_inbox().to_string());
        let video_url = video.url.clone();
        let video = match self.ctx.videos().refresh(video, true).await? {
            VideoState::Present(v) => v,
            VideoState::Gone => {
                info!("source of mirror {} is gone", redundancy.url);
                self.retract(redundancy, &video_url, origin_inbox.as_deref()).await?;
                return Ok(false);
            }
        };

        let cfg = redundancy.strategy.and_then(|s| self.ctx.cfg.strategy(s));
        let Some(cfg) = cfg else {
            info!("strategy of mirror {} is disabled", redundancy.url);
            self.retract(redundancy, &video.url, origin_inbox.as_deref()).await?;
            return Ok(false);
        };
        let used = db.redundancy_total_used(self.ctx.server_actor.id, cfg.strategy)?;
        if used > cfg.size_bytes as i64 {
            info!(used, budget = cfg.size_bytes, "mirror {} over budget", redundancy.url);
            self.retract(redundancy, &video.url, origin_inbox.as_deref()).await?;
            return Ok(false);
        }

        let expires = now_ms().saturating_add((cfg.min_lifetime_secs as i64).saturating_mul(1000));
        db.extend_redundancy(redundancy.id, expires)?;
        let extended = VideoRedundancy {
            expires_on_ms: Some(expires),
            ..redundancy.clone()
        };
        self.ctx.outbox().send_update_cache_file(&extended, &video).await?;
        Ok(true)
    }

    /// Drops expired mirrors announced by other servers. Those are theirs to retract.
    fn purge_remote_expired(&self, report: &mut TickReport) -> Result<()> {
        let db = &self.ctx.db;
        for redundancy in db.list_expired_redundancies(self.ctx.server_actor.id, false, now_ms())? {
            db.delete_redundancy(redundancy.id)?;
            debug!("purged remote mirror {}", redundancy.url);
            report.purged += 1;
        }
        Ok(())
    }

    /// Mirrors every file of a remote video with no expiration.
    pub async fn create_manual_redundancy(&self, video_id: i64) -> Result<Vec<VideoRedundancy>> {
        let db = &self.ctx.db;
        let video = db
            .load_video(video_id)?
            .ok_or_else(|| FedError::MissingLink(format!("video {video_id}")))?;
        if video.is_owned() {
            return Err(FedError::Invalid(format!("{} is a local video", video.url)).into());
        }
        let mut files = Vec::new();
        for file in db.list_video_files(video.id)? {
            if db.load_redundancy_for_file(self.ctx.server_actor.id, file.id)?.is_none() {
                files.push(file);
            }
        }
        if files.is_empty() {
            return Err(FedError::Invalid(format!("{} is already mirrored", video.url)).into());
        }
        let mirrors = self.mirror_video(&video, &files, RedundancyStrategy::Manual, None).await?;
        info!("manually mirrored {} ({} files)", video.url, mirrors.len());
        Ok(mirrors)
    }

    async fn retract(&self, redundancy: &VideoRedundancy, video_url: &str, origin_inbox: Option<&str>) -> Result<()> {
        self.remove_local(redundancy).await?;
        self.ctx
            .outbox()
            .send_undo_cache_file(redundancy, video_url, origin_inbox)
            .await?;
        Ok(())
    }

    async fn destroy(&self, redundancy: &VideoRedundancy) -> Result<()> {
        let db = &self.ctx.db;
        let video = db.load_video(redundancy.video_id)?;
        let origin_inbox = match &video {
            Some(v) => db
                .load_actor(v.channel_actor_id)?
                .map(|a| a.delivery_inbox().to_string()),
            None => None,
        };
        match video {
            Some(v) => self.retract(redundancy, &v.url, origin_inbox.as_deref()).await,
            None => self.remove_local(redundancy).await,
        }
    }

    async fn remove_local(&self, redundancy: &VideoRedundancy) -> Result<()> {
        self.ctx.db.delete_redundancy(redundancy.id)?;
        if let Some(path) = self.local_path(redundancy)? {
            remove_quietly(&path).await;
        }
        Ok(())
    }

    fn storage_dir(&self) -> Result<PathBuf> {
        Ok(self.ctx.cfg.data_dir()?.join("redundancy"))
    }

    fn local_path(&self, redundancy: &VideoRedundancy) -> Result<Option<PathBuf>> {
        let prefix = format!("{}/static/redundancy/", self.ctx.cfg.base_url());
        Ok(match redundancy.file_url.strip_prefix(&prefix) {
            Some(name) if is_file_name(name) => Some(self.storage_dir()?.join(name)),
            _ => None,
        })
    }
}

/// On-disk name of a mirrored file. Built from local row ids only.
fn file_name(video: &Video, file: &VideoFile) -> String {
    format!("{}-{}.mp4", video.id, file.resolution)
}

fn is_file_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') && !name.starts_with('.')
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("cannot remove {}: {e}", path.display()),
    }
}

pub fn start_redundancy_scheduler(
    scheduler: Arc<RedundancyScheduler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            match scheduler.tick().await {
                Ok(r) if r.mirrored + r.evicted + r.retracted + r.purged > 0 => info!(
                    mirrored = r.mirrored,
                    evicted = r.evicted,
                    extended = r.extended,
                    retracted = r.retracted,
                    purged = r.purged,
                    "redundancy tick"
                ),
                Ok(_) => {}
                Err(e) => warn!("redundancy tick failed: {e:#}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FedConfig, RedundancyConfig};
    use crate::model::ActorType;
    use crate::testkit::{remote_actor, serve_video, TestEnv, BASE};

    const CHANNEL: &str = "https://v.example/video-channels/ch";

    fn config(size_bytes: u64) -> FedConfig {
        let mut cfg = FedConfig::for_base_url(BASE);
        cfg.redundancy = RedundancyConfig {
            check_interval_secs: None,
            strategies: vec![StrategyConfig {
                strategy: RedundancyStrategy::RecentlyAdded,
                size_bytes,
                min_lifetime_secs: 3600,
                window_secs: None,
                min_views: None,
            }],
        };
        cfg
    }

    fn past_mirror(env: &TestEnv, video: &Video, strategy: Option<RedundancyStrategy>) -> VideoRedundancy {
        let file = env.ctx.db.list_video_files(video.id).unwrap().remove(0);
        env.ctx
            .db
            .upsert_redundancy(&NewRedundancy {
                actor_id: env.ctx.server_actor.id,
                video_file_id: file.id,
                strategy,
                expires_on_ms: Some(now_ms() - 1000),
                file_url: format!("{BASE}/static/redundancy/{}", file_name(video, &file)),
                url: format!("{BASE}/redundancy/videos/{}/{}", video.uuid, file.resolution),
            })
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn mirrors_a_candidate_and_announces_each_file() {
        let env = TestEnv::with_config(config(5000)).await;
        let channel = remote_actor(&env, CHANNEL, ActorType::Group);
        env.ctx.db.set_server_redundancy_allowed("v.example", true).unwrap();
        let video = env.remote_video(&channel, "https://v.example/videos/watch/pop", &[(720, 700), (360, 300)]);

        let sched = RedundancyScheduler::new(env.ctx.clone());
        let report = sched.tick().await.unwrap();
        assert_eq!(report.mirrored, 2);
        assert_eq!(env.downloader.downloaded().len(), 2);
        assert_eq!(
            env.ctx
                .db
                .redundancy_total_used(env.ctx.server_actor.id, RedundancyStrategy::RecentlyAdded)
                .unwrap(),
            1000
        );
        let stored = env.dir.path().join("redundancy").join(format!("{}-720.mp4", video.id));
        assert!(stored.exists());
        let announces = env.unicasts().await;
        assert_eq!(announces.len(), 2);
        assert!(announces.iter().all(|u| u.uri == "https://v.example/inbox"));
        assert_eq!(announces[0].body["type"], "Create");
        assert_eq!(announces[0].body["object"]["object"], video.url);
    }

    #[tokio::test]
    async fn expired_mirror_is_evicted_to_fit_a_candidate() {
        let env = TestEnv::with_config(config(1000)).await;
        let channel = remote_actor(&env, CHANNEL, ActorType::Group);
        env.ctx.db.set_server_redundancy_allowed("v.example", true).unwrap();
        let old = env.remote_video(&channel, "https://v.example/videos/watch/old", &[(720, 600)]);
        let old_mirror = past_mirror(&env, &old, Some(RedundancyStrategy::RecentlyAdded));
        env.remote_video(&channel, "https://v.example/videos/watch/fits", &[(720, 900)]);

        let report = RedundancyScheduler::new(env.ctx.clone()).tick().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.mirrored, 1);
        assert!(env.ctx.db.load_redundancy_by_url(&old_mirror.url).unwrap().is_none());
        let used = env
            .ctx
            .db
            .redundancy_total_used(env.ctx.server_actor.id, RedundancyStrategy::RecentlyAdded)
            .unwrap();
        assert_eq!(used, 900);
    }

    #[tokio::test]
    async fn budget_is_never_exceeded() {
        let env = TestEnv::with_config(config(1000)).await;
        let channel = remote_actor(&env, CHANNEL, ActorType::Group);
        env.ctx.db.set_server_redundancy_allowed("v.example", true).unwrap();
        env.remote_video(&channel, "https://v.example/videos/watch/big", &[(720, 1500)]);
        env.remote_video(&channel, "https://v.example/videos/watch/a", &[(720, 600)]);
        env.remote_video(&channel, "https://v.example/videos/watch/b", &[(720, 600)]);

        let sched = RedundancyScheduler::new(env.ctx.clone());
        for _ in 0..6 {
            sched.tick().await.unwrap();
            let used = env
                .ctx
                .db
                .redundancy_total_used(env.ctx.server_actor.id, RedundancyStrategy::RecentlyAdded)
                .unwrap();
            assert!(used <= 1000, "used {used}");
        }
        assert!(!env
            .downloader
            .downloaded()
            .contains(&"https://v.example/videos/watch/big-720.mp4".to_string()));
    }

    #[tokio::test]
    async fn expired_remote_mirrors_are_purged_silently() {
        let env = TestEnv::new().await;
        let channel = env.local_channel("main", "owner");
        let video = env.local_video(&channel, "mine");
        let peer = remote_actor(&env, "https://m.example/accounts/peertube", ActorType::Application);
        let file = env.ctx.db.list_video_files(video.id).unwrap().remove(0);
        env.ctx
            .db
            .upsert_redundancy(&NewRedundancy {
                actor_id: peer.id,
                video_file_id: file.id,
                strategy: None,
                expires_on_ms: Some(now_ms() - 1),
                file_url: "https://m.example/static/redundancy/mine-720.mp4".into(),
                url: "https://m.example/redundancy/videos/mine/720".into(),
            })
            .unwrap();

        let report = RedundancyScheduler::new(env.ctx.clone()).tick().await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(env
            .ctx
            .db
            .load_redundancy_by_url("https://m.example/redundancy/videos/mine/720")
            .unwrap()
            .is_none());
        assert!(env.broadcasts().await.is_empty());
        assert!(env.unicasts().await.is_empty());
    }

    #[tokio::test]
    async fn expired_peer_mirror_of_remote_video_is_purged_without_retraction() {
        let mut cfg = config(5000);
        cfg.redundancy.strategies[0].strategy = RedundancyStrategy::MostViews;
        let env = TestEnv::with_config(cfg).await;
        let channel = remote_actor(&env, CHANNEL, ActorType::Group);
        env.ctx.db.set_server_redundancy_allowed("v.example", false).unwrap();
        let video = env.remote_video(&channel, "https://v.example/videos/watch/peer", &[(720, 100)]);
        let peer = remote_actor(&env, "https://m.example/accounts/peertube", ActorType::Application);
        let file = env.ctx.db.list_video_files(video.id).unwrap().remove(0);
        let url = format!("https://m.example/redundancy/videos/{}/720", video.uuid);
        env.ctx
            .db
            .upsert_redundancy(&NewRedundancy {
                actor_id: peer.id,
                video_file_id: file.id,
                strategy: Some(RedundancyStrategy::MostViews),
                expires_on_ms: Some(now_ms() - 1),
                file_url: format!("https://m.example/static/redundancy/{}-720.mp4", video.uuid),
                url: url.clone(),
            })
            .unwrap();

        let report = RedundancyScheduler::new(env.ctx.clone()).tick().await.unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(report.mirrored, 0);
        assert!(env.ctx.db.load_redundancy_by_url(&url).unwrap().is_none());
        assert!(env.downloader.downloaded().is_empty());
        assert!(env.broadcasts().await.is_empty());
        assert!(env.unicasts().await.is_empty());
    }

    #[tokio::test]
    async fn mirror_of_gone_video_is_retracted() {
        let env = TestEnv::with_config(config(5000)).await;
        let channel = remote_actor(&env, CHANNEL, ActorType::Group);
        let video = env.remote_video(&channel, "https://v.example/videos/watch/gone", &[(720, 100)]);
        let mirror = past_mirror(&env, &video, Some(RedundancyStrategy::RecentlyAdded));
        env.fetcher.gone(&video.url);

        let report = RedundancyScheduler::new(env.ctx.clone()).tick().await.unwrap();
        assert_eq!(report.retracted, 1);
        assert!(env.ctx.db.load_redundancy_by_url(&mirror.url).unwrap().is_none());
        assert!(env.ctx.db.load_video(video.id).unwrap().is_none());
        let undo = env.unicasts().await;
        assert_eq!(undo.len(), 1);
        assert_eq!(undo[0].uri, "https://v.example/inbox");
        assert_eq!(undo[0].body["type"], "Undo");
        assert_eq!(undo[0].body["object"]["object"]["id"], mirror.url);
    }

    #[tokio::test]
    async fn live_mirror_is_extended_and_updated() {
        let env = TestEnv::with_config(config(5000)).await;
        let channel = remote_actor(&env, CHANNEL, ActorType::Group);
        let url = "https://v.example/videos/watch/keep";
        let video = env.remote_video(&channel, url, &[(720, 100)]);
        serve_video(&env, url, CHANNEL);
        let mirror = past_mirror(&env, &video, Some(RedundancyStrategy::RecentlyAdded));

        let report = RedundancyScheduler::new(env.ctx.clone()).tick().await.unwrap();
        assert_eq!(report.extended, 1);
        let stored = env.ctx.db.load_redundancy_by_url(&mirror.url).unwrap().unwrap();
        assert!(stored.expires_on_ms.unwrap() > now_ms());
        let updates = env.unicasts().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].body["type"], "Update");
    }

    #[tokio::test]
    async fn disabled_strategy_mirror_is_retracted() {
        let env = TestEnv::new().await;
        let channel = remote_actor(&env, CHANNEL, ActorType::Group);
        let url = "https://v.example/videos/watch/old";
        let video = env.remote_video(&channel, url, &[(720, 100)]);
        serve_video(&env, url, CHANNEL);
        let mirror = past_mirror(&env, &video, Some(RedundancyStrategy::MostViews));

        let report = RedundancyScheduler::new(env.ctx.clone()).tick().await.unwrap();
        assert_eq!(report.retracted, 1);
        assert!(env.ctx.db.load_redundancy_by_url(&mirror.url).unwrap().is_none());
    }

    #[tokio::test]
    async fn overlapping_ticks_are_skipped() {
        let env = TestEnv::new().await;
        let sched = RedundancyScheduler::new(env.ctx.clone());
        sched.running.store(true, Ordering::Release);
        assert!(sched.tick().await.unwrap().skipped);
        sched.running.store(false, Ordering::Release);
        assert!(!sched.tick().await.unwrap().skipped);
    }

    #[tokio::test]
    async fn manual_mirror_never_expires() {
        let env = TestEnv::new().await;
        let channel = remote_actor(&env, CHANNEL, ActorType::Group);
        let video = env.remote_video(&channel, "https://v.example/videos/watch/man", &[(480, 10)]);
        let sched = RedundancyScheduler::new(env.ctx.clone());

        let mirrors = sched.create_manual_redundancy(video.id).await.unwrap();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].strategy, Some(RedundancyStrategy::Manual));
        assert_eq!(mirrors[0].expires_on_ms, None);
        assert!(sched.create_manual_redundancy(video.id).await.is_err());

        let local = env.local_channel("main", "owner");
        let own = env.local_video(&local, "own");
        assert!(sched.create_manual_redundancy(own.id).await.is_err());
    }

    #[tokio::test]
    async fn failed_download_records_nothing() {
        let env = TestEnv::with_config(config(5000)).await;
        let channel = remote_actor(&env, CHANNEL, ActorType::Group);
        env.ctx.db.set_server_redundancy_allowed("v.example", true).unwrap();
        let url = "https://v.example/videos/watch/broken";
        let video = env.remote_video(&channel, url, &[(720, 100), (360, 50)]);
        env.downloader.fail(&format!("{url}-360.mp4"));

        let report = RedundancyScheduler::new(env.ctx.clone()).tick().await.unwrap();
        assert_eq!(report.mirrored, 0);
        for file in env.ctx.db.list_video_files(video.id).unwrap() {
            assert!(env
                .ctx
                .db
                .load_redundancy_for_file(env.ctx.server_actor.id, file.id)
                .unwrap()
                .is_none());
        }
        assert!(!env.dir.path().join("redundancy").join(format!("{}-720.mp4", video.id)).exists());
    }
}
