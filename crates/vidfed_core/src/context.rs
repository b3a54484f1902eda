/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::comments::ThreadResolver;
use crate::config::FedConfig;
use crate::crawler::Crawler;
use crate::db::FedDb;
use crate::delivery::Transport;
use crate::directory::ActorDirectory;
use crate::fetch::ApFetcher;
use crate::inbox::InboxProcessor;
use crate::job_queue::JobQueue;
use crate::keys::{generate_keypair, ACTOR_KEY_BITS};
use crate::model::{host_of, Actor, ActorType};
use crate::net_metrics::NetMetrics;
use crate::outbox::Outbox;
use crate::peer_health::DeliveryScorer;
use crate::redundancy::FileDownloader;
use crate::videos::{VideoResolver, ViewCounter};
use crate::webfinger::WebFinger;
use anyhow::{Context, Result};
use std::ops::Deref;
use std::sync::Arc;
use tracing::info;

/// The instance-level Application actor. Built once at startup and passed down.
#[derive(Clone, Debug)]
pub struct ServerActor(Arc<Actor>);

impl ServerActor {
    pub fn new(actor: Actor) -> Self {
        Self(Arc::new(actor))
    }
}

impl Deref for ServerActor {
    type Target = Actor;

    fn deref(&self) -> &Actor {
        &self.0
    }
}

/// External capabilities the engine consumes.
pub struct Capabilities {
    pub fetcher: Arc<dyn ApFetcher>,
    pub webfinger: Arc<dyn WebFinger>,
    pub transport: Arc<dyn Transport>,
    pub downloader: Arc<dyn FileDownloader>,
    pub views: Arc<dyn ViewCounter>,
    pub scorer: Arc<dyn DeliveryScorer>,
}

#[derive(Clone)]
pub struct FedContext {
    pub cfg: Arc<FedConfig>,
    pub db: Arc<FedDb>,
    pub server_actor: ServerActor,
    pub fetcher: Arc<dyn ApFetcher>,
    pub webfinger: Arc<dyn WebFinger>,
    pub transport: Arc<dyn Transport>,
    pub downloader: Arc<dyn FileDownloader>,
    pub views: Arc<dyn ViewCounter>,
    pub scorer: Arc<dyn DeliveryScorer>,
    pub queue: JobQueue,
    pub metrics: Arc<NetMetrics>,
    local_host: Arc<str>,
}

impl FedContext {
    pub fn new(
        cfg: Arc<FedConfig>,
        db: Arc<FedDb>,
        server_actor: ServerActor,
        caps: Capabilities,
        queue: JobQueue,
        metrics: Arc<NetMetrics>,
    ) -> Self {
        let local_host: Arc<str> = Arc::from(cfg.local_host());
        Self {
            cfg,
            db,
            server_actor,
            fetcher: caps.fetcher,
            webfinger: caps.webfinger,
            transport: caps.transport,
            downloader: caps.downloader,
            views: caps.views,
            scorer: caps.scorer,
            queue,
            metrics,
            local_host,
        }
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// True when `url` points at this instance.
    pub fn is_local_url(&self, url: &str) -> bool {
        host_of(url).as_deref() == Some(&*self.local_host)
    }

    pub fn directory(&self) -> ActorDirectory<'_> {
        ActorDirectory::new(self)
    }

    pub fn videos(&self) -> VideoResolver<'_> {
        VideoResolver::new(self)
    }

    pub fn outbox(&self) -> Outbox<'_> {
        Outbox::new(self)
    }

    pub fn threads(&self) -> ThreadResolver<'_> {
        ThreadResolver::new(self)
    }

    pub fn crawler(&self) -> Crawler<'_> {
        Crawler::new(self)
    }

    pub fn inbox(&self) -> InboxProcessor<'_> {
        InboxProcessor::new(self)
    }
}

/// Loads the server actor, creating it with a fresh key pair on first start.
pub fn ensure_server_actor(cfg: &FedConfig, db: &FedDb) -> Result<Actor> {
    let name = cfg.server_actor_name();
    if let Some(actor) = db.load_local_actor(name, ActorType::Application)? {
        return Ok(actor);
    }
    let (public_key_pem, private_key_pem) =
        generate_keypair(ACTOR_KEY_BITS).context("generate server actor keys")?;
    let actor = db
        .insert_local_account(cfg.base_url(), name, ActorType::Application, &public_key_pem, &private_key_pem)
        .context("create server actor")?;
    info!("created server actor {}", actor.url);
    Ok(actor)
}
