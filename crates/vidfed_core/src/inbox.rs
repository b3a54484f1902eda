/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::activity::{activities_of, actor_of, id_of, type_of, Activity, ActivityKind, ObjectKind};
use crate::audience::{comment_involved_actors, video_involved_actors};
use crate::context::FedContext;
use crate::db::{NewComment, NewRedundancy};
use crate::directory::ResolveOptions;
use crate::error::{classify, FedError};
use crate::model::{host_of, rfc3339_to_ms, same_host, Actor, FollowState, RateType, Video};
use crate::outbox::Forward;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use vidfed_protocol::{CacheFileObject, FlagObject, NoteObject, VideoObject};

/// Who vouches for the activities of a batch.
#[derive(Debug, Clone)]
pub enum Sender {
    /// HTTP signature verified for this actor.
    Signed(Actor),
    Unsigned,
    /// Read from the outbox collection on `outbox_host`.
    Crawled { outbox_host: String },
}

impl Sender {
    fn trusts_objects(&self) -> bool {
        !matches!(self, Sender::Unsigned)
    }
}

#[derive(Debug)]
pub struct InboxBatch {
    pub activities: Vec<Value>,
    pub sender: Sender,
    /// Local actor whose personal inbox received the batch.
    pub inbox_actor: Option<Actor>,
}

impl InboxBatch {
    pub fn from_body(body: Value, sender: Sender, inbox_actor: Option<Actor>) -> Self {
        Self {
            activities: activities_of(body),
            sender,
            inbox_actor,
        }
    }
}

#[derive(Debug, Default)]
pub struct Handled {
    pub forward: Option<Forward>,
}

impl Handled {
    fn forward(activity: &Activity, involved: Vec<Actor>, sender: &Actor) -> Self {
        Self {
            forward: Some(Forward::of(activity, involved, vec![sender.clone()])),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct InboxProcessor<'a> {
    ctx: &'a FedContext,
}

impl<'a> InboxProcessor<'a> {
    pub fn new(ctx: &'a FedContext) -> Self {
        Self { ctx }
    }

    /// Items are handled in order; one failing item never stops the rest.
    pub async fn process_batch(&self, batch: InboxBatch) -> BatchReport {
        let mut report = BatchReport::default();
        for value in batch.activities {
            let id = id_of(&value).unwrap_or_else(|| "<no id>".to_string());
            match self.process_one(value, &batch.sender, batch.inbox_actor.as_ref()).await {
                Ok(handled) => {
                    report.processed += 1;
                    self.ctx.metrics.activity(true);
                    if let Some(fwd) = handled.forward {
                        if let Err(e) = self.ctx.outbox().forward(&fwd).await {
                            warn!("cannot forward {id}: {e:#}");
                        }
                    }
                }
                Err(e) => {
                    self.ctx.metrics.activity(false);
                    match classify(&e) {
                        Some(FedError::Unsupported(_)) | Some(FedError::Unsigned(_)) => {
                            report.skipped += 1;
                            info!("skipping activity {id}: {e:#}");
                        }
                        _ => {
                            report.failed += 1;
                            warn!("activity {id} rejected: {e:#}");
                        }
                    }
                }
            }
        }
        report
    }

    pub async fn process_one(&self, value: Value, sender: &Sender, inbox_actor: Option<&Actor>) -> Result<Handled> {
        let kind = type_of(&value)
            .ok_or_else(|| FedError::Invalid("activity without type".into()))?
            .to_string();
        let actor_url = actor_of(&value).ok_or_else(|| FedError::Invalid(format!("{kind} without actor")))?;
        match sender {
            Sender::Signed(signer) if signer.url != actor_url => {
                return Err(FedError::ActorMismatch {
                    signer: signer.url.clone(),
                    actor: actor_url,
                }
                .into());
            }
            Sender::Unsigned if !matches!(kind.as_str(), "Create" | "Announce" | "Like") => {
                return Err(FedError::Unsigned(kind).into());
            }
            Sender::Crawled { outbox_host } if host_of(&actor_url).as_deref() != Some(outbox_host.as_str()) => {
                return Err(FedError::Invalid(format!("{actor_url} found in outbox of {outbox_host}")).into());
            }
            _ => {}
        }

        let value = match sender {
            Sender::Unsigned => self.dereference_unsigned(&value, &kind, &actor_url).await?,
            _ => value,
        };
        let value = self.materialize(value, &kind, sender).await?;
        let activity = Activity::parse(value)?;
        let actor = match sender {
            Sender::Signed(signer) => signer.clone(),
            _ => {
                self.ctx
                    .directory()
                    .resolve(&activity.actor, ResolveOptions::default())
                    .await?
            }
        };
        debug!("processing {} from {}", activity.type_name(), actor.url);
        self.dispatch(activity, &actor, inbox_actor).await
    }

    /// An unsigned activity is only believed once the actor's own host serves it
    /// under the same id, type and actor. The served copy replaces the body.
    async fn dereference_unsigned(&self, value: &Value, kind: &str, actor_url: &str) -> Result<Value> {
        let id = id_of(value).ok_or_else(|| FedError::Unsigned(format!("{kind} without id")))?;
        if !same_host(&id, actor_url) {
            return Err(FedError::Unsigned(format!("{id} is not hosted by {actor_url}")).into());
        }
        let served = self.ctx.fetcher.fetch_object(&id).await?;
        let matches = id_of(&served).as_deref() == Some(id.as_str())
            && actor_of(&served).as_deref() == Some(actor_url)
            && type_of(&served) == Some(kind);
        if !matches {
            return Err(FedError::Unsigned(format!("{id} differs from the copy its origin serves")).into());
        }
        Ok(served)
    }

    /// Replaces the embedded object of Create/Update with its dereferenced form when
    /// the body can not be trusted or only names it.
    async fn materialize(&self, mut value: Value, kind: &str, sender: &Sender) -> Result<Value> {
        if !matches!(kind, "Create" | "Update") {
            return Ok(value);
        }
        let object = value.get("object").cloned().unwrap_or(Value::Null);
        if object.is_object() && sender.trusts_objects() {
            return Ok(value);
        }
        let object_id = id_of(&object).ok_or_else(|| FedError::Invalid(format!("{kind} without object id")))?;
        let fetched = self.ctx.fetcher.fetch_object(&object_id).await?;
        if id_of(&fetched).as_deref() != Some(object_id.as_str()) {
            return Err(FedError::Invalid(format!("{object_id} answered with another id")).into());
        }
        value["object"] = fetched;
        Ok(value)
    }

    async fn dispatch(&self, activity: Activity, actor: &Actor, inbox_actor: Option<&Actor>) -> Result<Handled> {
        match activity.kind.clone() {
            ActivityKind::Follow { object } => self.on_follow(&activity, actor, &object).await,
            ActivityKind::Accept => self.on_accept(&activity, actor, inbox_actor).await,
            ActivityKind::Reject => self.on_reject(&activity, actor, inbox_actor).await,
            ActivityKind::Undo(inner) => self.on_undo(&activity, *inner, actor).await,
            ActivityKind::Create(object) => self.on_create(&activity, object, actor).await,
            ActivityKind::Update(object) => self.on_update(object, actor).await,
            ActivityKind::Delete { object } => self.on_delete(&activity, &object, actor).await,
            ActivityKind::Announce { object } => self.on_announce(&activity, &object, actor).await,
            ActivityKind::Like { object } => {
                let id = activity.id.clone();
                self.on_rate(&activity, RateType::Like, &object, id, actor).await
            }
            ActivityKind::Dislike { object } => {
                let id = activity.id.clone();
                self.on_rate(&activity, RateType::Dislike, &object, id, actor).await
            }
            ActivityKind::View { object } => self.on_view(&activity, &object, actor).await,
        }
    }

    // ---- follows ----

    async fn on_follow(&self, activity: &Activity, follower: &Actor, object: &str) -> Result<Handled> {
        let db = &self.ctx.db;
        let target = db
            .load_actor_by_url(object)?
            .filter(Actor::is_local)
            .ok_or_else(|| FedError::NotLocalTarget(object.to_string()))?;
        let (edge, created) = db.find_or_create_follow(follower.id, target.id, FollowState::Accepted, activity.id.as_deref())?;
        let newly_accepted = created || edge.state != FollowState::Accepted;
        if !created && edge.state != FollowState::Accepted {
            db.set_follow_state(edge.id, FollowState::Accepted)?;
        }
        if created {
            self.ctx.outbox().send_accept(&target, follower, &activity.raw).await?;
            info!("{} now follows {}", follower.url, target.url);
        }
        if newly_accepted {
            self.crawl_outbox_of(follower).await;
        }
        Ok(Handled::default())
    }

    /// Local side of an Accept/Reject: the personal inbox it arrived on, or the local
    /// author of the embedded Follow.
    fn follow_owner(&self, activity: &Activity, inbox_actor: Option<&Actor>) -> Result<Actor> {
        if let Some(actor) = inbox_actor {
            return Ok(actor.clone());
        }
        let follow = activity.raw.get("object").cloned().unwrap_or(Value::Null);
        let follower_url = actor_of(&follow)
            .ok_or_else(|| FedError::MissingLink(format!("{} without inbox actor", activity.type_name())))?;
        self.ctx
            .db
            .load_actor_by_url(&follower_url)?
            .filter(Actor::is_local)
            .ok_or_else(|| FedError::MissingLink(format!("local follower {follower_url}")).into())
    }

    async fn on_accept(&self, activity: &Activity, sender: &Actor, inbox_actor: Option<&Actor>) -> Result<Handled> {
        let me = self.follow_owner(activity, inbox_actor)?;
        let edge = self
            .ctx
            .db
            .load_follow(me.id, sender.id)?
            .ok_or_else(|| FedError::MissingLink(format!("follow {} -> {}", me.url, sender.url)))?;
        if edge.state != FollowState::Accepted {
            self.ctx.db.set_follow_state(edge.id, FollowState::Accepted)?;
            info!("follow {} -> {} accepted", me.url, sender.url);
            self.crawl_outbox_of(sender).await;
        }
        Ok(Handled::default())
    }

    async fn on_reject(&self, activity: &Activity, sender: &Actor, inbox_actor: Option<&Actor>) -> Result<Handled> {
        let me = self.follow_owner(activity, inbox_actor)?;
        let edge = self
            .ctx
            .db
            .load_follow(me.id, sender.id)?
            .ok_or_else(|| FedError::MissingLink(format!("follow {} -> {}", me.url, sender.url)))?;
        self.ctx.db.delete_follow(edge.id)?;
        info!("follow {} -> {} rejected", me.url, sender.url);
        Ok(Handled::default())
    }

    async fn crawl_outbox_of(&self, actor: &Actor) {
        if !self.ctx.cfg.sync_collections() {
            return;
        }
        if let Err(e) = self.ctx.directory().schedule_outbox_crawl(actor).await {
            warn!("cannot schedule outbox crawl of {}: {e:#}", actor.url);
        }
    }

    // ---- undo ----

    async fn on_undo(&self, activity: &Activity, inner: Activity, actor: &Actor) -> Result<Handled> {
        if inner.actor != actor.url {
            return Err(FedError::ActorMismatch {
                signer: actor.url.clone(),
                actor: inner.actor,
            }
            .into());
        }
        let db = &self.ctx.db;
        let undone = inner.type_name();
        match inner.kind {
            ActivityKind::Follow { object } => {
                let Some(target) = db.load_actor_by_url(&object)? else {
                    debug!("undo follow of unknown {object}");
                    return Ok(Handled::default());
                };
                if let Some(edge) = db.load_follow(actor.id, target.id)? {
                    db.delete_follow(edge.id)?;
                    info!("{} unfollowed {}", actor.url, target.url);
                }
                Ok(Handled::default())
            }
            ActivityKind::Like { object } | ActivityKind::Create(ObjectKind::Like { video_url: object, .. }) => {
                self.undo_rate(activity, RateType::Like, &object, actor)
            }
            ActivityKind::Dislike { object } | ActivityKind::Create(ObjectKind::Dislike { video_url: object, .. }) => {
                self.undo_rate(activity, RateType::Dislike, &object, actor)
            }
            ActivityKind::Announce { .. } => {
                let share_url = inner
                    .id
                    .ok_or_else(|| FedError::Invalid("undone Announce without id".into()))?;
                let Some(video_id) = db.delete_share(actor.id, &share_url)? else {
                    debug!("undo of unknown share {share_url}");
                    return Ok(Handled::default());
                };
                match db.load_video(video_id)? {
                    Some(video) if video.is_owned() => {
                        Ok(Handled::forward(activity, video_involved_actors(db, &video)?, actor))
                    }
                    _ => Ok(Handled::default()),
                }
            }
            ActivityKind::Create(ObjectKind::CacheFile(cf)) => {
                let redundancy = db
                    .load_redundancy_by_url(&cf.id)?
                    .ok_or_else(|| FedError::MissingLink(format!("redundancy {}", cf.id)))?;
                if redundancy.actor_id != actor.id {
                    return Err(FedError::Invalid(format!("{} does not own redundancy {}", actor.url, cf.id)).into());
                }
                db.delete_redundancy(redundancy.id)?;
                info!("removed redundancy {} of {}", cf.id, actor.url);
                match db.load_video(redundancy.video_id)? {
                    Some(video) if video.is_owned() => {
                        Ok(Handled::forward(activity, video_involved_actors(db, &video)?, actor))
                    }
                    _ => Ok(Handled::default()),
                }
            }
            _ => Err(FedError::Unsupported(format!("Undo of {undone}")).into()),
        }
    }

    fn undo_rate(&self, activity: &Activity, rate: RateType, video_url: &str, actor: &Actor) -> Result<Handled> {
        let db = &self.ctx.db;
        let Some(video) = db.load_video_by_url(video_url)? else {
            debug!("undo {} on unknown video {video_url}", rate.as_str());
            return Ok(Handled::default());
        };
        let account_id = actor
            .account_id
            .ok_or_else(|| FedError::MissingLink(format!("account of {}", actor.url)))?;
        let removed = db.remove_rate(account_id, video.id, rate)?;
        if removed && video.is_owned() {
            return Ok(Handled::forward(activity, video_involved_actors(db, &video)?, actor));
        }
        Ok(Handled::default())
    }

    // ---- create ----

    async fn on_create(&self, activity: &Activity, object: ObjectKind, actor: &Actor) -> Result<Handled> {
        match object {
            ObjectKind::View { video_url } => self.on_view(activity, &video_url, actor).await,
            ObjectKind::Like { id, video_url } => {
                self.on_rate(activity, RateType::Like, &video_url, id.or_else(|| activity.id.clone()), actor)
                    .await
            }
            ObjectKind::Dislike { id, video_url } => {
                self.on_rate(activity, RateType::Dislike, &video_url, id.or_else(|| activity.id.clone()), actor)
                    .await
            }
            ObjectKind::Video(video) => {
                let (v, created) = self.ctx.videos().get_or_create(&video.id).await?;
                if created {
                    info!("video {} announced by {}", v.url, actor.url);
                }
                Ok(Handled::default())
            }
            ObjectKind::Flag(flag) => self.on_flag(activity, flag, actor),
            ObjectKind::Note(note) => self.on_note(activity, note, actor).await,
            ObjectKind::CacheFile(cf) => self.on_cache_file(Some(activity), cf, actor).await,
            ObjectKind::Actor(_) => Err(FedError::Unsupported("Create of an actor".into()).into()),
        }
    }

    async fn on_view(&self, activity: &Activity, video_url: &str, actor: &Actor) -> Result<Handled> {
        let (video, _) = self.ctx.videos().get_or_create(video_url).await?;
        self.ctx.views.add_view(&video).await?;
        if video.is_owned() {
            return Ok(Handled::forward(activity, video_involved_actors(&self.ctx.db, &video)?, actor));
        }
        Ok(Handled::default())
    }

    async fn on_rate(
        &self,
        activity: &Activity,
        rate: RateType,
        video_url: &str,
        rate_url: Option<String>,
        actor: &Actor,
    ) -> Result<Handled> {
        let (video, _) = self.ctx.videos().get_or_create(video_url).await?;
        let account_id = actor
            .account_id
            .ok_or_else(|| FedError::MissingLink(format!("account of {}", actor.url)))?;
        let change = self
            .ctx
            .db
            .upsert_rate(account_id, video.id, rate, rate_url.as_deref())?;
        if change.is_new() && video.is_owned() {
            return Ok(Handled::forward(activity, video_involved_actors(&self.ctx.db, &video)?, actor));
        }
        Ok(Handled::default())
    }

    fn on_flag(&self, activity: &Activity, flag: FlagObject, actor: &Actor) -> Result<Handled> {
        let db = &self.ctx.db;
        let account_id = actor
            .account_id
            .ok_or_else(|| FedError::MissingLink(format!("account of {}", actor.url)))?;
        let reason = flag.content.unwrap_or_default();
        let url = flag.id.or_else(|| activity.id.clone());
        for object in flag.object.into_vec() {
            match db.load_video_by_url(&object)? {
                Some(video) if video.is_owned() => {
                    if db.insert_abuse(account_id, video.id, &reason, url.as_deref())? {
                        info!("abuse report on {} from {}", video.url, actor.url);
                    }
                }
                _ => debug!("flag of {object} does not target a local video"),
            }
        }
        Ok(Handled::default())
    }

    async fn on_note(&self, activity: &Activity, note: NoteObject, actor: &Actor) -> Result<Handled> {
        if note.attributed_to != actor.url {
            return Err(FedError::Invalid(format!("{} is not attributed to {}", note.id, actor.url)).into());
        }
        if self.ctx.db.load_comment_by_url(&note.id)?.is_some() {
            debug!("comment {} already known", note.id);
            return Ok(Handled::default());
        }
        let account_id = actor
            .account_id
            .ok_or_else(|| FedError::MissingLink(format!("account of {}", actor.url)))?;
        let pending = vec![NewComment {
            url: note.id.clone(),
            text: note.content.unwrap_or_default(),
            account_id,
        }];
        let thread = self.ctx.threads().resolve_thread(&note.in_reply_to, pending).await?;
        let (comment, created) = thread
            .newest()
            .cloned()
            .ok_or_else(|| anyhow!("thread of {} came back empty", note.id))?;
        if created && thread.video.is_owned() {
            let involved = comment_involved_actors(&self.ctx.db, &comment, &thread.video)?;
            return Ok(Handled::forward(activity, involved, actor));
        }
        Ok(Handled::default())
    }

    /// `created_by` is the Create carrying a new mirror; updates are never forwarded.
    async fn on_cache_file(&self, created_by: Option<&Activity>, cf: CacheFileObject, actor: &Actor) -> Result<Handled> {
        let db = &self.ctx.db;
        if !same_host(&cf.id, &actor.url) {
            return Err(FedError::Invalid(format!("cache file {} not on the host of {}", cf.id, actor.url)).into());
        }
        let (video, _) = self.ctx.videos().get_or_create(&cf.object).await?;
        let height = cf
            .url
            .height
            .ok_or_else(|| FedError::Invalid(format!("cache file {} without height", cf.id)))?;
        let file = db
            .load_video_file_by_resolution(video.id, height)?
            .ok_or_else(|| FedError::MissingLink(format!("{height}p file of {}", video.url)))?;
        if let Some(existing) = db.load_redundancy_by_url(&cf.id)? {
            if existing.actor_id != actor.id {
                return Err(FedError::Invalid(format!("redundancy {} belongs to another actor", cf.id)).into());
            }
        }
        let expires_on_ms = match cf.expires.as_deref() {
            Some(s) => Some(rfc3339_to_ms(s).ok_or_else(|| FedError::Invalid(format!("expires {s}")))?),
            None => None,
        };
        let (redundancy, created) = db.upsert_redundancy(&NewRedundancy {
            actor_id: actor.id,
            video_file_id: file.id,
            strategy: None,
            expires_on_ms,
            file_url: cf.url.href,
            url: cf.id,
        })?;
        debug!(created, "redundancy {} of {}", redundancy.url, video.url);
        match created_by {
            Some(activity) if created && video.is_owned() => {
                Ok(Handled::forward(activity, video_involved_actors(db, &video)?, actor))
            }
            _ => Ok(Handled::default()),
        }
    }

    // ---- update / delete / announce ----

    async fn on_update(&self, object: ObjectKind, actor: &Actor) -> Result<Handled> {
        match object {
            ObjectKind::Video(doc) => self.on_update_video(*doc, actor).await,
            ObjectKind::CacheFile(cf) => self.on_cache_file(None, cf, actor).await,
            ObjectKind::Actor(doc) => {
                if doc.id != actor.url {
                    return Err(FedError::Invalid(format!("{} updated by {}", doc.id, actor.url)).into());
                }
                self.ctx.directory().refresh(actor.clone()).await?;
                Ok(Handled::default())
            }
            other => Err(FedError::Unsupported(format!("Update of {}", other.type_name())).into()),
        }
    }

    async fn on_update_video(&self, doc: VideoObject, actor: &Actor) -> Result<Handled> {
        let Some(video) = self.ctx.db.load_video_by_url(&doc.id)? else {
            self.ctx.videos().get_or_create(&doc.id).await?;
            return Ok(Handled::default());
        };
        if video.is_owned() {
            return Err(FedError::Invalid(format!("remote update of local video {}", video.url)).into());
        }
        if !self.manages_video(actor, &video)? {
            return Err(FedError::Invalid(format!("{} may not update {}", actor.url, video.url)).into());
        }
        let updated = self.ctx.videos().update_from_object(&video, &doc)?;
        info!("updated remote video {}", updated.url);
        Ok(Handled::default())
    }

    /// The channel actor of `video` or the account owning that channel.
    fn manages_video(&self, actor: &Actor, video: &Video) -> Result<bool> {
        if actor.id == video.channel_actor_id {
            return Ok(true);
        }
        let owner = match self.ctx.db.load_channel(video.channel_id)? {
            Some(channel) => Some(channel.account_id),
            None => None,
        };
        Ok(owner.is_some() && actor.account_id == owner)
    }

    async fn on_delete(&self, activity: &Activity, object: &str, actor: &Actor) -> Result<Handled> {
        let db = &self.ctx.db;
        if object == actor.url {
            db.delete_actor(actor.id)?;
            info!("remote actor {} deleted itself", actor.url);
            return Ok(Handled::default());
        }
        if let Some(video) = db.load_video_by_url(object)? {
            if !self.manages_video(actor, &video)? {
                return Err(FedError::Invalid(format!("{} may not delete {}", actor.url, video.url)).into());
            }
            db.delete_video(video.id)?;
            info!("remote video {} deleted", video.url);
            return Ok(Handled::default());
        }
        if let Some(comment) = db.load_comment_by_url(object)? {
            if actor.account_id != Some(comment.account_id) {
                return Err(FedError::Invalid(format!("{} may not delete {}", actor.url, comment.url)).into());
            }
            let video = db.load_video(comment.video_id)?;
            let involved = match &video {
                Some(v) if v.is_owned() => Some(comment_involved_actors(db, &comment, v)?),
                _ => None,
            };
            db.delete_comment(comment.id)?;
            info!("remote comment {} deleted", comment.url);
            return Ok(match involved {
                Some(involved) => Handled::forward(activity, involved, actor),
                None => Handled::default(),
            });
        }
        debug!("nothing to delete for {object}");
        Ok(Handled::default())
    }

    async fn on_announce(&self, activity: &Activity, object: &str, actor: &Actor) -> Result<Handled> {
        let share_url = activity
            .id
            .clone()
            .ok_or_else(|| FedError::Invalid("Announce without id".into()))?;
        let (video, _) = self.ctx.videos().get_or_create(object).await?;
        let created = self.ctx.db.insert_share(actor.id, video.id, &share_url)?;
        if created && video.is_owned() {
            return Ok(Handled::forward(activity, video_involved_actors(&self.ctx.db, &video)?, actor));
        }
        Ok(Handled::default())
    }
}

/// Bounded hand-off between the HTTP layer and the inbox workers.
#[derive(Clone)]
pub struct InboxQueue {
    tx: mpsc::Sender<InboxBatch>,
}

impl InboxQueue {
    pub fn start(ctx: FedContext, workers: usize, capacity: usize, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(16));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let ctx = ctx.clone();
            let rx = rx.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        res = shutdown.changed() => {
                            if res.is_err() || *shutdown.borrow() { break; }
                            continue;
                        }
                        next = async { rx.lock().await.recv().await } => next,
                    };
                    let Some(batch) = next else { break };
                    let report = ctx.inbox().process_batch(batch).await;
                    debug!(
                        worker,
                        processed = report.processed,
                        skipped = report.skipped,
                        failed = report.failed,
                        "inbox batch done"
                    );
                }
                debug!(worker, "inbox worker stopped");
            });
        }
        Self { tx }
    }

    /// Queue without workers; the caller drains the receiver.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<InboxBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, batch: InboxBatch) -> Result<()> {
        self.tx.try_send(batch).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("inbox queue full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("inbox queue closed"),
        })
    }
}
