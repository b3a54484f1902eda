/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::activity::{self, Activity};
use crate::audience::{
    addressed_followers, audience_for, audience_from_followers_of, comment_involved_actors,
    video_involved_actors, Audience,
};
use crate::context::FedContext;
use crate::error::FedError;
use crate::model::{now_ms, Actor, ActorFollow, Video, VideoComment, VideoPrivacy, VideoRedundancy};
use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::debug;
use vidfed_protocol::{BroadcastPayload, FollowPayload, JobPayload, UnicastPayload};

/// Re-broadcast of an inbound activity to the followers of the actors it concerns.
#[derive(Debug, Clone)]
pub struct Forward {
    pub activity: Value,
    /// Follower collections named in the original `to`/`cc`.
    pub addressed: Vec<String>,
    pub involved: Vec<Actor>,
    pub exceptions: Vec<Actor>,
}

impl Forward {
    pub fn of(activity: &Activity, involved: Vec<Actor>, exceptions: Vec<Actor>) -> Self {
        Self {
            activity: activity.raw.clone(),
            addressed: addressed_followers(&activity.to, &activity.cc),
            involved,
            exceptions,
        }
    }
}

pub struct Outbox<'a> {
    ctx: &'a FedContext,
}

impl<'a> Outbox<'a> {
    pub fn new(ctx: &'a FedContext) -> Self {
        Self { ctx }
    }

    /// Delivery inboxes of the accepted followers of `targets`, minus the
    /// inboxes of `exceptions` and of the server actor.
    pub fn follower_inboxes(&self, targets: &[Actor], exceptions: &[Actor]) -> Result<Vec<String>> {
        let ids: Vec<i64> = targets.iter().map(|a| a.id).collect();
        let mut excluded: Vec<&str> = vec![self.ctx.server_actor.delivery_inbox()];
        for a in exceptions {
            excluded.push(a.delivery_inbox());
            excluded.push(&a.inbox_url);
        }
        Ok(self
            .ctx
            .db
            .list_accepted_follower_inboxes(&ids)?
            .into_iter()
            .filter(|inbox| !excluded.contains(&inbox.as_str()))
            .collect())
    }

    /// Queues one broadcast of `build(audience)` to the followers of `involved`.
    /// Returns the job id, or None when nobody is left to deliver to.
    pub async fn send_to_followers(
        &self,
        build: impl FnOnce(&Audience) -> Value,
        by_actor: &Actor,
        involved: &[Actor],
        exceptions: &[Actor],
        is_public: bool,
    ) -> Result<Option<String>> {
        let uris = self.follower_inboxes(involved, exceptions)?;
        if uris.is_empty() {
            debug!("no follower inboxes for activity by {}", by_actor.url);
            return Ok(None);
        }
        let body = build(&audience_for(involved, is_public));
        let id = self
            .ctx
            .queue
            .enqueue(JobPayload::Broadcast(BroadcastPayload {
                uris,
                signature_actor_id: by_actor.id,
                body,
            }))
            .await?;
        Ok(Some(id))
    }

    pub async fn send_to_one(&self, body: Value, by_actor: &Actor, inbox_url: &str) -> Result<String> {
        self.ctx
            .queue
            .enqueue(JobPayload::Unicast(UnicastPayload {
                uri: inbox_url.to_string(),
                signature_actor_id: by_actor.id,
                body,
            }))
            .await
    }

    /// Forwards an inbound activity unchanged, signed by the server actor.
    /// The signer is not the activity's actor, so receivers have to re-fetch the
    /// activity by its id before accepting it. Our own inbox does so for unsigned
    /// Create, Announce and Like.
    pub async fn forward(&self, fwd: &Forward) -> Result<Option<String>> {
        let mut targets = self.ctx.db.list_actors_by_followers_urls(&fwd.addressed)?;
        for actor in &fwd.involved {
            if !targets.iter().any(|t| t.id == actor.id) {
                targets.push(actor.clone());
            }
        }
        let uris = self.follower_inboxes(&targets, &fwd.exceptions)?;
        if uris.is_empty() {
            return Ok(None);
        }
        let id = self
            .ctx
            .queue
            .enqueue(JobPayload::Broadcast(BroadcastPayload {
                uris,
                signature_actor_id: self.ctx.server_actor.id,
                body: fwd.activity.clone(),
            }))
            .await?;
        debug!("forwarded {:?}", activity::id_of(&fwd.activity));
        Ok(Some(id))
    }

    /// Remote videos: unicast to the origin channel. Owned videos: broadcast to
    /// the followers of every involved actor.
    async fn send_video_related(
        &self,
        build: impl FnOnce(&Audience) -> Value,
        by_actor: &Actor,
        video: &Video,
        mut involved: Vec<Actor>,
    ) -> Result<Option<String>> {
        if !video.is_owned() {
            let origin = self
                .ctx
                .db
                .load_actor(video.channel_actor_id)?
                .ok_or_else(|| FedError::MissingLink(format!("channel actor of {}", video.url)))?;
            let body = build(&audience_from_followers_of(&[by_actor.clone()]));
            return Ok(Some(self.send_to_one(body, by_actor, origin.delivery_inbox()).await?));
        }
        if !involved.iter().any(|a| a.id == by_actor.id) {
            involved.push(by_actor.clone());
        }
        let is_public = video.privacy == VideoPrivacy::Public;
        self.send_to_followers(build, by_actor, &involved, &[], is_public).await
    }

    // ---- follows ----

    /// Queues a follow of `name@host`; the follow job resolves the handle and sends the request.
    pub async fn request_follow(&self, follower: &Actor, name: &str, host: &str) -> Result<String> {
        if !follower.is_local() {
            return Err(FedError::Invalid(format!("remote actor {} can not follow from here", follower.url)).into());
        }
        self.ctx
            .queue
            .enqueue(JobPayload::Follow(FollowPayload {
                host: host.to_string(),
                name: name.to_string(),
                follower_actor_id: follower.id,
            }))
            .await
    }

    pub async fn send_follow(&self, follow: &ActorFollow, follower: &Actor, target: &Actor) -> Result<String> {
        let id = follow
            .url
            .clone()
            .unwrap_or_else(|| activity::follow_url(follower, target));
        let body = activity::build_follow(&id, follower, target);
        self.send_to_one(body, follower, &target.inbox_url).await
    }

    pub async fn send_undo_follow(&self, follow: &ActorFollow, follower: &Actor, target: &Actor) -> Result<String> {
        let id = follow
            .url
            .clone()
            .unwrap_or_else(|| activity::follow_url(follower, target));
        let inner = activity::build_follow(&id, follower, target);
        let body = activity::build_undo(follower, inner, &Audience::default());
        self.send_to_one(body, follower, &target.inbox_url).await
    }

    /// Accept goes to the follower only.
    pub async fn send_accept(&self, target: &Actor, follower: &Actor, follow: &Value) -> Result<String> {
        let body = activity::build_accept(target, follower, follow);
        self.send_to_one(body, target, &follower.inbox_url).await
    }

    pub async fn send_reject(&self, target: &Actor, follower: &Actor, follow: &Value) -> Result<String> {
        let body = activity::build_reject(target, follower, follow);
        self.send_to_one(body, target, &follower.inbox_url).await
    }

    // ---- videos ----

    fn video_document(&self, video: &Video, audience: &Audience) -> Result<Value> {
        let channel = self
            .ctx
            .db
            .load_actor(video.channel_actor_id)?
            .ok_or_else(|| FedError::MissingLink(format!("channel actor of {}", video.url)))?;
        let owner = match self.ctx.db.load_channel(video.channel_id)? {
            Some(ch) => self.ctx.db.load_actor_by_account(ch.account_id)?,
            None => None,
        };
        let files = self.ctx.db.list_video_files(video.id)?;
        Ok(activity::video_object(video, &channel, owner.as_ref(), &files, audience))
    }

    fn channel_actor(&self, video: &Video) -> Result<Actor> {
        self.ctx
            .db
            .load_actor(video.channel_actor_id)?
            .ok_or_else(|| FedError::MissingLink(format!("channel actor of {}", video.url)).into())
    }

    pub async fn send_create_video(&self, video: &Video) -> Result<Option<String>> {
        if video.privacy == VideoPrivacy::Private || !video.is_owned() {
            return Ok(None);
        }
        let channel = self.channel_actor(video)?;
        let involved = video_involved_actors(&self.ctx.db, video)?;
        let is_public = video.privacy == VideoPrivacy::Public;
        let object = self.video_document(video, &audience_for(&involved, is_public))?;
        let id = format!("{}/activity", video.url);
        self.send_to_followers(
            |aud| activity::build_create(&id, &channel, object, aud),
            &channel,
            &involved,
            &[],
            is_public,
        )
        .await
    }

    pub async fn send_update_video(&self, video: &Video) -> Result<Option<String>> {
        if video.privacy == VideoPrivacy::Private || !video.is_owned() {
            return Ok(None);
        }
        let channel = self.channel_actor(video)?;
        let involved = video_involved_actors(&self.ctx.db, video)?;
        let is_public = video.privacy == VideoPrivacy::Public;
        let object = self.video_document(video, &audience_for(&involved, is_public))?;
        let id = format!("{}/updates/{}", video.url, now_ms());
        self.send_to_followers(
            |aud| activity::build_update(&id, &channel, object, aud),
            &channel,
            &involved,
            &[],
            is_public,
        )
        .await
    }

    pub async fn send_delete_video(&self, video: &Video) -> Result<Option<String>> {
        if !video.is_owned() {
            return Ok(None);
        }
        let channel = self.channel_actor(video)?;
        let involved = video_involved_actors(&self.ctx.db, video)?;
        self.send_to_followers(
            |aud| activity::build_delete(&channel, &video.url, aud),
            &channel,
            &involved,
            &[],
            true,
        )
        .await
    }

    pub async fn send_announce(&self, by: &Actor, video: &Video) -> Result<Option<String>> {
        let involved = video_involved_actors(&self.ctx.db, video)?;
        self.send_video_related(|aud| activity::build_announce(by, video, aud), by, video, involved)
            .await
    }

    pub async fn send_undo_announce(&self, by: &Actor, video: &Video) -> Result<Option<String>> {
        let involved = video_involved_actors(&self.ctx.db, video)?;
        self.send_video_related(
            |aud| activity::build_undo(by, activity::build_announce(by, video, aud), aud),
            by,
            video,
            involved,
        )
        .await
    }

    /// `kind` is `Like` or `Dislike`.
    pub async fn send_rate(&self, kind: &str, by: &Actor, video: &Video) -> Result<Option<String>> {
        let involved = video_involved_actors(&self.ctx.db, video)?;
        self.send_video_related(|aud| activity::build_rate(kind, by, video, aud), by, video, involved)
            .await
    }

    pub async fn send_undo_rate(&self, kind: &str, by: &Actor, video: &Video) -> Result<Option<String>> {
        let involved = video_involved_actors(&self.ctx.db, video)?;
        self.send_video_related(
            |aud| activity::build_undo(by, activity::build_rate(kind, by, video, aud), aud),
            by,
            video,
            involved,
        )
        .await
    }

    pub async fn send_view(&self, by: &Actor, video: &Video) -> Result<Option<String>> {
        let involved = video_involved_actors(&self.ctx.db, video)?;
        let now = now_ms();
        self.send_video_related(|aud| activity::build_view(by, video, now, aud), by, video, involved)
            .await
    }

    pub async fn send_create_comment(&self, comment: &VideoComment, video: &Video) -> Result<Option<String>> {
        let author = self
            .ctx
            .db
            .load_actor_by_account(comment.account_id)?
            .ok_or_else(|| FedError::MissingLink(format!("author of {}", comment.url)))?;
        let in_reply_to = match comment.in_reply_to_comment_id {
            Some(parent_id) => self
                .ctx
                .db
                .load_comment(parent_id)?
                .map(|p| p.url)
                .ok_or_else(|| anyhow!("parent {parent_id} of {} missing", comment.url))?,
            None => video.url.clone(),
        };
        let involved = comment_involved_actors(&self.ctx.db, comment, video)?;
        let id = format!("{}/activity", comment.url);
        self.send_video_related(
            |aud| {
                let note = activity::note_object(comment, &author, &in_reply_to, aud);
                activity::build_create(&id, &author, note, aud)
            },
            &author,
            video,
            involved,
        )
        .await
    }

    /// Reports go to the video's origin only.
    pub async fn send_flag(&self, by: &Actor, video: &Video, reason: &str, abuse_url: &str) -> Result<Option<String>> {
        if video.is_owned() {
            return Ok(None);
        }
        let origin = self.channel_actor(video)?;
        let body = activity::build_flag(abuse_url, by, video, reason);
        Ok(Some(self.send_to_one(body, by, origin.delivery_inbox()).await?))
    }

    // ---- cache files ----

    fn cache_file(&self, redundancy: &VideoRedundancy, video: &Video) -> Result<Value> {
        let file = self
            .ctx
            .db
            .load_video_file(redundancy.video_file_id)?
            .ok_or_else(|| FedError::MissingLink(format!("file of redundancy {}", redundancy.url)))?;
        Ok(activity::cache_file_object(redundancy, video, &file))
    }

    pub async fn send_create_cache_file(&self, redundancy: &VideoRedundancy, video: &Video) -> Result<Option<String>> {
        let server = self.ctx.server_actor.clone();
        let object = self.cache_file(redundancy, video)?;
        let involved = video_involved_actors(&self.ctx.db, video)?;
        self.send_video_related(
            |aud| activity::build_create(&redundancy.url, &server, object, aud),
            &server,
            video,
            involved,
        )
        .await
    }

    pub async fn send_update_cache_file(&self, redundancy: &VideoRedundancy, video: &Video) -> Result<Option<String>> {
        let server = self.ctx.server_actor.clone();
        let object = self.cache_file(redundancy, video)?;
        let involved = video_involved_actors(&self.ctx.db, video)?;
        let id = format!("{}/updates/{}", redundancy.url, now_ms());
        self.send_video_related(
            |aud| activity::build_update(&id, &server, object, aud),
            &server,
            video,
            involved,
        )
        .await
    }

    /// Retracts a mirror. The file row may already be gone, so the object is rebuilt
    /// from the redundancy record alone.
    pub async fn send_undo_cache_file(&self, redundancy: &VideoRedundancy, video_url: &str, origin_inbox: Option<&str>) -> Result<Option<String>> {
        let server = self.ctx.server_actor.clone();
        let mut object = serde_json::json!({
            "id": redundancy.url,
            "type": "CacheFile",
            "object": video_url,
            "url": {"type": "Link", "mediaType": "video/mp4", "href": redundancy.file_url},
        });
        if let Some(expires) = redundancy.expires_on_ms {
            object["expires"] = Value::String(crate::model::ms_to_rfc3339(expires));
        }
        let server_only = [(*server).clone()];
        let create = activity::build_create(&redundancy.url, &server, object, &audience_from_followers_of(&server_only));
        let body = activity::build_undo(&server, create, &audience_from_followers_of(&server_only));
        match origin_inbox {
            Some(inbox) => Ok(Some(self.send_to_one(body, &server, inbox).await?)),
            None => self.send_to_followers(|_| body, &server, &server_only, &[], true).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActorType, FollowState};
    use crate::db::NewComment;
    use crate::testkit::{remote_actor, TestEnv, BASE};
    use vidfed_protocol::AS_PUBLIC;

    #[tokio::test]
    async fn public_video_broadcast_reaches_each_follower_shared_inbox() {
        let env = TestEnv::new().await;
        let a = env.local_channel("a_channel", "a");
        let b = remote_actor(&env, "https://b.example/accounts/b", ActorType::Person);
        let c = remote_actor(&env, "https://c.example/accounts/c", ActorType::Person);
        for f in [&b, &c] {
            env.ctx.db.find_or_create_follow(f.id, a.id, FollowState::Accepted, None).unwrap();
        }
        let video = env.local_video(&a, "pub-1");

        env.ctx.outbox().send_create_video(&video).await.unwrap().unwrap();

        let jobs = env.broadcasts().await;
        assert_eq!(jobs.len(), 1);
        let mut uris = jobs[0].uris.clone();
        uris.sort();
        assert_eq!(uris, vec!["https://b.example/inbox".to_string(), "https://c.example/inbox".to_string()]);
        assert_eq!(jobs[0].signature_actor_id, a.id);
        assert_eq!(jobs[0].body["to"], serde_json::json!([AS_PUBLIC]));
        assert_eq!(jobs[0].body["cc"], serde_json::json!([a.followers_url.clone().unwrap()]));
        assert_eq!(jobs[0].body["object"]["id"], serde_json::json!(video.url));
    }

    #[tokio::test]
    async fn no_job_without_followers() {
        let env = TestEnv::new().await;
        let a = env.local_channel("lonely", "l");
        let video = env.local_video(&a, "pub-2");
        assert!(env.ctx.outbox().send_create_video(&video).await.unwrap().is_none());
        assert!(env.broadcasts().await.is_empty());
    }

    #[tokio::test]
    async fn exceptions_and_server_inbox_are_excluded() {
        let env = TestEnv::new().await;
        let a = env.local_channel("ex", "ex_owner");
        let b = remote_actor(&env, "https://b.example/accounts/b", ActorType::Person);
        let c = remote_actor(&env, "https://c.example/accounts/c", ActorType::Person);
        let local_follower = env.local_account("neighbour");
        for f in [&b, &c, &local_follower] {
            env.ctx.db.find_or_create_follow(f.id, a.id, FollowState::Accepted, None).unwrap();
        }
        let inboxes = env.ctx.outbox().follower_inboxes(&[a], &[b]).unwrap();
        assert_eq!(inboxes, vec!["https://c.example/inbox".to_string()]);
    }

    #[tokio::test]
    async fn rating_a_remote_video_goes_to_its_origin() {
        let env = TestEnv::new().await;
        let channel = remote_actor(&env, "https://v.example/video-channels/ch", ActorType::Group);
        let video = env.remote_video(&channel, "https://v.example/videos/watch/r1", &[(720, 100)]);
        let me = env.local_account("fan");
        env.ctx.outbox().send_rate("Like", &me, &video).await.unwrap();
        let jobs = env.unicasts().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].uri, "https://v.example/inbox");
        assert_eq!(jobs[0].body["type"], "Like");
    }

    #[tokio::test]
    async fn undo_follow_wraps_the_stored_follow_id() {
        let env = TestEnv::new().await;
        let me = env.local_account("undoer");
        let target = remote_actor(&env, "https://t.example/accounts/t", ActorType::Person);
        let (edge, _) = env
            .ctx
            .db
            .find_or_create_follow(me.id, target.id, FollowState::Accepted, Some("https://local.example/follows/9"))
            .unwrap();

        env.ctx.outbox().send_undo_follow(&edge, &me, &target).await.unwrap();

        let jobs = env.unicasts().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].uri, target.inbox_url);
        assert_eq!(jobs[0].signature_actor_id, me.id);
        assert_eq!(jobs[0].body["type"], "Undo");
        assert_eq!(jobs[0].body["object"]["type"], "Follow");
        assert_eq!(jobs[0].body["object"]["id"], "https://local.example/follows/9");
    }

    #[tokio::test]
    async fn follow_requests_are_queued_for_local_actors_only() {
        let env = TestEnv::new().await;
        let me = env.local_account("joiner");
        let stranger = remote_actor(&env, "https://s.example/accounts/s", ActorType::Person);

        env.ctx.outbox().request_follow(&me, "chan", "v.example").await.unwrap();
        assert!(env.ctx.outbox().request_follow(&stranger, "chan", "v.example").await.is_err());

        let jobs = env.follow_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].follower_actor_id, me.id);
        assert_eq!(jobs[0].name, "chan");
        assert_eq!(jobs[0].host, "v.example");
    }

    #[tokio::test]
    async fn flags_only_travel_to_remote_origins() {
        let env = TestEnv::new().await;
        let me = env.local_account("reporter");
        let mine = env.local_video(&env.local_channel("own", "own_owner"), "own-1");
        let channel = remote_actor(&env, "https://v.example/video-channels/ch", ActorType::Group);
        let theirs = env.remote_video(&channel, "https://v.example/videos/watch/f1", &[(480, 10)]);

        assert!(env.ctx.outbox().send_flag(&me, &mine, "spam", "https://local.example/abuses/1").await.unwrap().is_none());
        env.ctx
            .outbox()
            .send_flag(&me, &theirs, "spam", "https://local.example/abuses/2")
            .await
            .unwrap()
            .unwrap();

        let jobs = env.unicasts().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].uri, "https://v.example/inbox");
        assert_eq!(jobs[0].body["type"], "Flag");
    }

    fn sorted(mut uris: Vec<String>) -> Vec<String> {
        uris.sort();
        uris
    }

    #[tokio::test]
    async fn reject_goes_to_the_follower_only() {
        let env = TestEnv::new().await;
        let channel = env.local_channel("closed", "closed_owner");
        let follower = remote_actor(&env, "https://f.example/accounts/f", ActorType::Person);
        let follow = serde_json::json!({
            "id": "https://f.example/follows/3", "type": "Follow", "actor": follower.url, "object": channel.url,
        });

        env.ctx.outbox().send_reject(&channel, &follower, &follow).await.unwrap();

        let jobs = env.unicasts().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].uri, follower.inbox_url);
        assert_eq!(jobs[0].signature_actor_id, channel.id);
        assert_eq!(jobs[0].body["type"], "Reject");
        assert_eq!(jobs[0].body["object"]["id"], "https://f.example/follows/3");
    }

    #[tokio::test]
    async fn video_update_and_delete_reach_channel_followers() {
        let env = TestEnv::new().await;
        let channel = env.local_channel("news", "news_owner");
        let b = remote_actor(&env, "https://b.example/accounts/b", ActorType::Person);
        env.ctx.db.find_or_create_follow(b.id, channel.id, FollowState::Accepted, None).unwrap();
        let video = env.local_video(&channel, "upd-1");

        env.ctx.outbox().send_update_video(&video).await.unwrap().unwrap();
        env.ctx.outbox().send_delete_video(&video).await.unwrap().unwrap();

        let jobs = env.broadcasts().await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].uris, vec!["https://b.example/inbox".to_string()]);
        assert_eq!(jobs[0].body["type"], "Update");
        assert_eq!(jobs[0].body["object"]["id"], serde_json::json!(video.url));
        assert_eq!(jobs[1].uris, vec!["https://b.example/inbox".to_string()]);
        assert_eq!(jobs[1].body["type"], "Delete");
        assert_eq!(jobs[1].body["object"], serde_json::json!(video.url));
        assert!(jobs.iter().all(|j| j.signature_actor_id == channel.id));
    }

    #[tokio::test]
    async fn announce_and_its_undo_reach_channel_and_sharer_followers() {
        let env = TestEnv::new().await;
        let channel = env.local_channel("shows", "shows_owner");
        let me = env.local_account("sharer");
        let b = remote_actor(&env, "https://b.example/accounts/b", ActorType::Person);
        let c = remote_actor(&env, "https://c.example/accounts/c", ActorType::Person);
        env.ctx.db.find_or_create_follow(b.id, channel.id, FollowState::Accepted, None).unwrap();
        env.ctx.db.find_or_create_follow(c.id, me.id, FollowState::Accepted, None).unwrap();
        let video = env.local_video(&channel, "ann-1");

        env.ctx.outbox().send_announce(&me, &video).await.unwrap().unwrap();
        env.ctx.outbox().send_undo_announce(&me, &video).await.unwrap().unwrap();

        let jobs = env.broadcasts().await;
        assert_eq!(jobs.len(), 2);
        let both = vec!["https://b.example/inbox".to_string(), "https://c.example/inbox".to_string()];
        assert_eq!(sorted(jobs[0].uris.clone()), both);
        assert_eq!(jobs[0].signature_actor_id, me.id);
        assert_eq!(jobs[0].body["type"], "Announce");
        assert_eq!(jobs[0].body["object"], serde_json::json!(video.url));
        assert_eq!(sorted(jobs[1].uris.clone()), both);
        assert_eq!(jobs[1].body["type"], "Undo");
        assert_eq!(jobs[1].body["object"]["type"], "Announce");
        assert_eq!(jobs[1].body["object"]["id"], jobs[0].body["id"]);
    }

    #[tokio::test]
    async fn undo_rate_and_view_of_remote_video_go_to_its_origin() {
        let env = TestEnv::new().await;
        let channel = remote_actor(&env, "https://v.example/video-channels/ch", ActorType::Group);
        let video = env.remote_video(&channel, "https://v.example/videos/watch/uv", &[(720, 100)]);
        let me = env.local_account("viewer");

        env.ctx.outbox().send_undo_rate("Dislike", &me, &video).await.unwrap().unwrap();
        env.ctx.outbox().send_view(&me, &video).await.unwrap().unwrap();

        let jobs = env.unicasts().await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.uri == "https://v.example/inbox" && j.signature_actor_id == me.id));
        assert_eq!(jobs[0].body["type"], "Undo");
        assert_eq!(jobs[0].body["object"]["type"], "Dislike");
        assert_eq!(jobs[0].body["object"]["object"], serde_json::json!(video.url));
        assert_eq!(jobs[1].body["type"], "View");
        assert_eq!(jobs[1].body["object"], serde_json::json!(video.url));
    }

    #[tokio::test]
    async fn reply_on_remote_video_names_its_parent() {
        let env = TestEnv::new().await;
        let channel = remote_actor(&env, "https://v.example/video-channels/ch", ActorType::Group);
        let video = env.remote_video(&channel, "https://v.example/videos/watch/cm", &[(720, 100)]);
        let author = remote_actor(&env, "https://v.example/accounts/alice", ActorType::Person);
        let me = env.local_account("replier");
        let db = &env.ctx.db;
        let parent_url = "https://v.example/comments/1";
        let (parent, _) = db
            .insert_comment_chain(
                video.id,
                None,
                &[NewComment { url: parent_url.into(), text: "first".into(), account_id: author.account_id.unwrap() }],
            )
            .unwrap()
            .remove(0);
        let (reply, _) = db
            .insert_comment_chain(
                video.id,
                Some(&parent),
                &[NewComment { url: format!("{BASE}/comments/2"), text: "reply".into(), account_id: me.account_id.unwrap() }],
            )
            .unwrap()
            .remove(0);

        env.ctx.outbox().send_create_comment(&reply, &video).await.unwrap().unwrap();

        let jobs = env.unicasts().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].uri, "https://v.example/inbox");
        assert_eq!(jobs[0].signature_actor_id, me.id);
        assert_eq!(jobs[0].body["type"], "Create");
        assert_eq!(jobs[0].body["object"]["type"], "Note");
        assert_eq!(jobs[0].body["object"]["id"], serde_json::json!(reply.url));
        assert_eq!(jobs[0].body["object"]["inReplyTo"], parent_url);
        assert_eq!(jobs[0].body["object"]["attributedTo"], serde_json::json!(me.url));
    }
}
