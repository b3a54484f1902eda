/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::context::FedContext;
use crate::error::{is_gone, FedError};
use crate::model::{host_of, now_ms, same_host, Actor, ActorFields, ActorType};
use anyhow::{Context, Result};
use futures_util::future::{BoxFuture, FutureExt};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info, warn};
use vidfed_protocol::{ActorDocument, FetchPayload, FetchType, JobPayload};

/// Owner resolution of a channel is the only nested lookup; it never nests again.
pub const MAX_OWNER_DEPTH: u8 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    pub depth: u8,
    /// Queue an outbox crawl when the actor was created or refreshed.
    pub sync_collections: bool,
}

impl ResolveOptions {
    pub fn synced(sync_collections: bool) -> Self {
        Self {
            depth: 0,
            sync_collections,
        }
    }
}

#[derive(Debug)]
pub enum Freshness {
    Fresh(Actor),
    Refreshed(Actor),
    Gone,
}

pub struct ActorDirectory<'a> {
    ctx: &'a FedContext,
}

impl<'a> ActorDirectory<'a> {
    pub fn new(ctx: &'a FedContext) -> Self {
        Self { ctx }
    }

    /// Local row for `actor_url`, fetched and created when unknown, refreshed when outdated.
    pub async fn resolve(&self, actor_url: &str, opts: ResolveOptions) -> Result<Actor> {
        self.resolve_boxed(actor_url.to_string(), opts).await
    }

    fn resolve_boxed(&self, actor_url: String, opts: ResolveOptions) -> BoxFuture<'_, Result<Actor>> {
        async move {
            let db = &self.ctx.db;
            let mut existing = db.load_actor_by_url(&actor_url)?;
            if let Some(actor) = existing.as_ref().filter(|a| a.is_orphan()) {
                warn!("purging orphan actor row {}", actor.url);
                db.delete_actor(actor.id)?;
                existing = None;
            }

            let (actor, created) = match existing {
                Some(actor) => (actor, false),
                None => {
                    if self.ctx.is_local_url(&actor_url) {
                        return Err(FedError::MissingLink(format!("local actor {actor_url}")).into());
                    }
                    let doc = self.fetch_actor_document(&actor_url).await?;
                    let fields = actor_fields(&doc)?;
                    let owner_account_id = match fields.kind {
                        ActorType::Group => Some(self.resolve_owner(&doc, &actor_url, opts).await?),
                        _ => None,
                    };
                    let host = host_of(&fields.url)
                        .ok_or_else(|| FedError::Invalid(format!("actor url {}", fields.url)))?;
                    let avatar_name = fields.avatar_url.as_ref().map(|_| avatar_file_name(&doc));
                    let (actor, created) =
                        db.insert_remote_actor(&fields, &host, owner_account_id, avatar_name.as_deref())?;
                    if created {
                        info!("created remote actor {}", actor.url);
                    }
                    (actor, created)
                }
            };

            let (actor, refreshed) = match self.refresh_if_outdated(actor).await? {
                Freshness::Fresh(a) => (a, false),
                Freshness::Refreshed(a) => (a, true),
                Freshness::Gone => return Err(FedError::Gone(actor_url).into()),
            };

            if (created || refreshed) && opts.sync_collections {
                if let Err(e) = self.schedule_outbox_crawl(&actor).await {
                    warn!("cannot schedule outbox crawl of {}: {e:#}", actor.url);
                }
            }
            Ok(actor)
        }
        .boxed()
    }

    async fn resolve_owner(&self, doc: &ActorDocument, actor_url: &str, opts: ResolveOptions) -> Result<i64> {
        if opts.depth >= MAX_OWNER_DEPTH {
            return Err(FedError::RecursionLimit(format!("owner of {actor_url}")).into());
        }
        let owner_url = doc
            .attributed_to
            .clone()
            .map(|a| a.into_vec())
            .unwrap_or_default()
            .into_iter()
            .find(|a| a.kind() == Some("Person"))
            .map(|a| a.id().to_string())
            .ok_or_else(|| FedError::MissingLink(format!("owner account of channel {actor_url}")))?;
        if !same_host(&owner_url, actor_url) {
            return Err(FedError::Invalid(format!("owner {owner_url} not on the host of {actor_url}")).into());
        }
        let owner = self
            .resolve_boxed(
                owner_url.clone(),
                ResolveOptions {
                    depth: opts.depth + 1,
                    sync_collections: false,
                },
            )
            .await
            .with_context(|| format!("resolve owner {owner_url} of {actor_url}"))?;
        owner
            .account_id
            .ok_or_else(|| FedError::MissingLink(format!("account of {owner_url}")).into())
    }

    pub async fn resolve_by_handle(&self, name: &str, host: &str, opts: ResolveOptions) -> Result<Actor> {
        let url = self
            .ctx
            .webfinger
            .resolve(name, host)
            .await
            .with_context(|| format!("webfinger {name}@{host}"))?;
        self.resolve(&url, opts).await
    }

    /// Signer of an inbound request, from its `keyId`.
    pub async fn resolve_signer(&self, key_id: &str) -> Result<Actor> {
        let url = key_id.split('#').next().unwrap_or(key_id);
        self.resolve(url, ResolveOptions::default()).await
    }

    pub async fn refresh_if_outdated(&self, actor: Actor) -> Result<Freshness> {
        if actor.is_local() || !actor.is_outdated(self.ctx.cfg.actor_refresh_interval(), now_ms()) {
            return Ok(Freshness::Fresh(actor));
        }
        self.refresh(actor).await
    }

    /// Re-reads a remote actor. A 404/410 deletes it; other failures keep the stale row.
    pub async fn refresh(&self, actor: Actor) -> Result<Freshness> {
        if actor.is_local() {
            return Ok(Freshness::Fresh(actor));
        }
        let host = actor.host().unwrap_or_default();
        let url = match self.ctx.webfinger.resolve(&actor.preferred_username, &host).await {
            Ok(url) => url,
            Err(e) => {
                debug!("webfinger failed for {}, keeping stored url: {e:#}", actor.url);
                actor.url.clone()
            }
        };

        let doc = match self.fetch_actor_document(&url).await {
            Ok(doc) => doc,
            Err(e) if is_gone(&e) => {
                info!("deleting actor {} gone on refresh", actor.url);
                self.ctx.db.delete_actor(actor.id)?;
                return Ok(Freshness::Gone);
            }
            Err(e) => {
                warn!("cannot refresh actor {}: {e:#}", actor.url);
                return Ok(Freshness::Fresh(actor));
            }
        };
        let fields = match actor_fields(&doc) {
            Ok(f) if f.url == actor.url => f,
            Ok(f) => {
                warn!("actor {} now answers as {}, keeping stored row", actor.url, f.url);
                return Ok(Freshness::Fresh(actor));
            }
            Err(e) => {
                warn!("refreshed actor {} is invalid: {e:#}", actor.url);
                return Ok(Freshness::Fresh(actor));
            }
        };

        let avatar_name = if fields.avatar_url == actor.avatar_url {
            actor.avatar_name.clone()
        } else {
            fields.avatar_url.as_ref().map(|_| avatar_file_name(&doc))
        };
        let updated = self
            .ctx
            .db
            .update_remote_actor(actor.id, &fields, avatar_name.as_deref())?;
        debug!("refreshed actor {}", updated.url);
        Ok(Freshness::Refreshed(updated))
    }

    /// Queues a crawl of the actor's outbox. Returns false when there is nothing to crawl.
    pub async fn schedule_outbox_crawl(&self, actor: &Actor) -> Result<bool> {
        if actor.id == self.ctx.server_actor.id {
            return Err(FedError::OwnOutbox.into());
        }
        if actor.is_local() {
            return Ok(false);
        }
        let Some(outbox) = actor.outbox_url.clone() else {
            return Ok(false);
        };
        self.ctx
            .queue
            .enqueue(JobPayload::Fetch(FetchPayload {
                uri: outbox,
                fetch_type: FetchType::Activity,
                video_id: None,
            }))
            .await?;
        Ok(true)
    }

    async fn fetch_actor_document(&self, url: &str) -> Result<ActorDocument> {
        let value = self.ctx.fetcher.fetch_object(url).await?;
        let doc: ActorDocument =
            serde_json::from_value(value).map_err(|e| FedError::Invalid(format!("actor {url}: {e}")))?;
        if !same_host(&doc.id, url) {
            return Err(FedError::Invalid(format!("actor id {} not on the host of {url}", doc.id)).into());
        }
        Ok(doc)
    }
}

/// Validates a remote actor document and extracts its stored attributes.
pub fn actor_fields(doc: &ActorDocument) -> Result<ActorFields> {
    let kind = ActorType::parse(&doc.kind).ok_or_else(|| FedError::Unsupported(format!("actor type {}", doc.kind)))?;
    let preferred_username = doc
        .preferred_username
        .clone()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| FedError::Invalid(format!("actor {} without preferredUsername", doc.id)))?;
    let public_key = doc
        .public_key
        .as_ref()
        .ok_or_else(|| FedError::Invalid(format!("actor {} without publicKey", doc.id)))?;
    if doc.inbox.trim().is_empty() {
        return Err(FedError::Invalid(format!("actor {} without inbox", doc.id)).into());
    }
    let display_name = doc.name.clone().unwrap_or_else(|| preferred_username.clone());
    Ok(ActorFields {
        url: doc.id.clone(),
        kind,
        preferred_username,
        display_name,
        summary: doc.summary.clone(),
        public_key_pem: public_key.public_key_pem.clone(),
        inbox_url: doc.inbox.clone(),
        shared_inbox_url: doc.endpoints.as_ref().and_then(|e| e.shared_inbox.clone()),
        outbox_url: doc.outbox.clone(),
        followers_url: doc.followers.clone(),
        following_url: doc.following.clone(),
        avatar_url: avatar_of(doc).map(|(url, _)| url),
    })
}

fn avatar_of(doc: &ActorDocument) -> Option<(String, &'static str)> {
    let icon = doc.icon.as_ref()?.first()?;
    let ext = match icon.media_type.as_deref()? {
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        _ => return None,
    };
    if !icon.url.starts_with("http://") && !icon.url.starts_with("https://") {
        return None;
    }
    Some((icon.url.clone(), ext))
}

/// Fresh random filename for a remote avatar.
fn avatar_file_name(doc: &ActorDocument) -> String {
    let ext = avatar_of(doc).map(|(_, ext)| ext).unwrap_or("");
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    format!("{}{ext}", hex::encode(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{actor_doc, remote_actor, TestEnv};
    use serde_json::json;

    #[tokio::test]
    async fn concurrent_resolution_yields_one_row() {
        let env = TestEnv::new().await;
        let url = "https://peer.example/accounts/bob";
        env.fetcher.put(url, actor_doc(url, ActorType::Person));
        let dir = env.ctx.directory();
        let (a, b) = tokio::join!(
            dir.resolve(url, ResolveOptions::default()),
            dir.resolve(url, ResolveOptions::default())
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id, b.id);
        assert!(a.account_id.is_some());
        assert_eq!(a.shared_inbox_url.as_deref(), Some("https://peer.example/inbox"));
    }

    #[tokio::test]
    async fn channel_resolution_pulls_in_owner() {
        let env = TestEnv::new().await;
        let owner = "https://peer.example/accounts/bob";
        let channel = "https://peer.example/video-channels/bob_ch";
        env.fetcher.put(owner, actor_doc(owner, ActorType::Person));
        env.fetcher.put(channel, actor_doc(channel, ActorType::Group));

        let ch = env.ctx.directory().resolve(channel, ResolveOptions::synced(true)).await.unwrap();
        assert!(ch.channel_id.is_some());
        let owner_row = env.ctx.db.load_actor_by_url(owner).unwrap().unwrap();
        let chan = env.ctx.db.load_channel(ch.channel_id.unwrap()).unwrap().unwrap();
        assert_eq!(Some(chan.account_id), owner_row.account_id);

        // only the channel was resolved with collection sync
        let crawls = env.fetch_jobs().await;
        assert_eq!(crawls.len(), 1);
        assert_eq!(crawls[0].uri, format!("{channel}/outbox"));
    }

    #[tokio::test]
    async fn channel_with_foreign_owner_is_rejected() {
        let env = TestEnv::new().await;
        let channel = "https://peer.example/video-channels/evil";
        let mut doc = actor_doc(channel, ActorType::Group);
        doc["attributedTo"] = json!([{"type": "Person", "id": "https://other.example/accounts/x"}]);
        env.fetcher.put(channel, doc);

        let err = env.ctx.directory().resolve(channel, ResolveOptions::default()).await.unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(FedError::Invalid(_))));
        assert!(env.ctx.db.load_actor_by_url(channel).unwrap().is_none());
    }

    #[tokio::test]
    async fn owner_lookup_respects_depth_ceiling() {
        let env = TestEnv::new().await;
        let channel = "https://peer.example/video-channels/deep";
        env.fetcher.put(channel, actor_doc(channel, ActorType::Group));
        let opts = ResolveOptions {
            depth: MAX_OWNER_DEPTH,
            sync_collections: false,
        };
        let err = env.ctx.directory().resolve(channel, opts).await.unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(FedError::RecursionLimit(_))));
    }

    #[tokio::test]
    async fn outdated_actor_gone_on_refresh_is_deleted() {
        let env = TestEnv::new().await;
        let actor = remote_actor(&env, "https://peer.example/accounts/old", ActorType::Person);
        env.ctx.db.set_actor_updated_at(actor.id, 0).unwrap();
        env.fetcher.gone(&actor.url);

        let res = env.ctx.directory().refresh_if_outdated(actor.clone()).await.unwrap();
        assert!(matches!(res, Freshness::Gone));
        assert!(env.ctx.db.load_actor(actor.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn outdated_actor_is_replaced_from_document() {
        let env = TestEnv::new().await;
        let actor = remote_actor(&env, "https://peer.example/accounts/moved", ActorType::Person);
        env.ctx.db.set_actor_updated_at(actor.id, 0).unwrap();
        let mut doc = actor_doc(&actor.url, ActorType::Person);
        doc["inbox"] = json!("https://peer.example/accounts/moved/inbox2");
        doc["name"] = json!("Renamed");
        env.fetcher.put(&actor.url, doc);

        let Freshness::Refreshed(updated) = env.ctx.directory().refresh_if_outdated(actor).await.unwrap() else {
            panic!("expected refresh");
        };
        assert_eq!(updated.inbox_url, "https://peer.example/accounts/moved/inbox2");
        assert!(updated.updated_at_ms > 0);
        let account = env.ctx.db.load_account(updated.account_id.unwrap()).unwrap().unwrap();
        assert_eq!(account.name, "Renamed");
    }

    #[tokio::test]
    async fn own_outbox_is_never_crawled() {
        let env = TestEnv::new().await;
        let err = env
            .ctx
            .directory()
            .schedule_outbox_crawl(&env.ctx.server_actor)
            .await
            .unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(FedError::OwnOutbox)));
    }
}
