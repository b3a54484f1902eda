/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::activity::actor_of;
use crate::context::FedContext;
use crate::directory::ResolveOptions;
use crate::error::FedError;
use crate::inbox::{InboxBatch, Sender};
use crate::model::{host_of, RateType, Video};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};
use vidfed_protocol::{CollectionDoc, FetchPayload, FetchType, PageRef};

/// Pages walked per crawl before giving up on a collection.
pub const FETCH_PAGE_LIMIT: usize = 2000;

/// Receives the items of one collection page.
#[async_trait]
pub trait PageHandler: Send {
    async fn handle(&mut self, items: Vec<Value>) -> Result<()>;
}

pub struct Crawler<'a> {
    ctx: &'a FedContext,
}

impl<'a> Crawler<'a> {
    pub fn new(ctx: &'a FedContext) -> Self {
        Self { ctx }
    }

    /// Walks `start_url` page by page. A failed page fetch aborts the walk; pages
    /// already handed to `handler` stay applied. Returns the number of pages seen.
    pub async fn crawl(&self, start_url: &str, page_limit: usize, handler: &mut dyn PageHandler) -> Result<usize> {
        let Some(mut start) = self.fetch_page(start_url).await? else {
            return Ok(0);
        };
        let mut current = match start.first.take() {
            Some(first) => self.follow(first).await?,
            None => Some(start),
        };

        let mut pages = 0usize;
        while let Some(mut page) = current {
            if let Some(items) = page.take_items().filter(|i| !i.is_empty()) {
                handler.handle(items).await?;
            }
            pages += 1;
            if pages >= page_limit {
                info!("crawl of {start_url} stopped after {pages} pages");
                break;
            }
            current = match page.next.take() {
                Some(next) => self.follow(next).await?,
                None => None,
            };
        }
        debug!(pages, "crawled {start_url}");
        Ok(pages)
    }

    async fn follow(&self, page: PageRef) -> Result<Option<CollectionDoc>> {
        match page {
            PageRef::Url(url) => self.fetch_page(&url).await,
            PageRef::Page(p) => Ok(Some(*p)),
        }
    }

    /// None for pages on our own host, which are never fetched.
    async fn fetch_page(&self, url: &str) -> Result<Option<CollectionDoc>> {
        if self.ctx.is_local_url(url) {
            debug!("not crawling local page {url}");
            return Ok(None);
        }
        let value = self
            .ctx
            .fetcher
            .fetch_object(url)
            .await
            .with_context(|| format!("fetch collection page {url}"))?;
        let doc: CollectionDoc =
            serde_json::from_value(value).map_err(|e| FedError::Invalid(format!("collection {url}: {e}")))?;
        Ok(Some(doc))
    }

    /// Runs one queued fetch job to completion.
    pub async fn run_fetch_job(&self, payload: &FetchPayload) -> Result<usize> {
        let video = match payload.video_id {
            Some(id) => Some(
                self.ctx
                    .db
                    .load_video(id)?
                    .ok_or_else(|| FedError::MissingLink(format!("video {id} for {}", payload.uri)))?,
            ),
            None => None,
        };
        let need_video = || {
            video
                .clone()
                .ok_or_else(|| FedError::MissingLink(format!("fetch of {} without video", payload.uri)))
        };

        match payload.fetch_type {
            FetchType::Activity => {
                let outbox_host = host_of(&payload.uri)
                    .ok_or_else(|| FedError::Invalid(format!("outbox url {}", payload.uri)))?;
                let mut handler = OutboxPages { ctx: self.ctx, outbox_host };
                self.crawl(&payload.uri, FETCH_PAGE_LIMIT, &mut handler).await
            }
            FetchType::VideoLikes | FetchType::VideoDislikes => {
                let rate = if payload.fetch_type == FetchType::VideoLikes {
                    RateType::Like
                } else {
                    RateType::Dislike
                };
                let mut handler = RatePages {
                    ctx: self.ctx,
                    video: need_video()?,
                    rate,
                };
                self.crawl(&payload.uri, FETCH_PAGE_LIMIT, &mut handler).await
            }
            FetchType::VideoShares => {
                let mut handler = SharePages {
                    ctx: self.ctx,
                    video: need_video()?,
                };
                self.crawl(&payload.uri, FETCH_PAGE_LIMIT, &mut handler).await
            }
            FetchType::VideoComments => {
                let mut handler = CommentPages { ctx: self.ctx };
                self.crawl(&payload.uri, FETCH_PAGE_LIMIT, &mut handler).await
            }
        }
    }
}

fn item_url(item: &Value) -> Option<&str> {
    match item {
        Value::String(s) => Some(s),
        Value::Object(m) => m.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// Outbox items go through the inbound processor as crawled activities.
struct OutboxPages<'a> {
    ctx: &'a FedContext,
    outbox_host: String,
}

#[async_trait]
impl PageHandler for OutboxPages<'_> {
    async fn handle(&mut self, items: Vec<Value>) -> Result<()> {
        let mut activities = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(url) => match self.ctx.fetcher.fetch_object(&url).await {
                    Ok(v) => activities.push(v),
                    Err(e) => warn!("cannot fetch outbox item {url}: {e:#}"),
                },
                other => activities.push(other),
            }
        }
        let batch = InboxBatch {
            activities,
            sender: Sender::Crawled {
                outbox_host: self.outbox_host.clone(),
            },
            inbox_actor: None,
        };
        let report = self.ctx.inbox().process_batch(batch).await;
        debug!(processed = report.processed, failed = report.failed, "outbox page applied");
        Ok(())
    }
}

/// Like/dislike collections list rating actors, or the rate activities themselves.
struct RatePages<'a> {
    ctx: &'a FedContext,
    video: Video,
    rate: RateType,
}

#[async_trait]
impl PageHandler for RatePages<'_> {
    async fn handle(&mut self, items: Vec<Value>) -> Result<()> {
        let mut added = 0usize;
        for item in items {
            let (actor_url, rate_url) = match &item {
                Value::String(s) => (Some(s.clone()), None),
                Value::Object(_) => (actor_of(&item), item_url(&item).map(str::to_string)),
                _ => (None, None),
            };
            let Some(actor_url) = actor_url else {
                debug!("skipping rate item without actor on {}", self.video.url);
                continue;
            };
            let res = async {
                let actor = self
                    .ctx
                    .directory()
                    .resolve(&actor_url, ResolveOptions::default())
                    .await?;
                let account_id = actor
                    .account_id
                    .ok_or_else(|| FedError::MissingLink(format!("account of {actor_url}")))?;
                self.ctx
                    .db
                    .upsert_rate(account_id, self.video.id, self.rate, rate_url.as_deref())
            }
            .await;
            match res {
                Ok(change) if change.is_new() => added += 1,
                Ok(_) => {}
                Err(e) => warn!("cannot add {} of {actor_url} on {}: {e:#}", self.rate.as_str(), self.video.url),
            }
        }
        info!("added {added} {}s to video {}", self.rate.as_str(), self.video.uuid);
        Ok(())
    }
}

/// Share collections list Announce urls; each one is fetched for its actor.
struct SharePages<'a> {
    ctx: &'a FedContext,
    video: Video,
}

#[async_trait]
impl PageHandler for SharePages<'_> {
    async fn handle(&mut self, items: Vec<Value>) -> Result<()> {
        for item in items {
            let Some(share_url) = item_url(&item).map(str::to_string) else {
                continue;
            };
            let res = async {
                let body = match item {
                    Value::Object(_) if actor_of(&item).is_some() => item,
                    _ => self.ctx.fetcher.fetch_object(&share_url).await?,
                };
                let actor_url = actor_of(&body)
                    .ok_or_else(|| FedError::Invalid(format!("share {share_url} without actor")))?;
                let actor = self
                    .ctx
                    .directory()
                    .resolve(&actor_url, ResolveOptions::default())
                    .await?;
                self.ctx.db.insert_share(actor.id, self.video.id, &share_url)
            }
            .await;
            if let Err(e) = res {
                warn!("cannot add remote share {share_url}, skipping: {e:#}");
            }
        }
        Ok(())
    }
}

struct CommentPages<'a> {
    ctx: &'a FedContext,
}

#[async_trait]
impl PageHandler for CommentPages<'_> {
    async fn handle(&mut self, items: Vec<Value>) -> Result<()> {
        for item in items {
            let Some(url) = item_url(&item) else { continue };
            if let Err(e) = self.ctx.threads().resolve_thread(url, Vec::new()).await {
                warn!("cannot resolve comment thread {url}: {e:#}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActorType;
    use crate::testkit::{actor_doc, remote_actor, TestEnv};
    use serde_json::json;

    #[derive(Default)]
    struct Collect(Vec<Value>);

    #[async_trait]
    impl PageHandler for Collect {
        async fn handle(&mut self, items: Vec<Value>) -> Result<()> {
            self.0.extend(items);
            Ok(())
        }
    }

    fn serve_pages(env: &TestEnv, base: &str, pages: usize) {
        env.fetcher.put(
            base,
            json!({"id": base, "type": "OrderedCollection", "totalItems": pages, "first": format!("{base}?page=1")}),
        );
        for i in 1..=pages {
            let mut page = json!({
                "id": format!("{base}?page={i}"),
                "type": "OrderedCollectionPage",
                "partOf": base,
                "orderedItems": [format!("item-{i}")],
            });
            if i < pages {
                page["next"] = json!(format!("{base}?page={}", i + 1));
            }
            env.fetcher.put(&format!("{base}?page={i}"), page);
        }
    }

    #[tokio::test]
    async fn follows_next_links_until_the_end() {
        let env = TestEnv::new().await;
        let base = "https://peer.example/accounts/bob/outbox";
        serve_pages(&env, base, 3);
        let mut sink = Collect::default();
        let pages = env.ctx.crawler().crawl(base, FETCH_PAGE_LIMIT, &mut sink).await.unwrap();
        assert_eq!(pages, 3);
        assert_eq!(sink.0, vec![json!("item-1"), json!("item-2"), json!("item-3")]);
    }

    #[tokio::test]
    async fn stops_at_page_limit_without_fetching_further() {
        let env = TestEnv::new().await;
        let base = "https://peer.example/c";
        serve_pages(&env, base, 5);
        let mut sink = Collect::default();
        let pages = env.ctx.crawler().crawl(base, 2, &mut sink).await.unwrap();
        assert_eq!(pages, 2);
        assert_eq!(sink.0.len(), 2);
        assert!(!env.fetcher.calls().contains(&format!("{base}?page=3")));
    }

    #[tokio::test]
    async fn page_failure_aborts_but_keeps_applied_pages() {
        let env = TestEnv::new().await;
        let base = "https://peer.example/broken";
        env.fetcher.put(
            base,
            json!({"type": "OrderedCollection", "first": {"type": "OrderedCollectionPage", "orderedItems": ["a"], "next": format!("{base}?page=2")}}),
        );
        let mut sink = Collect::default();
        assert!(env.ctx.crawler().crawl(base, 10, &mut sink).await.is_err());
        assert_eq!(sink.0, vec![json!("a")]);
    }

    #[tokio::test]
    async fn local_pages_are_not_fetched() {
        let env = TestEnv::new().await;
        let mut sink = Collect::default();
        let pages = env
            .ctx
            .crawler()
            .crawl("https://local.example/accounts/a/outbox", 10, &mut sink)
            .await
            .unwrap();
        assert_eq!(pages, 0);
        assert!(env.fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn like_backfill_is_idempotent() {
        let env = TestEnv::new().await;
        let channel = remote_actor(&env, "https://peer.example/video-channels/ch", ActorType::Group);
        let video = env.remote_video(&channel, "https://peer.example/videos/watch/bf", &[(720, 10)]);
        let fan = "https://fans.example/accounts/f";
        env.fetcher.put(fan, actor_doc(fan, ActorType::Person));
        let likes = format!("{}/likes", video.url);
        env.fetcher.put(
            &likes,
            json!({"type": "OrderedCollection", "first": {"type": "OrderedCollectionPage", "orderedItems": [fan]}}),
        );
        let job = FetchPayload {
            uri: likes,
            fetch_type: FetchType::VideoLikes,
            video_id: Some(video.id),
        };
        env.ctx.crawler().run_fetch_job(&job).await.unwrap();
        env.ctx.crawler().run_fetch_job(&job).await.unwrap();
        assert_eq!(env.ctx.db.load_video(video.id).unwrap().unwrap().likes, 1);
    }

    #[tokio::test]
    async fn share_backfill_fetches_each_announce() {
        let env = TestEnv::new().await;
        let channel = remote_actor(&env, "https://peer.example/video-channels/ch", ActorType::Group);
        let video = env.remote_video(&channel, "https://peer.example/videos/watch/sh", &[(720, 10)]);
        let sharer = "https://fans.example/accounts/s";
        env.fetcher.put(sharer, actor_doc(sharer, ActorType::Person));
        let announce = "https://fans.example/announces/1";
        env.fetcher.put(announce, json!({"id": announce, "type": "Announce", "actor": sharer, "object": video.url}));
        let shares = format!("{}/announces", video.url);
        env.fetcher.put(&shares, json!({"type": "OrderedCollection", "orderedItems": [announce]}));

        let job = FetchPayload {
            uri: shares,
            fetch_type: FetchType::VideoShares,
            video_id: Some(video.id),
        };
        env.ctx.crawler().run_fetch_job(&job).await.unwrap();
        let sharers = env.ctx.db.list_sharer_actors(video.id).unwrap();
        assert_eq!(sharers.len(), 1);
        assert_eq!(sharers[0].url, sharer);
    }
}
