/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::context::FedContext;
use crate::db::FedDb;
use crate::directory::ResolveOptions;
use crate::error::{is_gone, FedError};
use crate::model::{
    now_ms, parse_duration_secs, rfc3339_to_ms, same_host, Video, VideoFileFields, VideoFields, VideoPrivacy,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vidfed_protocol::{FetchPayload, FetchType, JobPayload, VideoObject};

/// View-count storage.
#[async_trait]
pub trait ViewCounter: Send + Sync {
    async fn add_view(&self, video: &Video) -> Result<()>;
}

pub struct DbViewCounter {
    db: Arc<FedDb>,
}

impl DbViewCounter {
    pub fn new(db: Arc<FedDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ViewCounter for DbViewCounter {
    async fn add_view(&self, video: &Video) -> Result<()> {
        self.db.add_views(video.id, 1)
    }
}

#[derive(Debug)]
pub enum VideoState {
    Present(Video),
    Gone,
}

pub struct VideoResolver<'a> {
    ctx: &'a FedContext,
}

impl<'a> VideoResolver<'a> {
    pub fn new(ctx: &'a FedContext) -> Self {
        Self { ctx }
    }

    /// Local row for `video_url`, fetched and created when unknown.
    pub async fn get_or_create(&self, video_url: &str) -> Result<(Video, bool)> {
        if let Some(video) = self.ctx.db.load_video_by_url(video_url)? {
            return match self.refresh(video, false).await? {
                VideoState::Present(v) => Ok((v, false)),
                VideoState::Gone => Err(FedError::Gone(video_url.to_string()).into()),
            };
        }
        if self.ctx.is_local_url(video_url) {
            return Err(FedError::MissingLink(format!("local video {video_url}")).into());
        }

        let object = self.fetch_video_object(video_url).await?;
        let fields = video_fields(&object)?;
        let channel_url = object
            .attributed_to
            .clone()
            .into_vec()
            .into_iter()
            .find(|a| a.kind() == Some("Group"))
            .map(|a| a.id().to_string())
            .ok_or_else(|| FedError::Invalid(format!("video {video_url} has no channel")))?;
        if !same_host(&channel_url, &object.id) {
            return Err(FedError::Invalid(format!("channel {channel_url} not on the host of {}", object.id)).into());
        }
        let channel = self
            .ctx
            .directory()
            .resolve(&channel_url, ResolveOptions::synced(self.ctx.cfg.sync_collections()))
            .await
            .with_context(|| format!("resolve channel of {video_url}"))?;
        let channel_id = channel
            .channel_id
            .ok_or_else(|| FedError::MissingLink(format!("channel row of {}", channel.url)))?;

        let (video, created) = self.ctx.db.insert_video(&fields, channel_id, true)?;
        if created {
            info!("created remote video {}", video.url);
            if self.ctx.cfg.sync_collections() {
                self.schedule_backfill(&video, &object).await;
            }
        }
        Ok((video, created))
    }

    /// Re-reads a remote video when outdated (or always with `force`).
    /// A 404/410 deletes it locally; other fetch failures keep the stale row.
    pub async fn refresh(&self, video: Video, force: bool) -> Result<VideoState> {
        if video.is_owned() {
            return Ok(VideoState::Present(video));
        }
        if !force && !video.is_outdated(self.ctx.cfg.video_refresh_interval(), now_ms()) {
            return Ok(VideoState::Present(video));
        }
        let object = match self.fetch_video_object(&video.url).await {
            Ok(o) => o,
            Err(e) if is_gone(&e) => {
                info!("deleting video {} gone on refresh", video.url);
                self.ctx.db.delete_video(video.id)?;
                return Ok(VideoState::Gone);
            }
            Err(e) => {
                warn!("cannot refresh video {}: {e:#}", video.url);
                return Ok(VideoState::Present(video));
            }
        };
        match video_fields(&object) {
            Ok(fields) => Ok(VideoState::Present(self.ctx.db.update_video(video.id, &fields)?)),
            Err(e) => {
                warn!("refreshed video {} is invalid: {e:#}", video.url);
                Ok(VideoState::Present(video))
            }
        }
    }

    /// Applies an `Update(Video)` body.
    pub fn update_from_object(&self, video: &Video, object: &VideoObject) -> Result<Video> {
        if object.id != video.url {
            return Err(FedError::Invalid(format!("update for {} carries {}", video.url, object.id)).into());
        }
        let fields = video_fields(object)?;
        self.ctx.db.update_video(video.id, &fields)
    }

    async fn fetch_video_object(&self, url: &str) -> Result<VideoObject> {
        let value = self.ctx.fetcher.fetch_object(url).await?;
        let object: VideoObject =
            serde_json::from_value(value).map_err(|e| FedError::Invalid(format!("video {url}: {e}")))?;
        if object.kind != "Video" {
            return Err(FedError::Invalid(format!("{url} is a {}", object.kind)).into());
        }
        if !same_host(&object.id, url) {
            return Err(FedError::Invalid(format!("video id {} not on the host of {url}", object.id)).into());
        }
        Ok(object)
    }

    async fn schedule_backfill(&self, video: &Video, object: &VideoObject) {
        let collections = [
            (object.likes.as_deref(), FetchType::VideoLikes),
            (object.dislikes.as_deref(), FetchType::VideoDislikes),
            (object.shares.as_deref(), FetchType::VideoShares),
            (object.comments.as_deref(), FetchType::VideoComments),
        ];
        for (uri, fetch_type) in collections {
            let Some(uri) = uri else { continue };
            let job = JobPayload::Fetch(FetchPayload {
                uri: uri.to_string(),
                fetch_type,
                video_id: Some(video.id),
            });
            if let Err(e) = self.ctx.queue.enqueue(job).await {
                warn!("cannot queue backfill of {uri}: {e:#}");
            } else {
                debug!("queued backfill of {uri}");
            }
        }
    }
}

pub fn video_fields(object: &VideoObject) -> Result<VideoFields> {
    let to = object.to.clone().into_vec();
    let cc = object.cc.clone().into_vec();
    let uuid = match object.uuid.clone() {
        Some(u) => u,
        None => object.id.rsplit('/').next().unwrap_or_default().to_string(),
    };
    if !is_uuid(&uuid) {
        return Err(FedError::Invalid(format!("video {} has no valid uuid", object.id)).into());
    }
    let files = object
        .url
        .clone()
        .into_vec()
        .into_iter()
        .filter(|l| l.media_type.as_deref().map(|m| m.starts_with("video/")).unwrap_or(false))
        .filter_map(|l| {
            Some(VideoFileFields {
                resolution: l.height?,
                size: l.size.unwrap_or(0),
                file_url: l.href,
            })
        })
        .collect();
    Ok(VideoFields {
        uuid,
        url: object.id.clone(),
        name: object.name.clone(),
        description: object.content.clone(),
        privacy: VideoPrivacy::from_addressing(&to, &cc),
        is_live: object.is_live_broadcast.unwrap_or(false),
        views: object.views.unwrap_or(0),
        duration_secs: object.duration.as_deref().map(parse_duration_secs).unwrap_or(0),
        published_at_ms: object.published.as_deref().and_then(rfc3339_to_ms).unwrap_or_else(now_ms),
        files,
    })
}

/// Canonical 8-4-4-4-12 hex form.
pub fn is_uuid(s: &str) -> bool {
    s.len() == 36
        && s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{actor_doc, video_doc, TestEnv};
    use crate::model::ActorType;

    #[tokio::test]
    async fn creates_remote_video_with_channel_and_backfill_jobs() {
        let env = TestEnv::new().await;
        let owner = "https://peer.example/accounts/bob";
        let channel = "https://peer.example/video-channels/bob_ch";
        let video = "https://peer.example/videos/watch/abc";
        env.fetcher.put(owner, actor_doc(owner, ActorType::Person));
        env.fetcher.put(channel, actor_doc(channel, ActorType::Group));
        env.fetcher.put(video, video_doc(video, channel, true));

        let (v, created) = env.ctx.videos().get_or_create(video).await.unwrap();
        assert!(created);
        assert!(v.remote);
        assert_eq!(v.privacy, VideoPrivacy::Public);
        assert_eq!(env.ctx.db.list_video_files(v.id).unwrap().len(), 2);

        let (again, created) = env.ctx.videos().get_or_create(video).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, v.id);

        let fetches = env.fetch_jobs().await;
        assert!(fetches.iter().any(|f| f.fetch_type == FetchType::VideoComments && f.video_id == Some(v.id)));
    }

    #[tokio::test]
    async fn forced_refresh_of_gone_video_deletes_it() {
        let env = TestEnv::new().await;
        let channel = crate::testkit::remote_actor(&env, "https://peer.example/video-channels/c", ActorType::Group);
        let video = env.remote_video(&channel, "https://peer.example/videos/watch/gone", &[(720, 10)]);
        env.fetcher.gone(&video.url);
        assert!(matches!(env.ctx.videos().refresh(video.clone(), true).await.unwrap(), VideoState::Gone));
        assert!(env.ctx.db.load_video(video.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn video_with_path_like_uuid_is_refused() {
        let env = TestEnv::new().await;
        let channel = "https://peer.example/video-channels/bob_ch";
        let video = "https://peer.example/videos/watch/escape";
        crate::testkit::serve_video(&env, video, channel);
        let mut doc = video_doc(video, channel, true);
        doc["uuid"] = serde_json::json!("../escaped");
        env.fetcher.put(video, doc);

        let err = env.ctx.videos().get_or_create(video).await.unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(FedError::Invalid(_))));
        assert!(env.ctx.db.load_video_by_url(video).unwrap().is_none());
    }

    #[test]
    fn uuid_shape_is_checked() {
        assert!(is_uuid("3f0c1c2e-9b7a-4d1e-8f00-0123456789ab"));
        assert!(!is_uuid("../escaped"));
        assert!(!is_uuid("3f0c1c2e-9b7a-4d1e-8f00-0123456789a/"));
        assert!(!is_uuid("3f0c1c2e09b7a-4d1e-8f00-0123456789ab"));
        assert!(!is_uuid(""));
    }

    #[test]
    fn fields_pick_video_links_only() {
        let object: VideoObject = serde_json::from_value(video_doc(
            "https://peer.example/videos/watch/u1",
            "https://peer.example/video-channels/c",
            false,
        ))
        .unwrap();
        let fields = video_fields(&object).unwrap();
        assert_eq!(fields.privacy, VideoPrivacy::Unlisted);
        assert_eq!(fields.duration_secs, 93);
        assert_eq!(fields.files.iter().map(|f| f.resolution).collect::<Vec<_>>(), vec![720, 360]);
    }
}
