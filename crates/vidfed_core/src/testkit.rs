/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-process doubles for the network capabilities plus fixture builders.

use crate::config::FedConfig;
use crate::context::{Capabilities, FedContext, ServerActor};
use crate::db::FedDb;
use crate::delivery::Transport;
use crate::directory::actor_fields;
use crate::fetch::{ApFetcher, Fetched};
use crate::job_queue::{JobKind, JobQueue};
use crate::keys::generate_keypair;
use crate::model::{
    host_of, ms_to_rfc3339, now_ms, Actor, ActorType, Video, VideoFields, VideoFileFields, VideoPrivacy,
};
use crate::net_metrics::NetMetrics;
use crate::peer_health::FollowScoreBook;
use crate::redundancy::FileDownloader;
use crate::videos::DbViewCounter;
use crate::webfinger::WebFinger;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;
use vidfed_protocol::{
    BroadcastPayload, FetchPayload, FollowPayload, JobPayload, UnicastPayload, ActorDocument, AS_PUBLIC,
};

pub const BASE: &str = "https://local.example";

/// One small key pair shared by every fixture.
pub fn test_keys() -> &'static (String, String) {
    static KEYS: OnceLock<(String, String)> = OnceLock::new();
    KEYS.get_or_init(|| generate_keypair(1024).unwrap())
}

#[derive(Default)]
pub struct MockFetcher {
    docs: Mutex<HashMap<String, Fetched>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn put(&self, url: &str, doc: Value) {
        self.docs.lock().unwrap().insert(url.to_string(), Fetched::Found(doc));
    }

    pub fn gone(&self, url: &str) {
        self.docs.lock().unwrap().insert(url.to_string(), Fetched::Gone);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        self.calls.lock().unwrap().push(url.to_string());
        self.docs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("connection refused: {url}"))
    }
}

#[derive(Default)]
pub struct MockWebFinger {
    handles: Mutex<HashMap<String, String>>,
}

impl MockWebFinger {
    pub fn set(&self, name: &str, host: &str, url: &str) {
        self.handles.lock().unwrap().insert(format!("{name}@{host}"), url.to_string());
    }
}

#[async_trait]
impl WebFinger for MockWebFinger {
    async fn resolve(&self, name: &str, host: &str) -> Result<String> {
        self.handles
            .lock()
            .unwrap()
            .get(&format!("{name}@{host}"))
            .cloned()
            .ok_or_else(|| anyhow!("no webfinger for {name}@{host}"))
    }
}

#[derive(Debug, Clone)]
pub struct Posted {
    pub signer: String,
    pub inbox: String,
    pub body: Value,
}

#[derive(Default)]
pub struct RecordingTransport {
    posted: Mutex<Vec<Posted>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn fail(&self, inbox: &str) {
        self.failing.lock().unwrap().insert(inbox.to_string());
    }

    pub fn posted(&self) -> Vec<Posted> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post_activity(&self, signer: &Actor, inbox_url: &str, body: &[u8]) -> Result<()> {
        if self.failing.lock().unwrap().contains(inbox_url) {
            return Err(anyhow!("delivery to {inbox_url} failed"));
        }
        self.posted.lock().unwrap().push(Posted {
            signer: signer.url.clone(),
            inbox: inbox_url.to_string(),
            body: serde_json::from_slice(body)?,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDownloader {
    downloaded: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl MockDownloader {
    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn downloaded(&self) -> Vec<String> {
        self.downloaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileDownloader for MockDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        if self.failing.lock().unwrap().contains(url) {
            return Err(anyhow!("download of {url} failed"));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, url.as_bytes()).await?;
        self.downloaded.lock().unwrap().push(url.to_string());
        Ok(url.len() as u64)
    }
}

pub struct TestEnv {
    pub ctx: FedContext,
    pub fetcher: Arc<MockFetcher>,
    pub webfinger: Arc<MockWebFinger>,
    pub transport: Arc<RecordingTransport>,
    pub downloader: Arc<MockDownloader>,
    pub dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(FedConfig::for_base_url(BASE)).await
    }

    pub async fn with_config(mut cfg: FedConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        if cfg.data_dir.is_none() {
            cfg.data_dir = Some(dir.path().to_string_lossy().into_owned());
        }
        let db = Arc::new(FedDb::open(dir.path().join("fed.db")).unwrap());
        let metrics = Arc::new(NetMetrics::new());
        let queue = JobQueue::open(dir.path().join("jobs.db"), metrics.clone()).unwrap();
        let (public_key_pem, private_key_pem) = test_keys();
        let server = db
            .insert_local_account(
                cfg.base_url(),
                cfg.server_actor_name(),
                ActorType::Application,
                public_key_pem,
                private_key_pem,
            )
            .unwrap();

        let fetcher = Arc::new(MockFetcher::default());
        let webfinger = Arc::new(MockWebFinger::default());
        let transport = Arc::new(RecordingTransport::default());
        let downloader = Arc::new(MockDownloader::default());
        let caps = Capabilities {
            fetcher: fetcher.clone(),
            webfinger: webfinger.clone(),
            transport: transport.clone(),
            downloader: downloader.clone(),
            views: Arc::new(DbViewCounter::new(db.clone())),
            scorer: Arc::new(FollowScoreBook::new(db.clone())),
        };
        let ctx = FedContext::new(Arc::new(cfg), db, ServerActor::new(server), caps, queue, metrics);
        Self {
            ctx,
            fetcher,
            webfinger,
            transport,
            downloader,
            dir,
        }
    }

    pub fn local_account(&self, name: &str) -> Actor {
        let (public_key_pem, private_key_pem) = test_keys();
        self.ctx
            .db
            .insert_local_account(BASE, name, ActorType::Person, public_key_pem, private_key_pem)
            .unwrap()
    }

    pub fn local_channel(&self, name: &str, owner_name: &str) -> Actor {
        let owner = self.local_account(owner_name);
        let (public_key_pem, private_key_pem) = test_keys();
        self.ctx
            .db
            .insert_local_channel(BASE, name, owner.account_id.unwrap(), public_key_pem, private_key_pem)
            .unwrap()
    }

    pub fn local_video(&self, channel: &Actor, uuid: &str) -> Video {
        let url = format!("{BASE}/videos/watch/{uuid}");
        let fields = video_fields_for(&url, uuid, &[(720, 1000)]);
        self.ctx
            .db
            .insert_video(&fields, channel.channel_id.unwrap(), false)
            .unwrap()
            .0
    }

    pub fn remote_video(&self, channel: &Actor, url: &str, files: &[(i64, i64)]) -> Video {
        let fields = video_fields_for(url, &uuid_for(url), files);
        self.ctx
            .db
            .insert_video(&fields, channel.channel_id.unwrap(), true)
            .unwrap()
            .0
    }

    pub async fn broadcasts(&self) -> Vec<BroadcastPayload> {
        self.jobs(JobKind::Broadcast)
            .await
            .into_iter()
            .filter_map(|p| match p {
                JobPayload::Broadcast(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub async fn unicasts(&self) -> Vec<UnicastPayload> {
        self.jobs(JobKind::Unicast)
            .await
            .into_iter()
            .filter_map(|p| match p {
                JobPayload::Unicast(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    pub async fn fetch_jobs(&self) -> Vec<FetchPayload> {
        self.jobs(JobKind::Fetch)
            .await
            .into_iter()
            .filter_map(|p| match p {
                JobPayload::Fetch(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    pub async fn follow_jobs(&self) -> Vec<FollowPayload> {
        self.jobs(JobKind::Follow)
            .await
            .into_iter()
            .filter_map(|p| match p {
                JobPayload::Follow(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    async fn jobs(&self, kind: JobKind) -> Vec<JobPayload> {
        self.ctx.queue.pending(kind).await.unwrap()
    }
}

/// Stable uuid derived from a fixture URL.
pub fn uuid_for(url: &str) -> String {
    let h = hex::encode(Sha256::digest(url.as_bytes()));
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

fn video_fields_for(url: &str, uuid: &str, files: &[(i64, i64)]) -> VideoFields {
    VideoFields {
        uuid: uuid.to_string(),
        url: url.to_string(),
        name: format!("video {uuid}"),
        description: None,
        privacy: VideoPrivacy::Public,
        is_live: false,
        views: 0,
        duration_secs: 60,
        published_at_ms: now_ms(),
        files: files
            .iter()
            .map(|(resolution, size)| VideoFileFields {
                resolution: *resolution,
                size: *size,
                file_url: format!("{url}-{resolution}.mp4"),
            })
            .collect(),
    }
}

fn origin_of(url: &str) -> String {
    let parsed = reqwest::Url::parse(url).unwrap();
    format!("{}://{}", parsed.scheme(), host_of(url).unwrap())
}

/// Default owner account of remote fixture channels.
pub fn owner_url_for(channel_url: &str) -> String {
    format!("{}/accounts/bob", origin_of(channel_url))
}

/// Stores a remote actor directly, without going through the fetcher.
pub fn remote_actor(env: &TestEnv, url: &str, kind: ActorType) -> Actor {
    let owner_account_id = match kind {
        ActorType::Group => {
            let owner = remote_actor(env, &owner_url_for(url), ActorType::Person);
            owner.account_id
        }
        _ => None,
    };
    let doc: ActorDocument = serde_json::from_value(actor_doc(url, kind)).unwrap();
    let fields = actor_fields(&doc).unwrap();
    env.ctx
        .db
        .insert_remote_actor(&fields, &host_of(url).unwrap(), owner_account_id, None)
        .unwrap()
        .0
}

pub fn actor_doc(url: &str, kind: ActorType) -> Value {
    let name = url.trim_end_matches('/').rsplit('/').next().unwrap();
    let mut doc = json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": url,
        "type": kind.as_str(),
        "preferredUsername": name,
        "name": name,
        "inbox": format!("{url}/inbox"),
        "outbox": format!("{url}/outbox"),
        "followers": format!("{url}/followers"),
        "following": format!("{url}/following"),
        "endpoints": {"sharedInbox": format!("{}/inbox", origin_of(url))},
        "publicKey": {
            "id": format!("{url}#main-key"),
            "owner": url,
            "publicKeyPem": test_keys().0,
        },
    });
    if kind == ActorType::Group {
        doc["attributedTo"] = json!([{"type": "Person", "id": owner_url_for(url)}]);
    }
    doc
}

/// PeerTube-shaped video document with a 720p and a 360p file.
pub fn video_doc(url: &str, channel_url: &str, public: bool) -> Value {
    let uuid = uuid_for(url);
    let (to, cc) = if public {
        (json!([AS_PUBLIC]), json!([format!("{channel_url}/followers")]))
    } else {
        (json!([]), json!([AS_PUBLIC]))
    };
    json!({
        "id": url,
        "type": "Video",
        "name": format!("video {uuid}"),
        "uuid": uuid,
        "content": "description",
        "duration": "PT93S",
        "views": 12,
        "published": ms_to_rfc3339(now_ms()),
        "to": to,
        "cc": cc,
        "attributedTo": [
            {"type": "Person", "id": owner_url_for(channel_url)},
            {"type": "Group", "id": channel_url},
        ],
        "url": [
            {"type": "Link", "mediaType": "text/html", "href": url},
            {"type": "Link", "mediaType": "video/mp4", "href": format!("{url}-720.mp4"), "height": 720, "size": 700},
            {"type": "Link", "mediaType": "video/mp4", "href": format!("{url}-360.mp4"), "height": 360, "size": 300},
        ],
        "isLiveBroadcast": false,
        "likes": format!("{url}/likes"),
        "dislikes": format!("{url}/dislikes"),
        "shares": format!("{url}/announces"),
        "comments": format!("{url}/comments"),
    })
}

/// Fetcher fixtures for a remote channel, its owner and one video.
pub fn serve_video(env: &TestEnv, video_url: &str, channel_url: &str) {
    let owner = owner_url_for(channel_url);
    env.fetcher.put(&owner, actor_doc(&owner, ActorType::Person));
    env.fetcher.put(channel_url, actor_doc(channel_url, ActorType::Group));
    env.fetcher.put(video_url, video_doc(video_url, channel_url, true));
}

pub fn note_doc(id: &str, in_reply_to: &str, author: &str) -> Value {
    json!({
        "id": id,
        "type": "Note",
        "content": format!("comment {id}"),
        "inReplyTo": in_reply_to,
        "attributedTo": author,
        "published": ms_to_rfc3339(now_ms()),
        "to": [AS_PUBLIC],
        "cc": [],
    })
}
