/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const AP_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
pub const AP_CONTENT_TYPE: &str = "application/activity+json";

/// JSON-LD properties that accept either one value or an array of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }

    pub fn first(&self) -> Option<&T> {
        match self {
            OneOrMany::One(v) => Some(v),
            OneOrMany::Many(v) => v.first(),
        }
    }
}

/// `attributedTo` entries are either bare ids or `{type, id}` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attribution {
    Typed {
        #[serde(rename = "type")]
        kind: String,
        id: String,
    },
    Id(String),
}

impl Attribution {
    pub fn id(&self) -> &str {
        match self {
            Attribution::Typed { id, .. } => id,
            Attribution::Id(id) => id,
        }
    }

    pub fn kind(&self) -> Option<&str> {
        match self {
            Attribution::Typed { kind, .. } => Some(kind),
            Attribution::Id(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub inbox: String,
    #[serde(default)]
    pub outbox: Option<String>,
    #[serde(default)]
    pub followers: Option<String>,
    #[serde(default)]
    pub following: Option<String>,
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
    #[serde(default)]
    pub public_key: Option<PublicKey>,
    #[serde(default)]
    pub icon: Option<OneOrMany<Image>>,
    #[serde(default)]
    pub attributed_to: Option<OneOrMany<Attribution>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(default)]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub public_key_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub url: String,
    #[serde(default)]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    pub href: String,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// ISO 8601 duration, `PT<secs>S`.
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub attributed_to: OneOrMany<Attribution>,
    #[serde(default)]
    pub to: OneOrMany<String>,
    #[serde(default)]
    pub cc: OneOrMany<String>,
    #[serde(default)]
    pub url: OneOrMany<Link>,
    #[serde(default)]
    pub is_live_broadcast: Option<bool>,
    #[serde(default)]
    pub likes: Option<String>,
    #[serde(default)]
    pub dislikes: Option<String>,
    #[serde(default)]
    pub shares: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Option<String>,
    pub in_reply_to: String,
    pub attributed_to: String,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub to: OneOrMany<String>,
    #[serde(default)]
    pub cc: OneOrMany<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFileObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Video the cached file belongs to.
    pub object: String,
    /// RFC 3339 timestamp, absent for manual mirrors.
    #[serde(default)]
    pub expires: Option<String>,
    pub url: Link,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Option<String>,
    pub object: OneOrMany<String>,
}

/// Collection or collection page. `first`/`next` may be links or embedded pages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDoc {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub total_items: Option<u64>,
    #[serde(default)]
    pub first: Option<PageRef>,
    #[serde(default)]
    pub next: Option<PageRef>,
    #[serde(default)]
    pub ordered_items: Option<Vec<Value>>,
    #[serde(default)]
    pub items: Option<Vec<Value>>,
}

impl CollectionDoc {
    pub fn take_items(&mut self) -> Option<Vec<Value>> {
        self.ordered_items.take().or_else(|| self.items.take())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageRef {
    Url(String),
    Page(Box<CollectionDoc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchType {
    Activity,
    VideoLikes,
    VideoDislikes,
    VideoShares,
    VideoComments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    pub uris: Vec<String>,
    pub signature_actor_id: i64,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnicastPayload {
    pub uri: String,
    pub signature_actor_id: i64,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPayload {
    pub uri: String,
    #[serde(rename = "type")]
    pub fetch_type: FetchType,
    #[serde(default)]
    pub video_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowPayload {
    pub host: String,
    pub name: String,
    pub follower_actor_id: i64,
}

/// Persisted job body; the tag doubles as the queue name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "kebab-case")]
pub enum JobPayload {
    Broadcast(BroadcastPayload),
    Unicast(UnicastPayload),
    Fetch(FetchPayload),
    Follow(FollowPayload),
}
