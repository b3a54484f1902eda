/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Closed activity/object model for inbound documents, and builders for the
//! activities this instance originates.

use crate::audience::Audience;
use crate::error::FedError;
use crate::model::{ms_to_rfc3339, Actor, Video, VideoComment, VideoFile, VideoRedundancy};
use anyhow::Result;
use serde_json::{json, Value};
use vidfed_protocol::{ActorDocument, CacheFileObject, FlagObject, NoteObject, VideoObject, AS_CONTEXT};

#[derive(Debug, Clone)]
pub enum ObjectKind {
    View { video_url: String },
    Like { id: Option<String>, video_url: String },
    Dislike { id: Option<String>, video_url: String },
    Video(Box<VideoObject>),
    Flag(FlagObject),
    Note(NoteObject),
    CacheFile(CacheFileObject),
    Actor(Box<ActorDocument>),
}

impl ObjectKind {
    pub fn parse(value: &Value) -> Result<Self> {
        let kind = type_of(value).ok_or_else(|| FedError::Invalid("object without type".into()))?;
        let invalid = |e: serde_json::Error| FedError::Invalid(format!("{kind} object: {e}"));
        Ok(match kind {
            "View" => ObjectKind::View {
                video_url: required_id(value, "object")?,
            },
            "Like" => ObjectKind::Like {
                id: id_of(value),
                video_url: required_id(value, "object")?,
            },
            "Dislike" => ObjectKind::Dislike {
                id: id_of(value),
                video_url: required_id(value, "object")?,
            },
            "Video" => ObjectKind::Video(Box::new(serde_json::from_value(value.clone()).map_err(invalid)?)),
            "Flag" => ObjectKind::Flag(serde_json::from_value(value.clone()).map_err(invalid)?),
            "Note" => ObjectKind::Note(serde_json::from_value(value.clone()).map_err(invalid)?),
            "CacheFile" => ObjectKind::CacheFile(serde_json::from_value(value.clone()).map_err(invalid)?),
            "Person" | "Group" | "Application" | "Service" => {
                ObjectKind::Actor(Box::new(serde_json::from_value(value.clone()).map_err(invalid)?))
            }
            other => return Err(FedError::Unsupported(format!("object {other}")).into()),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::View { .. } => "View",
            ObjectKind::Like { .. } => "Like",
            ObjectKind::Dislike { .. } => "Dislike",
            ObjectKind::Video(_) => "Video",
            ObjectKind::Flag(_) => "Flag",
            ObjectKind::Note(_) => "Note",
            ObjectKind::CacheFile(_) => "CacheFile",
            ObjectKind::Actor(_) => "Actor",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ActivityKind {
    Follow { object: String },
    Accept,
    Reject,
    Undo(Box<Activity>),
    Create(ObjectKind),
    Update(ObjectKind),
    Delete { object: String },
    Announce { object: String },
    Like { object: String },
    Dislike { object: String },
    View { object: String },
}

#[derive(Debug, Clone)]
pub struct Activity {
    pub id: Option<String>,
    pub actor: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub kind: ActivityKind,
    /// Document as received, used when forwarding.
    pub raw: Value,
}

impl Activity {
    pub fn parse(value: Value) -> Result<Self> {
        let kind = type_of(&value)
            .ok_or_else(|| FedError::Invalid("activity without type".into()))?
            .to_string();
        let actor = actor_of(&value).ok_or_else(|| FedError::Invalid(format!("{kind} without actor")))?;
        let object = value.get("object").cloned().unwrap_or(Value::Null);
        let parsed = match kind.as_str() {
            "Follow" => ActivityKind::Follow {
                object: object_id(&object, &kind)?,
            },
            "Accept" => ActivityKind::Accept,
            "Reject" => ActivityKind::Reject,
            "Undo" => ActivityKind::Undo(Box::new(Self::parse_undone(object, &actor)?)),
            "Create" => ActivityKind::Create(ObjectKind::parse(&object)?),
            "Update" => ActivityKind::Update(ObjectKind::parse(&object)?),
            "Delete" => ActivityKind::Delete {
                object: object_id(&object, &kind)?,
            },
            "Announce" => ActivityKind::Announce {
                object: object_id(&object, &kind)?,
            },
            "Like" => ActivityKind::Like {
                object: object_id(&object, &kind)?,
            },
            "Dislike" => ActivityKind::Dislike {
                object: object_id(&object, &kind)?,
            },
            "View" => ActivityKind::View {
                object: object_id(&object, &kind)?,
            },
            other => return Err(FedError::Unsupported(format!("activity {other}")).into()),
        };
        Ok(Self {
            id: id_of(&value),
            actor,
            to: string_list(value.get("to")),
            cc: string_list(value.get("cc")),
            kind: parsed,
            raw: value,
        })
    }

    /// Undo may wrap an activity or, for cache files, the bare object.
    fn parse_undone(object: Value, outer_actor: &str) -> Result<Self> {
        match type_of(&object) {
            Some("CacheFile") => {
                let id = id_of(&object);
                Ok(Self {
                    id,
                    actor: outer_actor.to_string(),
                    to: Vec::new(),
                    cc: Vec::new(),
                    kind: ActivityKind::Create(ObjectKind::parse(&object)?),
                    raw: object,
                })
            }
            Some(_) => {
                let mut inner = object;
                if actor_of(&inner).is_none() {
                    if let Some(map) = inner.as_object_mut() {
                        map.insert("actor".into(), Value::String(outer_actor.to_string()));
                    }
                }
                Self::parse(inner)
            }
            None => Err(FedError::Invalid("Undo without embedded activity".into()).into()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ActivityKind::Follow { .. } => "Follow",
            ActivityKind::Accept => "Accept",
            ActivityKind::Reject => "Reject",
            ActivityKind::Undo(_) => "Undo",
            ActivityKind::Create(_) => "Create",
            ActivityKind::Update(_) => "Update",
            ActivityKind::Delete { .. } => "Delete",
            ActivityKind::Announce { .. } => "Announce",
            ActivityKind::Like { .. } => "Like",
            ActivityKind::Dislike { .. } => "Dislike",
            ActivityKind::View { .. } => "View",
        }
    }
}

/// Splits an inbound body into its activities; collections carry them as items.
pub fn activities_of(mut body: Value) -> Vec<Value> {
    match type_of(&body) {
        Some("Collection" | "OrderedCollection" | "CollectionPage" | "OrderedCollectionPage") => {
            let items = body
                .get_mut("orderedItems")
                .map(Value::take)
                .filter(|v| v.is_array())
                .or_else(|| body.get_mut("items").map(Value::take));
            match items {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            }
        }
        _ => vec![body],
    }
}

pub fn type_of(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// `id` of an object, or the value itself when it is a bare URL.
pub fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

pub fn actor_of(value: &Value) -> Option<String> {
    value.get("actor").and_then(id_of)
}

fn object_id(object: &Value, kind: &str) -> Result<String> {
    id_of(object).ok_or_else(|| FedError::Invalid(format!("{kind} without object id")).into())
}

fn required_id(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(id_of)
        .ok_or_else(|| FedError::Invalid(format!("missing {field}")).into())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

// ---- builders ----

fn envelope(id: &str, kind: &str, actor: &Actor, object: Value, audience: &Audience) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": kind,
        "actor": actor.url,
        "to": audience.to,
        "cc": audience.cc,
        "object": object,
    })
}

pub fn follow_url(follower: &Actor, target: &Actor) -> String {
    format!("{}/follows/{}", follower.url, target.id)
}

pub fn build_follow(id: &str, follower: &Actor, target: &Actor) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": "Follow",
        "actor": follower.url,
        "object": target.url,
    })
}

pub fn build_accept(target: &Actor, follower: &Actor, follow: &Value) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": format!("{}/accepts/follows/{}", target.url, follower.id),
        "type": "Accept",
        "actor": target.url,
        "object": follow,
    })
}

pub fn build_reject(target: &Actor, follower: &Actor, follow: &Value) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": format!("{}/rejects/follows/{}", target.url, follower.id),
        "type": "Reject",
        "actor": target.url,
        "object": follow,
    })
}

pub fn build_undo(by: &Actor, inner: Value, audience: &Audience) -> Value {
    let id = format!("{}/undo", id_of(&inner).unwrap_or_else(|| by.url.clone()));
    envelope(&id, "Undo", by, inner, audience)
}

/// Document for a video hosted here.
pub fn video_object(video: &Video, channel: &Actor, owner: Option<&Actor>, files: &[VideoFile], audience: &Audience) -> Value {
    let mut attributed = vec![json!({"type": "Group", "id": channel.url})];
    if let Some(owner) = owner {
        attributed.insert(0, json!({"type": "Person", "id": owner.url}));
    }
    let urls: Vec<Value> = files
        .iter()
        .map(|f| {
            json!({
                "type": "Link",
                "mediaType": "video/mp4",
                "href": f.file_url,
                "height": f.resolution,
                "size": f.size,
            })
        })
        .collect();
    json!({
        "id": video.url,
        "type": "Video",
        "name": video.name,
        "uuid": video.uuid,
        "content": video.description,
        "duration": format!("PT{}S", video.duration_secs),
        "views": video.views,
        "published": ms_to_rfc3339(video.published_at_ms),
        "updated": ms_to_rfc3339(video.updated_at_ms),
        "isLiveBroadcast": video.is_live,
        "attributedTo": attributed,
        "to": audience.to,
        "cc": audience.cc,
        "url": urls,
        "likes": format!("{}/likes", video.url),
        "dislikes": format!("{}/dislikes", video.url),
        "shares": format!("{}/announces", video.url),
        "comments": format!("{}/comments", video.url),
    })
}

pub fn build_create(id: &str, by: &Actor, object: Value, audience: &Audience) -> Value {
    envelope(id, "Create", by, object, audience)
}

pub fn build_update(id: &str, by: &Actor, object: Value, audience: &Audience) -> Value {
    envelope(id, "Update", by, object, audience)
}

pub fn build_delete(by: &Actor, object_url: &str, audience: &Audience) -> Value {
    envelope(&format!("{object_url}/delete"), "Delete", by, Value::String(object_url.to_string()), audience)
}

pub fn announce_url(by: &Actor, video: &Video) -> String {
    format!("{}/announces/{}", video.url, by.id)
}

pub fn build_announce(by: &Actor, video: &Video, audience: &Audience) -> Value {
    envelope(&announce_url(by, video), "Announce", by, Value::String(video.url.clone()), audience)
}

pub fn rate_url(by: &Actor, video: &Video, kind: &str) -> String {
    let segment = if kind == "Dislike" { "dislikes" } else { "likes" };
    format!("{}/{segment}/{}", by.url, video.id)
}

/// `Like` or `Dislike` of a video.
pub fn build_rate(kind: &str, by: &Actor, video: &Video, audience: &Audience) -> Value {
    envelope(&rate_url(by, video, kind), kind, by, Value::String(video.url.clone()), audience)
}

pub fn build_view(by: &Actor, video: &Video, now_ms: i64, audience: &Audience) -> Value {
    let id = format!("{}/views/{}/{now_ms}", video.url, by.id);
    envelope(&id, "View", by, Value::String(video.url.clone()), audience)
}

pub fn note_object(comment: &VideoComment, author: &Actor, in_reply_to: &str, audience: &Audience) -> Value {
    json!({
        "id": comment.url,
        "type": "Note",
        "content": comment.text,
        "inReplyTo": in_reply_to,
        "attributedTo": author.url,
        "to": audience.to,
        "cc": audience.cc,
    })
}

pub fn build_flag(id: &str, by: &Actor, video: &Video, reason: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": "Flag",
        "actor": by.url,
        "content": reason,
        "object": [video.url],
    })
}

pub fn cache_file_object(redundancy: &VideoRedundancy, video: &Video, file: &VideoFile) -> Value {
    let mut object = json!({
        "id": redundancy.url,
        "type": "CacheFile",
        "object": video.url,
        "url": {
            "type": "Link",
            "mediaType": "video/mp4",
            "href": redundancy.file_url,
            "height": file.resolution,
            "size": file.size,
        },
    });
    if let Some(expires) = redundancy.expires_on_ms {
        object["expires"] = Value::String(ms_to_rfc3339(expires));
    }
    object
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_like_and_undo_announce() {
        let like = Activity::parse(json!({
            "id": "https://a.example/likes/1",
            "type": "Create",
            "actor": "https://a.example/accounts/a",
            "object": {"type": "Like", "id": "https://a.example/likes/1", "object": "https://v.example/videos/watch/x"}
        }))
        .unwrap();
        assert!(matches!(
            like.kind,
            ActivityKind::Create(ObjectKind::Like { ref video_url, .. }) if video_url == "https://v.example/videos/watch/x"
        ));

        let undo = Activity::parse(json!({
            "type": "Undo",
            "actor": {"id": "https://a.example/accounts/a"},
            "object": {"type": "Announce", "id": "https://a.example/announces/1", "object": "https://v.example/videos/watch/x"}
        }))
        .unwrap();
        let ActivityKind::Undo(inner) = undo.kind else {
            panic!("not an undo");
        };
        assert_eq!(inner.actor, "https://a.example/accounts/a");
        assert!(matches!(inner.kind, ActivityKind::Announce { .. }));
    }

    #[test]
    fn undo_of_bare_cache_file_becomes_create() {
        let undo = Activity::parse(json!({
            "type": "Undo",
            "actor": "https://a.example/accounts/peertube",
            "object": {
                "type": "CacheFile",
                "id": "https://a.example/redundancy/videos/u/720",
                "object": "https://v.example/videos/watch/u",
                "url": {"type": "Link", "href": "https://a.example/static/redundancy/u-720.mp4", "height": 720}
            }
        }))
        .unwrap();
        let ActivityKind::Undo(inner) = undo.kind else {
            panic!("not an undo");
        };
        assert!(matches!(inner.kind, ActivityKind::Create(ObjectKind::CacheFile(_))));
    }

    #[test]
    fn unknown_types_are_unsupported() {
        let err = Activity::parse(json!({"type": "Move", "actor": "https://a.example/x", "object": "y"})).unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(FedError::Unsupported(_))));
        let err = ObjectKind::parse(&json!({"type": "Article"})).unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(FedError::Unsupported(_))));
    }

    #[test]
    fn collection_bodies_are_split() {
        let body = json!({
            "type": "OrderedCollection",
            "orderedItems": [{"type": "Like"}, {"type": "Announce"}]
        });
        assert_eq!(activities_of(body).len(), 2);
        assert_eq!(activities_of(json!({"type": "Like"})).len(), 1);
    }
}
