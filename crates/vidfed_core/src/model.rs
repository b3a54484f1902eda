/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Person,
    Group,
    Application,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Person => "Person",
            ActorType::Group => "Group",
            ActorType::Application => "Application",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "Person" => Some(ActorType::Person),
            "Group" => Some(ActorType::Group),
            "Application" | "Service" => Some(ActorType::Application),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Server {
    pub id: i64,
    pub host: String,
    pub redundancy_allowed: bool,
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: i64,
    pub url: String,
    pub kind: ActorType,
    pub preferred_username: String,
    pub public_key_pem: String,
    pub private_key_pem: Option<String>,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub outbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub following_url: Option<String>,
    pub server_id: Option<i64>,
    pub avatar_url: Option<String>,
    pub avatar_name: Option<String>,
    pub account_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub updated_at_ms: i64,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.server_id.is_none()
    }

    /// Neither an account nor a channel points at this row.
    pub fn is_orphan(&self) -> bool {
        self.account_id.is_none() && self.channel_id.is_none()
    }

    pub fn is_outdated(&self, ttl: Duration, now_ms: i64) -> bool {
        !self.is_local() && now_ms.saturating_sub(self.updated_at_ms) > ttl.as_millis() as i64
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.url)
    }

    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox_url.as_deref().unwrap_or(&self.inbox_url)
    }

    pub fn host(&self) -> Option<String> {
        host_of(&self.url)
    }
}

/// Mutable actor attributes as read from a remote document.
#[derive(Debug, Clone)]
pub struct ActorFields {
    pub url: String,
    pub kind: ActorType,
    pub preferred_username: String,
    pub display_name: String,
    pub summary: Option<String>,
    pub public_key_pem: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub outbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub following_url: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub actor_id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VideoChannel {
    pub id: i64,
    pub actor_id: i64,
    pub account_id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    Pending,
    Accepted,
}

impl FollowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowState::Pending => "pending",
            FollowState::Accepted => "accepted",
        }
    }

    pub fn parse(input: &str) -> Self {
        if input == "accepted" {
            FollowState::Accepted
        } else {
            FollowState::Pending
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActorFollow {
    pub id: i64,
    pub actor_id: i64,
    pub target_actor_id: i64,
    pub state: FollowState,
    pub url: Option<String>,
    pub score: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoPrivacy {
    Public,
    Unlisted,
    Private,
}

impl VideoPrivacy {
    pub fn as_i64(&self) -> i64 {
        match self {
            VideoPrivacy::Public => 1,
            VideoPrivacy::Unlisted => 2,
            VideoPrivacy::Private => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => VideoPrivacy::Public,
            2 => VideoPrivacy::Unlisted,
            _ => VideoPrivacy::Private,
        }
    }

    /// Public when addressed to the public collection, unlisted when only cc'd.
    pub fn from_addressing(to: &[String], cc: &[String]) -> Self {
        if to.iter().any(|v| v == vidfed_protocol::AS_PUBLIC) {
            VideoPrivacy::Public
        } else if cc.iter().any(|v| v == vidfed_protocol::AS_PUBLIC) {
            VideoPrivacy::Unlisted
        } else {
            VideoPrivacy::Private
        }
    }
}

#[derive(Debug, Clone)]
pub struct Video {
    pub id: i64,
    pub uuid: String,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub privacy: VideoPrivacy,
    pub channel_id: i64,
    pub channel_actor_id: i64,
    pub remote: bool,
    pub is_live: bool,
    pub views: i64,
    pub likes: i64,
    pub dislikes: i64,
    pub duration_secs: i64,
    pub published_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Video {
    pub fn is_owned(&self) -> bool {
        !self.remote
    }

    pub fn is_outdated(&self, ttl: Duration, now_ms: i64) -> bool {
        self.remote && now_ms.saturating_sub(self.updated_at_ms) > ttl.as_millis() as i64
    }
}

/// Mutable video attributes as read from a remote document.
#[derive(Debug, Clone)]
pub struct VideoFields {
    pub uuid: String,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub privacy: VideoPrivacy,
    pub is_live: bool,
    pub views: i64,
    pub duration_secs: i64,
    pub published_at_ms: i64,
    pub files: Vec<VideoFileFields>,
}

#[derive(Debug, Clone)]
pub struct VideoFileFields {
    pub resolution: i64,
    pub size: i64,
    pub file_url: String,
}

#[derive(Debug, Clone)]
pub struct VideoFile {
    pub id: i64,
    pub video_id: i64,
    pub resolution: i64,
    pub size: i64,
    pub file_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateType {
    Like,
    Dislike,
}

impl RateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateType::Like => "like",
            RateType::Dislike => "dislike",
        }
    }

    pub fn parse(input: &str) -> Self {
        if input == "dislike" {
            RateType::Dislike
        } else {
            RateType::Like
        }
    }

    /// Counter column touched by this rate.
    pub fn counter(&self) -> &'static str {
        match self {
            RateType::Like => "likes",
            RateType::Dislike => "dislikes",
        }
    }
}

/// What a rate upsert changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateChange {
    Unchanged,
    Created,
    Switched,
}

impl RateChange {
    pub fn is_new(&self) -> bool {
        !matches!(self, RateChange::Unchanged)
    }
}

#[derive(Debug, Clone)]
pub struct VideoComment {
    pub id: i64,
    pub url: String,
    pub text: String,
    pub origin_comment_id: Option<i64>,
    pub in_reply_to_comment_id: Option<i64>,
    pub video_id: i64,
    pub account_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedundancyStrategy {
    MostViews,
    Trending,
    RecentlyAdded,
    Manual,
}

impl RedundancyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedundancyStrategy::MostViews => "most-views",
            RedundancyStrategy::Trending => "trending",
            RedundancyStrategy::RecentlyAdded => "recently-added",
            RedundancyStrategy::Manual => "manual",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "most-views" => Some(RedundancyStrategy::MostViews),
            "trending" => Some(RedundancyStrategy::Trending),
            "recently-added" => Some(RedundancyStrategy::RecentlyAdded),
            "manual" => Some(RedundancyStrategy::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoRedundancy {
    pub id: i64,
    pub actor_id: i64,
    pub video_file_id: i64,
    pub video_id: i64,
    pub size: i64,
    pub strategy: Option<RedundancyStrategy>,
    pub expires_on_ms: Option<i64>,
    pub file_url: String,
    pub url: String,
    pub created_at_ms: i64,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// `host[:port]` of an absolute URL.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

pub fn same_host(a: &str, b: &str) -> bool {
    match (host_of(a), host_of(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

pub fn ms_to_rfc3339(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default()
}

pub fn rfc3339_to_ms(input: &str) -> Option<i64> {
    let t = OffsetDateTime::parse(input, &Rfc3339).ok()?;
    Some((t.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// Parses `PT<n>S` style durations; anything else counts as zero.
pub fn parse_duration_secs(input: &str) -> i64 {
    input
        .strip_prefix("PT")
        .and_then(|s| s.strip_suffix('S'))
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_includes_port() {
        assert_eq!(host_of("https://a.example/x").as_deref(), Some("a.example"));
        assert_eq!(host_of("http://A.example:9000/x").as_deref(), Some("a.example:9000"));
        assert!(same_host("https://a.example/1", "https://a.example/2"));
        assert!(!same_host("https://a.example/1", "https://b.example/1"));
    }

    #[test]
    fn rfc3339_roundtrip_keeps_millis() {
        let ms = 1_700_000_000_123;
        assert_eq!(rfc3339_to_ms(&ms_to_rfc3339(ms)), Some(ms));
    }

    #[test]
    fn privacy_from_addressing() {
        let public = vec![vidfed_protocol::AS_PUBLIC.to_string()];
        assert_eq!(VideoPrivacy::from_addressing(&public, &[]), VideoPrivacy::Public);
        assert_eq!(VideoPrivacy::from_addressing(&[], &public), VideoPrivacy::Unlisted);
        assert_eq!(VideoPrivacy::from_addressing(&[], &[]), VideoPrivacy::Private);
    }
}
