/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::db::FedDb;
use crate::model::{Actor, Video, VideoComment};
use anyhow::Result;
use vidfed_protocol::AS_PUBLIC;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audience {
    pub to: Vec<String>,
    pub cc: Vec<String>,
}

/// Public objects go to the public collection and the followers of every involved
/// actor. Restricted objects get an empty audience.
pub fn audience_for(involved: &[Actor], is_public: bool) -> Audience {
    if !is_public {
        return Audience::default();
    }
    Audience {
        to: vec![AS_PUBLIC.to_string()],
        cc: followers_urls(involved),
    }
}

pub fn audience_from_followers_of(actors: &[Actor]) -> Audience {
    audience_for(actors, true)
}

/// Follower collection URLs, first occurrence wins.
pub fn followers_urls(actors: &[Actor]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for url in actors.iter().filter_map(|a| a.followers_url.as_deref()) {
        if !out.iter().any(|u| u == url) {
            out.push(url.to_string());
        }
    }
    out
}

/// Follower collections named in an activity's `to` and `cc`.
pub fn addressed_followers(to: &[String], cc: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for url in to.iter().chain(cc.iter()) {
        if url.ends_with("/followers") && !out.contains(url) {
            out.push(url.clone());
        }
    }
    out
}

/// The channel actor of `video` plus every actor that shared it.
pub fn video_involved_actors(db: &FedDb, video: &Video) -> Result<Vec<Actor>> {
    let mut out = Vec::new();
    if let Some(channel) = db.load_actor(video.channel_actor_id)? {
        out.push(channel);
    }
    for sharer in db.list_sharer_actors(video.id)? {
        push_unique(&mut out, sharer);
    }
    Ok(out)
}

/// Video actors, the comment author and the author of every ancestor comment.
pub fn comment_involved_actors(db: &FedDb, comment: &VideoComment, video: &Video) -> Result<Vec<Actor>> {
    let mut out = video_involved_actors(db, video)?;
    if let Some(author) = db.load_actor_by_account(comment.account_id)? {
        push_unique(&mut out, author);
    }
    for parent in db.list_comment_ancestors(comment)? {
        if let Some(author) = db.load_actor_by_account(parent.account_id)? {
            push_unique(&mut out, author);
        }
    }
    Ok(out)
}

fn push_unique(out: &mut Vec<Actor>, actor: Actor) {
    if !out.iter().any(|a| a.id == actor.id) {
        out.push(actor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActorType;
    use crate::testkit::{remote_actor, TestEnv};

    #[tokio::test]
    async fn public_audience_dedupes_followers() {
        let env = TestEnv::new().await;
        let a = remote_actor(&env, "https://a.example/accounts/a", ActorType::Person);
        let b = remote_actor(&env, "https://b.example/accounts/b", ActorType::Person);
        let audience = audience_for(&[a.clone(), b.clone(), a.clone()], true);
        assert_eq!(audience.to, vec![AS_PUBLIC.to_string()]);
        assert_eq!(
            audience.cc,
            vec![a.followers_url.clone().unwrap(), b.followers_url.clone().unwrap()]
        );
        assert_eq!(audience_for(&[a], false), Audience::default());
    }

    #[test]
    fn picks_follower_collections_from_addressing() {
        let to = vec![AS_PUBLIC.to_string()];
        let cc = vec![
            "https://a.example/accounts/a/followers".to_string(),
            "https://a.example/accounts/a".to_string(),
        ];
        assert_eq!(addressed_followers(&to, &cc), vec![cc[0].clone()]);
    }

    #[tokio::test]
    async fn comment_involves_ancestor_authors() {
        let env = TestEnv::new().await;
        let channel = env.local_channel("main", "owner");
        let video = env.local_video(&channel, "v1");
        let alice = remote_actor(&env, "https://a.example/accounts/alice", ActorType::Person);
        let bob = remote_actor(&env, "https://b.example/accounts/bob", ActorType::Person);
        let chain = env
            .ctx
            .db
            .insert_comment_chain(
                video.id,
                None,
                &[
                    crate::db::NewComment {
                        url: "https://a.example/c/1".into(),
                        text: "root".into(),
                        account_id: alice.account_id.unwrap(),
                    },
                    crate::db::NewComment {
                        url: "https://b.example/c/2".into(),
                        text: "reply".into(),
                        account_id: bob.account_id.unwrap(),
                    },
                ],
            )
            .unwrap();
        let involved = comment_involved_actors(&env.ctx.db, &chain[1].0, &video).unwrap();
        let urls: Vec<&str> = involved.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(urls, vec![channel.url.as_str(), bob.url.as_str(), alice.url.as_str()]);
    }
}
