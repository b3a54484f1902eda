/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::context::FedContext;
use crate::db::NewComment;
use crate::directory::ResolveOptions;
use crate::error::FedError;
use crate::model::{same_host, Video, VideoComment};
use anyhow::{Context, Result};
use tracing::debug;
use vidfed_protocol::NoteObject;

/// Most remote ancestors fetched for one reply chain.
pub const MAX_THREAD_DEPTH: usize = 100;

#[derive(Debug)]
pub struct ResolvedThread {
    pub video: Video,
    /// Stored chain, oldest first, with a created flag per comment.
    pub comments: Vec<(VideoComment, bool)>,
}

impl ResolvedThread {
    pub fn newest(&self) -> Option<&(VideoComment, bool)> {
        self.comments.last()
    }
}

/// Walks `inReplyTo` links up to a known comment or a video, then stores the whole
/// branch in one transaction. Nothing is written when the walk fails.
pub struct ThreadResolver<'a> {
    ctx: &'a FedContext,
}

impl<'a> ThreadResolver<'a> {
    pub fn new(ctx: &'a FedContext) -> Self {
        Self { ctx }
    }

    /// `pending` holds comments not stored yet, newest first; each replies to the
    /// next one and the last one replies to `url`.
    pub async fn resolve_thread(&self, url: &str, mut pending: Vec<NewComment>) -> Result<ResolvedThread> {
        let db = &self.ctx.db;
        let mut url = url.to_string();
        let mut depth = 0usize;
        loop {
            if depth >= MAX_THREAD_DEPTH {
                return Err(FedError::RecursionLimit(format!("comment thread at {url}")).into());
            }

            if let Some(parent) = db.load_comment_by_url(&url)? {
                let video = db
                    .load_video(parent.video_id)?
                    .ok_or_else(|| FedError::MissingLink(format!("video of comment {}", parent.url)))?;
                pending.reverse();
                let comments = db.insert_comment_chain(video.id, Some(&parent), &pending)?;
                return Ok(ResolvedThread { video, comments });
            }

            match self.ctx.videos().get_or_create(&url).await {
                Ok((video, _)) => {
                    pending.reverse();
                    let comments = db.insert_comment_chain(video.id, None, &pending)?;
                    return Ok(ResolvedThread { video, comments });
                }
                Err(e) => debug!("{url} is not a video, trying as a comment: {e:#}"),
            }

            if self.ctx.is_local_url(&url) {
                return Err(FedError::MissingLink(format!("local comment or video {url}")).into());
            }
            let note = self.fetch_note(&url).await?;
            let author = self
                .ctx
                .directory()
                .resolve(&note.attributed_to, ResolveOptions::default())
                .await
                .with_context(|| format!("resolve author of {}", note.id))?;
            let account_id = author
                .account_id
                .ok_or_else(|| FedError::MissingLink(format!("account of {}", author.url)))?;
            pending.push(NewComment {
                url: note.id,
                text: note.content.unwrap_or_default(),
                account_id,
            });
            url = note.in_reply_to;
            depth += 1;
        }
    }

    async fn fetch_note(&self, url: &str) -> Result<NoteObject> {
        let value = self.ctx.fetcher.fetch_object(url).await?;
        let note: NoteObject =
            serde_json::from_value(value).map_err(|e| FedError::Invalid(format!("comment {url}: {e}")))?;
        if note.kind != "Note" {
            return Err(FedError::Invalid(format!("{url} is a {}", note.kind)).into());
        }
        if !same_host(&note.id, url) {
            return Err(FedError::Invalid(format!("comment id {} not on the host of {url}", note.id)).into());
        }
        if !same_host(&note.id, &note.attributed_to) {
            return Err(FedError::Invalid(format!("comment {} attributed to foreign {}", note.id, note.attributed_to)).into());
        }
        Ok(note)
    }
}
