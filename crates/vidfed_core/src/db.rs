/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::FedError;
use crate::model::{
    now_ms, Account, Actor, ActorFields, ActorFollow, ActorType, FollowState, RateChange, RateType,
    RedundancyStrategy, Server, Video, VideoChannel, VideoComment, VideoFields, VideoFile,
    VideoPrivacy, VideoRedundancy,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const TX_ATTEMPTS: u32 = 5;

const ACTOR_SELECT: &str = r#"
    SELECT a.id, a.url, a.type, a.preferred_username, a.public_key_pem, a.private_key_pem,
           a.inbox_url, a.shared_inbox_url, a.outbox_url, a.followers_url, a.following_url,
           a.server_id, a.avatar_url, a.avatar_name, a.updated_at_ms, acc.id, ch.id
    FROM actors a
    LEFT JOIN accounts acc ON acc.actor_id = a.id
    LEFT JOIN video_channels ch ON ch.actor_id = a.id
"#;

const VIDEO_SELECT: &str = r#"
    SELECT v.id, v.uuid, v.url, v.name, v.description, v.privacy, v.channel_id, ch.actor_id,
           v.remote, v.is_live, v.views, v.likes, v.dislikes, v.duration_secs,
           v.published_at_ms, v.updated_at_ms
    FROM videos v
    JOIN video_channels ch ON ch.id = v.channel_id
"#;

const REDUNDANCY_SELECT: &str = r#"
    SELECT r.id, r.actor_id, r.video_file_id, f.video_id, f.size, r.strategy, r.expires_on_ms,
           r.file_url, r.url, r.created_at_ms
    FROM video_redundancies r
    JOIN video_files f ON f.id = r.video_file_id
"#;

#[derive(Clone)]
pub struct FedDb {
    path: PathBuf,
}

impl FedDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS servers (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              host TEXT NOT NULL UNIQUE,
              redundancy_allowed INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS actors (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              url TEXT NOT NULL UNIQUE,
              type TEXT NOT NULL,
              preferred_username TEXT NOT NULL,
              public_key_pem TEXT NOT NULL,
              private_key_pem TEXT NULL,
              inbox_url TEXT NOT NULL,
              shared_inbox_url TEXT NULL,
              outbox_url TEXT NULL,
              followers_url TEXT NULL,
              following_url TEXT NULL,
              server_id INTEGER NULL REFERENCES servers(id) ON DELETE CASCADE,
              avatar_url TEXT NULL,
              avatar_name TEXT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actors_followers ON actors(followers_url);
            CREATE INDEX IF NOT EXISTS idx_actors_inbox ON actors(inbox_url);
            CREATE INDEX IF NOT EXISTS idx_actors_shared_inbox ON actors(shared_inbox_url);

            CREATE TABLE IF NOT EXISTS accounts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              actor_id INTEGER NOT NULL UNIQUE REFERENCES actors(id) ON DELETE CASCADE,
              name TEXT NOT NULL,
              description TEXT NULL
            );

            CREATE TABLE IF NOT EXISTS video_channels (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              actor_id INTEGER NOT NULL UNIQUE REFERENCES actors(id) ON DELETE CASCADE,
              account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
              name TEXT NOT NULL,
              description TEXT NULL
            );

            CREATE TABLE IF NOT EXISTS actor_follows (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              actor_id INTEGER NOT NULL REFERENCES actors(id) ON DELETE CASCADE,
              target_actor_id INTEGER NOT NULL REFERENCES actors(id) ON DELETE CASCADE,
              state TEXT NOT NULL,
              url TEXT NULL,
              score INTEGER NOT NULL DEFAULT 1000,
              created_at_ms INTEGER NOT NULL,
              UNIQUE(actor_id, target_actor_id)
            );

            CREATE TABLE IF NOT EXISTS videos (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              uuid TEXT NOT NULL,
              url TEXT NOT NULL UNIQUE,
              name TEXT NOT NULL,
              description TEXT NULL,
              privacy INTEGER NOT NULL,
              channel_id INTEGER NOT NULL REFERENCES video_channels(id) ON DELETE CASCADE,
              remote INTEGER NOT NULL,
              is_live INTEGER NOT NULL DEFAULT 0,
              views INTEGER NOT NULL DEFAULT 0,
              likes INTEGER NOT NULL DEFAULT 0,
              dislikes INTEGER NOT NULL DEFAULT 0,
              duration_secs INTEGER NOT NULL DEFAULT 0,
              published_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS video_files (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
              resolution INTEGER NOT NULL,
              size INTEGER NOT NULL,
              file_url TEXT NOT NULL,
              UNIQUE(video_id, resolution)
            );

            CREATE TABLE IF NOT EXISTS video_shares (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              actor_id INTEGER NOT NULL REFERENCES actors(id) ON DELETE CASCADE,
              video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
              url TEXT NOT NULL UNIQUE,
              UNIQUE(actor_id, video_id)
            );

            CREATE TABLE IF NOT EXISTS account_video_rates (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
              video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
              type TEXT NOT NULL,
              url TEXT NULL,
              UNIQUE(account_id, video_id)
            );

            CREATE TABLE IF NOT EXISTS video_comments (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              url TEXT NOT NULL UNIQUE,
              text TEXT NOT NULL,
              origin_comment_id INTEGER NULL REFERENCES video_comments(id) ON DELETE CASCADE,
              in_reply_to_comment_id INTEGER NULL REFERENCES video_comments(id) ON DELETE CASCADE,
              video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
              account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS video_abuses (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              reporter_account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
              video_id INTEGER NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
              reason TEXT NOT NULL,
              url TEXT NULL UNIQUE,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS video_redundancies (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              actor_id INTEGER NOT NULL REFERENCES actors(id) ON DELETE CASCADE,
              video_file_id INTEGER NOT NULL REFERENCES video_files(id) ON DELETE CASCADE,
              strategy TEXT NULL,
              expires_on_ms INTEGER NULL,
              file_url TEXT NOT NULL,
              url TEXT NOT NULL UNIQUE,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_redundancy_expiry ON video_redundancies(actor_id, expires_on_ms);
            "#,
        )?;
        Ok(Self { path })
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    /// Runs `f` inside an immediate transaction, retrying on lock contention.
    fn write_tx<T>(&self, label: &str, mut f: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let res = (|| -> Result<T> {
                let mut conn = self.conn()?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let out = f(&*tx)?;
                tx.commit()?;
                Ok(out)
            })();
            match res {
                Err(e) if attempt < TX_ATTEMPTS && is_busy(&e) => {
                    debug!("{label}: database busy, retry {attempt}");
                    std::thread::sleep(Duration::from_millis(50u64 << attempt));
                }
                other => return other.with_context(|| format!("transaction {label}")),
            }
        }
    }

    // ---- servers ----

    pub fn set_server_redundancy_allowed(&self, host: &str, allowed: bool) -> Result<()> {
        let conn = self.conn()?;
        upsert_server(&conn, host)?;
        conn.execute(
            "UPDATE servers SET redundancy_allowed = ?2 WHERE host = ?1",
            params![host, allowed as i64],
        )?;
        Ok(())
    }

    // ---- actors ----

    pub fn load_actor(&self, id: i64) -> Result<Option<Actor>> {
        load_actor(&self.conn()?, id)
    }

    pub fn load_actor_by_url(&self, url: &str) -> Result<Option<Actor>> {
        load_actor_by_url(&self.conn()?, url)
    }

    pub fn load_actor_by_account(&self, account_id: i64) -> Result<Option<Actor>> {
        let conn = self.conn()?;
        let sql = format!("{ACTOR_SELECT} WHERE acc.id = ?1");
        Ok(conn.query_row(&sql, params![account_id], actor_from_row).optional()?)
    }

    pub fn load_local_actor(&self, name: &str, kind: ActorType) -> Result<Option<Actor>> {
        let conn = self.conn()?;
        let sql = format!(
            "{ACTOR_SELECT} WHERE a.server_id IS NULL AND a.preferred_username = ?1 AND a.type = ?2"
        );
        Ok(conn
            .query_row(&sql, params![name, kind.as_str()], actor_from_row)
            .optional()?)
    }

    pub fn list_actors_by_followers_urls(&self, urls: &[String]) -> Result<Vec<Actor>> {
        let conn = self.conn()?;
        let sql = format!("{ACTOR_SELECT} WHERE a.followers_url = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut out = Vec::new();
        for url in urls {
            if let Some(a) = stmt.query_row(params![url], actor_from_row).optional()? {
                if !out.iter().any(|x: &Actor| x.id == a.id) {
                    out.push(a);
                }
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    pub fn set_actor_updated_at(&self, id: i64, updated_at_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE actors SET updated_at_ms = ?2 WHERE id = ?1",
            params![id, updated_at_ms],
        )?;
        Ok(())
    }

    pub fn delete_actor(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM actors WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Inserts a remote actor with its server row and account or channel.
    /// Returns the existing row when another writer got there first.
    pub fn insert_remote_actor(
        &self,
        fields: &ActorFields,
        host: &str,
        owner_account_id: Option<i64>,
        avatar_name: Option<&str>,
    ) -> Result<(Actor, bool)> {
        self.write_tx("insert remote actor", |tx| {
            let server = upsert_server(tx, host)?;
            let changed = tx.execute(
                r#"
                INSERT INTO actors (
                  url, type, preferred_username, public_key_pem, private_key_pem, inbox_url,
                  shared_inbox_url, outbox_url, followers_url, following_url, server_id,
                  avatar_url, avatar_name, updated_at_ms
                ) VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(url) DO NOTHING
                "#,
                params![
                    fields.url,
                    fields.kind.as_str(),
                    fields.preferred_username,
                    fields.public_key_pem,
                    fields.inbox_url,
                    fields.shared_inbox_url,
                    fields.outbox_url,
                    fields.followers_url,
                    fields.following_url,
                    server.id,
                    fields.avatar_url,
                    avatar_name,
                    now_ms()
                ],
            )?;
            if changed == 0 {
                let existing = load_actor_by_url(tx, &fields.url)?
                    .ok_or_else(|| anyhow!("actor vanished during insert: {}", fields.url))?;
                return Ok((existing, false));
            }
            let actor_id = tx.last_insert_rowid();
            attach_model(tx, actor_id, fields, owner_account_id)?;
            let actor = load_actor(tx, actor_id)?.ok_or_else(|| anyhow!("actor insert lost"))?;
            Ok((actor, true))
        })
    }

    /// Replaces every mutable attribute of a remote actor in one transaction.
    pub fn update_remote_actor(
        &self,
        actor_id: i64,
        fields: &ActorFields,
        avatar_name: Option<&str>,
    ) -> Result<Actor> {
        self.write_tx("update remote actor", |tx| {
            tx.execute(
                r#"
                UPDATE actors SET
                  type = ?2, preferred_username = ?3, public_key_pem = ?4, inbox_url = ?5,
                  shared_inbox_url = ?6, outbox_url = ?7, followers_url = ?8, following_url = ?9,
                  avatar_url = ?10, avatar_name = ?11, updated_at_ms = ?12
                WHERE id = ?1
                "#,
                params![
                    actor_id,
                    fields.kind.as_str(),
                    fields.preferred_username,
                    fields.public_key_pem,
                    fields.inbox_url,
                    fields.shared_inbox_url,
                    fields.outbox_url,
                    fields.followers_url,
                    fields.following_url,
                    fields.avatar_url,
                    avatar_name,
                    now_ms()
                ],
            )?;
            tx.execute(
                "UPDATE accounts SET name = ?2, description = ?3 WHERE actor_id = ?1",
                params![actor_id, fields.display_name, fields.summary],
            )?;
            tx.execute(
                "UPDATE video_channels SET name = ?2, description = ?3 WHERE actor_id = ?1",
                params![actor_id, fields.display_name, fields.summary],
            )?;
            load_actor(tx, actor_id)?.ok_or_else(|| anyhow!("actor {actor_id} missing"))
        })
    }

    pub fn insert_local_account(
        &self,
        base_url: &str,
        name: &str,
        kind: ActorType,
        public_key_pem: &str,
        private_key_pem: &str,
    ) -> Result<Actor> {
        let url = format!("{}/accounts/{name}", base_url.trim_end_matches('/'));
        self.insert_local_actor(&url, base_url, name, kind, public_key_pem, private_key_pem, None)
    }

    pub fn insert_local_channel(
        &self,
        base_url: &str,
        name: &str,
        owner_account_id: i64,
        public_key_pem: &str,
        private_key_pem: &str,
    ) -> Result<Actor> {
        let url = format!("{}/video-channels/{name}", base_url.trim_end_matches('/'));
        self.insert_local_actor(
            &url,
            base_url,
            name,
            ActorType::Group,
            public_key_pem,
            private_key_pem,
            Some(owner_account_id),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_local_actor(
        &self,
        url: &str,
        base_url: &str,
        name: &str,
        kind: ActorType,
        public_key_pem: &str,
        private_key_pem: &str,
        owner_account_id: Option<i64>,
    ) -> Result<Actor> {
        let fields = ActorFields {
            url: url.to_string(),
            kind,
            preferred_username: name.to_string(),
            display_name: name.to_string(),
            summary: None,
            public_key_pem: public_key_pem.to_string(),
            inbox_url: format!("{url}/inbox"),
            shared_inbox_url: Some(format!("{}/inbox", base_url.trim_end_matches('/'))),
            outbox_url: Some(format!("{url}/outbox")),
            followers_url: Some(format!("{url}/followers")),
            following_url: Some(format!("{url}/following")),
            avatar_url: None,
        };
        self.write_tx("insert local actor", |tx| {
            if let Some(existing) = load_actor_by_url(tx, url)? {
                return Ok(existing);
            }
            tx.execute(
                r#"
                INSERT INTO actors (
                  url, type, preferred_username, public_key_pem, private_key_pem, inbox_url,
                  shared_inbox_url, outbox_url, followers_url, following_url, server_id,
                  avatar_url, avatar_name, updated_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL, NULL, ?11)
                "#,
                params![
                    fields.url,
                    fields.kind.as_str(),
                    fields.preferred_username,
                    fields.public_key_pem,
                    private_key_pem,
                    fields.inbox_url,
                    fields.shared_inbox_url,
                    fields.outbox_url,
                    fields.followers_url,
                    fields.following_url,
                    now_ms()
                ],
            )?;
            let actor_id = tx.last_insert_rowid();
            attach_model(tx, actor_id, &fields, owner_account_id)?;
            load_actor(tx, actor_id)?.ok_or_else(|| anyhow!("actor insert lost"))
        })
    }

    // ---- accounts / channels ----

    pub fn load_account(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, actor_id, name, description FROM accounts WHERE id = ?1",
                params![id],
                |r| {
                    Ok(Account {
                        id: r.get(0)?,
                        actor_id: r.get(1)?,
                        name: r.get(2)?,
                        description: r.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn load_channel(&self, id: i64) -> Result<Option<VideoChannel>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, actor_id, account_id, name, description FROM video_channels WHERE id = ?1",
                params![id],
                |r| {
                    Ok(VideoChannel {
                        id: r.get(0)?,
                        actor_id: r.get(1)?,
                        account_id: r.get(2)?,
                        name: r.get(3)?,
                        description: r.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    // ---- follows ----

    pub fn load_follow(&self, actor_id: i64, target_actor_id: i64) -> Result<Option<ActorFollow>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, actor_id, target_actor_id, state, url, score FROM actor_follows WHERE actor_id = ?1 AND target_actor_id = ?2",
                params![actor_id, target_actor_id],
                follow_from_row,
            )
            .optional()?)
    }

    /// At most one edge exists per pair; an existing edge is returned untouched.
    pub fn find_or_create_follow(
        &self,
        actor_id: i64,
        target_actor_id: i64,
        state: FollowState,
        url: Option<&str>,
    ) -> Result<(ActorFollow, bool)> {
        self.write_tx("find or create follow", |tx| {
            let changed = tx.execute(
                r#"
                INSERT INTO actor_follows(actor_id, target_actor_id, state, url, score, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(actor_id, target_actor_id) DO NOTHING
                "#,
                params![
                    actor_id,
                    target_actor_id,
                    state.as_str(),
                    url,
                    crate::peer_health::FOLLOW_SCORE_BASE,
                    now_ms()
                ],
            )?;
            let follow = tx.query_row(
                "SELECT id, actor_id, target_actor_id, state, url, score FROM actor_follows WHERE actor_id = ?1 AND target_actor_id = ?2",
                params![actor_id, target_actor_id],
                follow_from_row,
            )?;
            Ok((follow, changed > 0))
        })
    }

    pub fn set_follow_state(&self, follow_id: i64, state: FollowState) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE actor_follows SET state = ?2 WHERE id = ?1",
            params![follow_id, state.as_str()],
        )?;
        Ok(())
    }

    pub fn delete_follow(&self, follow_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM actor_follows WHERE id = ?1", params![follow_id])?;
        Ok(())
    }

    /// Shared inbox (or inbox) of every accepted follower of `target_ids`, deduplicated.
    pub fn list_accepted_follower_inboxes(&self, target_ids: &[i64]) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT COALESCE(a.shared_inbox_url, a.inbox_url)
            FROM actor_follows f
            JOIN actors a ON a.id = f.actor_id
            WHERE f.target_actor_id = ?1 AND f.state = 'accepted'
            ORDER BY f.id ASC
            "#,
        )?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut out: Vec<String> = Vec::new();
        for target in target_ids {
            let rows = stmt.query_map(params![target], |r| r.get::<_, String>(0))?;
            for inbox in rows {
                let inbox = inbox?;
                if seen.insert(inbox.clone()) {
                    out.push(inbox);
                }
            }
        }
        Ok(out)
    }

    /// Adds `delta` to every follow whose follower delivers to `inbox`, capped at `max`.
    pub fn adjust_follow_scores(&self, inbox: &str, delta: i64, max: i64) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE actor_follows SET score = MIN(score + ?2, ?3)
            WHERE actor_id IN (
              SELECT id FROM actors WHERE inbox_url = ?1 OR shared_inbox_url = ?1
            )
            "#,
            params![inbox, delta, max],
        )?;
        Ok(changed)
    }

    pub fn remove_bad_follows(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM actor_follows WHERE score <= 0", [])?)
    }

    // ---- videos ----

    pub fn load_video(&self, id: i64) -> Result<Option<Video>> {
        let conn = self.conn()?;
        let sql = format!("{VIDEO_SELECT} WHERE v.id = ?1");
        Ok(conn.query_row(&sql, params![id], video_from_row).optional()?)
    }

    pub fn load_video_by_url(&self, url: &str) -> Result<Option<Video>> {
        load_video_by_url(&self.conn()?, url)
    }

    pub fn insert_video(&self, fields: &VideoFields, channel_id: i64, remote: bool) -> Result<(Video, bool)> {
        self.write_tx("insert video", |tx| {
            let now = now_ms();
            let changed = tx.execute(
                r#"
                INSERT INTO videos (
                  uuid, url, name, description, privacy, channel_id, remote, is_live, views,
                  likes, dislikes, duration_secs, published_at_ms, updated_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?11, ?12)
                ON CONFLICT(url) DO NOTHING
                "#,
                params![
                    fields.uuid,
                    fields.url,
                    fields.name,
                    fields.description,
                    fields.privacy.as_i64(),
                    channel_id,
                    remote as i64,
                    fields.is_live as i64,
                    fields.views,
                    fields.duration_secs,
                    fields.published_at_ms,
                    now
                ],
            )?;
            if changed == 0 {
                let existing = load_video_by_url(tx, &fields.url)?
                    .ok_or_else(|| anyhow!("video vanished during insert: {}", fields.url))?;
                return Ok((existing, false));
            }
            let video_id = tx.last_insert_rowid();
            replace_files(tx, video_id, fields)?;
            let video = load_video_by_url(tx, &fields.url)?.ok_or_else(|| anyhow!("video insert lost"))?;
            Ok((video, true))
        })
    }

    /// Snapshot-and-replace of the mutable video attributes and its file list.
    pub fn update_video(&self, video_id: i64, fields: &VideoFields) -> Result<Video> {
        self.write_tx("update video", |tx| {
            tx.execute(
                r#"
                UPDATE videos SET
                  name = ?2, description = ?3, privacy = ?4, is_live = ?5, views = MAX(views, ?6),
                  duration_secs = ?7, published_at_ms = ?8, updated_at_ms = ?9
                WHERE id = ?1
                "#,
                params![
                    video_id,
                    fields.name,
                    fields.description,
                    fields.privacy.as_i64(),
                    fields.is_live as i64,
                    fields.views,
                    fields.duration_secs,
                    fields.published_at_ms,
                    now_ms()
                ],
            )?;
            replace_files(tx, video_id, fields)?;
            let sql = format!("{VIDEO_SELECT} WHERE v.id = ?1");
            tx.query_row(&sql, params![video_id], video_from_row)
                .optional()?
                .ok_or_else(|| anyhow!("video {video_id} missing"))
        })
    }

    pub fn delete_video(&self, video_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM videos WHERE id = ?1", params![video_id])?;
        Ok(())
    }

    pub fn add_views(&self, video_id: i64, n: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE videos SET views = views + ?2 WHERE id = ?1",
            params![video_id, n],
        )?;
        Ok(())
    }

    pub fn list_video_files(&self, video_id: i64) -> Result<Vec<VideoFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, video_id, resolution, size, file_url FROM video_files WHERE video_id = ?1 ORDER BY resolution DESC",
        )?;
        let rows = stmt.query_map(params![video_id], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn load_video_file(&self, file_id: i64) -> Result<Option<VideoFile>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, video_id, resolution, size, file_url FROM video_files WHERE id = ?1",
                params![file_id],
                file_from_row,
            )
            .optional()?)
    }

    pub fn load_video_file_by_resolution(&self, video_id: i64, resolution: i64) -> Result<Option<VideoFile>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, video_id, resolution, size, file_url FROM video_files WHERE video_id = ?1 AND resolution = ?2",
                params![video_id, resolution],
                file_from_row,
            )
            .optional()?)
    }

    /// Remote public non-live videos of redundancy-friendly servers that we do not
    /// mirror yet, ordered by `strategy`.
    pub fn list_redundancy_candidates(
        &self,
        strategy: RedundancyStrategy,
        mirror_actor_id: i64,
        published_after_ms: i64,
        min_views: i64,
        limit: u32,
    ) -> Result<Vec<Video>> {
        let order = match strategy {
            RedundancyStrategy::MostViews => "v.views DESC",
            RedundancyStrategy::Trending => {
                "(v.views * 86400000.0) / MAX(86400000, ?5 - v.published_at_ms) DESC"
            }
            RedundancyStrategy::RecentlyAdded | RedundancyStrategy::Manual => "v.published_at_ms DESC",
        };
        let sql = format!(
            r#"
            {VIDEO_SELECT}
            JOIN actors ca ON ca.id = ch.actor_id
            JOIN servers s ON s.id = ca.server_id
            WHERE v.remote = 1 AND v.privacy = 1 AND v.is_live = 0
              AND s.redundancy_allowed = 1
              AND v.published_at_ms >= ?2
              AND v.views >= ?3
              AND EXISTS (SELECT 1 FROM video_files f WHERE f.video_id = v.id)
              AND NOT EXISTS (
                SELECT 1 FROM video_redundancies r
                JOIN video_files f ON f.id = r.video_file_id
                WHERE f.video_id = v.id AND r.actor_id = ?1
              )
            ORDER BY {order}
            LIMIT ?4
            "#
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let now = now_ms();
        let rows = if matches!(strategy, RedundancyStrategy::Trending) {
            stmt.query_map(
                params![mirror_actor_id, published_after_ms, min_views, limit, now],
                video_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(
                params![mirror_actor_id, published_after_ms, min_views, limit],
                video_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    // ---- shares ----

    pub fn insert_share(&self, actor_id: i64, video_id: i64, url: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO video_shares(actor_id, video_id, url) VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
            params![actor_id, video_id, url],
        )?;
        Ok(changed > 0)
    }

    /// Removes a share made by `actor_id`; returns the video it pointed at.
    pub fn delete_share(&self, actor_id: i64, url: &str) -> Result<Option<i64>> {
        self.write_tx("delete share", |tx| {
            let video_id: Option<i64> = tx
                .query_row(
                    "SELECT video_id FROM video_shares WHERE url = ?1 AND actor_id = ?2",
                    params![url, actor_id],
                    |r| r.get(0),
                )
                .optional()?;
            if video_id.is_some() {
                tx.execute(
                    "DELETE FROM video_shares WHERE url = ?1 AND actor_id = ?2",
                    params![url, actor_id],
                )?;
            }
            Ok(video_id)
        })
    }

    pub fn list_sharer_actors(&self, video_id: i64) -> Result<Vec<Actor>> {
        let conn = self.conn()?;
        let sql = format!(
            "{ACTOR_SELECT} WHERE a.id IN (SELECT actor_id FROM video_shares WHERE video_id = ?1) ORDER BY a.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![video_id], actor_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- rates ----

    /// Idempotent per (account, video); counters move only on creation or type switch.
    pub fn upsert_rate(
        &self,
        account_id: i64,
        video_id: i64,
        rate: RateType,
        url: Option<&str>,
    ) -> Result<RateChange> {
        self.write_tx("upsert rate", |tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT type FROM account_video_rates WHERE account_id = ?1 AND video_id = ?2",
                    params![account_id, video_id],
                    |r| r.get(0),
                )
                .optional()?;
            match existing.map(|t| RateType::parse(&t)) {
                Some(prev) if prev == rate => Ok(RateChange::Unchanged),
                Some(prev) => {
                    tx.execute(
                        "UPDATE account_video_rates SET type = ?3, url = COALESCE(?4, url) WHERE account_id = ?1 AND video_id = ?2",
                        params![account_id, video_id, rate.as_str(), url],
                    )?;
                    bump_counter(tx, video_id, prev, -1)?;
                    bump_counter(tx, video_id, rate, 1)?;
                    Ok(RateChange::Switched)
                }
                None => {
                    tx.execute(
                        "INSERT INTO account_video_rates(account_id, video_id, type, url) VALUES (?1, ?2, ?3, ?4)",
                        params![account_id, video_id, rate.as_str(), url],
                    )?;
                    bump_counter(tx, video_id, rate, 1)?;
                    Ok(RateChange::Created)
                }
            }
        })
    }

    /// Removes a rate of the given type; a rate of the other type is left alone.
    pub fn remove_rate(&self, account_id: i64, video_id: i64, rate: RateType) -> Result<bool> {
        self.write_tx("remove rate", |tx| {
            let changed = tx.execute(
                "DELETE FROM account_video_rates WHERE account_id = ?1 AND video_id = ?2 AND type = ?3",
                params![account_id, video_id, rate.as_str()],
            )?;
            if changed > 0 {
                bump_counter(tx, video_id, rate, -1)?;
            }
            Ok(changed > 0)
        })
    }

    // ---- comments ----

    pub fn load_comment(&self, id: i64) -> Result<Option<VideoComment>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, url, text, origin_comment_id, in_reply_to_comment_id, video_id, account_id FROM video_comments WHERE id = ?1",
                params![id],
                comment_from_row,
            )
            .optional()?)
    }

    pub fn load_comment_by_url(&self, url: &str) -> Result<Option<VideoComment>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, url, text, origin_comment_id, in_reply_to_comment_id, video_id, account_id FROM video_comments WHERE url = ?1",
                params![url],
                comment_from_row,
            )
            .optional()?)
    }

    /// Inserts a chain of comments, oldest first, each replying to the previous one.
    /// `parent` is the already-stored comment the chain hangs under, if any.
    pub fn insert_comment_chain(
        &self,
        video_id: i64,
        parent: Option<&VideoComment>,
        chain: &[NewComment],
    ) -> Result<Vec<(VideoComment, bool)>> {
        self.write_tx("insert comment chain", |tx| {
            let mut out = Vec::with_capacity(chain.len());
            let mut origin = parent.map(|p| p.origin_comment_id.unwrap_or(p.id));
            let mut in_reply_to = parent.map(|p| p.id);
            for c in chain {
                let changed = tx.execute(
                    r#"
                    INSERT INTO video_comments(url, text, origin_comment_id, in_reply_to_comment_id, video_id, account_id, created_at_ms)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(url) DO NOTHING
                    "#,
                    params![c.url, c.text, origin, in_reply_to, video_id, c.account_id, now_ms()],
                )?;
                let stored = tx.query_row(
                    "SELECT id, url, text, origin_comment_id, in_reply_to_comment_id, video_id, account_id FROM video_comments WHERE url = ?1",
                    params![c.url],
                    comment_from_row,
                )?;
                origin = Some(stored.origin_comment_id.unwrap_or(stored.id));
                in_reply_to = Some(stored.id);
                out.push((stored, changed > 0));
            }
            Ok(out)
        })
    }

    pub fn delete_comment(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM video_comments WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Ancestors of `comment`, nearest parent first.
    pub fn list_comment_ancestors(&self, comment: &VideoComment) -> Result<Vec<VideoComment>> {
        let mut out = Vec::new();
        let mut next = comment.in_reply_to_comment_id;
        while let Some(id) = next {
            let Some(parent) = self.load_comment(id)? else {
                break;
            };
            next = parent.in_reply_to_comment_id;
            out.push(parent);
        }
        Ok(out)
    }

    // ---- abuses ----

    pub fn insert_abuse(&self, reporter_account_id: i64, video_id: i64, reason: &str, url: Option<&str>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO video_abuses(reporter_account_id, video_id, reason, url, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT DO NOTHING",
            params![reporter_account_id, video_id, reason, url, now_ms()],
        )?;
        Ok(changed > 0)
    }

    // ---- redundancies ----

    pub fn load_redundancy_by_url(&self, url: &str) -> Result<Option<VideoRedundancy>> {
        let conn = self.conn()?;
        let sql = format!("{REDUNDANCY_SELECT} WHERE r.url = ?1");
        Ok(conn.query_row(&sql, params![url], redundancy_from_row).optional()?)
    }

    pub fn load_redundancy_for_file(&self, actor_id: i64, file_id: i64) -> Result<Option<VideoRedundancy>> {
        let conn = self.conn()?;
        let sql = format!("{REDUNDANCY_SELECT} WHERE r.actor_id = ?1 AND r.video_file_id = ?2");
        Ok(conn
            .query_row(&sql, params![actor_id, file_id], redundancy_from_row)
            .optional()?)
    }

    /// Creates the record, or refreshes expiration and file location of an existing one.
    pub fn upsert_redundancy(&self, new: &NewRedundancy) -> Result<(VideoRedundancy, bool)> {
        self.write_tx("upsert redundancy", |tx| {
            let existed: bool = tx
                .query_row(
                    "SELECT 1 FROM video_redundancies WHERE url = ?1",
                    params![new.url],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            tx.execute(
                r#"
                INSERT INTO video_redundancies(actor_id, video_file_id, strategy, expires_on_ms, file_url, url, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(url) DO UPDATE SET
                  expires_on_ms = excluded.expires_on_ms,
                  file_url = excluded.file_url
                "#,
                params![
                    new.actor_id,
                    new.video_file_id,
                    new.strategy.map(|s| s.as_str()),
                    new.expires_on_ms,
                    new.file_url,
                    new.url,
                    now_ms()
                ],
            )?;
            let sql = format!("{REDUNDANCY_SELECT} WHERE r.url = ?1");
            let row = tx.query_row(&sql, params![new.url], redundancy_from_row)?;
            Ok((row, !existed))
        })
    }

    pub fn extend_redundancy(&self, id: i64, expires_on_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE video_redundancies SET expires_on_ms = ?2 WHERE id = ?1",
            params![id, expires_on_ms],
        )?;
        Ok(())
    }

    pub fn delete_redundancy(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM video_redundancies WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Bytes mirrored by `actor_id` under `strategy`.
    pub fn redundancy_total_used(&self, actor_id: i64, strategy: RedundancyStrategy) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            r#"
            SELECT COALESCE(SUM(f.size), 0)
            FROM video_redundancies r
            JOIN video_files f ON f.id = r.video_file_id
            WHERE r.actor_id = ?1 AND r.strategy = ?2
            "#,
            params![actor_id, strategy.as_str()],
            |r| r.get(0),
        )?)
    }

    pub fn oldest_expired_local_redundancy(
        &self,
        actor_id: i64,
        strategy: RedundancyStrategy,
        now_ms: i64,
    ) -> Result<Option<VideoRedundancy>> {
        let conn = self.conn()?;
        let sql = format!(
            "{REDUNDANCY_SELECT} WHERE r.actor_id = ?1 AND r.strategy = ?2 AND r.expires_on_ms IS NOT NULL AND r.expires_on_ms < ?3 ORDER BY r.expires_on_ms ASC LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![actor_id, strategy.as_str(), now_ms], redundancy_from_row)
            .optional()?)
    }

    pub fn list_expired_redundancies(&self, actor_id: i64, local: bool, now_ms: i64) -> Result<Vec<VideoRedundancy>> {
        let conn = self.conn()?;
        let owner = if local { "r.actor_id = ?1" } else { "r.actor_id != ?1" };
        let sql = format!(
            "{REDUNDANCY_SELECT} WHERE {owner} AND r.expires_on_ms IS NOT NULL AND r.expires_on_ms < ?2 ORDER BY r.expires_on_ms ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![actor_id, now_ms], redundancy_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[derive(Debug, Clone)]
pub struct NewComment {
    pub url: String,
    pub text: String,
    pub account_id: i64,
}

#[derive(Debug, Clone)]
pub struct NewRedundancy {
    pub actor_id: i64,
    pub video_file_id: i64,
    pub strategy: Option<RedundancyStrategy>,
    pub expires_on_ms: Option<i64>,
    pub file_url: String,
    pub url: String,
}

fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        matches!(
            e.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(f, _))
                if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

fn upsert_server(conn: &Connection, host: &str) -> Result<Server> {
    conn.execute(
        "INSERT INTO servers(host, redundancy_allowed) VALUES (?1, 1) ON CONFLICT(host) DO NOTHING",
        params![host],
    )?;
    Ok(conn.query_row(
        "SELECT id, host, redundancy_allowed FROM servers WHERE host = ?1",
        params![host],
        server_from_row,
    )?)
}

/// Binds an actor row to its account (Person/Application) or channel (Group).
fn attach_model(conn: &Connection, actor_id: i64, fields: &ActorFields, owner_account_id: Option<i64>) -> Result<()> {
    match fields.kind {
        ActorType::Group => {
            let owner = owner_account_id
                .ok_or_else(|| FedError::MissingLink(format!("owner account of channel {}", fields.url)))?;
            conn.execute(
                "INSERT INTO video_channels(actor_id, account_id, name, description) VALUES (?1, ?2, ?3, ?4) ON CONFLICT(actor_id) DO NOTHING",
                params![actor_id, owner, fields.display_name, fields.summary],
            )?;
        }
        ActorType::Person | ActorType::Application => {
            conn.execute(
                "INSERT INTO accounts(actor_id, name, description) VALUES (?1, ?2, ?3) ON CONFLICT(actor_id) DO NOTHING",
                params![actor_id, fields.display_name, fields.summary],
            )?;
        }
    }
    Ok(())
}

fn replace_files(conn: &Connection, video_id: i64, fields: &VideoFields) -> Result<()> {
    let keep: Vec<i64> = fields.files.iter().map(|f| f.resolution).collect();
    let mut stmt = conn.prepare("SELECT id, resolution FROM video_files WHERE video_id = ?1")?;
    let existing = stmt
        .query_map(params![video_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (id, resolution) in existing {
        if !keep.contains(&resolution) {
            conn.execute("DELETE FROM video_files WHERE id = ?1", params![id])?;
        }
    }
    for f in &fields.files {
        conn.execute(
            r#"
            INSERT INTO video_files(video_id, resolution, size, file_url) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(video_id, resolution) DO UPDATE SET size = excluded.size, file_url = excluded.file_url
            "#,
            params![video_id, f.resolution, f.size, f.file_url],
        )?;
    }
    Ok(())
}

fn bump_counter(conn: &Connection, video_id: i64, rate: RateType, delta: i64) -> Result<()> {
    let sql = format!(
        "UPDATE videos SET {col} = MAX(0, {col} + ?2) WHERE id = ?1",
        col = rate.counter()
    );
    conn.execute(&sql, params![video_id, delta])?;
    Ok(())
}

fn load_actor(conn: &Connection, id: i64) -> Result<Option<Actor>> {
    let sql = format!("{ACTOR_SELECT} WHERE a.id = ?1");
    Ok(conn.query_row(&sql, params![id], actor_from_row).optional()?)
}

fn load_actor_by_url(conn: &Connection, url: &str) -> Result<Option<Actor>> {
    let sql = format!("{ACTOR_SELECT} WHERE a.url = ?1");
    Ok(conn.query_row(&sql, params![url], actor_from_row).optional()?)
}

fn load_video_by_url(conn: &Connection, url: &str) -> Result<Option<Video>> {
    let sql = format!("{VIDEO_SELECT} WHERE v.url = ?1");
    Ok(conn.query_row(&sql, params![url], video_from_row).optional()?)
}

fn server_from_row(r: &Row<'_>) -> rusqlite::Result<Server> {
    Ok(Server {
        id: r.get(0)?,
        host: r.get(1)?,
        redundancy_allowed: r.get::<_, i64>(2)? != 0,
    })
}

fn actor_from_row(r: &Row<'_>) -> rusqlite::Result<Actor> {
    let kind: String = r.get(2)?;
    Ok(Actor {
        id: r.get(0)?,
        url: r.get(1)?,
        kind: ActorType::parse(&kind).unwrap_or(ActorType::Person),
        preferred_username: r.get(3)?,
        public_key_pem: r.get(4)?,
        private_key_pem: r.get(5)?,
        inbox_url: r.get(6)?,
        shared_inbox_url: r.get(7)?,
        outbox_url: r.get(8)?,
        followers_url: r.get(9)?,
        following_url: r.get(10)?,
        server_id: r.get(11)?,
        avatar_url: r.get(12)?,
        avatar_name: r.get(13)?,
        updated_at_ms: r.get(14)?,
        account_id: r.get(15)?,
        channel_id: r.get(16)?,
    })
}

fn follow_from_row(r: &Row<'_>) -> rusqlite::Result<ActorFollow> {
    let state: String = r.get(3)?;
    Ok(ActorFollow {
        id: r.get(0)?,
        actor_id: r.get(1)?,
        target_actor_id: r.get(2)?,
        state: FollowState::parse(&state),
        url: r.get(4)?,
        score: r.get(5)?,
    })
}

fn video_from_row(r: &Row<'_>) -> rusqlite::Result<Video> {
    Ok(Video {
        id: r.get(0)?,
        uuid: r.get(1)?,
        url: r.get(2)?,
        name: r.get(3)?,
        description: r.get(4)?,
        privacy: VideoPrivacy::from_i64(r.get(5)?),
        channel_id: r.get(6)?,
        channel_actor_id: r.get(7)?,
        remote: r.get::<_, i64>(8)? != 0,
        is_live: r.get::<_, i64>(9)? != 0,
        views: r.get(10)?,
        likes: r.get(11)?,
        dislikes: r.get(12)?,
        duration_secs: r.get(13)?,
        published_at_ms: r.get(14)?,
        updated_at_ms: r.get(15)?,
    })
}

fn file_from_row(r: &Row<'_>) -> rusqlite::Result<VideoFile> {
    Ok(VideoFile {
        id: r.get(0)?,
        video_id: r.get(1)?,
        resolution: r.get(2)?,
        size: r.get(3)?,
        file_url: r.get(4)?,
    })
}

fn comment_from_row(r: &Row<'_>) -> rusqlite::Result<VideoComment> {
    Ok(VideoComment {
        id: r.get(0)?,
        url: r.get(1)?,
        text: r.get(2)?,
        origin_comment_id: r.get(3)?,
        in_reply_to_comment_id: r.get(4)?,
        video_id: r.get(5)?,
        account_id: r.get(6)?,
    })
}

fn redundancy_from_row(r: &Row<'_>) -> rusqlite::Result<VideoRedundancy> {
    let strategy: Option<String> = r.get(5)?;
    Ok(VideoRedundancy {
        id: r.get(0)?,
        actor_id: r.get(1)?,
        video_file_id: r.get(2)?,
        video_id: r.get(3)?,
        size: r.get(4)?,
        strategy: strategy.as_deref().and_then(RedundancyStrategy::parse),
        expires_on_ms: r.get(6)?,
        file_url: r.get(7)?,
        url: r.get(8)?,
        created_at_ms: r.get(9)?,
    })
}
