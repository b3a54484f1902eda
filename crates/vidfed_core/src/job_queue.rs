/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::{JobOverride, JobOverrides};
use crate::net_metrics::NetMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, TransactionBehavior};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vidfed_protocol::JobPayload;

const STATUS_PENDING: i64 = 0;
const STATUS_DONE: i64 = 1;
const STATUS_DEAD: i64 = 2;
const STATUS_RUNNING: i64 = 3;

/// Finished jobs are kept this long for inspection, dead ones longer.
pub const DONE_RETENTION: Duration = Duration::from_secs(24 * 3600);
pub const DEAD_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
const PURGE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Broadcast,
    Unicast,
    Fetch,
    Follow,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [JobKind::Broadcast, JobKind::Unicast, JobKind::Fetch, JobKind::Follow];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Broadcast => "broadcast",
            JobKind::Unicast => "unicast",
            JobKind::Fetch => "fetch",
            JobKind::Follow => "follow",
        }
    }

    pub fn of(payload: &JobPayload) -> Self {
        match payload {
            JobPayload::Broadcast(_) => JobKind::Broadcast,
            JobPayload::Unicast(_) => JobKind::Unicast,
            JobPayload::Fetch(_) => JobKind::Fetch,
            JobPayload::Follow(_) => JobKind::Follow,
        }
    }

    fn index(&self) -> usize {
        match self {
            JobKind::Broadcast => 0,
            JobKind::Unicast => 1,
            JobKind::Fetch => 2,
            JobKind::Follow => 3,
        }
    }
}

/// Per-type execution limits.
#[derive(Clone, Copy, Debug)]
pub struct JobSpec {
    pub attempts: u32,
    pub concurrency: usize,
    pub timeout: Duration,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl JobSpec {
    pub fn defaults(kind: JobKind) -> Self {
        let (attempts, concurrency, timeout) = match kind {
            JobKind::Broadcast => (1, 1, Duration::from_secs(10 * 60)),
            JobKind::Unicast => (5, 30, Duration::from_secs(10 * 60)),
            JobKind::Fetch => (2, 3, Duration::from_secs(10 * 3600)),
            JobKind::Follow => (5, 1, Duration::from_secs(10 * 60)),
        };
        Self {
            attempts,
            concurrency,
            timeout,
            base_backoff_secs: 5,
            max_backoff_secs: 3600,
        }
    }

    pub fn with_override(mut self, o: Option<JobOverride>) -> Self {
        if let Some(o) = o {
            if let Some(v) = o.attempts {
                self.attempts = v.max(1);
            }
            if let Some(v) = o.concurrency {
                self.concurrency = v.max(1);
            }
            if let Some(v) = o.timeout_secs {
                self.timeout = Duration::from_secs(v.max(1));
            }
        }
        self
    }

    pub fn from_config(kind: JobKind, overrides: &JobOverrides) -> Self {
        let o = match kind {
            JobKind::Broadcast => overrides.broadcast,
            JobKind::Unicast => overrides.unicast,
            JobKind::Fetch => overrides.fetch,
            JobKind::Follow => overrides.follow,
        };
        Self::defaults(kind).with_override(o)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Retry { delay: Option<Duration>, reason: String },
    Fatal(String),
}

impl JobOutcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        JobOutcome::Retry {
            delay: None,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: JobPayload) -> JobOutcome;
}

#[derive(Clone)]
pub struct JobQueue {
    db_path: PathBuf,
    notify: Arc<[Notify; 4]>,
    metrics: Arc<NetMetrics>,
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub attempt: u32,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub done: u64,
    pub dead: u64,
}

impl JobQueue {
    pub fn open(db_path: impl AsRef<Path>, metrics: Arc<NetMetrics>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            notify: Arc::new([Notify::new(), Notify::new(), Notify::new(), Notify::new()]),
            metrics,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub async fn enqueue(&self, payload: JobPayload) -> Result<String> {
        let kind = JobKind::of(&payload);
        let json = serde_json::to_string(&payload).context("encode job payload")?;
        let id = new_job_id();
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.clone();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                let now = now_ms();
                conn.execute(
                    r#"
                    INSERT INTO jobs (id, kind, created_at_ms, next_attempt_at_ms, attempt, status, payload, last_error)
                    VALUES (?1, ?2, ?3, ?3, 0, ?4, ?5, NULL)
                    "#,
                    params![id, kind.as_str(), now, STATUS_PENDING, json],
                )?;
                Ok(())
            }
        })
        .await??;
        debug!("queued {} job {id}", kind.as_str());
        self.notify[kind.index()].notify_one();
        Ok(id)
    }

    /// Spawns one scheduler loop per job kind plus the retention purge.
    pub fn start_workers(
        &self,
        shutdown: watch::Receiver<bool>,
        handler: Arc<dyn JobHandler>,
        overrides: &JobOverrides,
    ) {
        self.start_purge(shutdown.clone());
        for kind in JobKind::ALL {
            let queue = self.clone();
            let spec = JobSpec::from_config(kind, overrides);
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.run_loop(kind, spec, handler, shutdown).await {
                    warn!("{} job worker stopped: {e:#}", kind.as_str());
                }
            });
        }
    }

    fn start_purge(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PURGE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() { break; }
                        continue;
                    }
                }
                match queue.purge_finished(now_ms()).await {
                    Ok(0) => {}
                    Ok(n) => debug!("purged {n} finished jobs"),
                    Err(e) => warn!("job purge failed: {e:#}"),
                }
            }
        });
    }

    /// Deletes done jobs older than `DONE_RETENTION` and dead ones older than
    /// `DEAD_RETENTION`, measured from when they finished.
    pub async fn purge_finished(&self, now: i64) -> Result<u64> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<u64> {
                let conn = open_conn(&db_path)?;
                let done_cutoff = now.saturating_sub(DONE_RETENTION.as_millis() as i64);
                let dead_cutoff = now.saturating_sub(DEAD_RETENTION.as_millis() as i64);
                let n = conn.execute(
                    r#"
                    DELETE FROM jobs
                    WHERE (status = ?1 AND finished_at_ms < ?2)
                       OR (status = ?3 AND finished_at_ms < ?4)
                    "#,
                    params![STATUS_DONE, done_cutoff, STATUS_DEAD, dead_cutoff],
                )?;
                Ok(n as u64)
            }
        })
        .await?
    }

    async fn run_loop(
        &self,
        kind: JobKind,
        spec: JobSpec,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            concurrency = spec.concurrency,
            attempts = spec.attempts,
            "{} job worker on {}",
            kind.as_str(),
            self.db_path.display()
        );
        let permits = Arc::new(Semaphore::new(spec.concurrency.max(1)));
        let mut running = JoinSet::new();
        let tick = Duration::from_secs(2);
        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(Some(res)) = running.join_next().now_or_never() {
                if let Err(e) = res {
                    warn!("{} job task panicked: {e}", kind.as_str());
                }
            }

            let free = permits.available_permits();
            let jobs = if free > 0 {
                self.claim_due(kind, free as u32, now_ms()).await?
            } else {
                Vec::new()
            };
            if jobs.is_empty() {
                tokio::select! {
                    _ = self.notify[kind.index()].notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                    Some(_) = running.join_next(), if !running.is_empty() => {}
                }
                continue;
            }

            for job in jobs {
                let permit = permits.clone().acquire_owned().await?;
                let queue = self.clone();
                let handler = handler.clone();
                running.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = queue.execute(job, spec, handler.as_ref()).await {
                        warn!("job bookkeeping failed: {e:#}");
                    }
                });
            }
        }
        running.shutdown().await;
        Ok(())
    }

    /// Runs one claimed job and records its outcome.
    pub(crate) async fn execute(&self, job: QueuedJob, spec: JobSpec, handler: &dyn JobHandler) -> Result<JobOutcome> {
        let attempt_no = job.attempt.saturating_add(1);
        let outcome = match tokio::time::timeout(spec.timeout, handler.run(job.payload.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => JobOutcome::retry(format!("timed out after {}s", spec.timeout.as_secs())),
        };
        match &outcome {
            JobOutcome::Success => self.mark(&job.id, STATUS_DONE, None).await?,
            JobOutcome::Retry { delay, reason } => {
                if attempt_no >= spec.attempts {
                    warn!("job {} abandoned after {attempt_no} attempts: {reason}", job.id);
                    self.metrics.job_dead();
                    self.mark(&job.id, STATUS_DEAD, Some(reason)).await?;
                } else {
                    let delay = delay.unwrap_or_else(|| {
                        next_backoff(attempt_no, spec.base_backoff_secs, spec.max_backoff_secs)
                    });
                    debug!("job {} retry in {}s: {reason}", job.id, delay.as_secs());
                    self.reschedule(&job.id, attempt_no, delay, reason).await?;
                }
            }
            JobOutcome::Fatal(reason) => {
                warn!("job {} failed permanently: {reason}", job.id);
                self.metrics.job_dead();
                self.mark(&job.id, STATUS_DEAD, Some(reason)).await?;
            }
        }
        Ok(outcome)
    }

    /// Moves up to `limit` due jobs of `kind` to running and returns them.
    pub(crate) async fn claim_due(&self, kind: JobKind, limit: u32, now: i64) -> Result<Vec<QueuedJob>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<QueuedJob>> {
                let mut conn = open_conn(&db_path)?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let rows = {
                    let mut stmt = tx.prepare(
                        r#"
                        SELECT id, attempt, payload FROM jobs
                        WHERE kind = ?1 AND status = ?2 AND next_attempt_at_ms <= ?3
                        ORDER BY next_attempt_at_ms ASC
                        LIMIT ?4
                        "#,
                    )?;
                    let rows = stmt
                        .query_map(params![kind.as_str(), STATUS_PENDING, now, limit], |r| {
                            Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?, r.get::<_, String>(2)?))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };
                let mut out = Vec::with_capacity(rows.len());
                for (id, attempt, payload) in rows {
                    match serde_json::from_str::<JobPayload>(&payload) {
                        Ok(payload) => {
                            tx.execute(
                                "UPDATE jobs SET status = ?2 WHERE id = ?1",
                                params![id, STATUS_RUNNING],
                            )?;
                            out.push(QueuedJob { id, attempt, payload });
                        }
                        Err(e) => {
                            tx.execute(
                                "UPDATE jobs SET status = ?2, last_error = ?3, finished_at_ms = ?4 WHERE id = ?1",
                                params![id, STATUS_DEAD, format!("undecodable payload: {e}"), now],
                            )?;
                        }
                    }
                }
                tx.commit()?;
                Ok(out)
            }
        })
        .await?
    }

    async fn mark(&self, id: &str, status: i64, err: Option<&str>) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.map(str::to_string);
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    "UPDATE jobs SET status = ?2, last_error = ?3, finished_at_ms = ?4 WHERE id = ?1",
                    params![id, status, err, now_ms()],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    async fn reschedule(&self, id: &str, attempt: u32, delay: Duration, err: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    "UPDATE jobs SET status = ?2, attempt = ?3, next_attempt_at_ms = ?4, last_error = ?5 WHERE id = ?1",
                    params![id, STATUS_PENDING, attempt, next, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    /// Payloads not yet finished, oldest first.
    pub async fn pending(&self, kind: JobKind) -> Result<Vec<JobPayload>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<JobPayload>> {
                let conn = open_conn(&db_path)?;
                let mut stmt = conn.prepare(
                    "SELECT payload FROM jobs WHERE kind = ?1 AND status IN (?2, ?3) ORDER BY created_at_ms ASC, rowid ASC",
                )?;
                let rows = stmt.query_map(params![kind.as_str(), STATUS_PENDING, STATUS_RUNNING], |r| {
                    r.get::<_, String>(0)
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(serde_json::from_str(&row?).context("decode job payload")?);
                }
                Ok(out)
            }
        })
        .await?
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<QueueStats> {
                let conn = open_conn(&db_path)?;
                let count = |status: i64| -> Result<u64> {
                    Ok(conn.query_row(
                        "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                        params![status],
                        |r| r.get(0),
                    )?)
                };
                Ok(QueueStats {
                    pending: count(STATUS_PENDING)? + count(STATUS_RUNNING)?,
                    done: count(STATUS_DONE)?,
                    dead: count(STATUS_DEAD)?,
                })
            }
        })
        .await?
    }
}

fn open_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn init_db(path: &Path) -> Result<()> {
    let conn = open_conn(path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          kind TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          payload TEXT NOT NULL,
          last_error TEXT NULL,
          finished_at_ms INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(kind, status, next_attempt_at_ms);
        "#,
    )?;
    let _ = conn.execute("ALTER TABLE jobs ADD COLUMN finished_at_ms INTEGER NULL", []);
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_jobs_finished ON jobs(status, finished_at_ms);")?;
    // Jobs interrupted by a shutdown run again.
    conn.execute(
        "UPDATE jobs SET status = ?1 WHERE status = ?2",
        params![STATUS_PENDING, STATUS_RUNNING],
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn new_job_id() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << pow).min(max_secs);
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}
