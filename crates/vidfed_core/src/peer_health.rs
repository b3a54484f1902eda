/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::db::FedDb;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const FOLLOW_SCORE_BASE: i64 = 1000;
pub const FOLLOW_SCORE_MAX: i64 = 10_000;
pub const FOLLOW_SCORE_BONUS: i64 = 10;
pub const FOLLOW_SCORE_PENALTY: i64 = -10;

/// Delivery outcome sink. Implementations decide what a good or bad peer means.
#[async_trait]
pub trait DeliveryScorer: Send + Sync {
    async fn report_delivery_outcome(&self, peer_inbox: &str, ok: bool) -> Result<()>;

    async fn report_batch(&self, good: &[String], bad: &[String]) -> Result<()> {
        for inbox in good {
            self.report_delivery_outcome(inbox, true).await?;
        }
        for inbox in bad {
            self.report_delivery_outcome(inbox, false).await?;
        }
        Ok(())
    }
}

/// Scores follow edges by the inbox their follower is reached on.
pub struct FollowScoreBook {
    db: Arc<FedDb>,
}

impl FollowScoreBook {
    pub fn new(db: Arc<FedDb>) -> Self {
        Self { db }
    }

    pub fn remove_bad_follows(&self) -> Result<usize> {
        self.db.remove_bad_follows()
    }
}

#[async_trait]
impl DeliveryScorer for FollowScoreBook {
    async fn report_delivery_outcome(&self, peer_inbox: &str, ok: bool) -> Result<()> {
        let delta = if ok { FOLLOW_SCORE_BONUS } else { FOLLOW_SCORE_PENALTY };
        let touched = self.db.adjust_follow_scores(peer_inbox, delta, FOLLOW_SCORE_MAX)?;
        debug!(touched, ok, "follow score update for {peer_inbox}");
        Ok(())
    }
}

pub fn start_bad_follow_pruner(
    book: Arc<FollowScoreBook>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            match book.remove_bad_follows() {
                Ok(0) => {}
                Ok(removed) => info!(removed, "removed follows with exhausted delivery score"),
                Err(e) => warn!("bad follow pruning failed: {e:#}"),
            }
        }
    });
}
