/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Domain error categories. They travel inside `anyhow::Error` and are
//! recovered with `downcast_ref` where behaviour depends on the category.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FedError {
    /// Remote answered 404/410: the object no longer exists.
    #[error("remote object gone: {0}")]
    Gone(String),

    #[error("invalid document: {0}")]
    Invalid(String),

    #[error("signature actor {signer} does not match activity actor {actor}")]
    ActorMismatch { signer: String, actor: String },

    #[error("unsigned {0} activity rejected")]
    Unsigned(String),

    #[error("unsupported type: {0}")]
    Unsupported(String),

    /// A required record (follow edge, owner, video) is missing.
    #[error("missing link: {0}")]
    MissingLink(String),

    #[error("recursion limit reached while resolving {0}")]
    RecursionLimit(String),

    #[error("refusing to crawl the server actor's own outbox")]
    OwnOutbox,

    #[error("follow target {0} is not a local actor")]
    NotLocalTarget(String),
}

/// Category of an arbitrary error chain, if it carries one.
pub fn classify(err: &anyhow::Error) -> Option<&FedError> {
    err.chain().find_map(|e| e.downcast_ref::<FedError>())
}

pub fn is_gone(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(FedError::Gone(_)))
}
