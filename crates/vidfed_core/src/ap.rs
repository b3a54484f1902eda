/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::context::FedContext;
use crate::directory::Freshness;
use crate::http_sig::{
    build_signing_string, parse_signature_header, verify_date, verify_digest_if_present,
    verify_signature_rsa_sha256, SignatureHeader,
};
use crate::inbox::{InboxBatch, InboxQueue, Sender};
use crate::model::{Actor, ActorType};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{request::Parts, Request, Response, StatusCode},
    routing::any,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub const MAX_INBOX_BODY: usize = 2 * 1024 * 1024;

pub struct ApState {
    pub ctx: FedContext,
    pub inbox: InboxQueue,
}

pub fn router(state: Arc<ApState>) -> Router {
    Router::new()
        .fallback(any(move |req: Request<Body>| {
            let st = state.clone();
            async move { handle_request(&st, req).await }
        }))
        .layer(DefaultBodyLimit::max(MAX_INBOX_BODY))
        .layer(TraceLayer::new_for_http())
}

pub async fn handle_request(state: &ApState, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    match (req.method().as_str(), path.as_str()) {
        ("GET", "/healthz") => simple(StatusCode::OK, "ok"),
        ("GET", "/_vidfed/stats") => stats_get(state).await,
        ("POST", "/inbox") => inbox(state, req, None).await,
        ("POST", p) => match personal_inbox(p) {
            Some((kind, name)) => match state.ctx.db.load_local_actor(name, kind) {
                Ok(Some(actor)) => inbox(state, req, Some(actor)).await,
                Ok(None) => simple(StatusCode::NOT_FOUND, "no such actor"),
                Err(e) => {
                    warn!("inbox actor lookup failed: {e:#}");
                    simple(StatusCode::INTERNAL_SERVER_ERROR, "lookup failed")
                }
            },
            None => simple(StatusCode::NOT_FOUND, "not found"),
        },
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

/// `/accounts/:name/inbox` and `/video-channels/:name/inbox`.
fn personal_inbox(path: &str) -> Option<(ActorType, &str)> {
    let rest = path.strip_suffix("/inbox")?;
    let (kind, name) = if let Some(name) = rest.strip_prefix("/accounts/") {
        (ActorType::Person, name)
    } else if let Some(name) = rest.strip_prefix("/video-channels/") {
        (ActorType::Group, name)
    } else {
        return None;
    };
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some((kind, name))
}

async fn inbox(state: &ApState, req: Request<Body>, inbox_actor: Option<Actor>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_INBOX_BODY).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };
    if let Err(e) = verify_digest_if_present(&parts.headers, &body_bytes) {
        state.ctx.metrics.auth_failure();
        return simple(StatusCode::UNAUTHORIZED, &format!("digest invalid: {e}"));
    }

    let sig_header = parts
        .headers
        .get("Signature")
        .or_else(|| parts.headers.get("signature"))
        .and_then(|v| v.to_str().ok());
    let sender = match sig_header {
        None => Sender::Unsigned,
        Some(sig_header) => match verify_signed(state, &parts, sig_header).await {
            Ok(actor) => Sender::Signed(actor),
            Err(resp) => {
                state.ctx.metrics.auth_failure();
                return resp;
            }
        },
    };

    let json: serde_json::Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid json"),
    };
    let batch = InboxBatch::from_body(json, sender, inbox_actor);
    if batch.activities.is_empty() {
        return simple(StatusCode::BAD_REQUEST, "no activity");
    }
    debug!(items = batch.activities.len(), "inbox batch accepted");
    match state.inbox.enqueue(batch) {
        Ok(()) => simple(StatusCode::ACCEPTED, "accepted"),
        Err(e) => {
            warn!("inbox rejected batch: {e:#}");
            simple(StatusCode::SERVICE_UNAVAILABLE, "busy")
        }
    }
}

async fn verify_signed(state: &ApState, parts: &Parts, sig_header: &str) -> Result<Actor, Response<Body>> {
    if let Err(e) = verify_date(&parts.headers, state.ctx.cfg.max_date_skew()) {
        return Err(simple(StatusCode::UNAUTHORIZED, &format!("date invalid: {e}")));
    }
    let sig = match parse_signature_header(sig_header) {
        Ok(v) => v,
        Err(e) => return Err(simple(StatusCode::UNAUTHORIZED, &format!("bad Signature: {e}"))),
    };
    let signing_string = match build_signing_string(&parts.method, &parts.uri, &parts.headers, &sig.headers) {
        Ok(s) => s,
        Err(e) => return Err(simple(StatusCode::UNAUTHORIZED, &format!("bad signed headers: {e}"))),
    };
    let signer = match state.ctx.directory().resolve_signer(&sig.key_id).await {
        Ok(a) => a,
        Err(e) => return Err(simple(StatusCode::UNAUTHORIZED, &format!("key resolve failed: {e:#}"))),
    };
    if verify_signature_rsa_sha256(&signer.public_key_pem, &signing_string, &sig.signature).is_ok() {
        return Ok(signer);
    }
    rotated_key_signer(state, signer, &sig, &signing_string).await
}

/// The stored key may predate a rotation: re-read the actor once and retry.
async fn rotated_key_signer(
    state: &ApState,
    signer: Actor,
    sig: &SignatureHeader,
    signing_string: &str,
) -> Result<Actor, Response<Body>> {
    let refreshed = match state.ctx.directory().refresh(signer).await {
        Ok(Freshness::Fresh(a)) | Ok(Freshness::Refreshed(a)) => a,
        Ok(Freshness::Gone) => return Err(simple(StatusCode::UNAUTHORIZED, "signer is gone")),
        Err(e) => return Err(simple(StatusCode::UNAUTHORIZED, &format!("key refresh failed: {e:#}"))),
    };
    match verify_signature_rsa_sha256(&refreshed.public_key_pem, signing_string, &sig.signature) {
        Ok(()) => Ok(refreshed),
        Err(e) => Err(simple(StatusCode::UNAUTHORIZED, &format!("signature invalid: {e}"))),
    }
}

async fn stats_get(state: &ApState) -> Response<Body> {
    let queue = match state.ctx.queue.stats().await {
        Ok(s) => serde_json::json!({"pending": s.pending, "done": s.done, "dead": s.dead}),
        Err(e) => {
            warn!("queue stats failed: {e:#}");
            serde_json::Value::Null
        }
    };
    let mut body = state.ctx.metrics.snapshot_json();
    body["jobs"] = queue;
    let mut resp = Response::new(Body::from(body.to_string()));
    resp.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    resp
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}
