/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;

/// Maps `name@host` handles to actor URLs.
#[async_trait]
pub trait WebFinger: Send + Sync {
    async fn resolve(&self, name: &str, host: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct Jrd {
    #[serde(default)]
    links: Vec<JrdLink>,
}

#[derive(Debug, Deserialize)]
struct JrdLink {
    rel: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    href: Option<String>,
}

pub struct HttpWebFinger {
    client: reqwest::Client,
    scheme: &'static str,
}

impl HttpWebFinger {
    pub fn new(client: reqwest::Client, plain_http: bool) -> Self {
        Self {
            client,
            scheme: if plain_http { "http" } else { "https" },
        }
    }
}

#[async_trait]
impl WebFinger for HttpWebFinger {
    async fn resolve(&self, name: &str, host: &str) -> Result<String> {
        let resource = urlencoding::encode(&format!("acct:{name}@{host}")).into_owned();
        let url = format!("{}://{host}/.well-known/webfinger?resource={resource}", self.scheme);
        let jrd = self
            .client
            .get(&url)
            .header(ACCEPT, "application/jrd+json, application/json")
            .send()
            .await
            .with_context(|| format!("webfinger {name}@{host}"))?
            .error_for_status()
            .with_context(|| format!("webfinger not ok: {name}@{host}"))?
            .json::<Jrd>()
            .await
            .with_context(|| format!("parse webfinger for {name}@{host}"))?;
        self_link(&jrd).ok_or_else(|| anyhow!("webfinger for {name}@{host} has no self link"))
    }
}

fn self_link(jrd: &Jrd) -> Option<String> {
    jrd.links
        .iter()
        .find(|l| {
            l.rel == "self"
                && l.kind
                    .as_deref()
                    .map(|t| t.contains("activity+json") || t.contains("ld+json"))
                    .unwrap_or(false)
        })
        .and_then(|l| l.href.clone())
}
