/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, HeaderValue, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1v15::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, time::Duration};
use vidfed_protocol::AP_CONTENT_TYPE;

/// Headers covered by outgoing POST signatures.
const POST_SIGNED_HEADERS: [&str; 5] = ["(request-target)", "host", "date", "digest", "content-type"];

#[derive(Debug)]
pub struct SignatureHeader {
    pub key_id: String,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

impl SignatureHeader {
    /// Actor URL the key belongs to (`keyId` without its fragment).
    pub fn actor_url(&self) -> &str {
        self.key_id.split_once('#').map(|(a, _)| a).unwrap_or(&self.key_id)
    }
}

pub fn parse_signature_header(value: &str) -> Result<SignatureHeader> {
    // keyId="...",algorithm="rsa-sha256",headers="(request-target) host date",signature="..."
    let mut map = HashMap::<&str, &str>::new();
    for part in value.split(',') {
        let Some((k, v)) = part.trim().split_once('=') else { continue };
        map.insert(k.trim(), v.trim().trim_matches('"'));
    }

    let key_id = map.get("keyId").ok_or_else(|| anyhow!("Signature missing keyId"))?;
    if let Some(alg) = map.get("algorithm") {
        if !alg.eq_ignore_ascii_case("rsa-sha256") && !alg.eq_ignore_ascii_case("hs2019") {
            return Err(anyhow!("unsupported signature algorithm: {alg}"));
        }
    }
    let headers = map.get("headers").copied().unwrap_or("date");
    let signature_b64 = map
        .get("signature")
        .ok_or_else(|| anyhow!("Signature missing signature"))?;
    let signature = B64.decode(signature_b64.as_bytes()).context("decode signature")?;

    Ok(SignatureHeader {
        key_id: key_id.to_string(),
        headers: headers.split_whitespace().map(|s| s.to_ascii_lowercase()).collect(),
        signature,
    })
}

pub fn build_signing_string(method: &Method, uri: &Uri, headers: &HeaderMap, signed_headers: &[String]) -> Result<String> {
    let mut lines = Vec::with_capacity(signed_headers.len());
    for name in signed_headers {
        if name == "(request-target)" {
            let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
            lines.push(format!(
                "(request-target): {} {path_and_query}",
                method.as_str().to_ascii_lowercase()
            ));
            continue;
        }
        let value = headers
            .get(name.as_str())
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        lines.push(format!("{name}: {}", value.trim()));
    }
    Ok(lines.join("\n"))
}

pub fn verify_digest_if_present(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let Some(digest) = headers.get("digest") else {
        return Ok(());
    };
    let digest = digest.to_str().context("Digest header not utf8")?;
    let Some((alg, value)) = digest.split_once('=') else {
        return Err(anyhow!("invalid Digest header"));
    };
    if !alg.trim().eq_ignore_ascii_case("SHA-256") {
        return Err(anyhow!("unsupported digest alg: {alg}"));
    }
    let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
    if expected.as_slice() != Sha256::digest(body).as_slice() {
        return Err(anyhow!("digest mismatch"));
    }
    Ok(())
}

pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = std::time::SystemTime::now();
    let skew = now
        .duration_since(ts)
        .or_else(|_| ts.duration_since(now))
        .unwrap_or_default();
    if skew > max_skew {
        return Err(anyhow!("Date skew too large: {}s", skew.as_secs()));
    }
    Ok(())
}

pub fn verify_signature_rsa_sha256(public_key_pem: &str, signing_string: &str, signature: &[u8]) -> Result<()> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem).context("parse public key pem")?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature).context("invalid rsa signature bytes")?;
    verifying_key
        .verify(signing_string.as_bytes(), &sig)
        .context("signature verify failed")?;
    Ok(())
}

/// Headers for an activity POST signed with `private_key_pem` at call time.
pub fn signed_post_headers(private_key_pem: &str, key_id: &str, inbox_url: &str, body: &[u8]) -> Result<HeaderMap> {
    let uri: Uri = inbox_url.parse().context("parse inbox url")?;
    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static(AP_CONTENT_TYPE));
    headers.insert("content-type", HeaderValue::from_static(AP_CONTENT_TYPE));
    headers.insert(
        "date",
        httpdate::fmt_http_date(std::time::SystemTime::now()).parse().context("set Date")?,
    );
    headers.insert(
        "digest",
        format!("SHA-256={}", B64.encode(Sha256::digest(body)))
            .parse()
            .context("set Digest")?,
    );
    let authority = uri.authority().ok_or_else(|| anyhow!("inbox url without host: {inbox_url}"))?;
    headers.insert("host", authority.as_str().parse().context("set Host")?);

    let signed: Vec<String> = POST_SIGNED_HEADERS.iter().map(|s| s.to_string()).collect();
    let signing_string = build_signing_string(&Method::POST, &uri, &headers, &signed)?;

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem).context("parse private key pem")?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let signature = signing_key.sign_with_rng(&mut rand::rngs::OsRng, signing_string.as_bytes());

    let sig_header = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        signed.join(" "),
        B64.encode(signature.to_bytes())
    );
    headers.insert("signature", sig_header.parse().context("set Signature")?);
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keypair;

    #[test]
    fn signed_post_verifies_and_detects_tampering() {
        let (public_pem, private_pem) = generate_keypair(1024).unwrap();
        let body = br#"{"type":"Follow"}"#;
        let url = "https://peer.example/inbox";
        let headers = signed_post_headers(&private_pem, "https://me.example/accounts/a#main-key", url, body).unwrap();

        verify_digest_if_present(&headers, body).unwrap();
        verify_date(&headers, Duration::from_secs(60)).unwrap();
        let sig = parse_signature_header(headers.get("signature").unwrap().to_str().unwrap()).unwrap();
        assert_eq!(sig.actor_url(), "https://me.example/accounts/a");

        let uri: Uri = url.parse().unwrap();
        let signing = build_signing_string(&Method::POST, &uri, &headers, &sig.headers).unwrap();
        verify_signature_rsa_sha256(&public_pem, &signing, &sig.signature).unwrap();

        let other: Uri = "https://peer.example/accounts/x/inbox".parse().unwrap();
        let forged = build_signing_string(&Method::POST, &other, &headers, &sig.headers).unwrap();
        assert!(verify_signature_rsa_sha256(&public_pem, &forged, &sig.signature).is_err());
        assert!(verify_digest_if_present(&headers, b"{}").is_err());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let err = parse_signature_header(r#"keyId="k",algorithm="ed25519",signature="AA==""#).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }
}
