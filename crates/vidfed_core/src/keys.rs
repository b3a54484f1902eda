/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use std::path::PathBuf;

pub const ACTOR_KEY_BITS: usize = 2048;

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("VIDFED_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "vidfed", "Vidfed").context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

/// New RSA key pair as `(public_pem, private_pkcs8_pem)`.
pub fn generate_keypair(bits: usize) -> Result<(String, String)> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits).context("generate rsa key")?;
    let private_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_pem = RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)?
        .to_string();
    Ok((public_pem, private_pem))
}
