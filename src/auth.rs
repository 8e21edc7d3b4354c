//! Public key authentication against an OpenSSH `authorized_keys` file.
//!
//! This module handles:
//! - Parsing `authorized_keys` lines (with or without leading options)
//! - Computing key fingerprints the way `ssh-keygen -l` prints them
//! - Matching a key presented by a client against the loaded set

use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Keys allowed to log in, indexed by fingerprint.
#[derive(Debug, Default, Clone)]
pub struct AuthorizedKeys {
    fingerprints: HashSet<String>,
}

impl AuthorizedKeys {
    /// Load an `authorized_keys` file. A missing file yields an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "No authorized_keys file at {}, every login will be rejected",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read authorized keys from {}", path.display()))?;
        let keys = Self::parse(&content);
        info!(
            "Loaded {} authorized key(s) from {}",
            keys.len(),
            path.display()
        );
        Ok(keys)
    }

    /// Parse file content, skipping comments and lines that are not keys.
    pub fn parse(content: &str) -> Self {
        let mut fingerprints = HashSet::new();
        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match key_portion(line).and_then(compute_fingerprint) {
                Ok(fingerprint) => {
                    fingerprints.insert(fingerprint);
                }
                Err(e) => debug!("Skipping authorized_keys line {}: {}", n + 1, e),
            }
        }
        Self { fingerprints }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn contains(&self, key: &russh::keys::PublicKey) -> bool {
        self.fingerprints
            .contains(&compute_fingerprint_from_pubkey(key))
    }
}

/// The `type base64 [comment]` part of an `authorized_keys` line, skipping any options.
fn key_portion(line: &str) -> Result<&str> {
    let start = line
        .match_indices(|c: char| c.is_ascii_whitespace())
        .map(|(i, _)| i + 1)
        .chain(std::iter::once(0))
        .filter(|&i| is_key_type(line[i..].split_whitespace().next().unwrap_or("")))
        .min()
        .ok_or_else(|| anyhow!("no key type found"))?;
    Ok(&line[start..])
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-sha2-") || token.starts_with("sk-")
}

/// Parse an SSH public key string into (type, base64_data).
///
/// Handles formats like:
/// - "ssh-ed25519 AAAA... comment"
/// - "ssh-rsa AAAA... comment"
pub fn parse_ssh_key(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(anyhow!("Invalid SSH key format: too few parts"));
    }

    let key_type = parts[0].to_string();
    let key_data = parts[1].to_string();

    base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;

    Ok((key_type, key_data))
}

/// Compute the SHA256 fingerprint of an SSH public key.
///
/// Returns the fingerprint in "SHA256:..." format used by `ssh-keygen -l`.
pub fn compute_fingerprint(public_key: &str) -> Result<String> {
    let (_, key_data) = parse_ssh_key(public_key)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;
    Ok(compute_fingerprint_from_bytes(&decoded))
}

/// SSH fingerprint = SHA256(raw_key_bytes_in_wire_format)
pub fn compute_fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let hash = Sha256::digest(key_bytes);
    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Compute fingerprint from a russh public key.
pub fn compute_fingerprint_from_pubkey(key: &russh::keys::PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    compute_fingerprint_from_bytes(&key.public_key_bytes())
}
