//! Player identity derivation from client secrets.
//!
//! Identities are hashes of the secret, so the same secret always maps to
//! the same player across reconnects and host restarts.
//!
//! Two schemes exist. `current` is what new players receive. `legacy` is the
//! older derivation; it is only honoured when the canonical state already
//! contains a player under the legacy id and none under the current one.
// TODO: drop the legacy scheme once no live session holds a legacy id.

use sha1::Sha1;
use sha2::{Digest, Sha256};
use shared::PlayerId;

const CURRENT_DOMAIN: &str = "hostsync/v2:";
const CURRENT_ID_LEN: usize = 16;
const LEGACY_ID_LEN: usize = 12;

pub const MIN_SECRET_LEN: usize = 8;
pub const MAX_SECRET_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedIdentity {
    pub current: PlayerId,
    pub legacy: PlayerId,
}

impl DerivedIdentity {
    /// Picks the id to use given which players the state already knows.
    pub fn resolve(&self, is_known: impl Fn(&PlayerId) -> bool) -> PlayerId {
        if !is_known(&self.current) && is_known(&self.legacy) {
            self.legacy.clone()
        } else {
            self.current.clone()
        }
    }
}

/// Secrets are opaque tokens: 8..=128 ASCII alphanumerics, `-` or `_`.
pub fn is_valid_secret(secret: &str) -> bool {
    (MIN_SECRET_LEN..=MAX_SECRET_LEN).contains(&secret.len())
        && secret
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub fn derive(secret: &str) -> DerivedIdentity {
    let mut current = Sha256::new();
    current.update(CURRENT_DOMAIN.as_bytes());
    current.update(secret.as_bytes());

    let legacy = Sha1::digest(secret.as_bytes());

    DerivedIdentity {
        current: PlayerId(hex_prefix(&current.finalize(), CURRENT_ID_LEN)),
        legacy: PlayerId(hex_prefix(&legacy, LEGACY_ID_LEN)),
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .flat_map(|b| [b >> 4, b & 0x0F])
        .take(len)
        .map(|nibble| char::from_digit(nibble as u32, 16).unwrap_or('0'))
        .collect()
}
