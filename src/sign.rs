use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const PARAM_VERSION_TS: &str = "ts";
pub const PARAM_TOKEN: &str = "tk";

const MIN_EXPIRE_SECONDS: i64 = 3600 * 24;

type HmacSha256 = Hmac<Sha256>;

/// Stateless URL signer.
///
/// A token is the urlsafe base64 (no padding) of the HMAC-SHA256 over the
/// signed path and version, followed by the big-endian expiry timestamp
/// XOR-obfuscated with a configured nonce. Verification recomputes the
/// HMAC and compares in constant time.
#[derive(Debug, Clone)]
pub struct Signer {
    key: Vec<u8>,
    magic: u32,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Signer {
    pub fn new(key: impl Into<Vec<u8>>, magic: u32) -> Self {
        Signer {
            key: key.into(),
            magic,
        }
    }

    /// Expiry timestamp for a relative lifetime, aligned so that all URLs
    /// for the same path rotate at the same boundary. The boundary gets a
    /// per-path offset so distinct paths do not all expire at the same
    /// instant.
    pub fn aligned_expiry(&self, key: &str, expires_seconds: i64) -> i64 {
        let expires_seconds = expires_seconds.max(MIN_EXPIRE_SECONDS);

        let offset = i64::from(crc32fast::hash(key.as_bytes())) % expires_seconds;
        let now = unix_now();

        let mut aligned = ((now + expires_seconds - 1) / expires_seconds) * expires_seconds + offset;

        // Guarantee at least one full lifetime of validity.
        if aligned - now < expires_seconds {
            aligned += expires_seconds;
        }
        aligned
    }

    fn obfuscated_expiry_bytes(&self, expiry: i64) -> [u8; 4] {
        ((expiry as u32) ^ self.magic).to_be_bytes()
    }

    fn token_mac(&self, path: &str, ts: &str, oe: &str) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(path.as_bytes());
        if !ts.is_empty() {
            mac.update(format!("?ts={ts}").as_bytes());
            mac.update(format!("&oe={oe}").as_bytes());
        } else {
            mac.update(format!("?oe={oe}").as_bytes());
        }
        mac.finalize().into_bytes().to_vec()
    }

    /// Sign `path` with an aligned expiry derived from `relative_expire`.
    pub fn sign_url(&self, path: &str, ts: &str, relative_expire: i64) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        let expiry = self.aligned_expiry(path, relative_expire);
        self.sign_url_with_time(path, ts, expiry)
    }

    /// Sign `path` so the signature expires at the absolute unix time
    /// `expiry`. Returns `path?ts=..&tk=..` (or `path?tk=..` without a
    /// version).
    pub fn sign_url_with_time(&self, path: &str, ts: &str, expiry: i64) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);

        let oe_bytes = self.obfuscated_expiry_bytes(expiry);
        let oe = URL_SAFE_NO_PAD.encode(oe_bytes);

        let mut token_bytes = self.token_mac(path, ts, &oe);
        token_bytes.extend_from_slice(&oe_bytes);
        let token = URL_SAFE_NO_PAD.encode(token_bytes);

        if !ts.is_empty() {
            format!("{path}?ts={ts}&tk={token}")
        } else {
            format!("{path}?tk={token}")
        }
    }

    /// Verify a token for `path` and version `ts`. With `check_expire`,
    /// a token whose embedded expiry lies in the past fails.
    pub fn verify(&self, path: &str, ts: &str, token: &str, check_expire: bool) -> bool {
        let path = path.strip_prefix('/').unwrap_or(path);

        let token_bytes = match URL_SAFE_NO_PAD.decode(token) {
            Ok(b) if b.len() >= 5 => b,
            _ => return false,
        };

        let (mac_part, expiry_part) = token_bytes.split_at(token_bytes.len() - 4);
        let expiry_bytes: [u8; 4] = expiry_part.try_into().expect("split_at leaves 4 bytes");
        let expiry = u32::from_be_bytes(expiry_bytes) ^ self.magic;
        if check_expire && unix_now() > i64::from(expiry) {
            return false;
        }

        let oe = URL_SAFE_NO_PAD.encode(expiry_bytes);

        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(path.as_bytes());
        if !ts.is_empty() {
            mac.update(format!("?ts={ts}").as_bytes());
            mac.update(format!("&oe={oe}").as_bytes());
        } else {
            mac.update(format!("?oe={oe}").as_bytes());
        }
        mac.verify_slice(mac_part).is_ok()
    }
}
