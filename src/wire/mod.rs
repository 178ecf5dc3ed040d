//! Payload codec shared by the agent and the collector.
//!
//! Batches travel as gzip-compressed JSON. When a signing key is configured
//! the compressed body is authenticated with HMAC-SHA256 and the base64 tag
//! is carried in [`SIGNATURE_HEADER`].

use crate::core::{Result, SigningKey};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io::{Read, Write};

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

/// Path batches are posted to.
pub const UPDATES_PATH: &str = "/updates/";

type HmacSha256 = Hmac<Sha256>;

/// Gzip-compress a payload.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip payload.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn mac(key: &SigningKey, data: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac
}

/// Base64 HMAC-SHA256 of `data`.
pub fn sign(key: &SigningKey, data: &[u8]) -> String {
    STANDARD.encode(mac(key, data).finalize().into_bytes())
}

/// Check a base64 signature in constant time.
pub fn verify(key: &SigningKey, data: &[u8], signature: &str) -> bool {
    match STANDARD.decode(signature.trim()) {
        Ok(tag) => mac(key, data).verify_slice(&tag).is_ok(),
        Err(_) => false,
    }
}
