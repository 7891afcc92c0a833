use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::hex;
use rand::{Rng, RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::Result;

pub fn random_bytes32() -> [u8; 32] {
    let mut random_value = [0u8; 32];
    OsRng.fill_bytes(&mut random_value);
    random_value
}

/// Short random hex id, used for frame correlation ids and temp names.
pub fn random_hex_id() -> String {
    let value: u64 = rand::thread_rng().r#gen();
    format!("{value:016x}")
}

pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    Sha256::digest(data.as_ref()).into()
}

pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(sha256(data))
}

pub fn unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| e.to_string())?.as_secs())
}

/// RFC 3339 form of a unix timestamp.
pub fn format_timestamp(timestamp: u64) -> Result<String> {
    let seconds = i64::try_from(timestamp).map_err(|e| e.to_string())?;
    let at = OffsetDateTime::from_unix_timestamp(seconds).map_err(|e| e.to_string())?;
    Ok(at.format(&Rfc3339)?)
}

/// Exponential backoff for the given 1-based attempt, capped at `max`.
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}
