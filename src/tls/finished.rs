//! The Finished message (C7): `finished_key` derivation, `verify_data`
//! computation, and constant-time verification.

use crate::error::Result;
use crate::primitives::{constant_eq, hmac};
use crate::tls::key_schedule::KeySchedule;

/// `verify_data = HMAC(finished_key, Transcript-Hash(...))` (RFC 8446
/// §4.4.4). `base_secret` is the relevant handshake or application traffic
/// secret for whichever side is producing the message.
pub fn compute_verify_data(
    key_schedule: &KeySchedule,
    base_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<Vec<u8>> {
    let finished_key = key_schedule.finished_key(base_secret)?;
    Ok(hmac(key_schedule.hasher_factory(), &finished_key, transcript_hash))
}

pub fn verify(
    key_schedule: &KeySchedule,
    base_secret: &[u8],
    transcript_hash: &[u8],
    received_verify_data: &[u8],
) -> Result<bool> {
    let expected = compute_verify_data(key_schedule, base_secret, transcript_hash)?;
    Ok(constant_eq(&expected, received_verify_data))
}
