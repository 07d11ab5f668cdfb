//! `pre_shared_key` negotiation (C5): binder MAC computation/verification,
//! ticket age obfuscation, and identity bookkeeping.
//!
//! The binder MAC is, per RFC 8446 §4.2.11.2, the single algorithm most
//! sensitive to off-by-one-byte errors: it is computed over a truncated
//! ClientHello that stops right after the PSK identities list and
//! deliberately excludes the binders list that follows it, even though the
//! "real" ClientHello (the one actually sent) already has that list's final
//! length fields filled in.

use crate::error::Result;
use crate::primitives::{constant_eq, hash, hmac};
use crate::tls::key_schedule::KeySchedule;

/// Slices off the trailing `binders<33..2^16-1>` field from an already-fully
/// serialized ClientHello, given only the lengths of the binder values that
/// were placed there (the list's own length prefix, and each entry's 1-byte
/// length prefix, are a function only of those lengths).
///
/// Requires `pre_shared_key` to be the last extension, which this crate's
/// serializer always arranges for when a PSK is offered (RFC 8446
/// §4.2.11: "the "pre_shared_key" extension MUST be the last").
pub fn truncate_for_binders<'a>(full_client_hello: &'a [u8], binder_lengths: &[usize]) -> Result<&'a [u8]> {
    let trailing: usize = 2 + binder_lengths.iter().map(|len| 1 + len).sum::<usize>();
    if full_client_hello.len() < trailing {
        return Err(crate::error::internal_error(
            "ClientHello shorter than its own binders field",
        ));
    }
    Ok(&full_client_hello[..full_client_hello.len() - trailing])
}

/// `binder = HMAC(finished_key(binder_key), Transcript-Hash(Truncate(CH1)))`
/// — identical in shape to the Finished computation (C7), but keyed off
/// `binder_key` instead of a traffic secret.
pub fn compute_binder(
    key_schedule: &KeySchedule,
    is_resumption: bool,
    truncated_client_hello: &[u8],
) -> Result<Vec<u8>> {
    let binder_key = key_schedule.binder_key(is_resumption)?;
    let finished_key = key_schedule.finished_key(&binder_key)?;
    let transcript_hash = hash(key_schedule.hasher_factory(), truncated_client_hello);
    Ok(hmac(key_schedule.hasher_factory(), &finished_key, &transcript_hash))
}

pub fn verify_binder(
    key_schedule: &KeySchedule,
    is_resumption: bool,
    truncated_client_hello: &[u8],
    received_binder: &[u8],
) -> Result<bool> {
    let expected = compute_binder(key_schedule, is_resumption, truncated_client_hello)?;
    Ok(constant_eq(&expected, received_binder))
}

/// `obfuscated_ticket_age = (ticket_age_ms + ticket_age_add) mod 2^32`
/// (RFC 8446 §4.2.11.1), wrapping as plain `u32` arithmetic naturally does.
pub fn obfuscate_ticket_age(ticket_age_ms: u32, ticket_age_add: u32) -> u32 {
    ticket_age_ms.wrapping_add(ticket_age_add)
}

/// `PSK = HKDF-Expand-Label(resumption_master_secret, "resumption",
/// ticket_nonce, Hash.length)` (RFC 8446 §4.6.1), the per-ticket PSK value a
/// `NewSessionTicket` issuer and consumer both derive independently from the
/// one `resumption_master_secret`.
pub fn ticket_psk(
    key_schedule: &KeySchedule,
    resumption_master_secret: &[u8],
    ticket_nonce: &[u8],
) -> Result<Vec<u8>> {
    crate::tls::key_schedule::hkdf_expand_label(
        key_schedule.hasher_factory(),
        resumption_master_secret,
        b"resumption",
        ticket_nonce,
        key_schedule.hash_len() as u16,
    )
}

pub fn deobfuscate_ticket_age(obfuscated_ticket_age: u32, ticket_age_add: u32) -> u32 {
    obfuscated_ticket_age.wrapping_sub(ticket_age_add)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_removes_exactly_the_binders_field() {
        // A fake "ClientHello" where we know precisely where the binders
        // field starts: 10 bytes of "everything else", then a binders list
        // with a single 32-byte binder.
        let mut ch = vec![0xAAu8; 10];
        let binder = vec![0xBBu8; 32];
        ch.extend_from_slice(&(1 + 32u16).to_be_bytes()); // list length
        ch.push(32); // entry length
        ch.extend_from_slice(&binder);

        let truncated = truncate_for_binders(&ch, &[32]).unwrap();
        assert_eq!(truncated, &ch[..10]);
    }

    #[test]
    fn ticket_age_obfuscation_round_trips() {
        let age = 123456u32;
        let add = 0xDEADBEEFu32;
        let obfuscated = obfuscate_ticket_age(age, add);
        assert_eq!(deobfuscate_ticket_age(obfuscated, add), age);
    }
}
