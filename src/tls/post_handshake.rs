//! The post-handshake dispatcher (C9): demultiplexes `NewSessionTicket`,
//! `KeyUpdate`, and post-handshake `CertificateRequest` once
//! `initial_negotiation_completed` is set.

use std::time::Instant;

use bytes::Bytes;
use log::{debug, warn};

use crate::credentials::{Credentials, Psk};
use crate::error::{Error, Result};
use crate::primitives::CryptoProvider;
use crate::session::{Role, Session, TicketState};
use crate::tls::alert::AlertDescription;
use crate::tls::handshake::{Handshake, HandshakeType, KeyUpdateRequest, NewSessionTicket};
use crate::tls::key_schedule::KeySchedule;
use crate::tls::psk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostHandshakeEvent {
    TicketStored,
    /// A `KeyUpdate` was processed; the peer's read-direction traffic
    /// secret already advanced. If `must_send_update` the caller must emit
    /// its own `KeyUpdate(update_not_requested)` before the next
    /// application record (§4.9).
    KeyUpdateReceived { must_send_update: bool },
    /// A post-handshake `CertificateRequest` arrived and auto-reauth is
    /// configured; the caller should now drive a reauth Certificate/
    /// CertificateVerify/Finished flight using `Session::reauth_context`.
    ReauthContextStored,
}

/// `msg` must be exactly one fully-parsed handshake message; the caller is
/// responsible for §4.9's "no other handshake message in the same record"
/// check before calling this.
pub fn dispatch(session: &mut Session, msg: Handshake, now: Instant, auto_reauth: bool) -> Result<PostHandshakeEvent> {
    match msg {
        Handshake::NewSessionTicket(nst) => {
            if session.role != Role::Client {
                return Err(Error::fatal(
                    AlertDescription::unexpected_message,
                    "Server received a NewSessionTicket",
                ));
            }
            let key_schedule = session
                .key_schedule
                .as_ref()
                .ok_or_else(|| crate::error::internal_error("No key schedule at NewSessionTicket"))?;
            let ch_cf_hash = session
                .transcript
                .client_finished_len()
                .map(|len| session.transcript.hash_prefix(key_schedule.hasher_factory(), len))
                .ok_or_else(|| crate::error::internal_error("NewSessionTicket before client Finished"))?;
            let resumption_master_secret = key_schedule.resumption_master_secret(&ch_cf_hash)?;

            session.client_ticket = Some(TicketState {
                ticket: nst.ticket,
                resumption_master_secret: Bytes::from(resumption_master_secret),
                lifetime_seconds: nst.ticket_lifetime,
                age_add: nst.ticket_age_add,
                nonce: nst.ticket_nonce,
                issued_at: now,
            });
            session.flags.ticket_received = true;
            debug!("client: stored NewSessionTicket");
            Ok(PostHandshakeEvent::TicketStored)
        }

        Handshake::KeyUpdate(ku) => {
            if !session.key_update_limiter.record(now) {
                warn!("KeyUpdate rate limit exceeded, closing connection");
                return Err(Error::fatal(
                    AlertDescription::unexpected_message,
                    "KeyUpdate rate limit exceeded",
                ));
            }

            let key_schedule = session
                .key_schedule
                .as_ref()
                .ok_or_else(|| crate::error::internal_error("No key schedule at KeyUpdate"))?;

            let peer_secret = match session.role {
                Role::Client => session.application_secrets.server.as_ref(),
                Role::Server => session.application_secrets.client.as_ref(),
            }
            .ok_or_else(|| crate::error::internal_error("No application secret at KeyUpdate"))?;
            let advanced = key_schedule.next_traffic_secret(peer_secret)?;

            match session.role {
                Role::Client => session.application_secrets.server = Some(Bytes::from(advanced)),
                Role::Server => session.application_secrets.client = Some(Bytes::from(advanced)),
            }

            let must_send_update = ku.request_update == KeyUpdateRequest::update_requested;
            debug!("advanced peer application traffic secret on KeyUpdate (reply required: {})", must_send_update);
            Ok(PostHandshakeEvent::KeyUpdateReceived { must_send_update })
        }

        Handshake::CertificateRequest(req) => {
            if session.role != Role::Client {
                return Err(Error::fatal(
                    AlertDescription::unexpected_message,
                    "Server received a post-handshake CertificateRequest",
                ));
            }
            session.reauth_context = Some(req.certificate_request_context);
            if auto_reauth {
                Ok(PostHandshakeEvent::ReauthContextStored)
            } else {
                Err(Error::reauth_request())
            }
        }

        other => Err(Error::fatal(
            AlertDescription::unexpected_message,
            format!("Unexpected post-handshake message {:?}", other.typ()),
        )),
    }
}

/// Server-side: mints `count` tickets off one `resumption_master_secret`,
/// each with its own nonce (and therefore its own derived PSK, RFC 8446
/// §4.6.1), and records each with `credentials` for later lookup. Returns
/// the wire messages paired with the bookkeeping the caller should push
/// onto `session.server_tickets_issued` (kept separate from `Session` so
/// this can run while the caller still holds a borrow of
/// `session.key_schedule`).
pub async fn issue_tickets(
    provider: &dyn CryptoProvider,
    credentials: &dyn Credentials,
    key_schedule: &KeySchedule,
    prf: crate::primitives::PrfHash,
    resumption_master_secret: &[u8],
    count: u8,
    lifetime_seconds: u32,
    now: Instant,
) -> Result<Vec<(NewSessionTicket, TicketState)>> {
    let mut out = vec![];

    for _ in 0..count {
        let mut nonce = [0u8; 8];
        provider.random(&mut nonce);
        let mut identity = [0u8; 32];
        provider.random(&mut identity);
        let mut age_add_bytes = [0u8; 4];
        provider.random(&mut age_add_bytes);
        let age_add = u32::from_be_bytes(age_add_bytes);

        let key = psk::ticket_psk(key_schedule, resumption_master_secret, &nonce)?;

        let psk = Psk {
            identity: Bytes::copy_from_slice(&identity),
            key: Bytes::from(key),
            prf,
            is_resumption: true,
        };
        credentials.store_issued_psk(psk, lifetime_seconds).await;

        let ticket = NewSessionTicket {
            ticket_lifetime: lifetime_seconds,
            ticket_age_add: age_add,
            ticket_nonce: Bytes::copy_from_slice(&nonce),
            ticket: Bytes::copy_from_slice(&identity),
            extensions: vec![],
        };

        let state = TicketState {
            ticket: ticket.ticket.clone(),
            resumption_master_secret: Bytes::copy_from_slice(resumption_master_secret),
            lifetime_seconds,
            age_add,
            nonce: ticket.ticket_nonce.clone(),
            issued_at: now,
        };

        out.push((ticket, state));
    }

    Ok(out)
}

/// Whether `typ` is even legal to appear on the post-handshake path, used by
/// the state machine to reject anything else before calling `dispatch`.
pub fn is_post_handshake_type(typ: HandshakeType) -> bool {
    matches!(
        typ,
        HandshakeType::new_session_ticket | HandshakeType::key_update | HandshakeType::certificate_request
    )
}
