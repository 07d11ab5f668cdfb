//! The handshake state machine (C8): drives the client and server flight
//! orders, installs record-layer keys at the correct points, and handles
//! HelloRetryRequest.
//!
//! Re-entrancy (§5, §9 design notes) is realized natively: each `run_*`
//! function is an `async fn`, and Rust's async/await suspension already
//! gives exactly the "resume from where you left off, no polling" property
//! the source's hand-rolled state-number switch was reaching for. Locals
//! live across `.await` points the same way the source's per-state struct
//! carried only the data needed to resume.

use std::time::Instant;

use bytes::Bytes;
use log::{debug, trace};

use crate::config::{ClientConfig, ServerConfig};
use crate::credentials::{Credentials, VerifyOutcome};
use crate::error::{internal_error, Error, Result};
use crate::primitives::CryptoProvider;
use crate::session::{BinderSlot, Role, Session};
use crate::tls::alert::AlertDescription;
use crate::tls::cert_verify::{self, CertRole};
use crate::tls::cipher_suite::CipherSuite;
use crate::tls::extensions::{
    find, Extension, KeyShareClientHello, KeyShareServerHello, NamedGroupList, OfferedPsks,
    PreSharedKey, ProtocolNameList, PskIdentity, PskKeyExchangeModes, ServerName, ServerNameList,
    SignatureSchemeList, SupportedVersionsClientHello, SupportedVersionsServerHello,
    TLS_1_3_VERSION,
};
use crate::tls::finished;
use crate::tls::handshake::{
    Certificate, CertificateEntry, CertificateRequest, ClientHello, EncryptedExtensions, Handshake,
    ServerHello, HELLO_RETRY_REQUEST_RANDOM,
};
use crate::tls::key_schedule::KeySchedule;
use crate::tls::key_share::{self, ClientKeyShares};
use crate::tls::keys::{Direction, Epoch, KeyInstall};
use crate::tls::post_handshake;
use crate::tls::psk;
use crate::transport::{PullOutcome, Transport};

/// Accumulates bytes pulled from the transport until one full
/// `{type, uint24 length, body}` frame is available.
struct MessageReader {
    buf: Vec<u8>,
}

impl MessageReader {
    fn new() -> Self {
        Self { buf: vec![] }
    }

    fn try_take(&mut self) -> Result<Option<Handshake>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([0, self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let total = 4 + body_len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..total).collect();
        Ok(Some(Handshake::parse(&frame)?))
    }
}

async fn read_message(transport: &mut dyn Transport, reader: &mut MessageReader, session: &mut Session) -> Result<Handshake> {
    read_message_raw(transport, reader, session, true).await
}

/// Post-handshake messages (NewSessionTicket, KeyUpdate, reauth
/// CertificateRequest) are never folded into the transcript: the transcript
/// hash has no further cryptographic role once the initial handshake
/// completes (§4.9).
async fn read_post_handshake_message(
    transport: &mut dyn Transport,
    reader: &mut MessageReader,
    session: &mut Session,
) -> Result<Handshake> {
    read_message_raw(transport, reader, session, false).await
}

async fn read_message_raw(
    transport: &mut dyn Transport,
    reader: &mut MessageReader,
    session: &mut Session,
    append_to_transcript: bool,
) -> Result<Handshake> {
    loop {
        if let Some(msg) = reader.try_take()? {
            if append_to_transcript {
                let mut bytes = vec![];
                msg.serialize(&mut bytes);
                session.transcript.append(&bytes);
            }
            session.reset_loop_counter();
            return Ok(msg);
        }

        let mut chunk = [0u8; 4096];
        match transport.pull(&mut chunk).await {
            Ok(PullOutcome::Data(n)) => {
                reader.buf.extend_from_slice(&chunk[..n]);
            }
            Ok(PullOutcome::Eof) => {
                return Err(Error::fatal(AlertDescription::unexpected_message, "Transport closed mid-handshake"))
            }
            Err(e) if !e.is_fatal() => {
                if !session.note_non_fatal_retry() {
                    return Err(internal_error("Suspicious non-progress loop while reading"));
                }
                transport.pull_timeout(50).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn write_message(transport: &mut dyn Transport, session: &mut Session, msg: &Handshake) -> Result<()> {
    let mut bytes = vec![];
    msg.serialize(&mut bytes);
    session.transcript.append(&bytes);

    let mut remaining: &[u8] = &bytes;
    while !remaining.is_empty() {
        match transport.push(remaining).await {
            Ok(0) => return Err(Error::again()),
            Ok(n) => {
                remaining = &remaining[n..];
                session.reset_loop_counter();
            }
            Err(e) if !e.is_fatal() => {
                if !session.note_non_fatal_retry() {
                    return Err(internal_error("Suspicious non-progress loop while writing"));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Advertised `ticket_lifetime` for server-issued `NewSessionTicket`s (RFC
/// 8446 §4.6.1 caps this at 7 days; there's no reason to advertise less).
const TICKET_LIFETIME_SECONDS: u32 = 7 * 24 * 3600;

/// A complete middlebox-compatibility `ChangeCipherSpec` record (RFC 8446
/// Appendix D.4): `{type=20, legacy_record_version=0x0303, length=1,
/// payload=0x01}`. Pushed straight at the transport, never added to the
/// transcript — CCS carries no handshake content and real TLS 1.3 peers
/// ignore it on receipt regardless of whether they emit it themselves.
const COMPAT_CCS_RECORD: [u8; 6] = [0x14, 0x03, 0x03, 0x00, 0x01, 0x01];

async fn send_compat_ccs(transport: &mut dyn Transport) -> Result<()> {
    transport.push_all(&COMPAT_CCS_RECORD).await
}

fn negotiate_cipher_suite(offered: &[CipherSuite], supported: &[CipherSuite]) -> Result<CipherSuite> {
    supported
        .iter()
        .find(|s| offered.contains(s))
        .copied()
        .ok_or_else(|| Error::fatal(AlertDescription::handshake_failure, "No mutual cipher suite"))
}

// ---------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------

fn build_client_extensions(
    config: &ClientConfig,
    key_shares: &KeyShareClientHello,
) -> Vec<Extension> {
    let mut extensions = vec![Extension::SupportedVersionsClientHello(SupportedVersionsClientHello {
        versions: vec![TLS_1_3_VERSION],
    })];

    extensions.push(Extension::SupportedGroups(NamedGroupList {
        groups: config.common.supported_groups.clone(),
    }));
    extensions.push(Extension::SignatureAlgorithms(SignatureSchemeList {
        schemes: config.common.supported_signature_algorithms.clone(),
    }));
    extensions.push(Extension::KeyShareClientHello(key_shares.clone()));

    if let Some(name) = &config.server_name {
        extensions.push(Extension::ServerName(Some(ServerNameList {
            names: vec![ServerName::HostName(Bytes::copy_from_slice(name.as_bytes()))],
        })));
    }
    if !config.alpn_protocols.is_empty() {
        extensions.push(Extension::ALPN(ProtocolNameList {
            names: config.alpn_protocols.clone(),
        }));
    }

    extensions
}

/// Builds the ClientHello, threading the PSK binder computation through if
/// a PSK is available (C5). Returns the fully-serialized message (with real
/// binders filled in) plus the key shares and offered-PSK bookkeeping the
/// caller needs once ServerHello arrives.
async fn build_client_hello(
    session: &Session,
    config: &ClientConfig,
    provider: &dyn CryptoProvider,
    credentials: &dyn Credentials,
) -> Result<(ClientHello, ClientKeyShares, Option<(BinderSlot, KeySchedule)>, bool)> {
    let groups = config.key_share_groups();
    let (shares, key_share_ext) = ClientKeyShares::generate(provider, &groups)?;
    let mut extensions = build_client_extensions(config, &key_share_ext);

    let psk = match credentials.get_psk().await {
        Some(psk) => Some(psk),
        None => match session.client_ticket.as_ref() {
            Some(t) => {
                let prf = session
                    .cipher_suite
                    .map(|c| c.prf_hash().unwrap_or(crate::primitives::PrfHash::Sha256))
                    .unwrap_or(crate::primitives::PrfHash::Sha256);
                let throwaway_schedule = KeySchedule::new(provider.hasher_factory(prf));
                let key = psk::ticket_psk(&throwaway_schedule, &t.resumption_master_secret, &t.nonce)?;
                Some(crate::credentials::Psk {
                    identity: t.ticket.clone(),
                    key: Bytes::from(key),
                    prf,
                    is_resumption: true,
                })
            }
            None => None,
        },
    };

    let mut psk_plan = None;
    let mut offering_early_data = false;
    if let Some(psk) = psk {
        extensions.push(Extension::PskKeyExchangeModes(PskKeyExchangeModes {
            modes: config.common.psk_key_exchange_modes.clone(),
        }));

        if config.enable_early_data && psk.is_resumption {
            extensions.push(Extension::EarlyData(crate::tls::extensions::EarlyDataIndication));
            offering_early_data = true;
        }

        let obfuscated_age = session
            .client_ticket
            .as_ref()
            .map(|t| psk::obfuscate_ticket_age(0, t.age_add))
            .unwrap_or(0);

        let hash_len = provider.hasher_factory(psk.prf).output_size();
        let placeholder_binder = vec![0u8; hash_len];
        extensions.push(Extension::PreSharedKey(PreSharedKey::ClientHello(OfferedPsks {
            identities: vec![PskIdentity {
                identity: psk.identity.clone(),
                obfuscated_ticket_age: obfuscated_age,
            }],
            binders: vec![Bytes::from(placeholder_binder)],
        })));

        psk_plan = Some((psk, hash_len));
    }

    let mut random = [0u8; 32];
    provider.random(&mut random);

    let mut ch = ClientHello {
        legacy_version: 0x0303,
        random,
        legacy_session_id: Bytes::new(),
        cipher_suites: config.common.supported_cipher_suites.clone(),
        extensions,
    };

    let binder_plan = if let Some((psk, hash_len)) = psk_plan {
        let mut full = vec![];
        Handshake::ClientHello(ch.clone()).serialize(&mut full);

        let truncated = psk::truncate_for_binders(&full, &[hash_len])?;

        let mut temp_schedule = KeySchedule::new(provider.hasher_factory(psk.prf));
        temp_schedule.early_secret(Some(&psk.key));
        let binder = psk::compute_binder(&temp_schedule, psk.is_resumption, truncated)?;

        if let Some(Extension::PreSharedKey(PreSharedKey::ClientHello(offered))) = ch
            .extensions
            .iter_mut()
            .find(|e| matches!(e, Extension::PreSharedKey(_)))
        {
            offered.binders = vec![Bytes::from(binder)];
        }

        Some((
            BinderSlot {
                psk: psk.key.clone(),
                prf: psk.prf,
                is_resumption: psk.is_resumption,
                identity_index: 0,
            },
            temp_schedule,
        ))
    } else {
        None
    };

    Ok((ch, shares, binder_plan, offering_early_data))
}

pub async fn run_client(
    session: &mut Session,
    config: &ClientConfig,
    provider: &dyn CryptoProvider,
    credentials: &dyn Credentials,
    transport: &mut dyn Transport,
    keys: &mut dyn KeyInstall,
) -> Result<()> {
    session.role = Role::Client;
    let mut reader = MessageReader::new();

    let (mut ch, mut shares, mut binder_plan, mut offering_early_data) =
        build_client_hello(session, config, provider, credentials).await?;
    session.client_random = ch.random;
    if let Some((slot, schedule)) = binder_plan.take() {
        session.binders = vec![slot];
        session.key_schedule = Some(schedule);
        session.flags.psk_selected = true;
    }

    write_message(transport, session, &Handshake::ClientHello(ch.clone())).await?;
    session.transcript.mark_client_hello();
    debug!("client: sent ClientHello");
    if config.common.send_compat_ccs {
        send_compat_ccs(transport).await?;
    }

    if offering_early_data {
        let key_schedule = session.key_schedule.as_ref().ok_or_else(|| internal_error("no key schedule for early data"))?;
        let ch_hash = session.transcript.hash(key_schedule.hasher_factory());
        let early_traffic_secret = key_schedule.client_early_traffic_secret(&ch_hash)?;
        let prf = session.binders[0].prf;
        let suite = config
            .common
            .supported_cipher_suites
            .iter()
            .copied()
            .find(|s| s.prf_hash().ok() == Some(prf))
            .ok_or_else(|| internal_error("no configured cipher suite matches the PSK's hash"))?;
        keys.install(Direction::Write, Epoch::EarlyData, suite, prf, &early_traffic_secret).await?;
        session.flags.early_data_in_flight = true;
        debug!("client: offering early data, installed 0-RTT write key");
    }

    let server_hello = loop {
        let msg = read_message(transport, &mut reader, session).await?;
        match msg {
            Handshake::ServerHello(sh) if sh.is_hello_retry_request() => {
                if session.flags.hrr_received {
                    return Err(Error::fatal(AlertDescription::unexpected_message, "Second HelloRetryRequest"));
                }
                session.flags.hrr_received = true;
                if offering_early_data {
                    // §4.2.10: early data is never accepted across a retry.
                    offering_early_data = false;
                    session.flags.early_data_in_flight = false;
                    ch.extensions.retain(|e| !matches!(e, Extension::EarlyData(_)));
                }

                let prf = sh.cipher_suite.prf_hash()?;
                let hasher_factory = provider.hasher_factory(prf);
                session.transcript.synthesize_for_hrr(hasher_factory.as_ref());

                let selected_group = find(&sh.extensions, |e| match e {
                    Extension::KeyShareHelloRetryRequest(ks) => Some(ks.selected_group),
                    _ => None,
                })
                .ok_or_else(|| Error::fatal(AlertDescription::missing_extension, "HRR without key_share"))?;
                debug!("client: HelloRetryRequest received, retrying with group {:?}", selected_group);

                let (new_shares, entry) =
                    shares.regenerate_after_retry(provider, &config.common.supported_groups, selected_group)?;
                shares = new_shares;

                let key_share_ext = KeyShareClientHello {
                    client_shares: vec![entry],
                };
                ch.extensions.retain(|e| !matches!(e, Extension::KeyShareClientHello(_)));
                ch.extensions.push(Extension::KeyShareClientHello(key_share_ext));

                write_message(transport, session, &Handshake::ClientHello(ch.clone())).await?;
                session.transcript.mark_client_hello();
                debug!("client: resent ClientHello after HelloRetryRequest");
            }
            Handshake::ServerHello(sh) => break sh,
            other => {
                return Err(Error::fatal(
                    AlertDescription::unexpected_message,
                    format!("Expected ServerHello, got {:?}", other.typ()),
                ))
            }
        }
    };

    finish_negotiation_from_server_hello(session, config, provider, &server_hello, &shares)?;
    debug!(
        "client: negotiated cipher_suite={:?} group={:?} psk_selected={}",
        session.cipher_suite, session.selected_group, session.flags.psk_selected
    );

    {
        let suite = session.cipher_suite.ok_or_else(|| internal_error("no cipher suite"))?;
        let prf = suite.prf_hash()?;
        let client_hs_secret = session
            .handshake_secrets
            .client
            .clone()
            .ok_or_else(|| internal_error("no client handshake secret"))?;
        let server_hs_secret = session
            .handshake_secrets
            .server
            .clone()
            .ok_or_else(|| internal_error("no server handshake secret"))?;
        keys.install(Direction::Write, Epoch::Handshake, suite, prf, &client_hs_secret).await?;
        keys.install(Direction::Read, Epoch::Handshake, suite, prf, &server_hs_secret).await?;
        trace!("client: installed handshake traffic keys");
    }

    let ee = match read_message(transport, &mut reader, session).await? {
        Handshake::EncryptedExtensions(ee) => ee,
        other => {
            return Err(Error::fatal(
                AlertDescription::unexpected_message,
                format!("Expected EncryptedExtensions, got {:?}", other.typ()),
            ))
        }
    };
    session.flags.early_data_accepted =
        session.flags.early_data_in_flight && ee.extensions.iter().any(|e| matches!(e, Extension::EarlyData(_)));
    if session.flags.early_data_in_flight {
        debug!("client: server {} early data", if session.flags.early_data_accepted { "accepted" } else { "rejected" });
    }

    let mut len_before_next = session.transcript.len();
    let mut next = read_message(transport, &mut reader, session).await?;
    let mut cert_request: Option<CertificateRequest> = None;
    if let Handshake::CertificateRequest(req) = next {
        session.flags.crt_req_sent = true;
        cert_request = Some(req);
        len_before_next = session.transcript.len();
        next = read_message(transport, &mut reader, session).await?;
    }

    let (peer_chain, peer_offered_schemes) = if !session.flags.psk_selected {
        let cert = match next {
            Handshake::Certificate(c) => c,
            other => {
                return Err(Error::fatal(
                    AlertDescription::unexpected_message,
                    format!("Expected Certificate, got {:?}", other.typ()),
                ))
            }
        };
        let chain = cert.chain();

        let len_before_cv = session.transcript.len();
        let cert_verify_msg = match read_message(transport, &mut reader, session).await? {
            Handshake::CertificateVerify(cv) => cv,
            other => {
                return Err(Error::fatal(
                    AlertDescription::unexpected_message,
                    format!("Expected CertificateVerify, got {:?}", other.typ()),
                ))
            }
        };

        let key_schedule = session.key_schedule.as_ref().ok_or_else(|| internal_error("no schedule"))?;
        let transcript_hash_before_cv = session.transcript.hash_prefix(key_schedule.hasher_factory(), len_before_cv);

        let end_entity = chain.0.first().ok_or_else(|| {
            Error::fatal(AlertDescription::bad_certificate, "Empty certificate chain")
        })?;
        let verify_ok = cert_verify::verify(
            provider.signer(cert_verify_msg.algorithm)?.as_ref(),
            CertRole::Server,
            &transcript_hash_before_cv,
            end_entity,
            &cert_verify_msg.signature,
        )
        .await?;
        if !verify_ok {
            return Err(Error::fatal(AlertDescription::decrypt_error, "Server CertificateVerify failed"));
        }

        if credentials.verify_callback(&chain, config.server_name.as_deref()).await != VerifyOutcome::Ok {
            return Err(Error::fatal(AlertDescription::bad_certificate, "Server certificate rejected"));
        }

        len_before_next = session.transcript.len();
        next = read_message(transport, &mut reader, session).await?;
        (Some(chain), None::<Vec<_>>)
    } else {
        (None, None)
    };
    let _ = peer_offered_schemes;
    let _ = peer_chain;

    let hash_before_sf = {
        let key_schedule = session.key_schedule.as_ref().ok_or_else(|| internal_error("no schedule"))?;
        session.transcript.hash_prefix(key_schedule.hasher_factory(), len_before_next)
    };

    let server_finished = match next {
        Handshake::Finished(f) => f,
        other => {
            return Err(Error::fatal(
                AlertDescription::unexpected_message,
                format!("Expected Finished, got {:?}", other.typ()),
            ))
        }
    };
    session.transcript.mark_server_finished();

    {
        let key_schedule = session.key_schedule.as_ref().ok_or_else(|| internal_error("no schedule"))?;
        let server_hs_secret = session
            .handshake_secrets
            .server
            .clone()
            .ok_or_else(|| internal_error("no server handshake secret"))?;
        if !finished::verify(key_schedule, &server_hs_secret, &hash_before_sf, &server_finished.verify_data)? {
            return Err(Error::fatal(AlertDescription::decrypt_error, "Server Finished verification failed"));
        }
    }

    if session.flags.early_data_in_flight {
        write_message(transport, session, &Handshake::EndOfEarlyData).await?;
    }

    if let Some(req) = cert_request {
        let selected = credentials
            .get_cert_chain_for(&extract_signature_schemes(&req.extensions), config.server_name.as_deref())
            .await;
        if let Some((chain, private_key, scheme)) = selected {
            session.local_signature_scheme = Some(scheme);
            let cert_msg = Certificate {
                certificate_request_context: req.certificate_request_context.clone(),
                certificate_list: chain
                    .0
                    .iter()
                    .map(|data| CertificateEntry {
                        data: data.clone(),
                        extensions: vec![],
                    })
                    .collect(),
            };
            write_message(transport, session, &Handshake::Certificate(cert_msg)).await?;

            let key_schedule = session.key_schedule.as_ref().ok_or_else(|| internal_error("no schedule"))?;
            let hash = session.transcript.hash(key_schedule.hasher_factory());
            let signature = cert_verify::sign(
                provider.signer(scheme)?.as_ref(),
                CertRole::Client,
                &hash,
                &private_key.0,
            )
            .await?;
            write_message(
                transport,
                session,
                &Handshake::CertificateVerify(crate::tls::handshake::CertificateVerify { algorithm: scheme, signature: Bytes::from(signature) }),
            )
            .await?;
        } else {
            write_message(
                transport,
                session,
                &Handshake::Certificate(Certificate {
                    certificate_request_context: req.certificate_request_context,
                    certificate_list: vec![],
                }),
            )
            .await?;
        }
    }

    {
        let key_schedule = session.key_schedule.as_ref().ok_or_else(|| internal_error("no schedule"))?;
        let hash_so_far = session.transcript.hash(key_schedule.hasher_factory());
        let client_hs_secret = session
            .handshake_secrets
            .client
            .clone()
            .ok_or_else(|| internal_error("no client handshake secret"))?;
        let verify_data = finished::compute_verify_data(key_schedule, &client_hs_secret, &hash_so_far)?;
        write_message(
            transport,
            session,
            &Handshake::Finished(crate::tls::handshake::Finished { verify_data: Bytes::from(verify_data) }),
        )
        .await?;
    }
    session.transcript.mark_client_finished();

    derive_and_install_application_secrets(session, keys).await?;
    session.flags.initial_negotiation_completed = true;
    debug!("client: handshake complete");
    Ok(())
}

fn extract_signature_schemes(extensions: &[Extension]) -> Vec<crate::tls::extensions::SignatureScheme> {
    find(extensions, |e| match e {
        Extension::SignatureAlgorithms(list) => Some(list.schemes.clone()),
        _ => None,
    })
    .unwrap_or_default()
}

fn finish_negotiation_from_server_hello(
    session: &mut Session,
    _config: &ClientConfig,
    provider: &dyn CryptoProvider,
    sh: &ServerHello,
    shares: &ClientKeyShares,
) -> Result<()> {
    let supported_version = find(&sh.extensions, |e| match e {
        Extension::SupportedVersionsServerHello(SupportedVersionsServerHello { selected_version }) => Some(*selected_version),
        _ => None,
    });
    if supported_version != Some(TLS_1_3_VERSION) {
        return Err(Error::fatal(AlertDescription::protocol_version, "Peer did not select TLS 1.3"));
    }

    session.cipher_suite = Some(sh.cipher_suite);
    let prf = sh.cipher_suite.prf_hash()?;

    if session.key_schedule.is_none() {
        session.key_schedule = Some(KeySchedule::new(provider.hasher_factory(prf)));
        session.key_schedule.as_mut().unwrap().early_secret(None);
    }

    let server_share = find(&sh.extensions, |e| match e {
        Extension::KeyShareServerHello(KeyShareServerHello { server_share }) => Some(server_share.clone()),
        _ => None,
    });

    let shared_secret = match server_share {
        Some(entry) => {
            session.selected_group = Some(entry.group);
            key_share::client_compute_shared_secret(provider, shares, &entry)?
        }
        None => vec![0u8; provider.hasher_factory(prf).output_size()],
    };

    let key_schedule = session.key_schedule.as_mut().unwrap();
    key_schedule.handshake_secret(&shared_secret)?;

    let ch_sh_hash = session.transcript.hash(key_schedule.hasher_factory());
    session.handshake_secrets.client = Some(Bytes::from(key_schedule.client_handshake_traffic_secret(&ch_sh_hash)?));
    session.handshake_secrets.server = Some(Bytes::from(key_schedule.server_handshake_traffic_secret(&ch_sh_hash)?));

    key_schedule.master_secret()?;
    Ok(())
}

async fn derive_and_install_application_secrets(session: &mut Session, keys: &mut dyn KeyInstall) -> Result<()> {
    let suite = session.cipher_suite.ok_or_else(|| internal_error("no cipher suite"))?;
    let prf = suite.prf_hash()?;
    let sf_len = session.transcript.server_finished_len().ok_or_else(|| internal_error("no SF anchor"))?;
    let key_schedule = session.key_schedule.as_ref().ok_or_else(|| internal_error("no schedule"))?;
    let ch_sf_hash = session.transcript.hash_prefix(key_schedule.hasher_factory(), sf_len);

    let client_ap = key_schedule.client_application_traffic_secret_0(&ch_sf_hash)?;
    let server_ap = key_schedule.server_application_traffic_secret_0(&ch_sf_hash)?;

    keys.install(Direction::Write, Epoch::Application, suite, prf, &client_ap).await?;
    keys.install(Direction::Read, Epoch::Application, suite, prf, &server_ap).await?;
    trace!("client: installed application traffic keys");

    session.application_secrets.client = Some(Bytes::from(client_ap));
    session.application_secrets.server = Some(Bytes::from(server_ap));
    Ok(())
}

// ---------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------

pub async fn run_server(
    session: &mut Session,
    config: &ServerConfig,
    provider: &dyn CryptoProvider,
    credentials: &dyn Credentials,
    transport: &mut dyn Transport,
    keys: &mut dyn KeyInstall,
) -> Result<()> {
    session.role = Role::Server;
    let mut reader = MessageReader::new();
    let mut ccs_sent = false;

    let mut ch = match read_message(transport, &mut reader, session).await? {
        Handshake::ClientHello(ch) => ch,
        other => {
            return Err(Error::fatal(
                AlertDescription::unexpected_message,
                format!("Expected ClientHello, got {:?}", other.typ()),
            ))
        }
    };
    session.transcript.mark_client_hello();
    session.client_random = ch.random;
    debug!("server: received ClientHello");

    let cipher_suite = negotiate_cipher_suite(&ch.cipher_suites, &config.common.supported_cipher_suites)?;
    session.cipher_suite = Some(cipher_suite);
    let prf = cipher_suite.prf_hash()?;
    trace!("server: negotiated cipher_suite={:?}", cipher_suite);

    let client_groups: Vec<_> = find(&ch.extensions, |e| match e {
        Extension::SupportedGroups(list) => Some(list.groups.clone()),
        _ => None,
    })
    .unwrap_or_default();

    let offered_shares = find(&ch.extensions, |e| match e {
        Extension::KeyShareClientHello(ks) => Some(ks.clone()),
        _ => None,
    })
    .unwrap_or_default();

    let decision = key_share::server_select(provider, &config.common.supported_groups, &offered_shares, &client_groups)?;

    let (server_share, shared_secret) = match decision {
        key_share::ServerKeyShareDecision::Accept { server_share, shared_secret } => {
            session.selected_group = Some(server_share.group);
            (Some(server_share), shared_secret)
        }
        key_share::ServerKeyShareDecision::Retry { group } => {
            if session.flags.hrr_sent {
                return Err(Error::fatal(AlertDescription::handshake_failure, "Second HelloRetryRequest would be required"));
            }
            session.flags.hrr_sent = true;
            debug!("server: sending HelloRetryRequest for group {:?}", group);

            let hasher_factory = provider.hasher_factory(prf);
            session.transcript.synthesize_for_hrr(hasher_factory.as_ref());

            let hrr = ServerHello {
                legacy_version: 0x0303,
                random: HELLO_RETRY_REQUEST_RANDOM,
                legacy_session_id_echo: ch.legacy_session_id.clone(),
                cipher_suite,
                extensions: vec![
                    Extension::SupportedVersionsServerHello(SupportedVersionsServerHello { selected_version: TLS_1_3_VERSION }),
                    Extension::KeyShareHelloRetryRequest(crate::tls::extensions::KeyShareHelloRetryRequest { selected_group: group }),
                ],
            };
            write_message(transport, session, &Handshake::ServerHello(hrr)).await?;
            if config.common.send_compat_ccs {
                send_compat_ccs(transport).await?;
                ccs_sent = true;
            }

            ch = match read_message(transport, &mut reader, session).await? {
                Handshake::ClientHello(ch2) => ch2,
                other => {
                    return Err(Error::fatal(
                        AlertDescription::unexpected_message,
                        format!("Expected second ClientHello, got {:?}", other.typ()),
                    ))
                }
            };

            let offered_shares_2 = find(&ch.extensions, |e| match e {
                Extension::KeyShareClientHello(ks) => Some(ks.clone()),
                _ => None,
            })
            .unwrap_or_default();
            match key_share::server_select(provider, &config.common.supported_groups, &offered_shares_2, &client_groups)? {
                key_share::ServerKeyShareDecision::Accept { server_share, shared_secret } => {
                    session.selected_group = Some(server_share.group);
                    (Some(server_share), shared_secret)
                }
                key_share::ServerKeyShareDecision::Retry { .. } => {
                    return Err(Error::fatal(AlertDescription::handshake_failure, "Client ignored HelloRetryRequest group"))
                }
            }
        }
    };

    // PSK negotiation (C5).
    let offered_psk = find(&ch.extensions, |e| match e {
        Extension::PreSharedKey(PreSharedKey::ClientHello(offered)) => Some(offered.clone()),
        _ => None,
    });

    let mut selected_identity: Option<u16> = None;
    if let Some(offered) = &offered_psk {
        let mut full_ch_bytes = vec![];
        Handshake::ClientHello(ch.clone()).serialize(&mut full_ch_bytes);
        let binder_lengths: Vec<usize> = offered.binders.iter().map(|b| b.len()).collect();
        let truncated = psk::truncate_for_binders(&full_ch_bytes, &binder_lengths)?;

        for (index, identity) in offered.identities.iter().enumerate() {
            let Some(psk_entry) = credentials.find_psk_by_identity(&identity.identity).await else { continue };
            let mut temp_schedule = KeySchedule::new(provider.hasher_factory(psk_entry.prf));
            temp_schedule.early_secret(Some(&psk_entry.key));

            let binder = offered.binders.get(index);
            let Some(binder) = binder else { continue };
            if psk::verify_binder(&temp_schedule, psk_entry.is_resumption, truncated, binder)? {
                session.binders = vec![BinderSlot {
                    psk: psk_entry.key,
                    prf: psk_entry.prf,
                    is_resumption: psk_entry.is_resumption,
                    identity_index: index,
                }];
                session.key_schedule = Some(temp_schedule);
                session.flags.psk_selected = true;
                selected_identity = Some(index as u16);
                break;
            }
        }
        if selected_identity.is_none() {
            return Err(Error::fatal(AlertDescription::illegal_parameter, "No valid PSK binder"));
        }
    }

    if session.key_schedule.is_none() {
        session.key_schedule = Some(KeySchedule::new(provider.hasher_factory(prf)));
        session.key_schedule.as_mut().unwrap().early_secret(None);
    }

    // 0-RTT (§4.2.10): only ever offered alongside identity 0 of a
    // resumption PSK, and never after an HRR round trip forced the client
    // to resend its ClientHello with possibly-different parameters.
    let early_data_accepted = !session.flags.hrr_sent
        && selected_identity == Some(0)
        && session.binders.first().map(|b| b.is_resumption).unwrap_or(false)
        && config.max_early_data_size.is_some()
        && ch.extensions.iter().any(|e| matches!(e, Extension::EarlyData(_)));
    session.flags.early_data_accepted = early_data_accepted;

    let mut server_random = [0u8; 32];
    provider.random(&mut server_random);
    session.server_random = server_random;

    let mut sh_extensions = vec![Extension::SupportedVersionsServerHello(SupportedVersionsServerHello {
        selected_version: TLS_1_3_VERSION,
    })];
    if let Some(entry) = &server_share {
        sh_extensions.push(Extension::KeyShareServerHello(KeyShareServerHello { server_share: entry.clone() }));
    }
    if let Some(selected) = selected_identity {
        sh_extensions.push(Extension::PreSharedKey(PreSharedKey::ServerHello { selected_identity: selected }));
    }

    let sh = ServerHello {
        legacy_version: 0x0303,
        random: server_random,
        legacy_session_id_echo: ch.legacy_session_id.clone(),
        cipher_suite,
        extensions: sh_extensions,
    };
    write_message(transport, session, &Handshake::ServerHello(sh)).await?;
    if config.common.send_compat_ccs && !ccs_sent {
        send_compat_ccs(transport).await?;
    }

    {
        let key_schedule = session.key_schedule.as_mut().unwrap();
        key_schedule.handshake_secret(&shared_secret)?;
        let ch_sh_hash = session.transcript.hash(key_schedule.hasher_factory());
        session.handshake_secrets.client = Some(Bytes::from(key_schedule.client_handshake_traffic_secret(&ch_sh_hash)?));
        session.handshake_secrets.server = Some(Bytes::from(key_schedule.server_handshake_traffic_secret(&ch_sh_hash)?));
        key_schedule.master_secret()?;
    }

    if early_data_accepted {
        let key_schedule = session.key_schedule.as_ref().unwrap();
        let ch_hash = session.transcript.hash(key_schedule.hasher_factory());
        let early_traffic_secret = key_schedule.client_early_traffic_secret(&ch_hash)?;
        keys.install(Direction::Read, Epoch::EarlyData, cipher_suite, prf, &early_traffic_secret).await?;
        debug!("server: accepted early data, installed 0-RTT read key");
    }

    let server_hs_secret = session.handshake_secrets.server.clone().unwrap();
    let client_hs_secret = session.handshake_secrets.client.clone().unwrap();
    keys.install(Direction::Write, Epoch::Handshake, cipher_suite, prf, &server_hs_secret).await?;
    keys.install(Direction::Read, Epoch::Handshake, cipher_suite, prf, &client_hs_secret).await?;
    trace!("server: installed handshake traffic keys");

    let mut ee_extensions = vec![];
    if early_data_accepted {
        ee_extensions.push(Extension::EarlyData(crate::tls::extensions::EarlyDataIndication));
    }
    write_message(transport, session, &Handshake::EncryptedExtensions(EncryptedExtensions { extensions: ee_extensions })).await?;

    let want_cert_auth = config.request_client_certificate && !session.flags.psk_selected;
    if want_cert_auth {
        session.flags.crt_req_sent = true;
        write_message(
            transport,
            session,
            &Handshake::CertificateRequest(CertificateRequest {
                certificate_request_context: Bytes::new(),
                extensions: vec![Extension::SignatureAlgorithms(SignatureSchemeList {
                    schemes: config.common.supported_signature_algorithms.clone(),
                })],
            }),
        )
        .await?;
    }

    if !session.flags.psk_selected {
        let peer_schemes = find(&ch.extensions, |e| match e {
            Extension::SignatureAlgorithms(list) => Some(list.schemes.clone()),
            _ => None,
        })
        .unwrap_or_default();

        let (chain, private_key, scheme) = credentials
            .get_cert_chain_for(&peer_schemes, None)
            .await
            .ok_or_else(|| Error::fatal(AlertDescription::handshake_failure, "No server certificate configured"))?;
        session.local_signature_scheme = Some(scheme);

        write_message(
            transport,
            session,
            &Handshake::Certificate(Certificate {
                certificate_request_context: Bytes::new(),
                certificate_list: chain
                    .0
                    .iter()
                    .map(|data| CertificateEntry {
                        data: data.clone(),
                        extensions: vec![],
                    })
                    .collect(),
            }),
        )
        .await?;

        let hash = {
            let key_schedule = session.key_schedule.as_ref().unwrap();
            session.transcript.hash(key_schedule.hasher_factory())
        };
        let signature = cert_verify::sign(provider.signer(scheme)?.as_ref(), CertRole::Server, &hash, &private_key.0).await?;
        write_message(
            transport,
            session,
            &Handshake::CertificateVerify(crate::tls::handshake::CertificateVerify { algorithm: scheme, signature: Bytes::from(signature) }),
        )
        .await?;
    }

    {
        let key_schedule = session.key_schedule.as_ref().unwrap();
        let hash = session.transcript.hash(key_schedule.hasher_factory());
        let verify_data = finished::compute_verify_data(key_schedule, &server_hs_secret, &hash)?;
        write_message(
            transport,
            session,
            &Handshake::Finished(crate::tls::handshake::Finished { verify_data: Bytes::from(verify_data) }),
        )
        .await?;
    }
    session.transcript.mark_server_finished();

    if early_data_accepted {
        match read_message(transport, &mut reader, session).await? {
            Handshake::EndOfEarlyData => {}
            other => {
                return Err(Error::fatal(
                    AlertDescription::unexpected_message,
                    format!("Expected EndOfEarlyData, got {:?}", other.typ()),
                ))
            }
        }
    }

    derive_and_install_application_secrets_server(session, keys).await?;

    // Early-start ticket issuance (§9 Open Question 2): a session that
    // doesn't wait on client authentication already has every input the
    // real client Finished will produce, since verify_data only depends on
    // client_hs_secret and the transcript through the server's own
    // Finished. Synthesize it, derive resumption_master_secret against
    // that synthetic transcript, and send tickets now instead of after the
    // real client Finished arrives.
    let mut tickets_sent_early = false;
    if config.early_start && !want_cert_auth && config.new_session_tickets_per_handshake > 0 {
        let client_hs_secret = session.handshake_secrets.client.clone().unwrap();
        let synthetic_cf_hash = {
            let key_schedule = session.key_schedule.as_ref().unwrap();
            let hash_before_cf = session.transcript.hash(key_schedule.hasher_factory());
            let synthetic_verify_data = finished::compute_verify_data(key_schedule, &client_hs_secret, &hash_before_cf)?;

            let mut synthetic_finished = vec![];
            Handshake::Finished(crate::tls::handshake::Finished {
                verify_data: Bytes::from(synthetic_verify_data),
            })
            .serialize(&mut synthetic_finished);

            let mut synthetic_transcript = session.transcript.clone();
            synthetic_transcript.append(&synthetic_finished);
            synthetic_transcript.hash(key_schedule.hasher_factory())
        };

        let resumption_master_secret = session
            .key_schedule
            .as_ref()
            .unwrap()
            .resumption_master_secret(&synthetic_cf_hash)?;

        let minted = {
            let key_schedule = session.key_schedule.as_ref().unwrap();
            post_handshake::issue_tickets(
                provider,
                credentials,
                key_schedule,
                prf,
                &resumption_master_secret,
                config.new_session_tickets_per_handshake,
                TICKET_LIFETIME_SECONDS,
                Instant::now(),
            )
            .await?
        };

        for (ticket, state) in minted {
            write_message(transport, session, &Handshake::NewSessionTicket(ticket)).await?;
            session.server_tickets_issued.push(state);
        }
        tickets_sent_early = true;
        debug!(
            "server: issued {} ticket(s) before client Finished (early_start)",
            config.new_session_tickets_per_handshake
        );
    }

    if want_cert_auth {
        let cert = match read_message(transport, &mut reader, session).await? {
            Handshake::Certificate(c) => c,
            other => {
                return Err(Error::fatal(
                    AlertDescription::unexpected_message,
                    format!("Expected client Certificate, got {:?}", other.typ()),
                ))
            }
        };
        if !cert.certificate_list.is_empty() {
            let len_before_cv = session.transcript.len();
            let cv = match read_message(transport, &mut reader, session).await? {
                Handshake::CertificateVerify(cv) => cv,
                other => {
                    return Err(Error::fatal(
                        AlertDescription::unexpected_message,
                        format!("Expected client CertificateVerify, got {:?}", other.typ()),
                    ))
                }
            };
            let key_schedule = session.key_schedule.as_ref().unwrap();
            let hash_before_cv = session.transcript.hash_prefix(key_schedule.hasher_factory(), len_before_cv);
            let chain = cert.chain();
            let end_entity = chain.0.first().ok_or_else(|| Error::fatal(AlertDescription::bad_certificate, "Empty client certificate chain"))?;
            let ok = cert_verify::verify(provider.signer(cv.algorithm)?.as_ref(), CertRole::Client, &hash_before_cv, end_entity, &cv.signature).await?;
            if !ok || credentials.verify_callback(&chain, None).await != VerifyOutcome::Ok {
                return Err(Error::fatal(AlertDescription::bad_certificate, "Client certificate rejected"));
            }
        }
    }

    let len_before_cf = session.transcript.len();
    let client_finished = match read_message(transport, &mut reader, session).await? {
        Handshake::Finished(f) => f,
        other => {
            return Err(Error::fatal(
                AlertDescription::unexpected_message,
                format!("Expected client Finished, got {:?}", other.typ()),
            ))
        }
    };
    session.transcript.mark_client_finished();

    {
        let key_schedule = session.key_schedule.as_ref().unwrap();
        let hash_before_cf = session.transcript.hash_prefix(key_schedule.hasher_factory(), len_before_cf);
        let client_hs_secret = session.handshake_secrets.client.clone().unwrap();
        if !finished::verify(key_schedule, &client_hs_secret, &hash_before_cf, &client_finished.verify_data)? {
            return Err(Error::fatal(AlertDescription::decrypt_error, "Client Finished verification failed"));
        }
    }

    if !tickets_sent_early && config.new_session_tickets_per_handshake > 0 {
        let ch_cf_hash = {
            let key_schedule = session.key_schedule.as_ref().unwrap();
            session.transcript.hash(key_schedule.hasher_factory())
        };
        let resumption_master_secret = session.key_schedule.as_ref().unwrap().resumption_master_secret(&ch_cf_hash)?;

        let minted = {
            let key_schedule = session.key_schedule.as_ref().unwrap();
            post_handshake::issue_tickets(
                provider,
                credentials,
                key_schedule,
                prf,
                &resumption_master_secret,
                config.new_session_tickets_per_handshake,
                TICKET_LIFETIME_SECONDS,
                Instant::now(),
            )
            .await?
        };

        for (ticket, state) in minted {
            write_message(transport, session, &Handshake::NewSessionTicket(ticket)).await?;
            session.server_tickets_issued.push(state);
        }
    }

    session.flags.initial_negotiation_completed = true;
    debug!("server: handshake complete");
    Ok(())
}

async fn derive_and_install_application_secrets_server(session: &mut Session, keys: &mut dyn KeyInstall) -> Result<()> {
    let suite = session.cipher_suite.ok_or_else(|| internal_error("no cipher suite"))?;
    let prf = suite.prf_hash()?;
    let sf_len = session.transcript.server_finished_len().ok_or_else(|| internal_error("no SF anchor"))?;
    let key_schedule = session.key_schedule.as_ref().ok_or_else(|| internal_error("no schedule"))?;
    let ch_sf_hash = session.transcript.hash_prefix(key_schedule.hasher_factory(), sf_len);

    let client_ap = key_schedule.client_application_traffic_secret_0(&ch_sf_hash)?;
    let server_ap = key_schedule.server_application_traffic_secret_0(&ch_sf_hash)?;

    keys.install(Direction::Write, Epoch::Application, suite, prf, &server_ap).await?;
    keys.install(Direction::Read, Epoch::Application, suite, prf, &client_ap).await?;
    trace!("server: installed application traffic keys");

    session.application_secrets.client = Some(Bytes::from(client_ap));
    session.application_secrets.server = Some(Bytes::from(server_ap));
    Ok(())
}

// ---------------------------------------------------------------------
// Post-handshake (C9)
// ---------------------------------------------------------------------

/// Drives the post-handshake message path once `run_client`/`run_server`
/// has set `initial_negotiation_completed`. Owns the byte-accumulation
/// buffer across calls the same way the initial handshake's `MessageReader`
/// does, so it can be polled repeatedly as application data and
/// post-handshake handshake-type records interleave on the same
/// connection.
pub struct PostHandshakeReader {
    reader: MessageReader,
}

impl Default for PostHandshakeReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PostHandshakeReader {
    pub fn new() -> Self {
        Self {
            reader: MessageReader::new(),
        }
    }

    /// Reads exactly one post-handshake message and dispatches it (§4.9).
    /// The caller is responsible for only invoking this when it knows a
    /// handshake-type record (not application data) is next on the wire.
    pub async fn next_event(
        &mut self,
        transport: &mut dyn Transport,
        session: &mut Session,
        now: Instant,
        auto_reauth: bool,
    ) -> Result<post_handshake::PostHandshakeEvent> {
        let msg = read_post_handshake_message(transport, &mut self.reader, session).await?;
        if !post_handshake::is_post_handshake_type(msg.typ()) {
            return Err(Error::fatal(
                AlertDescription::unexpected_message,
                format!("Unexpected post-handshake message {:?}", msg.typ()),
            ));
        }
        post_handshake::dispatch(session, msg, now, auto_reauth)
    }
}

/// Sends a `KeyUpdate` and advances this side's own write-direction
/// application traffic secret to match (RFC 8446 §4.6.3). Used both to
/// request a peer key update and to answer one that arrived with
/// `update_requested` (`PostHandshakeEvent::KeyUpdateReceived {
/// must_send_update: true }`).
pub async fn send_key_update(
    session: &mut Session,
    transport: &mut dyn Transport,
    keys: &mut dyn KeyInstall,
    request: crate::tls::handshake::KeyUpdateRequest,
) -> Result<()> {
    let mut bytes = vec![];
    Handshake::KeyUpdate(crate::tls::handshake::KeyUpdate { request_update: request }).serialize(&mut bytes);

    let mut remaining: &[u8] = &bytes;
    while !remaining.is_empty() {
        match transport.push(remaining).await {
            Ok(0) => return Err(Error::again()),
            Ok(n) => {
                remaining = &remaining[n..];
                session.reset_loop_counter();
            }
            Err(e) if !e.is_fatal() => {
                if !session.note_non_fatal_retry() {
                    return Err(internal_error("Suspicious non-progress loop while writing KeyUpdate"));
                }
            }
            Err(e) => return Err(e),
        }
    }

    let suite = session.cipher_suite.ok_or_else(|| internal_error("no cipher suite"))?;
    let prf = suite.prf_hash()?;
    let key_schedule = session.key_schedule.as_ref().ok_or_else(|| internal_error("no schedule"))?;

    let own_secret = match session.role {
        Role::Client => session.application_secrets.client.as_ref(),
        Role::Server => session.application_secrets.server.as_ref(),
    }
    .ok_or_else(|| internal_error("no application secret at KeyUpdate"))?;
    let advanced = key_schedule.next_traffic_secret(own_secret)?;

    keys.install(Direction::Write, Epoch::Application, suite, prf, &advanced).await?;
    match session.role {
        Role::Client => session.application_secrets.client = Some(Bytes::from(advanced)),
        Role::Server => session.application_secrets.server = Some(Bytes::from(advanced)),
    }
    debug!("sent KeyUpdate, advanced own write-direction traffic secret");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::KeyUpdateRateLimit;
    use crate::credentials::{CertificateChain, Psk, PrivateKeyHandle, VerifyOutcome};
    use crate::primitives::{Aead, DiffieHellman, Hasher, HasherFactory, PrfHash, Signer};
    use crate::tls::handshake::{HandshakeType, KeyUpdateRequest};

    // A deterministic, order-sensitive stand-in for a real digest, the same
    // shape used by the transcript tests: good enough to pin down HKDF
    // arithmetic without pulling in a hash implementation the collaborator
    // traits scope out.
    #[derive(Clone, Default)]
    struct StubHasher(Vec<u8>);

    impl Hasher for StubHasher {
        fn block_size(&self) -> usize {
            64
        }
        fn output_size(&self) -> usize {
            32
        }
        fn update(&mut self, data: &[u8]) {
            self.0.extend_from_slice(data);
        }
        fn finish(&self) -> Vec<u8> {
            let mut out = vec![0u8; 32];
            for (i, b) in self.0.iter().enumerate() {
                out[i % 32] ^= b.wrapping_add(i as u8);
            }
            out
        }
        fn box_clone(&self) -> Box<dyn Hasher> {
            Box::new(self.clone())
        }
    }

    struct StubFactory;
    impl HasherFactory for StubFactory {
        fn create(&self) -> Box<dyn Hasher> {
            Box::new(StubHasher::default())
        }
        fn output_size(&self) -> usize {
            32
        }
        fn box_clone(&self) -> Box<dyn HasherFactory> {
            Box::new(StubFactory)
        }
    }

    /// A fake Diffie-Hellman: `generate_keypair` hands back one unique
    /// 32-byte value used as both halves of the keypair, and
    /// `shared_secret` hashes the two parties' values in byte-sorted order
    /// so it comes out the same on both ends regardless of which side
    /// calls it, without needing any real group arithmetic.
    struct StubDh;

    static DH_COUNTER: AtomicU64 = AtomicU64::new(1);

    impl DiffieHellman for StubDh {
        fn public_key_size(&self) -> usize {
            32
        }

        fn generate_keypair(&self) -> Result<(Vec<u8>, Vec<u8>)> {
            let n = DH_COUNTER.fetch_add(1, Ordering::SeqCst);
            let mut value = vec![0u8; 32];
            value[..8].copy_from_slice(&n.to_be_bytes());
            Ok((value.clone(), value))
        }

        fn shared_secret(&self, remote_public: &[u8], local_private: &[u8]) -> Result<Vec<u8>> {
            let (a, b) = if local_private <= remote_public {
                (local_private, remote_public)
            } else {
                (remote_public, local_private)
            };
            let mut combined = Vec::with_capacity(a.len() + b.len());
            combined.extend_from_slice(a);
            combined.extend_from_slice(b);
            Ok(crate::primitives::hash(&StubFactory, &combined))
        }
    }

    /// An HMAC-shaped stand-in for a real signature scheme: `sign` and
    /// `verify` both key off the same bytes, which is all the test
    /// credentials below ever hand it (the certificate's "public key" and
    /// the matching private key handle are the same bytes).
    struct StubSigner;

    #[async_trait]
    impl Signer for StubSigner {
        async fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
            Ok(crate::primitives::hmac(&StubFactory, private_key, message))
        }
        async fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
            Ok(crate::primitives::hmac(&StubFactory, public_key, message) == signature)
        }
    }

    #[derive(Default)]
    struct StubProvider {
        counter: AtomicU64,
    }

    impl CryptoProvider for StubProvider {
        fn hasher_factory(&self, _prf: PrfHash) -> Box<dyn HasherFactory> {
            Box::new(StubFactory)
        }
        fn aead(&self, _suite: CipherSuite) -> Result<Box<dyn Aead>> {
            Err(internal_error("aead is not exercised by the handshake core itself"))
        }
        fn diffie_hellman(&self, _group: crate::tls::extensions::NamedGroup) -> Result<Box<dyn DiffieHellman>> {
            Ok(Box::new(StubDh))
        }
        fn signer(&self, _scheme: crate::tls::extensions::SignatureScheme) -> Result<Box<dyn Signer>> {
            Ok(Box::new(StubSigner))
        }
        fn random(&self, out: &mut [u8]) {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            for (i, b) in out.iter_mut().enumerate() {
                *b = (n as u8).wrapping_add(i as u8).wrapping_add(1);
            }
        }
    }

    /// Serves one fixed ed25519 credential (both roles' default
    /// `supported_signature_algorithms` include it) and no PSKs.
    struct StubCredentials;

    #[async_trait]
    impl Credentials for StubCredentials {
        async fn get_cert_chain_for(
            &self,
            sig_schemes: &[crate::tls::extensions::SignatureScheme],
            _server_name: Option<&str>,
        ) -> Option<(CertificateChain, PrivateKeyHandle, crate::tls::extensions::SignatureScheme)> {
            if !sig_schemes.contains(&crate::tls::extensions::SignatureScheme::ed25519) {
                return None;
            }
            let key = Bytes::from_static(b"stub end-entity certificate key");
            Some((
                CertificateChain(vec![key.clone()]),
                PrivateKeyHandle(key),
                crate::tls::extensions::SignatureScheme::ed25519,
            ))
        }

        async fn get_psk(&self) -> Option<Psk> {
            None
        }

        async fn find_psk_by_identity(&self, _identity: &[u8]) -> Option<Psk> {
            None
        }

        async fn verify_callback(&self, _chain: &CertificateChain, _server_name: Option<&str>) -> VerifyOutcome {
            VerifyOutcome::Ok
        }

        async fn store_issued_psk(&self, _psk: Psk, _lifetime_seconds: u32) {}
    }

    #[derive(Default)]
    struct RecordingKeys {
        installs: Vec<(Direction, Epoch)>,
    }

    #[async_trait]
    impl KeyInstall for RecordingKeys {
        async fn install(
            &mut self,
            direction: Direction,
            epoch: Epoch,
            _suite: CipherSuite,
            _prf: PrfHash,
            _traffic_secret: &[u8],
        ) -> Result<()> {
            self.installs.push((direction, epoch));
            Ok(())
        }
    }

    /// An in-memory duplex byte pipe: `push` always succeeds by extending
    /// the peer's inbound queue, and `pull` returns `Error::would_block()`
    /// on an empty queue so the state machine's own non-fatal retry loop
    /// (`read_message_raw`) does the waiting.
    struct DuplexTransport {
        outbound: Arc<StdMutex<VecDeque<u8>>>,
        inbound: Arc<StdMutex<VecDeque<u8>>>,
    }

    #[async_trait]
    impl Transport for DuplexTransport {
        async fn push(&mut self, buf: &[u8]) -> Result<usize> {
            self.outbound.lock().unwrap().extend(buf.iter().copied());
            Ok(buf.len())
        }

        async fn pull(&mut self, buf: &mut [u8]) -> Result<PullOutcome> {
            let mut inbound = self.inbound.lock().unwrap();
            if inbound.is_empty() {
                return Err(Error::would_block());
            }
            let n = buf.len().min(inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap();
            }
            Ok(PullOutcome::Data(n))
        }

        async fn pull_timeout(&mut self, timeout_ms: u64) -> Result<bool> {
            async_std::task::sleep(Duration::from_millis(timeout_ms.min(5))).await;
            Ok(true)
        }
    }

    fn duplex_pair() -> (DuplexTransport, DuplexTransport) {
        let a_to_b = Arc::new(StdMutex::new(VecDeque::new()));
        let b_to_a = Arc::new(StdMutex::new(VecDeque::new()));
        (
            DuplexTransport { outbound: a_to_b.clone(), inbound: b_to_a.clone() },
            DuplexTransport { outbound: b_to_a, inbound: a_to_b },
        )
    }

    #[async_std::test]
    async fn full_handshake_round_trip_completes() {
        let (client_transport, server_transport) = duplex_pair();

        let client_task = async_std::task::spawn(async move {
            let provider = StubProvider::default();
            let credentials = StubCredentials;
            let config = ClientConfig::recommended();
            let mut session = Session::new(Role::Client, 64, KeyUpdateRateLimit::default());
            let mut transport = client_transport;
            let mut keys = RecordingKeys::default();
            run_client(&mut session, &config, &provider, &credentials, &mut transport, &mut keys)
                .await
                .map(|_| (session, keys))
        });

        let provider = StubProvider::default();
        let credentials = StubCredentials;
        let config = ServerConfig::recommended();
        let mut server_session = Session::new(Role::Server, 64, KeyUpdateRateLimit::default());
        let mut server_transport = server_transport;
        let mut server_keys = RecordingKeys::default();
        run_server(&mut server_session, &config, &provider, &credentials, &mut server_transport, &mut server_keys)
            .await
            .expect("server handshake should complete");

        let (client_session, client_keys) = client_task.await.expect("client handshake should complete");

        assert!(client_session.flags.initial_negotiation_completed);
        assert!(server_session.flags.initial_negotiation_completed);
        assert_eq!(client_session.cipher_suite, server_session.cipher_suite);
        assert_eq!(client_session.application_secrets.client, server_session.application_secrets.client);
        assert_eq!(client_session.application_secrets.server, server_session.application_secrets.server);
        assert_eq!(server_session.server_tickets_issued.len(), config.new_session_tickets_per_handshake as usize);

        // both sides install the handshake pair, then the application pair.
        assert_eq!(client_keys.installs.len(), 4);
        assert_eq!(server_keys.installs.len(), 4);
    }

    #[async_std::test]
    async fn early_start_issues_tickets_before_client_finished() {
        let (client_transport, server_transport) = duplex_pair();

        let client_task = async_std::task::spawn(async move {
            let provider = StubProvider::default();
            let credentials = StubCredentials;
            let config = ClientConfig::recommended();
            let mut session = Session::new(Role::Client, 64, KeyUpdateRateLimit::default());
            let mut transport = client_transport;
            let mut keys = RecordingKeys::default();
            run_client(&mut session, &config, &provider, &credentials, &mut transport, &mut keys).await
        });

        let provider = StubProvider::default();
        let credentials = StubCredentials;
        let mut config = ServerConfig::recommended();
        config.early_start = true;
        let mut server_session = Session::new(Role::Server, 64, KeyUpdateRateLimit::default());
        let mut server_transport = server_transport;
        let mut server_keys = RecordingKeys::default();
        run_server(&mut server_session, &config, &provider, &credentials, &mut server_transport, &mut server_keys)
            .await
            .expect("server handshake should complete");

        client_task.await.expect("client handshake should complete");

        assert_eq!(server_session.server_tickets_issued.len(), config.new_session_tickets_per_handshake as usize);
    }

    #[async_std::test]
    async fn client_certificate_is_requested_and_verified() {
        let (client_transport, server_transport) = duplex_pair();

        let client_task = async_std::task::spawn(async move {
            let provider = StubProvider::default();
            let credentials = StubCredentials;
            let config = ClientConfig::recommended();
            let mut session = Session::new(Role::Client, 64, KeyUpdateRateLimit::default());
            let mut transport = client_transport;
            let mut keys = RecordingKeys::default();
            run_client(&mut session, &config, &provider, &credentials, &mut transport, &mut keys).await
        });

        let provider = StubProvider::default();
        let credentials = StubCredentials;
        let mut config = ServerConfig::recommended();
        config.request_client_certificate = true;
        let mut server_session = Session::new(Role::Server, 64, KeyUpdateRateLimit::default());
        let mut server_transport = server_transport;
        let mut server_keys = RecordingKeys::default();
        run_server(&mut server_session, &config, &provider, &credentials, &mut server_transport, &mut server_keys)
            .await
            .expect("server handshake with client-cert request should complete");

        client_task.await.expect("client handshake should complete");

        assert!(server_session.flags.crt_req_sent);
        assert!(server_session.flags.initial_negotiation_completed);
    }

    #[async_std::test]
    async fn hello_retry_request_round_trip_completes() {
        let (client_transport, server_transport) = duplex_pair();

        let client_task = async_std::task::spawn(async move {
            let provider = StubProvider::default();
            let credentials = StubCredentials;
            let mut config = ClientConfig::recommended();
            // Offer only the server's second-preference group so the
            // server is forced to send a HelloRetryRequest naming its
            // first-preference group instead.
            config.common.supported_groups = vec![
                crate::tls::extensions::NamedGroup::secp521r1,
                crate::tls::extensions::NamedGroup::x25519,
            ];
            config.key_share_group_count = 1;
            let mut session = Session::new(Role::Client, 64, KeyUpdateRateLimit::default());
            let mut transport = client_transport;
            let mut keys = RecordingKeys::default();
            run_client(&mut session, &config, &provider, &credentials, &mut transport, &mut keys)
                .await
                .map(|_| session)
        });

        let provider = StubProvider::default();
        let credentials = StubCredentials;
        let config = ServerConfig::recommended();
        let mut server_session = Session::new(Role::Server, 64, KeyUpdateRateLimit::default());
        let mut server_transport = server_transport;
        let mut server_keys = RecordingKeys::default();
        run_server(&mut server_session, &config, &provider, &credentials, &mut server_transport, &mut server_keys)
            .await
            .expect("server handshake after HRR should complete");

        let client_session = client_task.await.expect("client handshake after HRR should complete");

        assert!(server_session.flags.hrr_sent);
        assert!(client_session.flags.hrr_received);
        assert_eq!(server_session.selected_group, Some(crate::tls::extensions::NamedGroup::x25519));
        assert_eq!(client_session.application_secrets.server, server_session.application_secrets.server);
    }

    fn session_with_application_secrets(role: Role) -> Session {
        let mut session = Session::new(role, 16, KeyUpdateRateLimit::default());
        session.cipher_suite = Some(CipherSuite::TLS_AES_128_GCM_SHA256);
        session.key_schedule = Some(KeySchedule::new(Box::new(StubFactory)));
        session.application_secrets.client = Some(Bytes::from_static(b"client application traffic secret 1"));
        session.application_secrets.server = Some(Bytes::from_static(b"server application traffic secret 1"));
        session
    }

    #[async_std::test]
    async fn key_update_request_triggers_reply_obligation() {
        let (mut sender_transport, mut receiver_transport) = duplex_pair();

        let mut sender = session_with_application_secrets(Role::Client);
        let mut receiver = session_with_application_secrets(Role::Server);

        let mut sender_keys = RecordingKeys::default();
        send_key_update(&mut sender, &mut sender_transport, &mut sender_keys, KeyUpdateRequest::update_requested)
            .await
            .unwrap();

        let mut reader = PostHandshakeReader::new();
        let event = reader
            .next_event(&mut receiver_transport, &mut receiver, Instant::now(), false)
            .await
            .unwrap();

        match event {
            post_handshake::PostHandshakeEvent::KeyUpdateReceived { must_send_update } => {
                assert!(must_send_update)
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // the receiver derives the same advanced secret the sender just
        // installed for its own write direction.
        assert_eq!(receiver.application_secrets.client, sender.application_secrets.client);
        assert_eq!(sender_keys.installs, vec![(Direction::Write, Epoch::Application)]);
    }

    #[async_std::test]
    async fn key_update_rate_limit_rejects_excess_updates() {
        let (mut sender_transport, mut receiver_transport) = duplex_pair();

        let mut sender = session_with_application_secrets(Role::Client);
        let mut receiver = session_with_application_secrets(Role::Server);
        receiver.key_update_limiter = crate::session::KeyUpdateRateLimiter::new(KeyUpdateRateLimit {
            max_updates: 1,
            window_ms: 60_000,
        });

        let mut sender_keys = RecordingKeys::default();
        let mut reader = PostHandshakeReader::new();

        send_key_update(&mut sender, &mut sender_transport, &mut sender_keys, KeyUpdateRequest::update_not_requested)
            .await
            .unwrap();
        reader
            .next_event(&mut receiver_transport, &mut receiver, Instant::now(), false)
            .await
            .expect("first KeyUpdate is within budget");

        send_key_update(&mut sender, &mut sender_transport, &mut sender_keys, KeyUpdateRequest::update_not_requested)
            .await
            .unwrap();
        let err = reader
            .next_event(&mut receiver_transport, &mut receiver, Instant::now(), false)
            .await
            .expect_err("second KeyUpdate exceeds the one-update budget");
        assert!(err.is_fatal());
    }

    #[test]
    fn message_reader_accumulates_partial_frames() {
        let mut full = vec![];
        Handshake::Finished(crate::tls::handshake::Finished { verify_data: Bytes::from_static(&[0x11; 32]) })
            .serialize(&mut full);

        let mut reader = MessageReader::new();
        let (first, second) = full.split_at(full.len() / 2);
        reader.buf.extend_from_slice(first);
        assert!(reader.try_take().unwrap().is_none());

        reader.buf.extend_from_slice(second);
        let msg = reader.try_take().unwrap().expect("full frame now available");
        assert_eq!(msg.typ(), HandshakeType::finished);
    }

    #[test]
    fn negotiate_cipher_suite_prefers_supported_order() {
        let offered = vec![CipherSuite::TLS_CHACHA20_POLY1305_SHA256, CipherSuite::TLS_AES_128_GCM_SHA256];
        let supported = vec![CipherSuite::TLS_AES_128_GCM_SHA256, CipherSuite::TLS_CHACHA20_POLY1305_SHA256];
        assert_eq!(negotiate_cipher_suite(&offered, &supported).unwrap(), CipherSuite::TLS_AES_128_GCM_SHA256);
    }

    #[test]
    fn negotiate_cipher_suite_fails_closed_with_no_overlap() {
        let offered = vec![CipherSuite::TLS_CHACHA20_POLY1305_SHA256];
        let supported = vec![CipherSuite::TLS_AES_128_GCM_SHA256];
        assert!(negotiate_cipher_suite(&offered, &supported).is_err());
    }
}
