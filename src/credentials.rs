//! The credentials store collaborator (§6). Certificate parsing, path
//! validation and PSK/SRP storage are all out of scope; this module only
//! defines the contract the handshake core calls through.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::tls::extensions::SignatureScheme;

/// An opaque end-entity-first certificate chain, exactly as it appears on
/// the wire in a TLS 1.3 `Certificate` message.
#[derive(Debug, Clone)]
pub struct CertificateChain(pub Vec<Bytes>);

/// An opaque private key handle. The handshake core never inspects the
/// bytes directly; it hands them to a `Signer` (see `primitives.rs`).
#[derive(Debug, Clone)]
pub struct PrivateKeyHandle(pub Bytes);

/// A pre-shared key, either configured out-of-band ("external") or minted
/// by a previous handshake's `NewSessionTicket` ("resumption").
#[derive(Debug, Clone)]
pub struct Psk {
    pub identity: Bytes,
    pub key: Bytes,
    pub prf: crate::primitives::PrfHash,
    pub is_resumption: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    Rejected,
}

/// The credentials collaborator: certificate selection, PSK lookup, and the
/// peer-certificate verify callback.
#[async_trait]
pub trait Credentials: Send + Sync {
    /// Selects a certificate chain + private key compatible with one of
    /// `sig_schemes`, optionally scoped to `server_name` (SNI). Returns
    /// `None` if no compatible credential is configured.
    async fn get_cert_chain_for(
        &self,
        sig_schemes: &[SignatureScheme],
        server_name: Option<&str>,
    ) -> Option<(CertificateChain, PrivateKeyHandle, SignatureScheme)>;

    /// Looks up the PSK to offer as a client, if any external PSK is
    /// configured (independent of resumption tickets, which are tracked on
    /// the `Session` itself).
    async fn get_psk(&self) -> Option<Psk>;

    /// Server-side identity lookup for an offered PSK identity.
    async fn find_psk_by_identity(&self, identity: &[u8]) -> Option<Psk>;

    /// Validates a peer certificate chain (expiration, chain of trust,
    /// name matching). The handshake core treats this purely as a
    /// yes/no gate; it never interprets the reason.
    async fn verify_callback(
        &self,
        chain: &CertificateChain,
        server_name: Option<&str>,
    ) -> VerifyOutcome;

    /// Server-side: records a PSK just minted via `NewSessionTicket` so a
    /// later `find_psk_by_identity` on some future connection can return it.
    /// `lifetime_seconds` is the ticket's advertised lifetime; credentials
    /// stores are expected to expire entries themselves.
    async fn store_issued_psk(&self, psk: Psk, lifetime_seconds: u32);
}
