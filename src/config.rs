//! `ClientConfig`/`ServerConfig` (C0): the priority lists and policy flags a
//! `Session` is constructed from, with `recommended()` constructors mirroring
//! RFC 8446 §9.1's "MUST implement" / "SHOULD implement" defaults.

use bytes::Bytes;

use crate::tls::cipher_suite::CipherSuite;
use crate::tls::extensions::{NamedGroup, PskKeyExchangeMode, SignatureScheme};

/// Shared priority lists both roles negotiate from.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub supported_cipher_suites: Vec<CipherSuite>,
    pub supported_groups: Vec<NamedGroup>,
    pub supported_signature_algorithms: Vec<SignatureScheme>,
    pub psk_key_exchange_modes: Vec<PskKeyExchangeMode>,

    /// Send a middlebox-compatibility ChangeCipherSpec record immediately
    /// after ServerHello/HelloRetryRequest or ClientHello (RFC 8446
    /// Appendix D.4). Defaults to `true`: harmless and matches the widest
    /// deployed base. Received CCS records are always accepted and ignored
    /// regardless of this flag.
    pub send_compat_ccs: bool,

    pub suspicious_loop_limit: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            supported_cipher_suites: vec![
                CipherSuite::TLS_AES_128_GCM_SHA256,
                CipherSuite::TLS_AES_256_GCM_SHA384,
                CipherSuite::TLS_CHACHA20_POLY1305_SHA256,
            ],
            supported_groups: vec![
                NamedGroup::x25519,
                NamedGroup::secp256r1,
                NamedGroup::secp384r1,
            ],
            supported_signature_algorithms: vec![
                SignatureScheme::ecdsa_secp256r1_sha256,
                SignatureScheme::rsa_pss_rsae_sha256,
                SignatureScheme::rsa_pkcs1_sha256,
                SignatureScheme::ed25519,
            ],
            psk_key_exchange_modes: vec![PskKeyExchangeMode::psk_dhe_ke],
            send_compat_ccs: true,
            suspicious_loop_limit: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub common: HandshakeConfig,

    /// How many groups to send an eager `key_share` for. RFC 8446 §9.1
    /// recommends offering just the most preferred group to avoid wasted
    /// key generation; bump this to pre-empt a HelloRetryRequest round trip
    /// at the cost of generating shares that may go unused.
    pub key_share_group_count: usize,

    pub server_name: Option<String>,
    pub alpn_protocols: Vec<Bytes>,
    pub enable_early_data: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            common: HandshakeConfig::default(),
            key_share_group_count: 1,
            server_name: None,
            alpn_protocols: vec![],
            enable_early_data: false,
        }
    }
}

impl ClientConfig {
    pub fn recommended() -> Self {
        Self::default()
    }

    pub fn key_share_groups(&self) -> Vec<NamedGroup> {
        self.common
            .supported_groups
            .iter()
            .take(self.key_share_group_count.max(1))
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub common: HandshakeConfig,

    pub request_client_certificate: bool,
    pub certificate_authorities: Vec<Bytes>,

    /// Emit `NewSessionTicket`(s) before the client Finished arrives, using
    /// the synthetic client-Finished transcript scheme, for sessions that
    /// don't require client authentication (§9 Open Question 2). Disabled
    /// by default: it is a throughput optimisation, not a correctness
    /// requirement, and most deployments don't need it.
    pub early_start: bool,

    pub max_early_data_size: Option<u32>,
    pub new_session_tickets_per_handshake: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            common: HandshakeConfig::default(),
            request_client_certificate: false,
            certificate_authorities: vec![],
            early_start: false,
            max_early_data_size: None,
            new_session_tickets_per_handshake: 2,
        }
    }
}

impl ServerConfig {
    pub fn recommended() -> Self {
        Self::default()
    }
}

/// Key-update rate limit (§3 invariant 8): no more than `max_updates` within
/// any `window_ms` sliding window.
#[derive(Debug, Clone, Copy)]
pub struct KeyUpdateRateLimit {
    pub max_updates: usize,
    pub window_ms: u64,
}

impl Default for KeyUpdateRateLimit {
    fn default() -> Self {
        Self {
            max_updates: 8,
            window_ms: 1000,
        }
    }
}
