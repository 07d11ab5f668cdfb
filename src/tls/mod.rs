//! The TLS 1.3 protocol layer: wire types, cryptographic derivations, and
//! the handshake state machine that drives them. Everything outside this
//! module (`Session`, `Credentials`, `Transport`, `primitives`) is a
//! collaborator the state machine calls through, not TLS-specific itself.

pub mod alert;
pub mod cert_verify;
pub mod cipher_suite;
pub mod extensions;
pub mod finished;
pub mod handshake;
pub mod key_schedule;
pub mod key_share;
pub mod keys;
pub mod post_handshake;
pub mod psk;
pub mod state_machine;
pub mod transcript;
