//! A TLS 1.3 (RFC 8446) handshake implementation: wire codecs, the key
//! schedule, and the client/server state machines, built against an
//! abstract `Transport` and `CryptoProvider` so it can run atop any byte
//! stream and any cryptographic backend.
//!
//! This crate implements the handshake layer only: it produces and
//! consumes the negotiated traffic secrets and expects a caller to own the
//! actual AEAD record layer, certificate parsing/path validation, and PSK
//! storage (`credentials::Credentials`) — see that module's doc comment for
//! the exact boundary.

pub mod macros;

pub mod config;
pub mod credentials;
pub mod error;
pub mod primitives;
pub mod session;
pub mod tls;
pub mod transport;
pub mod wire;
