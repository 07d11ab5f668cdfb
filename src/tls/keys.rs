//! The key-installation collaborator (§6, referenced from C8): the
//! handshake core derives traffic secrets but never performs AEAD framing
//! itself, so it hands each secret to this trait at the correct point in
//! the flight instead.

use async_trait::async_trait;

use crate::error::Result;
use crate::primitives::PrfHash;
use crate::tls::cipher_suite::CipherSuite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Which of the three traffic-secret epochs a key belongs to. `KeyUpdate`
/// only ever re-derives within `Application`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Epoch {
    EarlyData,
    Handshake,
    Application,
}

#[async_trait]
pub trait KeyInstall: Send {
    /// Installs `traffic_secret` as the active key material for
    /// `direction`/`epoch`. Called once per secret the schedule derives
    /// that actually needs record-layer keys (the exporter secrets do
    /// not).
    async fn install(
        &mut self,
        direction: Direction,
        epoch: Epoch,
        suite: CipherSuite,
        prf: PrfHash,
        traffic_secret: &[u8],
    ) -> Result<()>;
}
