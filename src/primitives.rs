//! Collaborator interfaces for cryptographic primitives (§6 of the spec).
//!
//! None of these traits are implemented by this crate: callers supply a
//! concrete `CryptoProvider` (e.g. one backed by `ring`). The handshake core
//! is generic over the trait objects below and only ever calls through
//! them, matching the "primitives are external collaborators" scoping.

use async_trait::async_trait;

use crate::error::Result;

/// A running hash computation. Cloneable via `box_clone` so the transcript
/// can be hashed at multiple offsets without disturbing a live computation.
pub trait Hasher: Send {
    fn block_size(&self) -> usize;
    fn output_size(&self) -> usize;
    fn update(&mut self, data: &[u8]);
    fn finish(&self) -> Vec<u8>;
    fn box_clone(&self) -> Box<dyn Hasher>;
}

/// Produces fresh `Hasher` instances for a fixed hash function. Cloneable
/// and cheap to pass around by value (it's typically a zero-sized type or a
/// function pointer wrapper).
pub trait HasherFactory: Send + Sync {
    fn create(&self) -> Box<dyn Hasher>;
    fn output_size(&self) -> usize;
    fn box_clone(&self) -> Box<dyn HasherFactory>;
}

impl Clone for Box<dyn HasherFactory> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

pub fn hash(factory: &dyn HasherFactory, data: &[u8]) -> Vec<u8> {
    let mut h = factory.create();
    h.update(data);
    h.finish()
}

/// HMAC over a `HasherFactory`'s hash function (RFC 2104).
pub fn hmac(factory: &dyn HasherFactory, key: &[u8], data: &[u8]) -> Vec<u8> {
    let block_size = factory.create().block_size();

    let mut key_block = vec![0u8; block_size];
    if key.len() > block_size {
        let digest = hash(factory, key);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = key_block.clone();
    let mut opad = key_block;
    for b in ipad.iter_mut() {
        *b ^= 0x36;
    }
    for b in opad.iter_mut() {
        *b ^= 0x5c;
    }

    let mut inner = factory.create();
    inner.update(&ipad);
    inner.update(data);
    let inner_digest = inner.finish();

    let mut outer = factory.create();
    outer.update(&opad);
    outer.update(&inner_digest);
    outer.finish()
}

/// An AEAD cipher used only to install record-layer keys; the AEAD
/// operation itself is performed by the record layer (out of scope here).
pub trait Aead: Send + Sync {
    fn key_size(&self) -> usize;
    fn nonce_size(&self) -> usize;

    fn seal(&self, key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8], out: &mut Vec<u8>);
    fn open(
        &self,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()>;

    fn box_clone(&self) -> Box<dyn Aead>;
}

/// Diffie-Hellman style key exchange for one named group (EC, X25519/X448,
/// or an FFDHE group). Keygen and shared-secret derivation only; wire
/// encoding of the public key follows the conventions in §6 (ANSI X9.62
/// points for EC, raw bytes for X/FFDHE) and is the caller's responsibility.
pub trait DiffieHellman: Send + Sync {
    /// Size in bytes of the encoded public key for this group.
    fn public_key_size(&self) -> usize;

    fn generate_keypair(&self) -> Result<(Vec<u8>, Vec<u8>)>;

    fn shared_secret(&self, remote_public: &[u8], local_private: &[u8]) -> Result<Vec<u8>>;
}

/// A signing/verification primitive for one signature scheme.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>>;
    async fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool>;
}

/// The bundle of primitives a caller supplies to drive a handshake.
/// Implementations are expected to be cheap to clone (e.g. an `Arc` around
/// a provider backed by `ring` or a hardware module).
pub trait CryptoProvider: Send + Sync {
    fn hasher_factory(&self, prf: PrfHash) -> Box<dyn HasherFactory>;
    fn aead(&self, suite: crate::tls::cipher_suite::CipherSuite) -> Result<Box<dyn Aead>>;
    fn diffie_hellman(
        &self,
        group: crate::tls::extensions::NamedGroup,
    ) -> Result<Box<dyn DiffieHellman>>;
    fn signer(&self, scheme: crate::tls::extensions::SignatureScheme) -> Result<Box<dyn Signer>>;
    fn random(&self, out: &mut [u8]);
}

/// Which hash underlies the negotiated cipher suite's key schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfHash {
    Sha256,
    Sha384,
}

/// Compares two byte slices in time independent of where they first differ.
///
/// Mirrors the reference crate's `constant_eq`: accumulates equality with
/// `&&` rather than short-circuiting, and always walks the full length of
/// the shorter comparison so the number of iterations does not leak which
/// byte failed.
pub fn constant_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut same: u8 = 0;
    for i in 0..a.len() {
        same |= a[i] ^ b[i];
    }
    same == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_eq_basic() {
        assert!(constant_eq(b"hello", b"hello"));
        assert!(!constant_eq(b"hello", b"hellp"));
        assert!(!constant_eq(b"hello", b"hell"));
        assert!(constant_eq(b"", b""));
    }
}
