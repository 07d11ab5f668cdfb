//! CertificateRequest / CertificateVerify orchestration (C6): signature
//! scheme negotiation and the fixed signed-content construction from
//! RFC 8446 §4.4.3.

use crate::error::Result;
use crate::primitives::Signer;
use crate::tls::extensions::SignatureScheme;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertRole {
    Client,
    Server,
}

impl CertRole {
    fn context_string(&self) -> &'static [u8] {
        match self {
            CertRole::Client => b"TLS 1.3, client CertificateVerify",
            CertRole::Server => b"TLS 1.3, server CertificateVerify",
        }
    }
}

/// `64 * 0x20 || context_string || 0x00 || Transcript-Hash`. The leading run
/// of spaces exists purely to put clear daylight between a TLS 1.3
/// signature and a TLS 1.2 one over the same key, so cross-protocol replay
/// doesn't work.
pub fn signed_content(role: CertRole, transcript_hash: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(64 + 40 + 1 + transcript_hash.len());
    content.extend(std::iter::repeat(0x20u8).take(64));
    content.extend_from_slice(role.context_string());
    content.push(0x00);
    content.extend_from_slice(transcript_hash);
    content
}

pub async fn sign(
    signer: &dyn Signer,
    role: CertRole,
    transcript_hash: &[u8],
    private_key: &[u8],
) -> Result<Vec<u8>> {
    signer.sign(private_key, &signed_content(role, transcript_hash)).await
}

pub async fn verify(
    signer: &dyn Signer,
    role: CertRole,
    transcript_hash: &[u8],
    public_key: &[u8],
    signature: &[u8],
) -> Result<bool> {
    signer
        .verify(public_key, &signed_content(role, transcript_hash), signature)
        .await
}

/// Picks the first scheme, in the verifier's own preference order, that the
/// peer also offered.
pub fn negotiate_signature_scheme(
    local_preference: &[SignatureScheme],
    peer_offered: &[SignatureScheme],
) -> Option<SignatureScheme> {
    local_preference
        .iter()
        .find(|scheme| peer_offered.contains(scheme))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_content_has_expected_shape() {
        let hash = vec![0x42u8; 32];
        let content = signed_content(CertRole::Server, &hash);

        assert_eq!(&content[..64], &[0x20u8; 64][..]);
        assert!(content[64..].starts_with(b"TLS 1.3, server CertificateVerify\x00"));
        assert!(content.ends_with(&hash));
    }

    #[test]
    fn negotiation_prefers_local_order() {
        let local = vec![
            SignatureScheme::ecdsa_secp256r1_sha256,
            SignatureScheme::rsa_pss_rsae_sha256,
        ];
        let peer = vec![
            SignatureScheme::rsa_pss_rsae_sha256,
            SignatureScheme::ecdsa_secp256r1_sha256,
        ];
        assert_eq!(
            negotiate_signature_scheme(&local, &peer),
            Some(SignatureScheme::ecdsa_secp256r1_sha256)
        );
    }

    #[test]
    fn negotiation_fails_closed_with_no_overlap() {
        let local = vec![SignatureScheme::ed25519];
        let peer = vec![SignatureScheme::rsa_pss_rsae_sha256];
        assert_eq!(negotiate_signature_scheme(&local, &peer), None);
    }
}
