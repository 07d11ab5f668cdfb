//! TLS 1.3 cipher suites and the PRF hash / AEAD pair each one selects.

use crate::error::Result;
use crate::primitives::PrfHash;

tls_enum_u16!(CipherSuite => {
    TLS_AES_128_GCM_SHA256(0x1301),
    TLS_AES_256_GCM_SHA384(0x1302),
    TLS_CHACHA20_POLY1305_SHA256(0x1303),
    TLS_AES_128_CCM_SHA256(0x1304),
    TLS_AES_128_CCM_8_SHA256(0x1305),
});

impl CipherSuite {
    /// The PRF hash (and therefore HKDF output size) this suite's key
    /// schedule runs on.
    pub fn prf_hash(&self) -> Result<PrfHash> {
        Ok(match self {
            CipherSuite::TLS_AES_128_GCM_SHA256
            | CipherSuite::TLS_CHACHA20_POLY1305_SHA256
            | CipherSuite::TLS_AES_128_CCM_SHA256
            | CipherSuite::TLS_AES_128_CCM_8_SHA256 => PrfHash::Sha256,
            CipherSuite::TLS_AES_256_GCM_SHA384 => PrfHash::Sha384,
            CipherSuite::unknown(_) => {
                return Err(crate::error::illegal_parameter("Unsupported cipher suite"))
            }
        })
    }
}
