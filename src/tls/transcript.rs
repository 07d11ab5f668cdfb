//! The handshake transcript buffer (C1).
//!
//! Accumulates every handshake message's wire bytes in order, stable
//! insertion order, never shrinking except for the one-time HelloRetryRequest
//! rewrite.

use crate::primitives::HasherFactory;

#[derive(Default, Clone)]
pub struct Transcript {
    buffer: Vec<u8>,

    /// Length of `buffer` immediately after appending CH1 (or the
    /// reconstructed CH after HRR).
    client_hello_len: Option<usize>,
    /// Length of `buffer` immediately after appending the client Finished.
    client_finished_len: Option<usize>,
    /// Length of `buffer` immediately after appending the server Finished.
    server_finished_len: Option<usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn mark_client_hello(&mut self) {
        self.client_hello_len = Some(self.buffer.len());
    }

    pub fn mark_client_finished(&mut self) {
        self.client_finished_len = Some(self.buffer.len());
    }

    pub fn mark_server_finished(&mut self) {
        self.server_finished_len = Some(self.buffer.len());
    }

    pub fn client_hello_len(&self) -> Option<usize> {
        self.client_hello_len
    }

    pub fn server_finished_len(&self) -> Option<usize> {
        self.server_finished_len
    }

    pub fn client_finished_len(&self) -> Option<usize> {
        self.client_finished_len
    }

    /// Current buffer length, for callers that need to hash "everything up
    /// to but not including the next message" by snapshotting this before
    /// appending it.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn hash(&self, hasher_factory: &dyn HasherFactory) -> Vec<u8> {
        crate::primitives::hash(hasher_factory, &self.buffer)
    }

    /// Hash of the first `offset` bytes; used for exporter secrets anchored
    /// at CH or SF.
    pub fn hash_prefix(&self, hasher_factory: &dyn HasherFactory, offset: usize) -> Vec<u8> {
        crate::primitives::hash(hasher_factory, &self.buffer[..offset])
    }

    /// Rewrites the buffer to the synthetic HelloRetryRequest form:
    /// `0xFE 00 00 len || Hash(old_buffer)`. Called exactly once, after
    /// parsing CH1 and before sending HRR (invariant 2).
    pub fn synthesize_for_hrr(&mut self, hasher_factory: &dyn HasherFactory) {
        let digest = self.hash(hasher_factory);

        let mut synthetic = Vec::with_capacity(4 + digest.len());
        synthetic.push(0xFE);
        synthetic.push(0x00);
        synthetic.push(0x00);
        synthetic.push(digest.len() as u8);
        synthetic.extend_from_slice(&digest);

        self.buffer = synthetic;
        // The anchor offsets above all refer to the pre-HRR buffer and are
        // reset; they get re-marked as CH2/SF/CF are appended.
        self.client_hello_len = None;
        self.client_finished_len = None;
        self.server_finished_len = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::Hasher;

    #[derive(Clone)]
    struct Sha256Stub(Vec<u8>);

    impl Hasher for Sha256Stub {
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
            // A deterministic, order-sensitive stand-in for a real digest:
            // good enough to test transcript monotonicity without pulling in
            // a hash implementation the spec scopes out.
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
            Box::new(Sha256Stub(vec![]))
        }
        fn output_size(&self) -> usize {
            32
        }
        fn box_clone(&self) -> Box<dyn HasherFactory> {
            Box::new(StubFactory)
        }
    }

    #[test]
    fn transcript_monotone() {
        let mut t = Transcript::new();
        t.append(b"hello");
        t.append(b" world");

        let mut direct = Transcript::new();
        direct.append(b"hello world");

        assert_eq!(t.hash(&StubFactory), direct.hash(&StubFactory));
    }

    #[test]
    fn hrr_rewrite_matches_formula() {
        let mut t = Transcript::new();
        t.append(b"client-hello-1-bytes");
        let old_hash = t.hash(&StubFactory);

        t.synthesize_for_hrr(&StubFactory);

        let mut expected = Transcript::new();
        expected.append(&[0xFE, 0x00, 0x00, old_hash.len() as u8]);
        expected.append(&old_hash);

        assert_eq!(t.hash(&StubFactory), expected.hash(&StubFactory));
    }
}
