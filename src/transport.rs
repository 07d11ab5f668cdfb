//! The push/pull transport collaborator (§6). Out-of-scope record framing
//! lives on the other side of this trait; the handshake core only ever
//! pushes/pulls opaque byte buffers.

use async_trait::async_trait;

use crate::error::{Error, Result};

pub enum PullOutcome {
    Data(usize),
    Eof,
}

#[async_trait]
pub trait Transport: Send {
    /// Writes as much of `buf` as possible. Returns `Error::would_block()`
    /// if no bytes could be written without blocking; the state machine
    /// treats this as non-fatal and retries on the next call.
    async fn push(&mut self, buf: &[u8]) -> Result<usize>;

    /// Reads into `buf`. Returns `Ok(PullOutcome::Eof)` on a clean remote
    /// close, or `Error::would_block()` if no data is available yet.
    async fn pull(&mut self, buf: &mut [u8]) -> Result<PullOutcome>;

    /// Blocks (cooperatively) up to `timeout_ms` for data to become
    /// available. Returns `Ok(true)` if data is ready, `Ok(false)` on
    /// timeout.
    async fn pull_timeout(&mut self, timeout_ms: u64) -> Result<bool>;

    async fn push_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.push(buf).await?;
            if n == 0 {
                return Err(Error::again());
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}
