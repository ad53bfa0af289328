// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `Stream` abstraction: a polymorphic duplex byte channel with a
//! push-back buffer and an optional owned inner layer.
//!
//! Every protocol layer (TLS, WebSocket, Trojan, Vmess, ...) implements
//! [`Stream`] over an inner `Stream` it owns, so closing the outer layer
//! recursively closes everything beneath it. [`splice`] is the only
//! long-running I/O loop in the system.

pub mod tcp;
pub mod ws;

use std::io;

use async_trait::async_trait;

use crate::error::{CoreError, STREAM_BUFSIZE};

/// Duplex byte channel with a push-back buffer.
///
/// Invariant: bytes produced by [`Stream::read`] are the concatenation of
/// the push-back buffer (in order) followed by further bytes from
/// [`Stream::read_raw`]. `push(b)` followed by `read_exactly(b.len())`
/// returns exactly `b`.
#[async_trait]
pub trait Stream: Send {
    /// Mutable access to the push-back buffer. Concrete leaves store this
    /// directly; layered streams delegate to an internal field of their
    /// own (never to the inner stream's buffer — each layer's pushback is
    /// private to that layer).
    fn buf_mut(&mut self) -> &mut Vec<u8>;

    /// Read at most one chunk from the underlying source. Returns an empty
    /// vector to signal clean end-of-stream; never spuriously.
    async fn read_raw(&mut self) -> io::Result<Vec<u8>>;

    /// Queue `buf` for writing. Durable only after a subsequent
    /// [`Stream::drain`] resolves. A no-op (besides logging) for an empty
    /// buffer.
    fn write_raw(&mut self, buf: &[u8]);

    /// Flush queued writes to the underlying sink.
    async fn drain(&mut self) -> io::Result<()>;

    /// Non-blocking: mark the stream for closing.
    fn close(&mut self);

    /// Wait for the close initiated by [`Stream::close`] to complete.
    /// Errors are swallowed by [`Stream::ensure_closed`]; implementations
    /// may still surface them here for direct callers.
    async fn wait_closed(&mut self) -> io::Result<()>;

    /// The layer this stream wraps, if any. Default: a leaf stream.
    fn inner(&mut self) -> Option<&mut (dyn Stream + '_)> {
        None
    }

    /// Prepend `buf` to the push-back buffer: the next read sees `buf`
    /// first, then whatever was already pushed back.
    fn push(&mut self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let existing = std::mem::take(self.buf_mut());
        let mut merged = Vec::with_capacity(buf.len() + existing.len());
        merged.extend_from_slice(buf);
        merged.extend_from_slice(&existing);
        *self.buf_mut() = merged;
    }

    /// Take and clear the whole push-back buffer.
    fn pop(&mut self) -> Vec<u8> {
        std::mem::take(self.buf_mut())
    }

    fn write(&mut self, buf: &[u8]) {
        if buf.is_empty() {
            log::debug!("write: skipping empty buffer");
        } else {
            self.write_raw(buf);
        }
    }

    async fn write_drain(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write(buf);
        self.drain().await
    }

    /// Return buffered bytes without consuming them, filling from the
    /// source once if the buffer is empty.
    async fn peek(&mut self) -> io::Result<Vec<u8>> {
        if self.buf_mut().is_empty() {
            let chunk = self.read_raw().await?;
            *self.buf_mut() = chunk;
        }
        Ok(self.buf_mut().clone())
    }

    /// Consume and return whatever is available: the push-back buffer if
    /// non-empty, else one `read_raw`.
    async fn read(&mut self) -> io::Result<Vec<u8>> {
        let buffered = self.pop();
        if !buffered.is_empty() {
            Ok(buffered)
        } else {
            self.read_raw().await
        }
    }

    /// Read at least `n` bytes, possibly overshooting. Fails with
    /// [`CoreError::IncompleteRead`] if the source ends first; bytes read
    /// so far are pushed back so the stream's observable state is
    /// unchanged on failure.
    async fn read_at_least(&mut self, n: usize) -> Result<Vec<u8>, CoreError> {
        let mut acc = self.pop();
        while acc.len() < n {
            let chunk = self.read_raw().await?;
            if chunk.is_empty() {
                self.push(&acc);
                return Err(CoreError::IncompleteRead);
            }
            acc.extend_from_slice(&chunk);
        }
        Ok(acc)
    }

    /// Read exactly `n` bytes, pushing back any overshoot.
    async fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>, CoreError> {
        let mut acc = self.read_at_least(n).await?;
        if acc.len() > n {
            let rest = acc.split_off(n);
            self.push(&rest);
        }
        Ok(acc)
    }

    /// Accumulate until `sep` appears, pushing back everything after it.
    /// `strip` controls whether `sep` itself is included in the returned
    /// prefix. Fails with [`CoreError::BufferOverflow`] past
    /// [`STREAM_BUFSIZE`].
    async fn read_until(&mut self, sep: &[u8], strip: bool) -> Result<Vec<u8>, CoreError> {
        let mut acc = self.pop();
        loop {
            if let Some(pos) = find_subslice(&acc, sep) {
                let rest = acc.split_off(pos + sep.len());
                self.push(&rest);
                if strip {
                    acc.truncate(pos);
                } else {
                    acc.truncate(pos + sep.len());
                }
                return Ok(acc);
            }
            if acc.len() > STREAM_BUFSIZE {
                return Err(CoreError::BufferOverflow);
            }
            let chunk = self.read_raw().await?;
            if chunk.is_empty() {
                return Err(CoreError::IncompleteRead);
            }
            acc.extend_from_slice(&chunk);
        }
    }

    async fn read_u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.read_exactly(1).await?[0])
    }

    async fn read_u16(&mut self) -> Result<u16, CoreError> {
        let b = self.read_exactly(2).await?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    async fn read_u32(&mut self) -> Result<u32, CoreError> {
        let b = self.read_exactly(4).await?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    async fn read_u64(&mut self) -> Result<u64, CoreError> {
        let b = self.read_exactly(8).await?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    /// Read a u8-length-prefixed byte string.
    async fn read_lenp_u8(&mut self) -> Result<Vec<u8>, CoreError> {
        let n = self.read_u8().await? as usize;
        self.read_exactly(n).await
    }

    /// Read a u16-length-prefixed byte string.
    async fn read_lenp_u16(&mut self) -> Result<Vec<u8>, CoreError> {
        let n = self.read_u16().await? as usize;
        if n > STREAM_BUFSIZE {
            return Err(CoreError::BufferOverflow);
        }
        self.read_exactly(n).await
    }

    /// Read a u32-length-prefixed byte string.
    async fn read_lenp_u32(&mut self) -> Result<Vec<u8>, CoreError> {
        let n = self.read_u32().await? as usize;
        if n > STREAM_BUFSIZE {
            return Err(CoreError::BufferOverflow);
        }
        self.read_exactly(n).await
    }

    /// Run both `close` and `wait_closed`, swallow errors, then
    /// recursively close the inner layer. Idempotent: safe to call more
    /// than once on the same stream.
    async fn ensure_closed(&mut self) {
        self.close();
        if let Err(e) = self.wait_closed().await {
            log::debug!("ensure_closed: wait_closed returned {e}");
        }
        if let Some(inner) = self.inner() {
            inner.ensure_closed().await;
        }
    }
}

/// Run `$body` (an expression evaluating to a future that borrows
/// `$stream`), then `ensure_closed` `$stream` if it returned an `Err` —
/// analogous to a `try`/`finally` around every acceptor/connector body so
/// a partial handshake never leaks a socket.
///
/// This has to be a macro, not a generic function: a function taking a
/// `stream: &'a mut S` plus a closure bound as `FnOnce(&'a mut S) -> Fut`
/// would force the body's borrow and the later `ensure_closed` call to
/// share the same `'a`, which makes `stream` unusable for the second call
/// once it has been passed to the first. Expanding inline keeps the two
/// borrows sequential and non-overlapping, same as writing the
/// `try`/`finally` by hand at each call site.
#[macro_export]
macro_rules! scoped_close {
    ($stream:expr, $body:expr) => {{
        let result = $body.await;
        if result.is_err() {
            $crate::stream::Stream::ensure_closed(&mut *$stream).await;
        }
        result
    }};
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splice `a` and `b`: read whichever side has data ready and forward it to
/// the other, in a single task, until either side ends. Each direction only
/// ever needs its own `&mut` borrow, so unlike a pair of tasks copying in
/// opposite directions behind a shared lock per stream, a write to `a` is
/// never blocked behind a read that is still waiting on `a` for more bytes.
/// This is the single source of long-running I/O in the system.
pub async fn splice(mut a: Box<dyn Stream>, mut b: Box<dyn Stream>) {
    loop {
        tokio::select! {
            result = a.read() => {
                match result {
                    Ok(chunk) if !chunk.is_empty() => {
                        if let Err(e) = b.write_drain(&chunk).await {
                            log::debug!("splice: write side ended with {e}");
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        log::debug!("splice: read side ended with {e}");
                        break;
                    }
                }
            }
            result = b.read() => {
                match result {
                    Ok(chunk) if !chunk.is_empty() => {
                        if let Err(e) = a.write_drain(&chunk).await {
                            log::debug!("splice: write side ended with {e}");
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        log::debug!("splice: read side ended with {e}");
                        break;
                    }
                }
            }
        }
    }

    a.ensure_closed().await;
    b.ensure_closed().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An in-memory leaf stream for exercising the default trait methods.
    struct MemStream {
        buf: Vec<u8>,
        remaining: Vec<Vec<u8>>,
        written: Vec<u8>,
        closed: bool,
    }

    impl MemStream {
        fn new(chunks: Vec<&[u8]>) -> Self {
            MemStream {
                buf: Vec::new(),
                remaining: chunks.into_iter().map(|c| c.to_vec()).collect(),
                written: Vec::new(),
                closed: false,
            }
        }
    }

    #[async_trait]
    impl Stream for MemStream {
        fn buf_mut(&mut self) -> &mut Vec<u8> {
            &mut self.buf
        }

        async fn read_raw(&mut self) -> io::Result<Vec<u8>> {
            if self.remaining.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(self.remaining.remove(0))
            }
        }

        fn write_raw(&mut self, buf: &[u8]) {
            self.written.extend_from_slice(buf);
        }

        async fn drain(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }

        async fn wait_closed(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_then_read_exactly_roundtrips() {
        let mut s = MemStream::new(vec![]);
        s.push(b"hello");
        let got = s.read_exactly(5).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn read_exactly_overshoot_pushes_back_rest() {
        let mut s = MemStream::new(vec![b"abcdef"]);
        let got = s.read_exactly(3).await.unwrap();
        assert_eq!(got, b"abc");
        let rest = s.read_exactly(3).await.unwrap();
        assert_eq!(rest, b"def");
    }

    #[tokio::test]
    async fn read_exactly_incomplete_errors() {
        let mut s = MemStream::new(vec![b"ab"]);
        let err = s.read_exactly(5).await;
        assert!(matches!(err, Err(CoreError::IncompleteRead)));
    }

    #[tokio::test]
    async fn read_until_strip_and_keep() {
        let mut s = MemStream::new(vec![b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"]);
        let line = s.read_until(b"\r\n", true).await.unwrap();
        assert_eq!(line, b"GET / HTTP/1.1");

        let mut s2 = MemStream::new(vec![b"a\r\nb"]);
        let with_sep = s2.read_until(b"\r\n", false).await.unwrap();
        assert_eq!(with_sep, b"a\r\n");
    }

    #[tokio::test]
    async fn ensure_closed_is_idempotent() {
        let mut s = MemStream::new(vec![]);
        s.ensure_closed().await;
        s.ensure_closed().await;
        assert!(s.closed);
    }
}
