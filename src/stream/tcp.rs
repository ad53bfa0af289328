// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leaf streams that talk to the OS directly, or to a TLS session wrapped
//! around one. TLS is modeled as a configuration of *how* a TCP stream is
//! opened (see [`crate::tls`]) — the layer above it just sees a `Stream`.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Stream;

/// Bytes read per [`Stream::read_raw`] call on a leaf stream.
pub const STREAM_TCP_BUFSIZE: usize = 4 * 1024;

/// A leaf [`Stream`] over any `AsyncRead + AsyncWrite` duplex channel:
/// a raw `tokio::net::TcpStream`, or a TLS session layered on top of one.
pub struct AsyncRwStream<IO> {
    io: IO,
    buf: Vec<u8>,
    wbuf: Vec<u8>,
    closing: bool,
}

impl<IO> AsyncRwStream<IO> {
    pub fn new(io: IO) -> Self {
        AsyncRwStream {
            io,
            buf: Vec::new(),
            wbuf: Vec::new(),
            closing: false,
        }
    }
}

#[async_trait]
impl<IO> Stream for AsyncRwStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    async fn read_raw(&mut self) -> io::Result<Vec<u8>> {
        let mut tmp = vec![0u8; STREAM_TCP_BUFSIZE];
        let n = self.io.read(&mut tmp).await?;
        tmp.truncate(n);
        Ok(tmp)
    }

    fn write_raw(&mut self, buf: &[u8]) {
        self.wbuf.extend_from_slice(buf);
    }

    async fn drain(&mut self) -> io::Result<()> {
        if !self.wbuf.is_empty() {
            self.io.write_all(&self.wbuf).await?;
            self.wbuf.clear();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closing = true;
    }

    async fn wait_closed(&mut self) -> io::Result<()> {
        if self.closing {
            // Best-effort: a reset peer makes shutdown() fail harmlessly.
            let _ = self.io.shutdown().await;
        }
        Ok(())
    }
}

pub type TcpStream = AsyncRwStream<tokio::net::TcpStream>;

/// Connect a plain outbound TCP stream to `addr`.
pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> io::Result<TcpStream> {
    let io = tokio::net::TcpStream::connect(addr).await?;
    io.set_nodelay(true).ok();
    Ok(AsyncRwStream::new(io))
}
