// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RFC 6455 WebSocket framing as a [`Stream`] layer (module D).
//!
//! Grounded on `p3/contrib/basic/ws.py`, with two deliberate departures
//! from that reference: the magic GUID below has no embedded whitespace
//! (the Python source's copy of it does, which would make every accept
//! computation wrong), and the acceptor validates `Connection`, `Upgrade`
//! and `Sec-WebSocket-Version` strictly, per spec, rather than accepting
//! anything that merely parses.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use async_trait::async_trait;
use rand::RngCore;

use crate::error::{CoreError, STREAM_BUFSIZE};
use crate::stream::Stream;

const WS_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

pub struct WsStream {
    inner: Box<dyn Stream>,
    buf: Vec<u8>,
    wbuf: Vec<u8>,
    /// Client masks outgoing frames; server does not.
    mask_outgoing: bool,
    closed: bool,
}

#[async_trait]
impl Stream for WsStream {
    fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    async fn read_raw(&mut self) -> std::io::Result<Vec<u8>> {
        if self.closed {
            return Ok(Vec::new());
        }
        self.read_message().await.map_err(Into::into)
    }

    fn write_raw(&mut self, buf: &[u8]) {
        self.wbuf.extend_from_slice(buf);
    }

    async fn drain(&mut self) -> std::io::Result<()> {
        if !self.wbuf.is_empty() {
            let payload = std::mem::take(&mut self.wbuf);
            let frame = encode_frame(OP_BINARY, &payload, self.mask_outgoing);
            self.inner.write_drain(&frame).await?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.inner.close();
    }

    async fn wait_closed(&mut self) -> std::io::Result<()> {
        self.inner.wait_closed().await
    }

    fn inner(&mut self) -> Option<&mut (dyn Stream + '_)> {
        Some(self.inner.as_mut())
    }
}

impl WsStream {
    async fn read_frame_header(&mut self) -> Result<(bool, u8, bool, u64), CoreError> {
        let b0 = self.inner.read_u8().await?;
        let fin = b0 & 0x80 != 0;
        if b0 & 0x70 != 0 {
            return Err(CoreError::protocol("ws", "nonzero rsv bits"));
        }
        let opcode = b0 & 0x0F;

        let b1 = self.inner.read_u8().await?;
        let masked = b1 & 0x80 != 0;
        let len = match b1 & 0x7F {
            126 => self.inner.read_u16().await? as u64,
            127 => self.inner.read_u64().await?,
            n => n as u64,
        };
        Ok((fin, opcode, masked, len))
    }

    /// Reassemble one message (across continuation frames), answering
    /// pings and discarding pongs inline. Returns an empty vector on a
    /// close frame.
    async fn read_message(&mut self) -> Result<Vec<u8>, CoreError> {
        let mut data = Vec::new();
        loop {
            let (fin, opcode, masked, len) = self.read_frame_header().await?;
            if len as usize > STREAM_BUFSIZE {
                return Err(CoreError::BufferOverflow);
            }
            let mask_key = if masked {
                Some(self.inner.read_exactly(4).await?)
            } else {
                None
            };
            let mut payload = self.inner.read_exactly(len as usize).await?;
            if let Some(key) = &mask_key {
                for (i, b) in payload.iter_mut().enumerate() {
                    *b ^= key[i % 4];
                }
            }

            match opcode {
                OP_CONTINUATION | OP_TEXT | OP_BINARY => {
                    data.extend_from_slice(&payload);
                    if data.len() > STREAM_BUFSIZE {
                        return Err(CoreError::BufferOverflow);
                    }
                    if fin {
                        return Ok(data);
                    }
                }
                OP_CLOSE => {
                    self.closed = true;
                    return Ok(Vec::new());
                }
                OP_PING => {
                    let frame = encode_frame(OP_PONG, &payload, self.mask_outgoing);
                    self.inner.write_drain(&frame).await?;
                }
                OP_PONG => {}
                _ => return Err(CoreError::protocol("ws", "unknown opcode")),
            }
        }
    }
}

fn encode_frame(opcode: u8, payload: &[u8], mask: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | opcode);

    let mask_bit = if mask { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    if mask {
        let mut key = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut key);
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    } else {
        out.extend_from_slice(payload);
    }
    out
}

fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn fresh_key() -> String {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    BASE64.encode(key)
}

/// Client-side handshake: send the GET/Upgrade request, validate the 101
/// response and its `Sec-WebSocket-Accept`.
pub async fn connect(
    mut inner: Box<dyn Stream>,
    host: &str,
    path: &str,
) -> Result<Box<dyn Stream>, CoreError> {
    let key = fresh_key();

    crate::scoped_close!(
        inner,
        async {
            let req = format!(
                "GET {path} HTTP/1.1\r\n\
                 Host: {host}\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Key: {key}\r\n\
                 Sec-WebSocket-Version: 13\r\n\r\n"
            );
            inner.write_drain(req.as_bytes()).await?;

            let header = inner.read_until(b"\r\n\r\n", true).await?;
            let text = String::from_utf8_lossy(&header).into_owned();
            let mut lines = text.split("\r\n");
            let status_line = lines
                .next()
                .ok_or_else(|| CoreError::protocol("ws", "empty response"))?;
            if !status_line.contains(" 101 ") {
                return Err(CoreError::protocol("ws", "expected 101 Switching Protocols"));
            }

            let expect = compute_accept(&key);
            let mut matched = false;
            for line in lines {
                if let Some((k, v)) = line.split_once(':') {
                    if k.trim().eq_ignore_ascii_case("sec-websocket-accept") && v.trim() == expect {
                        matched = true;
                    }
                }
            }
            if !matched {
                return Err(CoreError::protocol("ws", "accept value mismatch"));
            }
            Ok(())
        }
    )?;

    Ok(Box::new(WsStream {
        inner,
        buf: Vec::new(),
        wbuf: Vec::new(),
        mask_outgoing: true,
        closed: false,
    }))
}

/// Server-side handshake: parse the request line and headers, require
/// `GET`, `HTTP/1.1`, `Connection: Upgrade`, `Upgrade: websocket`,
/// `Sec-WebSocket-Version: 13`; reply 101 with the matching accept value.
pub async fn accept(mut inner: Box<dyn Stream>) -> Result<Box<dyn Stream>, CoreError> {
    crate::scoped_close!(
        inner,
        async {
            let header = inner.read_until(b"\r\n\r\n", true).await?;
            let text = String::from_utf8_lossy(&header).into_owned();
            let mut lines = text.split("\r\n");

            let request_line = lines
                .next()
                .ok_or_else(|| CoreError::protocol("ws", "empty request"))?;
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or("");
            let _target = parts.next().unwrap_or("");
            let version = parts.next().unwrap_or("");
            if method != "GET" || version != "HTTP/1.1" {
                return Err(CoreError::protocol("ws", "expected GET ... HTTP/1.1"));
            }

            let mut key = None;
            let mut is_upgrade_ws = false;
            let mut is_connection_upgrade = false;
            let mut is_version_13 = false;
            for line in lines {
                let Some((k, v)) = line.split_once(':') else {
                    continue;
                };
                let v = v.trim();
                match k.trim().to_ascii_lowercase().as_str() {
                    "sec-websocket-key" => key = Some(v.to_string()),
                    "upgrade" => is_upgrade_ws = v.eq_ignore_ascii_case("websocket"),
                    "connection" => {
                        is_connection_upgrade =
                            v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
                    }
                    "sec-websocket-version" => is_version_13 = v.trim() == "13",
                    _ => {}
                }
            }

            if !is_upgrade_ws || !is_connection_upgrade || !is_version_13 {
                return Err(CoreError::protocol("ws", "missing or invalid upgrade headers"));
            }
            let key = key.ok_or_else(|| CoreError::protocol("ws", "missing Sec-WebSocket-Key"))?;

            let accept_value = compute_accept(&key);
            let resp = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept_value}\r\n\r\n"
            );
            inner.write_drain(resp.as_bytes()).await?;
            Ok(())
        }
    )?;

    Ok(Box::new(WsStream {
        inner,
        buf: Vec::new(),
        wbuf: Vec::new(),
        mask_outgoing: false,
        closed: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        let accept = compute_accept("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn unmasked_frame_roundtrips_through_decode_path() {
        let payload = b"hello websocket";
        let frame = encode_frame(OP_BINARY, payload, false);
        // FIN=1, opcode=binary
        assert_eq!(frame[0], 0x82);
        assert_eq!(frame[1] & 0x80, 0); // not masked
        assert_eq!(&frame[2..], payload);
    }

    #[test]
    fn masked_frame_has_mask_bit_and_key() {
        let payload = b"abc";
        let frame = encode_frame(OP_TEXT, payload, true);
        assert_eq!(frame[1] & 0x80, 0x80);
        assert_eq!(frame.len(), 2 + 4 + payload.len());
    }
}
