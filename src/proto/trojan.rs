// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trojan acceptor/connector (module G): SHA-224 password auth followed by
//! a SOCKS5-style request, all inside a TLS tunnel the caller already
//! established. Grounded on the teacher's own protocol — this crate's
//! namesake — generalized from a CONNECT-only relay to one command among
//! several the core dispatches to.

use crate::addr::Addr;
use crate::error::CoreError;
use crate::proto::password;
use crate::request::Request;
use crate::stream::Stream;

const CRLF: &[u8] = b"\r\n";
const CMD_CONNECT: u8 = 0x01;

/// Connector side: password + CRLF + CMD + addr + CRLF + residual payload,
/// all in a single write. Trojan has no server acknowledgement.
pub async fn connect(
    stream: &mut dyn Stream,
    password: &str,
    dest: &Addr,
    rest: &[u8],
) -> Result<(), CoreError> {
    let hex = password::to_hex(&password::digest(password));
    let addr_bytes = dest.encode();

    let mut req = Vec::with_capacity(56 + 2 + 1 + addr_bytes.len() + 2 + rest.len());
    req.extend_from_slice(&hex);
    req.extend_from_slice(CRLF);
    req.push(CMD_CONNECT);
    req.extend(addr_bytes);
    req.extend_from_slice(CRLF);
    req.extend_from_slice(rest);
    stream.write_drain(&req).await?;
    Ok(())
}

/// Acceptor side: verify the 56-byte hex password against `expected`, parse
/// the SOCKS5-style request, and hand back whatever payload bytes arrived
/// in the same read as the trailing CRLF.
pub async fn accept(mut stream: Box<dyn Stream>, expected: &[u8; 28]) -> Result<Request, CoreError> {
    let addr = crate::scoped_close!(
        stream,
        async {
            let auth_err = || CoreError::protocol("trojan", "auth");

            let hex = stream.read_exactly(56).await.map_err(|_| auth_err())?;
            let digest = password::from_hex(&hex).map_err(|_| auth_err())?;
            if !password::digests_match(&digest, expected) {
                return Err(auth_err());
            }
            if stream.read_exactly(2).await.map_err(|_| auth_err())? != CRLF {
                return Err(auth_err());
            }

            let request_err = || CoreError::protocol("trojan", "request");
            let cmd = stream.read_u8().await.map_err(|_| request_err())?;
            if cmd != CMD_CONNECT {
                return Err(CoreError::protocol("trojan", "unsupported command"));
            }
            let addr = Addr::read_from(stream.as_mut()).await.map_err(|_| request_err())?;
            if stream.read_exactly(2).await.map_err(|_| request_err())? != CRLF {
                return Err(request_err());
            }
            Ok(addr)
        }
    )?;

    let rest = stream.pop();
    Ok(Request::new(stream, addr, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use async_trait::async_trait;

    struct MemStream {
        buf: Vec<u8>,
        remaining: Vec<u8>,
        written: Vec<u8>,
    }

    impl MemStream {
        fn new(data: &[u8]) -> Self {
            MemStream { buf: Vec::new(), remaining: data.to_vec(), written: Vec::new() }
        }
    }

    #[async_trait]
    impl Stream for MemStream {
        fn buf_mut(&mut self) -> &mut Vec<u8> {
            &mut self.buf
        }

        async fn read_raw(&mut self) -> std::io::Result<Vec<u8>> {
            Ok(std::mem::take(&mut self.remaining))
        }

        fn write_raw(&mut self, buf: &[u8]) {
            self.written.extend_from_slice(buf);
        }

        async fn drain(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn close(&mut self) {}

        async fn wait_closed(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn accept_rejects_wrong_password() {
        let expected = password::digest("correct-horse");
        let hex = password::to_hex(&password::digest("wrong"));
        let mut wire = hex.to_vec();
        wire.extend_from_slice(CRLF);
        let stream: Box<dyn Stream> = Box::new(MemStream::new(&wire));
        let err = accept(stream, &expected).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn accept_parses_request_and_captures_payload() {
        let password_str = "s3cr3t";
        let expected = password::digest(password_str);
        let dest = Addr::Domain("example.com".to_string(), 443);

        let mut wire = password::to_hex(&expected).to_vec();
        wire.extend_from_slice(CRLF);
        wire.push(CMD_CONNECT);
        wire.extend(dest.encode());
        wire.extend_from_slice(CRLF);
        wire.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");

        let stream: Box<dyn Stream> = Box::new(MemStream::new(&wire));
        let req = accept(stream, &expected).await.unwrap();
        assert_eq!(req.addr, dest);
        assert_eq!(req.rest(), b"GET / HTTP/1.1\r\n\r\n");
    }
}
