// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP CONNECT acceptor/connector (module E).
//!
//! Grounded on `proxy/acceptor/http.py` and `proxy/connector/http.py`: the
//! connector speaks a minimal `CONNECT host:port HTTP/1.1` tunnel request;
//! the acceptor also forwards plain (non-CONNECT) requests by stripping
//! `Proxy-*` headers and re-queuing the request as residual bytes, so a
//! plain HTTP proxy client works against the same port.

use std::net::{IpAddr, SocketAddr};

use crate::addr::Addr;
use crate::error::CoreError;
use crate::request::Request;
use crate::stream::Stream;

/// Connector side: send `CONNECT`, append any residual bytes in the same
/// write, require a `200` response.
pub async fn connect(stream: &mut dyn Stream, dest: &Addr, rest: &[u8]) -> Result<(), CoreError> {
    let authority = dest.authority();
    let mut req = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").into_bytes();
    req.extend_from_slice(rest);
    stream.write_drain(&req).await?;

    let header = stream.read_until(b"\r\n\r\n", true).await?;
    let text = String::from_utf8_lossy(&header);
    let status_line = text
        .lines()
        .next()
        .ok_or_else(|| CoreError::protocol("http", "empty CONNECT response"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| CoreError::protocol("http", "missing status code"))?;
    if status != "200" {
        return Err(CoreError::protocol("http", "CONNECT rejected"));
    }
    Ok(())
}

/// Acceptor side: on `CONNECT`, reply `200` and open a tunnel to the
/// requested authority. On any other method, strip `Proxy-*` headers and
/// push the re-serialized request back as residual bytes so it reaches the
/// real destination untouched.
pub async fn accept(mut stream: Box<dyn Stream>) -> Result<Request, CoreError> {
    let (addr, rest) = crate::scoped_close!(
        stream,
        async {
            let header = stream.read_until(b"\r\n\r\n", true).await?;
            let text = String::from_utf8_lossy(&header).into_owned();
            let mut lines = text.split("\r\n");

            let request_line = lines
                .next()
                .ok_or_else(|| CoreError::protocol("http", "empty request"))?;
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or("").to_string();
            let target = parts.next().unwrap_or("").to_string();
            let version = parts.next().unwrap_or("");
            if version != "HTTP/1.1" {
                return Err(CoreError::protocol("http", "require HTTP/1.1"));
            }

            let headers: Vec<(String, String)> = lines
                .filter_map(|line| line.split_once(':'))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect();

            let host = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("host"))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| CoreError::protocol("http", "missing Host header"))?;

            if method.eq_ignore_ascii_case("CONNECT") {
                let addr = parse_host_port(&host, 443)?;
                stream
                    .write_drain(b"HTTP/1.1 200 Connection Established\r\nConnection: close\r\n\r\n")
                    .await?;
                Ok((addr, Vec::new()))
            } else {
                let addr = parse_host_port(&host, 80)?;

                let mut rebuilt = format!("{method} {target} HTTP/1.1\r\n");
                for (k, v) in &headers {
                    if k.to_ascii_lowercase().starts_with("proxy-") {
                        continue;
                    }
                    rebuilt.push_str(k);
                    rebuilt.push_str(": ");
                    rebuilt.push_str(v);
                    rebuilt.push_str("\r\n");
                }
                rebuilt.push_str("\r\n");

                stream.push(rebuilt.as_bytes());
                let rest = stream.pop();
                Ok((addr, rest))
            }
        }
    )?;

    Ok(Request::new(stream, addr, rest))
}

/// Accepts `h`, `h:p`, `[h6]`, `[h6]:p`.
fn parse_host_port(s: &str, default_port: u16) -> Result<Addr, CoreError> {
    let err = || CoreError::protocol("http", "invalid host");
    if let Some(rest) = s.strip_prefix('[') {
        let close = rest.find(']').ok_or_else(err)?;
        let ip: IpAddr = rest[..close].parse().map_err(|_| err())?;
        let after = &rest[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| err())?,
            None => default_port,
        };
        return Ok(Addr::Ip(SocketAddr::new(ip, port)));
    }

    if let Some((host, port)) = s.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return Ok(host_to_addr(host, port));
        }
    }
    Ok(host_to_addr(s, default_port))
}

fn host_to_addr(host: &str, port: u16) -> Addr {
    match host.parse::<IpAddr>() {
        Ok(ip) => Addr::Ip(SocketAddr::new(ip, port)),
        Err(_) => Addr::Domain(host.to_string(), port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct MemStream {
        buf: Vec<u8>,
        remaining: Vec<u8>,
        written: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    }

    impl MemStream {
        fn new(data: &[u8]) -> Self {
            MemStream {
                buf: Vec::new(),
                remaining: data.to_vec(),
                written: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            }
        }

        fn written_handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<u8>>> {
            self.written.clone()
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
            self.written.lock().unwrap().extend_from_slice(buf);
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
    async fn connect_destination_comes_from_host_header_not_request_line() {
        // Request-line target deliberately differs from the Host header: a
        // transparent/forging client could point the line at one host while
        // asking to tunnel to another via Host. The Host header must win.
        let wire = b"CONNECT decoy.example:9999 HTTP/1.1\r\nHost: real.example:443\r\n\r\n";
        let stream: Box<dyn Stream> = Box::new(MemStream::new(wire));
        let req = accept(stream).await.unwrap();
        assert_eq!(req.addr, Addr::Domain("real.example".to_string(), 443));
    }

    #[tokio::test]
    async fn connect_reply_includes_connection_close() {
        let wire = b"CONNECT real.example:443 HTTP/1.1\r\nHost: real.example:443\r\n\r\n";
        let mem = MemStream::new(wire);
        let written = mem.written_handle();
        let stream: Box<dyn Stream> = Box::new(mem);
        accept(stream).await.unwrap();
        let reply = String::from_utf8(written.lock().unwrap().clone()).unwrap();
        assert_eq!(reply, "HTTP/1.1 200 Connection Established\r\nConnection: close\r\n\r\n");
    }

    #[test]
    fn parses_bracketed_ipv6_with_port() {
        let addr = parse_host_port("[::1]:8080", 80).unwrap();
        assert_eq!(addr, Addr::Ip("[::1]:8080".parse().unwrap()));
    }

    #[test]
    fn parses_bare_domain_uses_default_port() {
        let addr = parse_host_port("example.com", 80).unwrap();
        assert_eq!(addr, Addr::Domain("example.com".to_string(), 80));
    }

    #[test]
    fn parses_domain_with_explicit_port() {
        let addr = parse_host_port("example.com:8443", 80).unwrap();
        assert_eq!(addr, Addr::Domain("example.com".to_string(), 8443));
    }
}
