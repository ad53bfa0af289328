// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SOCKS5-like address field shared by SOCKS5, Trojan and Vmess
//! (ATYP + address + port), and the destination type used throughout the
//! core (`Request.addr` in spec.md §3).
//!
//! Grounded on the teacher's `src/proto/addr.rs` for the wire layout
//! (ATYP 0x01/0x03/0x04), generalized to an owned value: the teacher's
//! `Address<'a>` borrows from the input buffer via a raw pointer so it can
//! avoid an allocation, which does not survive being carried across the
//! acceptor → dispatcher → connector handoff (crosses an await point and
//! is stored in a `Request`), so this version owns its domain string.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::CoreError;
use crate::stream::Stream;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// A proxy destination: either a textual domain or a numeric IPv4/IPv6
/// literal (never with brackets — those are a textual-representation
/// concern of HTTP CONNECT's Host header only).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Addr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Addr {
    pub fn host(&self) -> String {
        match self {
            Addr::Ip(a) => a.ip().to_string(),
            Addr::Domain(d, _) => d.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Addr::Ip(a) => a.port(),
            Addr::Domain(_, p) => *p,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        match self {
            Addr::Ip(SocketAddr::V6(a)) => format!("[{}]:{}", a.ip(), a.port()),
            Addr::Ip(SocketAddr::V4(a)) => format!("{}:{}", a.ip(), a.port()),
            Addr::Domain(d, p) => format!("{d}:{p}"),
        }
    }

    /// Encode as a SOCKS5-like ATYP+ADDR+PORT field.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Addr::Ip(SocketAddr::V4(a)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&a.ip().octets());
                buf.extend_from_slice(&a.port().to_be_bytes());
            }
            Addr::Ip(SocketAddr::V6(a)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&a.ip().octets());
                buf.extend_from_slice(&a.port().to_be_bytes());
            }
            Addr::Domain(name, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf
    }

    /// Decode an ATYP+ADDR+PORT field from the front of `bytes`, returning
    /// the address and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Addr, usize), CoreError> {
        let err = || CoreError::protocol("addr", "malformed address field");
        let atyp = *bytes.first().ok_or_else(err)?;
        match atyp {
            ATYP_IPV4 => {
                let rest = bytes.get(1..7).ok_or_else(err)?;
                let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
                let port = u16::from_be_bytes([rest[4], rest[5]]);
                Ok((Addr::Ip(SocketAddrV4::new(ip, port).into()), 7))
            }
            ATYP_IPV6 => {
                let rest = bytes.get(1..19).ok_or_else(err)?;
                let octets: [u8; 16] = rest[..16].try_into().unwrap();
                let port = u16::from_be_bytes([rest[16], rest[17]]);
                let ip = Ipv6Addr::from(octets);
                Ok((Addr::Ip(SocketAddrV6::new(ip, port, 0, 0).into()), 19))
            }
            ATYP_DOMAIN => {
                let len = *bytes.get(1).ok_or_else(err)? as usize;
                let rest = bytes.get(2..2 + len + 2).ok_or_else(err)?;
                let name = std::str::from_utf8(&rest[..len]).map_err(|_| err())?;
                let port = u16::from_be_bytes([rest[len], rest[len + 1]]);
                Ok((Addr::Domain(name.to_string(), port), 2 + len + 2))
            }
            _ => Err(err()),
        }
    }

    /// Read an ATYP+ADDR+PORT field directly off a stream (used by the
    /// SOCKS5 and Trojan acceptors).
    pub async fn read_from(stream: &mut (dyn Stream)) -> Result<Addr, CoreError> {
        let atyp = stream.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let b = stream.read_exactly(4).await?;
                let port = stream.read_u16().await?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                Ok(Addr::Ip(SocketAddrV4::new(ip, port).into()))
            }
            ATYP_IPV6 => {
                let b = stream.read_exactly(16).await?;
                let octets: [u8; 16] = b.try_into().unwrap();
                let port = stream.read_u16().await?;
                Ok(Addr::Ip(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0).into()))
            }
            ATYP_DOMAIN => {
                let name = stream.read_lenp_u8().await?;
                let name =
                    String::from_utf8(name).map_err(|_| CoreError::protocol("addr", "non-utf8 domain"))?;
                let port = stream.read_u16().await?;
                Ok(Addr::Domain(name, port))
            }
            _ => Err(CoreError::protocol("addr", "unknown ATYP")),
        }
    }

    /// Open an outbound TCP connection to this destination.
    pub async fn open_tcp(&self) -> std::io::Result<tokio::net::TcpStream> {
        match self {
            Addr::Ip(a) => tokio::net::TcpStream::connect(a).await,
            Addr::Domain(name, port) => tokio::net::TcpStream::connect((name.as_str(), *port)).await,
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(a: SocketAddr) -> Self {
        Addr::Ip(a)
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_roundtrips() {
        let a = Addr::Ip("127.0.0.1:443".parse().unwrap());
        let encoded = a.encode();
        let (decoded, consumed) = Addr::decode(&encoded).unwrap();
        assert_eq!(decoded, a);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn domain_roundtrips() {
        let a = Addr::Domain("example.com".to_string(), 8080);
        let encoded = a.encode();
        let (decoded, consumed) = Addr::decode(&encoded).unwrap();
        assert_eq!(decoded, a);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn ipv6_authority_is_bracketed() {
        let a = Addr::Ip("[::1]:443".parse().unwrap());
        assert_eq!(a.authority(), "[::1]:443");
    }
}
