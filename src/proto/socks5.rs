// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SOCKS5 acceptor/connector (module F), no-auth only.
//!
//! Grounded on `proxy/contrib/proxy/socks5.py`. The connector always
//! encodes the destination as ATYP 0x03 (domain), even when it is
//! numeric — the upstream SOCKS5 server accepts a dotted-quad string as a
//! domain name just fine, and this keeps the connector from needing to
//! special-case the address kind (the same choice this codebase makes for
//! Vmess's own address field; see `proto::vmess`).

use crate::addr::Addr;
use crate::error::CoreError;
use crate::request::Request;
use crate::stream::Stream;

const VER: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

pub async fn connect(stream: &mut dyn Stream, dest: &Addr) -> Result<(), CoreError> {
    stream.write_drain(&[VER, 0x01, 0x00]).await?;
    let negotiated = stream.read_exactly(2).await?;
    if negotiated != [VER, 0x00] {
        return Err(CoreError::protocol("socks5", "no-auth not accepted"));
    }

    let mut req = vec![VER, CMD_CONNECT, 0x00];
    req.extend(encode_as_domain(dest));
    stream.write_drain(&req).await?;

    let ver = stream.read_u8().await?;
    let rep = stream.read_u8().await?;
    let _rsv = stream.read_u8().await?;
    let _bnd = Addr::read_from(stream).await?;
    if ver != VER || rep != 0x00 {
        return Err(CoreError::protocol("socks5", "connect request rejected"));
    }
    Ok(())
}

pub async fn accept(mut stream: Box<dyn Stream>) -> Result<Request, CoreError> {
    let addr = crate::scoped_close!(
        stream,
        async {
            let ver = stream.read_u8().await?;
            if ver != VER {
                return Err(CoreError::protocol("socks5", "unsupported version"));
            }
            let nmethods = stream.read_u8().await? as usize;
            let methods = stream.read_exactly(nmethods).await?;
            if !methods.contains(&0x00) {
                return Err(CoreError::protocol("socks5", "no-auth not offered"));
            }
            stream.write_drain(&[VER, 0x00]).await?;

            let ver2 = stream.read_u8().await?;
            let cmd = stream.read_u8().await?;
            let _rsv = stream.read_u8().await?;
            let addr = Addr::read_from(stream.as_mut()).await?;
            if ver2 != VER || cmd != CMD_CONNECT {
                return Err(CoreError::protocol("socks5", "unsupported command"));
            }

            stream
                .write_drain(&[VER, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            Ok(addr)
        }
    )?;

    Ok(Request::new(stream, addr, Vec::new()))
}

fn encode_as_domain(dest: &Addr) -> Vec<u8> {
    let host = dest.host();
    let mut buf = Vec::with_capacity(4 + host.len());
    buf.push(ATYP_DOMAIN);
    buf.push(host.len() as u8);
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(&dest.port().to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ip_destination_as_domain_atyp() {
        let dest = Addr::Ip("127.0.0.1:443".parse().unwrap());
        let encoded = encode_as_domain(&dest);
        assert_eq!(encoded[0], ATYP_DOMAIN);
        assert_eq!(encoded[1] as usize, "127.0.0.1".len());
    }
}
