// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vmess client connector (module H): the one outbound scheme that owns
//! its own payload framing rather than handing a bare byte stream to the
//! splice engine, since both directions stay AEAD-framed for the life of
//! the session.
//!
//! Grounded on `p3/contrib/v2rayn/vmess.py`. Options are fixed to `S|M`
//! (standard format, metadata obfuscation) and `Sec` to AES-128-GCM, per
//! spec.md's resolved Open Question — see DESIGN.md. This crate is a
//! client only: there is no `accept` here, Vmess never appears as an
//! inbound scheme.

mod cipher;

use std::time::{SystemTime, UNIX_EPOCH};

use aes::Aes128;
use async_trait::async_trait;
use cfb_mode::cipher::generic_array::GenericArray;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::{Rng, RngCore};

use crate::addr::Addr;
use crate::error::CoreError;
use crate::stream::Stream;

use cipher::MaskedGcmCryptor;

const VMESS_MAGIC: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";
const ATYP_DOMAIN: u8 = 2;
const OPT_STANDARD: u8 = 0x01;
const OPT_METADATA_OBFUSCATION: u8 = 0x04;
const SEC_AES128GCM: u8 = 3;
const CMD_TCP: u8 = 1;

/// Parse a UUID string (with or without hyphens) into its 16 raw bytes.
pub fn parse_uuid(s: &str) -> Result<[u8; 16], CoreError> {
    let err = || CoreError::Config(format!("invalid vmess uuid: {s}"));
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        return Err(err());
    }
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).map_err(|_| err())?;
    }
    Ok(out)
}

fn fnv32a(buf: &[u8]) -> [u8; 4] {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in buf {
        hash = (hash ^ b as u32).wrapping_mul(0x0100_0193);
    }
    hash.to_be_bytes()
}

fn md5(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(data));
    out
}

fn hmac_md5(key: &[u8], msg: &[u8]) -> [u8; 16] {
    let mut mac = Hmac::<Md5>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn cfb_apply(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) {
    let cipher = cfb_mode::Encryptor::<Aes128>::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(iv),
    );
    cipher.encrypt(buf);
}

fn cfb_apply_decrypt(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) {
    // CFB keystream is symmetric between encrypt/decrypt; only the feedback
    // register's source differs, which the `cfb-mode` crate's two types
    // handle for us.
    let cipher = cfb_mode::Decryptor::<Aes128>::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(iv),
    );
    cipher.decrypt(buf);
}

/// The per-connection instruction block (iv/key/v/padding) the client
/// generates fresh for every `connect`.
struct Instruction {
    iv: [u8; 16],
    key: [u8; 16],
    v: u8,
    padding_len: u8,
}

impl Instruction {
    fn fresh() -> Self {
        let mut rng = rand::thread_rng();
        let mut iv = [0u8; 16];
        let mut key = [0u8; 16];
        rng.fill_bytes(&mut iv);
        rng.fill_bytes(&mut key);
        Instruction {
            iv,
            key,
            v: rng.gen(),
            padding_len: rng.gen::<u8>() & 0x0f,
        }
    }

    fn response_key(&self) -> [u8; 16] {
        md5(&self.key)
    }

    fn response_iv(&self) -> [u8; 16] {
        md5(&self.iv)
    }

    /// Version + iv + key + v + opt + (p<<4|sec) + reserved + cmd + addr +
    /// padding + FNV-1a-32 checksum.
    fn encode(&self, dest: &Addr) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(1u8);
        buf.extend_from_slice(&self.iv);
        buf.extend_from_slice(&self.key);
        buf.push(self.v);
        buf.push(OPT_STANDARD | OPT_METADATA_OBFUSCATION);
        buf.push((self.padding_len << 4) | SEC_AES128GCM);
        buf.push(0); // reserved
        buf.push(CMD_TCP);
        buf.extend(encode_addr(dest));

        let mut padding = vec![0u8; self.padding_len as usize];
        rand::thread_rng().fill_bytes(&mut padding);
        buf.extend_from_slice(&padding);

        let checksum = fnv32a(&buf);
        buf.extend_from_slice(&checksum);
        buf
    }
}

/// Vmess's own address field always signals "domain name" (ATYP 2), even
/// for a numeric destination — mirroring this codebase's SOCKS5 connector
/// (`proto::socks5::encode_as_domain`), which makes the same choice.
fn encode_addr(dest: &Addr) -> Vec<u8> {
    let host = dest.host();
    let mut buf = Vec::with_capacity(4 + host.len());
    buf.extend_from_slice(&dest.port().to_be_bytes());
    buf.push(ATYP_DOMAIN);
    buf.push(host.len() as u8);
    buf.extend_from_slice(host.as_bytes());
    buf
}

fn build_header(uuid: &[u8; 16], instruction: &Instruction, dest: &Addr) -> Vec<u8> {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let ts_bytes = ts.to_be_bytes();

    let certification = hmac_md5(uuid, &ts_bytes);

    let mut key_material = uuid.to_vec();
    key_material.extend_from_slice(VMESS_MAGIC);
    let instruction_key = md5(&key_material);

    let mut iv_material = Vec::with_capacity(32);
    for _ in 0..4 {
        iv_material.extend_from_slice(&ts_bytes);
    }
    let instruction_iv = md5(&iv_material);

    let mut plain = instruction.encode(dest);
    cfb_apply(&instruction_key, &instruction_iv, &mut plain);

    let mut out = Vec::with_capacity(16 + plain.len());
    out.extend_from_slice(&certification);
    out.extend_from_slice(&plain);
    out
}

/// The connected Vmess session: every read/write goes through the
/// masked-GCM framing in `cipher`.
pub struct VmessStream {
    inner: Box<dyn Stream>,
    write_cryptor: MaskedGcmCryptor,
    read_cryptor: MaskedGcmCryptor,
    buf: Vec<u8>,
    wbuf: Vec<u8>,
}

#[async_trait]
impl Stream for VmessStream {
    fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    async fn read_raw(&mut self) -> std::io::Result<Vec<u8>> {
        let peeked = self.inner.peek().await?;
        if peeked.is_empty() {
            return Ok(Vec::new());
        }
        self.read_cryptor
            .read_decrypt(self.inner.as_mut())
            .await
            .map_err(Into::into)
    }

    fn write_raw(&mut self, buf: &[u8]) {
        self.wbuf.extend_from_slice(buf);
    }

    async fn drain(&mut self) -> std::io::Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let plaintext = std::mem::take(&mut self.wbuf);
        let framed = self
            .write_cryptor
            .encrypt(&plaintext)
            .map_err(std::io::Error::from)?;
        self.inner.write_drain(&framed).await
    }

    fn close(&mut self) {
        self.inner.close();
    }

    async fn wait_closed(&mut self) -> std::io::Result<()> {
        self.inner.wait_closed().await
    }

    fn inner(&mut self) -> Option<&mut (dyn Stream + '_)> {
        Some(self.inner.as_mut())
    }
}

/// Connect to an already-open transport (bare TCP, TLS, or WS, per the
/// outbox's `transport`), send the Vmess header plus the caller's residual
/// bytes as the first encrypted frame, and validate the response header.
/// `rest` must be non-empty (callers should `Request::ensure_rest` first).
pub async fn connect(
    mut stream: Box<dyn Stream>,
    uuid: &[u8; 16],
    dest: &Addr,
    rest: &[u8],
) -> Result<Box<dyn Stream>, CoreError> {
    if rest.is_empty() {
        stream.ensure_closed().await;
        return Err(CoreError::protocol("vmess", "rest"));
    }

    let instruction = Instruction::fresh();
    let mut req = build_header(uuid, &instruction, dest);

    let mut write_cryptor = MaskedGcmCryptor::new(&instruction.key, &instruction.iv);
    req.extend(write_cryptor.encrypt(rest)?);

    let response_key = instruction.response_key();
    let response_iv = instruction.response_iv();

    crate::scoped_close!(
        stream,
        async {
            stream.write_drain(&req).await?;

            let peeked = stream.peek().await?;
            if peeked.is_empty() {
                return Err(CoreError::protocol("vmess", "empty response"));
            }

            let mut header = stream.read_exactly(4).await?;
            cfb_apply_decrypt(&response_key, &response_iv, &mut header);
            let (v, opt, cmd, m) = (header[0], header[1], header[2], header[3] as usize);

            if v != instruction.v {
                return Err(CoreError::protocol("vmess", "response auth mismatch"));
            }
            if opt != 0 || cmd != 0 {
                return Err(CoreError::protocol("vmess", "unexpected server option or command"));
            }
            if m != 0 {
                let mut content = stream.read_exactly(m).await?;
                cfb_apply_decrypt(&response_key, &response_iv, &mut content);
                return Err(CoreError::protocol("vmess", "unexpected response content"));
            }
            Ok(())
        }
    )?;

    let read_cryptor = MaskedGcmCryptor::new(&response_key, &response_iv);
    Ok(Box::new(VmessStream {
        inner: stream,
        write_cryptor,
        read_cryptor,
        buf: Vec::new(),
        wbuf: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hyphenated_and_bare_uuid() {
        let hyphenated = parse_uuid("b831381d-6324-4d53-ad4f-8cda48b30811").unwrap();
        let bare = parse_uuid("b831381d63244d53ad4f8cda48b30811").unwrap();
        assert_eq!(hyphenated, bare);
    }

    #[test]
    fn rejects_malformed_uuid() {
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn address_field_always_domain_atyp() {
        let dest = Addr::Ip("10.0.0.1:80".parse().unwrap());
        let encoded = encode_addr(&dest);
        assert_eq!(encoded[2], ATYP_DOMAIN);
    }

    #[test]
    fn fnv32a_matches_reference_vector() {
        // FNV-1a-32 of the empty input is the offset basis.
        assert_eq!(fnv32a(b""), 0x811c_9dc5u32.to_be_bytes());
    }
}
