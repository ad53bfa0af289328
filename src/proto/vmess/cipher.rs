// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The masked-GCM payload framing used once a Vmess session is past its
//! header exchange: each frame is a SHAKE128-masked big-endian length
//! prefix followed by an AES-128-GCM-sealed chunk, one cryptor instance
//! per direction. Grounded on `p3/contrib/v2rayn/vmess.py`'s
//! `_VmessMaskedGCMCryptor`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake128;

use crate::error::CoreError;

pub const VMESS_BUFSIZE: usize = 16 * 1024;
pub const VMESS_PACK_BUFSIZE: usize = 8 * 1024;

pub struct MaskedGcmCryptor {
    reader: <Shake128 as ExtendableOutput>::Reader,
    aead: Aes128Gcm,
    iv_tail: [u8; 10],
    count: u16,
}

impl MaskedGcmCryptor {
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        let mut shake = Shake128::default();
        shake.update(iv);
        let mut iv_tail = [0u8; 10];
        iv_tail.copy_from_slice(&iv[2..12]);
        MaskedGcmCryptor {
            reader: shake.finalize_xof(),
            aead: Aes128Gcm::new_from_slice(key).expect("16-byte key"),
            iv_tail,
            count: 0,
        }
    }

    fn next_mask_and_nonce(&mut self) -> (u16, [u8; 12]) {
        let mut mask_bytes = [0u8; 2];
        self.reader.read(&mut mask_bytes);

        let mut nonce = [0u8; 12];
        nonce[..2].copy_from_slice(&self.count.to_be_bytes());
        nonce[2..].copy_from_slice(&self.iv_tail);
        self.count = self.count.wrapping_add(1);

        (u16::from_be_bytes(mask_bytes), nonce)
    }

    fn pack_encrypt(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CoreError> {
        let (mask, nonce) = self.next_mask_and_nonce();
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), chunk)
            .map_err(|_| CoreError::protocol("vmess", "aead seal failed"))?;

        let masked_len = (ciphertext.len() as u16) ^ mask;
        let mut out = Vec::with_capacity(2 + ciphertext.len());
        out.extend_from_slice(&masked_len.to_be_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Split `buf` into `VMESS_PACK_BUFSIZE`-sized chunks and encrypt each
    /// as its own frame.
    pub fn encrypt(&mut self, mut buf: &[u8]) -> Result<Vec<u8>, CoreError> {
        debug_assert!(!buf.is_empty());
        let mut out = Vec::new();
        while buf.len() > VMESS_PACK_BUFSIZE {
            out.extend(self.pack_encrypt(&buf[..VMESS_PACK_BUFSIZE])?);
            buf = &buf[VMESS_PACK_BUFSIZE..];
        }
        if !buf.is_empty() {
            out.extend(self.pack_encrypt(buf)?);
        }
        Ok(out)
    }

    /// Read and decrypt exactly one frame off `stream`.
    pub async fn read_decrypt(
        &mut self,
        stream: &mut dyn crate::stream::Stream,
    ) -> Result<Vec<u8>, CoreError> {
        let (mask, nonce) = self.next_mask_and_nonce();
        let masked_len = stream.read_u16().await?;
        let len = (masked_len ^ mask) as usize;
        if len > VMESS_BUFSIZE {
            return Err(CoreError::BufferOverflow);
        }
        let ciphertext = stream.read_exactly(len).await?;
        self.aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CoreError::protocol("vmess", "aead open failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_masked_length_and_aead() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut enc = MaskedGcmCryptor::new(&key, &iv);
        let mut dec = MaskedGcmCryptor::new(&key, &iv);

        let plaintext = b"vmess payload frame";
        let framed = enc.encrypt(plaintext).unwrap();

        let masked_len = u16::from_be_bytes([framed[0], framed[1]]);
        let (mask, nonce) = dec.next_mask_and_nonce();
        let len = (masked_len ^ mask) as usize;
        let ciphertext = &framed[2..];
        assert_eq!(len, ciphertext.len());

        let opened = dec
            .aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .unwrap();
        assert_eq!(opened, plaintext);
    }
}
