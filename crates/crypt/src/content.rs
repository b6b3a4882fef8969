//! Streaming content codecs.
//!
//! One codec per crypto scheme. Callers may push arbitrary chunk sizes; the
//! block-mode codec buffers trailing bytes internally and pads only on
//! `finish`. The IV/nonce is always folded into the authenticator, so a tag
//! covers the full envelope.
//!
//! Scheme 3 (AES-256-GCM) and scheme 4 (ChaCha20-Poly1305) are assembled
//! from their stream-cipher and universal-hash primitives because the
//! one-shot AEAD types cannot be driven incrementally over multi-gigabyte
//! streams.

use aes::cipher::{
    BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit, StreamCipher,
};
use aes::{Aes256, Block};
use chacha20::ChaCha20;
use ghash::GHash;
use hmac::{Hmac, Mac};
use poly1305::Poly1305;
use sha2::Sha512;
use subtle::ConstantTimeEq;
use universal_hash::{Block as UhBlock, UniversalHash};

use crate::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;
type HmacSha512 = Hmac<Sha512>;

const AES_BLOCK: usize = 16;

/// Encrypting half of the streaming contract.
pub trait StreamEncryptor: Send {
    /// IV/nonce chosen at construction; transmitted in front of the
    /// ciphertext.
    fn iv(&self) -> &[u8];
    /// Fold additional authenticated data into the tag.
    fn update(&mut self, aad: &[u8]);
    /// Encrypt a chunk; may return fewer bytes than pushed (block modes
    /// buffer trailing bytes).
    fn encrypt(&mut self, chunk: &[u8]) -> Vec<u8>;
    /// Flush and pad; returns the ciphertext tail.
    fn finish(&mut self) -> Vec<u8>;
    /// Deterministic authentication tag over everything seen so far.
    fn digest(&mut self) -> Vec<u8>;
}

/// Decrypting half; the inverse of [`StreamEncryptor`].
pub trait StreamDecryptor: Send {
    fn update(&mut self, aad: &[u8]);
    fn decrypt(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError>;
    /// Flush the held-back tail and strip padding.
    fn finish(&mut self) -> Result<Vec<u8>, CryptoError>;
    /// Check the transmitted tag; `TagMismatch` on failure.
    fn verify(&mut self, tag: &[u8]) -> Result<(), CryptoError>;
}

// ---------------------------------------------------------------- scheme 0

/// Passthrough codec for unencrypted clients.
pub struct NullCodec;

impl StreamEncryptor for NullCodec {
    fn iv(&self) -> &[u8] {
        &[]
    }
    fn update(&mut self, _aad: &[u8]) {}
    fn encrypt(&mut self, chunk: &[u8]) -> Vec<u8> {
        chunk.to_vec()
    }
    fn finish(&mut self) -> Vec<u8> {
        Vec::new()
    }
    fn digest(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

impl StreamDecryptor for NullCodec {
    fn update(&mut self, _aad: &[u8]) {}
    fn decrypt(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(chunk.to_vec())
    }
    fn finish(&mut self) -> Result<Vec<u8>, CryptoError> {
        Ok(Vec::new())
    }
    fn verify(&mut self, _tag: &[u8]) -> Result<(), CryptoError> {
        Ok(())
    }
}

// ------------------------------------------------------------ schemes 1, 2

/// AES-256-CBC with an HMAC-SHA-512 tag over IV‖ciphertext.
pub struct CbcHmacEncryptor {
    iv: [u8; AES_BLOCK],
    cbc: Aes256CbcEnc,
    mac: HmacSha512,
    pending: Vec<u8>,
    done: bool,
}

impl CbcHmacEncryptor {
    pub fn new(content_key: &[u8; 32], iv: [u8; AES_BLOCK]) -> Self {
        let cbc = Aes256CbcEnc::new(content_key.into(), &iv.into());
        let mut mac =
            <HmacSha512 as KeyInit>::new_from_slice(content_key).expect("hmac accepts any key length");
        mac.update(&iv);
        Self { iv, cbc, mac, pending: Vec::new(), done: false }
    }

    fn drain_blocks(&mut self) -> Vec<u8> {
        let full = self.pending.len() / AES_BLOCK * AES_BLOCK;
        let mut out = self.pending.drain(..full).collect::<Vec<u8>>();
        for chunk in out.chunks_exact_mut(AES_BLOCK) {
            let block = Block::from_mut_slice(chunk);
            self.cbc.encrypt_block_mut(block);
        }
        self.mac.update(&out);
        out
    }
}

impl StreamEncryptor for CbcHmacEncryptor {
    fn iv(&self) -> &[u8] {
        &self.iv
    }

    fn update(&mut self, aad: &[u8]) {
        self.mac.update(aad);
    }

    fn encrypt(&mut self, chunk: &[u8]) -> Vec<u8> {
        debug_assert!(!self.done, "encrypt after finish");
        self.pending.extend_from_slice(chunk);
        self.drain_blocks()
    }

    fn finish(&mut self) -> Vec<u8> {
        debug_assert!(!self.done, "finish twice");
        self.done = true;
        let pad = AES_BLOCK - (self.pending.len() % AES_BLOCK);
        self.pending.extend(std::iter::repeat(pad as u8).take(pad));
        self.drain_blocks()
    }

    fn digest(&mut self) -> Vec<u8> {
        self.mac.clone().finalize().into_bytes().to_vec()
    }
}

/// Inverse of [`CbcHmacEncryptor`]; holds the final block back until
/// `finish` so the padding can be stripped.
pub struct CbcHmacDecryptor {
    cbc: Aes256CbcDec,
    mac: HmacSha512,
    pending: Vec<u8>,
}

impl CbcHmacDecryptor {
    pub fn new(content_key: &[u8; 32], iv: &[u8]) -> Result<Self, CryptoError> {
        if iv.len() != AES_BLOCK {
            return Err(CryptoError::BadKey("CBC IV must be 16 bytes".into()));
        }
        let iv_arr = Block::clone_from_slice(iv);
        let cbc = Aes256CbcDec::new(content_key.into(), &iv_arr);
        let mut mac =
            <HmacSha512 as KeyInit>::new_from_slice(content_key).expect("hmac accepts any key length");
        mac.update(iv);
        Ok(Self { cbc, mac, pending: Vec::new() })
    }
}

impl StreamDecryptor for CbcHmacDecryptor {
    fn update(&mut self, aad: &[u8]) {
        self.mac.update(aad);
    }

    fn decrypt(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.mac.update(chunk);
        self.pending.extend_from_slice(chunk);
        // Keep one block in reserve: the last block carries the padding and
        // may only be emitted by finish().
        let full = (self.pending.len().saturating_sub(AES_BLOCK)) / AES_BLOCK * AES_BLOCK;
        let mut out = self.pending.drain(..full).collect::<Vec<u8>>();
        for chunk in out.chunks_exact_mut(AES_BLOCK) {
            let block = Block::from_mut_slice(chunk);
            self.cbc.decrypt_block_mut(block);
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<u8>, CryptoError> {
        if self.pending.len() != AES_BLOCK {
            return Err(CryptoError::BadPadding);
        }
        let mut tail = std::mem::take(&mut self.pending);
        let block = Block::from_mut_slice(&mut tail);
        self.cbc.decrypt_block_mut(block);
        let pad = *tail.last().expect("block is non-empty") as usize;
        if pad == 0 || pad > AES_BLOCK || !tail[AES_BLOCK - pad..].iter().all(|&b| b as usize == pad)
        {
            return Err(CryptoError::BadPadding);
        }
        tail.truncate(AES_BLOCK - pad);
        Ok(tail)
    }

    fn verify(&mut self, tag: &[u8]) -> Result<(), CryptoError> {
        self.mac
            .clone()
            .verify_slice(tag)
            .map_err(|_| CryptoError::TagMismatch)
    }
}

// ----------------------------------------------------- mac block buffering

/// Feeds a universal hash in exact blocks, buffering stragglers, with the
/// segment zero-padded on `pad_flush`.
#[derive(Clone)]
struct PadAccum<U: UniversalHash + Clone> {
    mac: U,
    partial: UhBlock<U>,
    used: usize,
}

impl<U: UniversalHash + Clone> PadAccum<U> {
    fn new(mac: U) -> Self {
        Self { mac, partial: Default::default(), used: 0 }
    }

    fn feed(&mut self, mut data: &[u8]) {
        let bs = self.partial.len();
        if self.used > 0 {
            let take = (bs - self.used).min(data.len());
            self.partial[self.used..self.used + take].copy_from_slice(&data[..take]);
            self.used += take;
            data = &data[take..];
            if self.used == bs {
                let block = self.partial.clone();
                self.mac.update(&[block]);
                self.used = 0;
            }
        }
        while data.len() >= bs {
            let block = UhBlock::<U>::clone_from_slice(&data[..bs]);
            self.mac.update(&[block]);
            data = &data[bs..];
        }
        if !data.is_empty() {
            self.partial[..data.len()].copy_from_slice(data);
            self.used = data.len();
        }
    }

    fn pad_flush(&mut self) {
        if self.used > 0 {
            for b in self.partial[self.used..].iter_mut() {
                *b = 0;
            }
            let block = self.partial.clone();
            self.mac.update(&[block]);
            self.used = 0;
        }
    }

    fn finalize(self) -> UhBlock<U> {
        self.mac.finalize()
    }
}

// ---------------------------------------------------------------- scheme 3

/// Shared GCM state for the encrypting and decrypting directions.
struct GcmCore {
    ctr: Aes256Ctr32,
    acc: PadAccum<GHash>,
    tag_mask: [u8; 16],
    aad_len: u64,
    ct_len: u64,
    aad_open: bool,
}

impl GcmCore {
    fn new(key: &[u8; 32], nonce: &[u8; 12]) -> Self {
        let aes = Aes256::new(key.into());
        let mut h = Block::default();
        aes.encrypt_block(&mut h);
        let ghash = GHash::new(&h);

        let mut j0 = [0u8; 16];
        j0[..12].copy_from_slice(nonce);
        j0[15] = 1;
        let mut mask_block = Block::clone_from_slice(&j0);
        aes.encrypt_block(&mut mask_block);
        let mut tag_mask = [0u8; 16];
        tag_mask.copy_from_slice(&mask_block);

        let mut ctr_iv = j0;
        ctr_iv[15] = 2;
        let ctr = Aes256Ctr32::new(key.into(), &ctr_iv.into());

        let mut core = Self {
            ctr,
            acc: PadAccum::new(ghash),
            tag_mask,
            aad_len: 0,
            ct_len: 0,
            aad_open: true,
        };
        // Envelope convention: the nonce itself is authenticated data.
        core.aad(nonce);
        core
    }

    fn aad(&mut self, data: &[u8]) {
        debug_assert!(self.aad_open, "AAD after ciphertext started");
        if self.aad_open {
            self.acc.feed(data);
            self.aad_len += data.len() as u64;
        }
    }

    fn close_aad(&mut self) {
        if self.aad_open {
            self.acc.pad_flush();
            self.aad_open = false;
        }
    }

    fn absorb_ct(&mut self, ct: &[u8]) {
        self.close_aad();
        self.acc.feed(ct);
        self.ct_len += ct.len() as u64;
    }

    fn tag(&self) -> [u8; 16] {
        let mut acc = self.acc.clone();
        acc.pad_flush();
        let mut len_block = [0u8; 16];
        len_block[..8].copy_from_slice(&(self.aad_len * 8).to_be_bytes());
        len_block[8..].copy_from_slice(&(self.ct_len * 8).to_be_bytes());
        acc.feed(&len_block);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&acc.finalize());
        for (t, m) in tag.iter_mut().zip(self.tag_mask.iter()) {
            *t ^= m;
        }
        tag
    }
}

/// AES-256-GCM, incremental.
pub struct GcmEncryptor {
    nonce: [u8; 12],
    core: GcmCore,
}

impl GcmEncryptor {
    pub fn new(content_key: &[u8; 32], nonce: [u8; 12]) -> Self {
        Self { nonce, core: GcmCore::new(content_key, &nonce) }
    }
}

impl StreamEncryptor for GcmEncryptor {
    fn iv(&self) -> &[u8] {
        &self.nonce
    }
    fn update(&mut self, aad: &[u8]) {
        self.core.aad(aad);
    }
    fn encrypt(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = chunk.to_vec();
        self.core.close_aad();
        self.core.ctr.apply_keystream(&mut out);
        self.core.absorb_ct(&out);
        out
    }
    fn finish(&mut self) -> Vec<u8> {
        Vec::new()
    }
    fn digest(&mut self) -> Vec<u8> {
        self.core.tag().to_vec()
    }
}

/// Inverse of [`GcmEncryptor`].
pub struct GcmDecryptor {
    core: GcmCore,
}

impl GcmDecryptor {
    pub fn new(content_key: &[u8; 32], nonce: &[u8]) -> Result<Self, CryptoError> {
        let nonce: [u8; 12] = nonce
            .try_into()
            .map_err(|_| CryptoError::BadKey("GCM nonce must be 12 bytes".into()))?;
        Ok(Self { core: GcmCore::new(content_key, &nonce) })
    }
}

impl StreamDecryptor for GcmDecryptor {
    fn update(&mut self, aad: &[u8]) {
        self.core.aad(aad);
    }
    fn decrypt(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.core.absorb_ct(chunk);
        let mut out = chunk.to_vec();
        self.core.ctr.apply_keystream(&mut out);
        Ok(out)
    }
    fn finish(&mut self) -> Result<Vec<u8>, CryptoError> {
        Ok(Vec::new())
    }
    fn verify(&mut self, tag: &[u8]) -> Result<(), CryptoError> {
        let computed = self.core.tag();
        if tag.len() == computed.len() && bool::from(computed[..].ct_eq(tag)) {
            Ok(())
        } else {
            Err(CryptoError::TagMismatch)
        }
    }
}

// ---------------------------------------------------------------- scheme 4

/// Shared RFC 8439 state for both directions.
struct ChaChaCore {
    cipher: ChaCha20,
    acc: PadAccum<Poly1305>,
    aad_len: u64,
    ct_len: u64,
    aad_open: bool,
}

impl ChaChaCore {
    fn new(key: &[u8; 32], nonce: &[u8; 12]) -> Self {
        let mut cipher = ChaCha20::new(key.into(), nonce.into());
        // Block 0 of the keystream becomes the one-time Poly1305 key;
        // payload encryption starts at block 1.
        let mut poly_key = [0u8; 64];
        cipher.apply_keystream(&mut poly_key);
        let mac = Poly1305::new(poly1305::Key::from_slice(&poly_key[..32]));
        let mut core = Self {
            cipher,
            acc: PadAccum::new(mac),
            aad_len: 0,
            ct_len: 0,
            aad_open: true,
        };
        core.aad(nonce);
        core
    }

    fn aad(&mut self, data: &[u8]) {
        debug_assert!(self.aad_open, "AAD after ciphertext started");
        if self.aad_open {
            self.acc.feed(data);
            self.aad_len += data.len() as u64;
        }
    }

    fn close_aad(&mut self) {
        if self.aad_open {
            self.acc.pad_flush();
            self.aad_open = false;
        }
    }

    fn absorb_ct(&mut self, ct: &[u8]) {
        self.close_aad();
        self.acc.feed(ct);
        self.ct_len += ct.len() as u64;
    }

    fn tag(&self) -> [u8; 16] {
        let mut acc = self.acc.clone();
        acc.pad_flush();
        let mut len_block = [0u8; 16];
        len_block[..8].copy_from_slice(&self.aad_len.to_le_bytes());
        len_block[8..].copy_from_slice(&self.ct_len.to_le_bytes());
        acc.feed(&len_block);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&acc.finalize());
        tag
    }
}

/// ChaCha20-Poly1305, incremental.
pub struct ChaChaEncryptor {
    nonce: [u8; 12],
    core: ChaChaCore,
}

impl ChaChaEncryptor {
    pub fn new(content_key: &[u8; 32], nonce: [u8; 12]) -> Self {
        Self { nonce, core: ChaChaCore::new(content_key, &nonce) }
    }
}

impl StreamEncryptor for ChaChaEncryptor {
    fn iv(&self) -> &[u8] {
        &self.nonce
    }
    fn update(&mut self, aad: &[u8]) {
        self.core.aad(aad);
    }
    fn encrypt(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = chunk.to_vec();
        self.core.close_aad();
        self.core.cipher.apply_keystream(&mut out);
        self.core.absorb_ct(&out);
        out
    }
    fn finish(&mut self) -> Vec<u8> {
        Vec::new()
    }
    fn digest(&mut self) -> Vec<u8> {
        self.core.tag().to_vec()
    }
}

/// Inverse of [`ChaChaEncryptor`].
pub struct ChaChaDecryptor {
    core: ChaChaCore,
}

impl ChaChaDecryptor {
    pub fn new(content_key: &[u8; 32], nonce: &[u8]) -> Result<Self, CryptoError> {
        let nonce: [u8; 12] = nonce
            .try_into()
            .map_err(|_| CryptoError::BadKey("ChaCha nonce must be 12 bytes".into()))?;
        Ok(Self { core: ChaChaCore::new(content_key, &nonce) })
    }
}

impl StreamDecryptor for ChaChaDecryptor {
    fn update(&mut self, aad: &[u8]) {
        self.core.aad(aad);
    }
    fn decrypt(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.core.absorb_ct(chunk);
        let mut out = chunk.to_vec();
        self.core.cipher.apply_keystream(&mut out);
        Ok(out)
    }
    fn finish(&mut self) -> Result<Vec<u8>, CryptoError> {
        Ok(Vec::new())
    }
    fn verify(&mut self, tag: &[u8]) -> Result<(), CryptoError> {
        let computed = self.core.tag();
        if tag.len() == computed.len() && bool::from(computed[..].ct_eq(tag)) {
            Ok(())
        } else {
            Err(CryptoError::TagMismatch)
        }
    }
}

// ------------------------------------------------------------ read adapter

/// Read adapter over an `IV ‖ ciphertext ‖ tag` stream: decrypts as it
/// reads, withholds the trailing tag, and verifies it at EOF. A tag
/// mismatch surfaces as an I/O error so the failure cannot be ignored
/// mid-pipeline.
pub struct DecryptReader<R: std::io::Read> {
    inner: R,
    dec: Box<dyn StreamDecryptor>,
    tag_len: usize,
    pending: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    done: bool,
}

impl<R: std::io::Read> DecryptReader<R> {
    /// Wrap a stream whose IV has already been consumed by the caller.
    pub fn new(inner: R, dec: Box<dyn StreamDecryptor>, tag_len: usize) -> Self {
        Self { inner, dec, tag_len, pending: Vec::new(), out: Vec::new(), out_pos: 0, done: false }
    }

    fn refill(&mut self) -> std::io::Result<()> {
        self.out.clear();
        self.out_pos = 0;
        let mut buf = [0u8; 64 * 1024];
        while self.out.is_empty() && !self.done {
            let n = self.inner.read(&mut buf)?;
            if n == 0 {
                self.done = true;
                if self.pending.len() < self.tag_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream shorter than its authentication tag",
                    ));
                }
                let tag = self.pending.split_off(self.pending.len() - self.tag_len);
                let body = std::mem::take(&mut self.pending);
                if !body.is_empty() {
                    let pt = self.dec.decrypt(&body).map_err(crypto_io)?;
                    self.out.extend(pt);
                }
                self.out.extend(self.dec.finish().map_err(crypto_io)?);
                self.dec.verify(&tag).map_err(crypto_io)?;
                break;
            }
            self.pending.extend_from_slice(&buf[..n]);
            if self.pending.len() > self.tag_len {
                let body_len = self.pending.len() - self.tag_len;
                let body: Vec<u8> = self.pending.drain(..body_len).collect();
                let pt = self.dec.decrypt(&body).map_err(crypto_io)?;
                self.out.extend(pt);
            }
        }
        Ok(())
    }
}

fn crypto_io(e: CryptoError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
}

impl<R: std::io::Read> std::io::Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.out_pos >= self.out.len() {
            if self.done {
                return Ok(0);
            }
            self.refill()?;
            if self.out.is_empty() {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.out.len() - self.out_pos);
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    fn round_trip_cbc(data: &[u8], chunk: usize) {
        let iv = [7u8; 16];
        let mut enc = CbcHmacEncryptor::new(&KEY, iv);
        let mut ct = Vec::new();
        for c in data.chunks(chunk.max(1)) {
            ct.extend(enc.encrypt(c));
        }
        ct.extend(enc.finish());
        assert_eq!(ct.len() % 16, 0);
        let tag = enc.digest();
        assert_eq!(tag.len(), 64);

        let mut dec = CbcHmacDecryptor::new(&KEY, &iv).unwrap();
        let mut pt = Vec::new();
        for c in ct.chunks(chunk.max(1)) {
            pt.extend(dec.decrypt(c).unwrap());
        }
        pt.extend(dec.finish().unwrap());
        assert_eq!(pt, data);
        dec.verify(&tag).unwrap();
    }

    #[test]
    fn cbc_hmac_round_trip_sizes() {
        for size in [0usize, 1, 15, 16, 17, 4096, 70_000] {
            let data: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            round_trip_cbc(&data, 1000);
            round_trip_cbc(&data, 16);
        }
    }

    #[test]
    fn cbc_detects_tampered_tag() {
        let iv = [9u8; 16];
        let mut enc = CbcHmacEncryptor::new(&KEY, iv);
        let mut ct = enc.encrypt(b"some bytes worth protecting");
        ct.extend(enc.finish());
        let mut tag = enc.digest();
        tag[3] ^= 0xFF;
        let mut dec = CbcHmacDecryptor::new(&KEY, &iv).unwrap();
        let _ = dec.decrypt(&ct).unwrap();
        let _ = dec.finish().unwrap();
        assert!(matches!(dec.verify(&tag), Err(CryptoError::TagMismatch)));
    }

    #[test]
    fn gcm_matches_reference_aead() {
        // Cross-check the incremental construction against the one-shot
        // RustCrypto AEAD (AAD = nonce, matching the envelope convention).
        use aes_gcm::aead::{Aead, Payload};
        use aes_gcm::{Aes256Gcm, KeyInit as GcmKeyInit, Nonce};

        let nonce = [3u8; 12];
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 255) as u8).collect();

        let mut enc = GcmEncryptor::new(&KEY, nonce);
        let mut ct = Vec::new();
        for c in data.chunks(997) {
            ct.extend(enc.encrypt(c));
        }
        ct.extend(enc.finish());
        let tag = enc.digest();

        let reference = Aes256Gcm::new((&KEY).into())
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &data, aad: &nonce })
            .unwrap();
        assert_eq!(&reference[..data.len()], &ct[..]);
        assert_eq!(&reference[data.len()..], &tag[..]);

        let mut dec = GcmDecryptor::new(&KEY, &nonce).unwrap();
        let mut pt = Vec::new();
        for c in ct.chunks(311) {
            pt.extend(dec.decrypt(c).unwrap());
        }
        pt.extend(dec.finish().unwrap());
        assert_eq!(pt, data);
        dec.verify(&tag).unwrap();
    }

    #[test]
    fn chacha_matches_reference_aead() {
        use chacha20poly1305::aead::{Aead, Payload};
        use chacha20poly1305::{ChaCha20Poly1305, KeyInit as ChaKeyInit, Nonce};

        let nonce = [13u8; 12];
        let data = b"layered deltas over a full blob".to_vec();

        let mut enc = ChaChaEncryptor::new(&KEY, nonce);
        let mut ct = enc.encrypt(&data);
        ct.extend(enc.finish());
        let tag = enc.digest();

        let reference = ChaCha20Poly1305::new((&KEY).into())
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &data, aad: &nonce })
            .unwrap();
        assert_eq!(&reference[..data.len()], &ct[..]);
        assert_eq!(&reference[data.len()..], &tag[..]);
    }

    #[test]
    fn gcm_rejects_flipped_bit() {
        let nonce = [5u8; 12];
        let mut enc = GcmEncryptor::new(&KEY, nonce);
        let mut ct = enc.encrypt(b"delta chains all the way down");
        ct.extend(enc.finish());
        let tag = enc.digest();

        ct[4] ^= 0x01;
        let mut dec = GcmDecryptor::new(&KEY, &nonce).unwrap();
        let _ = dec.decrypt(&ct).unwrap();
        assert!(matches!(dec.verify(&tag), Err(CryptoError::TagMismatch)));
    }

    #[test]
    fn chacha_round_trip_and_tamper() {
        let nonce = [11u8; 12];
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();

        let mut enc = ChaChaEncryptor::new(&KEY, nonce);
        let mut ct = Vec::new();
        for c in data.chunks(1024) {
            ct.extend(enc.encrypt(c));
        }
        ct.extend(enc.finish());
        let tag = enc.digest();
        assert_eq!(ct.len(), data.len());

        let mut dec = ChaChaDecryptor::new(&KEY, &nonce).unwrap();
        let mut pt = Vec::new();
        for c in ct.chunks(333) {
            pt.extend(dec.decrypt(c).unwrap());
        }
        pt.extend(dec.finish().unwrap());
        assert_eq!(pt, data);
        dec.verify(&tag).unwrap();

        let mut bad = ChaChaDecryptor::new(&KEY, &nonce).unwrap();
        let mut mangled = ct.clone();
        mangled[0] ^= 0x80;
        let _ = bad.decrypt(&mangled).unwrap();
        assert!(matches!(bad.verify(&tag), Err(CryptoError::TagMismatch)));
    }

    #[test]
    fn gcm_empty_payload_still_tags() {
        let nonce = [1u8; 12];
        let mut enc = GcmEncryptor::new(&KEY, nonce);
        let ct = enc.finish();
        assert!(ct.is_empty());
        let tag = enc.digest();
        let mut dec = GcmDecryptor::new(&KEY, &nonce).unwrap();
        let _ = dec.finish().unwrap();
        dec.verify(&tag).unwrap();
    }
}
