//! Deterministic filename and path encryption.
//!
//! Filenames encrypt to base64 (with `#@` standing in for `+/` so ciphertexts
//! stay shell- and path-safe). Determinism is required: directory lookups and
//! dedup compare ciphertexts without decrypting. Scheme 1 uses AES-256-ECB
//! over zero-padded names; schemes 2+ use AES-SIV without a nonce, which is
//! deterministic and authenticated.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use aes_siv::siv::{Aes128Siv, Aes256Siv};
use base64::engine::general_purpose::{GeneralPurpose, PAD};
use base64::{alphabet::Alphabet, Engine};

use crate::CryptoError;

const AES_BLOCK: usize = 16;

fn b64() -> GeneralPurpose {
    let alphabet = Alphabet::new(
        "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789#@",
    )
    .expect("fixed alphabet is valid");
    GeneralPurpose::new(&alphabet, PAD)
}

/// Scheme 1: ECB over the zero-padded name.
pub fn encrypt_name_ecb(key: &[u8; 32], name: &str) -> String {
    let aes = Aes256::new(key.into());
    let mut buf = name.as_bytes().to_vec();
    let rem = buf.len() % AES_BLOCK;
    if rem != 0 {
        buf.resize(buf.len() + AES_BLOCK - rem, 0);
    }
    if buf.is_empty() {
        buf.resize(AES_BLOCK, 0);
    }
    for chunk in buf.chunks_exact_mut(AES_BLOCK) {
        aes.encrypt_block(Block::from_mut_slice(chunk));
    }
    b64().encode(&buf)
}

/// Scheme 1 inverse; trailing zero padding is stripped.
pub fn decrypt_name_ecb(key: &[u8; 32], cipher: &str) -> Result<String, CryptoError> {
    let aes = Aes256::new(key.into());
    let mut buf = b64()
        .decode(cipher)
        .map_err(|e| CryptoError::Name(format!("bad base64: {e}")))?;
    if buf.is_empty() || buf.len() % AES_BLOCK != 0 {
        return Err(CryptoError::Name("ciphertext not block aligned".into()));
    }
    for chunk in buf.chunks_exact_mut(AES_BLOCK) {
        aes.decrypt_block(Block::from_mut_slice(chunk));
    }
    while buf.last() == Some(&0) {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| CryptoError::Name("decrypted name not utf-8".into()))
}

/// Schemes 2+: deterministic AES-SIV. The key is 32 bytes (SIV-128, kept for
/// clients upgraded from scheme 1 key material) or 64 bytes (SIV-256).
pub fn encrypt_name_siv(key: &[u8], name: &str) -> Result<String, CryptoError> {
    let ct = siv_encrypt(key, &[], name.as_bytes())?;
    Ok(b64().encode(ct))
}

/// SIV inverse; authentication failure surfaces as a name error.
pub fn decrypt_name_siv(key: &[u8], cipher: &str) -> Result<String, CryptoError> {
    let raw = b64()
        .decode(cipher)
        .map_err(|e| CryptoError::Name(format!("bad base64: {e}")))?;
    let pt = siv_decrypt(key, &[], &raw)?;
    String::from_utf8(pt).map_err(|_| CryptoError::Name("decrypted name not utf-8".into()))
}

/// Raw SIV encryption with optional associated-data labels (also used for
/// key wrapping).
pub fn siv_encrypt(key: &[u8], headers: &[&[u8]], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match key.len() {
        32 => {
            let mut siv = Aes128Siv::new_from_slice(key)
                .map_err(|_| CryptoError::BadKey("bad siv key".into()))?;
            siv.encrypt(headers, plaintext)
                .map_err(|_| CryptoError::Name("siv encrypt failed".into()))
        }
        64 => {
            let mut siv = Aes256Siv::new_from_slice(key)
                .map_err(|_| CryptoError::BadKey("bad siv key".into()))?;
            siv.encrypt(headers, plaintext)
                .map_err(|_| CryptoError::Name("siv encrypt failed".into()))
        }
        n => Err(CryptoError::BadKey(format!("siv key must be 32 or 64 bytes, got {n}"))),
    }
}

/// Raw SIV decryption; tag mismatch means the key or label is wrong.
pub fn siv_decrypt(key: &[u8], headers: &[&[u8]], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match key.len() {
        32 => {
            let mut siv = Aes128Siv::new_from_slice(key)
                .map_err(|_| CryptoError::BadKey("bad siv key".into()))?;
            siv.decrypt(headers, ciphertext).map_err(|_| CryptoError::TagMismatch)
        }
        64 => {
            let mut siv = Aes256Siv::new_from_slice(key)
                .map_err(|_| CryptoError::BadKey("bad siv key".into()))?;
            siv.decrypt(headers, ciphertext).map_err(|_| CryptoError::TagMismatch)
        }
        n => Err(CryptoError::BadKey(format!("siv key must be 32 or 64 bytes, got {n}"))),
    }
}

/// Encrypt each path component, preserving separators and the root marker:
/// `/a/b` becomes `/E(a)/E(b)`.
pub fn map_path<F>(path: &str, mut f: F) -> Result<String, CryptoError>
where
    F: FnMut(&str) -> Result<String, CryptoError>,
{
    let rooted = path.starts_with('/');
    let mut out = Vec::new();
    for comp in path.split('/') {
        if comp.is_empty() {
            continue;
        }
        out.push(f(comp)?);
    }
    let joined = out.join("/");
    Ok(if rooted { format!("/{joined}") } else { joined })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecb_round_trip_and_determinism() {
        let key = [1u8; 32];
        let a = encrypt_name_ecb(&key, "hello.txt");
        let b = encrypt_name_ecb(&key, "hello.txt");
        assert_eq!(a, b);
        assert_eq!(decrypt_name_ecb(&key, &a).unwrap(), "hello.txt");
        assert!(!a.contains('/') && !a.contains('+'));
    }

    #[test]
    fn ecb_block_boundary_names() {
        let key = [2u8; 32];
        for name in ["x", "exactly16bytes!!", "a-name-spanning-multiple-blocks-easily"] {
            let c = encrypt_name_ecb(&key, name);
            assert_eq!(decrypt_name_ecb(&key, &c).unwrap(), name);
        }
    }

    #[test]
    fn siv_round_trip_both_key_sizes() {
        for len in [32usize, 64] {
            let key: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let c = encrypt_name_siv(&key, "söme unicode name").unwrap();
            assert_eq!(c, encrypt_name_siv(&key, "söme unicode name").unwrap());
            assert_eq!(decrypt_name_siv(&key, &c).unwrap(), "söme unicode name");
        }
    }

    #[test]
    fn siv_distinct_names_distinct_ciphertexts() {
        let key = [9u8; 64];
        let a = encrypt_name_siv(&key, "a").unwrap();
        let b = encrypt_name_siv(&key, "b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn siv_wrong_key_fails() {
        let c = encrypt_name_siv(&[3u8; 64], "name").unwrap();
        assert!(decrypt_name_siv(&[4u8; 64], &c).is_err());
    }

    #[test]
    fn path_mapping_preserves_shape() {
        let out = map_path("/a/b/c", |c| Ok(format!("E{c}"))).unwrap();
        assert_eq!(out, "/Ea/Eb/Ec");
        let rel = map_path("a/b", |c| Ok(format!("E{c}"))).unwrap();
        assert_eq!(rel, "Ea/Eb");
    }
}
