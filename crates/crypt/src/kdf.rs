//! Password-derived master wrap key.
//!
//! The salt is the SHA-256 of the client name, so a password re-derives the
//! same wrap key on any machine without stored salt material. Scheme 1 kept
//! its original PBKDF2 shape (64 bytes derived, first 32 used); newer
//! schemes use scrypt.

use pbkdf2::pbkdf2_hmac;
use scrypt::{scrypt, Params};
use sha2::{Digest, Sha256};

use crate::CryptoError;

const PBKDF2_ITERATIONS: u32 = 20_000;
// N = 2^16, r = 8, p = 1
const SCRYPT_LOG_N: u8 = 16;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Salt for a client's key derivation.
pub fn client_salt(client: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(client.as_bytes()));
    out
}

/// Derive the 32-byte wrap key for the given scheme.
pub fn derive_wrap_key(scheme: u8, password: &str, client: &str) -> Result<[u8; 32], CryptoError> {
    let salt = client_salt(client);
    let mut key = [0u8; 32];
    match scheme {
        0 => return Err(CryptoError::Kdf("scheme 0 has no keys".into())),
        1 => {
            let mut wide = [0u8; 64];
            pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut wide);
            key.copy_from_slice(&wide[..32]);
        }
        _ => {
            let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
                .map_err(|e| CryptoError::Kdf(e.to_string()))?;
            scrypt(password.as_bytes(), &salt, &params, &mut key)
                .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        }
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_per_client() {
        let a = derive_wrap_key(1, "p@ss", "alice").unwrap();
        let b = derive_wrap_key(1, "p@ss", "alice").unwrap();
        let c = derive_wrap_key(1, "p@ss", "bob").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn schemes_disagree() {
        // scrypt path must not collide with the pbkdf2 path
        let a = derive_wrap_key(1, "p@ss", "alice").unwrap();
        let b = derive_wrap_key(3, "p@ss", "alice").unwrap();
        assert_ne!(a, b);
    }
}
