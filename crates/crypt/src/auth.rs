//! SRP-6a mutual authentication glue.
//!
//! The server stores `(salt, verifier)` per client and never sees the
//! password. The transcript is AUTH1{A} → AUTH1-OK{s,B} → AUTH2{M1} →
//! AUTH2-OK{HAMK}; each side holds its ephemeral secret only for the
//! duration of the exchange.

use rand::RngCore;
use sha2::Sha256;
use srp::client::{SrpClient, SrpClientVerifier};
use srp::groups::G_2048;
use srp::server::{SrpServer, SrpServerVerifier};

use crate::CryptoError;

const EPHEMERAL_LEN: usize = 64;
const SALT_LEN: usize = 16;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Create fresh `(salt, verifier)` material for a client/password pair.
pub fn create_verifier(client: &str, password: &str) -> (Vec<u8>, Vec<u8>) {
    let salt = random_bytes(SALT_LEN);
    let srp = SrpClient::<Sha256>::new(&G_2048);
    let verifier = srp.compute_verifier(client.as_bytes(), password.as_bytes(), &salt);
    (salt, verifier)
}

/// Client half of the exchange.
pub struct ClientAuth {
    a: Vec<u8>,
    client: String,
    password: String,
}

/// Holds the shared-key proof state after the challenge is processed.
pub struct ClientProof {
    verifier: SrpClientVerifier<Sha256>,
}

impl ClientAuth {
    pub fn new(client: &str, password: &str) -> Self {
        Self {
            a: random_bytes(EPHEMERAL_LEN),
            client: client.to_string(),
            password: password.to_string(),
        }
    }

    /// Public ephemeral A for AUTH1.
    pub fn public_a(&self) -> Vec<u8> {
        SrpClient::<Sha256>::new(&G_2048).compute_public_ephemeral(&self.a)
    }

    /// Process the server's `(salt, B)` challenge; returns the M1 proof.
    pub fn process_challenge(
        &self,
        salt: &[u8],
        b_pub: &[u8],
    ) -> Result<(Vec<u8>, ClientProof), CryptoError> {
        let srp = SrpClient::<Sha256>::new(&G_2048);
        let verifier = srp
            .process_reply(
                &self.a,
                self.client.as_bytes(),
                self.password.as_bytes(),
                salt,
                b_pub,
            )
            .map_err(|e| CryptoError::Srp(e.to_string()))?;
        let m1 = verifier.proof().to_vec();
        Ok((m1, ClientProof { verifier }))
    }
}

impl ClientProof {
    /// Check the server's HAMK; failure means the server does not actually
    /// hold the verifier.
    pub fn verify_server(&self, hamk: &[u8]) -> Result<(), CryptoError> {
        self.verifier
            .verify_server(hamk)
            .map_err(|_| CryptoError::Srp("server proof mismatch".into()))
    }
}

/// Server half of the exchange, spanning AUTH1 → AUTH2.
pub struct ServerAuth {
    b: Vec<u8>,
    verifier: Vec<u8>,
    a_pub: Vec<u8>,
}

impl ServerAuth {
    /// Start the exchange for a stored verifier and the client's A; returns
    /// the state and public ephemeral B.
    pub fn start(verifier: &[u8], a_pub: &[u8]) -> (Self, Vec<u8>) {
        let b = random_bytes(EPHEMERAL_LEN);
        let b_pub = SrpServer::<Sha256>::new(&G_2048).compute_public_ephemeral(&b, verifier);
        (
            Self { b, verifier: verifier.to_vec(), a_pub: a_pub.to_vec() },
            b_pub,
        )
    }

    /// Check the client's M1; success yields the HAMK server proof.
    pub fn verify(self, m1: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let srp = SrpServer::<Sha256>::new(&G_2048);
        let verifier: SrpServerVerifier<Sha256> = srp
            .process_reply(&self.b, &self.verifier, &self.a_pub)
            .map_err(|e| CryptoError::Srp(e.to_string()))?;
        verifier
            .verify_client(m1)
            .map_err(|_| CryptoError::Srp("client proof mismatch".into()))?;
        Ok(verifier.proof().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_exchange_succeeds() {
        let (salt, vkey) = create_verifier("alice", "p@ss");

        let client = ClientAuth::new("alice", "p@ss");
        let a_pub = client.public_a();

        let (server, b_pub) = ServerAuth::start(&vkey, &a_pub);
        let (m1, proof) = client.process_challenge(&salt, &b_pub).unwrap();
        let hamk = server.verify(&m1).unwrap();
        proof.verify_server(&hamk).unwrap();
    }

    #[test]
    fn wrong_password_rejected() {
        let (salt, vkey) = create_verifier("alice", "p@ss");

        let client = ClientAuth::new("alice", "wrong");
        let a_pub = client.public_a();

        let (server, b_pub) = ServerAuth::start(&vkey, &a_pub);
        let (m1, _proof) = client.process_challenge(&salt, &b_pub).unwrap();
        assert!(server.verify(&m1).is_err());
    }
}
