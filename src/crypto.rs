//! Crypto primitives for the E2EE channel.
//!
//! X25519 keypairs, raw Diffie-Hellman shared-secret derivation (no KDF —
//! the 32-byte DH output is used directly as the AEAD key, so two
//! implementations must agree bit-for-bit to interoperate), and
//! ChaCha20-Poly1305 AEAD framing with a random 12-byte nonce prepended to
//! each ciphertext.
//!
//! Base64 framing uses the standard alphabet throughout: the pairing URL
//! (spec §6) and the channel's ciphertext-as-text wire frames (spec §4.B)
//! both specify standard, not URL-safe, base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{OsRng, RngCore};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of an X25519 key, a derived shared key, and the random nonce
/// prefix on every ciphertext.
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64 encoding")]
    InvalidBase64,
    #[error("expected a {expected}-byte key, got {actual}")]
    WrongKeyLength { expected: usize, actual: usize },
    #[error("ciphertext is shorter than the nonce prefix")]
    CiphertextTooShort,
    #[error("AEAD decryption failed (tamper, wrong key, or malformed frame)")]
    DecryptError,
    #[error("AEAD encryption failed")]
    EncryptError,
}

/// An X25519 keypair. `secret` never leaves the owner; `public` is safe to
/// publish (e.g. baked into a pairing URL).
pub struct Keypair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

/// A 32-byte symmetric key derived from an X25519 shared secret. Used
/// directly as the ChaCha20-Poly1305 key — there is no KDF step.
#[derive(Clone)]
pub struct SharedKey(pub [u8; KEY_LEN]);

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

/// Generates a fresh X25519 keypair.
pub fn generate_keypair() -> Keypair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    Keypair { secret, public }
}

/// Derives the shared key from a local secret and a remote public key.
/// This is the raw X25519 scalar-multiplication output — no KDF is
/// interposed, by spec: both peers must compute exactly this to interop.
pub fn derive_shared(local_secret: &StaticSecret, remote_public: &PublicKey) -> SharedKey {
    SharedKey(local_secret.diffie_hellman(remote_public).to_bytes())
}

/// Encrypts `plaintext` under `key`, returning `nonce(12) || ciphertext`.
pub fn encrypt(key: &SharedKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ct = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptError)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypts `nonce(12) || ciphertext` under `key`.
pub fn decrypt(key: &SharedKey, framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if framed.len() < NONCE_LEN {
        return Err(CryptoError::CiphertextTooShort);
    }
    let (nonce_bytes, ct) = framed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ct)
        .map_err(|_| CryptoError::DecryptError)
}

/// Parses a base64 (standard alphabet) X25519 public key.
pub fn public_key_from_b64(s: &str) -> Result<PublicKey, CryptoError> {
    let raw = STANDARD.decode(s).map_err(|_| CryptoError::InvalidBase64)?;
    let bytes: [u8; KEY_LEN] = raw
        .try_into()
        .map_err(|v: Vec<u8>| CryptoError::WrongKeyLength {
            expected: KEY_LEN,
            actual: v.len(),
        })?;
    Ok(PublicKey::from(bytes))
}

pub fn b64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD.decode(s).map_err(|_| CryptoError::InvalidBase64)
}
