use aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use ring::digest;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{Result, TeamError};

const KEY_SIZE: usize = 32; // 256 bits
const NONCE_SIZE: usize = 12;
const TOKEN_SIZE: usize = 32;
const SEALED_VERSION: u8 = 1;

/// Prefix for one-time invite tokens.
pub const INVITE_TOKEN_PREFIX: &str = "tsi_";
/// Prefix for session bearer tokens.
pub const SESSION_TOKEN_PREFIX: &str = "tss_";
/// Prefix for the bootstrap admin token.
pub const ADMIN_TOKEN_PREFIX: &str = "tsa_";

/// The server master key. Every sealed record in storage is encrypted under it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(TeamError::Encryption(format!(
                "Invalid key size: expected {}, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        let mut bytes = hex::decode(encoded.trim())
            .map_err(|_| TeamError::Configuration("master key is not valid hex".to_string()))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

/// Envelope encryption for secret fields at rest.
///
/// Sealed layout is `version || nonce || ciphertext`, where the ciphertext
/// carries the Poly1305 tag. Opening never returns plaintext unless the tag
/// verifies under the configured master key.
pub struct Sealer {
    key: MasterKey,
}

impl Sealer {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(self.key.as_bytes())
            .map_err(|e| TeamError::Encryption(e.to_string()))?;

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| TeamError::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        sealed.push(SEALED_VERSION);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 1 + NONCE_SIZE {
            return Err(TeamError::Decryption("sealed value too short".to_string()));
        }
        if sealed[0] != SEALED_VERSION {
            return Err(TeamError::Decryption(format!(
                "unsupported sealed version {}",
                sealed[0]
            )));
        }

        let cipher = ChaCha20Poly1305::new_from_slice(self.key.as_bytes())
            .map_err(|e| TeamError::Decryption(e.to_string()))?;

        let nonce = Nonce::from_slice(&sealed[1..1 + NONCE_SIZE]);

        cipher
            .decrypt(nonce, &sealed[1 + NONCE_SIZE..])
            .map_err(|_| TeamError::Decryption("authentication tag mismatch".to_string()))
    }

    pub fn seal_str(&self, plaintext: &str) -> Result<Vec<u8>> {
        self.seal(plaintext.as_bytes())
    }

    pub fn open_string(&self, sealed: &[u8]) -> Result<String> {
        let bytes = self.open(sealed)?;
        String::from_utf8(bytes)
            .map_err(|_| TeamError::Decryption("sealed value is not UTF-8".to_string()))
    }
}

/// Generates a random bearer token with the given prefix.
pub fn generate_token(prefix: &str) -> String {
    let mut bytes = [0u8; TOKEN_SIZE];
    OsRng.fill_bytes(&mut bytes);
    let token = format!("{}{}", prefix, hex::encode(bytes));
    bytes.zeroize();
    token
}

/// One-way hash used to persist tokens. The plaintext is never stored.
pub fn hash_token(token: &str) -> String {
    hex::encode(digest::digest(&digest::SHA256, token.as_bytes()))
}

/// Checks a presented token against a stored hash without leaking timing.
pub fn verify_token_hash(token: &str, stored_hash: &str) -> bool {
    let computed = hash_token(token);
    computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}
