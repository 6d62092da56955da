//! Sealed token decryption
//!
//! Layout after the `enc.` prefix: base64url (unpadded) of
//! `ephemeral_public[32] || nonce[24] || box`, where `box` is a NaCl
//! crypto_box (X25519 + XSalsa20-Poly1305) addressed to the relay's key.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("no token key configured")]
    NoKey,

    #[error("invalid token key")]
    InvalidKey,

    #[error("token is not valid base64url")]
    Encoding,

    #[error("token too short")]
    Truncated,

    #[error("authentication failed")]
    Open,

    #[error("token is not UTF-8")]
    NotUtf8,
}

/// Opens `enc.` tokens. The argument excludes the prefix.
pub trait TokenDecryptor: Send + Sync {
    fn decrypt(&self, sealed: &str) -> Result<String, TokenError>;
}

pub struct SealedTokenDecryptor {
    secret: SecretKey,
}

impl SealedTokenDecryptor {
    pub fn new(secret: SecretKey) -> Self {
        Self { secret }
    }

    /// Standard base64 of the 32-byte X25519 secret.
    pub fn from_base64(encoded: &str) -> Result<Self, TokenError> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|_| TokenError::InvalidKey)?,
        );
        let raw: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| TokenError::InvalidKey)?;
        Ok(Self::new(SecretKey::from(raw)))
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }
}

impl TokenDecryptor for SealedTokenDecryptor {
    fn decrypt(&self, sealed: &str) -> Result<String, TokenError> {
        let data = URL_SAFE_NO_PAD
            .decode(sealed.trim_end_matches('='))
            .map_err(|_| TokenError::Encoding)?;
        if data.len() <= KEY_LEN + NONCE_LEN {
            return Err(TokenError::Truncated);
        }

        let (ephemeral, rest) = data.split_at(KEY_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let ephemeral: [u8; KEY_LEN] = ephemeral.try_into().map_err(|_| TokenError::Truncated)?;

        let salsa = SalsaBox::new(&PublicKey::from(ephemeral), &self.secret);
        let plaintext = salsa
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::Open)?;

        String::from_utf8(plaintext).map_err(|_| TokenError::NotUtf8)
    }
}
