//! Device Identity Codec
//!
//! SSH usernames and browser paths both carry `{provider}-{dongleId}-{token}`.
//! The token may be a plaintext bearer credential or an `enc.` sealed box
//! that only this relay can open.

pub mod authorized_keys;
pub mod token;

pub use authorized_keys::{key_matches, offered_key_matches};
pub use token::{SealedTokenDecryptor, TokenDecryptor, TokenError};

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix marking an encrypted token
pub const ENCRYPTED_TOKEN_PREFIX: &str = "enc.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Asius,
    Comma,
    Konik,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Asius => "asius",
            Provider::Comma => "comma",
            Provider::Konik => "konik",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asius" => Ok(Provider::Asius),
            "comma" => Ok(Provider::Comma),
            "konik" => Ok(Provider::Konik),
            other => Err(IdentityError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("expected provider-dongleId-token")]
    Malformed,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("identity contains unsupported characters")]
    InvalidCharacters,

    #[error("encrypted token cannot be opened: {0}")]
    Token(#[from] TokenError),
}

/// Target device plus the credential used to reach it
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub provider: Provider,
    pub dongle_id: String,
    token: String,
}

impl Identity {
    pub fn new(provider: Provider, dongle_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            provider,
            dongle_id: dongle_id.into(),
            token: token.into(),
        }
    }

    /// Plaintext bearer token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// SSH username carrying the plaintext token
    pub fn username(&self) -> String {
        format!("{}-{}-{}", self.provider, self.dongle_id, self.token)
    }

    /// Log prefix: `[provider/dongleId]`
    pub fn tag(&self) -> String {
        format!("[{}/{}]", self.provider, self.dongle_id)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("provider", &self.provider)
            .field("dongle_id", &self.dongle_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Parse `provider-dongleId-token`.
///
/// The string is split on the first two `-`; everything after the second
/// one is the token, so tokens may contain `-` themselves. `enc.` tokens are
/// opened with `decryptor`; without one they are rejected.
pub fn parse_identity(
    username: &str,
    decryptor: Option<&dyn TokenDecryptor>,
) -> Result<Identity, IdentityError> {
    let mut parts = username.splitn(3, '-');
    let provider = parts.next().unwrap_or_default();
    let dongle_id = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default();

    if provider.is_empty() || dongle_id.is_empty() || token.is_empty() {
        return Err(IdentityError::Malformed);
    }

    let provider: Provider = provider.parse()?;

    let token = match token.strip_prefix(ENCRYPTED_TOKEN_PREFIX) {
        Some(sealed) => {
            let decryptor = decryptor.ok_or(TokenError::NoKey)?;
            decryptor.decrypt(sealed)?
        }
        None => token.to_string(),
    };

    if !is_safe(dongle_id) || !is_safe(&token) {
        return Err(IdentityError::InvalidCharacters);
    }

    Ok(Identity::new(provider, dongle_id, token))
}

// [A-Za-z0-9._-]+
fn is_safe(part: &str) -> bool {
    !part.is_empty()
        && part
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
