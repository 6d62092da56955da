//! Authorized key matching
//!
//! Lines follow OpenSSH `authorized_keys` syntax:
//! `[options] algorithm base64blob [comment]`. A key matches when the
//! algorithm name is identical and the decoded blob is byte-equal.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use russh::keys::{PublicKey, PublicKeyBase64};

/// Whether the offered `(algorithm, blob)` appears in `lines`.
pub fn key_matches<'a, I>(algorithm: &str, blob: &[u8], lines: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .filter_map(parse_line)
        .any(|(alg, encoded)| {
            alg == algorithm
                && STANDARD
                    .decode(encoded)
                    .map(|decoded| decoded == blob)
                    .unwrap_or(false)
        })
}

/// [`key_matches`] for a key offered during SSH authentication.
pub fn offered_key_matches(key: &PublicKey, authorized: &str) -> bool {
    let algorithm = key.algorithm();
    key_matches(algorithm.as_str(), &key.public_key_bytes(), authorized.lines())
}

/// Extract `(algorithm, base64)` from one line, skipping any options prefix.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    fields
        .windows(2)
        .find(|pair| is_key_type(pair[0]))
        .map(|pair| (pair[0], pair[1]))
}

fn is_key_type(field: &str) -> bool {
    field.starts_with("ssh-")
        || field.starts_with("ecdsa-sha2-")
        || field.starts_with("sk-")
        || field.starts_with("rsa-sha2-")
}
