//! SCRAM-SHA-256 password verifiers (RFC 5802, RFC 7677)
//!
//! PostgreSQL stores passwords as
//! `SCRAM-SHA-256$<iterations>:<salt>$<StoredKey>:<ServerKey>` with every
//! binary field base64 encoded. The operator computes that string locally and
//! sends only the verifier, never the plaintext.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Iteration count PostgreSQL uses by default
pub const SCRAM_ITERATIONS: u32 = 4096;

/// Salt length PostgreSQL uses by default
pub const SCRAM_SALT_LEN: usize = 16;

const SCRAM_PREFIX: &str = "SCRAM-SHA-256$";
const MD5_PREFIX: &str = "md5";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScramError {
    #[error("Malformed SCRAM verifier")]
    Malformed,

    #[error("Invalid base64 in SCRAM verifier: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid HMAC key length")]
    KeyLength,
}

/// A stored SCRAM-SHA-256 verifier
#[derive(Clone, PartialEq, Eq)]
pub struct ScramVerifier {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl fmt::Debug for ScramVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramVerifier")
            .field("iterations", &self.iterations)
            .field("salt", &"[REDACTED]")
            .field("stored_key", &"[REDACTED]")
            .field("server_key", &"[REDACTED]")
            .finish()
    }
}

impl ScramVerifier {
    /// Verifier for `password` with a fresh random salt
    pub fn compute(password: &str) -> Result<Self, ScramError> {
        let salt = rand::random::<[u8; SCRAM_SALT_LEN]>();
        Self::with_salt(password, &salt, SCRAM_ITERATIONS)
    }

    /// Verifier for `password` with a given salt and iteration count
    pub fn with_salt(password: &str, salt: &[u8], iterations: u32) -> Result<Self, ScramError> {
        let salted = salted_password(password, salt, iterations);
        let client_key = hmac_sha256(&salted, b"Client Key")?;
        let server_key = hmac_sha256(&salted, b"Server Key")?;
        let stored_key = Sha256::digest(&client_key).to_vec();

        Ok(Self {
            iterations,
            salt: salt.to_vec(),
            stored_key,
            server_key,
        })
    }

    /// Whether `password` produces this verifier (constant time)
    pub fn matches(&self, password: &str) -> bool {
        match Self::with_salt(password, &self.salt, self.iterations) {
            Ok(candidate) => {
                constant_time_eq(&candidate.stored_key, &self.stored_key)
                    & constant_time_eq(&candidate.server_key, &self.server_key)
            }
            Err(_) => false,
        }
    }
}

impl fmt::Display for ScramVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}${}:{}",
            SCRAM_PREFIX,
            self.iterations,
            BASE64.encode(&self.salt),
            BASE64.encode(&self.stored_key),
            BASE64.encode(&self.server_key)
        )
    }
}

impl FromStr for ScramVerifier {
    type Err = ScramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(SCRAM_PREFIX).ok_or(ScramError::Malformed)?;
        let (params, keys) = rest.split_once('$').ok_or(ScramError::Malformed)?;
        let (iterations, salt) = params.split_once(':').ok_or(ScramError::Malformed)?;
        let (stored_key, server_key) = keys.split_once(':').ok_or(ScramError::Malformed)?;

        let iterations = iterations
            .parse::<u32>()
            .map_err(|_| ScramError::Malformed)?;
        if iterations == 0 {
            return Err(ScramError::Malformed);
        }

        Ok(Self {
            iterations,
            salt: BASE64.decode(salt)?,
            stored_key: BASE64.decode(stored_key)?,
            server_key: BASE64.decode(server_key)?,
        })
    }
}

/// Legacy `md5` verifier: `md5` followed by hex(md5(password || username))
pub fn md5_verifier(username: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(MD5_PREFIX.len() + digest.len() * 2);
    out.push_str(MD5_PREFIX);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Whether the stored verifier of `username` accepts `password`
///
/// Anything other than a SCRAM or md5 verifier (including no password at all)
/// counts as a mismatch so the password gets re-applied.
pub fn password_matches(stored: Option<&str>, username: &str, password: &str) -> bool {
    let Some(stored) = stored else {
        return false;
    };
    if stored.starts_with(SCRAM_PREFIX) {
        return stored
            .parse::<ScramVerifier>()
            .is_ok_and(|verifier| verifier.matches(password));
    }
    if stored.starts_with(MD5_PREFIX) && stored.len() == MD5_PREFIX.len() + 32 {
        return constant_time_eq(
            stored.as_bytes(),
            md5_verifier(username, password).as_bytes(),
        );
    }
    false
}

/// PBKDF2 over the SASLprep form of `password`
///
/// Passwords SASLprep rejects are used as raw bytes, matching the server.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let prepared = stringprep::saslprep(password).unwrap_or(Cow::Borrowed(password));
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(prepared.as_bytes(), salt, iterations, &mut out);
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyLength)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
