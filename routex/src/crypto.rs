//! Credential encryption and request signatures
//!
//! Channel api keys are stored as AES-256-GCM ciphertext in the form
//! `hex(iv):hex(tag):hex(ct)`. The AEAD key is derived from the master
//! password with Argon2id. Ingress request signatures are HMAC-SHA256 over a
//! canonical string and verified in constant time.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// AES-GCM nonce length in bytes
const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag length in bytes
const TAG_SIZE: usize = 16;

/// Derived key length in bytes
const KEY_SIZE: usize = 32;

/// Salt used when no deterministic salt is configured
const DEFAULT_SALT: &[u8] = b"routex-credential-salt-v1";

/// Symmetric cipher for credentials at rest
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Derive the AEAD key from a master password and optional hex salt
    ///
    /// The password must be at least 32 characters; the salt, when present,
    /// must be hex. Key derivation runs Argon2id with its default parameters.
    pub fn new(master_password: &str, salt_hex: Option<&str>) -> Result<Self> {
        if master_password.len() < 32 {
            return Err(Error::Config(
                "master password must be at least 32 characters".to_string(),
            ));
        }

        let salt = match salt_hex {
            Some(hex_str) => hex::decode(hex_str)
                .map_err(|_| Error::Config("encryption salt must be hex".to_string()))?,
            None => DEFAULT_SALT.to_vec(),
        };

        let mut key = [0u8; KEY_SIZE];
        Argon2::default()
            .hash_password_into(master_password.as_bytes(), &salt, &mut key)
            .map_err(|e| Error::Config(format!("key derivation failed: {}", e)))?;

        Ok(Self { key })
    }

    /// Encrypt a plaintext string, producing `hex(iv):hex(tag):hex(ct)`
    ///
    /// A fresh random nonce is drawn per call, so two encryptions of the same
    /// plaintext differ.
    pub fn encrypt(&self, plain: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let iv = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = cipher
            .encrypt(&iv, plain.as_bytes())
            .map_err(|_| Error::BadCiphertext)?;

        // aes-gcm appends the tag to the ciphertext
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ct)
        ))
    }

    /// Decrypt a `hex(iv):hex(tag):hex(ct)` string
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let mut parts = ciphertext.splitn(3, ':');
        let (iv_hex, tag_hex, ct_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(iv), Some(tag), Some(ct)) => (iv, tag, ct),
            _ => return Err(Error::BadCiphertext),
        };

        let iv = hex::decode(iv_hex).map_err(|_| Error::BadCiphertext)?;
        let tag = hex::decode(tag_hex).map_err(|_| Error::BadCiphertext)?;
        let ct = hex::decode(ct_hex).map_err(|_| Error::BadCiphertext)?;

        if iv.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
            return Err(Error::BadCiphertext);
        }

        let mut sealed = ct;
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plain = cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| Error::BadCiphertext)?;

        String::from_utf8(plain).map_err(|_| Error::BadCiphertext)
    }
}

/// Check whether a string has the three-hex-segment ciphertext shape
pub fn is_encrypted(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return false;
    }
    parts[0].len() == NONCE_SIZE * 2
        && parts[1].len() == TAG_SIZE * 2
        && !parts[2].is_empty()
        && parts
            .iter()
            .all(|p| p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Mask a secret, keeping the first and last `n` characters
pub fn mask(s: &str, n: usize) -> String {
    if s.chars().count() <= n * 2 {
        return "***".to_string();
    }
    let head: String = s.chars().take(n).collect();
    let tail: String = s.chars().skip(s.chars().count() - n).collect();
    format!("{}***{}", head, tail)
}

/// Compute the hex HMAC-SHA256 signature over the canonical request string
///
/// The signed string is `METHOD\nPATH\nTIMESTAMP\nBODY` followed by one
/// `name:value\n`-style line per signed header, in the given order.
pub fn compute_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    body: &str,
    headers: &[(String, String)],
) -> String {
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");

    mac.update(method.as_bytes());
    mac.update(b"\n");
    mac.update(path.as_bytes());
    mac.update(b"\n");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(body.as_bytes());
    for (name, value) in headers {
        mac.update(b"\n");
        mac.update(name.as_bytes());
        mac.update(b":");
        mac.update(value.as_bytes());
    }

    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature; length-checked, then constant-time compared
pub fn verify_signature(
    secret: &str,
    signature_hex: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    body: &str,
    headers: &[(String, String)],
) -> Result<()> {
    let signature = hex::decode(signature_hex).map_err(|_| Error::SignatureInvalid)?;
    if signature.len() != 32 {
        return Err(Error::SignatureInvalid);
    }

    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(method.as_bytes());
    mac.update(b"\n");
    mac.update(path.as_bytes());
    mac.update(b"\n");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(body.as_bytes());
    for (name, value) in headers {
        mac.update(b"\n");
        mac.update(name.as_bytes());
        mac.update(b":");
        mac.update(value.as_bytes());
    }

    mac.verify_slice(&signature)
        .map_err(|_| Error::SignatureInvalid)
}

/// Check a signed timestamp against the tolerance window
///
/// A skew exactly at the tolerance boundary is accepted.
pub fn verify_timestamp(timestamp: i64, now: i64, tolerance_secs: u64) -> Result<()> {
    let skew = (now - timestamp).unsigned_abs();
    if skew > tolerance_secs {
        return Err(Error::TimestampOutOfWindow);
    }
    Ok(())
}
