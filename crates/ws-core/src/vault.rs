//! Crypto vault: authenticated encryption for stored credentials, password
//! hashing, token generation, and webhook payload signing.
//!
//! Credentials are sealed with AES-256-GCM (16-byte IV, 16-byte tag) and
//! stored as hex-encoded `iv || tag || ciphertext`. The 32-byte key comes from
//! a process-level secret; shorter secrets are stretched with scrypt over a
//! fixed salt. Key material is zeroed from memory on drop.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, WsError};

/// AES-256-GCM with the 16-byte IV the credential wire format uses.
type CredentialCipher = AesGcm<Aes256, U16>;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Fixed salt for stretching short process secrets into a full key.
const KEY_SALT: &[u8] = b"worksync-credential-vault";

/// scrypt cost parameters: N=2^14, r=8, p=1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

const PASSWORD_SALT_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Process-wide credential vault. Cheap to clone is intentionally *not*
/// provided; share it behind an `Arc`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Vault {
    key: [u8; KEY_LEN],
}

impl Vault {
    /// Build a vault from the process-level secret. A secret of exactly 32
    /// bytes is used as the key directly; anything else is stretched with
    /// scrypt over a fixed salt.
    pub fn from_secret(secret: &str) -> Result<Self> {
        let bytes = secret.as_bytes();
        let mut key = [0u8; KEY_LEN];
        if bytes.len() == KEY_LEN {
            key.copy_from_slice(bytes);
        } else {
            derive_key(bytes, KEY_SALT, &mut key)?;
        }
        Ok(Self { key })
    }

    // -- credential encryption ----------------------------------------------

    /// Encrypt an opaque byte value, returning hex `iv || tag || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut iv = [0u8; IV_LEN];
        SystemRandom::new()
            .fill(&mut iv)
            .map_err(|_| WsError::Crypto("random generation failed".into()))?;

        let cipher = CredentialCipher::new(Key::<CredentialCipher>::from_slice(&self.key));
        let sealed = cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext)
            .map_err(|_| WsError::Crypto("encryption failed".into()))?;

        // RustCrypto appends the tag; the wire format wants it up front.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        Ok(hex::encode(out))
    }

    /// Decrypt hex `iv || tag || ciphertext`. Fails with
    /// [`WsError::CredentialDecrypt`] when the authentication tag does not
    /// verify; callers translate this into a credential re-entry prompt.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let raw = hex::decode(encoded)
            .map_err(|_| WsError::Crypto("credential blob is not valid hex".into()))?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(WsError::Crypto(format!(
                "credential blob too short: {} bytes",
                raw.len()
            )));
        }

        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        // Reassemble into the ciphertext||tag layout the cipher expects.
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = CredentialCipher::new(Key::<CredentialCipher>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::<U16>::from_slice(iv), sealed.as_ref())
            .map_err(|_| WsError::CredentialDecrypt)
    }

    /// Encrypt a serializable value as JSON.
    pub fn encrypt_json<T: serde::Serialize>(&self, value: &T) -> Result<String> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| WsError::Crypto(format!("serialize credentials: {e}")))?;
        self.encrypt(&bytes)
    }

    /// Decrypt and deserialize a JSON value.
    pub fn decrypt_json<T: serde::de::DeserializeOwned>(&self, encoded: &str) -> Result<T> {
        let bytes = self.decrypt(encoded)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| WsError::Crypto(format!("deserialize credentials: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

/// Hash a password with scrypt and a per-value random salt. The stored form
/// is `hex(salt):hex(hash)`.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; PASSWORD_SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| WsError::Crypto("random generation failed".into()))?;

    let mut hash = [0u8; KEY_LEN];
    derive_key(password.as_bytes(), &salt, &mut hash)?;
    Ok(format!("{}:{}", hex::encode(salt), hex::encode(hash)))
}

/// Verify a password against a stored `salt:hash`, in constant time.
pub fn verify_password(password: &str, stored: &str) -> Result<bool> {
    let (salt_hex, hash_hex) = stored
        .split_once(':')
        .ok_or_else(|| WsError::Crypto("stored password hash is malformed".into()))?;
    let salt =
        hex::decode(salt_hex).map_err(|_| WsError::Crypto("stored salt is not hex".into()))?;
    let expected =
        hex::decode(hash_hex).map_err(|_| WsError::Crypto("stored hash is not hex".into()))?;

    let mut actual = vec![0u8; expected.len().max(1)];
    derive_key(password.as_bytes(), &salt, &mut actual)?;
    Ok(bool::from(actual.ct_eq(&expected)))
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Generate a cryptographically strong random token of `bytes` entropy,
/// hex-encoded (so twice as many characters).
pub fn generate_token(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| WsError::Crypto("random generation failed".into()))?;
    Ok(hex::encode(buf))
}

// ---------------------------------------------------------------------------
// Webhook signatures
// ---------------------------------------------------------------------------

/// Sign a webhook payload: `sha256=<lowercase hex of HMAC-SHA-256(body)>`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a webhook signature header value in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let expected = sign_payload(secret, body);
    bool::from(expected.as_bytes().ct_eq(signature.as_bytes()))
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

fn derive_key(secret: &[u8], salt: &[u8], out: &mut [u8]) -> Result<()> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, out.len())
        .map_err(|e| WsError::Crypto(format!("scrypt params: {e}")))?;
    scrypt::scrypt(secret, salt, &params, out)
        .map_err(|e| WsError::Crypto(format!("scrypt: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::from_secret("test-secret").unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let v = vault();
        let plaintext = b"{\"token\":\"pat-abc123\"}";
        let sealed = v.encrypt(plaintext).unwrap();
        let opened = v.decrypt(&sealed).unwrap();
        assert_eq!(plaintext.as_slice(), opened.as_slice());
    }

    #[test]
    fn thirty_two_byte_secret_used_directly() {
        let secret = "0123456789abcdef0123456789abcdef"; // exactly 32 bytes
        let v = Vault::from_secret(secret).unwrap();
        let sealed = v.encrypt(b"x").unwrap();
        assert_eq!(v.decrypt(&sealed).unwrap(), b"x");
    }

    #[test]
    fn wire_format_is_iv_tag_ciphertext_hex() {
        let v = vault();
        let plaintext = b"payload";
        let sealed = v.encrypt(plaintext).unwrap();
        // hex chars = 2 * (16 iv + 16 tag + len ct)
        assert_eq!(sealed.len(), 2 * (16 + 16 + plaintext.len()));
        assert!(sealed.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_ivs_produce_distinct_ciphertexts() {
        let v = vault();
        let a = v.encrypt(b"same").unwrap();
        let b = v.encrypt(b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(v.decrypt(&a).unwrap(), v.decrypt(&b).unwrap());
    }

    #[test]
    fn tampering_any_byte_fails_authentication() {
        let v = vault();
        let sealed = v.encrypt(b"secret credential").unwrap();
        let mut raw = hex::decode(&sealed).unwrap();
        for idx in [0, 16, raw.len() - 1] {
            let mut tampered = raw.clone();
            tampered[idx] ^= 0x01;
            let result = v.decrypt(&hex::encode(&tampered));
            assert!(
                matches!(result, Err(WsError::CredentialDecrypt)),
                "tampering byte {idx} should fail the tag"
            );
        }
        // Untampered still decrypts.
        raw[0] ^= 0x00;
        assert!(v.decrypt(&hex::encode(raw)).is_ok());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = vault().encrypt(b"data").unwrap();
        let other = Vault::from_secret("different-secret").unwrap();
        assert!(matches!(
            other.decrypt(&sealed),
            Err(WsError::CredentialDecrypt)
        ));
    }

    #[test]
    fn truncated_blob_is_a_format_error() {
        let v = vault();
        assert!(matches!(v.decrypt("abcd"), Err(WsError::Crypto(_))));
        assert!(matches!(v.decrypt("zz-not-hex"), Err(WsError::Crypto(_))));
    }

    #[test]
    fn json_credentials_roundtrip() {
        let v = vault();
        let creds = serde_json::json!({"username": "svc", "password": "hunter2"});
        let sealed = v.encrypt_json(&creds).unwrap();
        let opened: serde_json::Value = v.decrypt_json(&sealed).unwrap();
        assert_eq!(opened, creds);
    }

    #[test]
    fn password_hash_and_verify() {
        let stored = hash_password("hunter2").unwrap();
        assert!(stored.contains(':'));
        assert!(verify_password("hunter2", &stored).unwrap());
        assert!(!verify_password("hunter3", &stored).unwrap());
    }

    #[test]
    fn password_hashes_use_per_value_salts() {
        let a = hash_password("same").unwrap();
        let b = hash_password("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tokens_are_hex_and_unique() {
        let a = generate_token(24).unwrap();
        let b = generate_token(24).unwrap();
        assert_eq!(a.len(), 48);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn webhook_signature_roundtrip() {
        let body = br#"{"event":"updated"}"#;
        let sig = sign_payload("whsec", body);
        assert!(sig.starts_with("sha256="));
        assert!(verify_signature("whsec", body, &sig));
        assert!(!verify_signature("whsec", body, "sha256=deadbeef"));
        assert!(!verify_signature("other", body, &sig));
    }
}
