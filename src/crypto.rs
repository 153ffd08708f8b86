//! Per-pair encryption for direct messages.
//!
//! Each process generates one X25519 key pair per run and advertises the
//! public half through discovery. A direct message is encrypted with
//! AES-256-CBC under the SHA-256 digest of the Diffie-Hellman shared
//! secret, and shipped as `hex(iv):hex(ciphertext)`. Both ends derive the
//! same key from their own secret and the other side's public key, so no
//! key material ever crosses the wire beyond the public keys themselves.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Byte length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// AES block / IV length.
const IV_LEN: usize = 16;

/// Separates the hex-encoded IV from the hex-encoded ciphertext.
const BLOB_DELIMITER: char = ':';

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed encrypted blob: {0}")]
    Format(&'static str),

    #[error("invalid public key: {0}")]
    Key(&'static str),
}

/// Result of decrypting a blob that parsed correctly.
///
/// A wrong key or corrupted ciphertext is not an error: callers render
/// the sentinel instead of crashing on hostile or stale input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decrypted {
    Plaintext(String),
    Undecryptable,
}

/// Holds this run's key pair and performs all direct-message crypto.
pub struct CryptoEngine {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl CryptoEngine {
    /// Generate a fresh key pair for this process lifetime. Nothing is
    /// persisted: discovery advertises a new key each run.
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public key as advertised in discovery datagrams.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Encrypt `plaintext` for the holder of `recipient_public_hex`.
    pub fn encrypt(
        &self,
        plaintext: &str,
        recipient_public_hex: &str,
    ) -> Result<String, CryptoError> {
        let key = self.shared_key(recipient_public_hex)?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|_| CryptoError::Key("bad key or iv length"))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(format!(
            "{}{}{}",
            hex::encode(iv),
            BLOB_DELIMITER,
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt a blob produced by the holder of `sender_public_hex`.
    ///
    /// A blob that does not parse (missing delimiter, bad hex, wrong IV
    /// length) is a [`CryptoError::Format`]. A blob that parses but does
    /// not decrypt yields [`Decrypted::Undecryptable`].
    pub fn decrypt(&self, blob: &str, sender_public_hex: &str) -> Result<Decrypted, CryptoError> {
        let (iv_hex, ct_hex) = blob
            .split_once(BLOB_DELIMITER)
            .ok_or(CryptoError::Format("missing delimiter"))?;

        let iv = hex::decode(iv_hex).map_err(|_| CryptoError::Format("iv is not hex"))?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::Format("iv has wrong length"));
        }
        let ciphertext =
            hex::decode(ct_hex).map_err(|_| CryptoError::Format("ciphertext is not hex"))?;
        if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
            return Err(CryptoError::Format("ciphertext is not block-aligned"));
        }

        let key = self.shared_key(sender_public_hex)?;
        let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
            .map_err(|_| CryptoError::Key("bad key or iv length"))?;

        match cipher.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext) {
            Ok(plaintext) => match String::from_utf8(plaintext) {
                Ok(text) => Ok(Decrypted::Plaintext(text)),
                Err(_) => Ok(Decrypted::Undecryptable),
            },
            Err(_) => Ok(Decrypted::Undecryptable),
        }
    }

    /// ECDH with the given public key, digested into an AES-256 key.
    fn shared_key(&self, public_hex: &str) -> Result<[u8; 32], CryptoError> {
        let bytes = hex::decode(public_hex).map_err(|_| CryptoError::Key("not hex"))?;
        let bytes: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::Key("wrong length"))?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        Ok(Sha256::digest(shared.as_bytes()).into())
    }
}

impl Default for CryptoEngine {
    fn default() -> Self {
        Self::new()
    }
}
