//! AES-256-GCM packet envelope.
//!
//! STREAM packets are encrypted under a key derived from the shared secret.
//! The envelope layout is `iv (12) ‖ auth_tag (16) ‖ ciphertext`, a fixed
//! 28-byte overhead. The IV is freshly random for every call, so the same
//! plaintext never produces the same envelope twice.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::{ENCRYPTION_OVERHEAD, IV_SIZE, TAG_SIZE};

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// AES-256-GCM packet encryption key.
///
/// Key material is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Encrypt a plaintext into an `iv ‖ tag ‖ ciphertext` envelope.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RandomFailed` if IV generation fails and
    /// `CryptoError::EncryptionFailed` if the AEAD rejects the input.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));

        let mut iv = [0u8; IV_SIZE];
        crate::random::fill_random(&mut iv)?;

        let mut buf = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buf)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(ENCRYPTION_OVERHEAD + buf.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&buf);
        Ok(out)
    }

    /// Decrypt an `iv ‖ tag ‖ ciphertext` envelope.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` if the envelope is shorter
    /// than the 28-byte overhead or the authentication tag does not match.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < ENCRYPTION_OVERHEAD {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let (iv, rest) = envelope.split_at(IV_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let mut buf = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(iv),
                b"",
                &mut buf,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = EncryptionKey::new([0x42; KEY_SIZE]);
        let plaintext = b"some stream packet bytes";

        let envelope = key.encrypt(plaintext).unwrap();
        assert_eq!(envelope.len(), plaintext.len() + ENCRYPTION_OVERHEAD);

        let decrypted = key.decrypt(&envelope).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_roundtrip_empty() {
        let key = EncryptionKey::new([1u8; KEY_SIZE]);
        let envelope = key.encrypt(b"").unwrap();
        assert_eq!(envelope.len(), ENCRYPTION_OVERHEAD);
        assert_eq!(key.decrypt(&envelope).unwrap(), b"");
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let key = EncryptionKey::new([2u8; KEY_SIZE]);
        let a = key.encrypt(b"same plaintext").unwrap();
        let b = key.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_envelope_rejected() {
        let key = EncryptionKey::new([3u8; KEY_SIZE]);
        assert_eq!(
            key.decrypt(&[0u8; ENCRYPTION_OVERHEAD - 1]),
            Err(CryptoError::DecryptionFailed)
        );
        assert_eq!(key.decrypt(&[]), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let key = EncryptionKey::new([4u8; KEY_SIZE]);
        let mut envelope = key.encrypt(b"payload").unwrap();

        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        assert_eq!(key.decrypt(&envelope), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = EncryptionKey::new([5u8; KEY_SIZE]);
        let other = EncryptionKey::new([6u8; KEY_SIZE]);
        let envelope = key.encrypt(b"payload").unwrap();
        assert_eq!(other.decrypt(&envelope), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_from_slice_length_check() {
        assert!(EncryptionKey::from_slice(&[0u8; 32]).is_ok());
        assert!(matches!(
            EncryptionKey::from_slice(&[0u8; 31]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            })
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_roundtrip(key in any::<[u8; 32]>(), plaintext in prop::collection::vec(any::<u8>(), 0..2048)) {
                let key = EncryptionKey::new(key);
                let envelope = key.encrypt(&plaintext).unwrap();
                prop_assert_eq!(key.decrypt(&envelope).unwrap(), plaintext);
            }

            #[test]
            fn prop_decrypt_garbage_doesnt_panic(blob in prop::collection::vec(any::<u8>(), 0..256)) {
                let key = EncryptionKey::new([0u8; 32]);
                let _ = key.decrypt(&blob);
            }
        }
    }
}
