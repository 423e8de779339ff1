//! HMAC-SHA256 and the STREAM key-derivation scheme.
//!
//! All keys used by a connection are derived from the 32-byte shared secret
//! with fixed context strings:
//! - `ilp_stream_encryption` → packet encryption key
//! - `ilp_stream_fulfillment` → fulfillment key
//!
//! Server-side, per-token shared secrets are derived from a server-wide seed
//! with the `ilp_stream_shared_secret` context, and receipt secrets are
//! derived from a receipt seed keyed by the receipt nonce.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::aead::EncryptionKey;
use crate::{ENCRYPTION_KEY_CONTEXT, FULFILLMENT_KEY_CONTEXT, SHARED_SECRET_CONTEXT};

type HmacSha256 = Hmac<Sha256>;

/// Compute `HMAC-SHA256(key, message)`.
#[must_use]
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Verify `tag == HMAC-SHA256(key, message)` in constant time.
#[must_use]
pub fn hmac_sha256_verify(key: &[u8], message: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.verify_slice(tag).is_ok()
}

/// Compute SHA-256 of `data`.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    digest.into()
}

/// Derive the AES-256-GCM packet encryption key from the shared secret.
#[must_use]
pub fn derive_encryption_key(shared_secret: &[u8; 32]) -> EncryptionKey {
    EncryptionKey::new(hmac_sha256(shared_secret, ENCRYPTION_KEY_CONTEXT))
}

/// Derive the fulfillment key from the shared secret.
#[must_use]
pub fn derive_fulfillment_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    hmac_sha256(shared_secret, FULFILLMENT_KEY_CONTEXT)
}

/// Compute the fulfillment for a packet ciphertext.
///
/// The returned preimage is only revealed by a receiver that accepts the
/// packet; rejecting never discloses it.
#[must_use]
pub fn fulfillment(fulfillment_key: &[u8; 32], ciphertext: &[u8]) -> [u8; 32] {
    hmac_sha256(fulfillment_key, ciphertext)
}

/// Compute the execution condition for a fulfillment.
#[must_use]
pub fn condition(fulfillment: &[u8; 32]) -> [u8; 32] {
    sha256(fulfillment)
}

/// Derive a per-token shared secret from a server-wide seed.
///
/// `token_bytes` is the full ASCII token segment of the destination address,
/// including any `~tag` suffix, so any alteration of the token in flight
/// yields a different secret and the packet fails to decrypt.
#[must_use]
pub fn derive_shared_secret(server_secret: &[u8; 32], token_bytes: &[u8]) -> [u8; 32] {
    let intermediate = hmac_sha256(server_secret, SHARED_SECRET_CONTEXT);
    hmac_sha256(&intermediate, token_bytes)
}

/// Derive a receipt secret from a receipt seed and the 16-byte receipt nonce.
#[must_use]
pub fn derive_receipt_secret(receipt_seed: &[u8; 32], nonce: &[u8; 16]) -> [u8; 32] {
    hmac_sha256(receipt_seed, nonce)
}
