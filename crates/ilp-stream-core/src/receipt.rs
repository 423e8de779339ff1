//! Receipt codec.
//!
//! A receipt is a 58-byte proof that a stream's `total_received` reached a
//! given value, signed with a secret shared between the receiver and a
//! verifier. Layout:
//!
//! ```text
//! [0]       u8   version = 1
//! [1..17]   16B  nonce
//! [17]      u8   stream id (one byte; see `create_receipt`)
//! [18..26]  u64  total_received, big-endian
//! [26..58]  32B  HMAC-SHA256(receipt_secret, bytes[0..26])
//! ```
//!
//! Receivers emit a fresh receipt on every accepted Prepare; a verifier only
//! needs the latest one per stream because `total_received` never decreases.

use ilp_stream_crypto::hmac::{hmac_sha256, hmac_sha256_verify};

use crate::error::ReceiptError;

/// Receipt format version.
pub const RECEIPT_VERSION: u8 = 1;

/// Serialized receipt size.
pub const RECEIPT_SIZE: usize = 58;

/// Receipt nonce size.
pub const RECEIPT_NONCE_SIZE: usize = 16;

const MESSAGE_SIZE: usize = 26;

/// Decoded receipt fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Format version
    pub version: u8,
    /// Nonce binding the receipt to one connection provisioning
    pub nonce: [u8; RECEIPT_NONCE_SIZE],
    /// Stream id (decoded from the one-byte field)
    pub stream_id: u64,
    /// Total received on the stream when the receipt was produced
    pub total_received: u64,
}

/// Build a signed 58-byte receipt.
///
/// The wire layout carries the stream id as a single byte, so ids above 255
/// cannot be represented.
///
/// # Errors
///
/// Returns `ReceiptError::StreamIdTooLarge` when `stream_id > 255`.
pub fn create_receipt(
    nonce: &[u8; RECEIPT_NONCE_SIZE],
    stream_id: u64,
    total_received: u64,
    secret: &[u8; 32],
) -> Result<[u8; RECEIPT_SIZE], ReceiptError> {
    let stream_id_byte =
        u8::try_from(stream_id).map_err(|_| ReceiptError::StreamIdTooLarge(stream_id))?;

    let mut out = [0u8; RECEIPT_SIZE];
    out[0] = RECEIPT_VERSION;
    out[1..17].copy_from_slice(nonce);
    out[17] = stream_id_byte;
    out[18..26].copy_from_slice(&total_received.to_be_bytes());

    let tag = hmac_sha256(secret, &out[..MESSAGE_SIZE]);
    out[26..].copy_from_slice(&tag);
    Ok(out)
}

/// Decode a receipt without verifying its signature.
///
/// # Errors
///
/// Returns `ReceiptError::InvalidLength` for blobs that are not 58 bytes and
/// `ReceiptError::UnsupportedVersion` for unknown versions.
pub fn decode_receipt(blob: &[u8]) -> Result<Receipt, ReceiptError> {
    if blob.len() != RECEIPT_SIZE {
        return Err(ReceiptError::InvalidLength {
            expected: RECEIPT_SIZE,
            actual: blob.len(),
        });
    }
    if blob[0] != RECEIPT_VERSION {
        return Err(ReceiptError::UnsupportedVersion(blob[0]));
    }

    let mut nonce = [0u8; RECEIPT_NONCE_SIZE];
    nonce.copy_from_slice(&blob[1..17]);
    let mut total = [0u8; 8];
    total.copy_from_slice(&blob[18..26]);

    Ok(Receipt {
        version: blob[0],
        nonce,
        stream_id: u64::from(blob[17]),
        total_received: u64::from_be_bytes(total),
    })
}

/// Verify a receipt's signature.
///
/// Returns `false` on any length, version, or HMAC mismatch; never panics.
#[must_use]
pub fn verify_receipt(blob: &[u8], secret: &[u8; 32]) -> bool {
    if blob.len() != RECEIPT_SIZE || blob[0] != RECEIPT_VERSION {
        return false;
    }
    hmac_sha256_verify(secret, &blob[..MESSAGE_SIZE], &blob[MESSAGE_SIZE..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilp_stream_crypto::random::random_32;

    #[test]
    fn test_create_decode_roundtrip() {
        let nonce = [7u8; 16];
        let secret = [9u8; 32];
        let blob = create_receipt(&nonce, 42, 123_456, &secret).unwrap();

        let receipt = decode_receipt(&blob).unwrap();
        assert_eq!(receipt.version, RECEIPT_VERSION);
        assert_eq!(receipt.nonce, nonce);
        assert_eq!(receipt.stream_id, 42);
        assert_eq!(receipt.total_received, 123_456);
    }

    #[test]
    fn test_fixture_zero_nonce_and_secret() {
        // create(nonce=16x00, streamId=1, totalReceived=500, secret=32x00)
        let blob = create_receipt(&[0u8; 16], 1, 500, &[0u8; 32]).unwrap();
        assert_eq!(blob.len(), RECEIPT_SIZE);
        assert_eq!(blob[0], 1);
        assert_eq!(&blob[1..17], &[0u8; 16]);
        assert_eq!(blob[17], 1);
        assert_eq!(&blob[18..26], &500u64.to_be_bytes());

        assert!(verify_receipt(&blob, &[0u8; 32]));

        let random_secret = random_32().unwrap();
        assert!(!verify_receipt(&blob, &random_secret));
    }

    #[test]
    fn test_stream_id_one_byte_limit() {
        assert!(create_receipt(&[0u8; 16], 255, 0, &[0u8; 32]).is_ok());
        assert_eq!(
            create_receipt(&[0u8; 16], 256, 0, &[0u8; 32]),
            Err(ReceiptError::StreamIdTooLarge(256))
        );
    }

    #[test]
    fn test_decode_length_check() {
        assert_eq!(
            decode_receipt(&[0u8; 57]),
            Err(ReceiptError::InvalidLength {
                expected: 58,
                actual: 57
            })
        );
        assert_eq!(
            decode_receipt(&[0u8; 59]),
            Err(ReceiptError::InvalidLength {
                expected: 58,
                actual: 59
            })
        );
    }

    #[test]
    fn test_decode_version_check() {
        let mut blob = create_receipt(&[0u8; 16], 1, 1, &[0u8; 32]).unwrap();
        blob[0] = 2;
        assert_eq!(decode_receipt(&blob), Err(ReceiptError::UnsupportedVersion(2)));
        assert!(!verify_receipt(&blob, &[0u8; 32]));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let secret = [5u8; 32];
        let mut blob = create_receipt(&[1u8; 16], 2, 1000, &secret).unwrap();
        assert!(verify_receipt(&blob, &secret));

        // Bump total_received without re-signing.
        blob[25] ^= 0x01;
        assert!(!verify_receipt(&blob, &secret));
    }

    #[test]
    fn test_verify_never_panics_on_garbage() {
        assert!(!verify_receipt(&[], &[0u8; 32]));
        assert!(!verify_receipt(&[0xFF; 13], &[0u8; 32]));
        assert!(!verify_receipt(&[0xFF; 58], &[0u8; 32]));
    }
}
