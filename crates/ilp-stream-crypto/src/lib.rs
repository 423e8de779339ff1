//! # ilp-stream-crypto
//!
//! Cryptographic primitives for the STREAM transport protocol.
//!
//! This crate provides:
//! - HMAC-SHA256 and the STREAM key-derivation contexts
//! - AES-256-GCM packet envelope (`iv ‖ tag ‖ ciphertext`)
//! - Fulfillment/condition computation for conditional payments
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | MAC / KDF | HMAC-SHA256 |
//! | AEAD | AES-256-GCM |
//! | Condition hash | SHA-256 |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod hmac;
pub mod random;

pub use aead::EncryptionKey;
pub use error::CryptoError;

/// Shared secret size (32 bytes).
pub const SHARED_SECRET_SIZE: usize = 32;

/// AES-256-GCM IV size (12 bytes).
pub const IV_SIZE: usize = 12;

/// AES-256-GCM authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Total envelope overhead added by [`EncryptionKey::encrypt`].
pub const ENCRYPTION_OVERHEAD: usize = IV_SIZE + TAG_SIZE;

/// HMAC context for deriving the packet encryption key from the shared secret.
pub const ENCRYPTION_KEY_CONTEXT: &[u8] = b"ilp_stream_encryption";

/// HMAC context for deriving the fulfillment key from the shared secret.
pub const FULFILLMENT_KEY_CONTEXT: &[u8] = b"ilp_stream_fulfillment";

/// HMAC context for deriving per-token shared secrets from a server seed.
pub const SHARED_SECRET_CONTEXT: &[u8] = b"ilp_stream_shared_secret";
