//! # ilp-stream
//!
//! STREAM transport for Interledger: a client and a server share a 32-byte
//! secret and multiplex bidirectional streams of money and data over ILP
//! `Prepare`/`Fulfill`/`Reject` packets.
//!
//! This facade crate re-exports the workspace members:
//! - [`ilp_stream_core`] — packet and frame codec, receipts, streams,
//!   connections, server pool, and client bootstrap.
//! - [`ilp_stream_crypto`] (as [`crypto`]) — HMAC-SHA256 key derivation and
//!   the AES-256-GCM packet envelope.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use ilp_stream_core::*;

/// Cryptographic primitives (re-export of `ilp-stream-crypto`).
pub use ilp_stream_crypto as crypto;
