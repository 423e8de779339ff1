//! # ilp-stream-core
//!
//! Core protocol implementation for STREAM, a transport carried inside
//! Interledger packets. A client and a server share a 32-byte secret and
//! multiplex bidirectional streams of money and data over a single logical
//! connection.
//!
//! This crate provides:
//! - Packet and frame codec (OER var-uints, unknown-frame skip)
//! - 58-byte signed receipts
//! - Offset reassembly for out-of-order stream data
//! - Stream accounting and flow control
//! - The connection state machine (single Prepare in flight, MPPA
//!   discovery, exchange-rate probing, AIMD pacing)
//! - The server routing pool and client bootstrap
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Connection                               │
//! │  (shared-secret session over ILP Prepare/Fulfill/Reject)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Streams                                  │
//! │  (multiplexed money + data channels, share-based allocation)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Packets & Frames                         │
//! │  (AES-256-GCM sealed, condition-bound to the ILP layer)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod client;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod ildcp;
pub mod ilp;
pub mod oer;
pub mod packet;
pub mod plugin;
pub mod reassembly;
pub mod receipt;
pub mod server;
pub mod stream;

pub use client::{create_connection, ConnectOptions};
pub use connection::{
    Connection, ConnectionConfig, ConnectionState, ConnectionStats, ExpiryFn, TARGET_PACKET_SIZE,
};
pub use error::{ConnectionError, ErrorCode, PacketError, PluginError, ReceiptError, Result};
pub use packet::{Frame, FrameType, IlpPacketType, Packet, STREAM_VERSION};
pub use plugin::{DataHandler, Plugin};
pub use reassembly::Reassembler;
pub use receipt::{
    create_receipt, decode_receipt, verify_receipt, Receipt, RECEIPT_SIZE, RECEIPT_VERSION,
};
pub use server::StreamServer;
pub use stream::{ReceiveMax, Stream, StreamEvent, StreamState};
