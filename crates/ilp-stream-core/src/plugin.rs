//! Plugin seam.
//!
//! A plugin is the underlying ILP link: it forwards raw ILP packet bytes
//! toward the network and delivers inbound packets to a single registered
//! data handler, returning the handler's reply bytes synchronously to the
//! caller. Ledger settlement, routing, and connectivity live behind this
//! trait and are out of scope for this crate.

use std::sync::Arc;

use async_trait::async_trait;

pub use crate::error::PluginError;

/// Result type for plugin operations
pub type PluginResult<T> = Result<T, PluginError>;

/// Receives inbound ILP packets and produces reply packets.
///
/// Implemented by connections and by the server routing pool.
#[async_trait]
pub trait DataHandler: Send + Sync {
    /// Handle one inbound ILP packet, returning the reply packet bytes
    /// (a Fulfill or Reject for an inbound Prepare).
    async fn handle_data(&self, data: Vec<u8>) -> PluginResult<Vec<u8>>;
}

/// An ILP link that can send packets and deliver inbound ones.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Connect the underlying link.
    async fn connect(&self) -> PluginResult<()>;

    /// Disconnect the underlying link.
    async fn disconnect(&self) -> PluginResult<()>;

    /// True when the link is usable.
    fn is_connected(&self) -> bool;

    /// Send one ILP packet and await the reply packet bytes.
    async fn send_data(&self, data: Vec<u8>) -> PluginResult<Vec<u8>>;

    /// Register the single data handler for inbound packets.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::HandlerAlreadyRegistered` if one is installed.
    fn register_data_handler(&self, handler: Arc<dyn DataHandler>) -> PluginResult<()>;

    /// Remove the registered data handler, if any.
    fn deregister_data_handler(&self);
}
