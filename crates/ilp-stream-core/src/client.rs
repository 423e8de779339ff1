//! Client bootstrap.
//!
//! Connecting is: bring the plugin up, learn our own ILP address via ILDCP,
//! wire the connection as the plugin's data handler, then probe the path's
//! exchange rate with unfulfillable test packets. The connection only
//! resolves once a rate with three significant digits of precision has been
//! observed; anything less is indistinguishable from an unusable path.

use std::sync::Arc;

use crate::connection::{Connection, ConnectionConfig, ExpiryFn};
use crate::error::Result;
use crate::ildcp;
use crate::plugin::Plugin;

/// Parameters for [`create_connection`]
#[derive(Clone)]
pub struct ConnectOptions {
    /// Destination account from the server's `generate_address_and_secret`
    pub destination_account: String,
    /// Shared secret from the server's `generate_address_and_secret`
    pub shared_secret: [u8; 32],
    /// Exchange-rate slippage tolerance; defaults to 1%
    pub slippage: Option<f64>,
    /// Expiry clock override for outgoing Prepares
    pub get_expiry: Option<ExpiryFn>,
}

impl ConnectOptions {
    /// Options with the defaults filled in.
    #[must_use]
    pub fn new(destination_account: impl Into<String>, shared_secret: [u8; 32]) -> Self {
        Self {
            destination_account: destination_account.into(),
            shared_secret,
            slippage: None,
            get_expiry: None,
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("destination_account", &self.destination_account)
            .field("slippage", &self.slippage)
            .finish()
    }
}

/// Open an outbound STREAM connection.
///
/// # Errors
///
/// Returns `ConnectionError::Connect` when ILDCP fails or no exchange-rate
/// probe achieves three significant digits of precision, and plugin errors
/// when the underlying link is unusable.
pub async fn create_connection(
    plugin: Arc<dyn Plugin>,
    options: ConnectOptions,
) -> Result<Connection> {
    plugin.connect().await?;
    let info = ildcp::fetch(plugin.as_ref()).await?;

    let mut config = ConnectionConfig::default();
    if let Some(slippage) = options.slippage {
        config.slippage = slippage.clamp(0.0, 1.0);
    }
    config.get_expiry = options.get_expiry;

    let connection = Connection::new(
        Arc::clone(&plugin),
        &options.shared_secret,
        false,
        true,
        info.client_address.clone(),
        Some(options.destination_account),
        info.asset_code,
        info.asset_scale,
        None,
        config,
    );
    plugin.register_data_handler(connection.handler())?;

    if let Err(err) = connection.inner.establish_exchange_rate().await {
        plugin.deregister_data_handler();
        return Err(err);
    }
    connection.start();
    tracing::info!(address = %info.client_address, "connection established");
    Ok(connection)
}
