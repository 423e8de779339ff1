//! Server routing pool.
//!
//! A server hands out `(destination_account, shared_secret)` pairs whose
//! address embeds a base64url token, then routes every inbound Prepare to
//! the connection owning that token. The per-connection shared secret is
//! derived from a server-wide seed, so the pool holds no per-client secret
//! state: a token that was tampered with in flight derives a different key,
//! the packet fails to decrypt, and the sender sees it as unreachable.
//!
//! # Routing
//!
//! ```text
//! destination = <server_address>.<token>[~<tag>][.rest...]
//! shared_secret = HMAC(HMAC(server_secret, "ilp_stream_shared_secret"), token)
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};

use ilp_stream_crypto::hmac::{derive_encryption_key, derive_shared_secret};
use ilp_stream_crypto::random;
use zeroize::Zeroizing;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{ConnectionError, PluginError, Result};
use crate::ildcp;
use crate::ilp::{codes, IlpPacket, Prepare, Reject};
use crate::plugin::{DataHandler, Plugin};

/// Length of the random token embedded in destination addresses.
const TOKEN_LENGTH: usize = 18;

/// Receipt parameters provisioned for one token
#[derive(Clone)]
struct ReceiptParams {
    nonce: [u8; 16],
    secret: [u8; 32],
}

struct ServerInner {
    plugin: Arc<dyn Plugin>,
    server_secret: Zeroizing<[u8; 32]>,
    connection_config: ConnectionConfig,
    /// Learned via ILDCP on `listen`
    address: RwLock<Option<String>>,
    asset: RwLock<Option<(String, u8)>>,
    /// token → connection
    connections: DashMap<String, Connection>,
    /// token → receipt provisioning
    receipts: DashMap<String, ReceiptParams>,
    accept_tx: mpsc::UnboundedSender<Connection>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<Connection>>,
}

/// Accepts STREAM connections and routes inbound packets by token
#[derive(Clone)]
pub struct StreamServer {
    inner: Arc<ServerInner>,
}

struct ServerHandler(Arc<ServerInner>);

#[async_trait::async_trait]
impl DataHandler for ServerHandler {
    async fn handle_data(&self, data: Vec<u8>) -> std::result::Result<Vec<u8>, PluginError> {
        match IlpPacket::decode(&data) {
            Ok(IlpPacket::Prepare(prepare)) => {
                Ok(StreamServer::handle_prepare(&self.0, prepare).await.encode())
            }
            Ok(_) => Err(PluginError::send("expected an ILP Prepare")),
            Err(err) => {
                // Malformed inbound packets reject with a bare F00: the
                // parse detail stays in the logs, not on the wire.
                tracing::debug!(%err, "failed to parse inbound ILP packet");
                Ok(IlpPacket::Reject(Reject {
                    code: codes::F00_BAD_REQUEST.to_string(),
                    triggered_by: String::new(),
                    message: String::new(),
                    data: Vec::new(),
                })
                .encode())
            }
        }
    }
}

/// Connection tags may only use the address-safe characters that survive an
/// ILP address segment.
fn is_valid_connection_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'~')
}

fn unreachable_reject() -> IlpPacket {
    IlpPacket::Reject(Reject {
        code: codes::F02_UNREACHABLE.to_string(),
        triggered_by: String::new(),
        message: String::new(),
        data: Vec::new(),
    })
}

fn unexpected_payment_reject() -> IlpPacket {
    IlpPacket::Reject(Reject {
        code: codes::F06_UNEXPECTED_PAYMENT.to_string(),
        triggered_by: String::new(),
        message: String::new(),
        data: Vec::new(),
    })
}

impl StreamServer {
    /// Create a server over `plugin` with a 32-byte secret seed.
    #[must_use]
    pub fn new(plugin: Arc<dyn Plugin>, server_secret: [u8; 32]) -> Self {
        Self::with_config(plugin, server_secret, ConnectionConfig::default())
    }

    /// Create a server with custom per-connection configuration.
    #[must_use]
    pub fn with_config(
        plugin: Arc<dyn Plugin>,
        server_secret: [u8; 32],
        connection_config: ConnectionConfig,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ServerInner {
                plugin,
                server_secret: Zeroizing::new(server_secret),
                connection_config,
                address: RwLock::new(None),
                asset: RwLock::new(None),
                connections: DashMap::new(),
                receipts: DashMap::new(),
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
            }),
        }
    }

    /// Connect the plugin, resolve this server's ILP address via ILDCP, and
    /// start accepting packets.
    ///
    /// # Errors
    ///
    /// Returns plugin and ILDCP failures.
    pub async fn listen(&self) -> Result<()> {
        self.inner.plugin.connect().await?;
        let info = ildcp::fetch(self.inner.plugin.as_ref()).await?;
        *self.inner.address.write().await = Some(info.client_address.clone());
        *self.inner.asset.write().await = Some((info.asset_code, info.asset_scale));
        self.inner
            .plugin
            .register_data_handler(Arc::new(ServerHandler(Arc::clone(&self.inner))))?;
        tracing::info!(address = %info.client_address, "stream server listening");
        Ok(())
    }

    /// This server's ILP address, once listening.
    pub async fn address(&self) -> Option<String> {
        self.inner.address.read().await.clone()
    }

    /// Generate a destination account and shared secret for one client.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::InvalidConnectionTag` for tags with
    /// characters outside `[A-Za-z0-9_\-~]`, and `ConnectionError::Connect`
    /// when the server is not listening yet.
    pub async fn generate_address_and_secret(
        &self,
        connection_tag: Option<&str>,
    ) -> Result<(String, [u8; 32])> {
        self.generate_address_and_secret_inner(connection_tag, None)
            .await
    }

    /// Like [`Self::generate_address_and_secret`], additionally provisioning
    /// receipts: every fulfilled packet on the resulting connection carries
    /// a `StreamReceipt` signed with `receipt_secret`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::generate_address_and_secret`].
    pub async fn generate_address_and_secret_with_receipts(
        &self,
        connection_tag: Option<&str>,
        receipt_nonce: [u8; 16],
        receipt_secret: [u8; 32],
    ) -> Result<(String, [u8; 32])> {
        self.generate_address_and_secret_inner(
            connection_tag,
            Some(ReceiptParams {
                nonce: receipt_nonce,
                secret: receipt_secret,
            }),
        )
        .await
    }

    async fn generate_address_and_secret_inner(
        &self,
        connection_tag: Option<&str>,
        receipts: Option<ReceiptParams>,
    ) -> Result<(String, [u8; 32])> {
        let address = self.inner.address.read().await.clone().ok_or_else(|| {
            ConnectionError::Connect("server is not listening".to_string())
        })?;

        let mut token_bytes = [0u8; TOKEN_LENGTH];
        random::fill_random(&mut token_bytes).map_err(ConnectionError::Crypto)?;
        let mut token = URL_SAFE_NO_PAD.encode(token_bytes);

        if let Some(tag) = connection_tag {
            if !is_valid_connection_tag(tag) {
                return Err(ConnectionError::InvalidConnectionTag);
            }
            token.push('~');
            token.push_str(tag);
        }

        let shared_secret = derive_shared_secret(&self.inner.server_secret, token.as_bytes());
        if let Some(params) = receipts {
            self.inner.receipts.insert(token.clone(), params);
        }
        Ok((format!("{address}.{token}"), shared_secret))
    }

    /// Receive the next connection a client opened. Returns `None` once the
    /// server is closed.
    pub async fn accept_connection(&self) -> Option<Connection> {
        self.inner.accept_rx.lock().await.recv().await
    }

    /// Number of live connections in the pool.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Stop accepting packets and close every connection.
    pub async fn close(&self) {
        self.inner.plugin.deregister_data_handler();
        let connections: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            if let Err(err) = connection.end().await {
                tracing::warn!(%err, "error closing connection");
            }
        }
        self.inner.connections.clear();
        tracing::info!("stream server closed");
    }

    async fn handle_prepare(inner: &Arc<ServerInner>, prepare: Prepare) -> IlpPacket {
        let Some(address) = inner.address.read().await.clone() else {
            return unreachable_reject();
        };

        // destination = <address>.<token>[.rest...]
        let token = prepare
            .destination
            .strip_prefix(&address)
            .and_then(|rest| rest.strip_prefix('.'))
            .map(|local| local.split('.').next().unwrap_or(""))
            .unwrap_or("");
        if token.is_empty() {
            tracing::debug!(destination = %prepare.destination, "no token in destination");
            return unreachable_reject();
        }

        if let Some(connection) = inner.connections.get(token).map(|c| c.clone()) {
            return connection.inner.handle_prepare(prepare).await;
        }

        // New token: derive its secret and make sure the packet actually
        // decrypts before a connection exists or anyone hears about it.
        let shared_secret = derive_shared_secret(&inner.server_secret, token.as_bytes());
        if derive_encryption_key(&shared_secret)
            .decrypt(&prepare.data)
            .is_err()
        {
            tracing::debug!(token, "packet for unknown token did not decrypt");
            return unexpected_payment_reject();
        }

        let Some((asset_code, asset_scale)) = inner.asset.read().await.clone() else {
            return unreachable_reject();
        };
        let connection_tag = token.split_once('~').map(|(_, tag)| tag.to_string());
        let mut config = inner.connection_config.clone();
        if let Some(params) = inner.receipts.get(token) {
            config.receipt_nonce = Some(params.nonce);
            config.receipt_secret = Some(params.secret);
        }

        let connection = Connection::new(
            Arc::clone(&inner.plugin),
            &shared_secret,
            true,
            false,
            format!("{address}.{token}"),
            None,
            asset_code,
            asset_scale,
            connection_tag,
            config,
        );
        connection.start();
        inner
            .connections
            .insert(token.to_string(), connection.clone());
        let _ = inner.accept_tx.send(connection.clone());
        tracing::info!(token = %hex::encode(&token.as_bytes()[..8.min(token.len())]), "accepted new connection");

        connection.inner.handle_prepare(prepare).await
    }
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tag_validation() {
        assert!(is_valid_connection_tag("abc_DEF-123~x"));
        assert!(!is_valid_connection_tag(""));
        assert!(!is_valid_connection_tag("invalid\n"));
        assert!(!is_valid_connection_tag("has space"));
        assert!(!is_valid_connection_tag("dot.dot"));
    }

    #[test]
    fn test_token_secret_depends_on_full_token() {
        let seed = [1u8; 32];
        let with_tag = derive_shared_secret(&seed, b"token~tag");
        let without = derive_shared_secret(&seed, b"token");
        assert_ne!(with_tag, without);
    }
}
