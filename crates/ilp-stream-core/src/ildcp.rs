//! ILDCP client.
//!
//! Interledger Dynamic Configuration Protocol: one zero-amount Prepare to
//! the `peer.config` address, carrying the fixed peer-protocol condition.
//! The Fulfill reply body is `{varStr client_address, u8 asset_scale,
//! varStr asset_code}`.

use chrono::{Duration, Utc};

use crate::error::{ConnectionError, PacketError};
use crate::ilp::{peer_protocol_condition, IlpPacket, Prepare};
use crate::oer::Reader;
use crate::plugin::Plugin;

/// Destination address of the ILDCP service.
pub const ILDCP_DESTINATION: &str = "peer.config";

/// Configuration returned by the upstream peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IldcpInfo {
    /// This node's ILP address as seen by the peer
    pub client_address: String,
    /// Asset scale of the shared ledger
    pub asset_scale: u8,
    /// Asset code of the shared ledger
    pub asset_code: String,
}

impl IldcpInfo {
    /// Decode an ILDCP fulfill body.
    ///
    /// # Errors
    ///
    /// Returns codec errors for malformed bodies.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(data);
        Ok(Self {
            client_address: r.read_var_string()?,
            asset_scale: r.read_u8()?,
            asset_code: r.read_var_string()?,
        })
    }

    /// Encode an ILDCP fulfill body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = crate::oer::Writer::new();
        w.write_var_string(&self.client_address);
        w.write_u8(self.asset_scale);
        w.write_var_string(&self.asset_code);
        w.into_inner()
    }
}

/// Fetch this node's address and asset details from the upstream peer.
///
/// # Errors
///
/// Returns `ConnectionError::Connect` when the peer rejects the request or
/// the reply is malformed.
pub async fn fetch(plugin: &dyn Plugin) -> Result<IldcpInfo, ConnectionError> {
    let request = IlpPacket::Prepare(Prepare {
        amount: 0,
        expires_at: Utc::now() + Duration::seconds(30),
        execution_condition: peer_protocol_condition(),
        destination: ILDCP_DESTINATION.to_string(),
        data: Vec::new(),
    });

    let response = plugin.send_data(request.encode()).await?;
    match IlpPacket::decode(&response)? {
        IlpPacket::Fulfill(fulfill) => {
            let info = IldcpInfo::decode(&fulfill.data)?;
            tracing::debug!(
                address = %info.client_address,
                asset = %info.asset_code,
                scale = info.asset_scale,
                "fetched ILDCP configuration"
            );
            Ok(info)
        }
        IlpPacket::Reject(reject) => Err(ConnectionError::Connect(format!(
            "ILDCP request rejected with {}: {}",
            reject.code, reject.message
        ))),
        IlpPacket::Prepare(_) => Err(ConnectionError::Connect(
            "ILDCP reply was not a Fulfill or Reject".to_string(),
        )),
    }
}
