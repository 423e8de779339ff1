//! ILP packet codec.
//!
//! The plugin interface carries raw ILP packets: `Prepare` (type 12),
//! `Fulfill` (type 13), and `Reject` (type 14), each enveloped as
//! `[u8 type][varOctetString contents]`. Amounts are fixed eight-byte
//! big-endian integers; the Prepare expiry is a 17-byte UTC timestamp in
//! `YYYYMMDDHHMMSSmmm` form.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::PacketError;
use crate::oer::{Reader, Writer};
use crate::packet::IlpPacketType;

/// ILP reject codes used by this crate
pub mod codes {
    /// Generic sender error
    pub const F00_BAD_REQUEST: &str = "F00";
    /// No route to the destination
    pub const F02_UNREACHABLE: &str = "F02";
    /// Payment the receiver did not expect (or could not decrypt)
    pub const F06_UNEXPECTED_PAYMENT: &str = "F06";
    /// Packet amount exceeds a path maximum
    pub const F08_AMOUNT_TOO_LARGE: &str = "F08";
    /// Application-level rejection carrying a STREAM reply
    pub const F99_APPLICATION_ERROR: &str = "F99";
    /// Temporary internal failure
    pub const T00_INTERNAL_ERROR: &str = "T00";
    /// Transfer timed out before a response arrived
    pub const R00_TRANSFER_TIMED_OUT: &str = "R00";
}

/// Class of an ILP reject code, by its first character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectClass {
    /// `F*`: final, do not retry (except the `F08` sizing hint)
    Final,
    /// `T*`: temporary, retry with backoff
    Temporary,
    /// `R*`: relative (timing), not retried by this crate
    Relative,
    /// Anything else (malformed code)
    Unknown,
}

/// Classify an ILP reject code string.
#[must_use]
pub fn reject_class(code: &str) -> RejectClass {
    match code.as_bytes().first() {
        Some(b'F') => RejectClass::Final,
        Some(b'T') => RejectClass::Temporary,
        Some(b'R') => RejectClass::Relative,
        _ => RejectClass::Unknown,
    }
}

/// The fixed condition used by peer-protocol packets (ILDCP).
///
/// Its preimage is 32 zero bytes, so any peer can fulfill it.
#[must_use]
pub fn peer_protocol_condition() -> [u8; 32] {
    ilp_stream_crypto::hmac::sha256(&[0u8; 32])
}

/// ILP Prepare packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    /// Source amount, in the sender's units
    pub amount: u64,
    /// Expiry after which the packet must be rejected
    pub expires_at: DateTime<Utc>,
    /// SHA-256 condition the fulfillment must hash to
    pub execution_condition: [u8; 32],
    /// Destination ILP address
    pub destination: String,
    /// Opaque end-to-end data (the encrypted STREAM packet)
    pub data: Vec<u8>,
}

/// ILP Fulfill packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfill {
    /// 32-byte preimage of the Prepare's condition
    pub fulfillment: [u8; 32],
    /// Opaque end-to-end data (the encrypted STREAM reply)
    pub data: Vec<u8>,
}

/// ILP Reject packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// Three-character error code (`F..`/`T..`/`R..`)
    pub code: String,
    /// ILP address of the rejecting node (may be empty)
    pub triggered_by: String,
    /// Human-readable message (may be empty)
    pub message: String,
    /// Opaque data (the encrypted STREAM reply, or an `F08` hint)
    pub data: Vec<u8>,
}

/// Any ILP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IlpPacket {
    /// Prepare (12)
    Prepare(Prepare),
    /// Fulfill (13)
    Fulfill(Fulfill),
    /// Reject (14)
    Reject(Reject),
}

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const TIMESTAMP_LEN: usize = 17;

fn write_timestamp(w: &mut Writer, when: &DateTime<Utc>) {
    let formatted = when.format(TIMESTAMP_FORMAT).to_string();
    debug_assert_eq!(formatted.len(), TIMESTAMP_LEN);
    w.write_bytes(formatted.as_bytes());
}

fn read_timestamp(r: &mut Reader<'_>) -> Result<DateTime<Utc>, PacketError> {
    let raw = r.read_bytes(TIMESTAMP_LEN)?;
    let s = std::str::from_utf8(raw).map_err(|_| PacketError::InvalidTimestamp)?;
    let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|_| PacketError::InvalidTimestamp)?;
    Ok(naive.and_utc())
}

impl IlpPacket {
    /// Packet type byte.
    #[must_use]
    pub fn packet_type(&self) -> IlpPacketType {
        match self {
            Self::Prepare(_) => IlpPacketType::Prepare,
            Self::Fulfill(_) => IlpPacketType::Fulfill,
            Self::Reject(_) => IlpPacketType::Reject,
        }
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut contents = Writer::new();
        match self {
            Self::Prepare(p) => {
                contents.write_u64(p.amount);
                write_timestamp(&mut contents, &p.expires_at);
                contents.write_bytes(&p.execution_condition);
                contents.write_var_string(&p.destination);
                contents.write_var_octet_string(&p.data);
            }
            Self::Fulfill(f) => {
                contents.write_bytes(&f.fulfillment);
                contents.write_var_octet_string(&f.data);
            }
            Self::Reject(r) => {
                contents.write_bytes(r.code.as_bytes());
                contents.write_var_string(&r.triggered_by);
                contents.write_var_string(&r.message);
                contents.write_var_octet_string(&r.data);
            }
        }

        let mut w = Writer::new();
        w.write_u8(self.packet_type() as u8);
        w.write_var_octet_string(&contents.into_inner());
        w.into_inner()
    }

    /// Deserialize from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::InvalidPacketType` for unknown type bytes and
    /// codec errors for malformed contents.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let mut outer = Reader::new(data);
        let packet_type = IlpPacketType::try_from(outer.read_u8()?)?;
        let contents = outer.read_var_octet_string()?;
        let mut r = Reader::new(contents);

        match packet_type {
            IlpPacketType::Prepare => {
                let amount = r.read_u64()?;
                let expires_at = read_timestamp(&mut r)?;
                let execution_condition = r.read_fixed::<32>()?;
                let destination = r.read_var_string()?;
                let data = r.read_var_octet_string()?.to_vec();
                Ok(Self::Prepare(Prepare {
                    amount,
                    expires_at,
                    execution_condition,
                    destination,
                    data,
                }))
            }
            IlpPacketType::Fulfill => {
                let fulfillment = r.read_fixed::<32>()?;
                let data = r.read_var_octet_string()?.to_vec();
                Ok(Self::Fulfill(Fulfill { fulfillment, data }))
            }
            IlpPacketType::Reject => {
                let code_bytes = r.read_bytes(3)?;
                let code =
                    std::str::from_utf8(code_bytes).map_err(|_| PacketError::InvalidUtf8)?;
                let triggered_by = r.read_var_string()?;
                let message = r.read_var_string()?;
                let data = r.read_var_octet_string()?.to_vec();
                Ok(Self::Reject(Reject {
                    code: code.to_string(),
                    triggered_by,
                    message,
                    data,
                }))
            }
        }
    }
}

/// Data payload of an `F08 AmountTooLarge` reject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountTooLargeData {
    /// Amount the rejecting node saw
    pub received_amount: u64,
    /// Maximum amount it will forward
    pub maximum_amount: u64,
}

impl AmountTooLargeData {
    /// Serialize as two fixed eight-byte integers.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u64(self.received_amount);
        w.write_u64(self.maximum_amount);
        w.into_inner()
    }

    /// Deserialize from a reject's data field.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::UnexpectedEof` on truncation.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(data);
        Ok(Self {
            received_amount: r.read_u64()?,
            maximum_amount: r.read_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_expiry() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, 12, 30, 45).unwrap() + chrono::Duration::milliseconds(123)
    }

    #[test]
    fn test_prepare_roundtrip() {
        let packet = IlpPacket::Prepare(Prepare {
            amount: 1000,
            expires_at: sample_expiry(),
            execution_condition: [0xAB; 32],
            destination: "test.server.abc123".to_string(),
            data: vec![1, 2, 3],
        });
        assert_eq!(IlpPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_fulfill_roundtrip() {
        let packet = IlpPacket::Fulfill(Fulfill {
            fulfillment: [0x55; 32],
            data: vec![9; 100],
        });
        assert_eq!(IlpPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_reject_roundtrip() {
        let packet = IlpPacket::Reject(Reject {
            code: codes::F06_UNEXPECTED_PAYMENT.to_string(),
            triggered_by: "test.server".to_string(),
            message: String::new(),
            data: vec![],
        });
        assert_eq!(IlpPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_timestamp_format() {
        let packet = IlpPacket::Prepare(Prepare {
            amount: 0,
            expires_at: sample_expiry(),
            execution_condition: [0; 32],
            destination: "peer.config".to_string(),
            data: vec![],
        });
        let bytes = packet.encode();
        // Type byte, length determinant, amount, then the timestamp.
        let ts_start = 2 + 8;
        assert_eq!(&bytes[ts_start..ts_start + 17], b"20260802123045123");
    }

    #[test]
    fn test_invalid_timestamp_rejected() {
        let packet = IlpPacket::Prepare(Prepare {
            amount: 0,
            expires_at: sample_expiry(),
            execution_condition: [0; 32],
            destination: "x".to_string(),
            data: vec![],
        });
        let mut bytes = packet.encode();
        bytes[2 + 8] = b'x';
        assert!(matches!(
            IlpPacket::decode(&bytes),
            Err(PacketError::InvalidTimestamp)
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(matches!(
            IlpPacket::decode(&[99, 0]),
            Err(PacketError::InvalidPacketType(99))
        ));
    }

    #[test]
    fn test_reject_class() {
        assert_eq!(reject_class("F08"), RejectClass::Final);
        assert_eq!(reject_class("T00"), RejectClass::Temporary);
        assert_eq!(reject_class("R00"), RejectClass::Relative);
        assert_eq!(reject_class(""), RejectClass::Unknown);
        assert_eq!(reject_class("X01"), RejectClass::Unknown);
    }

    #[test]
    fn test_amount_too_large_data_roundtrip() {
        let hint = AmountTooLargeData {
            received_amount: 100_000,
            maximum_amount: 25_000,
        };
        assert_eq!(AmountTooLargeData::decode(&hint.encode()).unwrap(), hint);
        assert!(AmountTooLargeData::decode(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_peer_protocol_condition_is_hash_of_zero_preimage() {
        let condition = peer_protocol_condition();
        assert_eq!(condition, ilp_stream_crypto::hmac::sha256(&[0u8; 32]));
        // Known SHA-256 of 32 zero bytes.
        assert_eq!(
            hex::encode(condition),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }
}
