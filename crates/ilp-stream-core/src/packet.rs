//! STREAM packet and frame codec.
//!
//! A packet is a version byte, the ILP packet type it rides in, a sequence
//! number, the declared prepare amount, and a list of typed frames. Every
//! frame is enveloped as `[u8 type][varOctetString contents]`, so receivers
//! can skip frame types they do not recognize without failing the packet.
//!
//! Serialized packets are padded with zero bytes toward a target size and
//! sealed with AES-256-GCM before being placed in the data field of an ILP
//! `Prepare`, `Fulfill`, or `Reject`.

use ilp_stream_crypto::EncryptionKey;

use crate::error::{ErrorCode, PacketError};
use crate::oer::{Reader, Writer};

/// STREAM protocol version.
pub const STREAM_VERSION: u8 = 1;

/// Target serialized packet size; encoded packets are zero-padded toward the
/// next multiple of this block to obscure their plaintext length.
pub const PAD_BLOCK_SIZE: usize = 32;

/// ILP packet type a STREAM packet is carried in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IlpPacketType {
    /// ILP Prepare (12)
    Prepare = 12,
    /// ILP Fulfill (13)
    Fulfill = 13,
    /// ILP Reject (14)
    Reject = 14,
}

impl TryFrom<u8> for IlpPacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        match value {
            12 => Ok(Self::Prepare),
            13 => Ok(Self::Fulfill),
            14 => Ok(Self::Reject),
            other => Err(PacketError::InvalidPacketType(other)),
        }
    }
}

/// Frame type bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Opaque padding
    Padding = 0x00,
    /// Connection close
    ConnectionClose = 0x01,
    /// Endpoint address announcement
    ConnectionNewAddress = 0x02,
    /// Aggregate incoming data window
    ConnectionMaxData = 0x03,
    /// Sender blocked on the aggregate data window
    ConnectionDataBlocked = 0x04,
    /// Highest stream id the peer may open
    ConnectionMaxStreamId = 0x05,
    /// Sender blocked on the stream id window
    ConnectionStreamIdBlocked = 0x06,
    /// Sender-side asset announcement
    ConnectionAssetDetails = 0x07,
    /// Stream close
    StreamClose = 0x10,
    /// Money carried for a stream, in shares of the packet amount
    StreamMoney = 0x11,
    /// Stream receive cap and running total
    StreamMaxMoney = 0x12,
    /// Sender blocked on the stream money cap
    StreamMoneyBlocked = 0x13,
    /// Stream data chunk at an absolute offset
    StreamData = 0x14,
    /// Stream incoming data window
    StreamMaxData = 0x15,
    /// Sender blocked on the stream data window
    StreamDataBlocked = 0x16,
    /// Latest receipt for a stream
    StreamReceipt = 0x17,
}

/// A decoded STREAM frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Close the connection
    ConnectionClose {
        /// Close code
        code: ErrorCode,
        /// Human-readable close reason (may be empty)
        message: String,
    },
    /// Announce the sender's ILP address
    ConnectionNewAddress {
        /// Source account of the frame's sender
        source_account: String,
    },
    /// Advertise the aggregate incoming data window
    ConnectionMaxData {
        /// Highest aggregate offset the sender may reach
        max_offset: u64,
    },
    /// Signal that sending is blocked on the aggregate window
    ConnectionDataBlocked {
        /// Window the sender is blocked at
        max_offset: u64,
    },
    /// Advertise the highest stream id the peer may open
    ConnectionMaxStreamId {
        /// Highest allowed stream id
        max_stream_id: u64,
    },
    /// Signal that stream creation is blocked on the id window
    ConnectionStreamIdBlocked {
        /// Window the sender is blocked at
        max_stream_id: u64,
    },
    /// Announce the sender's asset code and scale
    ConnectionAssetDetails {
        /// Asset code (e.g. "XRP")
        asset_code: String,
        /// Asset scale
        asset_scale: u8,
    },
    /// Close one stream
    StreamClose {
        /// Stream id
        stream_id: u64,
        /// Close code
        code: ErrorCode,
        /// Human-readable close reason (may be empty)
        message: String,
    },
    /// Carry money for a stream as shares of the packet amount
    StreamMoney {
        /// Stream id
        stream_id: u64,
        /// Relative shares of the enclosing packet's amount
        shares: u64,
    },
    /// Advertise a stream's receive cap
    StreamMaxMoney {
        /// Stream id
        stream_id: u64,
        /// Receive cap; `u64::MAX` encodes "unbounded"
        receive_max: u64,
        /// Total received so far
        total_received: u64,
    },
    /// Signal that sending money is blocked on the stream cap
    StreamMoneyBlocked {
        /// Stream id
        stream_id: u64,
        /// Sender's send cap
        send_max: u64,
        /// Sender's running total
        total_sent: u64,
    },
    /// Carry a chunk of stream data
    StreamData {
        /// Stream id
        stream_id: u64,
        /// Absolute byte offset of the first byte of `data`
        offset: u64,
        /// Chunk bytes
        data: Vec<u8>,
    },
    /// Advertise a stream's incoming data window
    StreamMaxData {
        /// Stream id
        stream_id: u64,
        /// Highest offset the sender may reach
        max_offset: u64,
    },
    /// Signal that sending data is blocked on the stream window
    StreamDataBlocked {
        /// Stream id
        stream_id: u64,
        /// Window the sender is blocked at
        max_offset: u64,
    },
    /// Deliver the latest receipt for a stream
    StreamReceipt {
        /// Stream id
        stream_id: u64,
        /// Opaque 58-byte receipt blob
        receipt: Vec<u8>,
    },
}

impl Frame {
    /// Frame type byte for this frame.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::ConnectionClose { .. } => FrameType::ConnectionClose,
            Self::ConnectionNewAddress { .. } => FrameType::ConnectionNewAddress,
            Self::ConnectionMaxData { .. } => FrameType::ConnectionMaxData,
            Self::ConnectionDataBlocked { .. } => FrameType::ConnectionDataBlocked,
            Self::ConnectionMaxStreamId { .. } => FrameType::ConnectionMaxStreamId,
            Self::ConnectionStreamIdBlocked { .. } => FrameType::ConnectionStreamIdBlocked,
            Self::ConnectionAssetDetails { .. } => FrameType::ConnectionAssetDetails,
            Self::StreamClose { .. } => FrameType::StreamClose,
            Self::StreamMoney { .. } => FrameType::StreamMoney,
            Self::StreamMaxMoney { .. } => FrameType::StreamMaxMoney,
            Self::StreamMoneyBlocked { .. } => FrameType::StreamMoneyBlocked,
            Self::StreamData { .. } => FrameType::StreamData,
            Self::StreamMaxData { .. } => FrameType::StreamMaxData,
            Self::StreamDataBlocked { .. } => FrameType::StreamDataBlocked,
            Self::StreamReceipt { .. } => FrameType::StreamReceipt,
        }
    }

    /// Stream id this frame refers to, when it refers to one.
    #[must_use]
    pub fn stream_id(&self) -> Option<u64> {
        match self {
            Self::StreamClose { stream_id, .. }
            | Self::StreamMoney { stream_id, .. }
            | Self::StreamMaxMoney { stream_id, .. }
            | Self::StreamMoneyBlocked { stream_id, .. }
            | Self::StreamData { stream_id, .. }
            | Self::StreamMaxData { stream_id, .. }
            | Self::StreamDataBlocked { stream_id, .. }
            | Self::StreamReceipt { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    fn encode_contents(&self, w: &mut Writer) {
        match self {
            Self::ConnectionClose { code, message } => {
                w.write_u8(code.as_u8());
                w.write_var_string(message);
            }
            Self::ConnectionNewAddress { source_account } => {
                w.write_var_string(source_account);
            }
            Self::ConnectionMaxData { max_offset }
            | Self::ConnectionDataBlocked { max_offset } => {
                w.write_var_uint(*max_offset);
            }
            Self::ConnectionMaxStreamId { max_stream_id }
            | Self::ConnectionStreamIdBlocked { max_stream_id } => {
                w.write_var_uint(*max_stream_id);
            }
            Self::ConnectionAssetDetails {
                asset_code,
                asset_scale,
            } => {
                w.write_var_string(asset_code);
                w.write_u8(*asset_scale);
            }
            Self::StreamClose {
                stream_id,
                code,
                message,
            } => {
                w.write_var_uint(*stream_id);
                w.write_u8(code.as_u8());
                w.write_var_string(message);
            }
            Self::StreamMoney { stream_id, shares } => {
                w.write_var_uint(*stream_id);
                w.write_var_uint(*shares);
            }
            Self::StreamMaxMoney {
                stream_id,
                receive_max,
                total_received,
            } => {
                w.write_var_uint(*stream_id);
                w.write_var_uint(*receive_max);
                w.write_var_uint(*total_received);
            }
            Self::StreamMoneyBlocked {
                stream_id,
                send_max,
                total_sent,
            } => {
                w.write_var_uint(*stream_id);
                w.write_var_uint(*send_max);
                w.write_var_uint(*total_sent);
            }
            Self::StreamData {
                stream_id,
                offset,
                data,
            } => {
                w.write_var_uint(*stream_id);
                w.write_var_uint(*offset);
                w.write_var_octet_string(data);
            }
            Self::StreamMaxData {
                stream_id,
                max_offset,
            }
            | Self::StreamDataBlocked {
                stream_id,
                max_offset,
            } => {
                w.write_var_uint(*stream_id);
                w.write_var_uint(*max_offset);
            }
            Self::StreamReceipt { stream_id, receipt } => {
                w.write_var_uint(*stream_id);
                w.write_var_octet_string(receipt);
            }
        }
    }

    /// Encode the frame envelope into `w`.
    pub fn encode(&self, w: &mut Writer) {
        let mut contents = Writer::new();
        self.encode_contents(&mut contents);
        w.write_u8(self.frame_type() as u8);
        w.write_var_octet_string(&contents.into_inner());
    }

    /// Decode one frame's contents. Returns `None` for padding and unknown
    /// frame types, which are skipped for forward compatibility.
    ///
    /// # Errors
    ///
    /// Returns a `PacketError` when a recognized frame's contents are
    /// malformed.
    fn decode(frame_type: u8, contents: &[u8]) -> Result<Option<Self>, PacketError> {
        let mut r = Reader::new(contents);
        let frame = match frame_type {
            0x01 => Self::ConnectionClose {
                code: ErrorCode::try_from(r.read_u8()?)?,
                message: r.read_var_string()?,
            },
            0x02 => Self::ConnectionNewAddress {
                source_account: r.read_var_string()?,
            },
            0x03 => Self::ConnectionMaxData {
                max_offset: r.read_var_uint()?,
            },
            0x04 => Self::ConnectionDataBlocked {
                max_offset: r.read_var_uint()?,
            },
            0x05 => Self::ConnectionMaxStreamId {
                max_stream_id: r.read_var_uint()?,
            },
            0x06 => Self::ConnectionStreamIdBlocked {
                max_stream_id: r.read_var_uint()?,
            },
            0x07 => Self::ConnectionAssetDetails {
                asset_code: r.read_var_string()?,
                asset_scale: r.read_u8()?,
            },
            0x10 => Self::StreamClose {
                stream_id: r.read_var_uint()?,
                code: ErrorCode::try_from(r.read_u8()?)?,
                message: r.read_var_string()?,
            },
            0x11 => Self::StreamMoney {
                stream_id: r.read_var_uint()?,
                shares: r.read_var_uint()?,
            },
            0x12 => Self::StreamMaxMoney {
                stream_id: r.read_var_uint()?,
                receive_max: r.read_var_uint()?,
                total_received: r.read_var_uint()?,
            },
            0x13 => Self::StreamMoneyBlocked {
                stream_id: r.read_var_uint()?,
                send_max: r.read_var_uint()?,
                total_sent: r.read_var_uint()?,
            },
            0x14 => Self::StreamData {
                stream_id: r.read_var_uint()?,
                offset: r.read_var_uint()?,
                data: r.read_var_octet_string()?.to_vec(),
            },
            0x15 => Self::StreamMaxData {
                stream_id: r.read_var_uint()?,
                max_offset: r.read_var_uint()?,
            },
            0x16 => Self::StreamDataBlocked {
                stream_id: r.read_var_uint()?,
                max_offset: r.read_var_uint()?,
            },
            0x17 => Self::StreamReceipt {
                stream_id: r.read_var_uint()?,
                receipt: r.read_var_octet_string()?.to_vec(),
            },
            other => {
                tracing::trace!("skipping unknown frame type 0x{other:02X}");
                return Ok(None);
            }
        };
        Ok(Some(frame))
    }
}

/// A plaintext STREAM packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Per-direction sequence number
    pub sequence: u64,
    /// ILP packet type this STREAM packet rides in
    pub ilp_packet_type: IlpPacketType,
    /// Declared amount: source amount on a Prepare, delivered amount on a
    /// Fulfill/Reject reply
    pub prepare_amount: u64,
    /// Frames, in order
    pub frames: Vec<Frame>,
}

impl Packet {
    /// Create a packet.
    #[must_use]
    pub fn new(
        sequence: u64,
        ilp_packet_type: IlpPacketType,
        prepare_amount: u64,
        frames: Vec<Frame>,
    ) -> Self {
        Self {
            sequence,
            ilp_packet_type,
            prepare_amount,
            frames,
        }
    }

    /// Serialize the packet (no padding, no encryption).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u8(STREAM_VERSION);
        w.write_u8(self.ilp_packet_type as u8);
        w.write_var_uint(self.sequence);
        w.write_var_uint(self.prepare_amount);
        w.write_var_uint(self.frames.len() as u64);
        for frame in &self.frames {
            frame.encode(&mut w);
        }
        w.into_inner()
    }

    /// Deserialize a plaintext packet. Unknown frames are skipped; trailing
    /// zero padding after the last frame is ignored.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::UnsupportedVersion` for any version byte other
    /// than 1, and codec errors for malformed recognized frames.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(data);

        let version = r.read_u8()?;
        if version != STREAM_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let ilp_packet_type = IlpPacketType::try_from(r.read_u8()?)?;
        let sequence = r.read_var_uint()?;
        let prepare_amount = r.read_var_uint()?;
        let num_frames = r.read_var_uint()?;

        let mut frames = Vec::new();
        for _ in 0..num_frames {
            let frame_type = r.read_u8()?;
            let contents = r.read_var_octet_string()?;
            if let Some(frame) = Frame::decode(frame_type, contents)? {
                frames.push(frame);
            }
        }

        Ok(Self {
            sequence,
            ilp_packet_type,
            prepare_amount,
            frames,
        })
    }

    /// Serialize, zero-pad toward the next [`PAD_BLOCK_SIZE`] multiple, and
    /// seal under `key`. The result goes in the ILP packet's data field.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::Decrypt` when the AEAD fails.
    pub fn encrypt(&self, key: &EncryptionKey) -> Result<Vec<u8>, PacketError> {
        let mut plaintext = self.encode();
        let padded_len = plaintext.len().div_ceil(PAD_BLOCK_SIZE) * PAD_BLOCK_SIZE;
        plaintext.resize(padded_len, 0);
        Ok(key.encrypt(&plaintext)?)
    }

    /// Decrypt an envelope under `key` and decode the packet inside.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::Decrypt` on authentication failure and codec
    /// errors for a malformed plaintext.
    pub fn decrypt_and_decode(key: &EncryptionKey, envelope: &[u8]) -> Result<Self, PacketError> {
        let plaintext = key.decrypt(envelope)?;
        Self::decode(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::ConnectionNewAddress {
                source_account: "test.client".to_string(),
            },
            Frame::ConnectionAssetDetails {
                asset_code: "XRP".to_string(),
                asset_scale: 9,
            },
            Frame::StreamMoney {
                stream_id: 1,
                shares: 100,
            },
            Frame::StreamData {
                stream_id: 1,
                offset: 0,
                data: b"hello".to_vec(),
            },
            Frame::StreamMaxMoney {
                stream_id: 1,
                receive_max: u64::MAX,
                total_received: 0,
            },
        ]
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::new(7, IlpPacketType::Prepare, 1000, sample_frames());
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_all_frame_types_roundtrip() {
        let frames = vec![
            Frame::ConnectionClose {
                code: ErrorCode::NoError,
                message: "bye".to_string(),
            },
            Frame::ConnectionNewAddress {
                source_account: "g.alice".to_string(),
            },
            Frame::ConnectionMaxData { max_offset: 65536 },
            Frame::ConnectionDataBlocked { max_offset: 65536 },
            Frame::ConnectionMaxStreamId { max_stream_id: 41 },
            Frame::ConnectionStreamIdBlocked { max_stream_id: 41 },
            Frame::ConnectionAssetDetails {
                asset_code: "USD".to_string(),
                asset_scale: 2,
            },
            Frame::StreamClose {
                stream_id: 3,
                code: ErrorCode::ApplicationError,
                message: String::new(),
            },
            Frame::StreamMoney {
                stream_id: 3,
                shares: 9,
            },
            Frame::StreamMaxMoney {
                stream_id: 3,
                receive_max: 500,
                total_received: 250,
            },
            Frame::StreamMoneyBlocked {
                stream_id: 3,
                send_max: 1000,
                total_sent: 400,
            },
            Frame::StreamData {
                stream_id: 3,
                offset: 128,
                data: vec![0xAA; 64],
            },
            Frame::StreamMaxData {
                stream_id: 3,
                max_offset: 4096,
            },
            Frame::StreamDataBlocked {
                stream_id: 3,
                max_offset: 4096,
            },
            Frame::StreamReceipt {
                stream_id: 3,
                receipt: vec![1u8; 58],
            },
        ];
        let packet = Packet::new(1, IlpPacketType::Fulfill, 0, frames);
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut bytes = Packet::new(1, IlpPacketType::Prepare, 0, vec![]).encode();
        bytes[0] = 2;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_invalid_ilp_packet_type_rejected() {
        let mut bytes = Packet::new(1, IlpPacketType::Prepare, 0, vec![]).encode();
        bytes[1] = 99;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::InvalidPacketType(99))
        ));
    }

    #[test]
    fn test_unknown_frame_skipped() {
        // Packet with one recognized frame, then an unknown 0xFE frame
        // spliced in by hand, then another recognized frame.
        let first = Frame::StreamMoney {
            stream_id: 1,
            shares: 5,
        };
        let second = Frame::StreamMaxData {
            stream_id: 1,
            max_offset: 100,
        };

        let mut w = Writer::new();
        w.write_u8(STREAM_VERSION);
        w.write_u8(IlpPacketType::Prepare as u8);
        w.write_var_uint(9);
        w.write_var_uint(50);
        w.write_var_uint(3);
        first.encode(&mut w);
        w.write_u8(0xFE);
        w.write_var_octet_string(&[1, 2, 3, 4]);
        second.encode(&mut w);

        let decoded = Packet::decode(&w.into_inner()).unwrap();
        assert_eq!(decoded.frames, vec![first, second]);
    }

    #[test]
    fn test_padding_frame_ignored() {
        let mut w = Writer::new();
        w.write_u8(STREAM_VERSION);
        w.write_u8(IlpPacketType::Prepare as u8);
        w.write_var_uint(1);
        w.write_var_uint(0);
        w.write_var_uint(1);
        w.write_u8(0x00);
        w.write_var_octet_string(&[0u8; 10]);

        let decoded = Packet::decode(&w.into_inner()).unwrap();
        assert!(decoded.frames.is_empty());
    }

    #[test]
    fn test_trailing_zero_padding_ignored() {
        let packet = Packet::new(3, IlpPacketType::Reject, 42, sample_frames());
        let mut bytes = packet.encode();
        bytes.extend_from_slice(&[0u8; 64]);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let bytes = Packet::new(3, IlpPacketType::Prepare, 42, sample_frames()).encode();
        assert!(Packet::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_encrypt_roundtrip_and_padding() {
        let key = EncryptionKey::new([0x11; 32]);
        let packet = Packet::new(5, IlpPacketType::Prepare, 77, sample_frames());

        let envelope = packet.encrypt(&key).unwrap();
        // Plaintext length is a multiple of the pad block.
        let plaintext_len = envelope.len() - ilp_stream_crypto::ENCRYPTION_OVERHEAD;
        assert_eq!(plaintext_len % PAD_BLOCK_SIZE, 0);

        assert_eq!(Packet::decrypt_and_decode(&key, &envelope).unwrap(), packet);
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let key = EncryptionKey::new([0x11; 32]);
        let other = EncryptionKey::new([0x22; 32]);
        let envelope = Packet::new(5, IlpPacketType::Prepare, 0, vec![])
            .encrypt(&key)
            .unwrap();
        assert!(matches!(
            Packet::decrypt_and_decode(&other, &envelope),
            Err(PacketError::Decrypt(_))
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_frame() -> impl Strategy<Value = Frame> {
            let stream_id = 1u64..1000;
            prop_oneof![
                (any::<u64>()).prop_map(|max_offset| Frame::ConnectionMaxData { max_offset }),
                (stream_id.clone(), any::<u64>())
                    .prop_map(|(stream_id, shares)| Frame::StreamMoney { stream_id, shares }),
                (stream_id.clone(), any::<u64>(), any::<u64>()).prop_map(
                    |(stream_id, receive_max, total_received)| Frame::StreamMaxMoney {
                        stream_id,
                        receive_max,
                        total_received,
                    }
                ),
                (stream_id.clone(), any::<u64>(), prop::collection::vec(any::<u8>(), 0..512))
                    .prop_map(|(stream_id, offset, data)| Frame::StreamData {
                        stream_id,
                        offset,
                        data,
                    }),
                (stream_id, "[a-z.]{0,40}").prop_map(|(stream_id, message)| Frame::StreamClose {
                    stream_id,
                    code: ErrorCode::NoError,
                    message,
                }),
            ]
        }

        proptest! {
            #[test]
            fn prop_packet_roundtrip(
                sequence in any::<u64>(),
                prepare_amount in any::<u64>(),
                frames in prop::collection::vec(arb_frame(), 0..16),
            ) {
                let packet = Packet::new(sequence, IlpPacketType::Prepare, prepare_amount, frames);
                prop_assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
            }

            #[test]
            fn prop_decode_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..2048)) {
                let _ = Packet::decode(&data);
            }
        }
    }
}
