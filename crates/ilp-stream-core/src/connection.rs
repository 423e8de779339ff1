//! Connection state machine.
//!
//! A connection multiplexes streams over a shared secret. Inbound, it
//! decrypts and validates each ILP Prepare, applies control frames, credits
//! money and data atomically, and answers with an encrypted Fulfill or
//! Reject body. Outbound, a single send loop keeps at most one Prepare in
//! flight: it apportions the packet amount across streams by shares, fills
//! leftover capacity with data frames, and drives retry policy from the ILP
//! reject taxonomy (`F08` resizes, `T*` backs off, everything else closes).
//!
//! # Packet Flow
//!
//! ```text
//! plugin → handle_prepare → decrypt → validate → apply frames → reply
//! send loop → build_plan → Prepare → plugin.send_data → apply response
//! ```
//!
//! Lock order: the connection mutex is always taken before any stream
//! mutex. Stream handles only ever take their own stream mutex.

use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, Mutex, Notify, OwnedMutexGuard};
use tokio::time::Duration;

use ilp_stream_crypto::hmac as crypto;
use ilp_stream_crypto::{random, EncryptionKey};
use zeroize::Zeroizing;

use crate::congestion::AimdState;
use crate::error::{ConnectionError, ErrorCode, Result};
use crate::ilp::{codes, reject_class, AmountTooLargeData, IlpPacket, Prepare, Reject, RejectClass};
use crate::packet::{Frame, IlpPacketType, Packet};
use crate::plugin::{DataHandler, Plugin, PluginError};
use crate::receipt::{create_receipt, decode_receipt};
use crate::stream::{Stream, StreamEvent, StreamShared, StreamState, StreamStateInner};

/// Target size for a serialized outbound packet.
pub const TARGET_PACKET_SIZE: usize = 32 * 1024;

/// Default aggregate incoming data window.
pub const DEFAULT_CONNECTION_WINDOW: u64 = 1024 * 1024;

/// Default slippage tolerance on the observed exchange rate.
pub const DEFAULT_SLIPPAGE: f64 = 0.01;

/// Grace period past a Prepare's expiry before it counts as timed out.
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Default Prepare lifetime in seconds.
const DEFAULT_EXPIRY_SECONDS: i64 = 30;

/// Source amounts of the exchange-rate test packets.
const PROBE_AMOUNTS: [u64; 3] = [1_000, 1_000_000, 1_000_000_000];

/// A probe reply must deliver at least this much to carry three significant
/// digits of rate precision.
const MIN_PRECISION_DELIVERED: u64 = 100;

/// Highest stream id accepted from the remote before the window grows.
const DEFAULT_MAX_STREAM_ID: u64 = 100;

/// Exponential-backoff bounds for temporary rejects.
const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Weight of a new sample in the exchange-rate estimate.
const RATE_EMA_ALPHA: f64 = 0.1;

pub(crate) const PRECISION_FAILURE_MESSAGE: &str = "Unable to establish connection, no packets \
meeting the minimum exchange precision of 3 digits made it through the path.";

/// Clock used to stamp Prepare expiries.
pub type ExpiryFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Tunables for a connection
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Tolerated exchange-rate degradation, `[0.0, 1.0]`
    pub slippage: f64,
    /// Consecutive rejects tolerated before the connection fails
    pub max_retries: u32,
    /// Expiry clock override; defaults to `now + 30s`
    pub get_expiry: Option<ExpiryFn>,
    /// Receipt nonce, when receipts are provisioned for this connection
    pub receipt_nonce: Option<[u8; 16]>,
    /// Receipt secret, when receipts are provisioned for this connection
    pub receipt_secret: Option<[u8; 32]>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            slippage: DEFAULT_SLIPPAGE,
            max_retries: 10,
            get_expiry: None,
            receipt_nonce: None,
            receipt_secret: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("slippage", &self.slippage)
            .field("max_retries", &self.max_retries)
            .field("has_expiry_fn", &self.get_expiry.is_some())
            .field("receipts", &self.receipt_nonce.is_some())
            .finish()
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created; exchange rate not yet established
    Opening,
    /// Fully usable
    Open,
    /// Close requested or received; draining
    Closing,
    /// Finished; handlers detached
    Closed,
}

/// Counters exposed by [`Connection`] getters
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    /// Packets we originated
    pub packets_sent: u64,
    /// Prepares we received
    pub packets_received: u64,
    /// Source units fulfilled across all streams
    pub total_sent: u64,
    /// Destination units delivered across all streams
    pub total_delivered: u64,
    /// Local units received across all streams
    pub total_received: u64,
}

/// Mutable connection state, guarded by [`ConnectionInner::state`]
pub(crate) struct ConnState {
    state: ConnectionState,
    source_account: String,
    destination_account: Option<String>,
    asset_code: String,
    asset_scale: u8,
    remote_asset: Option<(String, u8)>,
    sent_asset_details: bool,

    next_sequence: u64,
    last_inbound_sequence: u64,

    max_packet_amount: u64,
    congestion: AimdState,
    exchange_rate: Option<f64>,

    streams: BTreeMap<u64, Arc<StreamShared>>,
    next_stream_id: u64,
    local_max_stream_id: u64,
    advertised_max_stream_id: u64,
    remote_max_stream_id: u64,
    stream_id_blocked_signaled: bool,

    conn_max_data_in: u64,
    advertised_conn_max_data: u64,
    conn_data_in: u64,
    conn_max_data_out: Option<u64>,
    conn_data_out: u64,
    conn_data_blocked_signaled: bool,

    close_requested: Option<ErrorCode>,
    close_reason: Option<(ErrorCode, String)>,

    consecutive_rejects: u32,
    stats: ConnectionStats,

    incoming_tx: Option<mpsc::UnboundedSender<Stream>>,
}

/// Advertisements carried by an outbound packet, confirmed once the remote
/// demonstrably processed them (a fulfill, or a reject with a STREAM body).
#[derive(Default)]
struct Advertisements {
    asset_details: bool,
    receive_caps: Vec<(u64, u64)>,
    stream_windows: Vec<(u64, u64)>,
    conn_window: Option<u64>,
    max_stream_id: Option<u64>,
}

/// Bookkeeping for one outbound packet
struct PacketPlan {
    sequence: u64,
    amount: u64,
    /// Per-stream amounts, ascending stream id
    stream_amounts: Vec<(u64, u64)>,
    /// Streams carrying data frames, with the byte count taken
    data_streams: Vec<(u64, usize)>,
    /// Streams whose `StreamClose` rides this packet
    stream_closes: Vec<u64>,
    connection_close: Option<ErrorCode>,
    advertisements: Advertisements,
    execution_condition: [u8; 32],
}

enum PlanResult {
    Exit,
    Idle,
    Send(Prepare, PacketPlan),
}

enum ProbeOutcome {
    Delivered(u64),
    AmountTooLarge,
    NoInfo,
}

pub(crate) struct ConnectionInner {
    plugin: Arc<dyn Plugin>,
    encryption_key: EncryptionKey,
    fulfillment_key: Zeroizing<[u8; 32]>,
    is_server: bool,
    owns_data_handler: bool,
    connection_tag: Option<String>,
    config: ConnectionConfig,
    state: Mutex<ConnState>,
    /// Wakes the send loop
    wake: Arc<Notify>,
    /// Wakes connection-level waiters (`end`, `destroy`)
    change: Notify,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Stream>>,
}

/// A STREAM connection: a multiplexed money-and-data session with one peer
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

/// Adapter registering a connection as a plugin data handler
pub(crate) struct ConnectionHandler(pub(crate) Arc<ConnectionInner>);

#[async_trait::async_trait]
impl DataHandler for ConnectionHandler {
    async fn handle_data(&self, data: Vec<u8>) -> std::result::Result<Vec<u8>, PluginError> {
        match IlpPacket::decode(&data) {
            Ok(IlpPacket::Prepare(prepare)) => Ok(self.0.handle_prepare(prepare).await.encode()),
            Ok(_) => Err(PluginError::send("expected an ILP Prepare")),
            Err(err) => {
                // Malformed inbound packets reject with a bare F00: the
                // parse detail stays in the logs, not on the wire.
                tracing::debug!(%err, "failed to parse inbound ILP packet");
                Ok(self.0.opaque_reject(codes::F00_BAD_REQUEST).encode())
            }
        }
    }
}

/// Split `total` across `parts` proportionally to their capacities, flooring
/// each share and handing the remainder to the lowest ids first, never
/// exceeding a part's capacity. `total` must not exceed the capacity sum.
fn apportion_with_caps(total: u64, parts: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let cap_sum: u128 = parts.iter().map(|(_, cap)| u128::from(*cap)).sum();
    if total == 0 || cap_sum == 0 {
        return Vec::new();
    }
    let mut out: Vec<(u64, u64)> = parts
        .iter()
        .map(|(id, cap)| {
            let share = u128::from(total) * u128::from(*cap) / cap_sum;
            (*id, share as u64)
        })
        .collect();
    let mut remainder = total - out.iter().map(|(_, a)| *a).sum::<u64>();
    for ((_, amount), (_, cap)) in out.iter_mut().zip(parts) {
        if remainder == 0 {
            break;
        }
        let room = cap - *amount;
        let add = remainder.min(room);
        *amount += add;
        remainder -= add;
    }
    out.retain(|(_, amount)| *amount > 0);
    out
}

/// Split a received amount across streams proportionally to their declared
/// shares, remainder to the lowest stream id.
fn apportion_by_shares(amount: u64, shares: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let share_sum: u128 = shares.iter().map(|(_, s)| u128::from(*s)).sum();
    if amount == 0 || share_sum == 0 {
        return Vec::new();
    }
    let mut out: Vec<(u64, u64)> = shares
        .iter()
        .map(|(id, s)| {
            let portion = u128::from(amount) * u128::from(*s) / share_sum;
            (*id, portion as u64)
        })
        .collect();
    let assigned: u64 = out.iter().map(|(_, a)| *a).sum();
    out[0].1 += amount - assigned;
    out
}

impl ConnState {
    fn stream_parity(&self, is_server: bool) -> u64 {
        // Client-initiated streams are odd, server-initiated even.
        if is_server { 0 } else { 1 }
    }
}

/// Take the next outbound sequence number. `None` when the space is
/// exhausted; the caller must close the connection.
fn take_sequence(cs: &mut ConnState) -> Option<u64> {
    if cs.next_sequence >= u64::MAX - 1 {
        return None;
    }
    let sequence = cs.next_sequence;
    cs.next_sequence += 1;
    Some(sequence)
}

impl ConnectionInner {
    fn expiry(&self) -> DateTime<Utc> {
        match &self.config.get_expiry {
            Some(f) => f(),
            None => Utc::now() + ChronoDuration::seconds(DEFAULT_EXPIRY_SECONDS),
        }
    }

    /// Close the connection abnormally: fail every stream, record the
    /// reason, detach handlers, and wake everyone.
    async fn fail_connection(&self, cs: &mut ConnState, code: ErrorCode, message: &str) {
        if cs.state == ConnectionState::Closed {
            return;
        }
        tracing::warn!(code = ?code, message, "closing connection");
        cs.state = ConnectionState::Closed;
        cs.close_reason.get_or_insert((code, message.to_string()));
        cs.incoming_tx = None;
        let streams: Vec<Arc<StreamShared>> = cs.streams.values().cloned().collect();
        for shared in streams {
            let mut st = Arc::clone(&shared.state).lock_owned().await;
            st.fail(code, message);
            drop(st);
            shared.notify_all();
        }
        if self.owns_data_handler {
            self.plugin.deregister_data_handler();
        }
        self.change.notify_waiters();
        self.wake.notify_waiters();
    }

    /// Finish a graceful close.
    fn finish_close_locked(&self, cs: &mut ConnState, code: ErrorCode) {
        if cs.state == ConnectionState::Closed {
            return;
        }
        cs.state = ConnectionState::Closed;
        cs.close_reason.get_or_insert((code, String::new()));
        cs.incoming_tx = None;
        if self.owns_data_handler {
            self.plugin.deregister_data_handler();
        }
        self.change.notify_waiters();
        self.wake.notify_waiters();
        tracing::debug!(code = ?code, "connection closed");
    }

    /// Look up a stream, lazily creating it for remote-initiated ids.
    ///
    /// Returns `Err` with the close code for id violations.
    fn get_or_create_stream(
        &self,
        cs: &mut ConnState,
        stream_id: u64,
    ) -> std::result::Result<Option<Arc<StreamShared>>, (ErrorCode, &'static str)> {
        if let Some(shared) = cs.streams.get(&stream_id) {
            return Ok(Some(Arc::clone(shared)));
        }
        if stream_id == 0 {
            return Err((ErrorCode::StreamIdError, "stream id zero"));
        }
        let local_parity = cs.stream_parity(self.is_server);
        if stream_id % 2 == local_parity {
            // References one of our own streams. Below the allocation point
            // it is stale (already destroyed); beyond it the peer is making
            // ids up.
            if stream_id < cs.next_stream_id {
                return Ok(None);
            }
            return Err((
                ErrorCode::StreamIdError,
                "peer referenced a local stream id that was never opened",
            ));
        }
        if stream_id > cs.local_max_stream_id {
            return Err((
                ErrorCode::StreamIdError,
                "peer exceeded the advertised stream id window",
            ));
        }

        let shared = StreamShared::new(stream_id, Arc::clone(&self.wake));
        cs.streams.insert(stream_id, Arc::clone(&shared));

        // Grow the id window as the peer approaches it.
        if cs.local_max_stream_id - stream_id < DEFAULT_MAX_STREAM_ID / 4 {
            cs.local_max_stream_id += DEFAULT_MAX_STREAM_ID;
        }

        if let Some(tx) = &cs.incoming_tx {
            let _ = tx.send(Stream::new(Arc::clone(&shared)));
        }
        tracing::debug!(stream_id, "remote opened stream");
        Ok(Some(shared))
    }

    /// Build a Reject that leaks nothing about this connection.
    fn opaque_reject(&self, code: &str) -> IlpPacket {
        IlpPacket::Reject(Reject {
            code: code.to_string(),
            triggered_by: String::new(),
            message: String::new(),
            data: Vec::new(),
        })
    }

    /// Build an encrypted F99 reject whose body is `packet`.
    fn encrypted_reject(&self, cs: &ConnState, packet: &Packet) -> IlpPacket {
        let data = packet.encrypt(&self.encryption_key).unwrap_or_default();
        IlpPacket::Reject(Reject {
            code: codes::F99_APPLICATION_ERROR.to_string(),
            triggered_by: cs.source_account.clone(),
            message: String::new(),
            data,
        })
    }

    /// Fail the connection and answer with an encrypted `ConnectionClose`.
    async fn protocol_close_reject(
        &self,
        cs: &mut ConnState,
        sequence: u64,
        code: ErrorCode,
        message: &str,
    ) -> IlpPacket {
        self.fail_connection(cs, code, message).await;
        let reply = Packet::new(
            sequence,
            IlpPacketType::Reject,
            0,
            vec![Frame::ConnectionClose {
                code,
                message: message.to_string(),
            }],
        );
        self.encrypted_reject(cs, &reply)
    }

    // ----- inbound ---------------------------------------------------------

    /// Handle one inbound ILP Prepare, producing the Fulfill or Reject.
    pub(crate) async fn handle_prepare(&self, prepare: Prepare) -> IlpPacket {
        // Decrypt before anything else; an undecryptable packet is answered
        // with an opaque F06 so the reject oracle leaks nothing.
        let plaintext = match self.encryption_key.decrypt(&prepare.data) {
            Ok(p) => p,
            Err(_) => {
                tracing::trace!("rejecting undecryptable packet");
                return self.opaque_reject(codes::F06_UNEXPECTED_PAYMENT);
            }
        };

        let mut cs = self.state.lock().await;
        cs.stats.packets_received += 1;

        let packet = match Packet::decode(&plaintext) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(%err, "failed to parse decrypted packet");
                return self
                    .protocol_close_reject(&mut cs, 0, ErrorCode::FrameFormatError, "malformed packet")
                    .await;
            }
        };
        if packet.ilp_packet_type != IlpPacketType::Prepare {
            return self
                .protocol_close_reject(
                    &mut cs,
                    packet.sequence,
                    ErrorCode::ProtocolViolation,
                    "prepare carried a non-prepare packet type",
                )
                .await;
        }
        if packet.sequence <= cs.last_inbound_sequence {
            return self
                .protocol_close_reject(
                    &mut cs,
                    packet.sequence,
                    ErrorCode::ProtocolViolation,
                    "packet sequence did not increase",
                )
                .await;
        }
        cs.last_inbound_sequence = packet.sequence;
        if cs.state == ConnectionState::Closed {
            let (code, message) = cs
                .close_reason
                .clone()
                .unwrap_or((ErrorCode::NoError, String::new()));
            let reply = Packet::new(
                packet.sequence,
                IlpPacketType::Reject,
                0,
                vec![Frame::ConnectionClose { code, message }],
            );
            return self.encrypted_reject(&cs, &reply);
        }
        if cs.state == ConnectionState::Opening && self.is_server {
            // A valid inbound packet opens a server-side connection; the
            // client side stays in Opening until its rate probe completes,
            // so the probe keeps exclusive use of the in-flight slot.
            cs.state = ConnectionState::Open;
        }

        let fulfillment = crypto::fulfillment(&self.fulfillment_key, &prepare.data);
        let fulfillable = crypto::condition(&fulfillment) == prepare.execution_condition;

        // Control frames apply even when the packet cannot be fulfilled;
        // exchange-rate test packets rely on this for address and asset
        // announcements. Stream closes are deferred until after data lands.
        let mut remote_close: Option<(ErrorCode, String)> = None;
        for frame in &packet.frames {
            match frame {
                Frame::ConnectionNewAddress { source_account } => {
                    tracing::debug!(address = %source_account, "peer announced address");
                    cs.destination_account = Some(source_account.clone());
                    self.wake.notify_waiters();
                }
                Frame::ConnectionAssetDetails {
                    asset_code,
                    asset_scale,
                } => {
                    cs.remote_asset = Some((asset_code.clone(), *asset_scale));
                }
                Frame::ConnectionMaxData { max_offset } => {
                    cs.conn_max_data_out = Some(*max_offset);
                    cs.conn_data_blocked_signaled = false;
                    self.wake.notify_waiters();
                }
                Frame::ConnectionMaxStreamId { max_stream_id } => {
                    cs.remote_max_stream_id = *max_stream_id;
                    cs.stream_id_blocked_signaled = false;
                }
                Frame::ConnectionClose { code, message } => {
                    remote_close = Some((*code, message.clone()));
                }
                Frame::ConnectionDataBlocked { max_offset } => {
                    tracing::debug!(max_offset, "peer blocked on connection data window");
                }
                Frame::ConnectionStreamIdBlocked { max_stream_id } => {
                    tracing::debug!(max_stream_id, "peer blocked on stream id window");
                }
                _ => {}
            }
        }

        // Resolve every referenced stream, lazily creating remote ones.
        let mut guards: BTreeMap<u64, (Arc<StreamShared>, OwnedMutexGuard<StreamStateInner>)> =
            BTreeMap::new();
        for frame in &packet.frames {
            let Some(stream_id) = frame.stream_id() else {
                continue;
            };
            if guards.contains_key(&stream_id) {
                continue;
            }
            match self.get_or_create_stream(&mut cs, stream_id) {
                Ok(Some(shared)) => {
                    let guard = Arc::clone(&shared.state).lock_owned().await;
                    guards.insert(stream_id, (shared, guard));
                }
                Ok(None) => {}
                Err((code, message)) => {
                    drop(guards);
                    return self
                        .protocol_close_reject(&mut cs, packet.sequence, code, message)
                        .await;
                }
            }
        }

        // Stage money: the whole Prepare credits atomically or not at all.
        let money_frames: Vec<(u64, u64)> = packet
            .frames
            .iter()
            .filter_map(|f| match f {
                Frame::StreamMoney { stream_id, shares } => Some((*stream_id, *shares)),
                _ => None,
            })
            .filter(|(id, _)| guards.contains_key(id))
            .collect();
        let portions = apportion_by_shares(prepare.amount, &money_frames);

        let mut money_overflow = false;
        if fulfillable {
            if prepare.amount > 0 && portions.is_empty() {
                // Money with nowhere to land is not silently swallowed.
                money_overflow = true;
            }
            for (stream_id, portion) in &portions {
                let (_, guard) = &guards[stream_id];
                let new_total = guard.total_received.saturating_add(*portion);
                if !guard.receive_max.allows(new_total) {
                    tracing::debug!(
                        stream_id,
                        portion,
                        "incoming money exceeds the stream receive cap"
                    );
                    money_overflow = true;
                }
            }
        }

        // Stage data: window checks before any bytes land.
        let mut data_overflow = false;
        let mut novel_bytes = 0u64;
        for frame in &packet.frames {
            let Frame::StreamData {
                stream_id,
                offset,
                data,
            } = frame
            else {
                continue;
            };
            let Some((_, guard)) = guards.get(stream_id) else {
                continue;
            };
            let end = offset.saturating_add(data.len() as u64);
            if end > guard.local_max_data {
                tracing::debug!(stream_id, end, "incoming data exceeds the stream window");
                data_overflow = true;
            }
            novel_bytes += end.saturating_sub(guard.incoming.highest_offset());
        }
        if cs.conn_data_in.saturating_add(novel_bytes) > cs.conn_max_data_in {
            tracing::debug!(novel_bytes, "incoming data exceeds the connection window");
            data_overflow = true;
        }

        let accept = fulfillable && !money_overflow && !data_overflow;

        // Commit phase.
        let mut protocol_failure: Option<(ErrorCode, &'static str)> = None;
        if accept {
            for (stream_id, portion) in &portions {
                let (shared, guard) = guards.get_mut(stream_id).expect("staged stream");
                guard.total_received += portion;
                cs.stats.total_received += portion;
                guard.emit(StreamEvent::Money(*portion));
                shared.change.notify_waiters();
            }
            for frame in &packet.frames {
                let Frame::StreamData {
                    stream_id,
                    offset,
                    data,
                } = frame
                else {
                    continue;
                };
                let Some((shared, guard)) = guards.get_mut(stream_id) else {
                    continue;
                };
                let before = guard.incoming.highest_offset();
                match guard.incoming.push(*offset, data) {
                    Ok(()) => {
                        cs.conn_data_in += guard.incoming.highest_offset().saturating_sub(before);
                        if guard.incoming.has_readable() {
                            guard.emit(StreamEvent::Data);
                            shared.change.notify_waiters();
                        }
                    }
                    Err(ErrorCode::FinalOffsetError) => {
                        guard.fail(ErrorCode::FinalOffsetError, "data past the final offset");
                        shared.notify_all();
                    }
                    Err(code) => {
                        protocol_failure = Some((code, "conflicting stream data"));
                        break;
                    }
                }
            }
        }
        if let Some((code, message)) = protocol_failure {
            drop(guards);
            return self
                .protocol_close_reject(&mut cs, packet.sequence, code, message)
                .await;
        }

        // Deferred stream-scoped control frames.
        for frame in &packet.frames {
            match frame {
                Frame::StreamClose {
                    stream_id,
                    code,
                    message,
                } => {
                    if let Some((shared, guard)) = guards.get_mut(stream_id) {
                        apply_remote_stream_close(guard, *code, message);
                        shared.notify_all();
                    }
                }
                Frame::StreamMaxMoney {
                    stream_id,
                    receive_max,
                    total_received,
                } => {
                    if let Some((shared, guard)) = guards.get_mut(stream_id) {
                        guard.remote_receive_max = Some(*receive_max);
                        guard.remote_total_received = *total_received;
                        guard.money_blocked_signaled = false;
                        shared.notify_all();
                    }
                }
                Frame::StreamMaxData {
                    stream_id,
                    max_offset,
                } => {
                    if let Some((shared, guard)) = guards.get_mut(stream_id) {
                        guard.remote_max_data = *max_offset;
                        guard.data_blocked_signaled = false;
                        shared.notify_all();
                    }
                }
                Frame::StreamMoneyBlocked { stream_id, .. } => {
                    tracing::debug!(stream_id, "peer blocked on stream money cap");
                }
                Frame::StreamDataBlocked { stream_id, .. } => {
                    tracing::debug!(stream_id, "peer blocked on stream data window");
                }
                Frame::StreamReceipt { stream_id, receipt } => {
                    if let Some((_, guard)) = guards.get_mut(stream_id) {
                        record_receipt(guard, receipt);
                    }
                }
                _ => {}
            }
        }

        // Build the reply: asset details on the first reply, then the
        // current caps and windows for every touched stream.
        let mut reply_frames = Vec::new();
        if !cs.sent_asset_details {
            reply_frames.push(Frame::ConnectionAssetDetails {
                asset_code: cs.asset_code.clone(),
                asset_scale: cs.asset_scale,
            });
            cs.sent_asset_details = true;
        }
        if cs.advertised_max_stream_id != cs.local_max_stream_id {
            reply_frames.push(Frame::ConnectionMaxStreamId {
                max_stream_id: cs.local_max_stream_id,
            });
            cs.advertised_max_stream_id = cs.local_max_stream_id;
        }

        let receipts = self.config.receipt_nonce.zip(self.config.receipt_secret);
        for (stream_id, (shared, guard)) in guards.iter_mut() {
            reply_frames.push(Frame::StreamMaxMoney {
                stream_id: *stream_id,
                receive_max: guard.receive_max.on_wire(),
                total_received: guard.total_received,
            });
            guard.advertised_receive_max = Some(guard.receive_max.on_wire());

            guard.advance_receive_window();
            reply_frames.push(Frame::StreamMaxData {
                stream_id: *stream_id,
                max_offset: guard.local_max_data,
            });
            guard.advertised_max_data = guard.local_max_data;

            if accept && guard.total_received > 0 {
                if let Some((nonce, secret)) = &receipts {
                    match create_receipt(nonce, *stream_id, guard.total_received, secret) {
                        Ok(blob) => {
                            guard.receipt = Some(blob.to_vec());
                            reply_frames.push(Frame::StreamReceipt {
                                stream_id: *stream_id,
                                receipt: blob.to_vec(),
                            });
                            shared.change.notify_waiters();
                        }
                        Err(err) => {
                            tracing::warn!(stream_id, %err, "cannot issue receipt")
                        }
                    }
                }
            }
        }

        cs.conn_max_data_in = cs.conn_data_in.saturating_add(DEFAULT_CONNECTION_WINDOW);
        if cs.advertised_conn_max_data != cs.conn_max_data_in {
            reply_frames.push(Frame::ConnectionMaxData {
                max_offset: cs.conn_max_data_in,
            });
            cs.advertised_conn_max_data = cs.conn_max_data_in;
        }

        // Streams with both directions closed and nothing in flight are
        // done; forget them.
        let finished: Vec<u64> = guards
            .iter()
            .filter(|(_, (_, g))| g.state == StreamState::Closed && g.is_drained())
            .map(|(id, _)| *id)
            .collect();

        if let Some((code, message)) = &remote_close {
            tracing::info!(code = ?code, message = %message, "remote closed the connection");
            reply_frames.push(Frame::ConnectionClose {
                code: ErrorCode::NoError,
                message: String::new(),
            });
            let code = *code;
            let message = message.clone();
            drop(guards);
            self.apply_remote_connection_close(&mut cs, code, &message).await;
        } else {
            drop(guards);
        }
        for stream_id in finished {
            cs.streams.remove(&stream_id);
        }

        let reply_type = if accept {
            IlpPacketType::Fulfill
        } else {
            IlpPacketType::Reject
        };
        let reply = Packet::new(packet.sequence, reply_type, prepare.amount, reply_frames);

        if accept {
            let data = reply.encrypt(&self.encryption_key).unwrap_or_default();
            IlpPacket::Fulfill(crate::ilp::Fulfill { fulfillment, data })
        } else {
            self.encrypted_reject(&cs, &reply)
        }
    }

    /// Apply a remote `ConnectionClose`: graceful closes end the streams,
    /// abnormal ones fail them.
    async fn apply_remote_connection_close(
        &self,
        cs: &mut ConnState,
        code: ErrorCode,
        message: &str,
    ) {
        cs.close_reason.get_or_insert((code, message.to_string()));
        let streams: Vec<Arc<StreamShared>> = cs.streams.values().cloned().collect();
        for shared in streams {
            let mut st = Arc::clone(&shared.state).lock_owned().await;
            if code == ErrorCode::NoError {
                apply_remote_stream_close(&mut st, ErrorCode::NoError, "");
            } else {
                st.fail(code, message);
            }
            drop(st);
            shared.notify_all();
        }
        self.finish_close_locked(cs, code);
    }

    // ----- outbound --------------------------------------------------------

    /// Plan the next outbound packet, committing holds and in-flight data.
    async fn build_plan(&self) -> PlanResult {
        let mut cs = self.state.lock().await;
        if cs.state == ConnectionState::Closed {
            return PlanResult::Exit;
        }
        if cs.state == ConnectionState::Opening && !self.is_server {
            // The exchange-rate probe owns the single in-flight slot until
            // the connection opens.
            return PlanResult::Idle;
        }
        let Some(destination) = cs.destination_account.clone() else {
            if let Some(code) = cs.close_requested {
                // Nowhere to deliver a close frame; finish locally.
                self.finish_close_locked(&mut cs, code);
                return PlanResult::Exit;
            }
            return PlanResult::Idle;
        };

        let mut frames: Vec<Frame> = Vec::new();
        let mut advertisements = Advertisements::default();
        let mut stream_closes: Vec<u64> = Vec::new();

        // Lock every stream up front, ascending ids.
        let stream_list: Vec<(u64, Arc<StreamShared>)> = cs
            .streams
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();
        let mut guards: BTreeMap<u64, (Arc<StreamShared>, OwnedMutexGuard<StreamStateInner>)> =
            BTreeMap::new();
        for (id, shared) in stream_list {
            let guard = Arc::clone(&shared.state).lock_owned().await;
            guards.insert(id, (shared, guard));
        }

        // Money allocation.
        let capacities: Vec<(u64, u64)> = guards
            .iter()
            .filter(|(_, (_, g))| g.send_capacity() > 0)
            .map(|(id, (_, g))| (*id, g.send_capacity()))
            .collect();
        let capacity_sum: u128 = capacities.iter().map(|(_, c)| u128::from(*c)).sum();
        let ceiling = cs.max_packet_amount.min(cs.congestion.ceiling());
        let amount = u64::try_from(capacity_sum.min(u128::from(ceiling))).unwrap_or(ceiling);
        let stream_amounts = apportion_with_caps(amount, &capacities);
        for (stream_id, amt) in &stream_amounts {
            frames.push(Frame::StreamMoney {
                stream_id: *stream_id,
                shares: *amt,
            });
        }

        // Money blocked signals.
        for (id, (_, guard)) in guards.iter_mut() {
            if guard.is_money_blocked() && !guard.money_blocked_signaled {
                frames.push(Frame::StreamMoneyBlocked {
                    stream_id: *id,
                    send_max: guard.send_max,
                    total_sent: guard.total_sent,
                });
                guard.money_blocked_signaled = true;
            }
        }

        // Advertise receive caps and windows that changed since the remote
        // last confirmed them.
        if !cs.sent_asset_details {
            frames.push(Frame::ConnectionAssetDetails {
                asset_code: cs.asset_code.clone(),
                asset_scale: cs.asset_scale,
            });
            advertisements.asset_details = true;
        }
        for (id, (_, guard)) in guards.iter() {
            let cap = guard.receive_max.on_wire();
            if guard.advertised_receive_max != Some(cap) {
                frames.push(Frame::StreamMaxMoney {
                    stream_id: *id,
                    receive_max: cap,
                    total_received: guard.total_received,
                });
                advertisements.receive_caps.push((*id, cap));
            }
            if guard.advertised_max_data != guard.local_max_data {
                frames.push(Frame::StreamMaxData {
                    stream_id: *id,
                    max_offset: guard.local_max_data,
                });
                advertisements.stream_windows.push((*id, guard.local_max_data));
            }
        }
        if cs.advertised_conn_max_data != cs.conn_max_data_in {
            frames.push(Frame::ConnectionMaxData {
                max_offset: cs.conn_max_data_in,
            });
            advertisements.conn_window = Some(cs.conn_max_data_in);
        }
        if cs.advertised_max_stream_id != cs.local_max_stream_id {
            frames.push(Frame::ConnectionMaxStreamId {
                max_stream_id: cs.local_max_stream_id,
            });
            advertisements.max_stream_id = Some(cs.local_max_stream_id);
        }

        // Data frames, lowest stream id first, within the packet budget and
        // the remote's stream and connection windows.
        let mut budget = TARGET_PACKET_SIZE.saturating_sub(512);
        let mut data_streams: Vec<(u64, usize)> = Vec::new();
        let mut planned_data: BTreeMap<u64, Vec<(u64, Vec<u8>)>> = BTreeMap::new();
        for (id, (_, guard)) in guards.iter_mut() {
            let mut taken = 0usize;
            while budget > 64 {
                let Some((offset, chunk)) = guard.outgoing.pop_front() else {
                    break;
                };
                let window_room = guard.remote_max_data.saturating_sub(offset);
                let conn_room = match cs.conn_max_data_out {
                    Some(max) => max.saturating_sub(cs.conn_data_out),
                    None => u64::MAX,
                };
                let take = chunk
                    .len()
                    .min(budget - 64)
                    .min(usize::try_from(window_room.min(conn_room)).unwrap_or(usize::MAX));
                if take == 0 {
                    let blocked_on_conn = conn_room < window_room;
                    guard.outgoing.push_front((offset, chunk));
                    if blocked_on_conn {
                        if !cs.conn_data_blocked_signaled {
                            frames.push(Frame::ConnectionDataBlocked {
                                max_offset: cs.conn_max_data_out.unwrap_or(0),
                            });
                            cs.conn_data_blocked_signaled = true;
                        }
                    } else if window_room == 0 && !guard.data_blocked_signaled {
                        frames.push(Frame::StreamDataBlocked {
                            stream_id: *id,
                            max_offset: guard.remote_max_data,
                        });
                        guard.data_blocked_signaled = true;
                    }
                    break;
                }
                let (head, rest) = chunk.split_at(take);
                if !rest.is_empty() {
                    guard
                        .outgoing
                        .push_front((offset + take as u64, rest.to_vec()));
                }
                frames.push(Frame::StreamData {
                    stream_id: *id,
                    offset,
                    data: head.to_vec(),
                });
                planned_data
                    .entry(*id)
                    .or_default()
                    .push((offset, head.to_vec()));
                cs.conn_data_out += take as u64;
                budget = budget.saturating_sub(take + 16);
                taken += take;
            }
            if taken > 0 {
                data_streams.push((*id, taken));
            }
        }

        // Stream closes ride only after a stream is fully drained.
        for (id, (_, guard)) in guards.iter_mut() {
            if guard.sent_end {
                continue;
            }
            if let Some((code, message)) = guard.error.clone() {
                frames.push(Frame::StreamClose {
                    stream_id: *id,
                    code,
                    message,
                });
                stream_closes.push(*id);
            } else if guard.end_requested && guard.is_drained() && guard.send_capacity() == 0 {
                frames.push(Frame::StreamClose {
                    stream_id: *id,
                    code: ErrorCode::NoError,
                    message: String::new(),
                });
                stream_closes.push(*id);
            }
        }

        // Connection close: immediately when destroying, after the drain
        // when ending gracefully.
        let mut connection_close = None;
        if let Some(code) = cs.close_requested {
            let drained = amount == 0
                && data_streams.is_empty()
                && guards.values().all(|(_, g)| g.is_drained());
            if code != ErrorCode::NoError || drained {
                frames.push(Frame::ConnectionClose {
                    code,
                    message: String::new(),
                });
                connection_close = Some(code);
            }
        }

        let nothing_to_send = amount == 0
            && frames.is_empty()
            && connection_close.is_none()
            && stream_closes.is_empty();
        if nothing_to_send {
            return PlanResult::Idle;
        }

        let Some(sequence) = take_sequence(&mut cs) else {
            drop(guards);
            self.fail_connection(
                &mut cs,
                ErrorCode::ProtocolViolation,
                "packet sequence space exhausted",
            )
            .await;
            return PlanResult::Exit;
        };

        // Commit holds and in-flight data.
        for (stream_id, amt) in &stream_amounts {
            let (_, guard) = guards.get_mut(stream_id).expect("planned stream");
            guard.holds.insert(sequence, *amt);
        }
        for (stream_id, chunks) in planned_data {
            let (_, guard) = guards.get_mut(&stream_id).expect("planned stream");
            guard.in_flight_data.insert(sequence, chunks);
        }
        drop(guards);

        cs.congestion.mark_in_flight();
        cs.stats.packets_sent += 1;

        let packet = Packet::new(sequence, IlpPacketType::Prepare, amount, frames);
        let ciphertext = match packet.encrypt(&self.encryption_key) {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(%err, "failed to seal outbound packet");
                self.fail_connection(&mut cs, ErrorCode::InternalError, "encryption failed")
                    .await;
                return PlanResult::Exit;
            }
        };
        let execution_condition =
            crypto::condition(&crypto::fulfillment(&self.fulfillment_key, &ciphertext));

        let prepare = Prepare {
            amount,
            expires_at: self.expiry(),
            execution_condition,
            destination,
            data: ciphertext,
        };
        let plan = PacketPlan {
            sequence,
            amount,
            stream_amounts,
            data_streams,
            stream_closes,
            connection_close,
            advertisements,
            execution_condition,
        };
        PlanResult::Send(prepare, plan)
    }

    /// Send a planned packet and apply the response.
    async fn dispatch(&self, prepare: Prepare, plan: PacketPlan) {
        let deadline = prepare.expires_at - Utc::now();
        let timeout = deadline
            .to_std()
            .map(|d| d + RESPONSE_GRACE)
            .unwrap_or(RESPONSE_GRACE);
        let request = IlpPacket::Prepare(prepare).encode();

        tracing::trace!(
            sequence = plan.sequence,
            amount = plan.amount,
            "sending prepare"
        );
        let outcome = tokio::time::timeout(timeout, self.plugin.send_data(request)).await;
        match outcome {
            Err(_) => {
                self.on_failed_exchange(plan, codes::R00_TRANSFER_TIMED_OUT, "response timed out")
                    .await;
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                self.on_failed_exchange(plan, codes::T00_INTERNAL_ERROR, &message)
                    .await;
            }
            Ok(Ok(bytes)) => match IlpPacket::decode(&bytes) {
                Ok(IlpPacket::Fulfill(fulfill)) => self.on_fulfill(plan, fulfill).await,
                Ok(IlpPacket::Reject(reject)) => self.on_reject(plan, reject).await,
                _ => {
                    self.on_failed_exchange(plan, codes::F00_BAD_REQUEST, "malformed response")
                        .await;
                }
            },
        }
    }

    /// A response that is not an ILP packet at all. Timeouts are `R00` and
    /// plugin hiccups are `T00`; both release holds, but per the retry
    /// policy only `T*` keeps the connection alive.
    async fn on_failed_exchange(&self, plan: PacketPlan, code: &str, message: &str) {
        let reject = Reject {
            code: code.to_string(),
            triggered_by: String::new(),
            message: message.to_string(),
            data: Vec::new(),
        };
        self.on_reject(plan, reject).await;
    }

    async fn on_fulfill(&self, plan: PacketPlan, fulfill: crate::ilp::Fulfill) {
        let mut cs = self.state.lock().await;
        cs.congestion.clear_in_flight();
        if cs.state == ConnectionState::Closed && plan.connection_close.is_none() {
            // Destroyed while the packet was in flight.
            return;
        }
        cs.consecutive_rejects = 0;

        if crypto::sha256(&fulfill.fulfillment) != plan.execution_condition {
            tracing::warn!(sequence = plan.sequence, "fulfillment does not match condition");
        }

        let reply = Packet::decrypt_and_decode(&self.encryption_key, &fulfill.data).ok();
        if reply.is_none() {
            tracing::warn!(sequence = plan.sequence, "fulfill reply body did not parse");
        }
        let delivered = reply.as_ref().map_or(0, |p| p.prepare_amount);

        // Commit money: holds become totals, delivered shares apportion by
        // the same floor-and-lowest-id rule the amounts did.
        let delivered_shares = apportion_by_shares(delivered, &plan.stream_amounts);
        for (i, (stream_id, amt)) in plan.stream_amounts.iter().enumerate() {
            let Some(shared) = cs.streams.get(stream_id).cloned() else {
                continue;
            };
            let mut guard = Arc::clone(&shared.state).lock_owned().await;
            guard.holds.remove(&plan.sequence);
            guard.total_sent += amt;
            let share = delivered_shares.get(i).map_or(0, |(_, d)| *d);
            guard.total_delivered += share;
            guard.emit(StreamEvent::OutgoingMoney(*amt));
            drop(guard);
            shared.change.notify_waiters();
        }
        for (stream_id, _) in &plan.data_streams {
            if let Some(shared) = cs.streams.get(stream_id).cloned() {
                let mut guard = Arc::clone(&shared.state).lock_owned().await;
                guard.in_flight_data.remove(&plan.sequence);
                drop(guard);
                shared.change.notify_waiters();
            }
        }
        for stream_id in &plan.stream_closes {
            if let Some(shared) = cs.streams.get(stream_id).cloned() {
                let mut guard = Arc::clone(&shared.state).lock_owned().await;
                guard.sent_end = true;
                guard.state = match guard.state {
                    StreamState::RecvClosed | StreamState::Closed => StreamState::Closed,
                    _ if guard.received_end => StreamState::Closed,
                    _ => StreamState::SendClosed,
                };
                let fully_closed = guard.state == StreamState::Closed;
                drop(guard);
                shared.notify_all();
                if fully_closed {
                    cs.streams.remove(stream_id);
                }
            }
        }

        cs.stats.total_sent += plan.amount;
        cs.stats.total_delivered += delivered;
        cs.congestion.on_fulfill();

        if plan.amount > 0 {
            let sample = delivered as f64 / plan.amount as f64;
            let minimum = self.minimum_rate_locked(&cs);
            if let Some(min_rate) = minimum {
                if sample < min_rate {
                    tracing::warn!(
                        sample,
                        min_rate,
                        "packet delivered below the minimum acceptable rate"
                    );
                }
            }
            cs.exchange_rate = Some(match cs.exchange_rate {
                Some(rate) => rate * (1.0 - RATE_EMA_ALPHA) + sample * RATE_EMA_ALPHA,
                None => sample,
            });
        }

        self.confirm_advertisements(&mut cs, &plan.advertisements).await;
        if let Some(reply) = reply {
            self.apply_reply_frames(&mut cs, &reply).await;
        }

        if let Some(code) = plan.connection_close {
            self.finish_close_locked(&mut cs, code);
        }
        drop(cs);
        self.wake.notify_waiters();
        self.change.notify_waiters();
    }

    async fn on_reject(&self, plan: PacketPlan, reject: Reject) {
        let mut cs = self.state.lock().await;
        cs.congestion.clear_in_flight();
        if cs.state == ConnectionState::Closed && plan.connection_close.is_none() {
            return;
        }

        // Release holds and requeue in-flight data; a retry is a brand-new
        // packet.
        for (stream_id, _) in &plan.stream_amounts {
            if let Some(shared) = cs.streams.get(stream_id).cloned() {
                let mut guard = Arc::clone(&shared.state).lock_owned().await;
                guard.holds.remove(&plan.sequence);
                drop(guard);
                shared.change.notify_waiters();
            }
        }
        for (stream_id, bytes) in &plan.data_streams {
            if let Some(shared) = cs.streams.get(stream_id).cloned() {
                let mut guard = Arc::clone(&shared.state).lock_owned().await;
                guard.requeue_in_flight(plan.sequence);
                drop(guard);
                cs.conn_data_out = cs.conn_data_out.saturating_sub(*bytes as u64);
            }
        }

        if plan.connection_close.is_some() {
            // The close packet itself was refused; close anyway.
            self.finish_close_locked(&mut cs, plan.connection_close.unwrap_or(ErrorCode::NoError));
            return;
        }

        let mut backoff = None;
        match reject.code.as_str() {
            codes::F08_AMOUNT_TOO_LARGE => {
                let new_max = match AmountTooLargeData::decode(&reject.data) {
                    Ok(hint) if hint.received_amount > hint.maximum_amount
                        && hint.received_amount > 0 =>
                    {
                        // The hint is in the rejecting connector's scale;
                        // rescale it to our source units.
                        let scaled = u128::from(plan.amount) * u128::from(hint.maximum_amount)
                            / u128::from(hint.received_amount);
                        u64::try_from(scaled).unwrap_or(u64::MAX).max(1)
                    }
                    Ok(hint) => hint.maximum_amount.max(1),
                    Err(_) => plan.amount.saturating_sub(1).max(1),
                };
                cs.max_packet_amount = cs.max_packet_amount.min(new_max);
                cs.congestion.on_congestion();
                let max_packet_amount = cs.max_packet_amount;
                cs.congestion.clamp_to(max_packet_amount);
                cs.consecutive_rejects += 1;
                tracing::debug!(
                    max_packet_amount = cs.max_packet_amount,
                    "path maximum packet amount discovered"
                );
            }
            code => match reject_class(code) {
                RejectClass::Final if code == codes::F99_APPLICATION_ERROR => {
                    cs.consecutive_rejects += 1;
                    if let Ok(reply) =
                        Packet::decrypt_and_decode(&self.encryption_key, &reject.data)
                    {
                        self.confirm_advertisements(&mut cs, &plan.advertisements).await;
                        self.apply_reply_frames(&mut cs, &reply).await;
                    }
                }
                RejectClass::Temporary => {
                    cs.consecutive_rejects += 1;
                    cs.congestion.on_congestion();
                    let exp = cs.consecutive_rejects.saturating_sub(1).min(8);
                    backoff = Some(
                        RETRY_BACKOFF_MIN
                            .saturating_mul(1 << exp)
                            .min(RETRY_BACKOFF_MAX),
                    );
                    tracing::debug!(code, "temporary reject, backing off");
                }
                _ => {
                    tracing::warn!(code, message = %reject.message, "fatal reject");
                    self.fail_connection(
                        &mut cs,
                        ErrorCode::InternalError,
                        &format!("packet rejected with {code}: {}", reject.message),
                    )
                    .await;
                    return;
                }
            },
        }

        if cs.consecutive_rejects > self.config.max_retries {
            self.fail_connection(&mut cs, ErrorCode::InternalError, "send retries exhausted")
                .await;
            return;
        }
        drop(cs);
        if let Some(delay) = backoff {
            tokio::time::sleep(delay).await;
        }
        self.wake.notify_waiters();
    }

    /// Mark advertisements as seen by the remote.
    async fn confirm_advertisements(&self, cs: &mut ConnState, ads: &Advertisements) {
        if ads.asset_details {
            cs.sent_asset_details = true;
        }
        if let Some(window) = ads.conn_window {
            cs.advertised_conn_max_data = window;
        }
        if let Some(max_id) = ads.max_stream_id {
            cs.advertised_max_stream_id = max_id;
        }
        for (stream_id, cap) in &ads.receive_caps {
            if let Some(shared) = cs.streams.get(stream_id).cloned() {
                let mut guard = Arc::clone(&shared.state).lock_owned().await;
                guard.advertised_receive_max = Some(*cap);
            }
        }
        for (stream_id, window) in &ads.stream_windows {
            if let Some(shared) = cs.streams.get(stream_id).cloned() {
                let mut guard = Arc::clone(&shared.state).lock_owned().await;
                guard.advertised_max_data = *window;
            }
        }
    }

    /// Apply the frames of a decrypted reply (fulfill body or F99 body).
    async fn apply_reply_frames(&self, cs: &mut ConnState, reply: &Packet) {
        let mut remote_close = None;
        for frame in &reply.frames {
            match frame {
                Frame::ConnectionAssetDetails {
                    asset_code,
                    asset_scale,
                } => {
                    cs.remote_asset = Some((asset_code.clone(), *asset_scale));
                }
                Frame::ConnectionNewAddress { source_account } => {
                    cs.destination_account = Some(source_account.clone());
                }
                Frame::ConnectionMaxData { max_offset } => {
                    cs.conn_max_data_out = Some(*max_offset);
                    cs.conn_data_blocked_signaled = false;
                }
                Frame::ConnectionMaxStreamId { max_stream_id } => {
                    cs.remote_max_stream_id = *max_stream_id;
                    cs.stream_id_blocked_signaled = false;
                }
                Frame::ConnectionClose { code, message } => {
                    remote_close = Some((*code, message.clone()));
                }
                Frame::StreamMaxMoney {
                    stream_id,
                    receive_max,
                    total_received,
                } => {
                    if let Some(shared) = cs.streams.get(stream_id).cloned() {
                        let mut guard = Arc::clone(&shared.state).lock_owned().await;
                        guard.remote_receive_max = Some(*receive_max);
                        guard.remote_total_received = *total_received;
                        guard.money_blocked_signaled = false;
                        drop(guard);
                        shared.notify_all();
                    }
                }
                Frame::StreamMaxData {
                    stream_id,
                    max_offset,
                } => {
                    if let Some(shared) = cs.streams.get(stream_id).cloned() {
                        let mut guard = Arc::clone(&shared.state).lock_owned().await;
                        guard.remote_max_data = *max_offset;
                        guard.data_blocked_signaled = false;
                        drop(guard);
                        shared.notify_all();
                    }
                }
                Frame::StreamReceipt { stream_id, receipt } => {
                    if let Some(shared) = cs.streams.get(stream_id).cloned() {
                        let mut guard = Arc::clone(&shared.state).lock_owned().await;
                        record_receipt(&mut guard, receipt);
                        drop(guard);
                        shared.change.notify_waiters();
                    }
                }
                Frame::StreamClose {
                    stream_id,
                    code,
                    message,
                } => {
                    if let Some(shared) = cs.streams.get(stream_id).cloned() {
                        let mut guard = Arc::clone(&shared.state).lock_owned().await;
                        apply_remote_stream_close(&mut guard, *code, message);
                        drop(guard);
                        shared.notify_all();
                    }
                }
                _ => {}
            }
        }
        if let Some((code, message)) = remote_close {
            self.apply_remote_connection_close(cs, code, &message).await;
        }
    }

    fn minimum_rate_locked(&self, cs: &ConnState) -> Option<f64> {
        cs.exchange_rate
            .map(|rate| rate * (1.0 - self.config.slippage))
    }

    // ----- exchange-rate probe ---------------------------------------------

    /// Send unfulfillable test packets until one reply carries at least
    /// three significant digits of delivered amount.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Connect` with the exact precision-failure
    /// message when no probe meets the bar.
    pub(crate) async fn establish_exchange_rate(&self) -> Result<()> {
        let mut best: Option<(u64, u64)> = None;
        let mut announce = true;

        for base in PROBE_AMOUNTS {
            let mut amount = {
                let cs = self.state.lock().await;
                base.min(cs.max_packet_amount)
            };
            if let Some((sent, _)) = best {
                if amount <= sent {
                    continue;
                }
            }
            let mut attempts = 0;
            loop {
                attempts += 1;
                if attempts > 4 {
                    break;
                }
                match self.send_test_packet(amount, announce).await? {
                    ProbeOutcome::Delivered(delivered) => {
                        announce = false;
                        tracing::debug!(amount, delivered, "probe packet answered");
                        if delivered >= MIN_PRECISION_DELIVERED
                            && best.map_or(true, |(_, d)| delivered > d)
                        {
                            best = Some((amount, delivered));
                        }
                        break;
                    }
                    ProbeOutcome::AmountTooLarge => {
                        let cs = self.state.lock().await;
                        amount = amount.min(cs.max_packet_amount);
                        continue;
                    }
                    ProbeOutcome::NoInfo => {
                        announce = false;
                        break;
                    }
                }
            }
        }

        match best {
            Some((sent, delivered)) => {
                let mut cs = self.state.lock().await;
                cs.exchange_rate = Some(delivered as f64 / sent as f64);
                cs.state = ConnectionState::Open;
                tracing::info!(
                    rate = delivered as f64 / sent as f64,
                    "exchange rate established"
                );
                drop(cs);
                self.wake.notify_waiters();
                Ok(())
            }
            None => Err(ConnectionError::Connect(
                PRECISION_FAILURE_MESSAGE.to_string(),
            )),
        }
    }

    async fn send_test_packet(&self, amount: u64, announce: bool) -> Result<ProbeOutcome> {
        let prepare_bytes = {
            let mut cs = self.state.lock().await;
            let Some(destination) = cs.destination_account.clone() else {
                return Err(ConnectionError::Connect(
                    "destination account unknown".to_string(),
                ));
            };
            let Some(sequence) = take_sequence(&mut cs) else {
                self.fail_connection(
                    &mut cs,
                    ErrorCode::ProtocolViolation,
                    "packet sequence space exhausted",
                )
                .await;
                return Err(ConnectionError::Closed {
                    code: ErrorCode::ProtocolViolation,
                    message: "packet sequence space exhausted".to_string(),
                });
            };
            let mut frames = Vec::new();
            if announce {
                frames.push(Frame::ConnectionNewAddress {
                    source_account: cs.source_account.clone(),
                });
                frames.push(Frame::ConnectionAssetDetails {
                    asset_code: cs.asset_code.clone(),
                    asset_scale: cs.asset_scale,
                });
            }
            let packet = Packet::new(sequence, IlpPacketType::Prepare, amount, frames);
            let ciphertext = packet.encrypt(&self.encryption_key)?;
            cs.stats.packets_sent += 1;

            let prepare = Prepare {
                amount,
                expires_at: self.expiry(),
                execution_condition: random::random_condition()
                    .map_err(ConnectionError::Crypto)?,
                destination,
                data: ciphertext,
            };
            IlpPacket::Prepare(prepare).encode()
        };

        let response = tokio::time::timeout(
            Duration::from_secs(30) + RESPONSE_GRACE,
            self.plugin.send_data(prepare_bytes),
        )
        .await;
        let bytes = match response {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                tracing::debug!(%err, "probe send failed");
                return Ok(ProbeOutcome::NoInfo);
            }
            Err(_) => return Ok(ProbeOutcome::NoInfo),
        };

        match IlpPacket::decode(&bytes) {
            Ok(IlpPacket::Reject(reject)) if reject.code == codes::F08_AMOUNT_TOO_LARGE => {
                let mut cs = self.state.lock().await;
                let new_max = match AmountTooLargeData::decode(&reject.data) {
                    Ok(hint)
                        if hint.received_amount > hint.maximum_amount
                            && hint.received_amount > 0 =>
                    {
                        let scaled = u128::from(amount) * u128::from(hint.maximum_amount)
                            / u128::from(hint.received_amount);
                        u64::try_from(scaled).unwrap_or(u64::MAX).max(1)
                    }
                    Ok(hint) => hint.maximum_amount.max(1),
                    Err(_) => amount.saturating_sub(1).max(1),
                };
                if new_max >= amount {
                    // The hint does not shrink the probe; treat as opaque.
                    return Ok(ProbeOutcome::NoInfo);
                }
                cs.max_packet_amount = cs.max_packet_amount.min(new_max);
                let max_packet_amount = cs.max_packet_amount;
                cs.congestion.clamp_to(max_packet_amount);
                Ok(ProbeOutcome::AmountTooLarge)
            }
            Ok(IlpPacket::Reject(reject)) => {
                match Packet::decrypt_and_decode(&self.encryption_key, &reject.data) {
                    Ok(reply) => {
                        let mut cs = self.state.lock().await;
                        if announce {
                            // A decrypted reply proves the peer processed
                            // the announcement frames.
                            cs.sent_asset_details = true;
                        }
                        let delivered = reply.prepare_amount;
                        self.apply_reply_frames(&mut cs, &reply).await;
                        Ok(ProbeOutcome::Delivered(delivered))
                    }
                    Err(_) => Ok(ProbeOutcome::NoInfo),
                }
            }
            Ok(IlpPacket::Fulfill(fulfill)) => {
                // Test packets carry random conditions, so this is
                // unexpected, but a parsable body is still an oracle.
                match Packet::decrypt_and_decode(&self.encryption_key, &fulfill.data) {
                    Ok(reply) => {
                        let mut cs = self.state.lock().await;
                        if announce {
                            cs.sent_asset_details = true;
                        }
                        let delivered = reply.prepare_amount;
                        self.apply_reply_frames(&mut cs, &reply).await;
                        Ok(ProbeOutcome::Delivered(delivered))
                    }
                    Err(_) => Ok(ProbeOutcome::NoInfo),
                }
            }
            Ok(IlpPacket::Prepare(_)) => Ok(ProbeOutcome::NoInfo),
            Err(_) => Ok(ProbeOutcome::NoInfo),
        }
    }
}

fn apply_remote_stream_close(guard: &mut StreamStateInner, code: ErrorCode, message: &str) {
    if code != ErrorCode::NoError {
        guard.fail(code, message);
        return;
    }
    guard.received_end = true;
    let final_offset = guard.incoming.highest_offset();
    if guard.incoming.set_end_offset(final_offset).is_err() {
        guard.fail(ErrorCode::FinalOffsetError, "conflicting final offset");
        return;
    }
    guard.state = match guard.state {
        StreamState::SendClosed | StreamState::Closed => StreamState::Closed,
        _ => StreamState::RecvClosed,
    };
    guard.maybe_emit_end();
}

/// Keep only monotonically newer receipts.
fn record_receipt(guard: &mut StreamStateInner, blob: &[u8]) {
    let Ok(decoded) = decode_receipt(blob) else {
        tracing::debug!("ignoring malformed receipt");
        return;
    };
    let newer = match &guard.receipt {
        Some(existing) => decode_receipt(existing)
            .map(|prev| decoded.total_received >= prev.total_received)
            .unwrap_or(true),
        None => true,
    };
    if newer {
        guard.receipt = Some(blob.to_vec());
    }
}

/// The send loop: at most one Prepare in flight, woken by state changes.
async fn run_send_loop(inner: Arc<ConnectionInner>) {
    loop {
        let mut notified = pin!(inner.wake.notified());
        notified.as_mut().enable();
        match inner.build_plan().await {
            PlanResult::Exit => break,
            PlanResult::Send(prepare, plan) => {
                inner.dispatch(prepare, plan).await;
            }
            PlanResult::Idle => notified.await,
        }
    }
    tracing::debug!("send loop exited");
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        plugin: Arc<dyn Plugin>,
        shared_secret: &[u8; 32],
        is_server: bool,
        owns_data_handler: bool,
        source_account: String,
        destination_account: Option<String>,
        asset_code: String,
        asset_scale: u8,
        connection_tag: Option<String>,
        config: ConnectionConfig,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            plugin,
            encryption_key: crypto::derive_encryption_key(shared_secret),
            fulfillment_key: Zeroizing::new(crypto::derive_fulfillment_key(shared_secret)),
            is_server,
            owns_data_handler,
            connection_tag,
            config,
            state: Mutex::new(ConnState {
                state: ConnectionState::Opening,
                source_account,
                destination_account,
                asset_code,
                asset_scale,
                remote_asset: None,
                sent_asset_details: false,
                next_sequence: 1,
                last_inbound_sequence: 0,
                max_packet_amount: u64::MAX,
                congestion: AimdState::default(),
                exchange_rate: None,
                streams: BTreeMap::new(),
                next_stream_id: if is_server { 2 } else { 1 },
                local_max_stream_id: DEFAULT_MAX_STREAM_ID,
                advertised_max_stream_id: DEFAULT_MAX_STREAM_ID,
                remote_max_stream_id: u64::MAX,
                stream_id_blocked_signaled: false,
                conn_max_data_in: DEFAULT_CONNECTION_WINDOW,
                advertised_conn_max_data: DEFAULT_CONNECTION_WINDOW,
                conn_data_in: 0,
                conn_max_data_out: None,
                conn_data_out: 0,
                conn_data_blocked_signaled: false,
                close_requested: None,
                close_reason: None,
                consecutive_rejects: 0,
                stats: ConnectionStats::default(),
                incoming_tx: Some(incoming_tx),
            }),
            wake: Arc::new(Notify::new()),
            change: Notify::new(),
            incoming_rx: Mutex::new(incoming_rx),
        });
        Self { inner }
    }

    /// Spawn the outbound send loop.
    pub(crate) fn start(&self) {
        tokio::spawn(run_send_loop(Arc::clone(&self.inner)));
    }

    pub(crate) fn handler(&self) -> Arc<ConnectionHandler> {
        Arc::new(ConnectionHandler(Arc::clone(&self.inner)))
    }

    /// Open a new stream on this connection.
    pub async fn create_stream(&self) -> Stream {
        let mut cs = self.inner.state.lock().await;
        let stream_id = cs.next_stream_id;
        cs.next_stream_id += 2;
        if stream_id > cs.remote_max_stream_id && !cs.stream_id_blocked_signaled {
            cs.stream_id_blocked_signaled = true;
            tracing::debug!(stream_id, "stream id exceeds the remote window");
        }
        let shared = StreamShared::new(stream_id, Arc::clone(&self.inner.wake));
        cs.streams.insert(stream_id, Arc::clone(&shared));
        drop(cs);
        self.inner.wake.notify_waiters();
        Stream::new(shared)
    }

    /// Receive the next stream opened by the remote. Returns `None` once the
    /// connection is closed.
    pub async fn accept_stream(&self) -> Option<Stream> {
        self.inner.incoming_rx.lock().await.recv().await
    }

    /// Gracefully close: drain pending sends, deliver `ConnectionClose`,
    /// then detach.
    ///
    /// # Errors
    ///
    /// Returns the close reason if the connection failed while draining.
    pub async fn end(&self) -> Result<()> {
        {
            let mut cs = self.inner.state.lock().await;
            if cs.state == ConnectionState::Closed {
                return Ok(());
            }
            cs.state = ConnectionState::Closing;
            cs.close_requested.get_or_insert(ErrorCode::NoError);
        }
        self.inner.wake.notify_waiters();
        self.await_close().await
    }

    /// Abruptly close: fail every stream and deliver
    /// `ConnectionClose{ApplicationError}` without draining.
    pub async fn destroy(&self) {
        {
            let mut cs = self.inner.state.lock().await;
            if cs.state == ConnectionState::Closed {
                return;
            }
            cs.state = ConnectionState::Closing;
            cs.close_requested = Some(ErrorCode::ApplicationError);
            let streams: Vec<Arc<StreamShared>> = cs.streams.values().cloned().collect();
            for shared in streams {
                let mut st = Arc::clone(&shared.state).lock_owned().await;
                st.fail(ErrorCode::ApplicationError, "connection destroyed");
                drop(st);
                shared.notify_all();
            }
        }
        self.inner.wake.notify_waiters();
        let _ = self.await_close().await;
    }

    async fn await_close(&self) -> Result<()> {
        loop {
            let mut notified = pin!(self.inner.change.notified());
            notified.as_mut().enable();
            {
                let cs = self.inner.state.lock().await;
                if cs.state == ConnectionState::Closed {
                    return match &cs.close_reason {
                        Some((code, message))
                            if code.is_fatal_for_connection() =>
                        {
                            Err(ConnectionError::Closed {
                                code: *code,
                                message: message.clone(),
                            })
                        }
                        _ => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.state.lock().await.state
    }

    /// Total source units fulfilled across all streams.
    pub async fn total_sent(&self) -> u64 {
        self.inner.state.lock().await.stats.total_sent
    }

    /// Total destination units delivered across all streams.
    pub async fn total_delivered(&self) -> u64 {
        self.inner.state.lock().await.stats.total_delivered
    }

    /// Total local units received across all streams.
    pub async fn total_received(&self) -> u64 {
        self.inner.state.lock().await.stats.total_received
    }

    /// Packet counters.
    pub async fn stats(&self) -> ConnectionStats {
        self.inner.state.lock().await.stats
    }

    /// Observed exchange rate (destination units per source unit).
    pub async fn exchange_rate(&self) -> Option<f64> {
        self.inner.state.lock().await.exchange_rate
    }

    /// Observed rate degraded by the configured slippage.
    pub async fn minimum_acceptable_exchange_rate(&self) -> Option<f64> {
        let cs = self.inner.state.lock().await;
        self.inner.minimum_rate_locked(&cs)
    }

    /// Path-discovered maximum packet amount, if any `F08` arrived.
    pub async fn max_packet_amount(&self) -> Option<u64> {
        let cs = self.inner.state.lock().await;
        (cs.max_packet_amount != u64::MAX).then_some(cs.max_packet_amount)
    }

    /// Tag the server operator attached to this connection's token.
    #[must_use]
    pub fn connection_tag(&self) -> Option<&str> {
        self.inner.connection_tag.as_deref()
    }

    /// Remote asset details, once announced.
    pub async fn remote_asset_details(&self) -> Option<(String, u8)> {
        self.inner.state.lock().await.remote_asset.clone()
    }

    /// Reason the connection closed, once it has.
    pub async fn close_reason(&self) -> Option<(ErrorCode, String)> {
        self.inner.state.lock().await.close_reason.clone()
    }

    /// This endpoint's ILP address.
    pub async fn source_account(&self) -> String {
        self.inner.state.lock().await.source_account.clone()
    }

    /// The peer's ILP address, once known.
    pub async fn destination_account(&self) -> Option<String> {
        self.inner.state.lock().await.destination_account.clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("is_server", &self.inner.is_server)
            .field("tag", &self.inner.connection_tag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apportion_with_caps_proportional() {
        let parts = vec![(1, 100), (3, 300)];
        let out = apportion_with_caps(200, &parts);
        assert_eq!(out, vec![(1, 50), (3, 150)]);
    }

    #[test]
    fn test_apportion_with_caps_remainder_to_lowest() {
        let parts = vec![(1, 10), (3, 10), (5, 10)];
        // 10 * 1/3 floors to 3 each; remainder 1 goes to stream 1.
        let out = apportion_with_caps(10, &parts);
        assert_eq!(out, vec![(1, 4), (3, 3), (5, 3)]);
    }

    #[test]
    fn test_apportion_with_caps_respects_caps() {
        let parts = vec![(1, 1), (3, 1000)];
        let out = apportion_with_caps(1001, &parts);
        assert_eq!(out.iter().map(|(_, a)| a).sum::<u64>(), 1001);
        for ((_, amount), (_, cap)) in out.iter().zip(&parts) {
            assert!(amount <= cap);
        }
    }

    #[test]
    fn test_apportion_with_caps_zero() {
        assert!(apportion_with_caps(0, &[(1, 10)]).is_empty());
        assert!(apportion_with_caps(10, &[]).is_empty());
    }

    #[test]
    fn test_apportion_by_shares() {
        // 50 units over shares 100: all to the one stream.
        assert_eq!(apportion_by_shares(50, &[(1, 100)]), vec![(1, 50)]);
        // Remainder goes to the lowest stream id.
        assert_eq!(
            apportion_by_shares(10, &[(1, 1), (3, 1), (5, 1)]),
            vec![(1, 4), (3, 3), (5, 3)]
        );
        assert!(apportion_by_shares(10, &[]).is_empty());
        assert!(apportion_by_shares(0, &[(1, 5)]).is_empty());
    }

    #[test]
    fn test_apportion_by_shares_large_values() {
        let out = apportion_by_shares(u64::MAX, &[(1, u64::MAX), (3, u64::MAX)]);
        assert_eq!(out.iter().map(|(_, a)| a).sum::<u64>(), u64::MAX);
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.slippage, DEFAULT_SLIPPAGE);
        assert_eq!(config.max_retries, 10);
        assert!(config.get_expiry.is_none());
        assert!(config.receipt_nonce.is_none());
    }
}
