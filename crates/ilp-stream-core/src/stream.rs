//! Per-stream state and the application-facing stream handle.
//!
//! A stream carries money and data independently in both directions. Money
//! accounting is push-based: the application raises `send_max` and the
//! connection's send loop apportions packet amounts across streams, holding
//! in-flight amounts until the Prepare fulfills or rejects. Data is an
//! ordered byte queue outbound and an offset reassembler inbound.
//!
//! The [`Stream`] handle clones cheaply; all state lives behind one mutex
//! shared with the owning connection. The connection locks its own state
//! before any stream state, never the reverse, so the two lock levels
//! cannot deadlock.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::{ConnectionError, ErrorCode, Result};
use crate::reassembly::Reassembler;

/// Default incoming data window advertised per stream.
pub const DEFAULT_STREAM_WINDOW: u64 = 64 * 1024;

/// Outgoing byte queue watermark where `write` starts blocking.
pub const OUTGOING_HIGH_WATERMARK: usize = 64 * 1024;

/// Outgoing byte queue watermark where blocked writers resume.
pub const OUTGOING_LOW_WATERMARK: usize = 16 * 1024;

/// A stream's receive cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMax {
    /// Accept money up to this total
    Finite(u64),
    /// Accept any amount (`u64::MAX` on the wire)
    Unbounded,
}

impl ReceiveMax {
    /// Wire encoding of the cap.
    #[must_use]
    pub fn on_wire(self) -> u64 {
        match self {
            Self::Finite(n) => n,
            Self::Unbounded => u64::MAX,
        }
    }

    /// Decode the wire sentinel.
    #[must_use]
    pub fn from_wire(value: u64) -> Self {
        if value == u64::MAX {
            Self::Unbounded
        } else {
            Self::Finite(value)
        }
    }

    /// True when a credit bringing the total to `new_total` fits the cap.
    #[must_use]
    pub fn allows(self, new_total: u64) -> bool {
        match self {
            Self::Finite(max) => new_total <= max,
            Self::Unbounded => true,
        }
    }
}

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both directions open
    Open,
    /// We closed our sending direction
    SendClosed,
    /// The remote closed its sending direction
    RecvClosed,
    /// Both directions closed
    Closed,
}

/// Observable stream events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Money was received (amount in local units)
    Money(u64),
    /// Money we sent was fulfilled (amount in local units)
    OutgoingMoney(u64),
    /// New bytes are readable
    Data,
    /// The remote finished sending and all bytes were surfaced
    End,
    /// The stream was closed abnormally
    Error(ErrorCode, String),
}

/// Mutable stream state, guarded by [`StreamShared::state`]
pub(crate) struct StreamStateInner {
    // Money, sending side.
    pub(crate) send_max: u64,
    pub(crate) total_sent: u64,
    pub(crate) total_delivered: u64,
    /// In-flight amounts keyed by packet sequence
    pub(crate) holds: HashMap<u64, u64>,

    // Money, receiving side.
    pub(crate) receive_max: ReceiveMax,
    pub(crate) total_received: u64,
    /// Last receive cap advertised to the remote
    pub(crate) advertised_receive_max: Option<u64>,

    // Data, sending side.
    /// Queued chunks as (offset, bytes), ascending offsets
    pub(crate) outgoing: VecDeque<(u64, Vec<u8>)>,
    /// Next fresh offset to assign
    pub(crate) outgoing_offset: u64,
    /// Chunks riding an in-flight packet, keyed by sequence
    pub(crate) in_flight_data: HashMap<u64, Vec<(u64, Vec<u8>)>>,
    /// Remote-advertised window for our outgoing data
    pub(crate) remote_max_data: u64,
    /// Remote receive cap for our money, once advertised
    pub(crate) remote_receive_max: Option<u64>,
    pub(crate) remote_total_received: u64,

    // Data, receiving side.
    pub(crate) incoming: Reassembler,
    /// Window we allow the remote to fill
    pub(crate) local_max_data: u64,
    /// Last window advertised to the remote
    pub(crate) advertised_max_data: u64,

    // Lifecycle.
    pub(crate) state: StreamState,
    /// The application asked for a graceful close
    pub(crate) end_requested: bool,
    /// Our StreamClose frame was delivered
    pub(crate) sent_end: bool,
    /// The remote's StreamClose frame arrived
    pub(crate) received_end: bool,
    pub(crate) end_emitted: bool,
    pub(crate) error: Option<(ErrorCode, String)>,

    /// Latest receipt: observed from the remote (sender side) or emitted
    /// locally (receiver side)
    pub(crate) receipt: Option<Vec<u8>>,

    // Blocked-signal dedup.
    pub(crate) money_blocked_signaled: bool,
    pub(crate) data_blocked_signaled: bool,

    /// A writer hit the high watermark; writes resume below the low one
    write_blocked: bool,

    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<StreamEvent>>,
}

impl StreamStateInner {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            send_max: 0,
            total_sent: 0,
            total_delivered: 0,
            holds: HashMap::new(),
            receive_max: ReceiveMax::Finite(0),
            total_received: 0,
            advertised_receive_max: None,
            outgoing: VecDeque::new(),
            outgoing_offset: 0,
            in_flight_data: HashMap::new(),
            remote_max_data: DEFAULT_STREAM_WINDOW,
            remote_receive_max: None,
            remote_total_received: 0,
            incoming: Reassembler::new(),
            local_max_data: DEFAULT_STREAM_WINDOW,
            advertised_max_data: DEFAULT_STREAM_WINDOW,
            state: StreamState::Open,
            end_requested: false,
            sent_end: false,
            received_end: false,
            end_emitted: false,
            error: None,
            receipt: None,
            money_blocked_signaled: false,
            data_blocked_signaled: false,
            write_blocked: false,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Sum of in-flight holds.
    pub(crate) fn holds_total(&self) -> u64 {
        self.holds.values().sum()
    }

    /// Amount this stream could contribute to the next packet: remaining
    /// send allowance, capped by the remote's advertised receive room.
    pub(crate) fn send_capacity(&self) -> u64 {
        if self.sent_end || self.error.is_some() {
            return 0;
        }
        let committed = self.total_sent.saturating_add(self.holds_total());
        let remaining = self.send_max.saturating_sub(committed);
        match self.remote_receive_max {
            Some(max) => remaining.min(max.saturating_sub(self.remote_total_received)),
            None => remaining,
        }
    }

    /// True when money sending is capped by the remote rather than by
    /// `send_max`.
    pub(crate) fn is_money_blocked(&self) -> bool {
        if self.sent_end || self.error.is_some() {
            return false;
        }
        let committed = self.total_sent.saturating_add(self.holds_total());
        let remaining = self.send_max.saturating_sub(committed);
        remaining > 0 && self.send_capacity() == 0
    }

    /// Queued outgoing bytes (excludes in-flight chunks).
    pub(crate) fn outgoing_bytes(&self) -> usize {
        self.outgoing.iter().map(|(_, c)| c.len()).sum()
    }

    /// True when nothing remains to flush before a graceful close.
    pub(crate) fn is_drained(&self) -> bool {
        self.outgoing.is_empty() && self.in_flight_data.is_empty() && self.holds.is_empty()
    }

    /// Emit an event; the receiver may be gone, which is fine.
    pub(crate) fn emit(&self, event: StreamEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Record an abnormal close and drop any pending work.
    pub(crate) fn fail(&mut self, code: ErrorCode, message: &str) {
        if self.error.is_some() {
            return;
        }
        self.error = Some((code, message.to_string()));
        self.state = StreamState::Closed;
        self.outgoing.clear();
        self.in_flight_data.clear();
        self.holds.clear();
        self.emit(StreamEvent::Error(code, message.to_string()));
    }

    /// Re-queue chunks from a rejected packet, keeping offsets ordered.
    pub(crate) fn requeue_in_flight(&mut self, sequence: u64) {
        if let Some(chunks) = self.in_flight_data.remove(&sequence) {
            for chunk in chunks.into_iter().rev() {
                self.outgoing.push_front(chunk);
            }
        }
    }

    /// Advance the incoming window as the application consumes bytes.
    pub(crate) fn advance_receive_window(&mut self) {
        self.local_max_data = self
            .incoming
            .read_offset()
            .saturating_add(DEFAULT_STREAM_WINDOW);
    }

    /// Mark the remote's sending direction closed and surface `End` once
    /// every byte has been read.
    pub(crate) fn maybe_emit_end(&mut self) {
        if self.received_end
            && !self.end_emitted
            && !self.incoming.has_readable()
            && self.incoming.is_finished()
        {
            self.end_emitted = true;
            self.emit(StreamEvent::End);
        }
    }
}

/// Stream state shared between the handle and the owning connection
pub(crate) struct StreamShared {
    pub(crate) id: u64,
    pub(crate) state: Arc<Mutex<StreamStateInner>>,
    /// Wakes application-level waiters (reads, writes, `send_total`)
    pub(crate) change: Notify,
    /// Wakes the connection's send loop
    pub(crate) conn_wake: Arc<Notify>,
}

impl StreamShared {
    pub(crate) fn new(id: u64, conn_wake: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Arc::new(Mutex::new(StreamStateInner::new())),
            change: Notify::new(),
            conn_wake,
        })
    }

    /// Notify both the application waiters and the send loop.
    pub(crate) fn notify_all(&self) {
        self.change.notify_waiters();
        self.conn_wake.notify_waiters();
    }
}

/// A money-and-data stream multiplexed over a connection
#[derive(Clone)]
pub struct Stream {
    pub(crate) shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    /// Stream id; parity identifies the initiator.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Raise or lower the total amount this stream is allowed to send.
    ///
    /// Takes effect on the send loop's next planning pass.
    pub async fn set_send_max(&self, send_max: u64) {
        let mut st = self.shared.state.lock().await;
        st.send_max = send_max;
        st.money_blocked_signaled = false;
        drop(st);
        self.shared.notify_all();
    }

    /// Current send cap.
    pub async fn send_max(&self) -> u64 {
        self.shared.state.lock().await.send_max
    }

    /// Set the total amount this stream is willing to receive.
    ///
    /// The new cap is advertised to the remote on the next outgoing packet
    /// or reply.
    pub async fn set_receive_max(&self, receive_max: ReceiveMax) {
        let mut st = self.shared.state.lock().await;
        st.receive_max = receive_max;
        drop(st);
        self.shared.notify_all();
    }

    /// Current receive cap.
    pub async fn receive_max(&self) -> ReceiveMax {
        self.shared.state.lock().await.receive_max
    }

    /// Total fulfilled outgoing amount, in our units.
    pub async fn total_sent(&self) -> u64 {
        self.shared.state.lock().await.total_sent
    }

    /// Total delivered to the remote, in its units.
    pub async fn total_delivered(&self) -> u64 {
        self.shared.state.lock().await.total_delivered
    }

    /// Total received, in our units.
    pub async fn total_received(&self) -> u64 {
        self.shared.state.lock().await.total_received
    }

    /// Latest receipt for this stream, when receipts are provisioned.
    pub async fn receipt(&self) -> Option<Vec<u8>> {
        self.shared.state.lock().await.receipt.clone()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> StreamState {
        self.shared.state.lock().await.state
    }

    /// Abnormal-close reason, if the stream failed.
    pub async fn error(&self) -> Option<(ErrorCode, String)> {
        self.shared.state.lock().await.error.clone()
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.shared.state.lock().await.events_rx.take()
    }

    /// Set `send_max` to `amount` and wait until that much has been sent.
    ///
    /// # Errors
    ///
    /// Returns the stream's close error if it fails before `amount` is
    /// reached.
    pub async fn send_total(&self, amount: u64) -> Result<()> {
        {
            let mut st = self.shared.state.lock().await;
            st.send_max = amount;
            st.money_blocked_signaled = false;
        }
        self.shared.notify_all();

        loop {
            let mut notified = pin!(self.shared.change.notified());
            notified.as_mut().enable();
            {
                let st = self.shared.state.lock().await;
                if st.total_sent >= amount {
                    return Ok(());
                }
                if let Some((code, message)) = &st.error {
                    return Err(ConnectionError::Stream {
                        code: *code,
                        message: message.clone(),
                    });
                }
                if st.state == StreamState::Closed || st.sent_end {
                    return Err(ConnectionError::Stream {
                        code: ErrorCode::StreamStateError,
                        message: "stream closed before the requested total was sent".to_string(),
                    });
                }
            }
            notified.await;
        }
    }

    /// Wait until at least `amount` has been received.
    ///
    /// # Errors
    ///
    /// Returns the stream's close error if it fails first.
    pub async fn receive_total(&self, amount: u64) -> Result<()> {
        loop {
            let mut notified = pin!(self.shared.change.notified());
            notified.as_mut().enable();
            {
                let st = self.shared.state.lock().await;
                if st.total_received >= amount {
                    return Ok(());
                }
                if let Some((code, message)) = &st.error {
                    return Err(ConnectionError::Stream {
                        code: *code,
                        message: message.clone(),
                    });
                }
                if st.state == StreamState::Closed {
                    return Err(ConnectionError::Stream {
                        code: ErrorCode::StreamStateError,
                        message: "stream closed before the requested total was received"
                            .to_string(),
                    });
                }
            }
            notified.await;
        }
    }

    /// Queue bytes to send, blocking while the outgoing queue is above the
    /// high watermark.
    ///
    /// # Errors
    ///
    /// Returns `ErrorCode::StreamStateError` if our sending direction is
    /// closed.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        loop {
            let mut notified = pin!(self.shared.change.notified());
            notified.as_mut().enable();
            {
                let mut st = self.shared.state.lock().await;
                if let Some((code, message)) = &st.error {
                    return Err(ConnectionError::Stream {
                        code: *code,
                        message: message.clone(),
                    });
                }
                if st.end_requested || st.sent_end || st.state == StreamState::Closed {
                    return Err(ConnectionError::Stream {
                        code: ErrorCode::StreamStateError,
                        message: "stream is closed for sending".to_string(),
                    });
                }
                let queued = st.outgoing_bytes();
                if queued >= OUTGOING_HIGH_WATERMARK {
                    st.write_blocked = true;
                } else if queued < OUTGOING_LOW_WATERMARK {
                    st.write_blocked = false;
                }
                if !st.write_blocked {
                    let offset = st.outgoing_offset;
                    st.outgoing.push_back((offset, bytes.to_vec()));
                    st.outgoing_offset += bytes.len() as u64;
                    st.data_blocked_signaled = false;
                    drop(st);
                    self.shared.conn_wake.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Read the next in-order chunk, waiting for data to arrive.
    ///
    /// Returns `None` once the remote has finished sending and every byte
    /// has been surfaced, or after the stream fails.
    pub async fn read_chunk(&self) -> Option<Vec<u8>> {
        loop {
            let mut notified = pin!(self.shared.change.notified());
            notified.as_mut().enable();
            {
                let mut st = self.shared.state.lock().await;
                if let Some(chunk) = st.incoming.read() {
                    st.advance_receive_window();
                    st.maybe_emit_end();
                    drop(st);
                    // The grown window should reach the remote.
                    self.shared.conn_wake.notify_waiters();
                    return Some(chunk);
                }
                if st.error.is_some() {
                    return None;
                }
                if st.received_end && st.incoming.is_finished() {
                    st.maybe_emit_end();
                    return None;
                }
                if st.state == StreamState::Closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Read until the remote finishes, concatenating every chunk.
    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Gracefully close our sending direction: drain queued money and data,
    /// then deliver a `StreamClose`.
    ///
    /// # Errors
    ///
    /// Returns the stream's close error if it fails while draining.
    pub async fn end(&self) -> Result<()> {
        {
            let mut st = self.shared.state.lock().await;
            if st.sent_end {
                return Ok(());
            }
            st.end_requested = true;
        }
        self.shared.conn_wake.notify_waiters();

        loop {
            let mut notified = pin!(self.shared.change.notified());
            notified.as_mut().enable();
            {
                let st = self.shared.state.lock().await;
                if st.sent_end {
                    return Ok(());
                }
                if let Some((code, message)) = &st.error {
                    return Err(ConnectionError::Stream {
                        code: *code,
                        message: message.clone(),
                    });
                }
            }
            notified.await;
        }
    }

    /// Abruptly close the stream, dropping queued money and data.
    pub async fn destroy(&self) {
        {
            let mut st = self.shared.state.lock().await;
            st.end_requested = true;
            st.fail(ErrorCode::ApplicationError, "stream destroyed");
        }
        self.shared.notify_all();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.shared.id).finish()
    }
}
