//! Broker connection
//!
//! A [`TransportConnection`] owns one TCP session at a time. Each session runs a
//! read loop that forwards callbacks to the dispatcher and completes pending
//! requests, plus an optional keep-alive probe. Loss of the session is reported
//! as a `Disconnected`/`AutoReconnect` connection event; reconnecting is left to
//! the caller (see [`crate::reconnect::AutoReconnect`]).

use parking_lot::Mutex;
use stackwire_core::{
    ConnectionEvent, ConnectionReason, ConnectionState, DeviceCallback, Event, Uid, UidError,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::dispatch::EventSink;
use crate::frame::{self, function, Frame, FrameError, BROADCAST_UID, HEADER_LEN};

/// Default broker port
pub const DEFAULT_PORT: u16 = 4223;

/// Sequence numbers available to requests (1..=15)
const SEQUENCE_COUNT: u8 = 15;

/// Error code carried in a response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    InvalidParameter,
    FunctionNotSupported,
    Unknown(u8),
}

impl DeviceErrorCode {
    pub fn from_wire(code: u8) -> Self {
        match code {
            1 => Self::InvalidParameter,
            2 => Self::FunctionNotSupported,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::FunctionNotSupported => write!(f, "function not supported"),
            Self::Unknown(code) => write!(f, "error code {}", code),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("No broker address known, call connect() first")]
    NoAddress,
    #[error("Connection was closed by request")]
    ClosedByRequest,
    #[error("Device {0} is no longer attached")]
    DeviceGone(Uid),
    #[error("Timed out waiting for response from {uid} to function {function_id}")]
    Timeout { uid: Uid, function_id: u8 },
    #[error("Device {uid} rejected function {function_id}: {code}")]
    Device {
        uid: Uid,
        function_id: u8,
        code: DeviceErrorCode,
    },
    #[error(transparent)]
    Uid(#[from] UidError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for a connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Interval of the keep-alive probe (None disables it)
    pub probe_interval: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            probe_interval: Some(Duration::from_secs(5)),
        }
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;
type Waiter = oneshot::Sender<Result<Frame, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PendingKey {
    uid: u32,
    function_id: u8,
    sequence: u8,
}

struct Session {
    id: u64,
    writer: SharedWriter,
    reader: JoinHandle<()>,
    prober: Option<JoinHandle<()>>,
}

impl Session {
    fn abort(self) {
        self.reader.abort();
        if let Some(prober) = self.prober {
            prober.abort();
        }
    }
}

struct Inner {
    events: EventSink,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    address: Mutex<Option<String>>,
    session: Mutex<Option<Session>>,
    pending: Mutex<HashMap<PendingKey, Waiter>>,
    /// Signalled whenever a pending slot is freed
    slot_freed: Notify,
    sequence: AtomicU8,
    next_session: AtomicU64,
    /// Bumped by every disconnect so a connect racing with it is discarded
    epoch: AtomicU64,
    closed_by_request: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn emit(&self, state: ConnectionState, reason: ConnectionReason) {
        self.events
            .emit(Event::Connection(ConnectionEvent::new(state, reason)));
    }

    fn fail_pending(&self) {
        let waiters: Vec<Waiter> = self.pending.lock().drain().map(|(_, w)| w).collect();
        self.slot_freed.notify_waiters();
        for waiter in waiters {
            let _ = waiter.send(Err(TransportError::NotConnected));
        }
    }

    /// Tear down a session that died without being asked to
    fn handle_loss(&self, session_id: u64, cause: &TransportError) {
        let session = {
            let mut slot = self.session.lock();
            match slot.as_ref() {
                Some(session) if session.id == session_id => {
                    let session = slot.take();
                    self.state.send_replace(ConnectionState::Disconnected);
                    self.emit(ConnectionState::Disconnected, ConnectionReason::AutoReconnect);
                    session
                }
                _ => None,
            }
        };

        if let Some(session) = session {
            warn!(session = session_id, error = %cause, "Connection to broker lost");
            session.abort();
            self.fail_pending();
        }
    }

    fn take_pending(&self, key: &PendingKey) -> Option<Waiter> {
        let waiter = self.pending.lock().remove(key);
        if waiter.is_some() {
            self.slot_freed.notify_waiters();
        }
        waiter
    }

    /// Hand an inbound frame to its waiter or the dispatcher
    fn route(&self, frame: Frame) {
        if frame.is_callback() {
            if frame.function_id == function::CALLBACK_ENUMERATE {
                match frame::decode_enumeration(&frame.payload) {
                    Ok(event) => {
                        trace!(uid = %event.uid, reason = ?event.reason, "Enumeration callback");
                        self.events.emit(Event::Enumeration(event));
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed enumeration callback"),
                }
            } else {
                self.events.emit(Event::Callback(DeviceCallback::new(
                    frame.uid,
                    frame.function_id,
                    frame.payload,
                )));
            }
            return;
        }

        let key = PendingKey {
            uid: frame.uid,
            function_id: frame.function_id,
            sequence: frame.sequence,
        };
        let waiter = self.take_pending(&key);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(frame));
            }
            None => trace!(
                uid = frame.uid,
                function_id = frame.function_id,
                sequence = frame.sequence,
                "Response without a waiter"
            ),
        }
    }
}

/// Handle on the broker connection; clones share the same session
#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<Inner>,
}

impl TransportConnection {
    /// Create a disconnected connection that reports events into `events`
    pub fn new(events: EventSink, options: ConnectionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                events,
                options,
                state,
                address: Mutex::new(None),
                session: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                slot_freed: Notify::new(),
                sequence: AtomicU8::new(0),
                next_session: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                closed_by_request: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// True after `disconnect()` until the next `connect()`
    pub fn is_closed_by_request(&self) -> bool {
        self.inner.closed_by_request.load(Ordering::SeqCst)
    }

    /// Address of the last `connect()` call
    pub fn address(&self) -> Option<String> {
        self.inner.address.lock().clone()
    }

    /// Open a session to `address` ("host:port")
    pub async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }

        *self.inner.address.lock() = Some(address.to_string());
        self.inner.closed_by_request.store(false, Ordering::SeqCst);
        self.open(address.to_string(), ConnectionReason::Requested)
            .await
    }

    /// Reopen the session to the last address after an unsolicited loss
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_closed_by_request() {
            return Err(TransportError::ClosedByRequest);
        }
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }

        let address = self.address().ok_or(TransportError::NoAddress)?;
        self.open(address, ConnectionReason::AutoReconnect).await
    }

    async fn open(&self, address: String, reason: ConnectionReason) -> Result<(), TransportError> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.state.send_replace(ConnectionState::Connecting);
        debug!(address = %address, "Connecting to broker");

        let stream = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(source) => {
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(TransportError::Connect { address, source });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();

        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.inner.session.lock();
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            self.inner.state.send_replace(ConnectionState::Disconnected);
            return Err(TransportError::ClosedByRequest);
        }

        let reader = tokio::spawn(read_loop(self.inner.clone(), id, read_half));
        let prober = self
            .inner
            .options
            .probe_interval
            .map(|period| tokio::spawn(probe_loop(self.clone(), period)));
        *slot = Some(Session {
            id,
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            reader,
            prober,
        });
        self.inner.state.send_replace(ConnectionState::Connected);
        self.inner.emit(ConnectionState::Connected, reason);
        drop(slot);

        info!(address = %address, session = id, reason = ?reason, "Connected to broker");
        Ok(())
    }

    /// Close the session; safe to call any number of times
    ///
    /// Pending requests fail with [`TransportError::NotConnected`]. Returns
    /// true if a live session was closed.
    pub fn disconnect(&self) -> bool {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.closed_by_request.store(true, Ordering::SeqCst);

        let session = {
            let mut slot = self.inner.session.lock();
            let session = slot.take();
            self.inner.state.send_replace(ConnectionState::Disconnected);
            if session.is_some() {
                self.inner
                    .emit(ConnectionState::Disconnected, ConnectionReason::Requested);
            }
            session
        };

        match session {
            Some(session) => {
                info!(session = session.id, "Disconnected from broker");
                session.abort();
                self.inner.fail_pending();
                true
            }
            None => false,
        }
    }

    fn next_sequence(&self) -> u8 {
        // cycles through 1..=15, 0 is reserved for callbacks
        let previous = self
            .inner
            .sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |seq| {
                Some(if seq >= SEQUENCE_COUNT { 1 } else { seq + 1 })
            })
            .unwrap_or(0);
        if previous >= SEQUENCE_COUNT {
            1
        } else {
            previous + 1
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let data = frame.encode()?;
        let (id, writer) = {
            let slot = self.inner.session.lock();
            let session = slot.as_ref().ok_or(TransportError::NotConnected)?;
            (session.id, session.writer.clone())
        };

        let result = writer.lock().await.write_all(&data).await;
        if let Err(e) = result {
            self.inner.handle_loss(id, &TransportError::Io(e));
            return Err(TransportError::NotConnected);
        }
        trace!(
            uid = frame.uid,
            function_id = frame.function_id,
            sequence = frame.sequence,
            "Sent frame"
        );
        Ok(())
    }

    /// Send a frame without waiting for a response
    pub async fn send(&self, mut frame: Frame) -> Result<(), TransportError> {
        if frame.sequence == 0 {
            frame.sequence = self.next_sequence();
        }
        self.write_frame(&frame).await
    }

    /// Send a request with the response-expected flag and wait for its response payload
    pub async fn request(
        &self,
        uid: u32,
        function_id: u8,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let deadline = Instant::now() + timeout;
        let timed_out = || TransportError::Timeout {
            uid: Uid::from_wire(uid),
            function_id,
        };

        let (key, rx) = tokio::time::timeout_at(deadline, self.reserve(uid, function_id))
            .await
            .map_err(|_| timed_out())?;

        let frame = Frame::request(uid, function_id, payload)
            .with_sequence(key.sequence)
            .with_response_expected(true);
        if let Err(e) = self.write_frame(&frame).await {
            self.inner.take_pending(&key);
            return Err(e);
        }

        let response = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(TransportError::NotConnected),
            Err(_) => {
                self.inner.take_pending(&key);
                return Err(timed_out());
            }
        };

        match response.error_code {
            0 => Ok(response.payload),
            code => Err(TransportError::Device {
                uid: Uid::from_wire(uid),
                function_id,
                code: DeviceErrorCode::from_wire(code),
            }),
        }
    }

    /// Claim a sequence number not in flight for (uid, function), waiting while all are taken
    async fn reserve(
        &self,
        uid: u32,
        function_id: u8,
    ) -> (PendingKey, oneshot::Receiver<Result<Frame, TransportError>>) {
        loop {
            let freed = self.inner.slot_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            {
                let mut pending = self.inner.pending.lock();
                for _ in 0..SEQUENCE_COUNT {
                    let key = PendingKey {
                        uid,
                        function_id,
                        sequence: self.next_sequence(),
                    };
                    if let Entry::Vacant(slot) = pending.entry(key) {
                        let (tx, rx) = oneshot::channel();
                        slot.insert(tx);
                        return (key, rx);
                    }
                }
            }

            trace!(uid, function_id, "All sequence numbers in flight, waiting");
            freed.await;
        }
    }

    /// Fail every request in flight for `uid` with [`TransportError::DeviceGone`]
    pub fn abandon_device(&self, uid: u32, gone: &Uid) -> usize {
        let waiters: Vec<Waiter> = {
            let mut pending = self.inner.pending.lock();
            let keys: Vec<PendingKey> = pending.keys().filter(|k| k.uid == uid).copied().collect();
            keys.iter().filter_map(|k| pending.remove(k)).collect()
        };
        if !waiters.is_empty() {
            self.inner.slot_freed.notify_waiters();
        }

        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(TransportError::DeviceGone(gone.clone())));
        }
        if count > 0 {
            debug!(uid = %gone, count, "Abandoned requests for released device");
        }
        count
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Frame, TransportError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let length = header[4] as usize;
    if length < HEADER_LEN {
        return Err(FrameError::InvalidLength {
            length: header[4],
            available: HEADER_LEN,
        }
        .into());
    }

    let mut data = vec![0u8; length];
    data[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut data[HEADER_LEN..]).await?;
    Ok(Frame::decode(&data)?)
}

async fn read_loop(inner: Arc<Inner>, session_id: u64, mut reader: OwnedReadHalf) {
    let cause = loop {
        match read_frame(&mut reader).await {
            Ok(frame) => inner.route(frame),
            Err(e) => break e,
        }
    };
    inner.handle_loss(session_id, &cause);
}

async fn probe_loop(connection: TransportConnection, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let probe = Frame::request(BROADCAST_UID, function::DISCONNECT_PROBE, Vec::new());
        if let Err(e) = connection.send(probe).await {
            debug!(error = %e, "Keep-alive probe stopped");
            break;
        }
    }
}
