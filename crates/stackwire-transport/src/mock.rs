//! In-process broker for tests
//!
//! Speaks the frame format over a loopback TCP socket. Devices added with
//! [`MockBroker::add_device`] answer enumerate requests; every request with the
//! response-expected flag is acknowledged unless configured otherwise.

use parking_lot::Mutex;
use stackwire_core::{EnumerationEvent, EnumerationReason, Uid};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::frame::{self, function, Frame, HEADER_LEN};

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;
type Key = (u32, u8);

struct Client {
    writer: SharedWriter,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BrokerState {
    devices: Mutex<Vec<EnumerationEvent>>,
    responses: Mutex<HashMap<Key, Vec<u8>>>,
    failures: Mutex<HashMap<Key, u8>>,
    ignored: Mutex<HashSet<Key>>,
    requests: Mutex<Vec<Frame>>,
    clients: Mutex<Vec<Client>>,
    connections: AtomicUsize,
    changed: Notify,
}

impl BrokerState {
    fn record(&self, frame: Frame) {
        self.requests.lock().push(frame);
        self.changed.notify_waiters();
    }

    fn writers(&self) -> Vec<SharedWriter> {
        self.clients.lock().iter().map(|c| c.writer.clone()).collect()
    }
}

fn key(uid: &Uid, function_id: u8) -> Key {
    (uid.to_wire().unwrap_or(0), function_id)
}

/// Loopback broker
pub struct MockBroker {
    state: Arc<BrokerState>,
    address: SocketAddr,
    accept: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let state = Arc::new(BrokerState::default());

        let accept = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, peer)) = listener.accept().await {
                    debug!(peer = %peer, "Mock broker accepted client");
                    let (reader, writer) = stream.into_split();
                    let writer = Arc::new(tokio::sync::Mutex::new(writer));
                    let task = tokio::spawn(serve_client(state.clone(), reader, writer.clone()));
                    state.clients.lock().push(Client { writer, task });
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    state.changed.notify_waiters();
                }
            })
        };

        Ok(Self {
            state,
            address,
            accept,
        })
    }

    /// "host:port" to pass to `connect()`
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Device reported by enumerate (always as already present)
    pub fn add_device(&self, device: EnumerationEvent) {
        let mut devices = self.state.devices.lock();
        devices.retain(|d| d.uid != device.uid);
        devices.push(device.with_reason(EnumerationReason::AlreadyPresentAtConnect));
    }

    pub fn remove_device(&self, uid: &Uid) {
        self.state.devices.lock().retain(|d| &d.uid != uid);
    }

    /// Payload returned for requests to `function_id` on `uid`
    pub fn set_response(&self, uid: &Uid, function_id: u8, payload: Vec<u8>) {
        self.state.responses.lock().insert(key(uid, function_id), payload);
    }

    /// Answer requests to `function_id` on `uid` with an error code
    pub fn fail_function(&self, uid: &Uid, function_id: u8, code: u8) {
        self.state.failures.lock().insert(key(uid, function_id), code);
    }

    /// Never answer requests to `function_id` on `uid`
    pub fn ignore_function(&self, uid: &Uid, function_id: u8) {
        self.state.ignored.lock().insert(key(uid, function_id));
    }

    /// Push an enumerate callback to every client
    pub async fn send_enumeration(&self, event: &EnumerationEvent) {
        let wire = event.uid.to_wire().unwrap_or(0);
        let callback = Frame::callback(
            wire,
            function::CALLBACK_ENUMERATE,
            frame::encode_enumeration(event),
        );
        self.broadcast(&callback).await;
    }

    /// Push a device callback to every client
    pub async fn send_callback(&self, uid: &Uid, function_id: u8, payload: Vec<u8>) {
        let callback = Frame::callback(uid.to_wire().unwrap_or(0), function_id, payload);
        self.broadcast(&callback).await;
    }

    async fn broadcast(&self, frame: &Frame) {
        let Ok(data) = frame.encode() else {
            return;
        };
        for writer in self.state.writers() {
            let _ = writer.lock().await.write_all(&data).await;
        }
    }

    /// Close every client connection
    pub fn drop_clients(&self) {
        let clients: Vec<Client> = self.state.clients.lock().drain(..).collect();
        for client in clients {
            client.task.abort();
        }
    }

    /// Every frame received so far, in order
    pub fn requests(&self) -> Vec<Frame> {
        self.state.requests.lock().clone()
    }

    pub fn count_requests(&self, function_id: u8) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|f| f.function_id == function_id)
            .count()
    }

    /// Number of connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Wait until a received frame matches `predicate`
    pub async fn wait_for_request<P>(&self, predicate: P, timeout: Duration) -> Option<Frame>
    where
        P: Fn(&Frame) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.state.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let found = self.state.requests.lock().iter().find(|f| predicate(f)).cloned();
                if let Some(frame) = found {
                    return frame;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    /// Wait until at least `count` requests for `function_id` have arrived
    pub async fn wait_for_count(&self, function_id: u8, count: usize, timeout: Duration) -> bool {
        self.wait_until(|| self.count_requests(function_id) >= count, timeout)
            .await
    }

    /// Wait until at least `count` connections have been accepted
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(|| self.connection_count() >= count, timeout).await
    }

    async fn wait_until<C: Fn() -> bool>(&self, condition: C, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.state.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if condition() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept.abort();
        self.drop_clients();
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let length = (header[4] as usize).max(HEADER_LEN);
    let mut data = vec![0u8; length];
    data[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut data[HEADER_LEN..]).await?;
    Frame::decode(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

async fn write_frame(writer: &SharedWriter, frame: &Frame) -> std::io::Result<()> {
    let data = frame
        .encode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.lock().await.write_all(&data).await
}

async fn serve_client(state: Arc<BrokerState>, mut reader: OwnedReadHalf, writer: SharedWriter) {
    while let Ok(request) = read_frame(&mut reader).await {
        trace!(
            uid = request.uid,
            function_id = request.function_id,
            sequence = request.sequence,
            "Mock broker received frame"
        );
        let function_id = request.function_id;
        let uid = request.uid;
        let sequence = request.sequence;
        let response_expected = request.response_expected;
        state.record(request);

        match function_id {
            function::DISCONNECT_PROBE => continue,
            function::ENUMERATE => {
                let devices = state.devices.lock().clone();
                for device in devices {
                    let callback = Frame::callback(
                        device.uid.to_wire().unwrap_or(0),
                        function::CALLBACK_ENUMERATE,
                        frame::encode_enumeration(&device),
                    );
                    if write_frame(&writer, &callback).await.is_err() {
                        return;
                    }
                }
            }
            _ if response_expected => {
                let key = (uid, function_id);
                if state.ignored.lock().contains(&key) {
                    continue;
                }
                let code = state.failures.lock().get(&key).copied().unwrap_or(0);
                let payload = if code == 0 {
                    state.responses.lock().get(&key).cloned().unwrap_or_default()
                } else {
                    Vec::new()
                };
                let response = Frame::request(uid, function_id, payload)
                    .with_sequence(sequence)
                    .with_response_expected(true)
                    .with_error_code(code);
                if write_frame(&writer, &response).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}
