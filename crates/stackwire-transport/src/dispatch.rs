//! Ordered callback dispatch
//!
//! Every inbound event (connection state, enumeration, device callback) goes
//! through one queue and is delivered by one task, in arrival order. Handlers
//! are matched by [`EventFilter`] and invoked with the handler table unlocked,
//! so a handler may register or unregister handlers (including itself).

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use stackwire_core::{ConnectionEvent, EnumerationEvent, Event};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Return type of every handler
pub type HandlerResult = anyhow::Result<()>;

type HandlerFuture = BoxFuture<'static, HandlerResult>;
type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Identifies a registration for [`CallbackDispatcher::unregister`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerToken(u64);

/// Which events a handler receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Connection,
    Enumeration,
    /// Callbacks from any device
    AnyCallback,
    /// Callbacks from one device (by header uid), optionally one function only
    Callback {
        wire_uid: u32,
        function_id: Option<u8>,
    },
}

impl EventFilter {
    pub fn callback(wire_uid: u32, function_id: u8) -> Self {
        Self::Callback {
            wire_uid,
            function_id: Some(function_id),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Self::All, _) => true,
            (Self::Connection, Event::Connection(_)) => true,
            (Self::Enumeration, Event::Enumeration(_)) => true,
            (Self::AnyCallback, Event::Callback(_)) => true,
            (
                Self::Callback {
                    wire_uid,
                    function_id,
                },
                Event::Callback(callback),
            ) => {
                *wire_uid == callback.wire_uid
                    && function_id.map_or(true, |f| f == callback.function_id)
            }
            _ => false,
        }
    }
}

/// A handler failed while processing an event
#[derive(Error, Debug)]
pub enum HandlerFault {
    #[error("Handler {token:?} failed on {kind} event: {error}")]
    Failed {
        token: HandlerToken,
        kind: &'static str,
        error: anyhow::Error,
    },
    #[error("Handler {token:?} panicked on {kind} event: {message}")]
    Panicked {
        token: HandlerToken,
        kind: &'static str,
        message: String,
    },
}

/// Returned by [`CallbackDispatcher::spawn`] when the delivery task already exists
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Dispatcher is already running")]
pub struct DispatcherRunning;

enum Envelope {
    Event(Event),
    Stop,
}

/// Producer side of the dispatch queue
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSink {
    /// Queue an event; returns false once the queue is gone
    pub fn emit(&self, event: Event) -> bool {
        self.tx.send(Envelope::Event(event)).is_ok()
    }
}

struct Registration {
    token: HandlerToken,
    filter: EventFilter,
    handler: Handler,
}

struct Shared {
    handlers: Mutex<Vec<Registration>>,
    next_token: AtomicU64,
    sink: EventSink,
    queue: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    faults: AtomicU64,
    delivered: AtomicU64,
}

/// Single ordered delivery path for inbound events
#[derive(Clone)]
pub struct CallbackDispatcher {
    shared: Arc<Shared>,
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                handlers: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
                sink: EventSink { tx },
                queue: Mutex::new(Some(rx)),
                faults: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Sink for the connection's read loop
    pub fn sink(&self) -> EventSink {
        self.shared.sink.clone()
    }

    /// Register an async handler
    pub fn register_async<F, Fut>(&self, filter: EventFilter, handler: F) -> HandlerToken
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        let token = HandlerToken(self.shared.next_token.fetch_add(1, Ordering::SeqCst));
        trace!(token = token.0, filter = ?filter, "Registered handler");
        self.shared.handlers.lock().push(Registration {
            token,
            filter,
            handler,
        });
        token
    }

    /// Register a synchronous handler
    pub fn register<F>(&self, filter: EventFilter, handler: F) -> HandlerToken
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_async(filter, move |event| {
            let result = handler(&event);
            async move { result }
        })
    }

    pub fn on_connection<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(ConnectionEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(EventFilter::Connection, move |event| match event {
            Event::Connection(connection) => handler(*connection),
            _ => Ok(()),
        })
    }

    pub fn on_enumeration<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(&EnumerationEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(EventFilter::Enumeration, move |event| match event {
            Event::Enumeration(enumeration) => handler(enumeration),
            _ => Ok(()),
        })
    }

    /// Remove a handler; returns false if the token was not registered
    pub fn unregister(&self, token: HandlerToken) -> bool {
        let mut handlers = self.shared.handlers.lock();
        let before = handlers.len();
        handlers.retain(|r| r.token != token);
        before != handlers.len()
    }

    fn is_registered(&self, token: HandlerToken) -> bool {
        self.shared.handlers.lock().iter().any(|r| r.token == token)
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers.lock().len()
    }

    /// Number of handler failures and panics caught so far
    pub fn fault_count(&self) -> u64 {
        self.shared.faults.load(Ordering::SeqCst)
    }

    /// Number of events taken off the queue so far
    pub fn delivered_count(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Start the delivery task
    pub fn spawn(&self) -> Result<JoinHandle<()>, DispatcherRunning> {
        let mut rx = self.shared.queue.lock().take().ok_or(DispatcherRunning)?;
        let dispatcher = self.clone();

        Ok(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Event(event) => dispatcher.deliver(event).await,
                    Envelope::Stop => break,
                }
            }
            debug!("Dispatcher stopped");
        }))
    }

    /// Stop the delivery task once everything queued so far has been delivered
    pub fn shutdown(&self) {
        let _ = self.shared.sink.tx.send(Envelope::Stop);
    }

    /// Deliver one event to every matching handler, in registration order
    pub async fn deliver(&self, event: Event) {
        self.shared.delivered.fetch_add(1, Ordering::SeqCst);
        let kind = event.kind();

        let matching: Vec<(HandlerToken, Handler)> = self
            .shared
            .handlers
            .lock()
            .iter()
            .filter(|r| r.filter.matches(&event))
            .map(|r| (r.token, r.handler.clone()))
            .collect();

        for (token, handler) in matching {
            // an earlier handler may have removed this one
            if !self.is_registered(token) {
                continue;
            }

            let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone())));
            let outcome = match invoked {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            let fault = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => HandlerFault::Failed { token, kind, error },
                Err(panic) => HandlerFault::Panicked {
                    token,
                    kind,
                    message: panic_message(panic.as_ref()),
                },
            };
            self.shared.faults.fetch_add(1, Ordering::SeqCst);
            warn!(error = %fault, "Handler fault");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackwire_core::{ConnectionReason, ConnectionState, DeviceCallback, DeviceType, Uid};
    use std::time::Duration;

    fn wire(uid: &str) -> u32 {
        Uid::new(uid).to_wire().unwrap()
    }

    fn callback(uid: &str, function_id: u8) -> Event {
        Event::Callback(DeviceCallback::new(wire(uid), function_id, Vec::new()))
    }

    #[test]
    fn test_filter_matching() {
        let filter = EventFilter::callback(wire("A1"), 6);
        assert!(filter.matches(&callback("A1", 6)));
        assert!(!filter.matches(&callback("A1", 7)));
        assert!(!filter.matches(&callback("B2", 6)));

        let any_function = EventFilter::Callback {
            wire_uid: wire("A1"),
            function_id: None,
        };
        assert!(any_function.matches(&callback("A1", 7)));
        assert!(EventFilter::AnyCallback.matches(&callback("B2", 1)));
        assert!(!EventFilter::Connection.matches(&callback("A1", 6)));
    }

    #[test]
    fn test_filter_matches_long_uid_by_header_value() {
        // 64-bit uids are folded on the wire, so the printable form differs
        let wire_uid = wire("zzzzzzz");
        let event = Event::Callback(DeviceCallback::new(wire_uid, 6, Vec::new()));
        if let Event::Callback(cb) = &event {
            assert_ne!(cb.uid, Uid::new("zzzzzzz"));
        }
        assert!(EventFilter::callback(wire_uid, 6).matches(&event));
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_delivery() {
        let dispatcher = CallbackDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        dispatcher.register(EventFilter::AnyCallback, |_| anyhow::bail!("broken handler"));
        {
            let seen = seen.clone();
            dispatcher.register(EventFilter::AnyCallback, move |event| {
                if let Event::Callback(cb) = event {
                    seen.lock().push(cb.function_id);
                }
                Ok(())
            });
        }

        dispatcher.deliver(callback("A1", 1)).await;
        dispatcher.deliver(callback("A1", 2)).await;

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(dispatcher.fault_count(), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let dispatcher = CallbackDispatcher::new();
        let seen = Arc::new(AtomicU64::new(0));

        dispatcher.register(EventFilter::All, |_| panic!("handler exploded"));
        dispatcher.register_async(EventFilter::All, |_| async {
            let explode = true;
            if explode {
                panic!("async handler exploded");
            }
            Ok::<(), anyhow::Error>(())
        });
        {
            let seen = seen.clone();
            dispatcher.register(EventFilter::All, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        dispatcher.deliver(callback("A1", 1)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.fault_count(), 2);
    }

    #[tokio::test]
    async fn test_handler_can_unregister_itself() {
        let dispatcher = CallbackDispatcher::new();
        let calls = Arc::new(AtomicU64::new(0));
        let token = Arc::new(Mutex::new(None));

        let registered = {
            let handle = dispatcher.clone();
            let calls = calls.clone();
            let slot = token.clone();
            dispatcher.register(EventFilter::All, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(own) = *slot.lock() {
                    handle.unregister(own);
                }
                Ok(())
            })
        };
        *token.lock() = Some(registered);

        dispatcher.deliver(callback("A1", 1)).await;
        dispatcher.deliver(callback("A1", 2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_mid_delivery_is_skipped() {
        let dispatcher = CallbackDispatcher::new();
        let second_called = Arc::new(AtomicU64::new(0));
        let second = Arc::new(Mutex::new(None));

        {
            let handle = dispatcher.clone();
            let second = second.clone();
            dispatcher.register(EventFilter::All, move |_| {
                if let Some(token) = *second.lock() {
                    handle.unregister(token);
                }
                Ok(())
            });
        }
        let token = {
            let second_called = second_called.clone();
            dispatcher.register(EventFilter::All, move |_| {
                second_called.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        *second.lock() = Some(token);

        dispatcher.deliver(callback("A1", 1)).await;
        assert_eq!(second_called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_queue_preserves_order() {
        let dispatcher = CallbackDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register_async(EventFilter::All, move |event| {
            let tx = tx.clone();
            async move {
                // later events must still wait for this one
                tokio::task::yield_now().await;
                let _ = tx.send(event.kind());
                Ok::<(), anyhow::Error>(())
            }
        });
        let handle = dispatcher.spawn().unwrap();
        assert!(matches!(dispatcher.spawn(), Err(DispatcherRunning)));

        let sink = dispatcher.sink();
        sink.emit(Event::Connection(ConnectionEvent::new(
            ConnectionState::Connected,
            ConnectionReason::Requested,
        )));
        sink.emit(Event::Enumeration(EnumerationEvent::attached(
            "A1",
            DeviceType::AIR_QUALITY,
        )));
        sink.emit(callback("A1", 6));
        dispatcher.shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        let mut kinds = Vec::new();
        while let Ok(kind) = rx.try_recv() {
            kinds.push(kind);
        }
        assert_eq!(kinds, vec!["connection", "enumeration", "callback"]);
        assert_eq!(dispatcher.delivered_count(), 3);
    }
}
