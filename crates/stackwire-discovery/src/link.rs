//! A driver's handle on the connection and dispatcher

use parking_lot::Mutex;
use stackwire_core::{DeviceType, Event, Uid, UidError};
use stackwire_transport::{
    CallbackDispatcher, EventFilter, Frame, HandlerResult, HandlerToken, TransportConnection,
    TransportError,
};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Typed driver bound to one attached module
pub trait Driver: Send + Sync + 'static {
    fn device_type(&self) -> DeviceType;

    fn link(&self) -> &DeviceLink;

    fn uid(&self) -> &Uid {
        self.link().uid()
    }

    /// Called once when the registry drops the device
    fn on_release(&self) {}

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Addressing, request and subscription plumbing shared by every driver
///
/// Once released, every call fails with [`TransportError::DeviceGone`] and all
/// callback subscriptions made through the link are gone.
pub struct DeviceLink {
    uid: Uid,
    wire_uid: u32,
    connection: TransportConnection,
    dispatcher: CallbackDispatcher,
    timeout: Duration,
    tokens: Mutex<Vec<HandlerToken>>,
    released: AtomicBool,
}

impl DeviceLink {
    pub fn new(
        uid: Uid,
        connection: TransportConnection,
        dispatcher: CallbackDispatcher,
        timeout: Duration,
    ) -> Result<Self, UidError> {
        let wire_uid = uid.to_wire()?;
        Ok(Self {
            uid,
            wire_uid,
            connection,
            dispatcher,
            timeout,
            tokens: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        })
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn wire_uid(&self) -> u32 {
        self.wire_uid
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.is_released() {
            Err(TransportError::DeviceGone(self.uid.clone()))
        } else {
            Ok(())
        }
    }

    /// Call a function and wait for its response payload
    pub async fn request(
        &self,
        function_id: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        self.check()?;
        let response = self
            .connection
            .request(self.wire_uid, function_id, payload, self.timeout)
            .await?;
        // released while the response was on its way
        self.check()?;
        Ok(response)
    }

    /// Call a function without waiting for a response
    pub async fn send(&self, function_id: u8, payload: Vec<u8>) -> Result<(), TransportError> {
        self.check()?;
        self.connection
            .send(Frame::request(self.wire_uid, function_id, payload))
            .await
    }

    /// Subscribe to callbacks of `function_id` from this device
    pub fn on_callback<F>(
        &self,
        function_id: u8,
        handler: F,
    ) -> Result<HandlerToken, TransportError>
    where
        F: Fn(&[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        self.check()?;
        let token = self.dispatcher.register(
            EventFilter::callback(self.wire_uid, function_id),
            move |event| match event {
                Event::Callback(callback) => handler(&callback.payload),
                _ => Ok(()),
            },
        );
        self.tokens.lock().push(token);

        if self.is_released() {
            self.dispatcher.unregister(token);
            return Err(TransportError::DeviceGone(self.uid.clone()));
        }
        Ok(token)
    }

    /// Drop one subscription made through [`on_callback`](Self::on_callback)
    pub fn unsubscribe(&self, token: HandlerToken) -> bool {
        self.tokens.lock().retain(|t| *t != token);
        self.dispatcher.unregister(token)
    }

    /// Mark the device gone; returns true only for the first call
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        let tokens: Vec<HandlerToken> = self.tokens.lock().drain(..).collect();
        for token in &tokens {
            self.dispatcher.unregister(*token);
        }
        self.connection.abandon_device(self.wire_uid, &self.uid);
        debug!(uid = %self.uid, subscriptions = tokens.len(), "Released device link");
        true
    }
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("uid", &self.uid)
            .field("wire_uid", &self.wire_uid)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackwire_core::DeviceCallback;
    use stackwire_transport::mock::MockBroker;
    use stackwire_transport::ConnectionOptions;
    use std::sync::atomic::AtomicUsize;

    fn link(connection: &TransportConnection, dispatcher: &CallbackDispatcher) -> DeviceLink {
        DeviceLink::new(
            Uid::new("A1"),
            connection.clone(),
            dispatcher.clone(),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_release_unsubscribes_and_fails_calls() {
        let dispatcher = CallbackDispatcher::new();
        let connection = TransportConnection::new(dispatcher.sink(), ConnectionOptions::default());
        let link = link(&connection, &dispatcher);

        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            link.on_callback(6, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        let event = Event::Callback(DeviceCallback::new(link.wire_uid(), 6, Vec::new()));
        dispatcher.deliver(event.clone()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(link.release());
        assert!(!link.release());
        dispatcher.deliver(event).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(), 0);

        assert!(matches!(
            link.request(1, Vec::new()).await,
            Err(TransportError::DeviceGone(_))
        ));
        assert!(matches!(link.on_callback(6, |_| Ok(())), Err(TransportError::DeviceGone(_))));
    }

    #[tokio::test]
    async fn test_in_flight_request_fails_with_device_gone() {
        let broker = MockBroker::start().await.unwrap();
        broker.ignore_function(&Uid::new("A1"), 1);
        let dispatcher = CallbackDispatcher::new();
        let connection = TransportConnection::new(
            dispatcher.sink(),
            ConnectionOptions {
                probe_interval: None,
            },
        );
        connection.connect(&broker.address()).await.unwrap();

        let link = Arc::new(link(&connection, &dispatcher));
        let pending = {
            let link = link.clone();
            tokio::spawn(async move { link.request(1, Vec::new()).await })
        };
        broker
            .wait_for_request(|f| f.function_id == 1, Duration::from_secs(2))
            .await
            .unwrap();

        link.release();
        assert!(matches!(pending.await.unwrap(), Err(TransportError::DeviceGone(_))));
    }

    #[tokio::test]
    async fn test_callback_reaches_module_with_long_uid() {
        let broker = MockBroker::start().await.unwrap();
        let dispatcher = CallbackDispatcher::new();
        dispatcher.spawn().unwrap();
        let connection = TransportConnection::new(
            dispatcher.sink(),
            ConnectionOptions {
                probe_interval: None,
            },
        );
        connection.connect(&broker.address()).await.unwrap();

        let uid = Uid::new("zzzzzzz");
        let link =
            DeviceLink::new(uid.clone(), connection, dispatcher, Duration::from_secs(2)).unwrap();
        assert_ne!(Uid::from_wire(link.wire_uid()), uid);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        link.on_callback(6, move |payload| {
            let _ = tx.send(payload.to_vec());
            Ok(())
        })
        .unwrap();

        broker.send_callback(&uid, 6, vec![1, 2, 3]).await;
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_invalid_uid() {
        let dispatcher = CallbackDispatcher::new();
        let connection = TransportConnection::new(dispatcher.sink(), ConnectionOptions::default());
        let result =
            DeviceLink::new(Uid::new("l0"), connection, dispatcher, Duration::from_secs(1));
        assert!(result.is_err());
    }
}
