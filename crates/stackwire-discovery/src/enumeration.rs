//! Discovery requests and re-enumeration after connection loss

use parking_lot::Mutex;
use stackwire_core::RetryPolicy;
use stackwire_transport::frame::{function, BROADCAST_UID};
use stackwire_transport::{
    CallbackDispatcher, Frame, HandlerToken, TransportConnection, TransportError,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Asks the broker to report every attached module
///
/// Results arrive as enumeration events through the dispatcher, so handlers
/// (normally [`DeviceRegistry::attach`](crate::DeviceRegistry::attach)) must be
/// registered before the first call.
pub struct EnumerationService {
    connection: TransportConnection,
    policy: RetryPolicy,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    token: Mutex<Option<(CallbackDispatcher, HandlerToken)>>,
}

impl EnumerationService {
    pub fn new(connection: TransportConnection, policy: RetryPolicy) -> Self {
        Self {
            connection,
            policy,
            task: Arc::new(Mutex::new(None)),
            token: Mutex::new(None),
        }
    }

    /// Send one enumerate request; fails with `NotConnected` while disconnected
    pub async fn enumerate(&self) -> Result<(), TransportError> {
        enumerate_once(&self.connection).await
    }

    /// [`enumerate`](Self::enumerate) retried on `NotConnected` with the service's policy
    pub async fn enumerate_with_retry(&self) -> Result<(), TransportError> {
        enumerate_with_retry(&self.connection, &self.policy).await
    }

    /// Re-enumerate automatically after every unsolicited loss
    pub fn attach(&self, dispatcher: &CallbackDispatcher) -> HandlerToken {
        let connection = self.connection.clone();
        let policy = self.policy.clone();
        let slot = self.task.clone();

        let token = dispatcher.on_connection(move |event| {
            if event.is_requested_disconnect() {
                if let Some(handle) = slot.lock().take() {
                    debug!("Cancelling re-enumeration after requested disconnect");
                    handle.abort();
                }
                return Ok(());
            }
            if !event.is_unsolicited_loss() {
                return Ok(());
            }

            let mut running = slot.lock();
            if running.as_ref().is_some_and(|h| !h.is_finished()) {
                debug!("Re-enumeration already pending");
                return Ok(());
            }

            let connection = connection.clone();
            let policy = policy.clone();
            *running = Some(tokio::spawn(async move {
                info!("Connection lost, will enumerate again once reconnected");
                match enumerate_with_retry(&connection, &policy).await {
                    Ok(()) => info!("Re-enumeration requested"),
                    Err(e) => warn!(error = %e, "Re-enumeration abandoned"),
                }
            }));
            Ok(())
        });

        if let Some((previous, old)) = self.token.lock().replace((dispatcher.clone(), token)) {
            previous.unregister(old);
        }
        token
    }

    /// Stop re-enumerating and cancel a pending re-enumeration
    pub fn detach(&self) {
        if let Some((dispatcher, token)) = self.token.lock().take() {
            dispatcher.unregister(token);
        }
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// True while a re-enumeration task waits for the connection
    pub fn is_reenumerating(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

async fn enumerate_once(connection: &TransportConnection) -> Result<(), TransportError> {
    if !connection.is_connected() {
        return Err(TransportError::NotConnected);
    }
    debug!("Sending enumerate request");
    connection
        .send(Frame::request(BROADCAST_UID, function::ENUMERATE, Vec::new()))
        .await
}

async fn enumerate_with_retry(
    connection: &TransportConnection,
    policy: &RetryPolicy,
) -> Result<(), TransportError> {
    policy
        .retry_if(
            "enumerate",
            || enumerate_once(connection),
            |e| matches!(e, TransportError::NotConnected) && !connection.is_closed_by_request(),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{AirQuality, Lcd128x64};
    use crate::factory::{DriverFactory, DriverSettings};
    use crate::registry::{DeviceRegistry, LossPolicy, RegistryEvent};
    use stackwire_core::{ConnectionState, DeviceType, EnumerationEvent, Uid};
    use stackwire_transport::mock::MockBroker;
    use stackwire_transport::{AutoReconnect, ConnectionOptions};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Stack {
        dispatcher: CallbackDispatcher,
        connection: TransportConnection,
        registry: Arc<DeviceRegistry>,
        service: EnumerationService,
    }

    fn stack(policy: RetryPolicy) -> Stack {
        let dispatcher = CallbackDispatcher::new();
        dispatcher.spawn().unwrap();
        let connection = TransportConnection::new(
            dispatcher.sink(),
            ConnectionOptions {
                probe_interval: None,
            },
        );
        let settings = DriverSettings {
            response_timeout: TIMEOUT,
            ..DriverSettings::default()
        };
        let registry = DeviceRegistry::new(
            DriverFactory::with_defaults(settings),
            connection.clone(),
            dispatcher.clone(),
            LossPolicy::KeepDevices,
        );
        registry.attach();
        let service = EnumerationService::new(connection.clone(), policy);
        service.attach(&dispatcher);
        Stack {
            dispatcher,
            connection,
            registry,
            service,
        }
    }

    async fn next_event(
        events: &mut tokio::sync::broadcast::Receiver<RegistryEvent>,
    ) -> RegistryEvent {
        tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .expect("no registry event")
            .expect("registry channel closed")
    }

    #[tokio::test]
    async fn test_enumerate_while_disconnected() {
        let s = stack(RetryPolicy::immediate());
        let result = s.service.enumerate().await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_enumerate_with_retry_gives_up_after_budget() {
        let s = stack(RetryPolicy::immediate().with_max_attempts(3));
        let result = s.service.enumerate_with_retry().await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_display_attach_and_detach() {
        let broker = MockBroker::start().await.unwrap();
        let s = stack(RetryPolicy::immediate());
        let mut events = s.registry.subscribe();
        s.connection.connect(&broker.address()).await.unwrap();

        let display = EnumerationEvent::attached("A1", DeviceType::LCD_128X64);
        broker.send_enumeration(&display).await;
        assert!(matches!(next_event(&mut events).await, RegistryEvent::Attached { .. }));
        assert_eq!(s.registry.len(), 1);
        assert!(s.registry.driver_as::<Lcd128x64>(&Uid::new("A1")).is_some());

        broker.send_enumeration(&EnumerationEvent::detached("A1")).await;
        assert!(matches!(next_event(&mut events).await, RegistryEvent::Detached { .. }));
        assert!(s.registry.is_empty());
    }

    #[tokio::test]
    async fn test_enumerate_populates_registry() {
        let broker = MockBroker::start().await.unwrap();
        broker.add_device(EnumerationEvent::attached("A1", DeviceType::LCD_128X64));
        broker.add_device(EnumerationEvent::attached("B2", DeviceType::AIR_QUALITY));
        broker.add_device(EnumerationEvent::attached("C3", DeviceType(2100)));

        let s = stack(RetryPolicy::immediate());
        let mut events = s.registry.subscribe();
        s.connection.connect(&broker.address()).await.unwrap();
        s.service.enumerate_with_retry().await.unwrap();

        for _ in 0..3 {
            next_event(&mut events).await;
        }
        assert_eq!(s.registry.len(), 2);
        assert!(s.registry.find_driver::<AirQuality>().is_some());
        assert!(!s.registry.contains(&Uid::new("C3")));
    }

    #[tokio::test]
    async fn test_reenumerates_after_unsolicited_loss() {
        let broker = MockBroker::start().await.unwrap();
        broker.add_device(EnumerationEvent::attached("A1", DeviceType::LCD_128X64));

        let s = stack(RetryPolicy::fixed(Duration::from_millis(10)));
        s.connection.connect(&broker.address()).await.unwrap();
        s.service.enumerate().await.unwrap();
        assert!(broker.wait_for_count(function::ENUMERATE, 1, TIMEOUT).await);

        broker.drop_clients();
        let mut state = s.connection.watch_state();
        tokio::time::timeout(TIMEOUT, state.wait_for(|st| *st == ConnectionState::Disconnected))
            .await
            .unwrap()
            .unwrap();

        // the retry loop keeps failing with NotConnected until the reconnect
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(s.service.is_reenumerating());
        assert_eq!(broker.count_requests(function::ENUMERATE), 1);

        let mut events = s.registry.subscribe();
        s.connection.reconnect().await.unwrap();
        assert!(broker.wait_for_count(function::ENUMERATE, 2, TIMEOUT).await);
        assert!(matches!(next_event(&mut events).await, RegistryEvent::Replaced { .. }));
        assert!(s.registry.contains(&Uid::new("A1")));
    }

    #[tokio::test]
    async fn test_full_recovery_with_auto_reconnect() {
        let broker = MockBroker::start().await.unwrap();
        broker.add_device(EnumerationEvent::attached("A1", DeviceType::AIR_QUALITY));

        let policy = RetryPolicy::fixed(Duration::from_millis(10));
        let s = stack(policy.clone());
        let supervisor = AutoReconnect::enable(&s.dispatcher, s.connection.clone(), policy);
        s.connection.connect(&broker.address()).await.unwrap();
        s.service.enumerate().await.unwrap();

        broker.drop_clients();
        assert!(broker.wait_for_connections(2, TIMEOUT).await);
        assert!(broker.wait_for_count(function::ENUMERATE, 2, TIMEOUT).await);

        supervisor.disable();
        s.service.detach();
        s.connection.disconnect();
        assert!(!s.service.is_reenumerating());
    }

    #[tokio::test]
    async fn test_requested_disconnect_cancels_reenumeration() {
        let broker = MockBroker::start().await.unwrap();
        let s = stack(RetryPolicy::fixed(Duration::from_millis(10)));
        s.connection.connect(&broker.address()).await.unwrap();

        broker.drop_clients();
        let mut state = s.connection.watch_state();
        tokio::time::timeout(TIMEOUT, state.wait_for(|st| *st == ConnectionState::Disconnected))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(s.service.is_reenumerating());

        // no live session, so the loop ends on its own once closed by request
        s.connection.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!s.service.is_reenumerating());
    }
}
