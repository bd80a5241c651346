//! Opt-in reconnect supervisor

use parking_lot::Mutex;
use stackwire_core::RetryPolicy;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{TransportConnection, TransportError};
use crate::dispatch::{CallbackDispatcher, HandlerToken};

/// Reopens the connection after every unsolicited loss
///
/// At most one reconnect loop runs at a time; a requested disconnect cancels it.
pub struct AutoReconnect {
    token: HandlerToken,
    dispatcher: CallbackDispatcher,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AutoReconnect {
    pub fn enable(
        dispatcher: &CallbackDispatcher,
        connection: TransportConnection,
        policy: RetryPolicy,
    ) -> Self {
        let task: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let slot = task.clone();

        let token = dispatcher.on_connection(move |event| {
            if event.is_requested_disconnect() {
                if let Some(handle) = slot.lock().take() {
                    debug!("Cancelling reconnect after requested disconnect");
                    handle.abort();
                }
                return Ok(());
            }
            if !event.is_unsolicited_loss() {
                return Ok(());
            }

            let mut running = slot.lock();
            if running.as_ref().is_some_and(|h| !h.is_finished()) {
                debug!("Reconnect already in progress");
                return Ok(());
            }

            let connection = connection.clone();
            let policy = policy.clone();
            *running = Some(tokio::spawn(async move {
                info!("Connection lost, reconnecting");
                let result = policy
                    .retry_if(
                        "reconnect",
                        || connection.reconnect(),
                        |e| {
                            !matches!(
                                e,
                                TransportError::AlreadyConnected | TransportError::ClosedByRequest
                            )
                        },
                    )
                    .await;

                match result {
                    Ok(()) => info!("Reconnected to broker"),
                    Err(TransportError::AlreadyConnected) => debug!("Connection already restored"),
                    Err(TransportError::ClosedByRequest) => {
                        debug!("Reconnect abandoned, connection closed by request")
                    }
                    Err(e) => warn!(error = %e, "Giving up on reconnect"),
                }
            }));
            Ok(())
        });

        Self {
            token,
            dispatcher: dispatcher.clone(),
            task,
        }
    }

    /// True while a reconnect loop is running
    pub fn is_reconnecting(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop reacting to losses and cancel any running reconnect loop
    pub fn disable(&self) {
        self.dispatcher.unregister(self.token);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
