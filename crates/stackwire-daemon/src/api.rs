//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

/// List all attached devices
pub async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.devices())
}

/// Get a specific device by uid
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> impl IntoResponse {
    match state.get_device(&uid) {
        Some(device) => Json(device).into_response(),
        None => {
            debug!(uid = %uid, "Device lookup missed");
            (
                StatusCode::NOT_FOUND,
                Json(ApiError::new("Device not found")),
            )
                .into_response()
        }
    }
}

/// Latest reading per Air Quality sensor
pub async fn list_readings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.readings())
}

pub async fn get_connection(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.connection_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::Station;
    use axum::body::to_bytes;
    use axum::response::Response;
    use stackwire_core::{DeviceType, EnumerationEvent};
    use stackwire_discovery::{
        ConstructionError, DeviceLink, DeviceRegistry, Driver, DriverFactory, DriverSettings,
        LossPolicy,
    };
    use stackwire_transport::{CallbackDispatcher, ConnectionOptions, TransportConnection};
    use std::any::Any;

    fn state() -> Arc<AppState> {
        let dispatcher = CallbackDispatcher::new();
        let connection = TransportConnection::new(dispatcher.sink(), ConnectionOptions::default());
        let mut factory = DriverFactory::new(DriverSettings::default());
        factory.register(DeviceType(13), |link| async move {
            let driver: Result<Arc<dyn Driver>, ConstructionError> = Ok(Arc::new(Passive { link }));
            driver
        });
        let registry = DeviceRegistry::new(
            factory,
            connection.clone(),
            dispatcher,
            LossPolicy::KeepDevices,
        );
        let station = Station::new(registry.clone());
        AppState::new(registry, connection, station)
    }

    struct Passive {
        link: Arc<DeviceLink>,
    }

    impl Driver for Passive {
        fn device_type(&self) -> DeviceType {
            DeviceType(13)
        }

        fn link(&self) -> &DeviceLink {
            &self.link
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    async fn json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_devices() {
        let state = state();
        state
            .registry
            .on_enumeration_event(&EnumerationEvent::attached("Ab", DeviceType(13)))
            .await;

        let response = list_devices(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body[0]["uid"], "Ab");
        assert_eq!(body[0]["device_type"], 13);

        let response = get_device(State(state.clone()), Path("Ab".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = get_device(State(state), Path("Zz".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["error"], "Device not found");
    }

    #[tokio::test]
    async fn test_connection_and_readings() {
        let state = state();
        let body = json(get_connection(State(state.clone())).await.into_response()).await;
        assert_eq!(body["state"], "disconnected");
        assert_eq!(body["devices"], 0);
        assert!(body["address"].is_null());

        let body = json(list_readings(State(state)).await.into_response()).await;
        assert_eq!(body, serde_json::json!([]));
    }
}
