//! Pi-station push ingress.
//!
//! Remote stations POST bulk aircraft snapshots here. The ingress
//! authenticates against a region-scoped shared secret, validates each
//! record, and writes the surviving list to the station's push buffer in the
//! cache. It never merges or enriches; the region scheduler picks the
//! buffer up on its next tick.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cache::{keys, CacheClient, CacheError};
use crate::config::Config;
use crate::model::{pi_station_tag, Aircraft};

/// Shared-secret header sent by stations.
const API_KEY_HEADER: &str = "x-api-key";

/// Buffer TTL when a region does not configure one.
const DEFAULT_BUFFER_TTL: std::time::Duration = std::time::Duration::from_secs(120);

/// Error body returned to stations.
#[derive(Debug, Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
}

/// Per-request ingress failure modes.
#[derive(Debug)]
pub enum IngressError {
    /// No usable credential presented.
    Unauthenticated(String),
    /// Credential is for a region this collector does not serve.
    PermissionDenied(String),
    /// Structurally invalid request.
    InvalidArgument(String),
    /// More records than the configured cap.
    PayloadTooLarge { max: usize },
    /// Cache write failed.
    Internal(CacheError),
}

impl From<CacheError> for IngressError {
    fn from(err: CacheError) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg),
            Self::PermissionDenied(msg) => (StatusCode::FORBIDDEN, "PERMISSION_DENIED", msg),
            Self::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", msg),
            Self::PayloadTooLarge { max } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                format!("at most {max} aircraft records per push"),
            ),
            Self::Internal(err) => {
                tracing::error!("Push ingress cache write failed: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "failed to persist push".to_string(),
                )
            }
        };
        (status, Json(ApiErrorBody { code, message })).into_response()
    }
}

/// Bulk upload request body.
#[derive(Debug, Deserialize)]
pub struct BulkAircraftRequest {
    pub station_id: String,
    pub station_name: String,
    pub timestamp: DateTime<Utc>,
    pub aircraft: Vec<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Bulk upload response body.
#[derive(Debug, Serialize)]
pub struct BulkAircraftResponse {
    pub status: &'static str,
    /// Records received in the request.
    pub aircraft_count: usize,
    /// Records that validated and were persisted.
    pub processed_count: usize,
    pub errors: Vec<String>,
    pub request_id: String,
}

/// Buffer value written to `{region}:push:{station}` and read back by the
/// scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushBuffer {
    pub station_id: String,
    pub station_name: String,
    /// Station-reported snapshot time.
    pub station_timestamp: DateTime<Utc>,
    /// Server receipt time, unix seconds. Drives the freshness window.
    pub received_at: i64,
    pub aircraft: Vec<Aircraft>,
}

/// Shared state for ingress handlers.
#[derive(Clone)]
pub struct IngressState {
    pub config: Arc<Config>,
    pub cache: CacheClient,
}

/// Resolve the region a credential grants access to.
///
/// The secret's prefix (text before the first `.`) names the region; the
/// full value must match that region's configured secret.
fn authenticate(config: &Config, api_key: Option<&str>) -> Result<String, IngressError> {
    let Some(key) = api_key else {
        return Err(IngressError::Unauthenticated("API key is required".into()));
    };
    let Some((region, _)) = key.split_once('.') else {
        return Err(IngressError::InvalidArgument(
            "API key must have the form 'region.secret'".into(),
        ));
    };
    match config.push.shared_secrets.get(region) {
        None => Err(IngressError::PermissionDenied(format!(
            "region '{region}' is not served by this collector"
        ))),
        Some(expected) if expected == key => Ok(region.to_string()),
        Some(_) => Err(IngressError::Unauthenticated(
            "API key not recognized".into(),
        )),
    }
}

async fn push_aircraft(
    State(state): State<IngressState>,
    headers: HeaderMap,
    Json(request): Json<BulkAircraftRequest>,
) -> Result<Json<BulkAircraftResponse>, IngressError> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    let region = authenticate(&state.config, api_key)?;

    if request.station_id.trim().is_empty() {
        return Err(IngressError::InvalidArgument("station_id is required".into()));
    }
    let max = state.config.ingress.max_push_records;
    if request.aircraft.len() > max {
        return Err(IngressError::PayloadTooLarge { max });
    }

    let received = request.aircraft.len();
    let source_tag = pi_station_tag(&request.station_id);
    let mut aircraft = Vec::with_capacity(received);
    let mut errors = Vec::new();
    for (index, value) in request.aircraft.iter().enumerate() {
        match Aircraft::from_receiver_json(value, &source_tag) {
            Ok(report) => aircraft.push(report),
            Err(err) => errors.push(format!("aircraft[{index}]: {err}")),
        }
    }

    let ttl = state
        .config
        .region(&region)
        .and_then(|r| r.push_source())
        .unwrap_or(DEFAULT_BUFFER_TTL);

    let buffer = PushBuffer {
        station_id: request.station_id.clone(),
        station_name: request.station_name.clone(),
        station_timestamp: request.timestamp,
        received_at: Utc::now().timestamp(),
        aircraft,
    };
    let processed = buffer.aircraft.len();

    state
        .cache
        .set_json_with_ttl(&keys::push_buffer(&region, &request.station_id), &buffer, ttl)
        .await?;

    let request_id = Uuid::new_v4().to_string();
    tracing::info!(
        "Push from station {} ({region}): {processed}/{received} records persisted [{request_id}]",
        request.station_id
    );

    Ok(Json(BulkAircraftResponse {
        status: "ok",
        aircraft_count: received,
        processed_count: processed,
        errors,
        request_id,
    }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Build the ingress router.
pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/api/v1/aircraft/bulk", post(push_aircraft))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the ingress until the shutdown signal flips.
pub async fn serve(
    state: IngressState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let addr = format!(
        "{}:{}",
        state.config.ingress.host, state.config.ingress.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Push ingress listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_toml(
            r#"
            [push.shared_secrets]
            etex = "etex.super-secret"

            [[regions]]
            id = "etex"
            name = "East Texas"
            timezone = "America/Chicago"
            center = { lat = 32.3513, lon = -95.3011 }
            radius_miles = 150.0

            [[regions.sources]]
            type = "push"
            station_buffer_ttl_seconds = 120
        "#,
        )
        .unwrap()
    }

    #[test]
    fn test_authenticate_valid_key() {
        let config = test_config();
        assert_eq!(
            authenticate(&config, Some("etex.super-secret")).unwrap(),
            "etex"
        );
    }

    #[test]
    fn test_authenticate_missing_key() {
        let config = test_config();
        assert!(matches!(
            authenticate(&config, None),
            Err(IngressError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_authenticate_malformed_key() {
        let config = test_config();
        assert!(matches!(
            authenticate(&config, Some("no-dot-here")),
            Err(IngressError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_authenticate_wrong_region() {
        let config = test_config();
        assert!(matches!(
            authenticate(&config, Some("socal.super-secret")),
            Err(IngressError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_authenticate_wrong_secret() {
        let config = test_config();
        assert!(matches!(
            authenticate(&config, Some("etex.wrong")),
            Err(IngressError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_push_buffer_round_trip() {
        let buffer = PushBuffer {
            station_id: "ETEX01".into(),
            station_name: "Test Station".into(),
            station_timestamp: Utc::now(),
            received_at: Utc::now().timestamp(),
            aircraft: vec![Aircraft::new("a1b2c3", pi_station_tag("ETEX01"))],
        };
        let json = serde_json::to_string(&buffer).unwrap();
        let back: PushBuffer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.station_id, "ETEX01");
        assert_eq!(back.aircraft.len(), 1);
        assert_eq!(back.aircraft[0].data_source, "pi_station:ETEX01");
    }

    #[test]
    fn test_record_validation_collects_errors() {
        let source_tag = pi_station_tag("ETEX01");
        let values = vec![
            serde_json::json!({ "hex": "a1b2c3", "lat": 32.4, "lon": -95.3 }),
            serde_json::json!({ "flight": "NOHEX" }),
            serde_json::json!({ "hex": "b2c3d4" }),
        ];

        let mut kept = Vec::new();
        let mut errors = Vec::new();
        for (index, value) in values.iter().enumerate() {
            match Aircraft::from_receiver_json(value, &source_tag) {
                Ok(report) => kept.push(report),
                Err(err) => errors.push(format!("aircraft[{index}]: {err}")),
            }
        }

        assert_eq!(kept.len(), 2);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("aircraft[1]"));
    }
}
