//! Route lookup proxy
//!
//! Browsers cannot call the directions service directly, so the relay makes
//! the lookup with its own key. The requested travel mode is tried first; if
//! it finds no route, the fallback mode is tried once.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DirectionsConfig;

/// Path of the directions endpoint
pub const DIRECTIONS_PATH: &str = "/api/directions";

const OK_STATUS: &str = "OK";
const ZERO_RESULTS: &str = "ZERO_RESULTS";
const NO_ROUTE: &str = "No route found between these points";

/// A route lookup as posted by the client
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectionsRequest {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub waypoints: Vec<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Errors that prevent a lookup from producing a reply
#[derive(Debug, Error)]
pub enum DirectionsError {
    #[error("Origin and destination are required")]
    InvalidArgument,

    #[error("Directions API key not configured (set {env})")]
    MissingCredential { env: String },

    #[error("Directions API error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Directions request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Invalid directions response: {0}")]
    InvalidResponse(String),
}

impl DirectionsError {
    // The key travels in the query string; keep the URL out of every message.
    fn transport(err: reqwest::Error) -> Self {
        DirectionsError::Transport(err.without_url())
    }
}

/// Reply returned to the client
///
/// A found route carries the service's raw answer in `data`. Anything else
/// carries the service status and a human-readable `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionsReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DirectionsReply {
    fn found(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            status: None,
            error: None,
        }
    }

    fn failed(status: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            status: Some(status.into()),
            error: Some(error.into()),
        }
    }
}

/// Client for the directions service; shares the relay's connection pool
#[derive(Debug, Clone)]
pub struct DirectionsClient {
    http: Client,
    config: DirectionsConfig,
}

impl DirectionsClient {
    pub fn new(http: Client, config: DirectionsConfig) -> Self {
        Self { http, config }
    }

    /// Travel modes in the order they are tried
    pub fn modes_to_try<'a>(&'a self, requested: Option<&'a str>) -> Vec<&'a str> {
        let first = requested
            .filter(|mode| !mode.is_empty())
            .unwrap_or(self.config.default_mode.as_str());
        let fallback = self.config.fallback_mode.as_str();
        if first == fallback {
            vec![first]
        } else {
            vec![first, fallback]
        }
    }

    /// Look up a route, falling back to the next mode only on `ZERO_RESULTS`
    pub async fn route(&self, request: &DirectionsRequest) -> Result<DirectionsReply, DirectionsError> {
        let (Some(origin), Some(destination)) = (present(&request.origin), present(&request.destination)) else {
            return Err(DirectionsError::InvalidArgument);
        };
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(DirectionsError::MissingCredential {
                env: self.config.api_key_env.clone(),
            });
        };

        for mode in self.modes_to_try(request.mode.as_deref()) {
            info!(%mode, waypoints = request.waypoints.len(), "route: trying mode");
            let data = self
                .lookup(origin, destination, &request.waypoints, mode, api_key)
                .await?;
            let status = data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN_ERROR")
                .to_string();

            if status == OK_STATUS {
                info!(%mode, "route: found");
                return Ok(DirectionsReply::found(data));
            }
            if status != ZERO_RESULTS {
                let message = data
                    .get("error_message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                warn!(%mode, %status, %message, "route: directions service refused");
                return Ok(DirectionsReply::failed(status, message));
            }
            debug!(%mode, "route: no route in this mode");
        }

        Ok(DirectionsReply::failed(ZERO_RESULTS, NO_ROUTE))
    }

    async fn lookup(
        &self,
        origin: &str,
        destination: &str,
        waypoints: &[String],
        mode: &str,
        api_key: &str,
    ) -> Result<Value, DirectionsError> {
        let joined = waypoints.join("|");
        let mut params = vec![
            ("origin", origin),
            ("destination", destination),
            ("mode", mode),
            ("key", api_key),
        ];
        if !waypoints.is_empty() {
            params.push(("waypoints", joined.as_str()));
        }

        let response = self
            .http
            .get(&self.config.endpoint)
            .query(&params)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(DirectionsError::transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DirectionsError::Upstream { status, body });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| DirectionsError::InvalidResponse(e.without_url().to_string()))
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectionsSettings;
    use axum::Router;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct MockMaps {
        /// Answer per travel mode; modes not listed answer ZERO_RESULTS
        answers: HashMap<&'static str, Value>,
        http_status: Option<u16>,
        calls: Arc<Mutex<Vec<HashMap<String, String>>>>,
    }

    impl MockMaps {
        fn answering(answers: &[(&'static str, Value)]) -> Self {
            Self {
                answers: answers.iter().cloned().collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<HashMap<String, String>> {
            self.calls.lock().unwrap().clone()
        }

        fn modes(&self) -> Vec<String> {
            self.calls().iter().map(|c| c["mode"].clone()).collect()
        }
    }

    async fn maps(State(mock): State<MockMaps>, Query(params): Query<HashMap<String, String>>) -> Response {
        let mode = params.get("mode").cloned().unwrap_or_default();
        mock.calls.lock().unwrap().push(params);
        if let Some(status) = mock.http_status {
            return (StatusCode::from_u16(status).unwrap(), "maps down").into_response();
        }
        let answer = mock
            .answers
            .get(mode.as_str())
            .cloned()
            .unwrap_or_else(|| json!({"status": "ZERO_RESULTS", "routes": []}));
        axum::Json(answer).into_response()
    }

    async fn client_for(mock: &MockMaps, key: Option<&str>) -> DirectionsClient {
        let app = Router::new().route("/maps", get(maps)).with_state(mock.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = DirectionsSettings::default().resolve();
        config.endpoint = format!("http://{}/maps", addr);
        config.api_key = key.map(str::to_string);
        DirectionsClient::new(Client::new(), config)
    }

    fn ride(mode: Option<&str>) -> DirectionsRequest {
        DirectionsRequest {
            origin: Some("Golden Gate Park".to_string()),
            destination: Some("Sausalito".to_string()),
            waypoints: vec![],
            mode: mode.map(str::to_string),
        }
    }

    fn ok_route() -> Value {
        json!({"status": "OK", "routes": [{"summary": "US-101 N"}]})
    }

    #[tokio::test]
    async fn test_route_found_in_requested_mode() {
        let mock = MockMaps::answering(&[("bicycling", ok_route())]);
        let client = client_for(&mock, Some("maps-key")).await;
        let mut request = ride(None);
        request.waypoints = vec!["Crissy Field".to_string(), "Fort Point".to_string()];

        let reply = client.route(&request).await.unwrap();

        assert!(reply.success);
        assert_eq!(reply.data.unwrap()["routes"][0]["summary"], "US-101 N");
        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["mode"], "bicycling");
        assert_eq!(calls[0]["origin"], "Golden Gate Park");
        assert_eq!(calls[0]["key"], "maps-key");
        assert_eq!(calls[0]["waypoints"], "Crissy Field|Fort Point");
    }

    #[tokio::test]
    async fn test_zero_results_falls_back_to_driving() {
        let mock = MockMaps::answering(&[("driving", ok_route())]);
        let client = client_for(&mock, Some("k")).await;

        let reply = client.route(&ride(Some("walking"))).await.unwrap();

        assert!(reply.success);
        assert_eq!(mock.modes(), vec!["walking", "driving"]);
        assert!(!mock.calls()[0].contains_key("waypoints"));
    }

    #[tokio::test]
    async fn test_other_status_stops_without_fallback() {
        let mock = MockMaps::answering(&[(
            "bicycling",
            json!({"status": "REQUEST_DENIED", "error_message": "The provided API key is invalid."}),
        )]);
        let client = client_for(&mock, Some("k")).await;

        let reply = client.route(&ride(None)).await.unwrap();

        assert_eq!(
            reply,
            DirectionsReply::failed("REQUEST_DENIED", "The provided API key is invalid.")
        );
        assert_eq!(mock.modes(), vec!["bicycling"]);
    }

    #[tokio::test]
    async fn test_status_without_message_reports_unknown_error() {
        let mock = MockMaps::answering(&[("bicycling", json!({"status": "OVER_QUERY_LIMIT"}))]);
        let client = client_for(&mock, Some("k")).await;

        let reply = client.route(&ride(None)).await.unwrap();

        assert_eq!(reply.status.as_deref(), Some("OVER_QUERY_LIMIT"));
        assert_eq!(reply.error.as_deref(), Some("Unknown error"));
    }

    #[tokio::test]
    async fn test_no_route_in_any_mode() {
        let mock = MockMaps::default();
        let client = client_for(&mock, Some("k")).await;

        let reply = client.route(&ride(None)).await.unwrap();

        assert_eq!(reply, DirectionsReply::failed("ZERO_RESULTS", NO_ROUTE));
        assert_eq!(mock.modes(), vec!["bicycling", "driving"]);
    }

    #[tokio::test]
    async fn test_fallback_mode_requested_is_tried_once() {
        let mock = MockMaps::default();
        let client = client_for(&mock, Some("k")).await;

        client.route(&ride(Some("driving"))).await.unwrap();

        assert_eq!(mock.modes(), vec!["driving"]);
    }

    #[tokio::test]
    async fn test_missing_endpoints_rejected_before_lookup() {
        let mock = MockMaps::default();
        let client = client_for(&mock, Some("k")).await;
        let mut request = ride(None);
        request.destination = Some(String::new());

        let err = client.route(&request).await.unwrap_err();

        assert!(matches!(err, DirectionsError::InvalidArgument));
        assert_eq!(err.to_string(), "Origin and destination are required");
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_rejected_before_lookup() {
        let mock = MockMaps::default();
        let client = client_for(&mock, None).await;

        let err = client.route(&ride(None)).await.unwrap_err();

        assert!(matches!(err, DirectionsError::MissingCredential { ref env } if env == "GOOGLE_MAPS_API_KEY"));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_http_error_from_service() {
        let mock = MockMaps {
            http_status: Some(503),
            ..MockMaps::default()
        };
        let client = client_for(&mock, Some("k")).await;

        let err = client.route(&ride(None)).await.unwrap_err();

        assert!(matches!(err, DirectionsError::Upstream { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_transport_error_hides_key() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut config = DirectionsSettings::default().resolve();
        config.endpoint = format!("http://{}/maps", addr);
        config.api_key = Some("maps-secret".to_string());
        let client = DirectionsClient::new(Client::new(), config);

        let err = client.route(&ride(None)).await.unwrap_err();

        assert!(matches!(err, DirectionsError::Transport(_)));
        assert!(!err.to_string().contains("maps-secret"));
        assert!(!format!("{:?}", err).contains("maps-secret"));
    }

    #[test]
    fn test_reply_shapes() {
        let found = serde_json::to_value(DirectionsReply::found(json!({"status": "OK"}))).unwrap();
        assert_eq!(found, json!({"success": true, "data": {"status": "OK"}}));

        let failed = serde_json::to_value(DirectionsReply::failed("ZERO_RESULTS", NO_ROUTE)).unwrap();
        assert_eq!(
            failed,
            json!({"success": false, "status": "ZERO_RESULTS", "error": "No route found between these points"})
        );
    }

    #[test]
    fn test_request_defaults() {
        let request: DirectionsRequest = serde_json::from_str(r#"{"origin": "a", "destination": "b"}"#).unwrap();
        assert!(request.waypoints.is_empty());
        assert!(request.mode.is_none());
    }
}
