//! Integration test for the REST endpoints against a local HTTP server
//!
//! An axum router on an ephemeral port stands in for the device platform and
//! the paced third-party service. Covers apiKey injection, the 404 path, a
//! request that times out mid-session, basic auth, and request pacing.

use anyhow::Result;
use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use hil_bench::{
    interface::{Credential, CredentialSource, PacedRestInterface, RestInterface},
    Endpoint, FaultKind,
};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

// Reserved characters must survive query encoding
const API_KEY: &str = "k-123&fields=x y";
// base64("station:secret")
const BASIC_AUTH: &str = "Basic c3RhdGlvbjpzZWNyZXQ=";

async fn device(Path(id): Path<String>, Query(query): Query<HashMap<String, String>>) -> impl IntoResponse {
    if query.get("apiKey").map(String::as_str) != Some(API_KEY) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing apiKey" })));
    }
    match id.as_str() {
        "M9RDJA" => (
            StatusCode::OK,
            Json(json!({ "id": id, "status": query.get("fields").cloned().unwrap_or_else(|| "online".into()) })),
        ),
        _ => (StatusCode::NOT_FOUND, Json(json!({ "error": "device not found" }))),
    }
}

async fn weather(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> impl IntoResponse {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == BASIC_AUTH);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad credentials" })));
    }
    (StatusCode::OK, Json(json!({ "station": query.get("station").cloned().unwrap_or_default() })))
}

async fn serve() -> Result<String> {
    let app = Router::new()
        .route("/", get(|| async { Json(json!({ "service": "up" })) }))
        .route("/api/v2/devices/:id", get(device))
        .route(
            "/api/v2/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({ "late": true }))
            }),
        )
        .route("/weather/current", get(weather));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{}", address))
}

struct Credentials(HashMap<String, Credential>);

impl CredentialSource for Credentials {
    fn credential(&self, service: &str) -> Option<Credential> {
        self.0.get(service).cloned()
    }
}

fn basic_credentials() -> Credentials {
    Credentials(HashMap::from([(
        "weather".to_string(),
        Credential::Basic {
            user: "station".into(),
            password: "secret".into(),
        },
    )]))
}

#[tokio::test]
async fn test_get_returns_parsed_json() -> Result<()> {
    let base = serve().await?;
    let mut rest = RestInterface::new(format!("{}/api/v2", base), API_KEY);
    rest.connect().await?;

    let value = rest.get("devices/M9RDJA").await?;
    assert_eq!(value["id"], "M9RDJA");
    assert_eq!(value["status"], "online");

    let value = rest.get_with("devices/M9RDJA", &[("fields", "battery")]).await?;
    assert_eq!(value["status"], "battery");

    rest.disconnect().await;
    assert!(!rest.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_not_found_is_protocol_fault_with_response() -> Result<()> {
    let base = serve().await?;
    let mut rest = RestInterface::new(format!("{}/api/v2", base), API_KEY);
    rest.connect().await?;

    let err = rest.get("devices/UNKNOWN").await.unwrap_err();
    assert_eq!(err.kind, FaultKind::Protocol);
    assert_eq!(err.origin, "RESTAPIInterface");
    assert_eq!(err.status(), Some(404));
    let response = err.response.expect("response details");
    assert_eq!(response.reason, "Not Found");
    assert!(response.body.contains("device not found"));
    Ok(())
}

#[tokio::test]
async fn test_request_timeout_after_connect_is_port_fault() -> Result<()> {
    let base = serve().await?;
    let mut rest = RestInterface::new(format!("{}/api/v2", base), API_KEY)
        .with_request_timeout(Duration::from_millis(300));
    rest.connect().await?;

    let err = rest.get("slow").await.unwrap_err();
    assert_eq!(err.kind, FaultKind::Port);
    assert_eq!(err.origin, "RESTAPIInterface");
    assert!(err.original.is_some());
    assert!(rest.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_api_key_with_reserved_characters_reaches_server_intact() -> Result<()> {
    let base = serve().await?;
    let mut rest = RestInterface::new(format!("{}/api/v2", base), API_KEY);
    rest.connect().await?;

    // The server sees the whole key and no stray `fields` parameter
    let value = rest.get("devices/M9RDJA").await?;
    assert_eq!(value["status"], "online");
    Ok(())
}

#[tokio::test]
async fn test_connect_to_dead_host_leaves_interface_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let mut rest = RestInterface::new(format!("http://{}/api/v2", address), API_KEY)
        .with_request_timeout(Duration::from_secs(2));
    let err = rest.connect().await.unwrap_err();
    assert_eq!(err.kind, FaultKind::Connection);
    assert!(err.original.is_some());
    assert!(!rest.is_connected());
}

#[tokio::test]
async fn test_paced_interface_sends_basic_auth() -> Result<()> {
    let base = serve().await?;
    let mut weather = PacedRestInterface::new("weather", base, &basic_credentials())?
        .with_probe("weather/current", &[("station", "probe")])
        .with_min_interval(Duration::ZERO);
    weather.connect().await?;

    let value = weather.get("weather/current", &[("station", "KSEA")]).await?;
    assert_eq!(value["station"], "KSEA");
    Ok(())
}

#[tokio::test]
async fn test_paced_interface_spaces_requests() -> Result<()> {
    let base = serve().await?;
    let mut weather = PacedRestInterface::new("weather", base, &basic_credentials())?
        .with_min_interval(Duration::from_millis(150));
    weather.connect().await?;

    let started = Instant::now();
    for _ in 0..3 {
        weather.get("weather/current", &[("station", "KSEA")]).await?;
    }
    // The probe claimed the first slot, so every request waits a full interval
    assert!(started.elapsed() >= Duration::from_millis(400));
    Ok(())
}

#[tokio::test]
async fn test_paced_interface_rejected_credentials_fail_the_probe() -> Result<()> {
    let base = serve().await?;
    let wrong = Credentials(HashMap::from([(
        "weather".to_string(),
        Credential::Basic {
            user: "station".into(),
            password: "wrong".into(),
        },
    )]));
    let mut weather = PacedRestInterface::new("weather", base, &wrong)?
        .with_probe("weather/current", &[])
        .with_min_interval(Duration::ZERO);

    let err = weather.connect().await.unwrap_err();
    assert_eq!(err.origin, "weather");
    assert!(!weather.is_connected());
    Ok(())
}

#[test]
fn test_missing_credentials_is_parameter_fault() {
    let err = PacedRestInterface::new("tides", "http://127.0.0.1:1", &basic_credentials())
        .err()
        .expect("no credentials for tides");
    assert_eq!(err.kind, FaultKind::Parameter);
    assert_eq!(err.origin, "tides");
}
