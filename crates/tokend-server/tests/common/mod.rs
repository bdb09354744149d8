//! Shared helpers for the HTTP-level test suites.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use data_encoding::HEXLOWER;
use http_body_util::BodyExt;
use tower::ServiceExt;

use tokend_core::device::DeviceInfo;
use tokend_core::testing::{sign_configuration, test_configuration, test_signing_key, MockBackend};
use tokend_core::Configuration;
use tokend_server::kernel::Kernel;
use tokend_server::{web, ServerState};

pub use tokend_core::testing::mock_device;

/// Router plus the mock HID backend behind it.
pub struct TestServer {
    pub app: Router,
    pub backend: Arc<MockBackend>,
}

pub fn test_server(devices: Vec<DeviceInfo>) -> TestServer {
    let backend = Arc::new(MockBackend::new(devices));
    let kernel = Kernel::with_keys(backend.clone(), vec![*test_signing_key().verifying_key()]);
    let state = Arc::new(ServerState { kernel });
    TestServer {
        app: web::app(state),
        backend,
    }
}

/// Hex blob for the default all-allowing test configuration.
pub fn configure_blob() -> String {
    configure_blob_for(&test_configuration())
}

/// Hex blob for an arbitrary configuration, signed with the test key.
pub fn configure_blob_for(config: &Configuration) -> String {
    HEXLOWER.encode(&sign_configuration(config, &test_signing_key()))
}

pub fn hex_path(path: &str) -> String {
    HEXLOWER.encode(path.as_bytes())
}

pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::from(body.to_owned())).unwrap();
    app.clone().oneshot(request).await.unwrap()
}

/// Collect a response into its status and JSON body. Non-JSON bodies
/// come back as a JSON string so callers can still assert on them.
pub async fn into_json(response: Response<Body>) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, json)
}

/// Install the default configuration and assert it was accepted.
pub async fn configure(app: &Router) {
    let response = send(app, "POST", "/configure", &[], &configure_blob()).await;
    let (status, body) = into_json(response).await;
    assert_eq!(status, StatusCode::OK, "configure failed: {body}");
}
