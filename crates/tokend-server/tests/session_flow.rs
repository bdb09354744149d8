//! Session lifecycle and device call scenarios against the full router
//! with a scripted echo device.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{configure, hex_path, into_json, mock_device, send, test_server};

async fn acquire(app: &axum::Router, path: &str) -> String {
    let uri = format!("/acquire/{}", hex_path(path));
    let (status, body) = into_json(send(app, "POST", &uri, &[], "").await).await;
    assert_eq!(status, StatusCode::OK, "acquire failed: {body}");
    body["session"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn acquire_release_acquire_yields_fresh_sessions() {
    let server = test_server(vec![mock_device("usb-1")]);
    configure(&server.app).await;

    let s1 = acquire(&server.app, "usb-1").await;

    let (status, body) =
        into_json(send(&server.app, "POST", &format!("/release/{s1}"), &[], "").await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let s2 = acquire(&server.app, "usb-1").await;
    assert_ne!(s1, s2);
}

#[tokio::test]
async fn released_session_is_gone_for_call_and_release() {
    let server = test_server(vec![mock_device("usb-1")]);
    configure(&server.app).await;

    let session = acquire(&server.app, "usb-1").await;
    let (status, _) =
        into_json(send(&server.app, "POST", &format!("/release/{session}"), &[], "").await).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = into_json(
        send(
            &server.app,
            "POST",
            &format!("/call/{session}"),
            &[],
            r#"{"type":"Ping","message":{"message":"hi"}}"#,
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "session not found" }));

    let (status, _) =
        into_json(send(&server.app, "POST", &format!("/release/{session}"), &[], "").await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn acquire_replaces_the_previous_session() {
    let server = test_server(vec![mock_device("usb-1")]);
    configure(&server.app).await;

    let s1 = acquire(&server.app, "usb-1").await;
    let s2 = acquire(&server.app, "usb-1").await;
    assert_ne!(s1, s2);

    // the enumeration joins only the fresh session
    let (_, body) = into_json(send(&server.app, "GET", "/enumerate", &[], "").await).await;
    assert_eq!(body[0]["session"], json!(s2));

    let (status, _) =
        into_json(send(&server.app, "POST", &format!("/call/{s1}"), &[], "{}").await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn acquire_unknown_device_is_404() {
    let server = test_server(vec![mock_device("usb-1")]);
    configure(&server.app).await;

    let uri = format!("/acquire/{}", hex_path("usb-unplugged"));
    let (status, body) = into_json(send(&server.app, "POST", &uri, &[], "").await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "device not found or unsupported" }));
}

#[tokio::test]
async fn acquire_rejects_malformed_hex_path() {
    let server = test_server(vec![mock_device("usb-1")]);
    configure(&server.app).await;

    let (status, _) =
        into_json(send(&server.app, "POST", "/acquire/not-hex!", &[], "").await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn call_round_trips_ping_to_success() {
    let server = test_server(vec![mock_device("usb-1")]);
    configure(&server.app).await;
    let session = acquire(&server.app, "usb-1").await;

    let (status, body) = into_json(
        send(
            &server.app,
            "POST",
            &format!("/call/{session}"),
            &[],
            r#"{"type":"Ping","message":{"message":"hi"}}"#,
        )
        .await,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "type": "Success", "message": { "message": "hi" } }));
}

#[tokio::test]
async fn call_with_unknown_message_type_is_500() {
    let server = test_server(vec![mock_device("usb-1")]);
    configure(&server.app).await;
    let session = acquire(&server.app, "usb-1").await;

    let (status, _) = into_json(
        send(
            &server.app,
            "POST",
            &format!("/call/{session}"),
            &[],
            r#"{"type":"NoSuchMessage","message":{}}"#,
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn call_with_malformed_json_body_is_500() {
    let server = test_server(vec![mock_device("usb-1")]);
    configure(&server.app).await;
    let session = acquire(&server.app, "usb-1").await;

    for body in ["not json at all", "", r#"{"type": 42}"#] {
        let (status, _) = into_json(
            send(&server.app, "POST", &format!("/call/{session}"), &[], body).await,
        )
        .await;
        assert_eq!(
            status,
            StatusCode::INTERNAL_SERVER_ERROR,
            "body {body:?} should not be callable"
        );
    }
}

#[tokio::test]
async fn session_routes_require_configuration() {
    let server = test_server(vec![mock_device("usb-1")]);

    let uri = format!("/acquire/{}", hex_path("usb-1"));
    let (status, body) = into_json(send(&server.app, "POST", &uri, &[], "").await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "not configured" }));

    let (status, _) =
        into_json(send(&server.app, "POST", "/release/some-session", &[], "").await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) =
        into_json(send(&server.app, "POST", "/call/some-session", &[], "{}").await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn two_tokens_hold_independent_sessions() {
    let server = test_server(vec![mock_device("usb-1"), mock_device("usb-2")]);
    configure(&server.app).await;

    let s1 = acquire(&server.app, "usb-1").await;
    let s2 = acquire(&server.app, "usb-2").await;
    assert_ne!(s1, s2);

    let (_, body) = into_json(send(&server.app, "GET", "/enumerate", &[], "").await).await;
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 2);
    for entry in list {
        assert!(entry["session"].is_string());
    }

    // releasing one leaves the other bound
    let (status, _) =
        into_json(send(&server.app, "POST", &format!("/release/{s1}"), &[], "").await).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = into_json(
        send(
            &server.app,
            "POST",
            &format!("/call/{s2}"),
            &[],
            r#"{"type":"Ping","message":{"message":"still here"}}"#,
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"]["message"], json!("still here"));
}

#[tokio::test]
async fn call_after_device_failure_reopens_on_next_call() {
    let server = test_server(vec![mock_device("usb-1")]);
    configure(&server.app).await;
    let session = acquire(&server.app, "usb-1").await;
    let opens_after_acquire = server.backend.open_count();

    server.backend.set_fail_io(true);
    let (status, _) = into_json(
        send(
            &server.app,
            "POST",
            &format!("/call/{session}"),
            &[],
            r#"{"type":"Ping","message":{"message":"hi"}}"#,
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    server.backend.set_fail_io(false);
    let (status, body) = into_json(
        send(
            &server.app,
            "POST",
            &format!("/call/{session}"),
            &[],
            r#"{"type":"Ping","message":{"message":"hi"}}"#,
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "call after recovery failed: {body}");
    assert!(server.backend.open_count() > opens_after_acquire);
}
