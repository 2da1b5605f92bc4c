//! Event-bridge round trips: JSON event -> in-memory request -> handler ->
//! recorded response -> JSON event.
//!
//! # Coverage
//! - method/path/host reach the handler unchanged; empty body stays empty
//! - plain and base64 request bodies decode to what the handler reads
//! - multi-value query parameters keep their order
//! - X-Forwarded-For's first token becomes the remote address
//! - binary responses come back base64-encoded with the flag set
//! - the poll loop posts the shaped response to the invoker API

use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use fluid_runtime::bridge::{self, ProxyEvent, RemoteAddr};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn single_headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// Echoes request facts into response headers and the body back verbatim.
fn echo_router() -> Router {
    Router::new().fallback(
        |method: axum::http::Method,
         uri: axum::http::Uri,
         headers: axum::http::HeaderMap,
         body: String| async move {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            (
                [
                    ("x-echo-method", method.to_string()),
                    ("x-echo-path", uri.path().to_owned()),
                    ("x-echo-query", uri.query().unwrap_or_default().to_owned()),
                    ("x-echo-host", host),
                    ("x-echo-body-len", body.len().to_string()),
                ],
                body,
            )
        },
    )
}

#[tokio::test]
async fn get_event_reaches_the_handler_unchanged() {
    let event = ProxyEvent {
        http_method: "GET".to_owned(),
        path: "/api/users".to_owned(),
        headers: single_headers(&[("Host", "example.com")]),
        ..Default::default()
    };

    let response = bridge::invoke(echo_router(), event).await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.headers["x-echo-method"], "GET");
    assert_eq!(response.headers["x-echo-path"], "/api/users");
    assert_eq!(response.headers["x-echo-host"], "example.com");
    assert_eq!(response.headers["x-echo-body-len"], "0");
}

#[tokio::test]
async fn post_body_arrives_literally() {
    let event = ProxyEvent {
        http_method: "POST".to_owned(),
        path: "/submit".to_owned(),
        headers: single_headers(&[
            ("Host", "example.com"),
            ("Content-Type", "application/json"),
        ]),
        body: r#"{"name":"test"}"#.to_owned(),
        ..Default::default()
    };

    let response = bridge::invoke(echo_router(), event).await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, r#"{"name":"test"}"#);
    assert!(!response.is_base64_encoded);
}

#[tokio::test]
async fn base64_request_body_is_decoded() {
    let event = ProxyEvent {
        http_method: "POST".to_owned(),
        path: "/upload".to_owned(),
        body: BASE64.encode("binary data"),
        is_base64_encoded: true,
        ..Default::default()
    };

    let response = bridge::invoke(echo_router(), event).await;
    assert_eq!(response.body, "binary data");
    assert_eq!(response.headers["x-echo-body-len"], "11");
}

#[tokio::test]
async fn multi_value_query_keeps_order() {
    let event = ProxyEvent {
        http_method: "GET".to_owned(),
        path: "/search".to_owned(),
        multi_value_query_string_parameters: [(
            "tag".to_owned(),
            vec!["go".to_owned(), "rust".to_owned()],
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    };

    let response = bridge::invoke(echo_router(), event).await;
    let query = &response.headers["x-echo-query"];
    assert_eq!(query, "tag=go&tag=rust");

    // First lookup sees "go"; the full list keeps both, in order.
    let values: Vec<&str> = query
        .split('&')
        .filter_map(|pair| pair.strip_prefix("tag="))
        .collect();
    assert_eq!(values, ["go", "rust"]);
}

#[tokio::test]
async fn forwarded_for_first_token_becomes_remote_addr() {
    let app = Router::new().route(
        "/addr",
        get(|Extension(addr): Extension<RemoteAddr>| async move { addr.0 }),
    );

    let event = ProxyEvent {
        http_method: "GET".to_owned(),
        path: "/addr".to_owned(),
        headers: single_headers(&[(
            "X-Forwarded-For",
            "192.168.1.1, 10.0.0.1, 172.16.0.1",
        )]),
        ..Default::default()
    };

    let response = bridge::invoke(app, event).await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "192.168.1.1");
}

#[tokio::test]
async fn binary_response_round_trips_through_base64() {
    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    let app = Router::new().route(
        "/image",
        get(|| async { ([(header::CONTENT_TYPE, "image/png")], PNG_MAGIC.to_vec()) }),
    );

    let event = ProxyEvent {
        http_method: "GET".to_owned(),
        path: "/image".to_owned(),
        ..Default::default()
    };

    let response = bridge::invoke(app, event).await;
    assert!(response.is_base64_encoded);
    assert_eq!(BASE64.decode(&response.body).unwrap(), PNG_MAGIC);
}

#[tokio::test]
async fn multi_value_request_headers_are_preferred() {
    let app = Router::new().route(
        "/accepts",
        get(|headers: axum::http::HeaderMap| async move {
            let values: Vec<String> = headers
                .get_all("accept")
                .iter()
                .map(|v| v.to_str().unwrap_or_default().to_owned())
                .collect();
            values.join("|")
        }),
    );

    let event = ProxyEvent {
        http_method: "GET".to_owned(),
        path: "/accepts".to_owned(),
        headers: single_headers(&[("Accept", "ignored/when-multi-present")]),
        multi_value_headers: [(
            "Accept".to_owned(),
            vec!["text/html".to_owned(), "application/json".to_owned()],
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    };

    let response = bridge::invoke(app, event).await;
    assert_eq!(response.body, "text/html|application/json");
}

#[tokio::test]
async fn repeated_response_headers_fill_the_multi_value_bag() {
    let app = Router::new().route(
        "/cookies",
        get(|| async {
            let mut response = "set".into_response();
            let headers = response.headers_mut();
            headers.append(header::SET_COOKIE, "a=1".parse().unwrap());
            headers.append(header::SET_COOKIE, "b=2".parse().unwrap());
            response
        }),
    );

    let event = ProxyEvent {
        http_method: "GET".to_owned(),
        path: "/cookies".to_owned(),
        ..Default::default()
    };

    let response = bridge::invoke(app, event).await;
    assert_eq!(response.headers["set-cookie"], "a=1");
    assert_eq!(
        response.multi_value_headers["set-cookie"],
        vec!["a=1".to_owned(), "b=2".to_owned()]
    );
    // Single-valued headers stay out of the bag.
    assert!(!response.multi_value_headers.contains_key("content-type"));
}

#[tokio::test]
async fn undecodable_base64_body_yields_500() {
    let event = ProxyEvent {
        http_method: "POST".to_owned(),
        path: "/".to_owned(),
        body: "%%% not base64 %%%".to_owned(),
        is_base64_encoded: true,
        ..Default::default()
    };

    let response = bridge::invoke(echo_router(), event).await;
    assert_eq!(response.status_code, 500);
    assert_eq!(response.body, "Internal Server Error");
}

// ---------------------------------------------------------------------------
// Poll loop against a mock invoker API
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poll_loop_posts_the_shaped_response() {
    let queued_event = ProxyEvent {
        http_method: "GET".to_owned(),
        path: "/api/users".to_owned(),
        headers: single_headers(&[("Host", "example.com")]),
        ..Default::default()
    };

    let queue = Arc::new(Mutex::new(Some(queued_event)));
    let captured: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));

    let next_queue = Arc::clone(&queue);
    let capture_sink = Arc::clone(&captured);
    let api = Router::new()
        .route(
            "/2018-06-01/runtime/invocation/next",
            get(move || {
                let queue = Arc::clone(&next_queue);
                async move {
                    let event = queue.lock().unwrap().take();
                    match event {
                        Some(event) => (
                            [("lambda-runtime-aws-request-id", "req-1")],
                            axum::Json(event),
                        )
                            .into_response(),
                        // No more work: hold the long poll open.
                        None => {
                            std::future::pending::<()>().await;
                            unreachable!()
                        }
                    }
                }
            }),
        )
        .route(
            "/2018-06-01/runtime/invocation/{id}/response",
            post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                let sink = Arc::clone(&capture_sink);
                async move {
                    *sink.lock().unwrap() = Some(body);
                    StatusCode::ACCEPTED
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api).await.expect("mock API failed");
    });

    let poll_task = tokio::spawn(async move {
        let _ = fluid_runtime::lambda::run_with_endpoint(echo_router(), &addr.to_string()).await;
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let body = loop {
        if let Some(body) = captured.lock().unwrap().clone() {
            break body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "poll loop never posted a response"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    poll_task.abort();

    assert_eq!(body["statusCode"], 200);
    assert_eq!(body["headers"]["x-echo-method"], "GET");
    assert_eq!(body["headers"]["x-echo-path"], "/api/users");
    assert_eq!(body["headers"]["x-echo-host"], "example.com");
}
