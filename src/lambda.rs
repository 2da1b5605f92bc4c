//! Event-poll shell for the managed function invoker.
//!
//! Long-polls the invoker's runtime API for the next event, runs it
//! through the bridge, and posts the shaped response back. The API host is
//! taken from `AWS_LAMBDA_RUNTIME_API`; this shell never binds a TCP port.
//!
//! # Protocol (API version 2018-06-01)
//! 1. `GET  /runtime/invocation/next` -- blocks until an event is due;
//!    the `Lambda-Runtime-Aws-Request-Id` header correlates the exchange
//! 2. `POST /runtime/invocation/{id}/response` -- the shaped envelope
//! 3. `POST /runtime/invocation/{id}/error` -- on an unreadable event

use crate::bridge::{self, ProxyEvent};
use axum::Router;
use serde_json::json;
use tracing::{error, info};

const API_VERSION: &str = "2018-06-01";
const HEADER_AWS_REQUEST_ID: &str = "lambda-runtime-aws-request-id";

#[derive(Debug, thiserror::Error)]
pub enum LambdaError {
    #[error("AWS_LAMBDA_RUNTIME_API is not set")]
    MissingApi,
    #[error("runtime API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("next-invocation response carried no request id")]
    MissingRequestId,
}

/// Poll for events until the invoker tears the process down.
pub async fn run(handler: Router) -> Result<(), LambdaError> {
    let api = std::env::var(crate::env::ENV_LAMBDA_RUNTIME_API)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(LambdaError::MissingApi)?;
    run_with_endpoint(handler, &api).await
}

/// Poll a specific runtime API host (`host:port`). Split out so tests can
/// point the loop at a local mock.
pub async fn run_with_endpoint(handler: Router, api: &str) -> Result<(), LambdaError> {
    let base = format!("http://{api}/{API_VERSION}/runtime");
    let client = reqwest::Client::new();
    info!("event-bridge mode, polling for invocations");

    loop {
        let next = client.get(format!("{base}/invocation/next")).send().await?;
        let request_id = next
            .headers()
            .get(HEADER_AWS_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or(LambdaError::MissingRequestId)?;

        let event = match next.json::<ProxyEvent>().await {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, request_id = %request_id, "unreadable event payload");
                post_error(&client, &base, &request_id, &e.to_string()).await;
                continue;
            }
        };

        let response = bridge::invoke(handler.clone(), event).await;
        client
            .post(format!("{base}/invocation/{request_id}/response"))
            .json(&response)
            .send()
            .await?;
    }
}

async fn post_error(client: &reqwest::Client, base: &str, request_id: &str, message: &str) {
    let document = json!({
        "errorMessage": message,
        "errorType": "Runtime.InvalidEvent",
    });
    if let Err(e) = client
        .post(format!("{base}/invocation/{request_id}/error"))
        .json(&document)
        .send()
        .await
    {
        error!(error = %e, "failed to post error document");
    }
}
