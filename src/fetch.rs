//! Outbound HTTP with fetch-metric instrumentation.
//!
//! [`FetchClient`] wraps a `reqwest::Client`. Every request issued through
//! it while an invocation context is bound produces a `fetch-metric` IPC
//! message, emitted from a spawned task so response delivery never waits
//! on the control socket. Requests made outside an invocation, or with IPC
//! disabled, pass through untouched.

use crate::context::InvocationContext;
use chrono::Utc;
use fluid_protocol::FetchMetric;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

/// Process-wide metric id; strictly increasing across all invocations.
static FETCH_ID: AtomicU64 = AtomicU64::new(0);

fn next_fetch_id() -> u64 {
    FETCH_ID.fetch_add(1, Ordering::SeqCst) + 1
}

/// An instrumented outbound HTTP client.
#[derive(Debug, Clone, Default)]
pub struct FetchClient {
    inner: reqwest::Client,
}

impl FetchClient {
    /// A client over a default transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped client, for building requests with its configuration.
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    pub async fn get(&self, url: &str) -> reqwest::Result<reqwest::Response> {
        let req = self.inner.get(url).build()?;
        self.execute(req).await
    }

    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<reqwest::Body>,
    ) -> reqwest::Result<reqwest::Response> {
        let req = self
            .inner
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .build()?;
        self.execute(req).await
    }

    /// Execute a prepared request, measuring it when an invocation context
    /// is bound. The metric is sent whether or not the transport succeeds;
    /// a transport failure records status code 0.
    pub async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let Some(ctx) = InvocationContext::current().filter(|c| c.ipc().is_connected()) else {
            return self.inner.execute(req).await;
        };

        let url = req.url();
        let method = req.method().as_str().to_owned();
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_owned(),
            (None, _) => String::new(),
        };
        let pathname = url.path().to_owned();
        let search = url.query().unwrap_or_default().to_owned();

        let start = Utc::now().timestamp_millis();
        let timer = Instant::now();
        let result = self.inner.execute(req).await;
        let duration = i64::try_from(timer.elapsed().as_millis()).unwrap_or(i64::MAX);

        let metric = FetchMetric {
            pathname,
            search,
            start,
            duration,
            host,
            status_code: result.as_ref().map_or(0, |r| r.status().as_u16()),
            method,
            id: next_fetch_id(),
        };

        // Fire-and-forget; a metric racing process exit may be lost.
        let ipc = Arc::clone(ctx.ipc());
        let invocation_id = ctx.invocation_id().to_owned();
        let request_id = ctx.request_id();
        tokio::spawn(async move {
            if let Err(e) = ipc
                .send_fetch_metric(&invocation_id, request_id, metric)
                .await
            {
                warn!(error = %e, "failed to send fetch metric");
            }
        });

        result
    }
}

/// Wrap an existing `reqwest::Client` (its pools, timeouts and TLS setup
/// included) with metric instrumentation.
pub fn instrument(client: reqwest::Client) -> FetchClient {
    FetchClient { inner: client }
}
