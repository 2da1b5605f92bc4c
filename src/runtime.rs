//! The HTTP shell of the runtime.
//!
//! Accepts per-invocation requests, decorates each with its invocation
//! context, observes the user handler's response, coordinates wait-until
//! background tasks, and reports lifecycle events over the IPC stream.
//!
//! # Per-request flow
//! 1. `/_vercel/ping` answers 200 without touching the pipeline
//! 2. Extract + strip the internal identity headers
//! 3. Bind the invocation context (task-local scope + request extension)
//! 4. Send `handler-started` (tagged requests only)
//! 5. Invoke the user handler -- the single panic fault boundary
//! 6. Stream the response out through the observer
//! 7. After the body completes: drain wait-until (30 s ceiling), send
//!    `end`, release the request slot

use crate::context::InvocationContext;
use crate::env::RuntimeConfig;
use crate::ipc::IpcClient;
use crate::observer::{CompletionHook, ObservedBody, StreamingFlag};
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::any;
use chrono::Utc;
use fluid_protocol::{ErrorInfo, LogLevel};
use futures_util::FutureExt;
use std::convert::Infallible;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

/// Ceiling on the post-response wait for a request's background tasks.
pub const WAIT_UNTIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Time active requests get to finish once shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Health-check path answered without entering the pipeline.
pub const PING_PATH: &str = "/_vercel/ping";

// Internal identity headers, stripped before user code sees the request.
pub const HEADER_INVOCATION_ID: &str = "x-vercel-internal-invocation-id";
pub const HEADER_REQUEST_ID: &str = "x-vercel-internal-request-id";
pub const HEADER_SPAN_ID: &str = "x-vercel-internal-span-id";
pub const HEADER_TRACE_ID: &str = "x-vercel-internal-trace-id";

const INTERNAL_HEADERS: [&str; 4] = [
    HEADER_INVOCATION_ID,
    HEADER_REQUEST_ID,
    HEADER_SPAN_ID,
    HEADER_TRACE_ID,
];

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to bind on port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error(transparent)]
    Ipc(#[from] crate::ipc::IpcError),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// State shared by every request task and the shutdown path.
struct Shared {
    ipc: Arc<IpcClient>,
    /// One token per in-flight request; drained on shutdown.
    active: TaskTracker,
}

/// The local HTTP shell around a user handler.
pub struct Runtime {
    handler: Router,
    shared: Arc<Shared>,
    config: RuntimeConfig,
    started: Instant,
}

impl Runtime {
    /// Create a runtime around the user handler.
    ///
    /// Records the start instant first so `initDuration` covers everything
    /// from construction to listener-ready. An IPC dial failure is returned
    /// here; callers choose between fatal and degraded startup.
    pub async fn new(handler: Router, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let started = Instant::now();
        let ipc = match &config.ipc_path {
            Some(path) => IpcClient::connect(path).await?,
            None => IpcClient::disconnected(),
        };
        Ok(Self {
            handler,
            shared: Arc::new(Shared {
                ipc: Arc::new(ipc),
                active: TaskTracker::new(),
            }),
            config,
            started,
        })
    }

    /// Bind the listener and announce readiness.
    ///
    /// `PORT=0` binds an ephemeral port; the actual port is what goes on
    /// the `server-started` message and the stdout detection line. A
    /// failed `server-started` send is logged and startup continues.
    pub async fn bind(self) -> Result<BoundRuntime, RuntimeError> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RuntimeError::Bind {
                port: self.config.port,
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| RuntimeError::Bind {
                port: self.config.port,
                source,
            })?
            .port();

        let init_ms = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        if let Err(e) = self.shared.ipc.send_server_started(init_ms, port).await {
            eprintln!("fluid: failed to send server-started: {e}");
        }

        // Detection line read by the dev CLI; stdout on purpose.
        println!("Dev server listening: {port}");

        if let Some(file) = &self.config.dev_port_file {
            crate::dev::report_port(port, file);
        }

        info!(port, init_ms, "runtime listening");

        let app = Router::new()
            .route(PING_PATH, any(|| async { StatusCode::OK }))
            .fallback_service(RuntimeService {
                inner: self.handler,
                shared: Arc::clone(&self.shared),
            });

        Ok(BoundRuntime {
            listener,
            port,
            app,
            shared: self.shared,
        })
    }
}

/// A runtime whose listener is bound and announced; ready to serve.
pub struct BoundRuntime {
    listener: TcpListener,
    port: u16,
    app: Router,
    shared: Arc<Shared>,
}

impl BoundRuntime {
    /// The actual bound port (meaningful with `PORT=0`).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until SIGINT or SIGTERM, then drain and shut down.
    pub async fn serve(self) -> Result<(), RuntimeError> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves. On shutdown: flush still-buffered
    /// logs to stderr, give in-flight requests up to ten seconds, stop the
    /// listener, close the IPC connection.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = ()> + Send,
    {
        let BoundRuntime {
            listener,
            app,
            shared,
            ..
        } = self;

        tokio::select! {
            result = axum::serve(listener, app).into_future() => {
                result.map_err(RuntimeError::Serve)?;
            }
            () = shutdown => {
                shared.ipc.flush_to_stderr();
                shared.active.close();
                if tokio::time::timeout(SHUTDOWN_GRACE, shared.active.wait())
                    .await
                    .is_err()
                {
                    warn!("active requests did not finish within the shutdown grace period");
                }
                shared.ipc.close().await;
                info!("runtime shut down");
            }
        }
        Ok(())
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

// ---------------------------------------------------------------------------
// Per-request pipeline
// ---------------------------------------------------------------------------

/// Tower service running the full per-invocation pipeline around the user
/// router. Installed as the outer router's fallback so every non-ping
/// request passes through it.
#[derive(Clone)]
struct RuntimeService {
    inner: Router,
    shared: Arc<Shared>,
}

impl Service<Request<Body>> for RuntimeService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        let shared = Arc::clone(&self.shared);
        Box::pin(async move { Ok(handle_request(inner, shared, req).await) })
    }
}

async fn handle_request(
    handler: Router,
    shared: Arc<Shared>,
    mut req: Request<Body>,
) -> Response<Body> {
    let invocation_id = header_str(req.headers(), HEADER_INVOCATION_ID);
    let request_id = header_str(req.headers(), HEADER_REQUEST_ID)
        .parse::<u64>()
        .unwrap_or(0);
    for name in INTERNAL_HEADERS {
        req.headers_mut().remove(name);
    }

    let ctx = InvocationContext::new(invocation_id.clone(), request_id, Arc::clone(&shared.ipc));
    req.extensions_mut().insert(Arc::clone(&ctx));

    // Request slot, released once the end message has gone out.
    let slot = shared.active.token();

    let started_at = Utc::now().timestamp_millis();
    if !invocation_id.is_empty() {
        if let Err(e) = shared
            .ipc
            .send_handler_started(&invocation_id, request_id, started_at)
            .await
        {
            warn!(error = %e, "failed to send handler-started");
        }
    }

    // The user handler is the single fault boundary: a panic becomes a 500
    // response and an error value on the end message.
    let outcome = std::panic::AssertUnwindSafe(Arc::clone(&ctx).scope(handler.oneshot(req)))
        .catch_unwind()
        .await;

    let (response, handler_error) = match outcome {
        Ok(Ok(response)) => (response, None),
        Ok(Err(never)) => match never {},
        Err(panic) => {
            let message = format!("panic: {}", panic_message(panic.as_ref()));
            warn!(invocation_id = %invocation_id, message, "handler panicked");
            (
                internal_server_error(),
                Some(ErrorInfo::handler_error(message)),
            )
        }
    };

    let flag = StreamingFlag::new();
    let hook = {
        let flag = flag.clone();
        CompletionHook::new(move || finalize(shared, ctx, handler_error, flag, slot))
    };

    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Body::new(ObservedBody::new(body, flag, hook)))
}

/// Post-response steps, entered once the response body has been fully
/// written or the client has gone away: drain the wait-until group, send
/// `end`, release the request slot.
fn finalize(
    shared: Arc<Shared>,
    ctx: Arc<InvocationContext>,
    error: Option<ErrorInfo>,
    flag: StreamingFlag,
    slot: TaskTrackerToken,
) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("no async runtime available for post-response steps");
        return;
    };
    handle.spawn(async move {
        debug!(
            invocation_id = %ctx.invocation_id(),
            streaming = flag.is_streaming(),
            "response complete"
        );

        let tasks = ctx.tasks();
        tasks.close();
        if tokio::time::timeout(WAIT_UNTIL_TIMEOUT, tasks.wait())
            .await
            .is_err()
        {
            // Tasks are not cancelled; the deadline only bounds the wait.
            let _ = shared
                .ipc
                .send_log(
                    ctx.invocation_id(),
                    ctx.request_id(),
                    LogLevel::Warn,
                    "waitUntil tasks did not complete within 30 seconds",
                )
                .await;
        }

        if !ctx.invocation_id().is_empty() {
            if let Err(e) = shared
                .ipc
                .send_end(ctx.invocation_id(), ctx.request_id(), error)
                .await
            {
                warn!(error = %e, "failed to send end");
            }
        }

        drop(slot);
    });
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn internal_server_error() -> Response<Body> {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "Internal Server Error\n",
    )
        .into_response()
}
