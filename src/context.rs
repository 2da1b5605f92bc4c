//! Per-invocation request context.
//!
//! The invocation record flows from the request decorator through user code
//! to the outbound fetch client via a task-local scope, so handlers never
//! pass it around themselves. The runtime also inserts it as a request
//! extension for handlers that want it explicitly.
//!
//! Outside an invocation every accessor degrades: [`wait_until`] runs the
//! future inline, [`log`] writes to stderr, [`invocation_id`] is empty and
//! [`request_id`] is zero.

use crate::ipc::IpcClient;
use fluid_protocol::LogLevel;
use std::future::Future;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

tokio::task_local! {
    static CURRENT: Arc<InvocationContext>;
}

/// Per-request state: platform identity plus the wait-until accumulator.
pub struct InvocationContext {
    invocation_id: String,
    request_id: u64,
    tasks: TaskTracker,
    ipc: Arc<IpcClient>,
}

impl InvocationContext {
    pub(crate) fn new(invocation_id: String, request_id: u64, ipc: Arc<IpcClient>) -> Arc<Self> {
        Arc::new(Self {
            invocation_id,
            request_id,
            tasks: TaskTracker::new(),
            ipc,
        })
    }

    /// Opaque platform identity; empty for requests the platform did not tag.
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub(crate) fn ipc(&self) -> &Arc<IpcClient> {
        &self.ipc
    }

    /// The context bound to the current task, if any.
    pub fn current() -> Option<Arc<InvocationContext>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    /// Run `fut` with this context bound to the task.
    pub(crate) async fn scope<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }
}

/// Register background work that must finish before the request is
/// released. The runtime waits for it after the response is sent, subject
/// to a 30-second ceiling; tasks are never cancelled on handler return.
///
/// Outside an invocation the future simply runs inline.
pub async fn wait_until<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match InvocationContext::current() {
        Some(ctx) => {
            ctx.tasks.spawn(fut);
        }
        None => fut.await,
    }
}

/// Send a log message to the platform, attributed to the current
/// invocation. Falls back to stderr when no invocation is bound or IPC is
/// disabled. Send failures are diagnostics, never handler errors.
pub async fn log(level: LogLevel, message: &str) {
    match InvocationContext::current() {
        Some(ctx) if ctx.ipc.is_connected() => {
            if let Err(e) = ctx
                .ipc
                .send_log(&ctx.invocation_id, ctx.request_id, level, message)
                .await
            {
                tracing::warn!(error = %e, "failed to send log over IPC");
            }
        }
        _ => eprintln!("[{}] {message}", level.as_str()),
    }
}

pub async fn debug(message: &str) {
    log(LogLevel::Debug, message).await;
}

pub async fn info(message: &str) {
    log(LogLevel::Info, message).await;
}

pub async fn warn(message: &str) {
    log(LogLevel::Warn, message).await;
}

pub async fn error(message: &str) {
    log(LogLevel::Error, message).await;
}

/// Invocation id of the current request; empty outside an invocation.
pub fn invocation_id() -> String {
    InvocationContext::current().map_or_else(String::new, |c| c.invocation_id.clone())
}

/// Request id of the current request; zero outside an invocation.
pub fn request_id() -> u64 {
    InvocationContext::current().map_or(0, |c| c.request_id)
}
