//! Runtime shell for HTTP handlers on the Vercel serverless platform.
//!
//! A handler is an ordinary [`axum::Router`]; [`run`] (or [`start`], from
//! an already-running async runtime) detects the execution environment and
//! runs the right shell around it:
//!
//! - under the managed invoker (`AWS_LAMBDA_FUNCTION_NAME` set), JSON
//!   events are polled and translated through the event bridge;
//! - otherwise a local HTTP server binds on `PORT` (default 3000), using
//!   an ephemeral port plus the dev handshake when `VERCEL_DEV_PORT_FILE`
//!   is set.
//!
//! ```no_run
//! use axum::{Router, routing::get};
//!
//! fn main() {
//!     let app = Router::new().route("/", get(|| async { "Hello!" }));
//!     if let Err(e) = fluid_runtime::run(app) {
//!         eprintln!("fluid: {e}");
//!         std::process::exit(1);
//!     }
//! }
//! ```
//!
//! Background work that must outlive the response goes through
//! [`wait_until`]; the runtime gives it up to 30 seconds after the
//! response is sent:
//!
//! ```no_run
//! async fn handler() -> &'static str {
//!     fluid_runtime::wait_until(async {
//!         // flush analytics, write audit logs, ...
//!     })
//!     .await;
//!     "response sent"
//! }
//! ```
//!
//! Outbound requests made through [`FetchClient`] are measured and
//! reported to the platform, keyed by the invocation they ran under.

pub mod bridge;
pub mod context;
mod dev;
mod env;
pub mod fetch;
pub mod ipc;
pub mod lambda;
pub mod observer;
pub mod runtime;

pub use context::{
    InvocationContext, debug, error, info, invocation_id, log, request_id, wait_until, warn,
};
pub use env::RuntimeConfig;
pub use fetch::{FetchClient, instrument};
pub use fluid_protocol::{LogLevel, LogStream};
pub use runtime::{Runtime, RuntimeError, WAIT_UNTIL_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Runtime(#[from] runtime::RuntimeError),
    #[error(transparent)]
    Lambda(#[from] lambda::LambdaError),
    #[error("failed to build the async runtime: {0}")]
    AsyncRuntime(std::io::Error),
}

/// Entry point for generated bootstrap mains.
///
/// Re-execs through `AWS_LAMBDA_EXEC_WRAPPER` while the process is still
/// single-threaded, then builds the async runtime and drives [`start`].
/// Call this from a plain `fn main`, before spawning any threads.
pub fn run(handler: axum::Router) -> Result<(), StartError> {
    env::reexec_through_wrapper();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(StartError::AsyncRuntime)?
        .block_on(start(handler))
}

/// Start the runtime around `handler`, selecting the execution mode from
/// the environment. Blocks until shutdown; an error is fatal and the
/// caller should exit non-zero.
///
/// For embedding in an existing async runtime. Does not handle the exec
/// wrapper; [`run`] does, because the re-exec must happen before any
/// worker thread exists.
pub async fn start(handler: axum::Router) -> Result<(), StartError> {
    init_tracing();

    if env::bridge_mode() {
        lambda::run(handler).await?;
        return Ok(());
    }

    let mut config = RuntimeConfig::from_env();

    let handler = match &config.dev_public_dir {
        Some(dir) => dev::with_public_dir(handler, dir),
        None => handler,
    };
    if config.dev_port_file.is_some() {
        // The dev handshake implies an ephemeral port.
        config.port = 0;
    }

    let runtime = Runtime::new(handler, config).await?;
    runtime.bind().await?.serve().await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    // Diagnostics go to stderr; stdout carries the dev-detection line.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
