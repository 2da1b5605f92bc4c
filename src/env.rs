//! Runtime environment configuration.
//!
//! The platform contract is environment-variable based; there is no config
//! file. `RuntimeConfig` snapshots the relevant variables once at startup.
//! Parse helpers are pure so they can be tested without touching the
//! process environment.
//!
//! # Variables
//! - `PORT` -- HTTP port, default 3000; unparseable values fall back.
//! - `VERCEL_IPC_PATH` -- control socket path; unset disables IPC.
//! - `VERCEL_DEV_PORT_FILE` -- dev handshake file; presence selects the
//!   dev variant (ephemeral port).
//! - `VERCEL_DEV_PUBLIC_DIR` -- static files served ahead of the handler.
//! - `AWS_LAMBDA_FUNCTION_NAME` -- presence selects event-bridge mode.
//! - `AWS_LAMBDA_EXEC_WRAPPER` -- re-exec through the wrapper at startup.

use std::env;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 3000;

pub const ENV_PORT: &str = "PORT";
pub const ENV_IPC_PATH: &str = "VERCEL_IPC_PATH";
pub const ENV_DEV_PORT_FILE: &str = "VERCEL_DEV_PORT_FILE";
pub const ENV_DEV_PUBLIC_DIR: &str = "VERCEL_DEV_PUBLIC_DIR";
pub const ENV_LAMBDA_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";
pub const ENV_LAMBDA_EXEC_WRAPPER: &str = "AWS_LAMBDA_EXEC_WRAPPER";
pub const ENV_LAMBDA_RUNTIME_API: &str = "AWS_LAMBDA_RUNTIME_API";

/// Snapshot of the runtime-relevant environment, taken once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// TCP port for the HTTP shell. `0` binds an ephemeral port.
    pub port: u16,
    /// Control socket path. `None` makes the IPC client a no-op sink.
    pub ipc_path: Option<PathBuf>,
    /// Dev-handshake file the bound port is reported to when fd 3 fails.
    pub dev_port_file: Option<PathBuf>,
    /// Directory of static files served ahead of the handler in dev mode.
    pub dev_public_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ipc_path: None,
            dev_port_file: None,
            dev_public_dir: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            port: parse_port(env::var(ENV_PORT).ok().as_deref()),
            ipc_path: non_empty(env::var(ENV_IPC_PATH).ok()).map(PathBuf::from),
            dev_port_file: non_empty(env::var(ENV_DEV_PORT_FILE).ok()).map(PathBuf::from),
            dev_public_dir: non_empty(env::var(ENV_DEV_PUBLIC_DIR).ok()).map(PathBuf::from),
        }
    }
}

/// Parse a `PORT` value; unset, empty, or unparseable falls back to 3000.
pub(crate) fn parse_port(raw: Option<&str>) -> u16 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PORT)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// True when running under the platform's function invoker.
pub(crate) fn bridge_mode() -> bool {
    env::var(ENV_LAMBDA_FUNCTION_NAME).is_ok_and(|v| !v.is_empty())
}

/// Re-exec the process through `AWS_LAMBDA_EXEC_WRAPPER` when set.
///
/// The wrapper receives the original argv appended to its own. Unsetting
/// the variable does not survive into the wrapper's environment on all
/// invokers, so it is overridden with an empty value instead.
///
/// Must run while the process is still single-threaded; `run` calls it
/// before the async runtime (and its worker threads) is built.
pub(crate) fn reexec_through_wrapper() {
    use std::os::unix::process::CommandExt;

    let Some(wrapper) = non_empty(env::var(ENV_LAMBDA_EXEC_WRAPPER).ok()) else {
        return;
    };

    // SAFETY: only reached from `run`, before the async runtime exists, so
    // no other thread can be reading or writing the environment.
    unsafe { env::set_var(ENV_LAMBDA_EXEC_WRAPPER, "") };

    let args: Vec<String> = env::args().collect();
    let err = std::process::Command::new(&wrapper).args(&args).exec();

    // exec only returns on failure.
    eprintln!("fluid: failed to exec wrapper {wrapper}: {err}");
    std::process::exit(1);
}
