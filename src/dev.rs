//! Dev-mode support: the port handshake and the static-file front.
//!
//! The dev CLI starts this process with an inherited pipe on fd 3 and
//! expects the bound port back as ASCII decimal. When fd 3 is not
//! writable, the port goes to the file named by `VERCEL_DEV_PORT_FILE`
//! instead, and the variable is cleared so child processes do not repeat
//! the handshake.

use axum::Router;
use std::io::Write;
use std::path::Path;
use tower_http::services::ServeDir;
use tracing::warn;

/// Report the bound port to the dev CLI: fd 3 first, handshake file as
/// the fallback. Losing both channels is fatal; without the handshake the
/// CLI cannot find the server.
pub(crate) fn report_port(port: u16, fallback: &Path) {
    let digits = port.to_string();
    if let Err(e) = write_fd3(digits.as_bytes()) {
        warn!(error = %e, "fd 3 not writable, using the handshake file");
        // SAFETY: runs during bind, after the config snapshot and before
        // the server accepts its first request; no task or thread in this
        // process touches the environment at this point.
        unsafe { std::env::remove_var(crate::env::ENV_DEV_PORT_FILE) };
        if let Err(e) = write_port_file(fallback, &digits) {
            eprintln!("fluid: failed to write dev port file: {e}");
            std::process::exit(1);
        }
    }
}

fn write_fd3(bytes: &[u8]) -> std::io::Result<()> {
    use std::os::fd::FromRawFd;

    // Fd 3 belongs to the dev CLI's pipe; borrow it for one write and
    // leave it open.
    let mut pipe = unsafe { std::fs::File::from_raw_fd(3) };
    let result = pipe.write_all(bytes).and_then(|()| pipe.flush());
    std::mem::forget(pipe);
    result
}

pub(crate) fn write_port_file(path: &Path, digits: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    file.write_all(digits.as_bytes())
}

/// Serve files from `public_dir` ahead of the handler; anything the
/// directory cannot satisfy falls through to the user router.
pub(crate) fn with_public_dir(handler: Router, public_dir: &Path) -> Router {
    let files = ServeDir::new(public_dir)
        .append_index_html_on_directories(true)
        .fallback(handler);
    Router::new().fallback_service(files)
}
