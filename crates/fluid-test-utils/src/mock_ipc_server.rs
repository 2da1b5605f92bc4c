// mock_ipc_server: A mock platform control socket for runtime tests.
//
// Listens on a caller-supplied Unix socket path, decodes the NUL-framed
// JSON messages a runtime under test writes, and keeps them in arrival
// order for assertions.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fluid_protocol::{IpcCodec, IpcMessage};
use futures_util::StreamExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::FramedRead;

/// A mock IPC listener for integration testing.
///
/// Each test creates its own instance on a socket path inside a temp
/// directory, so suites can run in parallel without interference.
pub struct MockIpcServer {
    path: PathBuf,
    received: Arc<Mutex<Vec<IpcMessage>>>,
    /// Handle to the background accept loop; dropped with the server.
    _task: tokio::task::JoinHandle<()>,
}

impl MockIpcServer {
    /// Bind the listener at `path` and start recording in the background.
    ///
    /// Returns once the socket exists on disk; clients may connect
    /// immediately. Each accepted connection is served by its own task.
    pub async fn start(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path)?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, sink).await;
        });

        Ok(Self {
            path,
            received,
            _task: task,
        })
    }

    /// The socket path clients should dial.
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every message decoded so far, in arrival order.
    pub fn received(&self) -> Vec<IpcMessage> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` messages have arrived and return them.
    ///
    /// Panics with the messages seen so far when `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<IpcMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.received();
            if snapshot.len() >= count {
                return snapshot;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {count} IPC messages, got {snapshot:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // -- internal --

    async fn accept_loop(listener: UnixListener, sink: Arc<Mutex<Vec<IpcMessage>>>) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let sink = Arc::clone(&sink);
                    tokio::spawn(async move {
                        Self::handle_connection(stream, sink).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(stream: UnixStream, sink: Arc<Mutex<Vec<IpcMessage>>>) {
        let mut framed = FramedRead::new(stream, IpcCodec);
        while let Some(result) = framed.next().await {
            match result {
                Ok(msg) => sink.lock().unwrap().push(msg),
                // Decode errors end the recording for this connection; in
                // tests a malformed frame should surface as a missing
                // message rather than a crash of the harness.
                Err(_) => break,
            }
        }
    }
}
