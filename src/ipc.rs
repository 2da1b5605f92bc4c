//! IPC client for the platform control socket.
//!
//! Messages are compact JSON frames terminated by a single NUL byte, sent
//! over the Unix stream socket named by `VERCEL_IPC_PATH`. All writes go
//! through one mutex, so the receiver sees frames in emission order.
//!
//! Log messages submitted before `send_server_started` are buffered and
//! drained, in order, right after the server-started frame goes out. Logs
//! still buffered at teardown can be dumped to stderr instead.
//!
//! Write failures are returned to the caller but never tear the client
//! down; later sends remain safe. A client without a connection accepts
//! every message and drops it.

use fluid_protocol::codec;
use fluid_protocol::{
    EndPayload, ErrorInfo, FetchMetric, HandlerStartedPayload, InvocationRef, IpcMessage,
    LogLevel, LogPayload, LogStream, MetricPayload, ServerStartedPayload,
};
use std::path::Path;
use std::sync::Mutex as StdMutex;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("failed to connect to IPC socket {path}: {source}")]
    Dial {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to encode IPC message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write to IPC socket: {0}")]
    Write(#[from] std::io::Error),
}

/// Pre-ready log buffer. `ready` flips once `server-started` has been sent.
#[derive(Default)]
struct Pending {
    ready: bool,
    logs: Vec<IpcMessage>,
}

pub struct IpcClient {
    conn: Option<Mutex<UnixStream>>,
    pending: StdMutex<Pending>,
}

impl IpcClient {
    /// Dial the socket named by `VERCEL_IPC_PATH`. An unset or empty
    /// variable yields the no-op sink; a dial failure is reported to the
    /// caller, who decides between fatal and degraded startup.
    pub async fn from_env() -> Result<Self, IpcError> {
        match std::env::var(crate::env::ENV_IPC_PATH) {
            Ok(path) if !path.is_empty() => Self::connect(Path::new(&path)).await,
            _ => Ok(Self::disconnected()),
        }
    }

    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| IpcError::Dial {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            conn: Some(Mutex::new(stream)),
            pending: StdMutex::new(Pending::default()),
        })
    }

    /// A sink that accepts every message and drops it.
    pub fn disconnected() -> Self {
        Self {
            conn: None,
            pending: StdMutex::new(Pending::default()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn send(&self, msg: &IpcMessage) -> Result<(), IpcError> {
        let Some(conn) = &self.conn else {
            return Ok(());
        };
        let frame = codec::frame(msg)?;
        let mut stream = conn.lock().await;
        stream.write_all(&frame).await?;
        Ok(())
    }

    /// Buffer log messages until `server-started` has gone out.
    async fn send_or_buffer(&self, msg: IpcMessage) -> Result<(), IpcError> {
        if self.conn.is_none() {
            return Ok(());
        }
        {
            let mut pending = self.pending.lock().unwrap();
            if !pending.ready {
                pending.logs.push(msg);
                return Ok(());
            }
        }
        self.send(&msg).await
    }

    /// Announce the listener: elapsed init time and the actual bound port.
    /// Flips the client ready and drains the pre-ready log buffer in order.
    pub async fn send_server_started(
        &self,
        init_duration_ms: i64,
        http_port: u16,
    ) -> Result<(), IpcError> {
        self.send(&IpcMessage::ServerStarted(ServerStartedPayload {
            init_duration: init_duration_ms,
            http_port,
        }))
        .await?;

        let buffered = {
            let mut pending = self.pending.lock().unwrap();
            pending.ready = true;
            std::mem::take(&mut pending.logs)
        };
        for msg in buffered {
            self.send(&msg).await?;
        }
        Ok(())
    }

    pub async fn send_handler_started(
        &self,
        invocation_id: &str,
        request_id: u64,
        started_at_ms: i64,
    ) -> Result<(), IpcError> {
        self.send(&IpcMessage::HandlerStarted(HandlerStartedPayload {
            handler_started_at: started_at_ms,
            context: InvocationRef::new(invocation_id, request_id),
        }))
        .await
    }

    pub async fn send_end(
        &self,
        invocation_id: &str,
        request_id: u64,
        error: Option<ErrorInfo>,
    ) -> Result<(), IpcError> {
        self.send(&IpcMessage::End(EndPayload {
            context: InvocationRef::new(invocation_id, request_id),
            error,
        }))
        .await
    }

    pub async fn send_log(
        &self,
        invocation_id: &str,
        request_id: u64,
        level: LogLevel,
        message: &str,
    ) -> Result<(), IpcError> {
        self.send_or_buffer(IpcMessage::Log(LogPayload::new(
            InvocationRef::new(invocation_id, request_id),
            Some(level),
            None,
            message,
        )))
        .await
    }

    /// Raw stdout/stderr capture; carries a stream tag instead of a level.
    pub async fn send_stream_log(
        &self,
        invocation_id: &str,
        request_id: u64,
        stream: LogStream,
        message: &str,
    ) -> Result<(), IpcError> {
        self.send_or_buffer(IpcMessage::Log(LogPayload::new(
            InvocationRef::new(invocation_id, request_id),
            None,
            Some(stream),
            message,
        )))
        .await
    }

    pub async fn send_fetch_metric(
        &self,
        invocation_id: &str,
        request_id: u64,
        metric: FetchMetric,
    ) -> Result<(), IpcError> {
        self.send(&IpcMessage::Metric(MetricPayload::fetch(
            InvocationRef::new(invocation_id, request_id),
            metric,
        )))
        .await
    }

    /// Dump any still-buffered logs to stderr, `[level] message` per line.
    /// Used at teardown when the buffer never got a chance to drain.
    pub fn flush_to_stderr(&self) {
        let buffered = std::mem::take(&mut self.pending.lock().unwrap().logs);
        for msg in buffered {
            if let IpcMessage::Log(log) = msg {
                let level = log.level.map_or("", LogLevel::as_str);
                eprintln!("[{level}] {}", log.decoded_message());
            }
        }
    }

    pub async fn close(&self) {
        if let Some(conn) = &self.conn {
            let _ = conn.lock().await.shutdown().await;
        }
    }
}
