// fluid-protocol: IPC message types and wire framing.
//
// All messages on the platform control socket use a top-level `type` field
// for discriminated deserialization, with the body carried under `payload`.
// Field names are camelCase on the wire.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{CodecError, FRAME_TERMINATOR, IpcCodec};

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Identity of a single invocation, attached to every per-request message.
///
/// `invocation_id` is an opaque string assigned by the platform; empty when
/// the request did not come from the platform. `request_id` defaults to 0
/// in the same case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRef {
    pub invocation_id: String,
    pub request_id: u64,
}

impl InvocationRef {
    pub fn new(invocation_id: impl Into<String>, request_id: u64) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            request_id,
        }
    }
}

/// Error carried on an `end` message when the handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
}

impl ErrorInfo {
    /// The conventional error name used by the platform for handler faults.
    pub fn handler_error(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_owned(),
            message: message.into(),
        }
    }
}

/// Severity of a `log` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Source stream of a raw `log` message (captured stdout/stderr).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of `server-started`.
///
/// `init_duration` is measured from process start to the moment the HTTP
/// listener is bound, not to the first request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStartedPayload {
    pub init_duration: i64,
    pub http_port: u16,
}

/// Payload of `handler-started`. `handler_started_at` is a ms-epoch stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerStartedPayload {
    pub handler_started_at: i64,
    pub context: InvocationRef,
}

/// Payload of `end`. `error` is serialized as `null` on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPayload {
    pub context: InvocationRef,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

/// Payload of `log`. `message` is base64 of the UTF-8 message text; NUL can
/// never appear in the frame because JSON strings forbid it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPayload {
    pub context: InvocationRef,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<LogStream>,
}

impl LogPayload {
    pub fn new(
        context: InvocationRef,
        level: Option<LogLevel>,
        stream: Option<LogStream>,
        text: &str,
    ) -> Self {
        Self {
            context,
            message: BASE64.encode(text.as_bytes()),
            level,
            stream,
        }
    }

    /// Decode the base64 message text; invalid input decodes lossily.
    pub fn decoded_message(&self) -> String {
        match BASE64.decode(&self.message) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => self.message.clone(),
        }
    }
}

/// One outbound-request measurement.
///
/// `id` is monotonically increasing and scoped to the runtime process, not
/// to an invocation. `status_code` is 0 when the transport itself failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchMetric {
    pub pathname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub search: String,
    pub start: i64,
    pub duration: i64,
    pub host: String,
    pub status_code: u16,
    pub method: String,
    pub id: u64,
}

/// Payload of `metric`. The inner `type`/`payload` pair mirrors the outer
/// envelope; `fetch-metric` is the only kind currently defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPayload {
    pub context: InvocationRef,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub payload: FetchMetric,
}

impl MetricPayload {
    pub fn fetch(context: InvocationRef, metric: FetchMetric) -> Self {
        Self {
            context,
            metric_type: "fetch-metric".to_owned(),
            payload: metric,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All message kinds on the IPC stream.
///
/// Serializes with the `type` tag next to the `payload` body:
///
/// ```json
/// { "type": "server-started", "payload": { "initDuration": 12, "httpPort": 3000 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "kebab-case")]
pub enum IpcMessage {
    ServerStarted(ServerStartedPayload),
    HandlerStarted(HandlerStartedPayload),
    End(EndPayload),
    Log(LogPayload),
    Metric(MetricPayload),
}

impl IpcMessage {
    /// The invocation the message belongs to; `server-started` has none.
    pub fn context(&self) -> Option<&InvocationRef> {
        match self {
            IpcMessage::ServerStarted(_) => None,
            IpcMessage::HandlerStarted(p) => Some(&p.context),
            IpcMessage::End(p) => Some(&p.context),
            IpcMessage::Log(p) => Some(&p.context),
            IpcMessage::Metric(p) => Some(&p.context),
        }
    }
}
