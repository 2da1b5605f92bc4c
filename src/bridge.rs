//! Event bridge: translate proxy events to in-memory requests and back.
//!
//! A single JSON event becomes an `http::Request`, runs through the same
//! handler the HTTP shell uses, and the recorded response is shaped back
//! into an event envelope. Binary response bodies (per the content-type
//! classifier) are base64-encoded with `isBase64Encoded` set.
//!
//! Host and X-Forwarded-For lookups are case-insensitive across both
//! header maps; the multi-value maps win over their single-value
//! counterparts whenever non-empty.

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Method, Request, Uri, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tower::ServiceExt;
use tracing::warn;

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Incoming proxy event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyEvent {
    pub http_method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Preferred over `headers` when non-empty.
    pub multi_value_headers: HashMap<String, Vec<String>>,
    pub query_string_parameters: HashMap<String, String>,
    /// Preferred over `query_string_parameters` when non-empty.
    pub multi_value_query_string_parameters: HashMap<String, Vec<String>>,
    pub body: String,
    pub is_base64_encoded: bool,
}

/// Outgoing proxy response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    /// Populated only for keys whose recorded list has more than one entry.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub multi_value_headers: HashMap<String, Vec<String>>,
    pub body: String,
    pub is_base64_encoded: bool,
}

/// Client address from the event's `X-Forwarded-For` chain (first token).
///
/// Carried as a request extension: the bridge has no real socket peer, and
/// the value is not always a socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid base64 request body: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid method: {0}")]
    Method(#[from] axum::http::method::InvalidMethod),
    #[error("invalid request URI: {0}")]
    Uri(#[from] axum::http::uri::InvalidUri),
    #[error("failed to build request: {0}")]
    Http(#[from] axum::http::Error),
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Run one event through the handler.
///
/// Conversion failures become a plain 500 envelope rather than an error;
/// the invoker keeps polling either way.
pub async fn invoke(handler: Router, event: ProxyEvent) -> ProxyResponse {
    let request = match event_to_request(&event) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "failed to convert event to request");
            return internal_error_response();
        }
    };

    let response = match handler.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    response_to_event(response).await
}

fn internal_error_response() -> ProxyResponse {
    ProxyResponse {
        status_code: 500,
        body: "Internal Server Error".to_owned(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Event -> request
// ---------------------------------------------------------------------------

/// Synthesize an in-memory request from an event envelope.
pub fn event_to_request(event: &ProxyEvent) -> Result<Request<Body>, BridgeError> {
    let method: Method = event.http_method.parse()?;
    let uri = build_uri(event)?;

    let body_bytes = if event.body.is_empty() {
        Vec::new()
    } else if event.is_base64_encoded {
        BASE64.decode(&event.body)?
    } else {
        event.body.clone().into_bytes()
    };
    let body_len = body_bytes.len();

    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body_bytes))?;

    // The event's header set replaces anything default construction added.
    let headers = request.headers_mut();
    headers.clear();
    if event.multi_value_headers.is_empty() {
        for (name, value) in sorted_pairs(&event.headers) {
            if let (Ok(name), Ok(value)) =
                (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str()))
            {
                headers.insert(name, value);
            }
        }
    } else {
        for (name, values) in sorted_keys(&event.multi_value_headers) {
            for value in values {
                if let (Ok(name), Ok(value)) =
                    (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str()))
                {
                    headers.append(name, value);
                }
            }
        }
    }

    if let Some(host) = lookup_header(event, "host") {
        if let Ok(value) = HeaderValue::try_from(host.as_str()) {
            headers.insert(header::HOST, value);
        }
    }
    if body_len > 0 {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    }

    if let Some(addr) = forwarded_for(event) {
        request.extensions_mut().insert(RemoteAddr(addr));
    }

    Ok(request)
}

fn build_uri(event: &ProxyEvent) -> Result<Uri, BridgeError> {
    let host = lookup_header(event, "host").unwrap_or_default();
    let query = build_query(event);

    let mut target = String::new();
    if !host.is_empty() {
        target.push_str("https://");
        target.push_str(&host);
    }
    if !event.path.starts_with('/') {
        target.push('/');
    }
    target.push_str(&event.path);
    if !query.is_empty() {
        target.push('?');
        target.push_str(&query);
    }

    Ok(target.parse()?)
}

/// Compose the query string: every multi-value entry in order when that map
/// is non-empty, set-once single values otherwise. Keys are emitted in
/// sorted order for a deterministic encoding.
fn build_query(event: &ProxyEvent) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if event.multi_value_query_string_parameters.is_empty() {
        for (key, value) in sorted_pairs(&event.query_string_parameters) {
            serializer.append_pair(key, value);
        }
    } else {
        for (key, values) in sorted_keys(&event.multi_value_query_string_parameters) {
            for value in values {
                serializer.append_pair(key, value);
            }
        }
    }
    serializer.finish()
}

/// First value for `name` across both header maps, multi-value map first,
/// compared case-insensitively.
fn lookup_header(event: &ProxyEvent, name: &str) -> Option<String> {
    for (key, values) in &event.multi_value_headers {
        if key.eq_ignore_ascii_case(name) {
            if let Some(first) = values.first() {
                return Some(first.clone());
            }
        }
    }
    for (key, value) in &event.headers {
        if key.eq_ignore_ascii_case(name) {
            return Some(value.clone());
        }
    }
    None
}

fn forwarded_for(event: &ProxyEvent) -> Option<String> {
    lookup_header(event, "x-forwarded-for")
        .map(|xff| {
            xff.split(',')
                .next()
                .unwrap_or_default()
                .trim()
                .to_owned()
        })
        .filter(|addr| !addr.is_empty())
}

fn sorted_pairs(map: &HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut pairs: Vec<_> = map.iter().collect();
    pairs.sort_by_key(|(key, _)| key.as_str());
    pairs
}

fn sorted_keys(map: &HashMap<String, Vec<String>>) -> Vec<(&String, &Vec<String>)> {
    let mut pairs: Vec<_> = map.iter().collect();
    pairs.sort_by_key(|(key, _)| key.as_str());
    pairs
}

// ---------------------------------------------------------------------------
// Response -> event
// ---------------------------------------------------------------------------

/// Shape a recorded response into an event envelope.
///
/// Headers keep their first value in `headers`; the multi-value bag is
/// populated only for keys with more than one recorded value. Binary
/// content (per [`is_binary_content_type`]) is base64-encoded.
pub async fn response_to_event(response: axum::response::Response) -> ProxyResponse {
    let (parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to collect response body");
            return internal_error_response();
        }
    };

    let mut headers = HashMap::new();
    let mut multi_value_headers = HashMap::new();
    for key in parts.headers.keys() {
        let values: Vec<String> = parts
            .headers
            .get_all(key)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        if let Some(first) = values.first() {
            headers.insert(key.as_str().to_owned(), first.clone());
        }
        if values.len() > 1 {
            multi_value_headers.insert(key.as_str().to_owned(), values);
        }
    }

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let (body, is_base64_encoded) = if bytes.is_empty() {
        (String::new(), false)
    } else if is_binary_content_type(content_type) {
        (BASE64.encode(&bytes), true)
    } else {
        (String::from_utf8_lossy(&bytes).into_owned(), false)
    };

    ProxyResponse {
        status_code: parts.status.as_u16(),
        headers,
        multi_value_headers,
        body,
        is_base64_encoded,
    }
}

// ---------------------------------------------------------------------------
// Binary classifier
// ---------------------------------------------------------------------------

const BINARY_PREFIXES: [&str; 4] = ["image/", "audio/", "video/", "font/"];

const BINARY_TYPES: [&str; 10] = [
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-tar",
    "application/x-gzip",
    "application/x-bzip2",
    "application/x-7z-compressed",
    "application/x-rar-compressed",
    "application/wasm",
];

/// Whether a content type carries bytes that must be base64-encoded on the
/// event wire. Compared without parameters, lowercased; an empty content
/// type is not binary.
pub fn is_binary_content_type(content_type: &str) -> bool {
    if content_type.is_empty() {
        return false;
    }
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    BINARY_PREFIXES
        .iter()
        .any(|prefix| media_type.starts_with(prefix))
        || BINARY_TYPES.contains(&media_type.as_str())
}
