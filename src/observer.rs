//! Response observation.
//!
//! [`ObservedBody`] wraps the response body to (a) record whether the
//! response streamed and (b) report the moment the response has been fully
//! written, or abandoned by the client, which is when the runtime runs its
//! post-response steps.
//!
//! Capability passthrough: `size_hint` and `is_end_stream` delegate to the
//! wrapped body, and connection upgrades ride request extensions that the
//! runtime never strips, so protocol upgrades work unchanged.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

/// Shared handle to the streaming indicator of one response.
#[derive(Clone, Debug, Default)]
pub struct StreamingFlag(Arc<AtomicBool>);

impl StreamingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether more than one data frame was produced before end-of-stream;
    /// the flush signal of a frame-based response model.
    pub fn is_streaming(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn mark(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Runs its closure exactly once: on explicit [`fire`](Self::fire) or,
/// failing that, when dropped.
pub struct CompletionHook(Option<Box<dyn FnOnce() + Send + 'static>>);

impl CompletionHook {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn fire(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for CompletionHook {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Body wrapper that detects streaming and fires a completion hook at
/// end-of-stream, or on drop when the client goes away mid-response.
pub struct ObservedBody<B> {
    inner: B,
    flag: StreamingFlag,
    data_frames: u64,
    hook: Option<CompletionHook>,
}

impl<B> ObservedBody<B> {
    pub fn new(inner: B, flag: StreamingFlag, hook: CompletionHook) -> Self {
        Self {
            inner,
            flag,
            data_frames: 0,
            hook: Some(hook),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.flag.is_streaming()
    }

    /// Unwrap accessors for code that inspects the concrete body.
    pub fn get_ref(&self) -> &B {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut B {
        &mut self.inner
    }

    /// Take the wrapper apart. The hook (when still pending) is returned
    /// to the caller, who becomes responsible for completion reporting.
    pub fn into_parts(mut self) -> (B, StreamingFlag, Option<CompletionHook>) {
        let hook = self.hook.take();
        (self.inner, self.flag, hook)
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if frame.is_data() {
                    this.data_frames += 1;
                    if this.data_frames > 1 {
                        this.flag.mark();
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                if let Some(hook) = this.hook.take() {
                    hook.fire();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// True for content types that imply an open-ended streamed response.
pub fn is_streaming_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("text/event-stream")
        || ct.contains("application/x-ndjson")
        || ct.contains("application/stream+json")
}
