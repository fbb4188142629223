use crate::error::ProxyError;
use crate::rules::RuleSet;
use bytes::Bytes;
use http::HeaderMap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Unified body type flowing through the pipeline.
pub type ProxyBody = BoxBody<Bytes, ProxyError>;

/// Wraps a fixed payload as a [`ProxyBody`].
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(ProxyError::from).boxed()
}

pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Default cap on how many delimiter-free bytes are held back between
/// chunks. A run this long without quotes or whitespace is not markup, so
/// flushing it unrewritten is safe.
const MAX_HELD_TOKEN: usize = 64 * 1024;

fn is_boundary(byte: u8) -> bool {
    matches!(byte, b'"' | b'\'' | b'<' | b'>') || byte.is_ascii_whitespace()
}

/// Accumulates body chunks and releases spans that are safe to rewrite
/// independently.
///
/// A rewritable reference never contains a quote, whitespace, or an angle
/// bracket, so cutting the stream just after the last such delimiter
/// guarantees no reference spans two released spans. The incomplete trailing
/// token stays buffered until more bytes arrive or the body ends.
pub struct BoundaryBuffer {
    pending: Vec<u8>,
    max_held: usize,
}

impl BoundaryBuffer {
    pub fn new() -> Self {
        Self::with_max_held(MAX_HELD_TOKEN)
    }

    pub fn with_max_held(max_held: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_held,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Releases the longest prefix ending at a delimiter, if any. A pending
    /// run longer than the cap with no delimiter at all is released whole.
    pub fn take_ready(&mut self) -> Option<Vec<u8>> {
        match self.pending.iter().rposition(|&b| is_boundary(b)) {
            Some(last) => {
                let held = self.pending.split_off(last + 1);
                Some(std::mem::replace(&mut self.pending, held))
            }
            None if self.pending.len() > self.max_held => Some(std::mem::take(&mut self.pending)),
            None => None,
        }
    }

    /// Releases whatever remains at end of body.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

impl Default for BoundaryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming body transform: relays the upstream body chunk by chunk,
/// running the rule set over each span the [`BoundaryBuffer`] releases.
/// Never holds more than one span plus the incomplete tail in memory.
pub struct RewriteBody<B> {
    inner: B,
    buffer: BoundaryBuffer,
    rules: Arc<RuleSet>,
    trailers: Option<HeaderMap>,
    done: bool,
}

impl<B> RewriteBody<B> {
    pub fn new(inner: B, rules: Arc<RuleSet>) -> Self {
        Self {
            inner,
            buffer: BoundaryBuffer::new(),
            rules,
            trailers: None,
            done: false,
        }
    }
}

impl<B> Body for RewriteBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<ProxyError>,
{
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if this.done {
                if let Some(trailers) = this.trailers.take() {
                    return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                }
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(None) => {
                    this.done = true;
                    let tail = this.buffer.finish();
                    if !tail.is_empty() {
                        let out = this.rules.apply_owned(tail);
                        return Poll::Ready(Some(Ok(Frame::data(Bytes::from(out)))));
                    }
                }
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        this.buffer.feed(&data);
                        if let Some(span) = this.buffer.take_ready() {
                            let out = this.rules.apply_owned(span);
                            return Poll::Ready(Some(Ok(Frame::data(Bytes::from(out)))));
                        }
                    }
                    Err(frame) => {
                        // Trailers must not overtake buffered body bytes.
                        if let Ok(trailers) = frame.into_trailers() {
                            this.trailers = Some(trailers);
                        }
                        this.done = true;
                        let tail = this.buffer.finish();
                        if !tail.is_empty() {
                            let out = this.rules.apply_owned(tail);
                            return Poll::Ready(Some(Ok(Frame::data(Bytes::from(out)))));
                        }
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;
    use std::collections::VecDeque;
    use std::convert::Infallible;

    struct ChunkedTestBody {
        chunks: VecDeque<Bytes>,
    }

    impl ChunkedTestBody {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect(),
            }
        }
    }

    impl Body for ChunkedTestBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            match self.get_mut().chunks.pop_front() {
                Some(chunk) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
                None => Poll::Ready(None),
            }
        }
    }

    fn test_rules() -> Arc<RuleSet> {
        let target = Target::resolve("http://example.com").unwrap();
        Arc::new(RuleSet::build(&target, "localhost:8080", Vec::new()))
    }

    async fn rewrite_chunks(chunks: &[&[u8]]) -> Vec<u8> {
        let body = RewriteBody::new(ChunkedTestBody::new(chunks), test_rules());
        body.collect().await.unwrap().to_bytes().to_vec()
    }

    #[test]
    fn test_boundary_buffer_releases_up_to_last_delimiter() {
        let mut buffer = BoundaryBuffer::new();
        buffer.feed(b"<a href=\"http://exam");
        assert_eq!(buffer.take_ready().unwrap(), b"<a href=\"");
        // The held tail comes out once the token completes.
        buffer.feed(b"ple.com/x\">y");
        assert_eq!(buffer.take_ready().unwrap(), b"http://example.com/x\">");
        assert_eq!(buffer.finish(), b"y");
    }

    #[test]
    fn test_boundary_buffer_holds_incomplete_token() {
        let mut buffer = BoundaryBuffer::new();
        buffer.feed(b"http://exam");
        assert!(buffer.take_ready().is_none());
        assert_eq!(buffer.finish(), b"http://exam");
    }

    #[test]
    fn test_boundary_buffer_flushes_oversized_run() {
        let mut buffer = BoundaryBuffer::with_max_held(8);
        buffer.feed(b"0123456789abcdef");
        assert_eq!(buffer.take_ready().unwrap(), b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_reference_split_across_chunks_is_rewritten() {
        let out = rewrite_chunks(&[b"<a href=\"http://exam", b"ple.com/x\">y</a>"]).await;
        assert_eq!(out, b"<a href=\"http://localhost:8080/x\">y</a>");
    }

    #[tokio::test]
    async fn test_single_chunk_body_rewritten() {
        let out = rewrite_chunks(&[b"<a href=\"http://example.com/foo\">x</a>"]).await;
        assert_eq!(out, b"<a href=\"http://localhost:8080/foo\">x</a>");
    }

    #[tokio::test]
    async fn test_reference_at_end_of_body_rewritten() {
        // No trailing delimiter: the tail is only released by end-of-body.
        let out = rewrite_chunks(&[b"see http://example.com", b"/about"]).await;
        assert_eq!(out, b"see http://localhost:8080/about");
    }

    #[tokio::test]
    async fn test_non_matching_body_passes_through_byte_for_byte() {
        let chunks: &[&[u8]] = &[b"\xff\xfebinary ", b"bytes unchanged"];
        let out = rewrite_chunks(chunks).await;
        assert_eq!(out, b"\xff\xfebinary bytes unchanged");
    }
}
