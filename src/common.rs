use crate::error::GatewayError;
use bytes::Bytes;
use futures::Stream;
use http_body_util::{BodyExt, Empty, Full, combinators::UnsyncBoxBody};
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::fs::File as TokioFile;
use tokio::time::{Instant, Sleep};
use tokio_util::io::ReaderStream;

/// Body type shared by every response the gateway writes: file streams,
/// upstream bodies and small generated bodies all box into this.
pub type GatewayBody = UnsyncBoxBody<Bytes, std::io::Error>;

pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Boxes any body whose error can be reported as an I/O error, e.g. hyper's
/// `Incoming` on both the client and server side.
pub fn box_body<B>(body: B) -> GatewayBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    body.map_err(std::io::Error::other).boxed_unsync()
}

/// Plain-text error responses. Bodies carry the canonical reason phrase only.
pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn error(status: StatusCode) -> Response<GatewayBody> {
        let reason = status.canonical_reason().unwrap_or("Error");
        let mut response = Response::new(full_body(reason));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert(CONTENT_LENGTH, hyper::header::HeaderValue::from(reason.len()));
        response
    }

    pub fn from_error(error: &GatewayError) -> Response<GatewayBody> {
        let mut response = Self::error(error.status_code());
        if error.closes_connection() {
            response.headers_mut().insert(CONNECTION, hyper::header::HeaderValue::from_static("close"));
        }
        response
    }
}

/// Streams a file in chunks instead of reading it into memory.
pub struct StreamingFileBody {
    stream: ReaderStream<TokioFile>,
    remaining: u64,
}

impl StreamingFileBody {
    pub fn new(file: TokioFile, len: u64) -> Self {
        Self {
            stream: ReaderStream::new(file),
            remaining: len,
        }
    }
}

impl Body for StreamingFileBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match Pin::new(&mut self.stream).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.remaining = self.remaining.saturating_sub(chunk.len() as u64);
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}

/// Fails a streamed body whose next frame does not arrive within `idle`.
///
/// The deadline restarts after every frame, so slow but steady bodies are
/// never cut off.
pub struct IdleTimeoutBody {
    inner: GatewayBody,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl IdleTimeoutBody {
    pub fn new(inner: GatewayBody, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
        }
    }
}

impl Body for IdleTimeoutBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if let Poll::Ready(frame) = Pin::new(&mut self.inner).poll_frame(cx) {
            let next = Instant::now() + self.idle;
            self.deadline.as_mut().reset(next);
            return Poll::Ready(frame);
        }

        if self.deadline.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
        Poll::Ready(Some(Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no body data for {:?}", self.idle),
        ))))
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
