//! Request and response body helpers.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;

use crate::error::ProxyError;

/// Body type of every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

/// A request body as a stream of buffers.
pub type RequestStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send + 'static>>;

/// An empty body.
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A body holding a single buffer.
pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A body streaming the items of `stream` as data frames.
pub fn stream<S>(stream: S) -> ProxyBody
where
    S: Stream<Item = Result<Bytes, ProxyError>> + Send + 'static,
{
    StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync()
}

/// Adapts an incoming hyper body into a [`RequestStream`].
///
/// Trailers are dropped; read failures become [`ProxyError::ClientBody`].
pub fn request_stream<B>(body: B) -> RequestStream
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: std::fmt::Display,
{
    Box::pin(
        body.into_data_stream()
            .map_err(|e| ProxyError::ClientBody(e.to_string())),
    )
}
