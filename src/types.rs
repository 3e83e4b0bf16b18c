//! HTTP-level type aliases used by the transport.
//!
//! These aliases pin the request/response shapes the server loop and the
//! mux exchange: an inbound hyper request with a streaming body, and an
//! outbound response carrying [`FnsBody`](crate::body::FnsBody).

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;

use crate::body::FnsBody;

/// Inbound HTTP request with a streaming body.
pub type HttpRequest = hyper::Request<Incoming>;

/// Outbound HTTP response.
pub type HttpResponse = hyper::Response<FnsBody>;

/// Boxed HTTP body combining byte frames with error propagation.
pub(crate) type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

/// Boxed error type for thread-safe error handling.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
