//! HTTP response body handling.
//!
//! [`FnsBody`] is the single body type written by the transport. Every
//! reply on the fn surface is a buffered JSON document, so the wrapper
//! stays deliberately small: it boxes whatever hyper-compatible body it is
//! given and offers conversions from the byte-ish types the mux produces.
//!
//! # Examples
//!
//! ```rust
//! use fns::body::FnsBody;
//! use bytes::Bytes;
//!
//! let empty = FnsBody::empty();
//! let json = FnsBody::from(Bytes::from_static(b"{\"id\":\"1\"}"));
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Frame, SizeHint};

use crate::types::{BoxBody, BoxError};

/// The boxed response body used across the transport.
pub struct FnsBody(BoxBody);

impl FnsBody {
    /// Wraps any hyper-compatible body.
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(|e| e.into()).boxed_unsync())
    }

    /// A body that immediately signals end-of-stream.
    pub fn empty() -> Self {
        Self::new(Empty::new())
    }
}

impl Default for FnsBody {
    fn default() -> Self {
        Self::empty()
    }
}

macro_rules! body_from_impl {
    ($ty:ty) => {
        impl From<$ty> for FnsBody {
            fn from(buf: $ty) -> Self {
                Self::new(http_body_util::Full::from(buf))
            }
        }
    };
}

body_from_impl!(String);
body_from_impl!(Vec<u8>);
body_from_impl!(Bytes);

impl From<&str> for FnsBody {
    fn from(buf: &str) -> Self {
        Self::new(http_body_util::Full::from(buf.to_owned()))
    }
}

impl Body for FnsBody {
    type Data = Bytes;
    type Error = BoxError;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }
}
