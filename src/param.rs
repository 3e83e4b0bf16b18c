//! Fn arguments as scannable, transport-agnostic values.
//!
//! A [`Param`] is whatever arrived alongside a fn invocation: raw JSON bytes
//! from a POST body, an already decoded value from an in-process caller, or
//! a query-parameter view from a readonly GET. Fn bodies decode it once with
//! [`Param::scan`] into their own argument type; the framework itself never
//! interprets the payload.
//!
//! # Examples
//!
//! ```rust
//! use fns::param::Param;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct GetUser {
//!     id: String,
//! }
//!
//! let param = Param::from_json(r#"{"id":"1"}"#.as_bytes().to_vec());
//! let arg: GetUser = param.scan().unwrap().unwrap();
//! assert_eq!(arg.id, "1");
//! ```

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::form_urlencoded;

use crate::errors::CodeError;

/// The argument payload of one fn invocation.
///
/// `Param` is cheap to clone; decoded values and query views are shared
/// behind `Arc`. An absent payload is represented explicitly so fns can
/// distinguish "no argument" from "argument failed to decode".
#[derive(Clone, Debug, Default)]
pub enum Param {
    /// No payload was supplied.
    #[default]
    Empty,
    /// Raw JSON bytes, typically a POST body.
    Raw(Bytes),
    /// A value decoded (or produced) in process.
    Value(Arc<Value>),
    /// A query string from a readonly GET invocation.
    Query(Arc<str>),
}

impl Param {
    /// Wraps raw JSON bytes. Empty input becomes [`Param::Empty`].
    pub fn from_json(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        if body.is_empty() || body.as_ref() == b"null" {
            Self::Empty
        } else {
            Self::Raw(body)
        }
    }

    /// Serializes any value into an in-process param.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, CodeError> {
        let value = serde_json::to_value(value)
            .map_err(|err| CodeError::bad_request(format!("param encoding failed: {err}")))?;
        if value.is_null() {
            return Ok(Self::Empty);
        }
        Ok(Self::Value(Arc::new(value)))
    }

    /// Wraps a URL query string. Empty input becomes [`Param::Empty`].
    pub fn from_query(query: &str) -> Self {
        if query.is_empty() {
            Self::Empty
        } else {
            Self::Query(Arc::from(query))
        }
    }

    /// True when a payload is present.
    pub fn exist(&self) -> bool {
        !matches!(self, Self::Empty)
    }

    /// Decodes the payload into `T`.
    ///
    /// Raw bytes are decoded as JSON; in-process values are converted
    /// structurally; query views are exposed as a string map. An absent
    /// payload yields `Ok(None)` without touching the destination type,
    /// and an undecodable payload is a 400 class error.
    pub fn scan<T: DeserializeOwned>(&self) -> Result<Option<T>, CodeError> {
        match self {
            Self::Empty => Ok(None),
            Self::Raw(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|err| CodeError::bad_request(format!("param decoding failed: {err}"))),
            Self::Value(value) => serde_json::from_value(value.as_ref().clone())
                .map(Some)
                .map_err(|err| CodeError::bad_request(format!("param conversion failed: {err}"))),
            Self::Query(query) => {
                let object = query_to_value(query);
                serde_json::from_value(object)
                    .map(Some)
                    .map_err(|err| CodeError::bad_request(format!("query decoding failed: {err}")))
            }
        }
    }

    /// Canonical JSON bytes of the payload, used for fingerprinting and for
    /// forwarding the param across process boundaries.
    pub fn to_json(&self) -> Result<Bytes, CodeError> {
        match self {
            Self::Empty => Ok(Bytes::from_static(b"null")),
            Self::Raw(bytes) => Ok(bytes.clone()),
            Self::Value(value) => serde_json::to_vec(value.as_ref())
                .map(Bytes::from)
                .map_err(|err| CodeError::internal(format!("param encoding failed: {err}"))),
            Self::Query(query) => serde_json::to_vec(&query_to_value(query))
                .map(Bytes::from)
                .map_err(|err| CodeError::internal(format!("query encoding failed: {err}"))),
        }
    }
}

/// Decodes url-encoded pairs into a JSON object of strings.
///
/// Repeated keys keep the last value, matching how most readonly fns treat
/// query arguments.
fn query_to_value(query: &str) -> Value {
    let mut object = serde_json::Map::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        object.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    Value::Object(object)
}
