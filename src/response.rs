//! Fn results as deferred, scannable value containers.
//!
//! A fn body returns an arbitrary JSON-encodable value; the caller receives
//! it wrapped in an [`FnResponse`] and decodes it on its own terms with
//! [`FnResponse::scan`]. The container is what single-flight waiters share,
//! so it is cheap to clone and immutable.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::CodeError;

/// The value produced by one fn invocation.
///
/// # Examples
///
/// ```rust
/// use fns::response::FnResponse;
/// use serde_json::json;
///
/// let response = FnResponse::new(json!({"id": "1"}));
/// assert!(response.valid());
/// let back: serde_json::Value = response.scan().unwrap().unwrap();
/// assert_eq!(back, json!({"id": "1"}));
/// ```
#[derive(Clone, Debug, Default)]
pub struct FnResponse {
    value: Option<Arc<Value>>,
}

impl FnResponse {
    /// Wraps a decoded value. `Value::Null` becomes the empty response.
    pub fn new(value: Value) -> Self {
        if value.is_null() {
            Self::empty()
        } else {
            Self {
                value: Some(Arc::new(value)),
            }
        }
    }

    /// A response carrying no value.
    pub fn empty() -> Self {
        Self { value: None }
    }

    /// Serializes any value into a response.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, CodeError> {
        let value = serde_json::to_value(value)
            .map_err(|err| CodeError::internal(format!("response encoding failed: {err}")))?;
        Ok(Self::new(value))
    }

    /// True when a value is present.
    pub fn valid(&self) -> bool {
        self.value.is_some()
    }

    /// The raw value, when present.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_deref()
    }

    /// Decodes the value into `T`. An empty response yields `Ok(None)`.
    pub fn scan<T: DeserializeOwned>(&self) -> Result<Option<T>, CodeError> {
        match &self.value {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.as_ref().clone())
                .map(Some)
                .map_err(|err| CodeError::internal(format!("response decoding failed: {err}"))),
        }
    }

    /// JSON bytes written to the HTTP surface. The empty response is `null`.
    pub fn to_json(&self) -> Result<bytes::Bytes, CodeError> {
        match &self.value {
            None => Ok(bytes::Bytes::from_static(b"null")),
            Some(value) => serde_json::to_vec(value.as_ref())
                .map(bytes::Bytes::from)
                .map_err(|err| CodeError::internal(format!("response encoding failed: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct User {
        id: String,
        name: String,
    }

    #[test]
    fn typed_round_trip() {
        let user = User {
            id: "1".into(),
            name: "ada".into(),
        };
        let response = FnResponse::from_value(&user).unwrap();
        assert!(response.valid());
        assert_eq!(response.scan::<User>().unwrap().unwrap(), user);
    }

    #[test]
    fn empty_response_is_null_on_the_wire() {
        let response = FnResponse::empty();
        assert!(!response.valid());
        assert_eq!(response.scan::<User>().unwrap(), None);
        assert_eq!(response.to_json().unwrap().as_ref(), b"null");
    }

    #[test]
    fn null_collapses_to_empty() {
        assert!(!FnResponse::new(json!(null)).valid());
    }
}
