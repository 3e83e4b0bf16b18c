//! Coded error values shared by every layer of the framework.
//!
//! Every failure that can cross a fn boundary is a [`CodeError`]: a stable
//! numeric code, a stable name, a human message, a metadata map, and an
//! optional cause chain. The same value serializes to the JSON error body
//! written by the HTTP surface, so a caller on either side of the wire sees
//! an identical shape.
//!
//! # Examples
//!
//! ```rust
//! use fns::errors::CodeError;
//!
//! let err = CodeError::not_found("endpoint was not found")
//!     .with_meta("endpoint", "users");
//! assert_eq!(err.code(), 404);
//! assert_eq!(err.name(), "***NOT FOUND***");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Stable code for worker pool saturation. Surfaced to HTTP as 429.
pub const CODE_TOO_MANY_REQUESTS: u16 = 429;

/// A structured, serializable error with a stable code and name.
///
/// `CodeError` is the only error type that flows through dispatch. Layers
/// annotate it with metadata (`endpoint`, `fn`, `path`) instead of wrapping
/// it in new types, and deeper causes are chained through [`CodeError::with_cause`].
///
/// # Examples
///
/// ```rust
/// use fns::errors::CodeError;
///
/// let cause = CodeError::internal("connect refused");
/// let err = CodeError::unavailable("database is unavailable").with_cause(cause);
/// assert_eq!(err.code(), 503);
/// assert!(err.cause().is_some());
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct CodeError {
    id: String,
    code: u16,
    name: String,
    message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stacktrace: Option<Stacktrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<Box<CodeError>>,
}

/// Construction site of an error, captured for the serialized form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stacktrace {
    pub file: String,
    pub line: u32,
}

macro_rules! code_ctor {
    ($(#[$doc:meta])* $fn_name:ident, $code:expr, $name:expr) => {
        $(#[$doc])*
        #[track_caller]
        pub fn $fn_name(message: impl Into<String>) -> Self {
            Self::new($code, $name, message)
        }
    };
}

impl CodeError {
    /// Creates an error with an explicit code and stable name.
    ///
    /// Prefer the taxonomy constructors (`bad_request`, `not_found`, ...)
    /// unless the code comes from a foreign system.
    #[track_caller]
    pub fn new(code: u16, name: impl Into<String>, message: impl Into<String>) -> Self {
        let loc = Location::caller();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code,
            name: name.into(),
            message: message.into(),
            meta: BTreeMap::new(),
            stacktrace: Some(Stacktrace {
                file: loc.file().to_string(),
                line: loc.line(),
            }),
            cause: None,
        }
    }

    code_ctor!(
        /// Malformed path, body, or header values.
        bad_request, 400, "***BAD REQUEST***");
    code_ctor!(
        /// The authorization subsystem rejected the credentials.
        unauthorized, 401, "***UNAUTHORIZED***");
    code_ctor!(
        /// The authorization subsystem denied the operation.
        forbidden, 403, "***FORBIDDEN***");
    code_ctor!(
        /// Unknown endpoint, unknown fn, or a version mismatch.
        not_found, 404, "***NOT FOUND***");
    code_ctor!(
        /// Missing device id or unparseable version intervals.
        not_acceptable, 406, "***NOT ACCEPTABLE***");
    code_ctor!(
        /// Deadline expired while awaiting the result.
        timeout, 408, "***TIMEOUT***");
    code_ctor!(
        /// Worker pool admission was denied.
        too_many_requests, CODE_TOO_MANY_REQUESTS, "***TOO MANY REQUESTS***");
    code_ctor!(
        /// Panic inside a fn body or a failure after startup.
        internal, 500, "***INTERNAL***");
    code_ctor!(
        /// The operation exists but has no implementation here.
        not_implemented, 501, "***NOT IMPLEMENTED***");
    code_ctor!(
        /// The process is shutting down or a collaborator is gone.
        unavailable, 503, "***UNAVAILABLE***");

    /// Soft error that annotates but does not mask a deeper cause.
    #[track_caller]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(555, "***WARNING***", message)
    }

    /// Attaches a metadata key/value pair.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Chains a deeper cause under this error.
    ///
    /// A [`CodeError::warning`] wrapping a coded cause keeps the cause's code
    /// and name visible through [`CodeError::code`] and [`CodeError::name`],
    /// so soft annotations never change what the transport reports.
    pub fn with_cause(mut self, cause: CodeError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Stable numeric code. Warnings defer to their cause.
    pub fn code(&self) -> u16 {
        if self.name == "***WARNING***" {
            if let Some(cause) = &self.cause {
                return cause.code();
            }
        }
        self.code
    }

    /// Stable name. Warnings defer to their cause.
    pub fn name(&self) -> &str {
        if self.name == "***WARNING***" {
            if let Some(cause) = &self.cause {
                return cause.name();
            }
        }
        &self.name
    }

    /// Human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Unique id of this error instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Metadata attached along the propagation path.
    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    /// The chained cause, when one was attached.
    pub fn cause(&self) -> Option<&CodeError> {
        self.cause.as_deref()
    }

    /// Maps the stable code onto an HTTP status.
    ///
    /// Unknown codes collapse to 500 so transport encoding failures never
    /// leak a nonsensical status line.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Serializes the error into its canonical JSON body.
    pub fn to_json(&self) -> bytes::Bytes {
        match serde_json::to_vec(self) {
            Ok(buf) => bytes::Bytes::from(buf),
            Err(_) => bytes::Bytes::from_static(
                br#"{"code":500,"name":"***INTERNAL***","message":"error encoding failed"}"#,
            ),
        }
    }
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}] {}", self.code, self.name, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeError")
            .field("code", &self.code)
            .field("name", &self.name)
            .field("message", &self.message)
            .field("meta", &self.meta)
            .field("cause", &self.cause)
            .finish()
    }
}

impl std::error::Error for CodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_codes_and_names() {
        assert_eq!(CodeError::bad_request("x").code(), 400);
        assert_eq!(CodeError::not_acceptable("x").name(), "***NOT ACCEPTABLE***");
        assert_eq!(CodeError::timeout("x").status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            CodeError::too_many_requests("x").status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn warning_defers_to_cause() {
        let err = CodeError::warning("fn annotated").with_cause(CodeError::not_found("missing"));
        assert_eq!(err.code(), 404);
        assert_eq!(err.name(), "***NOT FOUND***");
        assert_eq!(err.message(), "fn annotated");
    }

    #[test]
    fn json_shape_round_trips() {
        let err = CodeError::not_found("endpoint was not found")
            .with_meta("endpoint", "users")
            .with_cause(CodeError::internal("lookup failed"));
        let body = err.to_json();
        let back: CodeError = serde_json::from_slice(&body).unwrap();
        assert_eq!(back.code(), 404);
        assert_eq!(back.meta().get("endpoint").unwrap(), "users");
        assert_eq!(back.cause().unwrap().code(), 500);
    }
}
