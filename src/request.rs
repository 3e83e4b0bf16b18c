//! The per-call value bundle flowing through dispatch.
//!
//! A [`Request`] carries identity (process id, request id, device), the
//! authorization token, the accepted version intervals, and the fn argument.
//! It is immutable after construction; the only mutable attachment is the
//! type-keyed local-value store used for components and the tracer. Identity
//! is inherited: a request acquired under a parent copies every header field
//! the caller did not override, and is forced internal.
//!
//! # Examples
//!
//! ```rust
//! use fns::param::Param;
//! use fns::request::{Request, RequestOptions};
//!
//! let request = Request::acquire(
//!     None,
//!     "users",
//!     "get",
//!     Param::from_query("id=1"),
//!     RequestOptions::new().device_id("d-1"),
//! )
//! .unwrap();
//! assert!(!request.header().internal);
//! assert!(!request.header().process_id.is_empty());
//! ```

use std::any::{Any, TypeId};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::errors::CodeError;
use crate::param::Param;
use crate::versions::RequestVersions;

/// Fixed seeds keep fingerprints stable across calls within one process.
const FINGERPRINT_SEEDS: (u64, u64, u64, u64) = (
    0x5f37_2b8a_91c4_d02e,
    0x9e11_7c3f_64a8_50bd,
    0x1b86_eab4_27f0_933c,
    0xc4d9_02e5_7831_6afb,
);

/// A hasher with process-stable seeds, shared by every fingerprint.
pub(crate) fn seeded_hasher() -> ahash::AHasher {
    RandomState::with_seeds(
        FINGERPRINT_SEEDS.0,
        FINGERPRINT_SEEDS.1,
        FINGERPRINT_SEEDS.2,
        FINGERPRINT_SEEDS.3,
    )
    .build_hasher()
}

/// Identity and transport metadata of one call-chain hop.
#[derive(Clone, Debug, Default)]
pub struct Header {
    /// Unique per hop; generated when absent.
    pub process_id: String,
    /// Stable across every hop of one logical request.
    pub request_id: String,
    /// Pins the call to one specific process instance.
    pub endpoint_id: Option<String>,
    /// Originating device. Required on externally produced calls.
    pub device_id: String,
    pub device_ip: Option<String>,
    /// Opaque authorization bytes, forwarded untouched.
    pub token: Option<Bytes>,
    pub accepted_versions: RequestVersions,
    /// True iff this call was produced by another in-process or
    /// intra-cluster call rather than by an external client.
    pub internal: bool,
}

/// Optional fields supplied at acquisition.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    request_id: Option<String>,
    process_id: Option<String>,
    endpoint_id: Option<String>,
    device_id: Option<String>,
    device_ip: Option<String>,
    token: Option<Bytes>,
    accepted_versions: Option<RequestVersions>,
    internal: bool,
    deadline: Option<Instant>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn process_id(mut self, id: impl Into<String>) -> Self {
        self.process_id = Some(id.into());
        self
    }

    pub fn endpoint_id(mut self, id: impl Into<String>) -> Self {
        self.endpoint_id = Some(id.into());
        self
    }

    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        self.device_id = Some(id.into());
        self
    }

    pub fn device_ip(mut self, ip: impl Into<String>) -> Self {
        self.device_ip = Some(ip.into());
        self
    }

    pub fn token(mut self, token: impl Into<Bytes>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn accepted_versions(mut self, versions: RequestVersions) -> Self {
        self.accepted_versions = Some(versions);
        self
    }

    /// Marks the request as produced by the system itself.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Absolute deadline for awaiting the fn result.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Type-keyed values attached to one request.
///
/// This is the only mutable part of a request. Components and the tracer
/// live here so fn bodies reach them through the request instead of a
/// global registry.
#[derive(Default)]
pub struct Locals {
    values: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Locals {
    pub fn set<T: Send + Sync + 'static>(&self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn set_shared<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        self.values.insert(TypeId::of::<T>(), value);
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .map(|v| v.clone())
            .and_then(|v| v.downcast::<T>().ok())
    }
}

/// One fn invocation's execution context.
pub struct Request {
    header: Header,
    endpoint_name: String,
    fn_name: String,
    param: Param,
    deadline: Option<Instant>,
    locals: Locals,
}

impl Request {
    /// Builds a request from options and, when present, a parent request.
    ///
    /// Every header field unset in `options` is copied from the parent,
    /// and a parented request is forced internal. Guarantees on return:
    /// the names are non-empty, the process id is populated, and a
    /// non-internal request carries a device id.
    pub fn acquire(
        parent: Option<&Request>,
        endpoint_name: impl Into<String>,
        fn_name: impl Into<String>,
        param: Param,
        options: RequestOptions,
    ) -> Result<Arc<Self>, CodeError> {
        let endpoint_name = endpoint_name.into();
        let fn_name = fn_name.into();
        if endpoint_name.is_empty() || fn_name.is_empty() {
            return Err(CodeError::bad_request("endpoint name and fn name are required"));
        }

        let parent_header = parent.map(Request::header);
        let inherit = |own: Option<String>, from_parent: fn(&Header) -> Option<String>| {
            own.or_else(|| parent_header.and_then(from_parent))
        };

        let header = Header {
            process_id: options
                .process_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            request_id: inherit(options.request_id, |h| Some(h.request_id.clone()))
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            endpoint_id: options.endpoint_id,
            device_id: inherit(options.device_id, |h| Some(h.device_id.clone()))
                .unwrap_or_default(),
            device_ip: inherit(options.device_ip, |h| h.device_ip.clone()),
            token: options
                .token
                .or_else(|| parent_header.and_then(|h| h.token.clone())),
            accepted_versions: options
                .accepted_versions
                .or_else(|| parent_header.map(|h| h.accepted_versions.clone()))
                .unwrap_or_default(),
            internal: options.internal || parent.is_some(),
        };

        if !header.internal && header.device_id.is_empty() {
            return Err(CodeError::not_acceptable("device id is required"));
        }

        let deadline = options.deadline.or_else(|| parent.and_then(Request::deadline));

        let request = Self {
            header,
            endpoint_name,
            fn_name,
            param,
            deadline,
            locals: Locals::default(),
        };
        if let Some(parent) = parent {
            request.adopt_locals(parent);
        }
        Ok(Arc::new(request))
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn fn_name(&self) -> &str {
        &self.fn_name
    }

    pub fn param(&self) -> &Param {
        &self.param
    }

    /// Deadline for awaiting this call's result, when one applies.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The request-scoped local-value store.
    pub fn locals(&self) -> &Locals {
        &self.locals
    }

    /// The owning endpoint's components, attached by the dispatcher.
    pub fn components(&self) -> Option<Arc<crate::endpoint::Components>> {
        self.locals.get()
    }

    /// Deterministic content fingerprint, the single-flight key.
    ///
    /// Stable across equal inputs within one process. Token and device id
    /// participation is governed by `policy`.
    pub fn fingerprint(&self, policy: HashPolicy) -> u64 {
        let mut hasher = seeded_hasher();
        self.endpoint_name.hash(&mut hasher);
        self.fn_name.hash(&mut hasher);
        self.header.accepted_versions.to_string().hash(&mut hasher);
        if policy.token {
            self.header.token.as_deref().unwrap_or_default().hash(&mut hasher);
        }
        if policy.device_id {
            self.header.device_id.hash(&mut hasher);
        }
        match self.param.to_json() {
            Ok(body) => body.hash(&mut hasher),
            // An unencodable param never collapses with anything.
            Err(_) => self.header.process_id.hash(&mut hasher),
        }
        hasher.finish()
    }

    /// Shares cross-call attachments (the tracer) with a child request.
    fn adopt_locals(&self, parent: &Request) {
        if let Some(tracer) = parent.locals.get::<crate::tracer::Tracer>() {
            self.locals.set_shared(tracer);
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("endpoint", &self.endpoint_name)
            .field("fn", &self.fn_name)
            .field("request_id", &self.header.request_id)
            .field("internal", &self.header.internal)
            .finish()
    }
}

/// Which identity fields participate in single-flight keys.
///
/// Token participation defaults on, so responses are never shared across
/// principals that happen to send equal payloads.
#[derive(Clone, Copy, Debug)]
pub struct HashPolicy {
    pub token: bool,
    pub device_id: bool,
}

impl Default for HashPolicy {
    fn default() -> Self {
        Self {
            token: true,
            device_id: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn external() -> Arc<Request> {
        Request::acquire(
            None,
            "users",
            "get",
            Param::from_query("id=1"),
            RequestOptions::new()
                .device_id("d-1")
                .device_ip("10.0.0.9")
                .token(&b"bearer x"[..])
                .request_id("r-1"),
        )
        .unwrap()
    }

    #[test]
    fn empty_names_are_rejected() {
        let err = Request::acquire(None, "", "get", Param::Empty, RequestOptions::new())
            .unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn external_request_requires_device_id() {
        let err = Request::acquire(None, "users", "get", Param::Empty, RequestOptions::new())
            .unwrap_err();
        assert_eq!(err.code(), 406);
    }

    #[test]
    fn internal_request_needs_no_device() {
        let request =
            Request::acquire(None, "users", "get", Param::Empty, RequestOptions::new().internal())
                .unwrap();
        assert!(request.header().internal);
        assert!(!request.header().process_id.is_empty());
    }

    #[test]
    fn child_inherits_identity_and_is_internal() {
        let parent = external();
        let child =
            Request::acquire(Some(&parent), "tokens", "mint", Param::Empty, RequestOptions::new())
                .unwrap();
        let header = child.header();
        assert!(header.internal);
        assert_eq!(header.request_id, "r-1");
        assert_eq!(header.device_id, "d-1");
        assert_eq!(header.device_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(header.token.as_deref(), Some(&b"bearer x"[..]));
        assert_ne!(header.process_id, parent.header().process_id);
    }

    #[test]
    fn child_overrides_win() {
        let parent = external();
        let child = Request::acquire(
            Some(&parent),
            "tokens",
            "mint",
            Param::Empty,
            RequestOptions::new().request_id("r-2").token(&b"other"[..]),
        )
        .unwrap();
        assert_eq!(child.header().request_id, "r-2");
        assert_eq!(child.header().token.as_deref(), Some(&b"other"[..]));
    }

    #[test]
    fn child_inherits_deadline() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let parent = Request::acquire(
            None,
            "users",
            "get",
            Param::Empty,
            RequestOptions::new().device_id("d-1").deadline(deadline),
        )
        .unwrap();
        let child =
            Request::acquire(Some(&parent), "tokens", "mint", Param::Empty, RequestOptions::new())
                .unwrap();
        assert_eq!(child.deadline(), Some(deadline));
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = external();
        let b = external();
        let policy = HashPolicy::default();
        assert_eq!(a.fingerprint(policy), b.fingerprint(policy));

        let other = Request::acquire(
            None,
            "users",
            "get",
            Param::from_query("id=2"),
            RequestOptions::new().device_id("d-1").token(&b"bearer x"[..]),
        )
        .unwrap();
        assert_ne!(a.fingerprint(policy), other.fingerprint(policy));
    }

    #[test]
    fn fingerprint_policy_controls_token() {
        let with_token = external();
        let other_token = Request::acquire(
            None,
            "users",
            "get",
            Param::from_query("id=1"),
            RequestOptions::new().device_id("d-1").token(&b"bearer y"[..]),
        )
        .unwrap();
        let strict = HashPolicy::default();
        assert_ne!(with_token.fingerprint(strict), other_token.fingerprint(strict));
        let lax = HashPolicy {
            token: false,
            device_id: false,
        };
        assert_eq!(with_token.fingerprint(lax), other_token.fingerprint(lax));
    }

    #[test]
    fn locals_are_type_keyed() {
        let request = external();
        request.locals().set(42_u64);
        assert_eq!(request.locals().get::<u64>().as_deref(), Some(&42));
        assert!(request.locals().get::<String>().is_none());
    }
}
