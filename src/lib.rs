//! A service-function framework for async processes.
//!
//! A process hosts a set of named endpoints, each exposing fns that are
//! invoked by name over HTTP or from inside another fn body. Dispatch is
//! uniform either way: requests carry identity, versions, and deadlines;
//! execution runs on a bounded worker pool; identical in-flight requests
//! collapse to one execution; every invocation is traced and metered.
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use fns::config::Config;
//! use fns::endpoint::{FnHandler, Service};
//! use fns::endpoints::Endpoints;
//! use fns::errors::CodeError;
//! use fns::request::Request;
//! use serde_json::Value;
//! use tokio::net::TcpListener;
//!
//! struct GetUser;
//!
//! #[async_trait]
//! impl FnHandler for GetUser {
//!     fn name(&self) -> &str {
//!         "get"
//!     }
//!
//!     fn readonly(&self) -> bool {
//!         true
//!     }
//!
//!     async fn handle(&self, request: Arc<Request>) -> Result<Value, CodeError> {
//!         Ok(request.param().scan::<Value>()?.unwrap_or(Value::Null))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let port = config.transport.port;
//!     let endpoints = Endpoints::builder(config)
//!         .deploy(Service::new("users").with_fn(GetUser))
//!         .build()
//!         .await?;
//!     let listener = TcpListener::bind(("0.0.0.0", port)).await?;
//!     fns::serve(listener, endpoints).await;
//!     Ok(())
//! }
//! ```
//!
//! # Key concepts
//! - [endpoints::Endpoints] dispatches every invocation and owns the
//!   registry, worker pool, and single-flight group.
//! - [endpoint::Service] assembles an endpoint from [endpoint::FnHandler]
//!   implementations and components.
//! - [request::Request] is the immutable per-call value bundle; nested
//!   calls inherit its identity.
//! - [handler::FnsHandler] translates `/{endpoint}/{fn}` exchanges into
//!   dispatched invocations.
//! - [errors::CodeError] is the coded error every layer speaks.

/// HTTP response body handling.
pub mod body;

/// Process configuration: log, runtime, transport, per-endpoint nodes.
pub mod config;

/// The endpoint metadata document surface.
pub mod documents;

/// Endpoint, fn, and component trait seams.
pub mod endpoint;

/// The central dispatcher.
pub mod endpoints;

/// Coded errors and the failure taxonomy.
pub mod errors;

/// The HTTP mux.
pub mod handler;

/// Structured logging setup.
pub mod log;

/// Per-call metric records and the reporter queue.
pub mod metrics;

/// Scannable fn arguments.
pub mod param;

/// Write-once promise/future pairs.
pub mod promise;

/// The per-call request bundle.
pub mod request;

/// Scannable fn results.
pub mod response;

/// HTTP server loop and process lifecycle.
mod server;

/// Key-scoped collapsing of duplicate in-flight work.
pub mod singleflight;

/// The in-band span tree.
pub mod tracer;

/// HTTP-level type aliases.
pub mod types;

/// Version interval sets.
pub mod versions;

/// The bounded worker pool.
pub mod workers;

pub(crate) mod registry;

pub use endpoint::{Component, Endpoint, FnHandler, Service};
pub use endpoints::Endpoints;
pub use errors::CodeError;
pub use param::Param;
pub use request::{Request, RequestOptions};
pub use response::FnResponse;
pub use server::serve;
