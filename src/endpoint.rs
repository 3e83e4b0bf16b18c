//! Endpoints, their fns, and the trait seams they plug into.
//!
//! An endpoint is a named collection of fns reachable at `/name/...`. Most
//! applications never implement [`Endpoint`] directly: they assemble a
//! [`Service`] from [`FnHandler`] implementations and optional components,
//! and deploy it on the manager.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use fns::endpoint::{FnHandler, Service};
//! use fns::errors::CodeError;
//! use fns::request::Request;
//! use serde_json::Value;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl FnHandler for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn handle(&self, request: Arc<Request>) -> Result<Value, CodeError> {
//!         Ok(request.param().scan::<Value>()?.unwrap_or(Value::Null))
//!     }
//! }
//!
//! let users = Service::new("users").with_fn(Echo);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::documents::{Document, FnInfo};
use crate::errors::CodeError;
use crate::request::Request;

/// A single callable operation on an endpoint.
#[async_trait]
pub trait FnHandler: Send + Sync + 'static {
    /// Unique within the owning endpoint.
    fn name(&self) -> &str;

    /// Readonly fns are additionally reachable by GET with query params.
    fn readonly(&self) -> bool {
        false
    }

    /// Internal fns are invisible to external clients.
    fn internal(&self) -> bool {
        false
    }

    /// Runs the operation against one request.
    async fn handle(&self, request: Arc<Request>) -> Result<serde_json::Value, CodeError>;
}

/// The fns of one endpoint, sorted by name.
#[derive(Clone, Default)]
pub struct Functions {
    entries: Vec<Arc<dyn FnHandler>>,
}

impl Functions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fn. Duplicate names are rejected.
    pub fn add(&mut self, handler: Arc<dyn FnHandler>) -> Result<(), CodeError> {
        match self
            .entries
            .binary_search_by(|e| e.name().cmp(handler.name()))
        {
            Ok(_) => Err(CodeError::internal(format!(
                "fn {:?} is already registered",
                handler.name()
            ))),
            Err(at) => {
                self.entries.insert(at, handler);
                Ok(())
            }
        }
    }

    /// Looks a fn up by name.
    pub fn find(&self, name: &str) -> Option<Arc<dyn FnHandler>> {
        self.entries
            .binary_search_by(|e| e.name().cmp(name))
            .ok()
            .map(|at| self.entries[at].clone())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flat descriptors for discovery and the document surface.
    ///
    /// An internal endpoint closes over its fns: every descriptor it
    /// exposes is internal regardless of the fn's own flag.
    pub fn infos(&self, endpoint_internal: bool) -> Vec<FnInfo> {
        self.entries
            .iter()
            .map(|e| FnInfo {
                name: e.name().to_string(),
                readonly: e.readonly(),
                internal: endpoint_internal || e.internal(),
            })
            .collect()
    }
}

/// Passed to endpoints and components at construction.
pub struct ConstructOptions {
    /// This process's instance id.
    pub id: String,
    /// This process's semantic version.
    pub version: semver::Version,
    /// The endpoint's own node of the config file.
    pub config: serde_json::Value,
    /// Log scope the endpoint should emit under.
    pub log: tracing::Span,
}

/// A named collaborator owned by one endpoint, reachable from fn bodies
/// through the request's local store.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn construct(&self, options: &ConstructOptions) -> anyhow::Result<()> {
        let _ = options;
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// The name-keyed component map of one endpoint.
#[derive(Clone, Default)]
pub struct Components {
    entries: HashMap<String, Arc<dyn Component>>,
}

impl Components {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.entries.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Component>> {
        self.entries.values()
    }

    fn insert(&mut self, component: Arc<dyn Component>) {
        self.entries.insert(component.name().to_string(), component);
    }
}

/// A deployable collection of fns.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Unique within the process.
    fn name(&self) -> &str;

    /// Internal endpoints have no external surface at all.
    fn internal(&self) -> bool {
        false
    }

    /// Optional document served by the document surface.
    fn document(&self) -> Option<Document> {
        None
    }

    fn functions(&self) -> &Functions;

    /// Components attached to requests dispatched into this endpoint.
    fn components(&self) -> Option<&Components> {
        None
    }

    /// One-time setup before the endpoint is registered.
    async fn construct(&mut self, options: ConstructOptions) -> anyhow::Result<()> {
        let _ = options;
        Ok(())
    }

    /// Endpoints with a background surface expose it here.
    fn as_listenable(&self) -> Option<&dyn Listenable> {
        None
    }

    async fn shutdown(&self) {}
}

/// Capability for endpoints that run a background listener.
#[async_trait]
pub trait Listenable: Send + Sync {
    /// Runs until `shutdown` is cancelled. An error returned within the
    /// startup window fails the whole listen phase.
    async fn listen(&self, shutdown: CancellationToken) -> Result<(), CodeError>;
}

/// The standard [`Endpoint`] implementation assembled from parts.
///
/// # Examples
///
/// ```rust,no_run
/// # use fns::endpoint::Service;
/// let users = Service::new("users");
/// let private = Service::new("sessions").internal();
/// ```
pub struct Service {
    name: String,
    internal: bool,
    document: Option<Document>,
    functions: Functions,
    components: Components,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            internal: false,
            document: None,
            functions: Functions::new(),
            components: Components::default(),
        }
    }

    /// Removes the service and all of its fns from the external surface.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn with_document(mut self, document: Document) -> Self {
        self.document = Some(document);
        self
    }

    /// Registers a fn, panicking on duplicate names.
    ///
    /// Registration happens at assembly time, before the process serves
    /// anything, so a duplicate is a programming error.
    pub fn with_fn(mut self, handler: impl FnHandler) -> Self {
        if let Err(err) = self.functions.add(Arc::new(handler)) {
            panic!("{err}");
        }
        self
    }

    pub fn with_component(mut self, component: impl Component) -> Self {
        self.components.insert(Arc::new(component));
        self
    }
}

#[async_trait]
impl Endpoint for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn internal(&self) -> bool {
        self.internal
    }

    fn document(&self) -> Option<Document> {
        self.document.clone()
    }

    fn functions(&self) -> &Functions {
        &self.functions
    }

    fn components(&self) -> Option<&Components> {
        if self.components.is_empty() {
            None
        } else {
            Some(&self.components)
        }
    }

    async fn construct(&mut self, options: ConstructOptions) -> anyhow::Result<()> {
        for component in self.components.iter() {
            component.construct(&options).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        for component in self.components.iter() {
            component.shutdown().await;
        }
    }
}
