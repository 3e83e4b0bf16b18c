//! The endpoint metadata document surface.
//!
//! Discovery and the `/documents` route never walk the live registry; they
//! read an immutable snapshot rebuilt whenever the registry changes. The
//! snapshot swap is lock-free on the read side.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Descriptor of one fn as exposed to discovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FnInfo {
    pub name: String,
    pub readonly: bool,
    pub internal: bool,
}

/// Human-facing description attached to an endpoint, the data model behind
/// an openapi-compatible rendering.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub description: String,
}

impl Document {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Flattened metadata of one registered endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub id: String,
    pub version: String,
    pub name: String,
    pub internal: bool,
    pub functions: Vec<FnInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub document: Option<Document>,
}

impl EndpointInfo {
    /// Finds a fn descriptor by name.
    pub fn fn_info(&self, name: &str) -> Option<&FnInfo> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// The served snapshot.
#[derive(Default)]
pub struct Documents {
    snapshot: ArcSwap<Vec<EndpointInfo>>,
}

impl Documents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot after a registry change.
    pub fn refresh(&self, infos: Vec<EndpointInfo>) {
        self.snapshot.store(Arc::new(infos));
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<Vec<EndpointInfo>> {
        self.snapshot.load_full()
    }

    /// The snapshot filtered to the externally visible surface, serialized
    /// for the `/documents` route.
    pub fn to_json(&self) -> bytes::Bytes {
        let snapshot = self.get();
        let visible: Vec<&EndpointInfo> = snapshot.iter().filter(|info| !info.internal).collect();
        match serde_json::to_vec(&visible) {
            Ok(buf) => bytes::Bytes::from(buf),
            Err(_) => bytes::Bytes::from_static(b"[]"),
        }
    }
}
