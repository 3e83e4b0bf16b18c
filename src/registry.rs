//! The name-sorted endpoint registry.
//!
//! The registry is populated during deployment and becomes read-only once
//! the process listens, so lookups run without locks. Entries are ordered
//! by name ascending, ties broken by version ascending; lookup switches
//! from a linear scan to binary search once the registry is large enough
//! for that to pay off.

use std::sync::Arc;

use semver::Version;
use tracing::info_span;

use crate::documents::EndpointInfo;
use crate::endpoint::{ConstructOptions, Endpoint};
use crate::errors::CodeError;
use crate::versions::RequestVersions;

/// Entry count at which lookup switches to binary search.
const BINARY_SEARCH_THRESHOLD: usize = 65;

pub(crate) struct Entry {
    pub name: String,
    pub version: Version,
    pub id: String,
    pub endpoint: Arc<dyn Endpoint>,
}

/// Lookup filters derived from a request header.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// When set, the entry must belong to this process instance.
    /// A pinned id wins: it bypasses the version filter entirely.
    pub id: Option<String>,
    /// When set, the intervals must accept this process's version.
    pub versions: Option<RequestVersions>,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    /// Constructs and registers an endpoint under this process identity.
    ///
    /// Rejects duplicate names; the registry keeps one entry per endpoint
    /// name per process.
    pub async fn add(
        &mut self,
        mut endpoint: Box<dyn Endpoint>,
        id: &str,
        version: &Version,
        config: serde_json::Value,
    ) -> Result<(), CodeError> {
        let name = endpoint.name().to_string();
        if name.is_empty() {
            return Err(CodeError::internal("endpoint name is required"));
        }
        if self.position(&name).is_some() {
            return Err(CodeError::internal(format!(
                "endpoint {name:?} is already registered"
            )));
        }
        if endpoint.functions().is_empty() {
            return Err(CodeError::internal(format!(
                "endpoint {name:?} has no fns"
            )));
        }

        let options = ConstructOptions {
            id: id.to_string(),
            version: version.clone(),
            config,
            log: info_span!("endpoint", name = %name),
        };
        endpoint
            .construct(options)
            .await
            .map_err(|err| CodeError::internal(format!("construct {name:?} failed: {err}")))?;

        let entry = Entry {
            name,
            version: version.clone(),
            id: id.to_string(),
            endpoint: Arc::from(endpoint),
        };
        let at = self
            .entries
            .partition_point(|e| (&e.name, &e.version) < (&entry.name, &entry.version));
        self.entries.insert(at, entry);
        Ok(())
    }

    /// Looks an endpoint up by name, applying the header-derived filters.
    ///
    /// A version-filtered miss is indistinguishable from an unknown name.
    pub fn get(&self, name: &str, options: &GetOptions) -> Option<Arc<dyn Endpoint>> {
        let entry = self.position(name).map(|at| &self.entries[at])?;
        if let Some(id) = &options.id {
            // Pinned id: match or miss, the version filter does not apply.
            if entry.id == *id {
                return Some(entry.endpoint.clone());
            }
            return None;
        }
        if let Some(versions) = &options.versions {
            if !versions.accept(name, &entry.version) {
                return None;
            }
        }
        Some(entry.endpoint.clone())
    }

    /// Flattened metadata of every entry.
    pub fn info(&self) -> Vec<EndpointInfo> {
        self.entries
            .iter()
            .map(|entry| EndpointInfo {
                id: entry.id.clone(),
                version: entry.version.to_string(),
                name: entry.name.clone(),
                internal: entry.endpoint.internal(),
                functions: entry.endpoint.functions().infos(entry.endpoint.internal()),
                document: entry.endpoint.document(),
            })
            .collect()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<dyn Endpoint>> {
        self.entries.iter().map(|entry| &entry.endpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn position(&self, name: &str) -> Option<usize> {
        if self.entries.len() >= BINARY_SEARCH_THRESHOLD {
            self.entries
                .binary_search_by(|entry| entry.name.as_str().cmp(name))
                .ok()
        } else {
            self.entries.iter().position(|entry| entry.name == name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{FnHandler, Service};
    use crate::request::Request;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Noop;

    #[async_trait]
    impl FnHandler for Noop {
        fn name(&self) -> &str {
            "get"
        }

        async fn handle(&self, _request: Arc<Request>) -> Result<Value, CodeError> {
            Ok(Value::Null)
        }
    }

    fn version() -> Version {
        Version::new(1, 0, 0)
    }

    async fn registry_with(names: &[&str]) -> Registry {
        let mut registry = Registry::default();
        for name in names {
            registry
                .add(
                    Box::new(Service::new(*name).with_fn(Noop)),
                    "app-1",
                    &version(),
                    Value::Null,
                )
                .await
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mut registry = registry_with(&["users"]).await;
        let err = registry
            .add(
                Box::new(Service::new("users").with_fn(Noop)),
                "app-1",
                &version(),
                Value::Null,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 500);
    }

    #[tokio::test]
    async fn lookup_by_name() {
        let registry = registry_with(&["users", "tokens", "mail"]).await;
        assert!(registry.get("users", &GetOptions::default()).is_some());
        assert!(registry.get("absent", &GetOptions::default()).is_none());
    }

    #[tokio::test]
    async fn lookup_above_binary_search_threshold() {
        let names: Vec<String> = (0..80).map(|i| format!("ep{i:03}")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let registry = registry_with(&name_refs).await;
        assert!(registry.len() >= BINARY_SEARCH_THRESHOLD);
        assert!(registry.get("ep042", &GetOptions::default()).is_some());
        assert!(registry.get("ep999", &GetOptions::default()).is_none());
    }

    #[tokio::test]
    async fn version_filter_gates_lookup() {
        let registry = registry_with(&["users"]).await;
        let accepting = RequestVersions::parse("users=v1.0.0:v2.0.0").unwrap();
        let rejecting = RequestVersions::parse("users=v2.0.0:v3.0.0").unwrap();
        assert!(
            registry
                .get(
                    "users",
                    &GetOptions {
                        id: None,
                        versions: Some(accepting)
                    }
                )
                .is_some()
        );
        assert!(
            registry
                .get(
                    "users",
                    &GetOptions {
                        id: None,
                        versions: Some(rejecting)
                    }
                )
                .is_none()
        );
    }

    #[tokio::test]
    async fn pinned_id_wins_over_version_filter() {
        let registry = registry_with(&["users"]).await;
        let rejecting = RequestVersions::parse("users=v2.0.0:v3.0.0").unwrap();
        let options = GetOptions {
            id: Some("app-1".to_string()),
            versions: Some(rejecting),
        };
        assert!(registry.get("users", &options).is_some());

        let other = GetOptions {
            id: Some("app-2".to_string()),
            versions: None,
        };
        assert!(registry.get("users", &other).is_none());
    }
}
