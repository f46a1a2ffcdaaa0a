//! Kubernetes object references for Butler CRDs
//!
//! Mirrors the Kubernetes `LocalObjectReference` pattern (name only, same
//! namespace as the referencing object) and a namespaced variant for
//! cross-namespace references.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace as the referencing resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referenced object
    pub name: String,
}

impl LocalObjectReference {
    /// Create a reference by name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Reference to an object that may live in another namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedObjectReference {
    /// Name of the referenced object
    pub name: String,

    /// Namespace of the referenced object (defaults to the referencing object's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl NamespacedObjectReference {
    /// Create a reference with an explicit namespace
    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Resolve the namespace, falling back to `default_namespace`
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_namespace)
    }

    /// `namespace/name` key, used to group allocations per tenant cluster
    pub fn key(&self, default_namespace: &str) -> String {
        format!("{}/{}", self.namespace_or(default_namespace), self.name)
    }
}

/// Reference to a ProviderConfig
pub type ProviderReference = NamespacedObjectReference;
