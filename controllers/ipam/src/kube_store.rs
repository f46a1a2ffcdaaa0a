//! `IpamStore` backed by the Kubernetes API.
//!
//! Status writes are JSON merge patches against the status subresource that
//! carry `metadata.resourceVersion`, so the API server rejects a write based
//! on a stale read with 409 Conflict.

use async_trait::async_trait;
use crds::{IPAllocation, IPAllocationStatus, NetworkPool, NetworkPoolStatus, ProviderConfig};
use ipam::{IpamStore, StoreError};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::fmt::Debug;
use tracing::debug;

/// Store over live cluster objects
#[derive(Clone)]
pub struct KubeIpamStore {
    client: Client,
}

impl std::fmt::Debug for KubeIpamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeIpamStore").finish_non_exhaustive()
    }
}

impl KubeIpamStore {
    /// Create a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        self.namespaced::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| store_error(&format!("{namespace}/{name}"), e))
    }

    async fn patch_status<K, S>(&self, object: &K, old: Option<&S>, new: &S) -> Result<K, StoreError>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
        S: Serialize,
    {
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let key = format!("{namespace}/{name}");
        let resource_version = object
            .resource_version()
            .ok_or_else(|| StoreError::Backend(format!("{key} has no resourceVersion")))?;

        let status = status_merge_patch(old, new).map_err(|e| StoreError::Backend(format!("{key}: {e}")))?;
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });

        debug!(object = %key, %resource_version, "Patching status");
        self.namespaced::<K>(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(&key, e))
    }
}

#[async_trait]
impl IpamStore for KubeIpamStore {
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<Option<NetworkPool>, StoreError> {
        self.get(namespace, name).await
    }

    async fn get_allocation(&self, namespace: &str, name: &str) -> Result<Option<IPAllocation>, StoreError> {
        self.get(namespace, name).await
    }

    async fn list_allocations(&self, namespace: &str) -> Result<Vec<IPAllocation>, StoreError> {
        self.namespaced::<IPAllocation>(namespace)
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| store_error(&format!("IPAllocation list in {namespace}"), e))
    }

    async fn get_provider_config(&self, namespace: &str, name: &str) -> Result<Option<ProviderConfig>, StoreError> {
        self.get(namespace, name).await
    }

    async fn update_allocation_status(
        &self,
        allocation: &IPAllocation,
        status: &IPAllocationStatus,
    ) -> Result<IPAllocation, StoreError> {
        self.patch_status(allocation, allocation.status.as_ref(), status).await
    }

    async fn update_pool_status(&self, pool: &NetworkPool, status: &NetworkPoolStatus) -> Result<NetworkPool, StoreError> {
        self.patch_status(pool, pool.status.as_ref(), status).await
    }
}

/// Merge patch turning `old` into `new`.
///
/// Keys present in `old` but omitted by `new`'s serialization (cleared
/// optionals, emptied lists) are sent as `null` so the server removes them.
pub fn status_merge_patch<S: Serialize>(old: Option<&S>, new: &S) -> Result<Value, serde_json::Error> {
    let mut patch = serde_json::to_value(new)?;
    let old = match old {
        Some(old) => serde_json::to_value(old)?,
        None => return Ok(patch),
    };
    if let (Value::Object(old), Value::Object(patch)) = (old, &mut patch) {
        let cleared: Map<String, Value> = old
            .into_iter()
            .filter(|(key, _)| !patch.contains_key(key))
            .map(|(key, _)| (key, Value::Null))
            .collect();
        patch.extend(cleared);
    }
    Ok(patch)
}

fn store_error(key: &str, error: kube::Error) -> StoreError {
    match &error {
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound(key.to_string()),
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict(format!("{key}: {}", response.message)),
        _ => StoreError::Backend(format!("{key}: {error}")),
    }
}
