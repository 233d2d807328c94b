use std::time::Instant;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tether_api::{Memcached, ObjectStore, StoreError, StoreResult};
use tether_core::ResourceId;
use tracing::debug;

/// Classify a kube client error by how a reconciler should react to it.
pub fn store_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound(ae.message),
            409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(ae.message),
            409 => StoreError::Conflict(ae.message),
            400 | 422 => StoreError::Invalid(ae.message),
            _ => StoreError::Unavailable(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// `ObjectStore` over the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn managed_api(&self, namespace: &str) -> Api<Memcached> { Api::namespaced(self.client.clone(), namespace) }

    fn child_api(&self, namespace: &str) -> Api<Deployment> { Api::namespaced(self.client.clone(), namespace) }

    /// Create a ConfigMap; used by seeding.
    pub async fn create_config_map(&self, cm: &ConfigMap) -> StoreResult<ConfigMap> {
        let ns = cm.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &ns);
        api.create(&PostParams::default(), cm).await.map_err(store_error)
    }
}

fn namespace_of<K: kube::Resource>(obj: &K) -> StoreResult<String> {
    obj.namespace().ok_or_else(|| StoreError::Invalid(format!("{}: namespace required", obj.name_any())))
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get_managed(&self, id: &ResourceId) -> StoreResult<Option<Memcached>> {
        self.managed_api(&id.namespace).get_opt(&id.name).await.map_err(store_error)
    }

    async fn update_managed_status(&self, obj: &Memcached) -> StoreResult<Memcached> {
        let started = Instant::now();
        let ns = namespace_of(obj)?;
        let data = serde_json::to_vec(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let out = self
            .managed_api(&ns)
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await
            .map_err(store_error);
        debug!(ns = %ns, name = %obj.name_any(), ok = out.is_ok(), took_ms = %started.elapsed().as_millis(), "replace_status");
        out
    }

    async fn get_child(&self, id: &ResourceId) -> StoreResult<Option<Deployment>> {
        self.child_api(&id.namespace).get_opt(&id.name).await.map_err(store_error)
    }

    async fn create_child(&self, child: &Deployment) -> StoreResult<Deployment> {
        let ns = namespace_of(child)?;
        self.child_api(&ns).create(&PostParams::default(), child).await.map_err(store_error)
    }

    async fn update_child(&self, child: &Deployment) -> StoreResult<Deployment> {
        let ns = namespace_of(child)?;
        self.child_api(&ns).replace(&child.name_any(), &PostParams::default(), child).await.map_err(store_error)
    }
}
