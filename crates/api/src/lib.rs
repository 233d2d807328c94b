//! Tether API surface: the `Memcached` resource and the object store it lives in.
//!
//! The store is an external collaborator. This crate only defines the seam;
//! `tether-store` provides an in-memory implementation and `tether-kubehub`
//! the kube-rs one.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tether_core::{Condition, ResourceId};

pub use tether_core::ReconcileOutcome;

/// Condition type summarizing whether the managed workload is serving.
pub const CONDITION_AVAILABLE: &str = "Available";

pub const REASON_RECONCILING: &str = "Reconciling";
pub const REASON_RESIZING: &str = "Resizing";
pub const REASON_RECONCILED: &str = "Reconciled";

/// Desired state of a memcached deployment.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cache.tether.dev",
    version = "v1",
    kind = "Memcached",
    namespaced,
    status = "MemcachedStatus",
    shortname = "mc",
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MemcachedSpec {
    /// Number of memcached replicas.
    pub size: i32,
    /// Port memcached listens on (default 11211).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i32>,
    /// Container image override; the controller's configured image otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemcachedStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Memcached {
    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }
}

/// Store failures, by how callers are expected to react.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    /// Object is gone; equivalent to already cleaned up.
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    /// Write lost an optimistic-concurrency race; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The store rejected the object itself.
    #[error("invalid: {0}")]
    Invalid(String),
    /// Backend unreachable or failing; retry with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }

    pub fn label(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::AlreadyExists(_) => "already_exists",
            StoreError::Conflict(_) => "conflict",
            StoreError::Invalid(_) => "invalid",
            StoreError::Unavailable(_) => "unavailable",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reads and writes of the managed resource and its owned child.
///
/// Children are addressed by the owner's identity; an absent object is
/// `Ok(None)`, not an error.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_managed(&self, id: &ResourceId) -> StoreResult<Option<Memcached>>;

    /// Write `obj.status` only. Fails with `Conflict` when `obj` is stale.
    async fn update_managed_status(&self, obj: &Memcached) -> StoreResult<Memcached>;

    async fn get_child(&self, id: &ResourceId) -> StoreResult<Option<Deployment>>;

    async fn create_child(&self, child: &Deployment) -> StoreResult<Deployment>;

    /// Replace the child. Fails with `Conflict` when `child` is stale.
    async fn update_child(&self, child: &Deployment) -> StoreResult<Deployment>;
}

#[async_trait::async_trait]
impl<S: ObjectStore + ?Sized> ObjectStore for Arc<S> {
    async fn get_managed(&self, id: &ResourceId) -> StoreResult<Option<Memcached>> { (**self).get_managed(id).await }

    async fn update_managed_status(&self, obj: &Memcached) -> StoreResult<Memcached> {
        (**self).update_managed_status(obj).await
    }

    async fn get_child(&self, id: &ResourceId) -> StoreResult<Option<Deployment>> { (**self).get_child(id).await }

    async fn create_child(&self, child: &Deployment) -> StoreResult<Deployment> { (**self).create_child(child).await }

    async fn update_child(&self, child: &Deployment) -> StoreResult<Deployment> { (**self).update_child(child).await }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_describes_status_subresource() {
        let crd = Memcached::crd();
        assert_eq!(crd.spec.group, "cache.tether.dev");
        assert_eq!(crd.spec.names.kind, "Memcached");
        let v = &crd.spec.versions[0];
        assert!(v.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }

    #[test]
    fn spec_uses_camel_case_and_omits_defaults() {
        let mc = Memcached::new("cache", MemcachedSpec { size: 3, container_port: Some(11311), image: None });
        let v = serde_json::to_value(&mc).unwrap();
        assert_eq!(v["spec"]["size"], 3);
        assert_eq!(v["spec"]["containerPort"], 11311);
        assert!(v["spec"].get("image").is_none());
        assert!(mc.conditions().is_empty());
    }
}
