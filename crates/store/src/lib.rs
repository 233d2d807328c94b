//! Tether store: in-memory `ObjectStore` with optimistic concurrency.
//!
//! Every write bumps a store-wide resourceVersion and stale writes fail with
//! `Conflict`, like the API server. Faults can be queued per operation so
//! callers can exercise their error paths without a cluster.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use k8s_openapi::api::apps::v1::Deployment;
use kube::{Resource, ResourceExt};
use rustc_hash::FxHashMap;
use tether_api::{Memcached, ObjectStore, StoreError, StoreResult};
use tether_core::ResourceId;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetManaged,
    UpdateStatus,
    GetChild,
    CreateChild,
    UpdateChild,
}

#[derive(Default)]
struct Inner {
    managed: FxHashMap<ResourceId, Memcached>,
    children: FxHashMap<ResourceId, Deployment>,
    rv: u64,
    faults: FxHashMap<StoreOp, VecDeque<StoreError>>,
    calls: FxHashMap<StoreOp, usize>,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    /// Count the call and pop a queued fault for it, if any.
    fn enter(&mut self, op: StoreOp) -> StoreResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => {
                debug!(?op, error = %err, "injected store fault");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

fn id_of<K: Resource>(obj: &K) -> ResourceId {
    ResourceId::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

fn stamp<K: Resource>(obj: &mut K, rv: String) {
    let meta = obj.meta_mut();
    if meta.uid.is_none() {
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
    }
    meta.resource_version = Some(rv);
}

fn check_fresh<K: Resource>(stored: &K, incoming: &K, id: &ResourceId) -> StoreResult<()> {
    if stored.resource_version() != incoming.resource_version() {
        return Err(StoreError::Conflict(format!(
            "{id}: object has been modified (have {:?}, stored {:?})",
            incoming.resource_version(),
            stored.resource_version()
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Out-of-band write of a managed resource's spec and metadata, as a user
    /// would apply it. An existing status is kept.
    pub fn put_managed(&self, mut obj: Memcached) -> Memcached {
        let mut inner = self.lock();
        let id = id_of(&obj);
        if let Some(prev) = inner.managed.get(&id) {
            obj.meta_mut().uid = prev.meta().uid.clone();
            obj.status = prev.status.clone();
        }
        let rv = inner.next_rv();
        stamp(&mut obj, rv);
        inner.managed.insert(id, obj.clone());
        obj
    }

    pub fn delete_managed(&self, id: &ResourceId) -> Option<Memcached> { self.lock().managed.remove(id) }

    /// Out-of-band write of a child, e.g. to simulate drift.
    pub fn put_child(&self, mut obj: Deployment) -> Deployment {
        let mut inner = self.lock();
        let id = id_of(&obj);
        let rv = inner.next_rv();
        stamp(&mut obj, rv);
        inner.children.insert(id, obj.clone());
        obj
    }

    pub fn managed(&self, id: &ResourceId) -> Option<Memcached> { self.lock().managed.get(id).cloned() }

    pub fn child(&self, id: &ResourceId) -> Option<Deployment> { self.lock().children.get(id).cloned() }

    pub fn child_count(&self) -> usize { self.lock().children.len() }

    /// Fail the next call of `op` with `err`. Faults queue up per operation.
    pub fn inject(&self, op: StoreOp, err: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self, op: StoreOp) -> usize { self.lock().calls.get(&op).copied().unwrap_or(0) }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get_managed(&self, id: &ResourceId) -> StoreResult<Option<Memcached>> {
        let mut inner = self.lock();
        inner.enter(StoreOp::GetManaged)?;
        Ok(inner.managed.get(id).cloned())
    }

    async fn update_managed_status(&self, obj: &Memcached) -> StoreResult<Memcached> {
        let mut inner = self.lock();
        inner.enter(StoreOp::UpdateStatus)?;
        let id = id_of(obj);
        let rv = inner.next_rv();
        let stored = inner.managed.get_mut(&id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        check_fresh(stored, obj, &id)?;
        stored.status = obj.status.clone();
        stamp(stored, rv);
        debug!(id = %id, "status updated");
        Ok(stored.clone())
    }

    async fn get_child(&self, id: &ResourceId) -> StoreResult<Option<Deployment>> {
        let mut inner = self.lock();
        inner.enter(StoreOp::GetChild)?;
        Ok(inner.children.get(id).cloned())
    }

    async fn create_child(&self, child: &Deployment) -> StoreResult<Deployment> {
        let mut inner = self.lock();
        inner.enter(StoreOp::CreateChild)?;
        if child.namespace().is_none() {
            return Err(StoreError::Invalid(format!("{}: namespace required", child.name_any())));
        }
        let id = id_of(child);
        if inner.children.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let mut obj = child.clone();
        obj.meta_mut().uid = None;
        let rv = inner.next_rv();
        stamp(&mut obj, rv);
        inner.children.insert(id.clone(), obj.clone());
        debug!(id = %id, "child created");
        Ok(obj)
    }

    async fn update_child(&self, child: &Deployment) -> StoreResult<Deployment> {
        let mut inner = self.lock();
        inner.enter(StoreOp::UpdateChild)?;
        let id = id_of(child);
        let rv = inner.next_rv();
        let stored = inner.children.get_mut(&id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        check_fresh(stored, child, &id)?;
        let uid = stored.meta().uid.clone();
        *stored = child.clone();
        stored.meta_mut().uid = uid;
        stamp(stored, rv);
        debug!(id = %id, "child updated");
        Ok(stored.clone())
    }
}
