use metrics::counter;
use tether_api::{Memcached, ObjectStore, StoreError, StoreResult};
use tether_core::{set_condition, Condition};
use tracing::debug;

/// Result of a conditional status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Written,
    /// The condition was already in place; nothing was sent.
    Unchanged,
    /// The resource disappeared.
    Gone,
}

/// Apply `cond` to `mc` and persist its status, re-reading on conflict up to
/// `retries` times.
pub async fn write_condition<S: ObjectStore + ?Sized>(
    store: &S,
    mut mc: Memcached,
    cond: &Condition,
    retries: u32,
) -> StoreResult<StatusWrite> {
    let id = mc.id();
    let mut attempt = 0;
    loop {
        let mut status = mc.status.clone().unwrap_or_default();
        if !set_condition(&mut status.conditions, cond.clone()) {
            return Ok(StatusWrite::Unchanged);
        }
        mc.status = Some(status);
        match store.update_managed_status(&mc).await {
            Ok(_) => {
                debug!(id = %id, condition = %cond.type_, status = %cond.status, reason = %cond.reason, "status written");
                return Ok(StatusWrite::Written);
            }
            Err(StoreError::NotFound(_)) => return Ok(StatusWrite::Gone),
            Err(e) if e.is_conflict() && attempt < retries => {
                attempt += 1;
                counter!("reconcile_status_conflicts_total", 1u64);
                debug!(id = %id, attempt, "status write conflicted; re-reading");
                match store.get_managed(&id).await? {
                    Some(fresh) => mc = fresh,
                    None => return Ok(StatusWrite::Gone),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;
    use tether_api::MemcachedSpec;
    use tether_core::ConditionStatus;
    use tether_store::{MemStore, StoreOp};

    fn stored(store: &MemStore) -> Memcached {
        let mut mc = Memcached::new("cache", MemcachedSpec { size: 1, ..Default::default() });
        mc.meta_mut().namespace = Some("default".into());
        store.put_managed(mc)
    }

    fn ready() -> Condition { Condition::new("Available", ConditionStatus::True, "Reconciled", "ok") }

    #[tokio::test]
    async fn repeated_condition_is_not_rewritten() {
        let store = MemStore::new();
        let mc = stored(&store);
        assert_eq!(write_condition(&store, mc, &ready(), 3).await.unwrap(), StatusWrite::Written);
        let fresh = store.managed(&mc_id()).unwrap();
        assert_eq!(write_condition(&store, fresh, &ready(), 3).await.unwrap(), StatusWrite::Unchanged);
        assert_eq!(store.calls(StoreOp::UpdateStatus), 1);
    }

    #[tokio::test]
    async fn deleted_resource_reports_gone() {
        let store = MemStore::new();
        let mc = stored(&store);
        store.delete_managed(&mc_id());
        assert_eq!(write_condition(&store, mc, &ready(), 3).await.unwrap(), StatusWrite::Gone);
    }

    #[tokio::test]
    async fn conflicts_past_the_bound_are_returned() {
        let store = MemStore::new();
        let mc = stored(&store);
        for _ in 0..3 {
            store.inject(StoreOp::UpdateStatus, StoreError::Conflict("stale".into()));
        }
        let err = write_condition(&store, mc, &ready(), 2).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.calls(StoreOp::UpdateStatus), 3);
    }

    fn mc_id() -> tether_core::ResourceId { tether_core::ResourceId::new("default", "cache") }
}
