use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Client;
use metrics::counter;
use rustc_hash::FxHashMap;
use tether_api::Memcached;
use tether_controller::{ReconcileError, Reconciler};
use tether_core::{Backoff, ReconcileOutcome, ResourceId};
use tracing::{debug, info, warn};

use crate::{scoped_api, KubeStore};

pub fn action_for(outcome: ReconcileOutcome) -> Action {
    match outcome {
        ReconcileOutcome::Converged => Action::await_change(),
        ReconcileOutcome::RequeueAfter(d) => Action::requeue(d),
        ReconcileOutcome::RequeueImmediate => Action::requeue(Duration::ZERO),
    }
}

/// Per-object exponential retry delays, reset after a successful pass.
struct ErrorBackoff {
    initial: Duration,
    max: Duration,
    by_id: Mutex<FxHashMap<ResourceId, Backoff>>,
}

impl ErrorBackoff {
    fn new(initial: Duration, max: Duration) -> Self { Self { initial, max, by_id: Mutex::new(FxHashMap::default()) } }

    fn next_delay(&self, id: &ResourceId) -> Duration {
        let mut map = self.by_id.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(id.clone()).or_insert_with(|| Backoff::new(self.initial, self.max)).next_delay()
    }

    fn reset(&self, id: &ResourceId) { self.by_id.lock().unwrap_or_else(PoisonError::into_inner).remove(id); }
}

struct Ctx {
    reconciler: Reconciler<KubeStore>,
    backoff: ErrorBackoff,
}

async fn reconcile(obj: Arc<Memcached>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let id = obj.id();
    let outcome = ctx.reconciler.reconcile(&id).await?;
    ctx.backoff.reset(&id);
    Ok(action_for(outcome))
}

fn error_policy(obj: Arc<Memcached>, err: &ReconcileError, ctx: Arc<Ctx>) -> Action {
    let id = obj.id();
    let delay = ctx.backoff.next_delay(&id);
    counter!("controller_error_requeues_total", 1u64, "kind" => err.label());
    warn!(id = %id, error = %err, delay_ms = %delay.as_millis(), "reconcile error; backing off");
    Action::requeue(delay)
}

/// Run the `Memcached` controller until a shutdown signal. Changes to owned
/// `Deployment`s trigger their owner's reconcile.
pub async fn run_controller(client: Client, reconciler: Reconciler<KubeStore>, namespace: Option<&str>) -> Result<()> {
    let cfg = reconciler.config().clone();
    let ctx = Arc::new(Ctx {
        reconciler,
        backoff: ErrorBackoff::new(cfg.error_backoff_initial, cfg.error_backoff_max),
    });
    let managed = scoped_api::<Memcached>(client.clone(), namespace);
    let children = scoped_api::<Deployment>(client, namespace);

    info!(ns = ?namespace, "controller starting");
    Controller::new(managed, watcher::Config::default())
        .owns(children, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(name = %obj.name, ns = ?obj.namespace, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller event"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_scheduler_actions() {
        assert_eq!(action_for(ReconcileOutcome::Converged), Action::await_change());
        let d = Duration::from_secs(60);
        assert_eq!(action_for(ReconcileOutcome::RequeueAfter(d)), Action::requeue(d));
        assert_eq!(action_for(ReconcileOutcome::RequeueImmediate), Action::requeue(Duration::ZERO));
    }

    #[test]
    fn error_backoff_grows_per_object_and_resets() {
        let b = ErrorBackoff::new(Duration::from_secs(1), Duration::from_secs(4));
        let a = ResourceId::new("default", "a");
        let other = ResourceId::new("default", "b");
        let delays: Vec<_> = (0..4).map(|_| b.next_delay(&a)).collect();
        assert_eq!(delays, [1, 2, 4, 4].map(Duration::from_secs));
        assert_eq!(b.next_delay(&other), Duration::from_secs(1));
        b.reset(&a);
        assert_eq!(b.next_delay(&a), Duration::from_secs(1));
    }
}
