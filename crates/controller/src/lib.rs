//! Tether controller: drives a `Memcached` and its child `Deployment` toward
//! the declared replica count, reporting progress through the `Available`
//! condition.
//!
//! Every invocation re-derives desired state from the resource as currently
//! stored. Callers must not run two invocations for the same identity at once.

#![forbid(unsafe_code)]

use std::time::Instant;

use k8s_openapi::api::apps::v1::Deployment;
use metrics::{counter, histogram};
use tether_api::{
    Memcached, ObjectStore, StoreError, CONDITION_AVAILABLE, REASON_RECONCILED, REASON_RECONCILING, REASON_RESIZING,
};
use tether_core::{Condition, ConditionStatus, ReconcileOutcome, ResourceId};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub mod config;
pub mod status;
pub mod template;

pub use config::ControllerConfig;
pub use status::{write_condition, StatusWrite};
pub use template::{deployment_for, TemplateError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("template: {0}")]
    Template(#[from] TemplateError),
}

impl ReconcileError {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileError::Store(e) => e.label(),
            ReconcileError::Template(_) => "template",
        }
    }
}

pub struct Reconciler<S> {
    store: S,
    cfg: ControllerConfig,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: S, cfg: ControllerConfig) -> Self { Self { store, cfg } }

    pub fn config(&self) -> &ControllerConfig { &self.cfg }

    /// One reconcile pass for `id`.
    pub async fn reconcile(&self, id: &ResourceId) -> Result<ReconcileOutcome, ReconcileError> {
        let started = Instant::now();
        let res = self.run(id).instrument(info_span!("reconcile", id = %id)).await;
        let took_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("reconcile_ms", took_ms);
        match &res {
            Ok(outcome) => {
                counter!("reconcile_total", 1u64, "outcome" => outcome.label());
                debug!(id = %id, outcome = outcome.label(), took_ms, "reconcile done");
            }
            Err(e) => {
                counter!("reconcile_total", 1u64, "outcome" => "error");
                counter!("reconcile_errors_total", 1u64, "kind" => e.label());
                warn!(id = %id, error = %e, took_ms, "reconcile failed");
            }
        }
        res
    }

    async fn run(&self, id: &ResourceId) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(mut mc) = self.store.get_managed(id).await? else {
            debug!("resource not found; nothing to do");
            return Ok(ReconcileOutcome::Converged);
        };

        if mc.conditions().is_empty() {
            let starting = available(ConditionStatus::Unknown, REASON_RECONCILING, "starting reconciliation");
            if let StatusWrite::Gone = self.write(mc, &starting).await? {
                return Ok(ReconcileOutcome::Converged);
            }
            match self.store.get_managed(id).await? {
                Some(fresh) => mc = fresh,
                None => return Ok(ReconcileOutcome::Converged),
            }
        }

        let Some(child) = self.store.get_child(id).await? else {
            return self.create_child(mc).await;
        };

        let desired = match template::desired_replicas(&mc) {
            Ok(n) => n,
            Err(e) => {
                self.report(mc, available(ConditionStatus::False, REASON_RECONCILING, e.to_string())).await;
                return Err(e.into());
            }
        };
        let current = child.spec.as_ref().and_then(|s| s.replicas);
        if current != Some(desired) {
            return self.resize(id, child, desired).await;
        }

        let done = available(
            ConditionStatus::True,
            REASON_RECONCILED,
            "deployment available with desired replica count",
        );
        self.write(mc, &done).await?;
        Ok(ReconcileOutcome::Converged)
    }

    async fn create_child(&self, mc: Memcached) -> Result<ReconcileOutcome, ReconcileError> {
        let deploy = match deployment_for(&mc, &self.cfg) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "cannot build deployment");
                self.report(mc, available(ConditionStatus::False, REASON_RECONCILING, e.to_string())).await;
                return Err(e.into());
            }
        };
        info!(replicas = mc.spec.size, "creating deployment");
        match self.store.create_child(&deploy).await {
            Ok(_) => Ok(ReconcileOutcome::RequeueAfter(self.cfg.create_requeue)),
            Err(StoreError::AlreadyExists(_)) => {
                debug!("deployment created concurrently; re-checking");
                Ok(ReconcileOutcome::RequeueImmediate)
            }
            Err(e) => {
                error!(error = %e, "failed to create deployment");
                let msg = format!("failed to create deployment: {e}");
                self.report(mc, available(ConditionStatus::False, REASON_RECONCILING, msg)).await;
                Err(e.into())
            }
        }
    }

    async fn resize(
        &self,
        id: &ResourceId,
        mut child: Deployment,
        desired: i32,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut attempt = 0;
        let err = loop {
            let from = child.spec.as_ref().and_then(|s| s.replicas);
            child.spec.get_or_insert_with(Default::default).replicas = Some(desired);
            match self.store.update_child(&child).await {
                Ok(_) => {
                    info!(from = ?from, to = desired, "deployment resized");
                    return Ok(ReconcileOutcome::RequeueImmediate);
                }
                Err(e) if e.is_conflict() && attempt < self.cfg.conflict_retries => {
                    attempt += 1;
                    debug!(attempt, "deployment update conflicted; re-reading");
                    match self.store.get_child(id).await {
                        Ok(Some(fresh)) => child = fresh,
                        Ok(None) => return Ok(ReconcileOutcome::RequeueImmediate),
                        Err(e) => break e,
                    }
                }
                Err(e) => break e,
            }
        };

        error!(error = %err, "failed to resize deployment");
        match self.store.get_managed(id).await {
            Ok(Some(mc)) => {
                let msg = format!("failed to update deployment replicas: {err}");
                self.report(mc, available(ConditionStatus::False, REASON_RESIZING, msg)).await;
            }
            Ok(None) => debug!("resource vanished while resizing"),
            Err(fetch) => error!(error = %fetch, cause = %err, "failed to re-read resource after resize failure"),
        }
        Err(err.into())
    }

    async fn write(&self, mc: Memcached, cond: &Condition) -> Result<StatusWrite, StoreError> {
        write_condition(&self.store, mc, cond, self.cfg.conflict_retries).await
    }

    /// Status write on a failure path; its own error is logged, never returned.
    async fn report(&self, mc: Memcached, cond: Condition) {
        if let Err(e) = self.write(mc, &cond).await {
            error!(error = %e, cause = %cond.message, "failed to record failure in status");
        }
    }
}

fn available(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Condition {
    Condition::new(CONDITION_AVAILABLE, status, reason, message)
}
