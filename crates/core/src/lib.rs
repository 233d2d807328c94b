//! Tether core types: resource identity, reconcile outcomes and watch events.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod backoff;
pub mod conditions;
pub mod watch;

pub use backoff::Backoff;
pub use conditions::{find_condition, is_condition_true, set_condition, Condition, ConditionStatus};
pub use watch::{Change, ChangeKind, ResourceVersion, WatchEvent, WatchFault};

/// Identity of a namespaced object. Children share the identity of their owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource id {0:?} (expect namespace/name)")]
pub struct ParseIdError(String);

impl FromStr for ResourceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(Self::new(ns, name)),
            _ => Err(ParseIdError(s.to_string())),
        }
    }
}

/// What the scheduler should do after one reconcile invocation.
///
/// Fatal failures are carried by the `Err` arm of the reconcile result rather
/// than by a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Observed state matches desired state; wait for the next change.
    Converged,
    /// Check again after the given delay.
    RequeueAfter(Duration),
    /// Check again without delay.
    RequeueImmediate,
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Converged => "converged",
            ReconcileOutcome::RequeueAfter(_) => "requeue_after",
            ReconcileOutcome::RequeueImmediate => "requeue_immediate",
        }
    }
}
