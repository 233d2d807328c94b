use std::fmt::Debug;

use futures::StreamExt;
use kube::api::{Api, WatchParams};
use kube::core::WatchEvent as KubeEvent;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tether_core::{ResourceVersion, WatchEvent, WatchFault};
use tether_watch::{EventStream, Subscription, WatchError};
use tracing::debug;

/// Server-side timeout for one watch request; the resilient client reopens
/// from its cursor when it lapses.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Raw API server watch for `K`, opened at a resourceVersion.
pub struct KubeSubscription<K> {
    api: Api<K>,
    params: WatchParams,
}

impl<K> KubeSubscription<K> {
    pub fn new(api: Api<K>) -> Self { Self { api, params: WatchParams::default().timeout(WATCH_TIMEOUT_SECS) } }
}

/// Translate one kube watch item into the resilient client's event type.
pub fn convert_event<K: Resource>(item: Result<KubeEvent<K>, kube::Error>) -> Result<WatchEvent<K>, WatchError> {
    let version = |o: &K| ResourceVersion::new(o.resource_version().unwrap_or_default());
    match item {
        Ok(KubeEvent::Added(o)) => Ok(WatchEvent::Added { version: version(&o), object: o }),
        Ok(KubeEvent::Modified(o)) => Ok(WatchEvent::Modified { version: version(&o), object: o }),
        Ok(KubeEvent::Deleted(o)) => Ok(WatchEvent::Deleted { version: version(&o), object: o }),
        Ok(KubeEvent::Bookmark(b)) => Ok(WatchEvent::Bookmark { version: ResourceVersion::new(b.metadata.resource_version) }),
        Ok(KubeEvent::Error(e)) => Ok(WatchEvent::Error(WatchFault { code: Some(e.code), message: e.message })),
        Err(e) => Err(WatchError::Transport(e.to_string())),
    }
}

#[async_trait::async_trait]
impl<K> Subscription<K> for KubeSubscription<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn open(&mut self, from: Option<ResourceVersion>) -> Result<EventStream<K>, WatchError> {
        // "0" asks the server to start from its current state.
        let version = from.as_ref().map(|v| v.as_str().to_string()).unwrap_or_else(|| "0".to_string());
        debug!(version = %version, "opening api watch");
        match self.api.watch(&self.params, &version).await {
            Ok(stream) => Ok(stream.map(convert_event).boxed()),
            Err(e) => Err(WatchError::Open { from, message: e.to_string() }),
        }
    }
}
