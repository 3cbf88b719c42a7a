//! Watch-fed LdapGroupBinding cache
//!
//! A single background task watches `LdapGroupBinding` resources across the
//! cluster and folds the events into a map keyed by name. Request handlers
//! read a snapshot; they never list against the API server. Serving must not
//! start before the first full list has been applied, so the cache exposes a
//! readiness barrier.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::LdapGroupBinding;

/// In-memory view of the cluster's LdapGroupBinding resources
///
/// One read-write lock guards the map. The watch task takes the write lock
/// for single-event updates and swaps in a freshly built map on re-list, so
/// readers never observe a partially applied list.
pub struct GroupBindingCache {
    store: RwLock<HashMap<String, LdapGroupBinding>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl GroupBindingCache {
    /// Create an empty, not-yet-synced cache
    pub fn new() -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            store: RwLock::new(HashMap::new()),
            ready_tx,
            ready_rx,
        })
    }

    /// Consistent copy of the current bindings, safe for concurrent callers
    pub async fn snapshot(&self) -> Vec<LdapGroupBinding> {
        self.store.read().await.values().cloned().collect()
    }

    /// Block until the initial list has been applied
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        // Only fails if the sender is dropped, and we own the sender.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Run the watch loop until cancelled
    ///
    /// Before the first sync a watch error ends the task so startup can
    /// fail instead of hanging on the readiness barrier. Once synced,
    /// errors are transient: the watcher re-lists with backoff and the next
    /// `Init` sequence replaces the cache wholesale, which also reconciles
    /// any events missed during the disconnect.
    pub async fn run(self: Arc<Self>, client: Client, cancel: CancellationToken) {
        let api: Api<LdapGroupBinding> = Api::all(client);
        let mut stream = watcher(api, watcher::Config::default()).boxed();
        let mut relist: HashMap<String, LdapGroupBinding> = HashMap::new();

        info!("starting LdapGroupBinding watch");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("LdapGroupBinding watch stopping");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(event, &mut relist).await,
                    Some(Err(e)) if *self.ready_rx.borrow() => {
                        warn!(error = %e, "LdapGroupBinding watch error, will re-list");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "LdapGroupBinding watch failed before initial sync");
                        return;
                    }
                    None => {
                        warn!("LdapGroupBinding watch stream ended");
                        return;
                    }
                },
            }
        }
    }

    /// Fold one watch event into the cache
    pub(crate) async fn apply(
        &self,
        event: Event<LdapGroupBinding>,
        relist: &mut HashMap<String, LdapGroupBinding>,
    ) {
        match event {
            Event::Init => {
                relist.clear();
            }
            Event::InitApply(binding) => {
                relist.insert(binding.name_any(), binding);
            }
            Event::InitDone => {
                let count = relist.len();
                {
                    let mut store = self.store.write().await;
                    *store = std::mem::take(relist);
                }
                self.ready_tx.send_replace(true);
                info!(count, "LdapGroupBinding cache synced");
            }
            Event::Apply(binding) => {
                let name = binding.name_any();
                let replaced = {
                    let mut store = self.store.write().await;
                    store.insert(name.clone(), binding)
                };
                if replaced.is_some() {
                    debug!(name = %name, "LdapGroupBinding updated in cache");
                } else {
                    debug!(name = %name, "LdapGroupBinding added to cache");
                }
            }
            Event::Delete(binding) => {
                let name = binding.name_any();
                self.store.write().await.remove(&name);
                debug!(name = %name, "LdapGroupBinding deleted from cache");
            }
        }
    }
}
