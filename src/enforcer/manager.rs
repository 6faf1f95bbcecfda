//! Owns the live backend instances and fans list changes out to them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{Action, ActionDescriptor, ActionRegistry, BlockPage};
use crate::iplist::{IpItem, ListType};

/// Outcome of one [`ActionManager::update_actions`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub created: usize,
    pub closed: usize,
    pub unchanged: usize,
    /// Descriptor ids rejected with a fatal error
    pub rejected: Vec<i64>,
}

impl UpdateReport {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.closed == 0 && self.rejected.is_empty()
    }
}

struct Registered {
    canonical: String,
    event_level: String,
    /// `None` when construction failed fatally for this descriptor version
    instance: Option<Arc<dyn Action>>,
}

#[derive(Default)]
struct Inner {
    by_id: BTreeMap<i64, Registered>,
    by_level: HashMap<String, Vec<Arc<dyn Action>>>,
}

impl Inner {
    fn rebuild_levels(&mut self) {
        self.by_level.clear();
        for registered in self.by_id.values() {
            if let Some(instance) = &registered.instance {
                self.by_level
                    .entry(registered.event_level.clone())
                    .or_default()
                    .push(Arc::clone(instance));
            }
        }
    }
}

pub struct ActionManager {
    registry: ActionRegistry,
    inner: Mutex<Inner>,
}

impl ActionManager {
    pub fn new(registry: ActionRegistry) -> Self {
        Self {
            registry,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Reconcile live instances with `descriptors`.
    ///
    /// Removed ids are closed, changed ones are closed and rebuilt, new ones
    /// are built. Unchanged descriptors keep their instance.
    pub async fn update_actions(&self, descriptors: &[ActionDescriptor]) -> UpdateReport {
        let mut report = UpdateReport::default();
        let mut inner = self.inner.lock().await;

        let wanted: BTreeMap<i64, &ActionDescriptor> =
            descriptors.iter().map(|d| (d.id, d)).collect();

        let removed: Vec<i64> = inner
            .by_id
            .keys()
            .filter(|id| !wanted.contains_key(id))
            .copied()
            .collect();
        for id in removed {
            if let Some(old) = inner.by_id.remove(&id) {
                if close_instance(id, old.instance).await {
                    report.closed += 1;
                }
            }
        }

        for (id, descriptor) in wanted {
            let canonical = descriptor.canonical();
            if let Some(existing) = inner.by_id.get(&id) {
                if existing.canonical == canonical {
                    report.unchanged += 1;
                    continue;
                }
            }
            if let Some(old) = inner.by_id.remove(&id) {
                debug!("Action #{} changed, rebuilding", id);
                if close_instance(id, old.instance).await {
                    report.closed += 1;
                }
            }

            let instance = match self.registry.build(descriptor).await {
                Ok((instance, warning)) => {
                    if let Some(e) = warning {
                        warn!(
                            "Action #{} ({}) registered with error: {:#}",
                            id, descriptor.action_type, e
                        );
                    }
                    report.created += 1;
                    Some(Arc::from(instance))
                }
                Err(e) => {
                    error!("Action #{} rejected: {}", id, e);
                    report.rejected.push(id);
                    None
                }
            };
            inner.by_id.insert(
                id,
                Registered {
                    canonical,
                    event_level: descriptor.event_level.clone(),
                    instance,
                },
            );
        }

        inner.rebuild_levels();
        if !report.is_noop() {
            info!(
                "Actions updated: {} created, {} closed, {} rejected, {} unchanged",
                report.created,
                report.closed,
                report.rejected.len(),
                report.unchanged
            );
        }
        report
    }

    async fn targets(&self, event_level: &str) -> Vec<Arc<dyn Action>> {
        self.inner
            .lock()
            .await
            .by_level
            .get(event_level)
            .cloned()
            .unwrap_or_default()
    }

    /// Forward an added item to every backend of its event level.
    pub async fn add_item(&self, list_type: ListType, item: &IpItem) {
        for action in self.targets(&item.event_level).await {
            if let Err(e) = action.add_item(list_type, item).await {
                warn!(
                    "{} failed to add item #{}: {:#}",
                    action.type_id(),
                    item.id,
                    e
                );
            }
        }
    }

    /// Forward a removed item to every backend of its event level.
    pub async fn delete_item(&self, list_type: ListType, item: &IpItem) {
        for action in self.targets(&item.event_level).await {
            if let Err(e) = action.delete_item(list_type, item).await {
                warn!(
                    "{} failed to delete item #{}: {:#}",
                    action.type_id(),
                    item.id,
                    e
                );
            }
        }
    }

    /// Block page configured for `event_level`, if any.
    pub async fn block_page(&self, event_level: &str) -> Option<BlockPage> {
        self.targets(event_level)
            .await
            .iter()
            .find_map(|action| action.block_page())
    }

    /// Number of live instances.
    pub async fn len(&self) -> usize {
        self.inner
            .lock()
            .await
            .by_id
            .values()
            .filter(|r| r.instance.is_some())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and drop every instance.
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        let all = std::mem::take(&mut inner.by_id);
        inner.by_level.clear();
        for (id, registered) in all {
            close_instance(id, registered.instance).await;
        }
    }
}

/// Close an instance if there is one. Returns whether anything was closed.
async fn close_instance(id: i64, instance: Option<Arc<dyn Action>>) -> bool {
    let Some(instance) = instance else {
        return false;
    };
    if let Err(e) = instance.close().await {
        warn!("Failed to close action #{}: {:#}", id, e);
    }
    true
}
