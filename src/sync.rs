//! List sync engine.
//!
//! Polls the control plane by version cursor, applies delta pages to the
//! in-memory lists and the local store, and forwards every membership change
//! to the [`ActionManager`].

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock;
use crate::control_plane::{ControlPlane, ItemDelta};
use crate::enforcer::{ActionManager, UpdateReport};
use crate::iplist::{IpItem, ListManager};
use crate::signal::ShutdownToken;
use crate::store::ItemStore;

/// What one sync pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub actions: UpdateReport,
    pub pages: usize,
    pub added: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub expired: usize,
    pub version: i64,
}

pub struct ListSyncEngine {
    control_plane: Arc<dyn ControlPlane>,
    lists: Arc<ListManager>,
    actions: Arc<ActionManager>,
    store: Mutex<ItemStore>,
    page_size: u32,
    interval: Duration,
    wake: Notify,
    in_progress: AtomicBool,
}

impl ListSyncEngine {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        lists: Arc<ListManager>,
        actions: Arc<ActionManager>,
        store: ItemStore,
        page_size: u32,
        interval: Duration,
    ) -> Self {
        Self {
            control_plane,
            lists,
            actions,
            store: Mutex::new(store),
            page_size: page_size.max(1),
            interval,
            wake: Notify::new(),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Rebuild the lists from the local store. Backends are not replayed.
    pub async fn load(&self) -> usize {
        let store = self.store.lock().await;
        let count = store.load_into(&self.lists);
        info!(
            "Loaded {} item(s) from local store (version {})",
            count,
            store.version()
        );
        count
    }

    pub async fn version(&self) -> i64 {
        self.store.lock().await.version()
    }

    pub fn lists(&self) -> &Arc<ListManager> {
        &self.lists
    }

    /// Request a sync pass as soon as possible.
    ///
    /// Wake-ups arriving while a pass is pending collapse into one.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Sync on every interval tick and on [`ListSyncEngine::trigger`] until
    /// `shutdown` is cancelled.
    pub async fn run(&self, shutdown: ShutdownToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            match self.sync_once().await {
                Ok(Some(report)) if report.added + report.deleted + report.expired > 0 => {
                    info!(
                        "Sync: +{} -{} expired {} skipped {} (version {})",
                        report.added, report.deleted, report.expired, report.skipped, report.version
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Sync failed, retrying next tick: {:#}", e),
            }
        }
        debug!("Sync loop stopped");
    }

    /// One full pass: backends, then item pages until caught up, then the
    /// expiry sweep.
    ///
    /// Returns `None` if another pass is already running.
    pub async fn sync_once(&self) -> Result<Option<SyncReport>> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            debug!("Sync already in progress, skipping");
            return Ok(None);
        }
        let result = self.sync_pass().await;
        self.in_progress.store(false, Ordering::Release);
        result.map(Some)
    }

    async fn sync_pass(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        // Backends first so this pass's items reach new backends.
        match self.control_plane.fetch_actions().await {
            Ok(descriptors) => report.actions = self.actions.update_actions(&descriptors).await,
            Err(e) => warn!("Failed to fetch actions, keeping current backends: {:#}", e),
        }

        let mut store = self.store.lock().await;
        loop {
            let cursor = store.version();
            let mut page = self
                .control_plane
                .fetch_items(cursor, self.page_size)
                .await
                .with_context(|| format!("Failed to fetch items after version {}", cursor))?;
            if page.is_empty() {
                break;
            }
            let full_page = page.len() >= self.page_size as usize;

            // Stable: equal keys keep control-plane order.
            page.sort_by_key(|delta| (delta.version, !delta.is_deleted));
            let next = page.last().map(|d| d.version).unwrap_or(cursor);

            for delta in &page {
                self.apply_delta(&mut store, delta, &mut report).await;
            }
            self.lists.sort_all();

            store.save().context("Failed to persist item store")?;
            store.set_version(next);
            store.save().context("Failed to persist version cursor")?;
            report.pages += 1;

            if next <= cursor {
                warn!(
                    "Control plane returned no version past {}, stopping this pass",
                    cursor
                );
                break;
            }
            if !full_page {
                break;
            }
        }

        report.expired = self.sweep(&mut store).await?;
        report.version = store.version();
        Ok(report)
    }

    async fn apply_delta(&self, store: &mut ItemStore, delta: &ItemDelta, report: &mut SyncReport) {
        if delta.is_deleted {
            if let Some(previous) = store.remove(delta.id) {
                self.retract(&previous).await;
                report.deleted += 1;
            }
            return;
        }

        let item = match delta.to_item() {
            Ok(item) => item,
            Err(e) => {
                debug!("Skipping item #{}: {}", delta.id, e);
                report.skipped += 1;
                return;
            }
        };

        if let Some(previous) = store.remove(item.id) {
            // Re-sent unchanged at a newer version: nothing to enforce.
            let unchanged = IpItem {
                version: previous.version,
                ..item.clone()
            } == previous;
            if unchanged {
                store.put(item);
                return;
            }
            self.retract(&previous).await;
        }
        self.lists.add_item_delay(item.clone());
        self.actions.add_item(item.list_type, &item).await;
        store.put(item);
        report.added += 1;
    }

    async fn retract(&self, item: &IpItem) {
        self.lists.delete_item(item);
        self.actions.delete_item(item.list_type, item).await;
    }

    /// Delete expired items from the store, the lists and the backends.
    async fn sweep(&self, store: &mut ItemStore) -> Result<usize> {
        let expired = store.sweep_expired(clock::unix_time());
        if expired.is_empty() {
            return Ok(0);
        }
        for item in &expired {
            debug!("Item #{} expired", item.id);
            self.retract(item).await;
        }
        store.save().context("Failed to persist item store")?;
        Ok(expired.len())
    }
}
