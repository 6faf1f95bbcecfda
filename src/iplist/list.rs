//! Range-aware ACL list with per-list locking.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use super::item::{ip_to_bytes, IpItem, ItemKind};
use crate::clock;

#[derive(Default)]
struct ListInner {
    /// Source of truth
    items: HashMap<u64, Arc<IpItem>>,
    /// Match-all items
    all_items: HashMap<u64, Arc<IpItem>>,
    /// Exact address -> ids of single items on that address
    singles: HashMap<Vec<u8>, Vec<u64>>,
    /// Range items ordered by (family width, lower bound)
    ranges: Vec<Arc<IpItem>>,
    sorted: bool,
}

impl ListInner {
    fn insert(&mut self, item: IpItem) {
        let id = item.id;
        self.remove(id);

        let item = Arc::new(item);
        if item.is_indexable() {
            match item.kind {
                ItemKind::All => {
                    self.all_items.insert(id, Arc::clone(&item));
                }
                ItemKind::Single => {
                    self.singles.entry(item.ip_from.clone()).or_default().push(id);
                }
                ItemKind::Range => {
                    self.ranges.push(Arc::clone(&item));
                    self.sorted = false;
                }
            }
        }
        self.items.insert(id, item);
    }

    fn remove(&mut self, id: u64) -> Option<Arc<IpItem>> {
        let old = self.items.remove(&id)?;
        match old.kind {
            ItemKind::All => {
                self.all_items.remove(&id);
            }
            ItemKind::Single => {
                if let Some(ids) = self.singles.get_mut(&old.ip_from) {
                    ids.retain(|existing| *existing != id);
                    if ids.is_empty() {
                        self.singles.remove(&old.ip_from);
                    }
                }
            }
            ItemKind::Range => {
                // Removal keeps the relative order intact
                self.ranges.retain(|item| item.id != id);
            }
        }
        Some(old)
    }

    fn sort(&mut self) {
        if !self.sorted {
            self.ranges
                .sort_by(|a, b| (a.ip_from.len(), &a.ip_from).cmp(&(b.ip_from.len(), &b.ip_from)));
            self.sorted = true;
        }
    }

    fn contains_at(&self, addr: &[u8], now: i64) -> bool {
        if self.all_items.values().any(|item| item.is_live_at(now)) {
            return true;
        }

        if let Some(ids) = self.singles.get(addr) {
            let hit = ids
                .iter()
                .filter_map(|id| self.items.get(id))
                .any(|item| item.is_live_at(now));
            if hit {
                return true;
            }
        }

        for item in &self.ranges {
            let width = item.ip_from.len();
            if width < addr.len() {
                continue;
            }
            if width > addr.len() || item.ip_from.as_slice() > addr {
                // Every later candidate starts even higher
                break;
            }
            if addr <= item.ip_to.as_slice() && item.is_live_at(now) {
                return true;
            }
        }

        false
    }
}

/// One ACL list (the global list of a type, or one server's list).
///
/// Each list owns its own readers-writer lock, so lookups on different lists
/// never contend.
pub struct IpList {
    id: u64,
    inner: RwLock<ListInner>,
}

impl IpList {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            inner: RwLock::new(ListInner {
                sorted: true,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert or wholesale replace the item with the same id.
    pub fn add(&self, item: IpItem) {
        let mut inner = self.inner.write();
        inner.insert(item);
        inner.sort();
    }

    /// Insert without re-sorting the range view.
    ///
    /// For bulk loads: call [`IpList::sort`] once after the last insert.
    pub fn add_delay(&self, item: IpItem) {
        self.inner.write().insert(item);
    }

    /// Rebuild the range ordering after [`IpList::add_delay`] calls.
    pub fn sort(&self) {
        self.inner.write().sort();
    }

    /// Remove an item; unknown ids are ignored.
    pub fn delete(&self, id: u64) -> Option<Arc<IpItem>> {
        self.inner.write().remove(id)
    }

    /// Whether a live item matches the raw address bytes.
    pub fn contains(&self, addr: &[u8]) -> bool {
        self.contains_at(addr, clock::unix_time())
    }

    /// Whether a live item matches `ip`.
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.contains(&ip_to_bytes(ip))
    }

    /// [`IpList::contains`] against an explicit unix time.
    pub fn contains_at(&self, addr: &[u8], now: i64) -> bool {
        {
            let inner = self.inner.read();
            if inner.sorted {
                return inner.contains_at(addr, now);
            }
        }
        // A bulk load forgot to sort; fix it up once under the write lock
        let mut inner = self.inner.write();
        inner.sort();
        inner.contains_at(addr, now)
    }

    pub fn get(&self, id: u64) -> Option<Arc<IpItem>> {
        self.inner.read().items.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }

    /// Snapshot of every stored item, expired ones included.
    pub fn items(&self) -> Vec<Arc<IpItem>> {
        self.inner.read().items.values().cloned().collect()
    }
}
