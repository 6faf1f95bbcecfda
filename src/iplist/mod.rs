//! ACL lists: item model, range-aware list, and the per-scope registry.
//!
//! The node keeps one global list per [`ListType`] and one list per server
//! list id. Every list has its own lock, so lookups against the global
//! blacklist never wait on a server list being reloaded.

mod item;
mod list;

pub use item::{bytes_to_ip, ip_to_bytes, parse_ip_bytes, IpItem, ItemKind, ListType};
pub use list::IpList;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Where a lookup matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListScope {
    Global(ListType),
    Server(u64),
}

/// Verdict of [`ListManager::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Matched a whitelist; overrides any blacklist
    Allowed,
    /// Matched a blacklist
    Denied,
    /// No list matched
    Unlisted,
}

/// Registry of every ACL list on the node.
pub struct ListManager {
    global_white: Arc<IpList>,
    global_black: Arc<IpList>,
    global_grey: Arc<IpList>,
    lists: RwLock<HashMap<u64, Arc<IpList>>>,
    /// Server list id -> type, learned from incoming items
    list_types: RwLock<HashMap<u64, ListType>>,
}

impl ListManager {
    pub fn new() -> Self {
        Self {
            global_white: Arc::new(IpList::new(0)),
            global_black: Arc::new(IpList::new(0)),
            global_grey: Arc::new(IpList::new(0)),
            lists: RwLock::new(HashMap::new()),
            list_types: RwLock::new(HashMap::new()),
        }
    }

    /// The global list of a type.
    pub fn global(&self, list_type: ListType) -> Arc<IpList> {
        match list_type {
            ListType::White => Arc::clone(&self.global_white),
            ListType::Black => Arc::clone(&self.global_black),
            ListType::Grey => Arc::clone(&self.global_grey),
        }
    }

    pub fn find_list(&self, list_id: u64) -> Option<Arc<IpList>> {
        self.lists.read().get(&list_id).cloned()
    }

    /// The list an item belongs to, created on first use.
    pub fn list_for(&self, item: &IpItem) -> Arc<IpList> {
        if item.is_global || item.list_id == 0 {
            return self.global(item.list_type);
        }
        if let Some(list) = self.find_list(item.list_id) {
            return list;
        }
        self.list_types.write().insert(item.list_id, item.list_type);
        let mut lists = self.lists.write();
        Arc::clone(
            lists
                .entry(item.list_id)
                .or_insert_with(|| Arc::new(IpList::new(item.list_id))),
        )
    }

    pub fn add_item(&self, item: IpItem) {
        self.list_for(&item).add(item);
    }

    /// Bulk variant of [`ListManager::add_item`]; call [`ListManager::sort_all`] afterwards.
    pub fn add_item_delay(&self, item: IpItem) {
        self.list_for(&item).add_delay(item);
    }

    /// Remove an item from the list it was filed under.
    pub fn delete_item(&self, item: &IpItem) -> Option<Arc<IpItem>> {
        if item.is_global || item.list_id == 0 {
            return self.global(item.list_type).delete(item.id);
        }
        self.find_list(item.list_id)?.delete(item.id)
    }

    pub fn sort_all(&self) {
        self.global_white.sort();
        self.global_black.sort();
        self.global_grey.sort();
        for list in self.lists.read().values() {
            list.sort();
        }
    }

    /// Decide for `ip` against the global lists plus the given server lists.
    ///
    /// Whitelists win over blacklists; grey lists do not take part.
    pub fn check(&self, ip: IpAddr, server_list_ids: &[u64]) -> Verdict {
        let addr = ip_to_bytes(ip);
        let server_lists: Vec<(ListType, Arc<IpList>)> = {
            let lists = self.lists.read();
            let types = self.list_types.read();
            server_list_ids
                .iter()
                .filter_map(|id| {
                    let list = lists.get(id)?;
                    let list_type = types.get(id).copied().unwrap_or_default();
                    Some((list_type, Arc::clone(list)))
                })
                .collect()
        };

        let allowed = self.global_white.contains(&addr)
            || server_lists
                .iter()
                .any(|(t, list)| *t == ListType::White && list.contains(&addr));
        if allowed {
            return Verdict::Allowed;
        }

        let denied = self.global_black.contains(&addr)
            || server_lists
                .iter()
                .any(|(t, list)| *t == ListType::Black && list.contains(&addr));
        if denied {
            Verdict::Denied
        } else {
            Verdict::Unlisted
        }
    }

    /// Every list that currently matches `ip`.
    pub fn matching_lists(&self, ip: IpAddr) -> Vec<ListScope> {
        let addr = ip_to_bytes(ip);
        let mut scopes = Vec::new();
        for list_type in [ListType::White, ListType::Black, ListType::Grey] {
            if self.global(list_type).contains(&addr) {
                scopes.push(ListScope::Global(list_type));
            }
        }
        let mut server: Vec<u64> = self
            .lists
            .read()
            .iter()
            .filter(|(_, list)| list.contains(&addr))
            .map(|(id, _)| *id)
            .collect();
        server.sort_unstable();
        scopes.extend(server.into_iter().map(ListScope::Server));
        scopes
    }

    /// Total number of stored items across all lists.
    pub fn total_items(&self) -> usize {
        self.global_white.len()
            + self.global_black.len()
            + self.global_grey.len()
            + self.lists.read().values().map(|l| l.len()).sum::<usize>()
    }
}

impl Default for ListManager {
    fn default() -> Self {
        Self::new()
    }
}
