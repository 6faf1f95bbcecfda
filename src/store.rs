//! Local persistence of synchronized ACL items and the version cursor.
//!
//! The store is the "durably applied" record of the sync engine: a page of
//! deltas only advances the cursor once the store holding its items has been
//! written to disk. On restart the lists are rebuilt from it and polling
//! resumes from its cursor.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::iplist::{IpItem, ListManager};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreData {
    version: i64,
    updated_at: Option<DateTime<Utc>>,
    items: BTreeMap<u64, IpItem>,
}

/// On-disk item store.
pub struct ItemStore {
    path: PathBuf,
    data: StoreData,
}

impl ItemStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read item store: {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse item store: {:?}", path))?
        } else {
            StoreData::default()
        };
        Ok(Self { path, data })
    }

    /// Last fully applied control-plane version.
    pub fn version(&self) -> i64 {
        self.data.version
    }

    pub fn set_version(&mut self, version: i64) {
        if version > self.data.version {
            self.data.version = version;
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.data.updated_at
    }

    pub fn put(&mut self, item: IpItem) {
        self.data.items.insert(item.id, item);
    }

    pub fn remove(&mut self, id: u64) -> Option<IpItem> {
        self.data.items.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.data.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &IpItem> {
        self.data.items.values()
    }

    /// Remove every item expired at `now` and return them.
    ///
    /// This is the only path by which expiry deletes items; the in-memory
    /// lists merely stop matching expired entries.
    pub fn sweep_expired(&mut self, now: i64) -> Vec<IpItem> {
        let expired: Vec<u64> = self
            .data
            .items
            .values()
            .filter(|item| !item.is_live_at(now))
            .map(|item| item.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.data.items.remove(&id))
            .collect()
    }

    /// Load every stored item into `lists` with a single sort at the end.
    pub fn load_into(&self, lists: &ListManager) -> usize {
        for item in self.data.items.values() {
            lists.add_item_delay(item.clone());
        }
        lists.sort_all();
        self.data.items.len()
    }

    /// Write the store atomically (temp file in the same directory + rename).
    pub fn save(&mut self) -> Result<()> {
        self.data.updated_at = Some(Utc::now());
        let content = serde_json::to_string(&self.data).context("Failed to serialize item store")?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create store directory: {:?}", parent))?;

        let mut temp_file = NamedTempFile::new_in(parent)
            .context("Failed to create temporary file for item store")?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(&self.path)
            .with_context(|| format!("Failed to persist item store: {:?}", self.path))?;

        debug!(
            "Saved item store ({} items, version {})",
            self.data.items.len(),
            self.data.version
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iplist::ListType;

    fn item(id: u64, ip: &str) -> IpItem {
        IpItem::from_strings(id, "ipv4", ip, "").unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ItemStore::open(dir.path().join("items.json")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("items.json");

        let mut store = ItemStore::open(&path).unwrap();
        store.put(item(1, "10.0.0.1"));
        store.put(item(2, "10.0.0.2"));
        store.set_version(42);
        store.save().unwrap();

        let reopened = ItemStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.version(), 42);
        assert!(reopened.updated_at().is_some());
    }

    #[test]
    fn test_version_never_goes_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ItemStore::open(dir.path().join("items.json")).unwrap();
        store.set_version(10);
        store.set_version(3);
        assert_eq!(store.version(), 10);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        fs::write(&path, "{not json").unwrap();
        assert!(ItemStore::open(&path).is_err());
    }

    #[test]
    fn test_sweep_expired() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ItemStore::open(dir.path().join("items.json")).unwrap();
        store.put(item(1, "10.0.0.1").with_expires_at(100));
        store.put(item(2, "10.0.0.2"));
        store.put(item(3, "10.0.0.3").with_expires_at(500));

        let swept = store.sweep_expired(200);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_load_into_lists() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ItemStore::open(dir.path().join("items.json")).unwrap();
        store.put(
            IpItem::from_strings(1, "ipv4", "10.0.0.0", "10.0.0.255")
                .unwrap()
                .with_list(ListType::White, 0, true),
        );
        store.put(item(2, "1.1.1.1").with_list(ListType::Black, 8, false));

        let lists = ListManager::new();
        assert_eq!(store.load_into(&lists), 2);
        assert!(lists.global(ListType::White).contains_ip("10.0.0.9".parse().unwrap()));
        assert!(lists.find_list(8).unwrap().contains_ip("1.1.1.1".parse().unwrap()));
    }
}
