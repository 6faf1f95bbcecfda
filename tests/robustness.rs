//! Robustness tests for edge cases and error conditions.
//!
//! These tests verify that edgeacl handles malformed input and concurrent
//! use gracefully.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use edgeacl::cidr::{count_ips, decompose, range_to_cidrs};
use edgeacl::config::Config;
use edgeacl::control_plane::ItemDelta;
use edgeacl::ddos::tag::{decode, RuleTag};
use edgeacl::iplist::{IpItem, IpList, ListManager, ListType, Verdict};
use edgeacl::store::ItemStore;

/// Test range decomposition at the edges of the address space
#[test]
fn test_cidr_address_space_edges() {
    let all = range_to_cidrs(0, u32::MAX);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].to_string(), "0.0.0.0/0");

    let top = range_to_cidrs(u32::MAX, u32::MAX);
    assert_eq!(top[0].to_string(), "255.255.255.255/32");

    // Worst case stays bounded: at most 62 blocks for any IPv4 interval
    assert_eq!(range_to_cidrs(1, u32::MAX - 1).len(), 62);
    assert!(range_to_cidrs(10, 9).is_empty());
}

/// Test that mixed families never decompose
#[test]
fn test_mixed_family_decomposition() {
    let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let v6: IpAddr = "2001:db8::1".parse().unwrap();
    assert!(decompose(v4, v6).is_empty());
    assert!(decompose(v6, v4).is_empty());
    assert_eq!(count_ips(&decompose(v6, v6)), 1);
}

/// Test that lookups across families never match
#[test]
fn test_family_isolation() {
    let list = IpList::new(1);
    list.add(IpItem::from_strings(1, "ipv4", "0.0.0.0", "255.255.255.255").unwrap());
    assert!(list.contains_ip("8.8.8.8".parse().unwrap()));
    assert!(!list.contains_ip("::".parse().unwrap()));
    assert!(!list.contains_ip("2001:db8::8".parse().unwrap()));
    // IPv4-mapped notation folds to the IPv4 address
    assert!(list.contains_ip("::ffff:8.8.8.8".parse().unwrap()));
}

/// Test empty, whitespace and garbage addresses
#[test]
fn test_malformed_item_addresses() {
    for bad in ["300.0.0.1", "1.2.3", "hello", "1.2.3.4/24", "::g"] {
        assert!(
            IpItem::from_strings(1, "ipv4", bad, "").is_err(),
            "accepted {:?}",
            bad
        );
    }
    // Mixed families in one range
    assert!(IpItem::from_strings(1, "ipv4", "10.0.0.1", "2001:db8::1").is_err());
}

/// Test that malformed control-plane JSON is rejected, not panicking
#[test]
fn test_json_malformed_deltas() {
    let inputs = [
        "",
        "{",
        "[]",
        r#"{"id": "x", "version": 1}"#,
        r#"{"id": 1}"#,
        r#"{"id": -1, "version": 1}"#,
    ];
    for input in inputs {
        assert!(
            serde_json::from_str::<ItemDelta>(input).is_err(),
            "accepted {:?}",
            input
        );
    }
}

/// Test that YAML parsing handles malformed input
#[test]
fn test_yaml_malformed_input() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");

    for content in [
        "control_plane: [not, a, map]",
        "sync:\n  interval_secs: -5",
        "ddos:\n  tcp:\n    ports: [70000]",
    ] {
        std::fs::write(&path, content).unwrap();
        assert!(Config::load(&path).is_err(), "accepted {:?}", content);
    }

    assert!(Config::load(dir.path().join("missing.yaml")).is_err());
}

/// Test that a corrupted store is reported instead of silently reset
#[test]
fn test_corrupted_store_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.json");
    std::fs::write(&path, b"{\"version\": 3, \"items\": ").unwrap();
    assert!(ItemStore::open(&path).is_err());

    // A missing file is an empty store
    let empty = ItemStore::open(dir.path().join("none.json")).unwrap();
    assert_eq!(empty.version(), 0);
    assert!(empty.is_empty());
}

/// Test that the store writes into missing directories
#[test]
fn test_store_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a").join("b").join("items.json");
    let mut store = ItemStore::open(&path).unwrap();
    store.put(IpItem::from_strings(1, "ipv4", "10.0.0.1", "").unwrap());
    store.set_version(9);
    store.save().unwrap();

    let reopened = ItemStore::open(&path).unwrap();
    assert_eq!(reopened.version(), 9);
    assert_eq!(reopened.len(), 1);
}

/// Test that arbitrary rule comments never parse as owned rules
#[test]
fn test_foreign_rule_comments() {
    for comment in ["", "ZZ", "ZZZZ", "ZZ1ZZ", "ZZ1_ratemin_80ZZ", "ZZ1_ratemin_x_1_1ZZ", "🔥ZZ1_🔥ZZ"] {
        assert!(RuleTag::from_comment(comment).is_none(), "parsed {:?}", comment);
    }
    assert_eq!(decode("🔥ZZ1_🔥ZZ"), vec!["🔥"]);
}

/// Test concurrent lookups while the list is being mutated
#[tokio::test]
async fn test_concurrent_operations() {
    let lists = Arc::new(ListManager::new());
    let mut handles = Vec::new();

    for writer in 0..4u64 {
        let lists = Arc::clone(&lists);
        handles.push(tokio::spawn(async move {
            for i in 0..250u64 {
                let id = writer * 1000 + i;
                let from = Ipv4Addr::from(0x0A00_0000u32 + (id as u32) * 16);
                let to = Ipv4Addr::from(u32::from(from) + 15);
                let item = IpItem::from_strings(id, "ipv4", &from.to_string(), &to.to_string())
                    .unwrap()
                    .with_list(ListType::Black, 0, true);
                lists.add_item(item.clone());
                if i % 2 == 0 {
                    lists.delete_item(&item);
                }
            }
        }));
    }
    for _ in 0..4 {
        let lists = Arc::clone(&lists);
        handles.push(tokio::spawn(async move {
            for i in 0..1000u32 {
                let _ = lists.check(IpAddr::V4(Ipv4Addr::from(0x0A00_0000u32 + i * 7)), &[]);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(lists.total_items(), 4 * 125);
    // Odd ids survive, even ids were deleted
    let kept = IpAddr::V4(Ipv4Addr::from(0x0A00_0000u32 + 16 + 3));
    let gone = IpAddr::V4(Ipv4Addr::from(0x0A00_0000u32 + 3));
    assert_eq!(lists.check(kept, &[]), Verdict::Denied);
    assert_eq!(lists.check(gone, &[]), Verdict::Unlisted);
}
