//! Check command implementation.

use anyhow::Result;
use std::net::IpAddr;
use std::path::Path;

use crate::config::Config;
use crate::iplist::{ListManager, ListScope, Verdict};
use crate::store::ItemStore;

/// Run the check command against the local item store
pub async fn run(ip_str: &str, config_path: &Path) -> Result<()> {
    let ip: IpAddr = ip_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid IP address: {}", ip_str))?;

    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    let store = ItemStore::open(&config.state_file)?;
    let lists = ListManager::new();
    let count = store.load_into(&lists);

    println!();
    println!(
        "Local store: {} item(s), version {}",
        count,
        store.version()
    );
    for line in describe(&lists, ip) {
        println!("{}", line);
    }
    println!();

    Ok(())
}

/// Human-readable match report for `ip`.
pub fn describe(lists: &ListManager, ip: IpAddr) -> Vec<String> {
    let scopes = lists.matching_lists(ip);
    let server_ids: Vec<u64> = scopes
        .iter()
        .filter_map(|scope| match scope {
            ListScope::Server(id) => Some(*id),
            ListScope::Global(_) => None,
        })
        .collect();

    let mut lines = vec![match lists.check(ip, &server_ids) {
        Verdict::Allowed => format!("IP {} is ALLOWED", ip),
        Verdict::Denied => format!("IP {} is DENIED", ip),
        Verdict::Unlisted => format!("IP {} is not listed", ip),
    }];
    for scope in scopes {
        lines.push(match scope {
            ListScope::Global(list_type) => format!("  matched global {} list", list_type),
            ListScope::Server(id) => format!("  matched server list #{}", id),
        });
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iplist::{IpItem, ListType};

    #[test]
    fn test_describe_global_and_server_lists() {
        let lists = ListManager::new();
        lists.add_item(
            IpItem::from_strings(1, "ipv4", "10.0.0.0", "10.0.0.255")
                .unwrap()
                .with_list(ListType::Black, 0, true),
        );
        lists.add_item(
            IpItem::from_strings(2, "ipv4", "10.0.0.7", "")
                .unwrap()
                .with_list(ListType::White, 42, false),
        );

        let lines = describe(&lists, "10.0.0.7".parse().unwrap());
        assert_eq!(lines[0], "IP 10.0.0.7 is ALLOWED");
        assert!(lines.contains(&"  matched global black list".to_string()));
        assert!(lines.contains(&"  matched server list #42".to_string()));

        let lines = describe(&lists, "10.0.0.8".parse().unwrap());
        assert_eq!(lines, vec!["IP 10.0.0.8 is DENIED", "  matched global black list"]);
    }

    #[test]
    fn test_describe_unlisted() {
        let lists = ListManager::new();
        assert_eq!(
            describe(&lists, "2001:db8::1".parse().unwrap()),
            vec!["IP 2001:db8::1 is not listed"]
        );
    }
}
