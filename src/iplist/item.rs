//! ACL item model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::AclError;

/// Kind of address match an item performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Exact match on `ip_from`
    Single,
    /// Inclusive `[ip_from, ip_to]`
    Range,
    /// Every address of any family
    All,
}

/// Which list an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListType {
    White,
    #[default]
    Black,
    Grey,
}

impl ListType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListType::White => "white",
            ListType::Black => "black",
            ListType::Grey => "grey",
        }
    }
}

impl fmt::Display for ListType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One allow/deny entry.
///
/// Addresses are kept as raw big-endian bytes (4 for IPv4, 16 for IPv6) so
/// that lexicographic byte order is numeric order within a family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpItem {
    pub id: u64,
    pub kind: ItemKind,
    #[serde(default)]
    pub ip_from: Vec<u8>,
    #[serde(default)]
    pub ip_to: Vec<u8>,
    /// Unix seconds, 0 = never expires
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub event_level: String,
    #[serde(default)]
    pub list_id: u64,
    #[serde(default)]
    pub list_type: ListType,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub version: i64,
}

impl IpItem {
    /// Build an item from textual addresses as sent by the control plane.
    ///
    /// `ip_to` may be empty (exact match). The kind is inferred: `all` when
    /// `item_type` says so, a range when `ip_to` differs from `ip_from`, and a
    /// single address otherwise.
    pub fn from_strings(id: u64, item_type: &str, ip_from: &str, ip_to: &str) -> Result<Self, AclError> {
        let from = parse_ip_bytes(ip_from)?;
        let to = parse_ip_bytes(ip_to)?;

        if item_type.eq_ignore_ascii_case("all") {
            return Ok(Self::new(id, ItemKind::All, Vec::new(), Vec::new()));
        }

        if !from.is_empty() && !to.is_empty() && from.len() != to.len() {
            return Err(AclError::InvalidIp(format!(
                "mixed address families in range {}-{}",
                ip_from, ip_to
            )));
        }

        let kind = if to.is_empty() || to == from {
            ItemKind::Single
        } else {
            ItemKind::Range
        };
        let to = if kind == ItemKind::Single { Vec::new() } else { to };
        Ok(Self::new(id, kind, from, to))
    }

    pub fn new(id: u64, kind: ItemKind, ip_from: Vec<u8>, ip_to: Vec<u8>) -> Self {
        Self {
            id,
            kind,
            ip_from,
            ip_to,
            expires_at: 0,
            event_level: String::new(),
            list_id: 0,
            list_type: ListType::Black,
            is_global: false,
            version: 0,
        }
    }

    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_event_level(mut self, level: impl Into<String>) -> Self {
        self.event_level = level.into();
        self
    }

    pub fn with_list(mut self, list_type: ListType, list_id: u64, is_global: bool) -> Self {
        self.list_type = list_type;
        self.list_id = list_id;
        self.is_global = is_global;
        self
    }

    /// Whether the item still applies at unix time `now`.
    #[inline]
    pub fn is_live_at(&self, now: i64) -> bool {
        self.expires_at == 0 || self.expires_at > now
    }

    /// Whether the item can take part in lookups at all.
    ///
    /// Non match-all items need a lower bound; a range also needs an upper
    /// bound of the same family that is not below it.
    pub fn is_indexable(&self) -> bool {
        match self.kind {
            ItemKind::All => true,
            ItemKind::Single => is_ip_len(self.ip_from.len()),
            ItemKind::Range => {
                is_ip_len(self.ip_from.len())
                    && self.ip_to.len() == self.ip_from.len()
                    && self.ip_from <= self.ip_to
            }
        }
    }

    /// Whether `addr` falls inside this item, ignoring expiry.
    pub fn covers(&self, addr: &[u8]) -> bool {
        match self.kind {
            ItemKind::All => true,
            ItemKind::Single => self.ip_from == addr,
            ItemKind::Range => {
                self.ip_from.len() == addr.len()
                    && self.ip_from.as_slice() <= addr
                    && addr <= self.ip_to.as_slice()
            }
        }
    }

    /// Lower bound as an address.
    pub fn from_ip(&self) -> Option<IpAddr> {
        bytes_to_ip(&self.ip_from)
    }

    /// Upper bound as an address; equals the lower bound for single items.
    pub fn to_ip(&self) -> Option<IpAddr> {
        if self.ip_to.is_empty() {
            self.from_ip()
        } else {
            bytes_to_ip(&self.ip_to)
        }
    }

    /// Address family name used by external callouts: `ipv4`, `ipv6` or `all`.
    pub fn family_name(&self) -> &'static str {
        match self.kind {
            ItemKind::All => "all",
            _ if self.ip_from.len() == 16 => "ipv6",
            _ => "ipv4",
        }
    }

    /// Lower bound rendered as text, empty when absent.
    pub fn ip_from_string(&self) -> String {
        self.from_ip().map(|ip| ip.to_string()).unwrap_or_default()
    }

    /// Upper bound rendered as text, empty for single items.
    pub fn ip_to_string(&self) -> String {
        bytes_to_ip(&self.ip_to).map(|ip| ip.to_string()).unwrap_or_default()
    }
}

#[inline]
fn is_ip_len(len: usize) -> bool {
    len == 4 || len == 16
}

/// Parse a textual address into its raw bytes. Empty input gives empty bytes.
///
/// IPv4-mapped IPv6 addresses are folded to their 4-byte form so that both
/// notations compare equal.
pub fn parse_ip_bytes(s: &str) -> Result<Vec<u8>, AclError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Vec::new());
    }
    let ip: IpAddr = s
        .parse()
        .map_err(|_| AclError::InvalidIp(s.to_string()))?;
    Ok(ip_to_bytes(ip))
}

/// Raw bytes of an address.
pub fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.octets().to_vec(),
            None => v6.octets().to_vec(),
        },
    }
}

/// Address from raw bytes; `None` unless 4 or 16 bytes long.
pub fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
