//! Enforcement backends ("actions") and the manager that drives them.
//!
//! Every backend implements [`Action`]. Backends are built from control-plane
//! [`ActionDescriptor`]s by the [`ActionRegistry`] and grouped by event level
//! in the [`ActionManager`], which fans ACL changes out to them.

mod firewalld;
mod html;
mod http_api;
mod ipset;
mod iptables;
mod manager;
mod queue;
mod registry;
mod script;

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub use firewalld::FirewalldAction;
pub use html::HtmlAction;
pub use http_api::{CalloutPayload, HttpApiAction};
pub use ipset::IpsetAction;
pub use iptables::IptablesAction;
pub use manager::{ActionManager, UpdateReport};
pub use queue::WorkQueue;
pub use registry::{ActionConstructor, ActionRegistry};
pub use script::ScriptAction;

use crate::cidr;
use crate::cmd_abstraction::CommandExecutor;
use crate::error::ActionError;
use crate::iplist::{IpItem, ItemKind};

/// Backend configuration as sent by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    pub id: i64,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub event_level: String,
}

impl ActionDescriptor {
    pub fn new(id: i64, action_type: &str, event_level: &str, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id,
            action_type: action_type.to_string(),
            params,
            event_level: event_level.to_string(),
        }
    }

    /// Canonical serialization used to detect changed descriptors.
    ///
    /// `serde_json::Map` keeps keys sorted, so equal descriptors always
    /// serialize to the same bytes.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Non-empty string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Required string parameter; absence is a fatal configuration error.
    pub fn require_str(&self, key: &str) -> Result<&str, ActionError> {
        self.param_str(key).ok_or_else(|| {
            ActionError::fatal(format!(
                "{} action #{}: parameter '{}' is required",
                self.action_type, self.id, key
            ))
        })
    }

    /// Unsigned integer parameter, accepting numbers and numeric strings.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        match self.params.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Fixed response served by the block-page backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPage {
    pub status_code: u16,
    pub body: String,
}

/// One enforcement backend.
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry type id of this backend
    fn type_id(&self) -> &'static str;

    /// Configure the backend.
    ///
    /// Return [`ActionError::Fatal`] for configuration the backend can never
    /// work with; other errors leave the backend registered.
    async fn init(&mut self, descriptor: &ActionDescriptor) -> Result<(), ActionError>;

    /// Enforce an item that was added to a list of `list_type`.
    async fn add_item(&self, list_type: crate::iplist::ListType, item: &IpItem) -> Result<()>;

    /// Undo exactly what [`Action::add_item`] did for the same item.
    async fn delete_item(&self, list_type: crate::iplist::ListType, item: &IpItem) -> Result<()>;

    /// Release background workers and other resources.
    async fn close(&self) -> Result<()>;

    /// Response to serve on the request path, for backends that render one.
    fn block_page(&self) -> Option<BlockPage> {
        None
    }
}

/// Shared dependencies handed to backend constructors.
#[derive(Clone)]
pub struct ActionContext {
    pub executor: Arc<dyn CommandExecutor>,
}

impl ActionContext {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

/// Remaining lifetime of an item, as backends with native timeouts need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ttl {
    Forever,
    Seconds(u64),
    Expired,
}

pub(crate) fn ttl_of(item: &IpItem, now: i64) -> Ttl {
    if item.expires_at == 0 {
        Ttl::Forever
    } else if item.expires_at > now {
        Ttl::Seconds((item.expires_at - now) as u64)
    } else {
        Ttl::Expired
    }
}

/// CIDR blocks a decomposing backend installs for `item`.
///
/// Match-all items and items without usable bounds give nothing.
pub(crate) fn item_blocks(item: &IpItem, max_prefix_len: u8) -> Vec<IpNet> {
    if item.kind == ItemKind::All || !item.is_indexable() {
        return Vec::new();
    }
    let (Some(from), Some(to)) = (item.from_ip(), item.to_ip()) else {
        return Vec::new();
    };
    let (blocks, skipped) = cidr::decompose_with_floor(from, to, max_prefix_len);
    if skipped > 0 {
        debug!(
            "Item #{}: skipped {} blocks smaller than /{}",
            item.id, skipped, max_prefix_len
        );
    }
    if blocks.is_empty() {
        debug!("Item #{}: nothing to enforce for {}-{}", item.id, from, to);
    }
    blocks
}

/// Log a missing external tool once per process for the given flag.
pub(crate) fn report_missing_tool(flag: &AtomicBool, tool: &str) {
    if !flag.swap(true, Ordering::Relaxed) {
        warn!("'{}' not found; enforcement through it is skipped until it is installed", tool);
    }
}

/// Check if running as root (effective UID == 0)
///
/// This check verifies that the process has the necessary privileges to
/// manipulate firewall rules. While capability-based checks would be more
/// precise (CAP_NET_ADMIN, CAP_NET_RAW), UID 0 check is simpler and covers
/// the common case of running with sudo.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() is a simple syscall that reads the effective user ID.
    // It has no preconditions, never fails, and doesn't modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, ensure the process has CAP_NET_ADMIN and CAP_NET_RAW capabilities."
        )
    }
    Ok(())
}
