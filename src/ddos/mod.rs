//! TCP connection-limiting rules on a dedicated nftables table.
//!
//! nft offers no transaction across separate invocations, so the reconciler
//! diffs the live table against the desired configuration and issues only
//! the mutations needed:
//!
//! - the allow set is synced element by element, never flushed;
//! - rate-limit rules are identified by their comment tag, and rebuilt as a
//!   whole when the tagged set differs from the desired one;
//! - base rules (allow/deny sets) are created once and never rebuilt.
//!
//! A repeated identical apply makes no `nft` call at all.

pub mod nft;
pub mod tag;

use anyhow::{Context, Result};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cmd_abstraction::CommandExecutor;
use crate::config::{DdosConfig, TcpConfig};
pub use nft::{Family, NftCli};
pub use tag::{RuleKind, RuleTag};

use nft::{element_string, Position, ALLOW_SET};

pub const DEFAULT_PORTS: [u16; 2] = [80, 443];
pub const DEFAULT_MAX_CONNECTIONS: u64 = 100_000;
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: u64 = 1000;
pub const DEFAULT_MINUTELY_RATE: u64 = 500;
pub const DEFAULT_SECONDLY_RATE: u64 = 300;
pub const DEFAULT_BLOCK_TIMEOUT_SECS: u64 = 3600;

/// Desired state handed to [`DdosReconciler::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyRequest {
    pub tcp: TcpConfig,
    pub allow_ips: Vec<String>,
}

impl ApplyRequest {
    pub fn from_config(config: &DdosConfig) -> Self {
        Self {
            tcp: config.tcp.clone(),
            allow_ips: config.allow_ips.clone(),
        }
    }
}

/// What an [`DdosReconciler::apply`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Live state was changed with this many mutations
    Applied(usize),
    /// Nothing differed from the last successful apply
    Unchanged,
    /// nft is not ready; the request runs once it is
    Deferred,
    /// Another apply is in flight and will pick this request up
    Queued,
}

/// Rate-limit rules for `tcp`, in a stable order.
///
/// Unset values take their defaults; a value of zero disables that rule.
pub fn desired_rules(tcp: &TcpConfig) -> Vec<RuleTag> {
    let ports: BTreeSet<u16> = if tcp.ports.is_empty() {
        DEFAULT_PORTS.into_iter().collect()
    } else {
        tcp.ports.iter().copied().collect()
    };
    let max_conn = tcp.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
    let per_ip = tcp
        .max_connections_per_ip
        .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_IP);
    let minutely = tcp
        .new_connections_minutely_rate
        .unwrap_or(DEFAULT_MINUTELY_RATE);
    let minutely_block = tcp
        .new_connections_minutely_block_secs
        .unwrap_or(DEFAULT_BLOCK_TIMEOUT_SECS);
    let secondly = tcp
        .new_connections_secondly_rate
        .unwrap_or(DEFAULT_SECONDLY_RATE);
    let secondly_block = tcp
        .new_connections_secondly_block_secs
        .unwrap_or(DEFAULT_BLOCK_TIMEOUT_SECS);

    let mut rules = Vec::new();
    for port in ports {
        if max_conn > 0 {
            rules.push(RuleTag::new(RuleKind::MaxConnections, port, max_conn, 0));
        }
        if per_ip > 0 {
            rules.push(RuleTag::new(RuleKind::MaxConnectionsPerIp, port, per_ip, 0));
        }
        if minutely > 0 {
            rules.push(RuleTag::new(RuleKind::MinutelyRate, port, minutely, minutely_block));
        }
        if secondly > 0 {
            rules.push(RuleTag::new(RuleKind::SecondlyRate, port, secondly, secondly_block));
        }
    }
    rules
}

/// Parse the allow list and merge it into the smallest set of disjoint
/// blocks, IPv4 first. Invalid entries are skipped.
///
/// The allow set is an interval set, so nft rejects overlapping elements.
pub fn normalize_allow_list(raw: &[String]) -> Vec<IpNet> {
    let nets: Vec<IpNet> = raw
        .iter()
        .filter_map(|entry| {
            let entry = entry.trim();
            let parsed = entry
                .parse::<IpNet>()
                .map(|n| n.trunc())
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from));
            match parsed {
                Ok(net) => Some(net),
                Err(_) => {
                    debug!("Skipping invalid allow entry: {:?}", entry);
                    None
                }
            }
        })
        .collect();
    IpNet::aggregate(&nets)
}

/// Parts of the last request that were applied successfully.
#[derive(Debug, Default)]
struct AppliedState {
    tcp_key: Option<String>,
    allow: Option<Vec<IpNet>>,
}

pub struct DdosReconciler {
    nft: NftCli,
    ready: AtomicBool,
    applying: AtomicBool,
    needs_reapply: AtomicBool,
    pending: Mutex<Option<ApplyRequest>>,
    applied: Mutex<AppliedState>,
}

impl DdosReconciler {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self::with_nft(NftCli::new(executor))
    }

    pub fn with_nft(nft: NftCli) -> Self {
        Self {
            nft,
            ready: AtomicBool::new(false),
            applying: AtomicBool::new(false),
            needs_reapply: AtomicBool::new(false),
            pending: Mutex::new(None),
            applied: Mutex::new(AppliedState::default()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Create the tables and base rules. Returns false when nft is unusable.
    pub async fn ensure_ready(&self) -> Result<bool> {
        if !self.nft.available().await? {
            warn!("nft is not available, DDoS rules stay inactive");
            return Ok(false);
        }
        for family in Family::ALL {
            self.nft
                .ensure_table(family)
                .await
                .with_context(|| format!("Failed to create {} DDoS table", family.keyword()))?;
            let present: BTreeSet<RuleKind> = self
                .nft
                .list_rules(family)
                .await?
                .iter()
                .filter_map(|rule| rule.tag())
                .map(|tag| tag.kind)
                .collect();
            // Insert at head in reverse so allow ends up first
            for kind in [RuleKind::DenyBase, RuleKind::AllowBase] {
                if !present.contains(&kind) {
                    self.nft
                        .add_rule(family, Position::Head, &RuleTag::base(kind))
                        .await?;
                }
            }
        }
        self.ready.store(true, Ordering::SeqCst);
        info!("DDoS tables ready");
        Ok(true)
    }

    /// Mark ready and run the request stored while not ready, if any.
    pub async fn on_ready(&self) -> Result<ApplyOutcome> {
        self.ready.store(true, Ordering::SeqCst);
        let pending = self.pending.lock().take();
        match pending {
            Some(request) => self.apply(request).await,
            None => Ok(ApplyOutcome::Unchanged),
        }
    }

    /// Bring the live tables in line with `request`.
    pub async fn apply(&self, request: ApplyRequest) -> Result<ApplyOutcome> {
        *self.pending.lock() = Some(request);

        if !self.is_ready() {
            debug!("DDoS tables not ready, deferring apply");
            return Ok(ApplyOutcome::Deferred);
        }
        if self.applying.swap(true, Ordering::SeqCst) {
            self.needs_reapply.store(true, Ordering::SeqCst);
            debug!("DDoS apply in flight, queued for re-apply");
            return Ok(ApplyOutcome::Queued);
        }

        let mut result = Ok(ApplyOutcome::Unchanged);
        loop {
            self.needs_reapply.store(false, Ordering::SeqCst);
            let next = self.pending.lock().take();
            if let Some(request) = next {
                result = self.apply_now(&request).await;
            }
            if self.needs_reapply.load(Ordering::SeqCst) {
                continue;
            }
            self.applying.store(false, Ordering::SeqCst);
            // A request may have been queued between the check and the release
            if self.needs_reapply.load(Ordering::SeqCst)
                && !self.applying.swap(true, Ordering::SeqCst)
            {
                continue;
            }
            break;
        }
        result
    }

    async fn apply_now(&self, request: &ApplyRequest) -> Result<ApplyOutcome> {
        let allow = normalize_allow_list(&request.allow_ips);
        let tcp_key =
            serde_json::to_string(&request.tcp).context("Failed to serialize TCP config")?;

        let (allow_changed, tcp_changed) = {
            let applied = self.applied.lock();
            (
                applied.allow.as_ref() != Some(&allow),
                applied.tcp_key.as_ref() != Some(&tcp_key),
            )
        };
        if !allow_changed && !tcp_changed {
            return Ok(ApplyOutcome::Unchanged);
        }

        let mut changes = 0;
        if allow_changed {
            changes += self.sync_allow_set(&allow).await?;
            self.applied.lock().allow = Some(allow);
        }
        if tcp_changed {
            changes += self.sync_rules(&desired_rules(&request.tcp)).await?;
            self.applied.lock().tcp_key = Some(tcp_key);
        }
        if changes > 0 {
            info!("DDoS rules reconciled with {} changes", changes);
        }
        Ok(ApplyOutcome::Applied(changes))
    }

    async fn sync_allow_set(&self, allow: &[IpNet]) -> Result<usize> {
        let mut changes = 0;
        for family in Family::ALL {
            let desired: BTreeSet<String> = allow
                .iter()
                .filter(|net| Family::of(net) == family)
                .map(element_string)
                .collect();
            let live: BTreeSet<String> = self
                .nft
                .list_elements(family, ALLOW_SET)
                .await?
                .into_iter()
                .collect();

            for element in live.difference(&desired) {
                self.nft
                    .delete_element(family, ALLOW_SET, element)
                    .await
                    .with_context(|| format!("Failed to remove {} from allow set", element))?;
                changes += 1;
            }
            for element in desired.difference(&live) {
                self.nft
                    .add_element(family, ALLOW_SET, element)
                    .await
                    .with_context(|| format!("Failed to add {} to allow set", element))?;
                changes += 1;
            }
        }
        Ok(changes)
    }

    async fn sync_rules(&self, desired: &[RuleTag]) -> Result<usize> {
        let mut wanted = desired.to_vec();
        wanted.sort();

        let mut changes = 0;
        for family in Family::ALL {
            let owned: Vec<(u64, RuleTag)> = self
                .nft
                .list_rules(family)
                .await?
                .into_iter()
                .filter_map(|rule| rule.tag().map(|tag| (rule.handle, tag)))
                .filter(|(_, tag)| tag.kind.is_rate_limit())
                .collect();
            let mut live: Vec<RuleTag> = owned.iter().map(|(_, tag)| *tag).collect();
            live.sort();
            if live == wanted {
                debug!("{} DDoS rules up to date", family.keyword());
                continue;
            }

            for (handle, _) in &owned {
                self.nft.delete_rule(family, *handle).await?;
                changes += 1;
            }
            for tag in desired {
                self.nft.add_rule(family, Position::Tail, tag).await?;
                changes += 1;
            }
        }
        Ok(changes)
    }
}
