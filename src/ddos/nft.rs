//! Thin command surface over `nft` for the DDoS table.
//!
//! Every mutation is one `nft` invocation; live state is read back with
//! `nft -j` and parsed from JSON.

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use super::tag::RuleTag;
use crate::cmd_abstraction::{args_to_strings, exec_checked, CommandExecutor};
use crate::error::AclError;

pub const TABLE_NAME: &str = "edgeacl_ddos";
pub const CHAIN_NAME: &str = "input";
pub const ALLOW_SET: &str = "allow";
pub const DENY_SET: &str = "deny";
const CHAIN_PRIORITY: &str = "-10";

/// Address family of one DDoS table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Ipv4, Family::Ipv6];

    /// nft table family keyword
    pub fn keyword(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ip",
            Family::Ipv6 => "ip6",
        }
    }

    fn addr_type(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4_addr",
            Family::Ipv6 => "ipv6_addr",
        }
    }

    fn saddr(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ip saddr",
            Family::Ipv6 => "ip6 saddr",
        }
    }

    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Family::Ipv4,
            IpNet::V6(_) => Family::Ipv6,
        }
    }
}

/// One rule of the chain as listed by nft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRule {
    pub handle: u64,
    pub comment: Option<String>,
}

impl LiveRule {
    pub fn tag(&self) -> Option<RuleTag> {
        self.comment.as_deref().and_then(RuleTag::from_comment)
    }
}

/// Canonical text of a set element: bare address for host prefixes,
/// `addr/len` otherwise.
pub fn element_string(net: &IpNet) -> String {
    let net = net.trunc();
    if net.prefix_len() == net.max_prefix_len() {
        net.addr().to_string()
    } else {
        net.to_string()
    }
}

/// Normalize an element string as nft prints it; ranges are kept verbatim.
fn normalize_element(raw: &str) -> String {
    if let Ok(net) = raw.parse::<IpNet>() {
        return element_string(&net);
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return element_string(&IpNet::from(ip));
    }
    raw.to_string()
}

/// Expression arguments of a rule, without the leading `add rule ...`.
pub fn rule_args(family: Family, tag: &RuleTag) -> Vec<String> {
    use super::tag::RuleKind::*;

    let saddr = family.saddr();
    let port = tag.port;
    let block = if tag.block_timeout_secs > 0 {
        format!(
            "add @{} {{ {} timeout {}s }} ",
            DENY_SET, saddr, tag.block_timeout_secs
        )
    } else {
        String::new()
    };
    let expr = match tag.kind {
        MaxConnections => format!(
            "tcp dport {} ct state new ct count over {} drop",
            port, tag.threshold
        ),
        MaxConnectionsPerIp => format!(
            "tcp dport {} ct state new meter connip_{} {{ {} ct count over {} }} drop",
            port, port, saddr, tag.threshold
        ),
        MinutelyRate => format!(
            "tcp dport {} ct state new meter ratemin_{} {{ {} limit rate over {}/minute }} {}drop",
            port, port, saddr, tag.threshold, block
        ),
        SecondlyRate => format!(
            "tcp dport {} ct state new meter ratesec_{} {{ {} limit rate over {}/second }} {}drop",
            port, port, saddr, tag.threshold, block
        ),
        AllowBase => format!("{} @{} accept", saddr, ALLOW_SET),
        DenyBase => format!("{} @{} drop", saddr, DENY_SET),
    };
    let mut args: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    args.push("comment".to_string());
    args.push(format!("\"{}\"", tag.to_comment()));
    args
}

/// Where a new rule goes in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Head,
    Tail,
}

/// `nft` invoked through a [`CommandExecutor`].
#[derive(Clone)]
pub struct NftCli {
    executor: Arc<dyn CommandExecutor>,
    path: String,
}

impl NftCli {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self::with_path(executor, "nft")
    }

    pub fn with_path(executor: Arc<dyn CommandExecutor>, path: &str) -> Self {
        Self {
            executor,
            path: path.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("{} {}", self.path, args.join(" "));
        exec_checked(self.executor.as_ref(), &self.path, args).await
    }

    async fn run_owned(&self, args: Vec<String>) -> Result<String> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs).await
    }

    /// Whether `nft` can be executed at all.
    pub async fn available(&self) -> Result<bool> {
        match self
            .executor
            .execute(&self.path, &args_to_strings(&["--version"]))
            .await
        {
            Ok(output) => Ok(output.success),
            Err(e) if AclError::is_tool_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create table, chain and sets of `family` if they do not exist.
    pub async fn ensure_table(&self, family: Family) -> Result<()> {
        let fam = family.keyword();
        self.run(&["add", "table", fam, TABLE_NAME]).await?;
        // "--" keeps the negative priority from being read as an option
        self.run(&[
            "--", "add", "chain", fam, TABLE_NAME, CHAIN_NAME, "{", "type", "filter", "hook",
            "input", "priority", CHAIN_PRIORITY, ";", "policy", "accept", ";", "}",
        ])
        .await?;
        self.run(&[
            "add",
            "set",
            fam,
            TABLE_NAME,
            ALLOW_SET,
            "{",
            "type",
            family.addr_type(),
            ";",
            "flags",
            "interval",
            ";",
            "}",
        ])
        .await?;
        self.run(&[
            "add",
            "set",
            fam,
            TABLE_NAME,
            DENY_SET,
            "{",
            "type",
            family.addr_type(),
            ";",
            "flags",
            "dynamic,timeout",
            ";",
            "}",
        ])
        .await?;
        Ok(())
    }

    /// Rules of the DDoS chain.
    pub async fn list_rules(&self, family: Family) -> Result<Vec<LiveRule>> {
        let out = self
            .run(&["-j", "list", "chain", family.keyword(), TABLE_NAME, CHAIN_NAME])
            .await?;
        parse_rules(&out)
    }

    /// Elements of a set, normalized.
    pub async fn list_elements(&self, family: Family, set: &str) -> Result<Vec<String>> {
        let out = self
            .run(&["-j", "list", "set", family.keyword(), TABLE_NAME, set])
            .await?;
        parse_elements(&out)
    }

    pub async fn add_rule(&self, family: Family, position: Position, tag: &RuleTag) -> Result<()> {
        let verb = match position {
            Position::Head => "insert",
            Position::Tail => "add",
        };
        let mut args = args_to_strings(&[verb, "rule", family.keyword(), TABLE_NAME, CHAIN_NAME]);
        args.extend(rule_args(family, tag));
        self.run_owned(args)
            .await
            .with_context(|| format!("Failed to add rule {}", tag))?;
        Ok(())
    }

    pub async fn delete_rule(&self, family: Family, handle: u64) -> Result<()> {
        let handle = handle.to_string();
        self.run(&[
            "delete",
            "rule",
            family.keyword(),
            TABLE_NAME,
            CHAIN_NAME,
            "handle",
            &handle,
        ])
        .await?;
        Ok(())
    }

    pub async fn add_element(&self, family: Family, set: &str, element: &str) -> Result<()> {
        self.run(&["add", "element", family.keyword(), TABLE_NAME, set, "{", element, "}"])
            .await?;
        Ok(())
    }

    pub async fn delete_element(&self, family: Family, set: &str, element: &str) -> Result<()> {
        self.run(&[
            "delete",
            "element",
            family.keyword(),
            TABLE_NAME,
            set,
            "{",
            element,
            "}",
        ])
        .await?;
        Ok(())
    }
}

fn nftables_objects(json: &str) -> Result<Vec<Value>> {
    let root: Value = serde_json::from_str(json).context("Failed to parse nft JSON output")?;
    match root.get("nftables") {
        Some(Value::Array(objects)) => Ok(objects.clone()),
        _ => anyhow::bail!("nft JSON output has no 'nftables' array"),
    }
}

/// Rules out of `nft -j list chain`.
pub fn parse_rules(json: &str) -> Result<Vec<LiveRule>> {
    Ok(nftables_objects(json)?
        .iter()
        .filter_map(|obj| obj.get("rule"))
        .filter_map(|rule| {
            Some(LiveRule {
                handle: rule.get("handle")?.as_u64()?,
                comment: rule
                    .get("comment")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect())
}

/// Elements out of `nft -j list set`.
pub fn parse_elements(json: &str) -> Result<Vec<String>> {
    let mut elements = Vec::new();
    for obj in nftables_objects(json)? {
        let Some(elems) = obj
            .get("set")
            .and_then(|set| set.get("elem"))
            .and_then(Value::as_array)
        else {
            continue;
        };
        elements.extend(elems.iter().filter_map(element_value));
    }
    Ok(elements)
}

fn element_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(normalize_element(s)),
        Value::Object(map) => {
            if let Some(prefix) = map.get("prefix") {
                let addr = prefix.get("addr")?.as_str()?;
                let len = prefix.get("len")?.as_u64()?;
                return Some(normalize_element(&format!("{}/{}", addr, len)));
            }
            if let Some(range) = map.get("range").and_then(Value::as_array) {
                let from = range.first()?.as_str()?;
                let to = range.get(1)?.as_str()?;
                return Some(format!("{}-{}", from, to));
            }
            // Elements with per-element options: {"elem": {"val": ...}}
            map.get("elem").and_then(|e| e.get("val")).and_then(element_value)
        }
        _ => None,
    }
}
