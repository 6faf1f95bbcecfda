//! Legacy packet-filter backend (`iptables` / `ip6tables`).
//!
//! One rule per CIDR block in the configured chain. Whitelisted blocks are
//! inserted at the head with ACCEPT, blacklisted ones appended with DROP.
//! Every rule carries the same comment so operators can tell them apart.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    item_blocks, report_missing_tool, ttl_of, Action, ActionContext, ActionDescriptor, Ttl,
};
use crate::clock;
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, CommandOutput};
use crate::error::{AclError, ActionError};
use crate::iplist::{IpItem, ListType};

pub const TYPE_ID: &str = "iptables";

const DEFAULT_CHAIN: &str = "INPUT";
const RULE_COMMENT: &str = "edgeacl";

static IPTABLES_NOT_FOUND: AtomicBool = AtomicBool::new(false);

pub struct IptablesAction {
    executor: Arc<dyn CommandExecutor>,
    chain: String,
    path: String,
    path_ipv6: String,
}

impl IptablesAction {
    pub fn new(ctx: &ActionContext) -> Self {
        Self {
            executor: Arc::clone(&ctx.executor),
            chain: DEFAULT_CHAIN.to_string(),
            path: "iptables".to_string(),
            path_ipv6: "ip6tables".to_string(),
        }
    }

    fn tool_for(&self, block: &IpNet) -> &str {
        match block {
            IpNet::V4(_) => &self.path,
            IpNet::V6(_) => &self.path_ipv6,
        }
    }

    /// Rule body shared by check, add and delete.
    fn rule_spec(block: &IpNet, target: &str) -> Vec<String> {
        args_to_strings(&[
            "-s",
            &block.to_string(),
            "-m",
            "comment",
            "--comment",
            RULE_COMMENT,
            "-j",
            target,
        ])
    }

    /// Run one command; `None` means the tool is missing.
    async fn run(&self, tool: &str, args: Vec<String>) -> Result<Option<CommandOutput>> {
        match self.executor.execute(tool, &args).await {
            Ok(output) => Ok(Some(output)),
            Err(e) if AclError::is_tool_not_found(&e) => {
                report_missing_tool(&IPTABLES_NOT_FOUND, tool);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn add_block(&self, block: &IpNet, list_type: ListType) -> Result<()> {
        let tool = self.tool_for(block);
        let (op, target) = match list_type {
            ListType::White => ("-I", "ACCEPT"),
            _ => ("-A", "DROP"),
        };
        let spec = Self::rule_spec(block, target);

        // Use -C to check, then -I/-A to add if not present
        let mut check = vec!["-C".to_string(), self.chain.clone()];
        check.extend(spec.iter().cloned());
        match self.run(tool, check).await? {
            None => return Ok(()),
            Some(output) if output.success => {
                debug!("{} rule for {} already present", tool, block);
                return Ok(());
            }
            Some(_) => {}
        }

        let mut add = vec![op.to_string(), self.chain.clone()];
        add.extend(spec);
        match self.run(tool, add).await? {
            Some(output) if !output.success => {
                anyhow::bail!("{} {} {} failed: {}", tool, op, block, output.stderr.trim())
            }
            _ => Ok(()),
        }
    }

    async fn delete_block(&self, block: &IpNet, list_type: ListType) -> Result<()> {
        let tool = self.tool_for(block);
        let target = match list_type {
            ListType::White => "ACCEPT",
            _ => "DROP",
        };
        let mut args = vec!["-D".to_string(), self.chain.clone()];
        args.extend(Self::rule_spec(block, target));
        match self.run(tool, args).await? {
            Some(output) if !output.success && !is_missing_rule(&output.stderr) => {
                anyhow::bail!("{} -D {} failed: {}", tool, block, output.stderr.trim())
            }
            _ => Ok(()),
        }
    }
}

/// Whether a failed delete only means the rule was not there.
fn is_missing_rule(stderr: &str) -> bool {
    stderr.contains("does a matching rule exist") || stderr.contains("Bad rule")
}

#[async_trait]
impl Action for IptablesAction {
    fn type_id(&self) -> &'static str {
        TYPE_ID
    }

    async fn init(&mut self, descriptor: &ActionDescriptor) -> Result<(), ActionError> {
        if let Some(chain) = descriptor.param_str("chain") {
            self.chain = chain.to_string();
        }
        if let Some(path) = descriptor.param_str("path") {
            self.path = path.to_string();
        }
        if let Some(path) = descriptor.param_str("path_ipv6") {
            self.path_ipv6 = path.to_string();
        }

        if self.run(&self.path, args_to_strings(&["--version"])).await?.is_none() {
            return Err(anyhow::anyhow!(
                "iptables action #{}: {} not found",
                descriptor.id,
                self.path
            )
            .into());
        }
        info!("iptables action #{} using chain {}", descriptor.id, self.chain);
        Ok(())
    }

    async fn add_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        if list_type == ListType::Grey {
            return Ok(());
        }
        if ttl_of(item, clock::unix_time()) == Ttl::Expired {
            debug!("iptables: item #{} already expired, skipping", item.id);
            return Ok(());
        }
        for block in item_blocks(item, 32) {
            self.add_block(&block, list_type).await?;
        }
        Ok(())
    }

    async fn delete_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        if list_type == ListType::Grey {
            return Ok(());
        }
        for block in item_blocks(item, 32) {
            self.delete_block(&block, list_type).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
