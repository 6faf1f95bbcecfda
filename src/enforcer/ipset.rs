//! Kernel set backend (`ipset`).
//!
//! Items are decomposed into CIDR blocks and stored in `hash:net` sets,
//! one set per list type and address family. Blocks smaller than the
//! configured floor are skipped. Set names are owned by the operator; the
//! sets are created if missing but never destroyed, since firewall rules
//! elsewhere reference them.

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
use crate::cmd_abstraction::{args_to_strings, CommandExecutor};
use crate::error::{AclError, ActionError};
use crate::iplist::{IpItem, ListType};

pub const TYPE_ID: &str = "ipset";

static IPSET_NOT_FOUND: AtomicBool = AtomicBool::new(false);

/// Maximum number of elements per set.
const SET_MAXELEM: &str = "1048576";

#[derive(Debug, Default, Clone)]
struct SetNames {
    white: Option<String>,
    black: Option<String>,
    white_v6: Option<String>,
    black_v6: Option<String>,
}

impl SetNames {
    fn for_item(&self, list_type: ListType, ipv6: bool) -> Option<&str> {
        match (list_type, ipv6) {
            (ListType::White, false) => self.white.as_deref(),
            (ListType::Black, false) => self.black.as_deref(),
            (ListType::White, true) => self.white_v6.as_deref(),
            (ListType::Black, true) => self.black_v6.as_deref(),
            (ListType::Grey, _) => None,
        }
    }

    fn all(&self) -> Vec<(&str, &'static str)> {
        [
            (self.white.as_deref(), "inet"),
            (self.black.as_deref(), "inet"),
            (self.white_v6.as_deref(), "inet6"),
            (self.black_v6.as_deref(), "inet6"),
        ]
        .into_iter()
        .filter_map(|(name, family)| name.map(|n| (n, family)))
        .collect()
    }
}

pub struct IpsetAction {
    executor: Arc<dyn CommandExecutor>,
    path: String,
    sets: SetNames,
    max_prefix_len: u8,
}

impl IpsetAction {
    pub fn new(ctx: &ActionContext) -> Self {
        Self {
            executor: Arc::clone(&ctx.executor),
            path: "ipset".to_string(),
            sets: SetNames::default(),
            max_prefix_len: 32,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        let output = match self.executor.execute(&self.path, &args_to_strings(args)).await {
            Ok(output) => output,
            Err(e) if AclError::is_tool_not_found(&e) => {
                report_missing_tool(&IPSET_NOT_FOUND, &self.path);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !output.success {
            anyhow::bail!("{} {} failed: {}", self.path, args.join(" "), output.stderr.trim());
        }
        Ok(())
    }

    fn target(&self, list_type: ListType, item: &IpItem) -> Option<&str> {
        self.sets.for_item(list_type, item.ip_from.len() == 16)
    }

    /// Run one command per block, attempting every block before reporting.
    async fn for_each_block(
        &self,
        item: &IpItem,
        blocks: &[IpNet],
        args_for: impl Fn(&str) -> Vec<String>,
    ) -> Result<()> {
        let mut failures = 0usize;
        let mut last_error = None;
        for block in blocks {
            let args = args_for(&block.to_string());
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            if let Err(e) = self.run(&refs).await {
                failures += 1;
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e.context(format!(
                "ipset: {} of {} blocks failed for item #{}",
                failures,
                blocks.len(),
                item.id
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Action for IpsetAction {
    fn type_id(&self) -> &'static str {
        TYPE_ID
    }

    async fn init(&mut self, descriptor: &ActionDescriptor) -> Result<(), ActionError> {
        let name = |key: &str| descriptor.param_str(key).map(str::to_string);
        self.sets = SetNames {
            white: name("white_name"),
            black: name("black_name"),
            white_v6: name("white_name_ipv6"),
            black_v6: name("black_name_ipv6"),
        };
        if self.sets.all().is_empty() {
            return Err(ActionError::fatal(format!(
                "ipset action #{}: at least one of white_name, black_name, \
                 white_name_ipv6, black_name_ipv6 is required",
                descriptor.id
            )));
        }
        if let Some(path) = descriptor.param_str("path") {
            self.path = path.to_string();
        }
        if let Some(len) = descriptor.param_u64("max_prefix_len") {
            if len > 32 {
                return Err(ActionError::fatal(format!(
                    "ipset action #{}: max_prefix_len {} is not a valid IPv4 prefix length",
                    descriptor.id, len
                )));
            }
            self.max_prefix_len = len as u8;
        }

        for (name, family) in self.sets.all() {
            let output = self
                .executor
                .execute(
                    &self.path,
                    &args_to_strings(&[
                        "create", name, "hash:net", "family", family, "timeout", "0", "maxelem",
                        SET_MAXELEM, "-exist",
                    ]),
                )
                .await;
            match output {
                Ok(output) if output.success => debug!("ipset {} ready", name),
                Ok(output) => {
                    return Err(anyhow::anyhow!(
                        "ipset action #{}: failed to create set {}: {}",
                        descriptor.id,
                        name,
                        output.stderr.trim()
                    )
                    .into())
                }
                Err(e) if AclError::is_tool_not_found(&e) => {
                    report_missing_tool(&IPSET_NOT_FOUND, &self.path);
                    return Err(e.context(format!("ipset action #{}", descriptor.id)).into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            "ipset action #{} using sets {:?} (max prefix /{})",
            descriptor.id,
            self.sets.all().iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            self.max_prefix_len
        );
        Ok(())
    }

    async fn add_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        let Some(set) = self.target(list_type, item) else {
            return Ok(());
        };
        let timeout = match ttl_of(item, clock::unix_time()) {
            Ttl::Expired => {
                debug!("ipset: item #{} already expired, skipping", item.id);
                return Ok(());
            }
            Ttl::Forever => None,
            Ttl::Seconds(secs) => Some(secs.to_string()),
        };
        let blocks = item_blocks(item, self.max_prefix_len);
        self.for_each_block(item, &blocks, |block| {
            let mut args = vec!["add".to_string(), set.to_string(), block.to_string()];
            if let Some(secs) = &timeout {
                args.push("timeout".to_string());
                args.push(secs.clone());
            }
            args.push("-exist".to_string());
            args
        })
        .await
    }

    async fn delete_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        let Some(set) = self.target(list_type, item) else {
            return Ok(());
        };
        let blocks = item_blocks(item, self.max_prefix_len);
        self.for_each_block(item, &blocks, |block| {
            vec![
                "del".to_string(),
                set.to_string(),
                block.to_string(),
                "-exist".to_string(),
            ]
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
