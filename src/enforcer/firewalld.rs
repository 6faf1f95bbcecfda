//! Host firewall daemon backend (`firewall-cmd`).
//!
//! firewalld answers slowly (each call goes over D-Bus), so commands are
//! queued and run by a single background worker. When the queue is full new
//! commands are dropped with a warning rather than stalling the sync engine.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    item_blocks, report_missing_tool, ttl_of, Action, ActionContext, ActionDescriptor, Ttl,
    WorkQueue,
};
use crate::clock;
use crate::cmd_abstraction::{args_to_strings, CommandExecutor};
use crate::error::{AclError, ActionError};
use crate::iplist::{IpItem, ListType};

pub const TYPE_ID: &str = "firewalld";

const DEFAULT_QUEUE_SIZE: usize = 4096;

static FIREWALLD_NOT_FOUND: AtomicBool = AtomicBool::new(false);

pub struct FirewalldAction {
    executor: Arc<dyn CommandExecutor>,
    path: String,
    queue: Option<WorkQueue<Vec<String>>>,
}

impl FirewalldAction {
    pub fn new(ctx: &ActionContext) -> Self {
        Self {
            executor: Arc::clone(&ctx.executor),
            path: "firewall-cmd".to_string(),
            queue: None,
        }
    }

    fn enqueue(&self, args: Vec<String>) {
        if let Some(queue) = &self.queue {
            queue.push(args);
        }
    }

    async fn run_queued(executor: Arc<dyn CommandExecutor>, path: String, args: Vec<String>) {
        match executor.execute(&path, &args).await {
            Ok(output) if output.success => debug!("{} {}", path, args.join(" ")),
            Ok(output) => warn!(
                "{} {} failed: {}",
                path,
                args.join(" "),
                output.stderr.trim()
            ),
            Err(e) if AclError::is_tool_not_found(&e) => {
                report_missing_tool(&FIREWALLD_NOT_FOUND, &path)
            }
            Err(e) => warn!("{} {} failed: {:#}", path, args.join(" "), e),
        }
    }
}

/// Rich rule matching `block` with the verdict of `list_type`.
fn rich_rule(block: &IpNet, list_type: ListType) -> String {
    let family = match block {
        IpNet::V4(_) => "ipv4",
        IpNet::V6(_) => "ipv6",
    };
    let verdict = match list_type {
        ListType::White => "accept",
        _ => "drop",
    };
    format!(
        "rule family=\"{}\" source address=\"{}\" {}",
        family, block, verdict
    )
}

#[async_trait]
impl Action for FirewalldAction {
    fn type_id(&self) -> &'static str {
        TYPE_ID
    }

    async fn init(&mut self, descriptor: &ActionDescriptor) -> Result<(), ActionError> {
        if let Some(path) = descriptor.param_str("path") {
            self.path = path.to_string();
        }
        let queue_size = descriptor
            .param_u64("queue_size")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_QUEUE_SIZE);

        let executor = Arc::clone(&self.executor);
        let path = self.path.clone();
        self.queue = Some(WorkQueue::spawn(
            format!("firewalld #{}", descriptor.id),
            queue_size,
            move |args: Vec<String>| Self::run_queued(Arc::clone(&executor), path.clone(), args),
        ));

        // Commands are still queued when the daemon is down; it may come up later.
        match self
            .executor
            .execute(&self.path, &args_to_strings(&["--state"]))
            .await
        {
            Ok(output) if output.success => {
                info!("firewalld action #{} ready (queue {})", descriptor.id, queue_size);
                Ok(())
            }
            Ok(output) => Err(anyhow::anyhow!(
                "firewalld action #{}: firewalld is not running: {}",
                descriptor.id,
                output.stdout.trim()
            )
            .into()),
            Err(e) => {
                if AclError::is_tool_not_found(&e) {
                    report_missing_tool(&FIREWALLD_NOT_FOUND, &self.path);
                }
                Err(e.context(format!("firewalld action #{}", descriptor.id)).into())
            }
        }
    }

    async fn add_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        if list_type == ListType::Grey {
            return Ok(());
        }
        let timeout = match ttl_of(item, clock::unix_time()) {
            Ttl::Expired => return Ok(()),
            Ttl::Forever => None,
            Ttl::Seconds(secs) => Some(format!("--timeout={}s", secs)),
        };
        for block in item_blocks(item, 32) {
            let mut args = vec![format!("--add-rich-rule={}", rich_rule(&block, list_type))];
            args.extend(timeout.clone());
            self.enqueue(args);
        }
        Ok(())
    }

    async fn delete_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        if list_type == ListType::Grey {
            return Ok(());
        }
        for block in item_blocks(item, 32) {
            self.enqueue(vec![format!(
                "--remove-rich-rule={}",
                rich_rule(&block, list_type)
            )]);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(queue) = &self.queue {
            queue.close().await;
        }
        Ok(())
    }
}
