//! External script backend.
//!
//! Runs an operator-provided executable once per change, with the change
//! described in environment variables. Ranges are passed as-is.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info};

use super::{report_missing_tool, ttl_of, Action, ActionContext, ActionDescriptor, Ttl};
use crate::clock;
use crate::cmd_abstraction::{CommandEnv, CommandExecutor};
use crate::error::{AclError, ActionError};
use crate::iplist::{IpItem, ListType};

pub const TYPE_ID: &str = "script";

static SCRIPT_NOT_FOUND: AtomicBool = AtomicBool::new(false);

pub struct ScriptAction {
    executor: Arc<dyn CommandExecutor>,
    path: PathBuf,
    cwd: Option<PathBuf>,
}

impl ScriptAction {
    pub fn new(ctx: &ActionContext) -> Self {
        Self {
            executor: Arc::clone(&ctx.executor),
            path: PathBuf::new(),
            cwd: None,
        }
    }

    /// Environment handed to the script for one change.
    fn env_for(&self, action: &str, list_type: ListType, item: &IpItem) -> CommandEnv {
        CommandEnv {
            vars: vec![
                ("ACTION".to_string(), action.to_string()),
                ("TYPE".to_string(), item.family_name().to_string()),
                ("IP_FROM".to_string(), item.ip_from_string()),
                ("IP_TO".to_string(), item.ip_to_string()),
                ("EXPIRED_AT".to_string(), item.expires_at.to_string()),
                ("LIST_TYPE".to_string(), list_type.as_str().to_string()),
            ],
            cwd: self.cwd.clone(),
        }
    }

    async fn invoke(&self, action: &str, list_type: ListType, item: &IpItem) -> Result<()> {
        let path = self.path.to_string_lossy();
        if !self.path.exists() {
            report_missing_tool(&SCRIPT_NOT_FOUND, &path);
            return Ok(());
        }
        let env = self.env_for(action, list_type, item);
        let output = match self.executor.execute_with_env(&path, &[], &env).await {
            Ok(output) => output,
            Err(e) if AclError::is_tool_not_found(&e) => {
                report_missing_tool(&SCRIPT_NOT_FOUND, &path);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !output.success {
            anyhow::bail!(
                "script {} exited with {:?} for item #{}: {}",
                path,
                output.code,
                item.id,
                output.stderr.trim()
            );
        }
        debug!("script {} {} item #{}", path, action, item.id);
        Ok(())
    }
}

#[async_trait]
impl Action for ScriptAction {
    fn type_id(&self) -> &'static str {
        TYPE_ID
    }

    async fn init(&mut self, descriptor: &ActionDescriptor) -> Result<(), ActionError> {
        self.path = PathBuf::from(descriptor.require_str("path")?);
        self.cwd = descriptor.param_str("cwd").map(PathBuf::from);

        if !Path::new(&self.path).exists() {
            report_missing_tool(&SCRIPT_NOT_FOUND, &self.path.to_string_lossy());
            return Err(anyhow::anyhow!(
                "script action #{}: {:?} does not exist",
                descriptor.id,
                self.path
            )
            .into());
        }
        info!("script action #{} using {:?}", descriptor.id, self.path);
        Ok(())
    }

    async fn add_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        if ttl_of(item, clock::unix_time()) == Ttl::Expired {
            return Ok(());
        }
        self.invoke("addItem", list_type, item).await
    }

    async fn delete_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        self.invoke("deleteItem", list_type, item).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
