//! Backend type registry: type id -> constructor.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    firewalld, html, http_api, ipset, iptables, script, Action, ActionContext, ActionDescriptor,
    FirewalldAction, HtmlAction, HttpApiAction, IpsetAction, IptablesAction, ScriptAction,
};
use crate::error::ActionError;

/// Builds an uninitialized backend.
pub type ActionConstructor = Arc<dyn Fn(&ActionContext) -> Box<dyn Action> + Send + Sync>;

pub struct ActionRegistry {
    ctx: ActionContext,
    constructors: BTreeMap<String, ActionConstructor>,
}

impl ActionRegistry {
    /// Registry without any backend type.
    pub fn empty(ctx: ActionContext) -> Self {
        Self {
            ctx,
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the six built-in backend types.
    pub fn new(ctx: ActionContext) -> Self {
        let mut registry = Self::empty(ctx);
        registry.register(ipset::TYPE_ID, |ctx| Box::new(IpsetAction::new(ctx)));
        registry.register(iptables::TYPE_ID, |ctx| Box::new(IptablesAction::new(ctx)));
        registry.register(firewalld::TYPE_ID, |ctx| Box::new(FirewalldAction::new(ctx)));
        registry.register(script::TYPE_ID, |ctx| Box::new(ScriptAction::new(ctx)));
        registry.register(http_api::TYPE_ID, |ctx| Box::new(HttpApiAction::new(ctx)));
        registry.register(html::TYPE_ID, |ctx| Box::new(HtmlAction::new(ctx)));
        registry
    }

    /// Add or replace a backend type.
    pub fn register<F>(&mut self, type_id: &str, constructor: F)
    where
        F: Fn(&ActionContext) -> Box<dyn Action> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_id.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.constructors.contains_key(type_id)
    }

    pub fn type_ids(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Construct and initialize a backend for `descriptor`.
    ///
    /// An unknown type is fatal. A non-fatal init error is returned alongside
    /// the instance, which the caller registers anyway.
    pub async fn build(
        &self,
        descriptor: &ActionDescriptor,
    ) -> Result<(Box<dyn Action>, Option<ActionError>), ActionError> {
        let constructor = self.constructors.get(&descriptor.action_type).ok_or_else(|| {
            ActionError::fatal(format!(
                "action #{}: unknown type '{}'",
                descriptor.id, descriptor.action_type
            ))
        })?;
        let mut action = constructor(&self.ctx);
        match action.init(descriptor).await {
            Ok(()) => Ok((action, None)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok((action, Some(e))),
        }
    }
}
