//! Static block page. Holds no network state.

use anyhow::Result;
use async_trait::async_trait;

use super::{Action, ActionContext, ActionDescriptor, BlockPage};
use crate::error::ActionError;
use crate::iplist::{IpItem, ListType};

pub const TYPE_ID: &str = "html";

const DEFAULT_STATUS: u16 = 403;
const DEFAULT_CONTENT: &str = "<html><body><h1>403 Forbidden</h1></body></html>";

pub struct HtmlAction {
    page: BlockPage,
}

impl HtmlAction {
    pub fn new(_ctx: &ActionContext) -> Self {
        Self {
            page: BlockPage {
                status_code: DEFAULT_STATUS,
                body: DEFAULT_CONTENT.to_string(),
            },
        }
    }
}

#[async_trait]
impl Action for HtmlAction {
    fn type_id(&self) -> &'static str {
        TYPE_ID
    }

    async fn init(&mut self, descriptor: &ActionDescriptor) -> Result<(), ActionError> {
        if let Some(content) = descriptor.param_str("content") {
            self.page.body = content.to_string();
        }
        if let Some(code) = descriptor.param_u64("status_code") {
            if !(100..=599).contains(&code) {
                return Err(ActionError::fatal(format!(
                    "html action #{}: invalid status_code {}",
                    descriptor.id, code
                )));
            }
            self.page.status_code = code as u16;
        }
        Ok(())
    }

    async fn add_item(&self, _list_type: ListType, _item: &IpItem) -> Result<()> {
        Ok(())
    }

    async fn delete_item(&self, _list_type: ListType, _item: &IpItem) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn block_page(&self) -> Option<BlockPage> {
        Some(self.page.clone())
    }
}
