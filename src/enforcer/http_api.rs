//! External HTTP callout backend.
//!
//! Every change is POSTed as JSON to an operator endpoint from a bounded
//! background queue. The response body is drained and discarded.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ttl_of, Action, ActionContext, ActionDescriptor, Ttl, WorkQueue};
use crate::clock;
use crate::error::ActionError;
use crate::iplist::{IpItem, ListType};

pub const TYPE_ID: &str = "http_api";

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_QUEUE_SIZE: usize = 1024;

/// JSON body of one callout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalloutPayload {
    pub action: String,
    pub list_type: String,
    pub item: CalloutItem,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalloutItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub ip_from: String,
    pub ip_to: String,
    pub expired_at: i64,
}

impl CalloutPayload {
    pub fn new(action: &str, list_type: ListType, item: &IpItem) -> Self {
        Self {
            action: action.to_string(),
            list_type: list_type.as_str().to_string(),
            item: CalloutItem {
                item_type: item.family_name().to_string(),
                ip_from: item.ip_from_string(),
                ip_to: item.ip_to_string(),
                expired_at: item.expires_at,
            },
        }
    }
}

pub struct HttpApiAction {
    url: String,
    queue: Option<WorkQueue<CalloutPayload>>,
}

impl HttpApiAction {
    pub fn new(_ctx: &ActionContext) -> Self {
        Self {
            url: String::new(),
            queue: None,
        }
    }

    async fn post(client: &Client, url: &str, payload: &CalloutPayload) -> Result<()> {
        let response = client
            .post(url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to POST {}", url))?;
        let status = response.status();
        // Drain so the connection can be reused
        let _ = response.bytes().await;
        if !status.is_success() {
            anyhow::bail!("POST {} returned HTTP {}", url, status);
        }
        Ok(())
    }

    fn enqueue(&self, payload: CalloutPayload) {
        if let Some(queue) = &self.queue {
            queue.push(payload);
        }
    }
}

#[async_trait]
impl Action for HttpApiAction {
    fn type_id(&self) -> &'static str {
        TYPE_ID
    }

    async fn init(&mut self, descriptor: &ActionDescriptor) -> Result<(), ActionError> {
        let url = descriptor.require_str("url")?.to_string();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ActionError::fatal(format!(
                "http_api action #{}: url must be http:// or https://, got '{}'",
                descriptor.id, url
            )));
        }
        let timeout = descriptor
            .param_u64("timeout_secs")
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let queue_size = descriptor
            .param_u64("queue_size")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_QUEUE_SIZE);

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .user_agent(concat!("edgeacl/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        let worker_url = url.clone();
        self.queue = Some(WorkQueue::spawn(
            format!("http_api #{}", descriptor.id),
            queue_size,
            move |payload: CalloutPayload| {
                let client = client.clone();
                let url = worker_url.clone();
                async move {
                    match Self::post(&client, &url, &payload).await {
                        Ok(()) => debug!("Posted {} for {}", payload.action, payload.item.ip_from),
                        Err(e) => warn!("HTTP callout failed: {:#}", e),
                    }
                }
            },
        ));
        self.url = url;
        info!("http_api action #{} posting to {}", descriptor.id, self.url);
        Ok(())
    }

    async fn add_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        if ttl_of(item, clock::unix_time()) == Ttl::Expired {
            return Ok(());
        }
        self.enqueue(CalloutPayload::new("addItem", list_type, item));
        Ok(())
    }

    async fn delete_item(&self, list_type: ListType, item: &IpItem) -> Result<()> {
        self.enqueue(CalloutPayload::new("deleteItem", list_type, item));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(queue) = &self.queue {
            queue.close().await;
        }
        Ok(())
    }
}
