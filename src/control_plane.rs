//! Control-plane data contract and HTTP client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::{ControlPlaneConfig, SecureString};
use crate::enforcer::ActionDescriptor;
use crate::error::AclError;
use crate::iplist::{IpItem, ListType};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 1000;

/// Maximum response body accepted from the control plane (64 MB)
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// One versioned change as sent by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDelta {
    pub id: u64,
    #[serde(default)]
    pub ip_from: String,
    #[serde(default)]
    pub ip_to: String,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub expired_at: i64,
    #[serde(default)]
    pub event_level: String,
    pub version: i64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub list_id: u64,
    /// `None` when the control plane sent a list type this node does not
    /// know; such a delta is skipped but still advances the cursor.
    #[serde(default = "default_list_type", deserialize_with = "lenient_list_type")]
    pub list_type: Option<ListType>,
    #[serde(default)]
    pub is_global: bool,
}

fn default_list_type() -> Option<ListType> {
    Some(ListType::default())
}

fn lenient_list_type<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<ListType>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(default_list_type()),
        raw => Ok(ListType::deserialize(raw).ok()),
    }
}

impl ItemDelta {
    /// The item this delta carries.
    pub fn to_item(&self) -> Result<IpItem, AclError> {
        let list_type = self
            .list_type
            .ok_or_else(|| AclError::ControlPlane(format!("item #{} has an unknown list type", self.id)))?;
        let mut item = IpItem::from_strings(self.id, &self.item_type, &self.ip_from, &self.ip_to)?
            .with_expires_at(self.expired_at)
            .with_event_level(self.event_level.clone())
            .with_list(list_type, self.list_id, self.is_global);
        item.version = self.version;
        Ok(item)
    }
}

/// Source of ACL items and backend descriptors.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Deltas with version greater than `version`, at most `size` of them.
    /// An empty page means the node is caught up.
    async fn fetch_items(&self, version: i64, size: u32) -> Result<Vec<ItemDelta>>;

    /// Current enforcement backend descriptors for this node.
    async fn fetch_actions(&self) -> Result<Vec<ActionDescriptor>>;
}

/// JSON-over-HTTP control plane client.
pub struct HttpControlPlane {
    client: Client,
    endpoint: String,
    node_id: String,
    secret: SecureString,
    retry_delay: Duration,
}

impl HttpControlPlane {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(format!("edgeacl/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            node_id: config.node_id.clone(),
            secret: config.get_secret(),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Base delay between retries, doubled after each failed attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// GET `url` and decode JSON, with retry logic and size validation
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1));
                debug!("Retry {} after {:?} for {}", attempt, delay, url);
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .get(url)
                .header("X-Node-Id", &self.node_id)
                .header("X-Node-Secret", self.secret.as_str())
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {
                    if let Some(len) = response.content_length() {
                        if len as usize > MAX_RESPONSE_SIZE {
                            anyhow::bail!("Response too large: {} bytes", len);
                        }
                    }
                    let body = response
                        .bytes()
                        .await
                        .context("Failed to read response body")?;
                    return serde_json::from_slice(&body)
                        .with_context(|| format!("Failed to decode response from {}", url));
                }
                Ok(response) => {
                    last_error = Some(AclError::ControlPlane(format!(
                        "{} returned HTTP {}",
                        url,
                        response.status()
                    )));
                }
                Err(e) => {
                    last_error = Some(AclError::ControlPlane(format!("{}: {}", url, e)));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AclError::ControlPlane("Unknown error".to_string()))
            .into())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_items(&self, version: i64, size: u32) -> Result<Vec<ItemDelta>> {
        let url = format!(
            "{}/ip-items?version={}&size={}",
            self.endpoint, version, size
        );
        let page: Vec<Value> = self.get_json(&url).await?;
        Ok(page
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<ItemDelta>(raw) {
                Ok(delta) => Some(delta),
                Err(e) => {
                    warn!("Dropping undecodable item delta: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn fetch_actions(&self) -> Result<Vec<ActionDescriptor>> {
        let url = format!("{}/ip-actions", self.endpoint);
        self.get_json(&url).await
    }
}
