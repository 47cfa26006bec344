use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::sync::RwLock;

use crate::adapters::Notifier;
use crate::support::truncate_utf8;

const MAX_CONTENT_BYTES: usize = 2000;
const MAX_DESCRIPTION_BYTES: usize = 4096;

/// Chat context a command came from (a guild, a channel, a room...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ContextId(pub String);

/// Where notices for a context are delivered (a webhook URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Destination(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: Option<String>,
    pub description: String,
    pub color: Option<u32>,
}

impl Notice {
    pub fn text(description: impl Into<String>) -> Self {
        Self {
            title: None,
            description: description.into(),
            color: None,
        }
    }

    pub fn embed(title: impl Into<String>, color: u32, description: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            description: description.into(),
            color: Some(color),
        }
    }
}

/// One destination per chat context; last registration wins, entries are
/// never removed.
#[derive(Clone, Default)]
pub struct NotificationRegistry {
    inner: Arc<RwLock<HashMap<ContextId, Destination>>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the destination this context pointed at before, if any.
    pub async fn register(&self, context: ContextId, destination: Destination) -> Option<Destination> {
        self.inner.write().await.insert(context, destination)
    }

    pub async fn get(&self, context: &ContextId) -> Option<Destination> {
        self.inner.read().await.get(context).cloned()
    }

    /// Distinct destinations across all contexts.
    pub async fn destinations(&self) -> Vec<Destination> {
        let mut out: Vec<Destination> = self.inner.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.dedup();
        out
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Posts notices to chat webhooks (Discord-compatible payloads).
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("beacon-control/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .context("build webhook client")?;
        Ok(Self { client })
    }
}

pub(crate) fn webhook_payload(notice: &Notice) -> serde_json::Value {
    match &notice.title {
        None => serde_json::json!({
            "content": truncate_utf8(&notice.description, MAX_CONTENT_BYTES),
        }),
        Some(title) => {
            let mut embed = serde_json::json!({
                "title": title,
                "description": truncate_utf8(&notice.description, MAX_DESCRIPTION_BYTES),
            });
            if let Some(color) = notice.color {
                embed["color"] = serde_json::json!(color);
            }
            serde_json::json!({ "embeds": [embed] })
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, destination: &Destination, notice: &Notice) -> anyhow::Result<()> {
        self.client
            .post(&destination.0)
            .json(&webhook_payload(notice))
            .send()
            .await
            .context("post webhook")?
            .error_for_status()
            .context("webhook rejected notice")?;
        Ok(())
    }
}
