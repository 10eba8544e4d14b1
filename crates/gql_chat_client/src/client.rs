//! Builds the HTTP client and the shared subscription connection from config.

use std::sync::Arc;

use crate::adapter::SubscriptionAdapter;
use crate::api::ApiClient;
use crate::config::{Config, ConfigError};
use crate::transport::{TransportClient, TransportError, TransportOptions};

/// Client construction error.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("subscription connection failed: {0}")]
    Transport(#[from] TransportError),
}

/// Everything an application needs to talk to one workspace. Build it once and
/// pass it around; the subscription connection is shared by every clone.
#[derive(Clone)]
pub struct ChatClients {
    pub api: ApiClient,
    pub subscriptions: SubscriptionAdapter,
    transport: TransportClient,
}

impl ChatClients {
    /// Connects the subscription transport and prepares the HTTP client.
    pub async fn connect(config: &Config) -> Result<Self, ConnectError> {
        let api = ApiClient::from_config(config)?;
        let transport = TransportClient::connect(TransportOptions::from_config(config)?).await?;
        let subscriptions = SubscriptionAdapter::new(Arc::new(transport.clone()));
        Ok(Self {
            api,
            subscriptions,
            transport,
        })
    }

    /// Closes the subscription connection and waits for it to finish.
    pub async fn shutdown(&self) {
        self.subscriptions.close();
        self.transport.terminated().await;
    }
}

/// Shorthand for [`ChatClients::connect`].
pub async fn connect(config: &Config) -> Result<ChatClients, ConnectError> {
    ChatClients::connect(config).await
}
