//! GraphQL chat client for an 8base workspace: the query catalog, an HTTP
//! client for queries and mutations, and callback-based subscriptions over a
//! shared `graphql-ws` connection.

pub mod adapter;
pub mod api;
pub mod catalog;
pub mod client;
pub mod config;
pub mod messages;
pub mod transport;

pub use adapter::{SubscribeOptions, SubscriptionAdapter, SubscriptionHandle};
pub use api::{ApiClient, ApiError};
pub use catalog::{OperationKind, QueryDescriptor};
pub use client::{connect, ChatClients, ConnectError};
pub use config::{default_config_path, Config, ConfigError};
pub use transport::{
    SubscriptionError, SubscriptionTransport, TransportClient, TransportError, TransportEvent,
    TransportOptions,
};
