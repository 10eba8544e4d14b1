//! Request/response GraphQL over HTTP for the chat queries and mutations.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::catalog::{
    InitialChatData, QueryDescriptor, CREATE_MESSAGE, CREATE_USER, DELETE_USER, INITIAL_CHAT_DATA,
};
use crate::config::{Config, ConfigError};
use crate::messages::{join_errors, GraphqlError};

/// HTTP API error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("GraphQL errors: {}", join_errors(.0))]
    Graphql(Vec<GraphqlError>),
    #[error("unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("response has no data")]
    MissingData,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

/// GraphQL client bound to one workspace endpoint.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    url: String,
}

impl ApiClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    /// Client for `{api.endpoint}/{workspace_id}`.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(config.api_url()?))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Runs one operation and returns its `data`. Any entry in `errors` fails
    /// the call, even alongside partial data.
    pub async fn execute(
        &self,
        query: &QueryDescriptor,
        variables: Option<Map<String, Value>>,
    ) -> Result<Value, ApiError> {
        debug!(operation = query.name(), url = %self.url, "sending GraphQL request");
        let response = self
            .http
            .post(&self.url)
            .json(&query.to_payload(variables))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: GraphqlResponse = response.json().await?;
        if !body.errors.is_empty() {
            return Err(ApiError::Graphql(body.errors));
        }
        body.data
            .filter(|data| !data.is_null())
            .ok_or(ApiError::MissingData)
    }

    /// All users and the last 10 messages.
    pub async fn initial_chat_data(&self) -> Result<InitialChatData, ApiError> {
        let data = self.execute(&INITIAL_CHAT_DATA, None).await?;
        Ok(InitialChatData::from_data(data)?)
    }

    /// Creates a Guest user and returns its id.
    pub async fn create_user(&self, email: &str) -> Result<String, ApiError> {
        let data = self
            .execute(&CREATE_USER, Some(variables([("email", email)])))
            .await?;
        created_id(&data, "userCreate")
    }

    /// Force-deletes a user. Returns the server's `success` flag.
    pub async fn delete_user(&self, id: &str) -> Result<bool, ApiError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Deleted {
            user_delete: Success,
        }
        #[derive(Deserialize)]
        struct Success {
            success: bool,
        }

        let data = self
            .execute(&DELETE_USER, Some(variables([("id", id)])))
            .await?;
        let deleted: Deleted = serde_json::from_value(data)?;
        Ok(deleted.user_delete.success)
    }

    /// Posts a message as `author_id` and returns the message id.
    pub async fn create_message(
        &self,
        author_id: &str,
        content: &str,
    ) -> Result<String, ApiError> {
        let data = self
            .execute(
                &CREATE_MESSAGE,
                Some(variables([("id", author_id), ("content", content)])),
            )
            .await?;
        created_id(&data, "messageCreate")
    }
}

fn variables<const N: usize>(pairs: [(&str, &str); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), Value::from(value)))
        .collect()
}

fn created_id(data: &Value, field: &str) -> Result<String, ApiError> {
    #[derive(Deserialize)]
    struct Created {
        id: String,
    }
    let created = Created::deserialize(data.get(field).unwrap_or(&Value::Null))?;
    Ok(created.id)
}
