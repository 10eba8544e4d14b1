//! The fixed set of chat operations and typed views of their results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::OperationPayload;

/// Kind of GraphQL operation a document holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// A GraphQL document known at compile time. Shared by reference; never mutated.
#[derive(Debug, PartialEq, Eq)]
pub struct QueryDescriptor {
    name: &'static str,
    kind: OperationKind,
    source: &'static str,
}

impl QueryDescriptor {
    pub const fn query(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            kind: OperationKind::Query,
            source,
        }
    }

    pub const fn mutation(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            kind: OperationKind::Mutation,
            source,
        }
    }

    pub const fn subscription(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            kind: OperationKind::Subscription,
            source,
        }
    }

    /// Catalog name, used in logs. Not sent to the server: the documents are anonymous.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn to_payload(
        &self,
        variables: Option<serde_json::Map<String, Value>>,
    ) -> OperationPayload {
        OperationPayload {
            query: self.source.to_string(),
            variables,
            operation_name: None,
        }
    }
}

/// All users and the last 10 messages.
pub static INITIAL_CHAT_DATA: QueryDescriptor = QueryDescriptor::query(
    "InitialChatData",
    r#"
  {
    usersList {
      items {
        id
        email
      }
    }
    messagesList(last: 10) {
      items {
        content
        createdAt
        author {
          id
          email
        }
      }
    }
  }
"#,
);

/// Creates a chat user with the Guest role. Variables: `email`.
pub static CREATE_USER: QueryDescriptor = QueryDescriptor::mutation(
    "CreateUser",
    r#"
  mutation($email: String!) {
    userCreate(data: { email: $email, roles: { connect: { name: "Guest" } } }) {
      id
    }
  }
"#,
);

/// Deletes a chat user. Variables: `id`.
pub static DELETE_USER: QueryDescriptor = QueryDescriptor::mutation(
    "DeleteUser",
    r#"
  mutation($id: ID!) {
    userDelete(data: { id: $id, force: true }) {
      success
    }
  }
"#,
);

/// Users created or deleted.
pub static USERS_SUBSCRIPTION: QueryDescriptor = QueryDescriptor::subscription(
    "UsersSubscription",
    r#"
  subscription {
    Users(filter: { mutation_in: [create, delete] }) {
      mutation
      node {
        id
        email
      }
    }
  }
"#,
);

/// Creates a message connected to its author. Variables: `id` (author), `content`.
pub static CREATE_MESSAGE: QueryDescriptor = QueryDescriptor::mutation(
    "CreateMessage",
    r#"
  mutation($id: ID!, $content: String!) {
    messageCreate(
      data: { content: $content, author: { connect: { id: $id } } }
    ) {
      id
    }
  }
"#,
);

/// Messages created.
pub static MESSAGES_SUBSCRIPTION: QueryDescriptor = QueryDescriptor::subscription(
    "MessagesSubscription",
    r#"
  subscription {
    Messages(filter: { mutation_in: create }) {
      node {
        content
        createdAt
        author {
          id
          email
        }
      }
    }
  }
"#,
);

pub static ALL: [&QueryDescriptor; 6] = [
    &INITIAL_CHAT_DATA,
    &CREATE_USER,
    &DELETE_USER,
    &USERS_SUBSCRIPTION,
    &CREATE_MESSAGE,
    &MESSAGES_SUBSCRIPTION,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub author: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct ItemList<T> {
    items: Vec<T>,
}

/// Result of [`INITIAL_CHAT_DATA`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialChatData {
    pub users: Vec<User>,
    pub messages: Vec<Message>,
}

impl InitialChatData {
    pub fn from_data(data: Value) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            users_list: ItemList<User>,
            messages_list: ItemList<Message>,
        }
        let raw: Raw = serde_json::from_value(data)?;
        Ok(Self {
            users: raw.users_list.items,
            messages: raw.messages_list.items,
        })
    }
}

/// Change reported by a subscription filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// One [`USERS_SUBSCRIPTION`] event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserEvent {
    pub mutation: MutationKind,
    pub node: User,
}

impl UserEvent {
    /// Decodes the `data.Users` field of a subscription event.
    pub fn from_event(event: &Value) -> Result<Self, serde_json::Error> {
        UserEvent::deserialize(field(event, "Users"))
    }
}

/// One [`MESSAGES_SUBSCRIPTION`] event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageEvent {
    pub node: Message,
}

impl MessageEvent {
    /// Decodes the `data.Messages` field of a subscription event.
    pub fn from_event(event: &Value) -> Result<Self, serde_json::Error> {
        MessageEvent::deserialize(field(event, "Messages"))
    }
}

fn field<'a>(event: &'a Value, name: &str) -> &'a Value {
    event
        .get("data")
        .and_then(|data| data.get(name))
        .unwrap_or(&Value::Null)
}
