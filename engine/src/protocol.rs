//! Sync protocol message definitions.
//!
//! JSON-text frames over WebSocket. Every message carries a `type`; messages
//! initiated by the client carry a unique `_id` which the server's reply
//! echoes. Mutation broadcasts are unsolicited and carry no `_id`; the same
//! MUTATE shape sent *with* an `_id` is the originator's ack.

use crate::mutation::{Mutation, Procedure};
use crate::value::EncodedRow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "SUBSCRIBE")]
    Subscribe {
        #[serde(rename = "_id")]
        id: String,
        resource: String,
        /// Raw query object `{where?, include?, orderBy?, limit?}`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<Value>,
    },

    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe {
        #[serde(rename = "_id")]
        id: String,
        #[serde(rename = "subId")]
        sub_id: String,
    },

    #[serde(rename = "MUTATE")]
    Mutate {
        #[serde(rename = "_id")]
        id: String,
        resource: String,
        procedure: Procedure,
        /// Encoded fields, stamped by the submitting client.
        payload: EncodedRow,
        #[serde(rename = "mutationId")]
        mutation_id: String,
        /// Target row; required for UPDATE, derived from the payload's
        /// primary field for INSERT.
        #[serde(
            rename = "resourceId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        resource_id: Option<String>,
    },

    #[serde(rename = "PING")]
    Ping {
        #[serde(rename = "_id")]
        id: String,
    },
}

impl ClientMessage {
    /// The `_id` of this message.
    pub fn id(&self) -> &str {
        match self {
            ClientMessage::Subscribe { id, .. }
            | ClientMessage::Unsubscribe { id, .. }
            | ClientMessage::Mutate { id, .. }
            | ClientMessage::Ping { id } => id,
        }
    }
}

/// Error codes carried by protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Malformed,
    UnknownType,
    UnknownResource,
    UnknownSubscription,
    Validation,
    Auth,
    Storage,
    Unsupported,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "SUBSCRIBED")]
    Subscribed {
        #[serde(rename = "_id")]
        id: String,
        #[serde(rename = "subId")]
        sub_id: String,
        /// Initial query results, inferred shape.
        snapshot: Vec<Value>,
    },

    #[serde(rename = "ERROR")]
    Error {
        /// `_id` of the offending message, when it could be parsed.
        #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: ErrorCode,
        message: String,
    },

    /// Mutation broadcast (no `_id`) or originator ack (`_id` echoed).
    #[serde(rename = "MUTATE")]
    Mutate {
        #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        resource: String,
        #[serde(rename = "resourceId")]
        resource_id: String,
        procedure: Procedure,
        /// The accepted fields with their metadata.
        payload: EncodedRow,
        #[serde(
            rename = "mutationId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        mutation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },

    #[serde(rename = "PONG")]
    Pong {
        #[serde(rename = "_id")]
        id: String,
    },
}

impl ServerMessage {
    /// Build a protocol error keyed to `id`.
    pub fn error(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Build an unsolicited mutation broadcast from a mutation record.
    pub fn broadcast(mutation: &Mutation) -> Self {
        ServerMessage::Mutate {
            id: None,
            resource: mutation.resource.clone(),
            resource_id: mutation.resource_id.clone(),
            procedure: mutation.procedure,
            payload: mutation.payload.clone(),
            mutation_id: mutation.mutation_id.clone(),
            origin: None,
        }
    }

    /// Build the originator's ack for a mutation record.
    pub fn ack(request_id: &str, mutation: &Mutation) -> Self {
        ServerMessage::Mutate {
            id: Some(request_id.to_string()),
            resource: mutation.resource.clone(),
            resource_id: mutation.resource_id.clone(),
            procedure: mutation.procedure,
            payload: mutation.payload.clone(),
            mutation_id: mutation.mutation_id.clone(),
            origin: None,
        }
    }
}
