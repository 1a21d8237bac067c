//! Versioned JSON payload schema and one-shot directive classification.
//!
//! Schema v1 replaces the opaque object-graph serialization of earlier
//! protocol revisions. Every payload carries an explicit `v` field; a
//! receiver rejects versions it does not understand instead of guessing at
//! field sets.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::WireError;

pub const SCHEMA_VERSION: u8 = 1;

/// System message announcing a session binding its user.
pub const JOIN_CONTENT: &str = "Initial connection.";
/// System message carrying a get/create directive.
pub const QUERY_CONTENT: &str = "Query";
/// Targeted system message sent to a session before it is dropped.
pub const KICKED_CONTENT: &str = "You have been kicked.";
/// System message whose `data` is the current roster of display names.
pub const ROSTER_CONTENT: &str = "Roster";
/// System message whose `data` is the receiving user's room list.
pub const ROOMS_CONTENT: &str = "Rooms";

/// Wire form of a user entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireUser {
    pub uuid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Room uuids the user belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rooms: Vec<String>,
}

fn default_status() -> String {
    "online".to_string()
}

impl WireUser {
    /// Nickname if set, else the registered name.
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.name)
    }
}

/// Wire form of a room entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRoom {
    pub uuid: String,
    pub name: String,
}

/// One decoded frame body.
///
/// `content`, `system_message` and `user` are always meaningful; the
/// remaining fields are contextual (query directives, persisted chat
/// metadata) and omitted from the JSON when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePayload {
    pub v: u8,
    pub content: String,
    pub system_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<WireUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// Room uuid for persisted chat messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl WirePayload {
    pub fn system(content: impl Into<String>, user: WireUser) -> Self {
        Self {
            v: SCHEMA_VERSION,
            content: content.into(),
            system_message: true,
            user: Some(user),
            get: None,
            create: None,
            data: None,
            datatype: None,
            message_uuid: None,
            created_at: None,
            room: None,
        }
    }

    pub fn chat(content: impl Into<String>, user: WireUser) -> Self {
        Self {
            system_message: false,
            ..Self::system(content, user)
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let payload: Self = serde_json::from_slice(body)?;
        if payload.v != SCHEMA_VERSION {
            return Err(WireError::UnsupportedVersion(payload.v));
        }
        Ok(payload)
    }
}

/// What a `get` query is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetTarget {
    User,
    Password,
}

/// A parsed query directive.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Fetch a user record or password hash by column match.
    Get {
        target: GetTarget,
        column: String,
        value: String,
    },
    /// Register a new user.
    Create {
        email: String,
        username: String,
        password: String,
    },
}

#[derive(Deserialize)]
struct CreatePayload {
    email: String,
    username: String,
    password: String,
}

/// The semantic shape of an inbound payload, decided exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Join {
        user: WireUser,
    },
    Chat {
        content: String,
        system_message: bool,
        user: WireUser,
        room: Option<String>,
    },
    Query(Query),
    Kick,
}

impl Directive {
    /// Classify a decoded payload by its semantic shape.
    pub fn classify(payload: WirePayload) -> Result<Self, WireError> {
        if payload.system_message {
            match payload.content.as_str() {
                JOIN_CONTENT => {
                    let user = payload.user.ok_or(WireError::MissingField("user"))?;
                    return Ok(Directive::Join { user });
                }
                QUERY_CONTENT => return classify_query(payload),
                KICKED_CONTENT => return Ok(Directive::Kick),
                _ => {}
            }
        }

        // Anything else, system or not, flows through as a chat line.
        let user = payload.user.ok_or(WireError::MissingField("user"))?;
        Ok(Directive::Chat {
            content: payload.content,
            system_message: payload.system_message,
            user,
            room: payload.room,
        })
    }
}

fn classify_query(payload: WirePayload) -> Result<Directive, WireError> {
    if let Some(get) = payload.get {
        let target = match get.as_str() {
            "user" => GetTarget::User,
            "password" => GetTarget::Password,
            _ => return Err(WireError::UnknownQuery(get)),
        };
        let column = payload.datatype.ok_or(WireError::MissingField("datatype"))?;
        let value = match payload.data {
            Some(serde_json::Value::String(s)) => s,
            _ => return Err(WireError::MissingField("data")),
        };
        return Ok(Directive::Query(Query::Get {
            target,
            column,
            value,
        }));
    }

    if let Some(create) = payload.create {
        if create != "user" {
            return Err(WireError::UnknownQuery(create));
        }
        let data = payload.data.ok_or(WireError::MissingField("data"))?;
        let create: CreatePayload = serde_json::from_value(data)?;
        return Ok(Directive::Query(Query::Create {
            email: create.email,
            username: create.username,
            password: create.password,
        }));
    }

    Err(WireError::UnknownQuery("<none>".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire_user(name: &str) -> WireUser {
        WireUser {
            uuid: format!("uuid-{name}"),
            name: name.to_string(),
            nickname: None,
            anonymous: true,
            status: "online".to_string(),
            email: None,
            rooms: vec![],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let payload = WirePayload::chat("hi there", wire_user("ada"))
            .with_room("room-1")
            .with_data(json!({"k": 1}));
        let bytes = payload.encode().unwrap();
        let back = WirePayload::decode(&bytes).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut payload = WirePayload::chat("hi", wire_user("ada"));
        payload.v = 99;
        let bytes = serde_json::to_vec(&payload).unwrap();
        assert!(matches!(
            WirePayload::decode(&bytes),
            Err(WireError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn join_classifies() {
        let payload = WirePayload::system(JOIN_CONTENT, wire_user("ada"));
        match Directive::classify(payload).unwrap() {
            Directive::Join { user } => assert_eq!(user.name, "ada"),
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn join_without_user_is_malformed() {
        let mut payload = WirePayload::system(JOIN_CONTENT, wire_user("ada"));
        payload.user = None;
        assert!(matches!(
            Directive::classify(payload),
            Err(WireError::MissingField("user"))
        ));
    }

    #[test]
    fn get_user_query_classifies() {
        let mut payload = WirePayload::system(QUERY_CONTENT, wire_user("ada"));
        payload.get = Some("user".to_string());
        payload.datatype = Some("email".to_string());
        payload.data = Some(json!("ada@example.com"));

        match Directive::classify(payload).unwrap() {
            Directive::Query(Query::Get {
                target,
                column,
                value,
            }) => {
                assert_eq!(target, GetTarget::User);
                assert_eq!(column, "email");
                assert_eq!(value, "ada@example.com");
            }
            other => panic!("expected get query, got {other:?}"),
        }
    }

    #[test]
    fn create_user_query_classifies() {
        let mut payload = WirePayload::system(QUERY_CONTENT, wire_user("ada"));
        payload.create = Some("user".to_string());
        payload.data = Some(json!({
            "email": "ada@example.com",
            "username": "ada",
            "password": "hunter2",
        }));

        match Directive::classify(payload).unwrap() {
            Directive::Query(Query::Create {
                email, username, ..
            }) => {
                assert_eq!(email, "ada@example.com");
                assert_eq!(username, "ada");
            }
            other => panic!("expected create query, got {other:?}"),
        }
    }

    #[test]
    fn query_without_directive_is_malformed() {
        let payload = WirePayload::system(QUERY_CONTENT, wire_user("ada"));
        assert!(matches!(
            Directive::classify(payload),
            Err(WireError::UnknownQuery(_))
        ));
    }

    #[test]
    fn plain_message_classifies_as_chat() {
        let payload = WirePayload::chat("hello room", wire_user("ada")).with_room("room-1");
        match Directive::classify(payload).unwrap() {
            Directive::Chat { content, room, .. } => {
                assert_eq!(content, "hello room");
                assert_eq!(room.as_deref(), Some("room-1"));
            }
            other => panic!("expected chat, got {other:?}"),
        }
    }

    #[test]
    fn kick_classifies() {
        let payload = WirePayload::system(KICKED_CONTENT, wire_user("ada"));
        assert_eq!(Directive::classify(payload).unwrap(), Directive::Kick);
    }
}
