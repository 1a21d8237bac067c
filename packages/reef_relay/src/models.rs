use chrono::Utc;
use reef_wire::{WirePayload, WireRoom, WireUser};
use uuid::Uuid;

/// The default room; guaranteed to exist and home to every anonymous user.
pub const MAIN_ROOM_NAME: &str = "main";

/// Sentinel name left behind by a soft delete so old messages keep a valid
/// sender reference.
pub const DELETED_USER_NAME: &str = "$DELETED_USER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Online,
    Offline,
}

impl Activity {
    pub fn as_str(self) -> &'static str {
        match self {
            Activity::Online => "online",
            Activity::Offline => "offline",
        }
    }

    /// Stored as INT in the users table: 1 online, 0 offline.
    pub fn to_column(self) -> i64 {
        match self {
            Activity::Online => 1,
            Activity::Offline => 0,
        }
    }

    pub fn from_column(value: i64) -> Self {
        if value == 0 {
            Activity::Offline
        } else {
            Activity::Online
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("offline") {
            Activity::Offline
        } else {
            Activity::Online
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub uuid: String,
    /// Registered username, or the chosen nickname for anonymous users.
    pub name: String,
    pub nickname: Option<String>,
    pub anonymous: bool,
    pub status: Activity,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub friends: Vec<String>,
    pub blocked_users: Vec<String>,
    /// Resolved room memberships.
    pub rooms: Vec<Room>,
}

impl User {
    /// An ephemeral user created on first contact; never persisted.
    pub fn anonymous(nickname: &str) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: nickname.to_string(),
            nickname: Some(nickname.to_string()),
            anonymous: true,
            status: Activity::Online,
            email: None,
            password_hash: None,
            friends: Vec::new(),
            blocked_users: Vec::new(),
            rooms: Vec::new(),
        }
    }

    pub fn registered(username: &str, email: &str) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: username.to_string(),
            nickname: None,
            anonymous: false,
            status: Activity::Online,
            email: Some(email.to_string()),
            password_hash: None,
            friends: Vec::new(),
            blocked_users: Vec::new(),
            rooms: Vec::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.name)
    }

    pub fn room_uuids(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.uuid.clone()).collect()
    }

    pub fn to_wire(&self) -> WireUser {
        WireUser {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            nickname: self.nickname.clone(),
            anonymous: self.anonymous,
            status: self.status.as_str().to_string(),
            email: self.email.clone(),
            rooms: self.room_uuids(),
        }
    }

    /// Rebuild a user from its wire form. Room memberships stay as bare
    /// uuids until the repository resolves them.
    pub fn from_wire(wire: &WireUser) -> Self {
        Self {
            uuid: wire.uuid.clone(),
            name: wire.name.clone(),
            nickname: wire.nickname.clone(),
            anonymous: wire.anonymous,
            status: Activity::parse(&wire.status),
            email: wire.email.clone(),
            password_hash: None,
            friends: Vec::new(),
            blocked_users: Vec::new(),
            rooms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub uuid: String,
    pub name: String,
    pub invited_users: Vec<String>,
    pub password: Option<String>,
    pub last_message_uuid: Option<String>,
}

impl Room {
    pub fn new(name: &str) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            invited_users: Vec::new(),
            password: None,
            last_message_uuid: None,
        }
    }

    pub fn to_wire(&self) -> WireRoom {
        WireRoom {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Insertion sequence assigned by the database; None before the first
    /// persist.
    pub seq: Option<i64>,
    pub uuid: String,
    pub content: String,
    pub system_message: bool,
    pub created_at: i64,
    pub room_uuid: String,
    pub user_uuid: String,
}

impl Message {
    pub fn new(content: &str, system_message: bool, room_uuid: &str, user_uuid: &str) -> Self {
        Self {
            seq: None,
            uuid: Uuid::new_v4().to_string(),
            content: content.to_string(),
            system_message,
            created_at: Utc::now().timestamp(),
            room_uuid: room_uuid.to_string(),
            user_uuid: user_uuid.to_string(),
        }
    }

    /// Wire payload for this message, attributed to its sender.
    pub fn to_wire(&self, sender: &WireUser) -> WirePayload {
        let mut payload = if self.system_message {
            WirePayload::system(self.content.clone(), sender.clone())
        } else {
            WirePayload::chat(self.content.clone(), sender.clone())
        };
        payload.message_uuid = Some(self.uuid.clone());
        payload.created_at = Some(self.created_at);
        payload.room = Some(self.room_uuid.clone());
        payload
    }
}
