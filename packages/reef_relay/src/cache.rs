//! Bounded pagination cache.
//!
//! Maps entity uuids to cached entities and keeps an insertion-ordered key
//! sequence with two logical ends: "top" (most recently appended, forward
//! paging) and "bottom" (the oldest anchor). Inserting at capacity evicts
//! exactly one entry from the *opposite* end, so the end actively receiving
//! writes is protected from its own churn. History paging walks adjacent
//! cached entries in O(page) instead of re-querying storage; a miss falls
//! back to the repository layer.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::models::{Message, Room, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Top,
    Bottom,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Top => "top",
            Side::Bottom => "bottom",
        })
    }
}

/// Direction for walking adjacent cached entries; "above" moves toward the
/// top end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relative {
    Above,
    Below,
}

impl fmt::Display for Relative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Relative::Above => "above",
            Relative::Below => "below",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Message,
    Room,
    User,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Message => "message",
            EntityKind::Room => "room",
            EntityKind::User => "user",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntity {
    Message(Message),
    Room(Room),
    User(User),
}

impl CacheEntity {
    pub fn key(&self) -> &str {
        match self {
            CacheEntity::Message(m) => &m.uuid,
            CacheEntity::Room(r) => &r.uuid,
            CacheEntity::User(u) => &u.uuid,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            CacheEntity::Message(_) => EntityKind::Message,
            CacheEntity::Room(_) => EntityKind::Room,
            CacheEntity::User(_) => EntityKind::User,
        }
    }

    /// Room reference for entity types that carry one.
    pub fn room_ref(&self) -> Option<&str> {
        match self {
            CacheEntity::Message(m) => Some(&m.room_uuid),
            CacheEntity::Room(r) => Some(&r.uuid),
            CacheEntity::User(_) => None,
        }
    }
}

/// Not-found is an expected miss (callers fall back to storage); wrong-kind
/// is a caller defect and must surface, never be swallowed.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no cached entry for key `{0}`")]
    NotFound(String),

    #[error("cached entry `{key}` is a {found}, expected a {expected}")]
    WrongKind {
        key: String,
        expected: EntityKind,
        found: EntityKind,
    },

    #[error("nothing {relative} of `{key}` in the cache")]
    Boundary { key: String, relative: Relative },

    #[error("cache holds no entry at the {0} end")]
    EmptyEnd(Side),
}

#[derive(Debug)]
pub struct PageCache {
    max_size: usize,
    entries: HashMap<String, CacheEntity>,
    /// Front is the bottom end, back is the top end.
    order: VecDeque<String>,
}

impl PageCache {
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "cache capacity must be non-zero");
        Self {
            max_size,
            entries: HashMap::with_capacity(max_size),
            order: VecDeque::with_capacity(max_size),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.order.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Insert at the named end. A key already present is repositioned rather
    /// than duplicated; insertion at capacity evicts exactly one entry from
    /// the opposite end first.
    pub fn cache_to(&mut self, side: Side, entity: CacheEntity) {
        let key = entity.key().to_string();

        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.is_full() {
            let evicted = match side {
                Side::Top => self.order.pop_front(),
                Side::Bottom => self.order.pop_back(),
            };
            if let Some(old) = evicted {
                self.entries.remove(&old);
            }
        }

        match side {
            Side::Top => self.order.push_back(key.clone()),
            Side::Bottom => self.order.push_front(key.clone()),
        }
        self.entries.insert(key, entity);
    }

    pub fn get(&self, key: &str) -> Result<&CacheEntity, CacheError> {
        self.entries
            .get(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    pub fn get_message(&self, key: &str) -> Result<&Message, CacheError> {
        match self.get(key)? {
            CacheEntity::Message(m) => Ok(m),
            other => Err(Self::wrong_kind(key, EntityKind::Message, other)),
        }
    }

    pub fn get_room(&self, key: &str) -> Result<&Room, CacheError> {
        match self.get(key)? {
            CacheEntity::Room(r) => Ok(r),
            other => Err(Self::wrong_kind(key, EntityKind::Room, other)),
        }
    }

    pub fn get_user(&self, key: &str) -> Result<&User, CacheError> {
        match self.get(key)? {
            CacheEntity::User(u) => Ok(u),
            other => Err(Self::wrong_kind(key, EntityKind::User, other)),
        }
    }

    fn wrong_kind(key: &str, expected: EntityKind, found: &CacheEntity) -> CacheError {
        CacheError::WrongKind {
            key: key.to_string(),
            expected,
            found: found.kind(),
        }
    }

    /// Overwrite the value at its existing key without moving its position.
    pub fn update(&mut self, entity: CacheEntity) -> Result<(), CacheError> {
        let key = entity.key().to_string();
        if !self.entries.contains_key(&key) {
            return Err(CacheError::NotFound(key));
        }
        self.entries.insert(key, entity);
        Ok(())
    }

    /// The extreme entity at the named end, optionally restricted to one
    /// room. Entities without a room reference never match a room filter.
    pub fn obj_at(&self, side: Side, room: Option<&str>) -> Result<&CacheEntity, CacheError> {
        let mut keys: Box<dyn Iterator<Item = &String>> = match side {
            Side::Top => Box::new(self.order.iter().rev()),
            Side::Bottom => Box::new(self.order.iter()),
        };
        keys.find_map(|k| {
            let entity = &self.entries[k];
            matches_room(entity, room).then_some(entity)
        })
        .ok_or(CacheError::EmptyEnd(side))
    }

    /// The entity adjacent to `key` on the given side, optionally
    /// room-scoped. Walking past the end is a defined edge error.
    pub fn next_obj(
        &self,
        relative: Relative,
        key: &str,
        room: Option<&str>,
    ) -> Result<&CacheEntity, CacheError> {
        let pos = self
            .order
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;

        let mut keys: Box<dyn Iterator<Item = &String>> = match relative {
            Relative::Above => Box::new(self.order.iter().skip(pos + 1)),
            Relative::Below => Box::new(self.order.iter().take(pos).rev()),
        };
        keys.find_map(|k| {
            let entity = &self.entries[k];
            matches_room(entity, room).then_some(entity)
        })
        .ok_or(CacheError::Boundary {
            key: key.to_string(),
            relative,
        })
    }
}

fn matches_room(entity: &CacheEntity, room: Option<&str>) -> bool {
    match room {
        None => true,
        Some(room) => entity.room_ref() == Some(room),
    }
}
