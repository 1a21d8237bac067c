use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

use super::Repository;
use crate::cache::{CacheEntity, CacheError, PageCache, Side};
use crate::models::{Activity, DELETED_USER_NAME, User};

/// Columns a user lookup may match against. Parsed from the wire `datatype`
/// field, so arbitrary column names never reach the SQL layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserColumn {
    Uuid,
    Name,
    Email,
}

impl UserColumn {
    fn as_sql(self) -> &'static str {
        match self {
            UserColumn::Uuid => "uuid",
            UserColumn::Name => "name",
            UserColumn::Email => "email",
        }
    }
}

impl std::str::FromStr for UserColumn {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "uuid" => Ok(UserColumn::Uuid),
            "name" | "username" => Ok(UserColumn::Name),
            "email" => Ok(UserColumn::Email),
            _ => Err(()),
        }
    }
}

/// Registration failure. The uniqueness variants carry the rejection token
/// sent back to the requesting session.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("email")]
    EmailTaken,

    #[error("username")]
    UsernameTaken,

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

impl RegistrationError {
    /// The wire rejection token, when this is a uniqueness violation.
    pub fn token(&self) -> Option<&'static str> {
        match self {
            RegistrationError::EmailTaken => Some("email"),
            RegistrationError::UsernameTaken => Some("username"),
            RegistrationError::Db(_) => None,
        }
    }
}

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

impl Repository {
    /// Persist a registered user (anonymous users stay session-only) and
    /// cache either kind. Membership defaults to the main room.
    pub async fn add_user(
        &self,
        cache: &mut PageCache,
        user: &mut User,
        password: Option<&str>,
    ) -> Result<()> {
        if user.rooms.is_empty() {
            let main = self.ensure_main_room(cache).await?;
            user.rooms.push(main);
        }

        if !user.anonymous {
            let pwhash = match password {
                Some(plain) => Some(hash_password(plain)?),
                None => None,
            };
            user.password_hash = pwhash.clone();

            sqlx::query(
                "INSERT INTO users (uuid, name, pwhash, friends, email, blockedusers, nickname, status, rooms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&user.uuid)
            .bind(&user.name)
            .bind(&pwhash)
            .bind(user.friends.join(" "))
            .bind(&user.email)
            .bind(user.blocked_users.join(" "))
            .bind(&user.nickname)
            .bind(user.status.to_column())
            .bind(user.room_uuids().join(" "))
            .execute(&self.pool)
            .await
            .context("Failed to insert user")?;
        }

        cache.cache_to(Side::Bottom, CacheEntity::User(user.clone()));
        Ok(())
    }

    /// Register a new user, enforcing unique email then unique username.
    pub async fn register_user(
        &self,
        cache: &mut PageCache,
        email: &str,
        username: &str,
        password: &str,
    ) -> std::result::Result<User, RegistrationError> {
        if self.does_email_exist(email).await? {
            return Err(RegistrationError::EmailTaken);
        }
        if !self.is_username_available(username).await? {
            return Err(RegistrationError::UsernameTaken);
        }

        let mut user = User::registered(username, email);
        self.add_user(cache, &mut user, Some(password)).await?;
        Ok(user)
    }

    /// Cache-first only for uuid lookups; other columns query storage. A
    /// storage hit denormalizes the stored room-uuid list into resolved
    /// rooms and backfills the cache.
    pub async fn fetch_user_by(
        &self,
        cache: &mut PageCache,
        column: UserColumn,
        value: &str,
    ) -> Result<Option<User>> {
        if column == UserColumn::Uuid {
            match cache.get_user(value) {
                Ok(user) => return Ok(Some(user.clone())),
                Err(CacheError::NotFound(_)) => {}
                Err(defect) => return Err(defect.into()),
            }
        }

        let query = format!(
            "SELECT uuid, name, pwhash, friends, email, blockedusers, nickname, status, rooms
             FROM users WHERE {} = ?",
            column.as_sql()
        );
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let room_list: String = row.get("rooms");
        let mut user = user_from_row(&row);
        for room_uuid in room_list.split_whitespace() {
            if let Some(room) = self.fetch_room_by_uuid(cache, room_uuid).await? {
                user.rooms.push(room);
            }
        }

        cache.cache_to(Side::Bottom, CacheEntity::User(user.clone()));
        Ok(Some(user))
    }

    pub async fn fetch_password_hash_by(
        &self,
        column: UserColumn,
        value: &str,
    ) -> Result<Option<String>> {
        let query = format!("SELECT pwhash FROM users WHERE {} = ?", column.as_sql());
        let hash: Option<Option<String>> = sqlx::query_scalar(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash.flatten())
    }

    pub async fn does_email_exist(&self, email: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT email FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn is_username_available(&self, username: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT name FROM users WHERE name = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_none())
    }

    /// Soft delete: the name is replaced with a sentinel and optional fields
    /// are nulled so existing messages keep a resolvable sender.
    pub async fn delete_user(&self, cache: &mut PageCache, user: &User) -> Result<()> {
        sqlx::query(
            "UPDATE users
             SET name = ?, pwhash = NULL, email = NULL, nickname = NULL, status = ?
             WHERE uuid = ?",
        )
        .bind(DELETED_USER_NAME)
        .bind(Activity::Offline.to_column())
        .bind(&user.uuid)
        .execute(&self.pool)
        .await
        .context("Failed to soft-delete user")?;

        let mut tombstone = user.clone();
        tombstone.name = DELETED_USER_NAME.to_string();
        tombstone.nickname = None;
        tombstone.email = None;
        tombstone.password_hash = None;
        tombstone.status = Activity::Offline;

        match cache.update(CacheEntity::User(tombstone)) {
            Ok(()) => {}
            Err(CacheError::NotFound(_)) => debug!(uuid = %user.uuid, "deleted user was not cached"),
            Err(defect) => return Err(defect.into()),
        }
        Ok(())
    }

    pub async fn update_user_status(&self, cache: &mut PageCache, user: &User) -> Result<()> {
        sqlx::query("UPDATE users SET status = ? WHERE uuid = ?")
            .bind(user.status.to_column())
            .bind(&user.uuid)
            .execute(&self.pool)
            .await?;

        match cache.update(CacheEntity::User(user.clone())) {
            Ok(()) => {}
            Err(CacheError::NotFound(_)) => {}
            Err(defect) => return Err(defect.into()),
        }
        Ok(())
    }
}

fn user_from_row(row: &SqliteRow) -> User {
    let friends: String = row.get("friends");
    let blocked: String = row.get("blockedusers");
    User {
        uuid: row.get("uuid"),
        name: row.get("name"),
        nickname: row.get("nickname"),
        anonymous: false,
        status: Activity::from_column(row.get("status")),
        email: row.get("email"),
        password_hash: row.get("pwhash"),
        friends: friends.split_whitespace().map(String::from).collect(),
        blocked_users: blocked.split_whitespace().map(String::from).collect(),
        rooms: Vec::new(),
    }
}
