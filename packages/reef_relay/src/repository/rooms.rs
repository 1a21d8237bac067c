use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::Repository;
use crate::cache::{CacheEntity, CacheError, PageCache, Side};
use crate::models::{MAIN_ROOM_NAME, Room};

impl Repository {
    pub async fn create_room(&self, room: &Room) -> Result<()> {
        sqlx::query(
            "INSERT INTO rooms (uuid, name, invitedusers, password, last_message)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&room.uuid)
        .bind(&room.name)
        .bind(room.invited_users.join(" "))
        .bind(&room.password)
        .bind(&room.last_message_uuid)
        .execute(&self.pool)
        .await
        .context("Failed to insert room")?;
        Ok(())
    }

    /// Cache-first room lookup by uuid, backfilling the cache on a storage
    /// hit.
    pub async fn fetch_room_by_uuid(
        &self,
        cache: &mut PageCache,
        uuid: &str,
    ) -> Result<Option<Room>> {
        match cache.get_room(uuid) {
            Ok(room) => return Ok(Some(room.clone())),
            Err(CacheError::NotFound(_)) => {}
            Err(defect) => return Err(defect.into()),
        }

        let row = sqlx::query(
            "SELECT uuid, name, invitedusers, password, last_message FROM rooms WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => {
                let room = room_from_row(&row);
                cache.cache_to(Side::Bottom, CacheEntity::Room(room.clone()));
                Some(room)
            }
            None => None,
        })
    }

    /// Name lookups always hit storage (the cache is keyed by uuid), but the
    /// result is cached for subsequent uuid lookups.
    pub async fn fetch_room_by_name(
        &self,
        cache: &mut PageCache,
        name: &str,
    ) -> Result<Option<Room>> {
        let row = sqlx::query(
            "SELECT uuid, name, invitedusers, password, last_message FROM rooms WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => {
                let room = room_from_row(&row);
                cache.cache_to(Side::Bottom, CacheEntity::Room(room.clone()));
                Some(room)
            }
            None => None,
        })
    }

    /// Fetch the "main" room, creating it idempotently on first access.
    pub async fn ensure_main_room(&self, cache: &mut PageCache) -> Result<Room> {
        if let Some(room) = self.fetch_room_by_name(cache, MAIN_ROOM_NAME).await? {
            return Ok(room);
        }

        let room = Room::new(MAIN_ROOM_NAME);
        sqlx::query(
            "INSERT INTO rooms (uuid, name)
             SELECT ?, ? WHERE NOT EXISTS (SELECT 1 FROM rooms WHERE name = ?)",
        )
        .bind(&room.uuid)
        .bind(&room.name)
        .bind(MAIN_ROOM_NAME)
        .execute(&self.pool)
        .await
        .context("Failed to create main room")?;

        // Re-read in case a concurrent bootstrap won the insert race.
        self.fetch_room_by_name(cache, MAIN_ROOM_NAME)
            .await?
            .context("main room missing after creation")
    }
}

fn room_from_row(row: &SqliteRow) -> Room {
    let invited: String = row.get("invitedusers");
    Room {
        uuid: row.get("uuid"),
        name: row.get("name"),
        invited_users: invited.split_whitespace().map(String::from).collect(),
        password: row.get("password"),
        last_message_uuid: row.get("last_message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_helpers;

    #[tokio::test]
    async fn ensure_main_room_is_idempotent() {
        let repo = test_helpers::test_repository().await;
        let mut cache = PageCache::new(16);

        let first = repo.ensure_main_room(&mut cache).await.unwrap();
        let second = repo.ensure_main_room(&mut cache).await.unwrap();
        assert_eq!(first.uuid, second.uuid);
        assert_eq!(first.name, MAIN_ROOM_NAME);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rooms WHERE name = 'main'")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn uuid_lookup_is_cache_first() {
        let repo = test_helpers::test_repository().await;
        let mut cache = PageCache::new(16);

        let room = Room::new("den");
        repo.create_room(&room).await.unwrap();

        // First fetch goes to storage and backfills the cache.
        let fetched = repo
            .fetch_room_by_uuid(&mut cache, &room.uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.name, "den");
        assert!(cache.get_room(&room.uuid).is_ok());

        // Delete the row; the cached copy still answers.
        sqlx::query("DELETE FROM rooms WHERE uuid = ?")
            .bind(&room.uuid)
            .execute(&repo.pool)
            .await
            .unwrap();
        let cached = repo
            .fetch_room_by_uuid(&mut cache, &room.uuid)
            .await
            .unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn unknown_room_is_none() {
        let repo = test_helpers::test_repository().await;
        let mut cache = PageCache::new(16);
        assert!(
            repo.fetch_room_by_uuid(&mut cache, "nope")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            repo.fetch_room_by_name(&mut cache, "nope")
                .await
                .unwrap()
                .is_none()
        );
    }
}
