//! Frame semantics.
//!
//! The dispatcher owns every piece of mutable server state (registry, cache,
//! repository handle) and is driven exclusively by the multiplexer loop
//! task, so none of it needs locking. Each inbound frame is classified once
//! into a directive at the protocol boundary and routed here.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use reef_wire::{
    Directive, GetTarget, JOIN_CONTENT, KICKED_CONTENT, QUERY_CONTENT, Query, ROOMS_CONTENT,
    ROSTER_CONTENT, WirePayload, WireUser,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheEntity, PageCache, Side};
use crate::models::{Activity, Message, User};
use crate::notify::Notifier;
use crate::observer::RelayObserver;
use crate::registry::{Session, SessionId, SessionRegistry};
use crate::repository::{Direction, Repository, UserColumn};

pub struct Dispatcher {
    repository: Repository,
    cache: PageCache,
    registry: SessionRegistry,
    notifier: Box<dyn Notifier>,
    observer: Box<dyn RelayObserver>,
    /// Messages per history page sent on join.
    history_page: i64,
    /// Attributed sender for system broadcasts.
    server_user: User,
}

impl Dispatcher {
    pub fn new(
        repository: Repository,
        cache: PageCache,
        notifier: Box<dyn Notifier>,
        observer: Box<dyn RelayObserver>,
        history_page: i64,
    ) -> Self {
        Self {
            repository,
            cache,
            registry: SessionRegistry::new(),
            notifier,
            observer,
            history_page,
            server_user: User::anonymous("Server"),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn on_accept(
        &mut self,
        id: SessionId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<WirePayload>,
        cancel: CancellationToken,
    ) {
        self.registry.insert(Session::new(id, addr, outbound, cancel));
        self.observer.on_accept(id, addr);
    }

    /// Route one decoded frame. Errors are per-session; the caller logs them
    /// and keeps the loop running.
    pub async fn on_message(&mut self, id: SessionId, payload: WirePayload) -> Result<()> {
        self.observer.on_message(id, &payload);

        let directive = match Directive::classify(payload) {
            Ok(directive) => directive,
            Err(err) => {
                warn!(session = id, error = %err, "dropping unclassifiable frame");
                return Ok(());
            }
        };

        match directive {
            Directive::Join { user } => self.handle_join(id, user).await,
            Directive::Chat {
                content,
                system_message,
                user,
                room,
            } => self.handle_chat(id, &content, system_message, user, room).await,
            Directive::Query(query) => self.handle_query(id, query).await,
            Directive::Kick => {
                // Client-originated kick frames carry no authority.
                warn!(session = id, "ignoring kick frame from client");
                Ok(())
            }
        }
    }

    /// Session teardown: deregister, mark offline, announce the departure.
    pub async fn on_disconnect(&mut self, id: SessionId) -> Result<()> {
        let Some(session) = self.registry.remove(id) else {
            return Ok(());
        };
        session.cancel.cancel();
        self.observer.on_disconnect(id);

        if let Some(mut user) = session.user {
            user.status = Activity::Offline;
            if !user.anonymous {
                self.repository
                    .update_user_status(&mut self.cache, &user)
                    .await?;
            }
            self.announce(format!("{} left.", user.display_name()));
            self.broadcast_roster();
        }
        Ok(())
    }

    /// Administrative kick: targeted notice, forced disconnect, announce.
    pub async fn kick(&mut self, selector: &str) -> Result<()> {
        let Some(session) = self.registry.find_bound(selector) else {
            debug!(selector, "kick target not connected");
            return Ok(());
        };
        let id = session.id;

        session.send(WirePayload::system(
            KICKED_CONTENT,
            self.server_user.to_wire(),
        ));

        // Removing the session drops its outbound sender; the writer task
        // drains the kick notice before closing the socket.
        let Some(session) = self.registry.remove(id) else {
            return Ok(());
        };
        session.cancel.cancel();

        if let Some(mut user) = session.user {
            user.status = Activity::Offline;
            if !user.anonymous {
                self.repository
                    .update_user_status(&mut self.cache, &user)
                    .await?;
            }
            self.announce(format!("{} was kicked.", user.display_name()));
            self.broadcast_roster();
        }
        Ok(())
    }

    async fn handle_join(&mut self, id: SessionId, wire_user: WireUser) -> Result<()> {
        // Registered users resolve to their stored record (room memberships
        // included); everyone else gets admitted as the wire described them,
        // which also seeds the cache so later lookups resolve.
        let stored = if wire_user.anonymous {
            None
        } else {
            self.repository
                .fetch_user_by(&mut self.cache, UserColumn::Uuid, &wire_user.uuid)
                .await?
        };
        let mut user = match stored {
            Some(user) => user,
            None => {
                let mut user = User::from_wire(&wire_user);
                // Identities with no stored record are admitted session-only,
                // whatever the frame claims; the users table is written
                // through registration alone.
                user.anonymous = true;
                self.repository
                    .add_user(&mut self.cache, &mut user, None)
                    .await?;
                user
            }
        };

        user.status = Activity::Online;
        if user.rooms.is_empty() {
            let main = self.repository.ensure_main_room(&mut self.cache).await?;
            user.rooms.push(main);
        }
        if !user.anonymous {
            self.repository
                .update_user_status(&mut self.cache, &user)
                .await?;
        }

        // Reply: the joiner's room list, then a page of recent history for
        // its first room, oldest first.
        if let Some(session) = self.registry.get(id) {
            let rooms: Vec<_> = user.rooms.iter().map(|r| r.to_wire()).collect();
            session.send(
                WirePayload::system(ROOMS_CONTENT, user.to_wire())
                    .with_data(json!(rooms)),
            );
        }
        let home = user.rooms[0].uuid.clone();
        self.send_history_page(id, &home).await?;

        self.registry.bind_user(id, user.clone());

        // Everyone hears about the arrival and gets the new roster.
        self.broadcast_all(WirePayload::system(JOIN_CONTENT, user.to_wire()));
        self.broadcast_roster();
        Ok(())
    }

    async fn send_history_page(&mut self, id: SessionId, room_uuid: &str) -> Result<()> {
        let page = self
            .repository
            .fetch_recent_messages(self.history_page, room_uuid, None, Direction::Before)
            .await?;

        // Backfill newest → oldest at the bottom so the cache's order
        // matches insertion sequence.
        for message in page.iter().rev() {
            self.cache
                .cache_to(Side::Bottom, CacheEntity::Message(message.clone()));
        }

        for message in &page {
            let sender = self
                .repository
                .fetch_user_by(&mut self.cache, UserColumn::Uuid, &message.user_uuid)
                .await?
                .map(|u| u.to_wire())
                .unwrap_or_else(|| self.server_user.to_wire());
            if let Some(session) = self.registry.get(id) {
                session.send(message.to_wire(&sender));
            }
        }
        Ok(())
    }

    async fn handle_chat(
        &mut self,
        id: SessionId,
        content: &str,
        system_message: bool,
        wire_user: WireUser,
        room: Option<String>,
    ) -> Result<()> {
        // The bound identity wins over whatever the frame claims.
        let sender = match self.registry.get(id).and_then(|s| s.user.clone()) {
            Some(user) => user,
            None => {
                warn!(session = id, "chat from unbound session dropped");
                return Ok(());
            }
        };

        let room_uuid = match room {
            Some(room) => room,
            None => match sender.rooms.first() {
                Some(room) => room.uuid.clone(),
                None => {
                    self.repository
                        .ensure_main_room(&mut self.cache)
                        .await?
                        .uuid
                }
            },
        };

        let mut message = Message::new(content, system_message, &room_uuid, &sender.uuid);
        message.seq = Some(
            self.repository
                .add_message(&mut self.cache, &message)
                .await
                .context("persisting chat message")?,
        );
        self.cache
            .cache_to(Side::Top, CacheEntity::Message(message.clone()));

        let payload = message.to_wire(&sender.to_wire());
        self.broadcast_room(&room_uuid, payload);
        Ok(())
    }

    async fn handle_query(&mut self, id: SessionId, query: Query) -> Result<()> {
        let reply = match query {
            Query::Get {
                target,
                column,
                value,
            } => {
                let Ok(column) = column.parse::<UserColumn>() else {
                    warn!(session = id, column = %column, "query against unknown column dropped");
                    return Ok(());
                };
                match target {
                    GetTarget::User => {
                        let user = self
                            .repository
                            .fetch_user_by(&mut self.cache, column, &value)
                            .await?;
                        json!(user.map(|u| u.to_wire()))
                    }
                    GetTarget::Password => {
                        let hash = self
                            .repository
                            .fetch_password_hash_by(column, &value)
                            .await?;
                        json!(hash)
                    }
                }
            }
            Query::Create {
                email,
                username,
                password,
            } => {
                match self
                    .repository
                    .register_user(&mut self.cache, &email, &username, &password)
                    .await
                {
                    Ok(user) => {
                        self.notifier.welcome(&user);
                        json!(user.to_wire())
                    }
                    Err(err) => match err.token() {
                        Some(token) => json!(token),
                        None => return Err(err.into()),
                    },
                }
            }
        };

        if let Some(session) = self.registry.get(id) {
            session.send(
                WirePayload::system(QUERY_CONTENT, self.server_user.to_wire())
                    .with_data(reply),
            );
        }
        Ok(())
    }

    fn announce(&self, text: String) {
        self.broadcast_all(WirePayload::system(text, self.server_user.to_wire()));
    }

    fn broadcast_all(&self, payload: WirePayload) {
        for session in self.registry.iter() {
            session.send(payload.clone());
        }
    }

    fn broadcast_roster(&self) {
        let roster = self.registry.roster();
        self.broadcast_all(
            WirePayload::system(ROSTER_CONTENT, self.server_user.to_wire())
                .with_data(json!(roster)),
        );
    }

    /// Chat messages scope to the room's members; sessions not yet bound
    /// never receive them.
    fn broadcast_room(&self, room_uuid: &str, payload: WirePayload) {
        for session in self.registry.iter() {
            let member = session
                .user
                .as_ref()
                .is_some_and(|u| u.rooms.iter().any(|r| r.uuid == room_uuid));
            if member {
                session.send(payload.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::observer::LogObserver;
    use crate::repository::test_helpers;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn dispatcher() -> (Dispatcher, RecordingNotifier) {
        let repository = test_helpers::test_repository().await;
        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(
            repository,
            PageCache::new(128),
            Box::new(notifier.clone()),
            Box::new(LogObserver),
            10,
        );
        (dispatcher, notifier)
    }

    fn connect(dispatcher: &mut Dispatcher, id: SessionId) -> UnboundedReceiver<WirePayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        dispatcher.on_accept(id, addr, tx, CancellationToken::new());
        rx
    }

    fn join_payload(name: &str) -> WirePayload {
        WirePayload::system(JOIN_CONTENT, User::anonymous(name).to_wire())
    }

    fn drain(rx: &mut UnboundedReceiver<WirePayload>) -> Vec<WirePayload> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(payload);
        }
        out
    }

    fn last_roster(payloads: &[WirePayload]) -> Option<Vec<String>> {
        payloads
            .iter()
            .rev()
            .find(|p| p.content == ROSTER_CONTENT)
            .and_then(|p| p.data.clone())
            .and_then(|d| serde_json::from_value(d).ok())
    }

    #[tokio::test]
    async fn two_joins_converge_on_a_shared_roster() {
        let (mut dispatcher, _) = dispatcher().await;
        let mut rx1 = connect(&mut dispatcher, 1);
        let mut rx2 = connect(&mut dispatcher, 2);

        dispatcher.on_message(1, join_payload("ada")).await.unwrap();
        dispatcher.on_message(2, join_payload("brian")).await.unwrap();

        let roster1 = last_roster(&drain(&mut rx1)).unwrap();
        let roster2 = last_roster(&drain(&mut rx2)).unwrap();
        assert_eq!(roster1, vec!["ada", "brian"]);
        assert_eq!(roster2, roster1);
    }

    #[tokio::test]
    async fn chat_reaches_room_members_only() {
        let (mut dispatcher, _) = dispatcher().await;
        let mut rx1 = connect(&mut dispatcher, 1);
        let mut rx2 = connect(&mut dispatcher, 2);
        let mut rx3 = connect(&mut dispatcher, 3);

        dispatcher.on_message(1, join_payload("ada")).await.unwrap();
        dispatcher.on_message(2, join_payload("brian")).await.unwrap();
        // Session 3 never joins.

        drain(&mut rx1);
        drain(&mut rx2);
        drain(&mut rx3);

        let chat = WirePayload::chat("hello room", User::anonymous("ada").to_wire());
        dispatcher.on_message(1, chat).await.unwrap();

        let seen1 = drain(&mut rx1);
        let seen2 = drain(&mut rx2);
        assert!(seen1.iter().any(|p| p.content == "hello room"));
        assert!(seen2.iter().any(|p| p.content == "hello room"));
        assert!(drain(&mut rx3).is_empty());

        // The message was persisted with its room reference.
        let persisted: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&dispatcher.repository.pool)
            .await
            .unwrap();
        assert_eq!(persisted, 1);
    }

    #[tokio::test]
    async fn join_replays_recent_history_oldest_first() {
        let (mut dispatcher, _) = dispatcher().await;
        let mut rx1 = connect(&mut dispatcher, 1);
        dispatcher.on_message(1, join_payload("ada")).await.unwrap();
        drain(&mut rx1);

        for text in ["one", "two", "three"] {
            let chat = WirePayload::chat(text, User::anonymous("ada").to_wire());
            dispatcher.on_message(1, chat).await.unwrap();
        }

        let mut rx2 = connect(&mut dispatcher, 2);
        dispatcher.on_message(2, join_payload("brian")).await.unwrap();

        let replayed: Vec<String> = drain(&mut rx2)
            .into_iter()
            .filter(|p| p.message_uuid.is_some())
            .map(|p| p.content)
            .collect();
        assert_eq!(replayed, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn unknown_registered_join_stays_session_only() {
        let (mut dispatcher, _) = dispatcher().await;
        let mut rx1 = connect(&mut dispatcher, 1);
        let mut rx2 = connect(&mut dispatcher, 2);

        // Two frames claiming the same persisted name under different uuids,
        // neither of which exists in storage.
        let claimed = |uuid: &str| {
            let mut wire = User::anonymous("ada").to_wire();
            wire.uuid = uuid.to_string();
            wire.anonymous = false;
            WirePayload::system(JOIN_CONTENT, wire)
        };
        dispatcher.on_message(1, claimed("uuid-a")).await.unwrap();
        dispatcher.on_message(2, claimed("uuid-b")).await.unwrap();

        // Both sessions are live, but nothing reached the users table.
        assert_eq!(last_roster(&drain(&mut rx1)).unwrap().len(), 2);
        assert_eq!(last_roster(&drain(&mut rx2)).unwrap().len(), 2);
        let persisted: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE name = 'ada'")
                .fetch_one(&dispatcher.repository.pool)
                .await
                .unwrap();
        assert_eq!(persisted, 0);
    }

    #[tokio::test]
    async fn duplicate_registration_returns_typed_tokens() {
        let (mut dispatcher, notifier) = dispatcher().await;
        let mut rx = connect(&mut dispatcher, 1);

        let create = |email: &str, username: &str| {
            let mut payload =
                WirePayload::system(QUERY_CONTENT, User::anonymous("ada").to_wire());
            payload.create = Some("user".to_string());
            payload.data = Some(json!({
                "email": email,
                "username": username,
                "password": "pw",
            }));
            payload
        };

        dispatcher
            .on_message(1, create("ada@example.com", "ada"))
            .await
            .unwrap();
        dispatcher
            .on_message(1, create("ada@example.com", "other"))
            .await
            .unwrap();
        dispatcher
            .on_message(1, create("fresh@example.com", "ada"))
            .await
            .unwrap();

        let replies: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|p| p.content == QUERY_CONTENT)
            .collect();
        assert_eq!(replies.len(), 3);
        assert!(replies[0].data.as_ref().unwrap().is_object());
        assert_eq!(replies[1].data, Some(json!("email")));
        assert_eq!(replies[2].data, Some(json!("username")));

        // Only the successful registration produced a welcome.
        assert_eq!(notifier.welcomed.lock().unwrap().as_slice(), ["ada"]);
    }

    #[tokio::test]
    async fn kick_notifies_then_removes_the_session() {
        let (mut dispatcher, _) = dispatcher().await;
        let mut rx1 = connect(&mut dispatcher, 1);
        let mut rx2 = connect(&mut dispatcher, 2);

        dispatcher.on_message(1, join_payload("ada")).await.unwrap();
        dispatcher.on_message(2, join_payload("brian")).await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        dispatcher.kick("brian").await.unwrap();

        let to_kicked = drain(&mut rx2);
        assert!(to_kicked.iter().any(|p| p.content == KICKED_CONTENT));

        assert!(dispatcher.registry().find_bound("brian").is_none());
        assert_eq!(dispatcher.registry().len(), 1);

        let survivor = drain(&mut rx1);
        assert!(survivor.iter().any(|p| p.content == "brian was kicked."));
        assert_eq!(last_roster(&survivor).unwrap(), vec!["ada"]);
    }

    #[tokio::test]
    async fn disconnect_announces_departure() {
        let (mut dispatcher, _) = dispatcher().await;
        let mut rx1 = connect(&mut dispatcher, 1);
        let _rx2 = connect(&mut dispatcher, 2);

        dispatcher.on_message(1, join_payload("ada")).await.unwrap();
        dispatcher.on_message(2, join_payload("brian")).await.unwrap();
        drain(&mut rx1);

        dispatcher.on_disconnect(2).await.unwrap();

        let seen = drain(&mut rx1);
        assert!(seen.iter().any(|p| p.content == "brian left."));
        assert_eq!(last_roster(&seen).unwrap(), vec!["ada"]);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_not_fatal() {
        let (mut dispatcher, _) = dispatcher().await;
        let mut rx = connect(&mut dispatcher, 1);

        // Join with no user entity is unclassifiable.
        let mut bad = join_payload("ada");
        bad.user = None;
        dispatcher.on_message(1, bad).await.unwrap();

        // The session is still alive and can join normally afterwards.
        dispatcher.on_message(1, join_payload("ada")).await.unwrap();
        assert_eq!(last_roster(&drain(&mut rx)).unwrap(), vec!["ada"]);
    }
}
