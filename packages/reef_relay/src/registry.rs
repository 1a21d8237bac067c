//! Live-connection bookkeeping.
//!
//! One entry per accepted socket, created unbound and filled in when the
//! connection's Join arrives. Only the server loop task touches the
//! registry.

use std::collections::HashMap;
use std::net::SocketAddr;

use reef_wire::WirePayload;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::User;

pub type SessionId = u64;

/// Server-side state for one accepted connection.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    /// Drained by the connection's writer task.
    outbound: mpsc::UnboundedSender<WirePayload>,
    /// Stops the connection's reader task on kick/shutdown.
    pub cancel: CancellationToken,
    pub user: Option<User>,
}

impl Session {
    pub fn new(
        id: SessionId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<WirePayload>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            addr,
            outbound,
            cancel,
            user: None,
        }
    }

    /// Queue a payload for this session. A closed channel means the writer
    /// already went away; the disconnect path will clean the session up.
    pub fn send(&self, payload: WirePayload) {
        if self.outbound.send(payload).is_err() {
            debug!(session = self.id, "dropping payload for closed connection");
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.display_name())
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn bind_user(&mut self, id: SessionId, user: User) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.user = Some(user);
                true
            }
            None => false,
        }
    }

    /// Resolve a kick selector: display name first, then user uuid.
    pub fn find_bound(&self, selector: &str) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.display_name() == Some(selector))
            .or_else(|| {
                self.sessions
                    .values()
                    .find(|s| s.user.as_ref().map(|u| u.uuid.as_str()) == Some(selector))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Display names of every bound session.
    pub fn roster(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .values()
            .filter_map(|s| s.display_name().map(String::from))
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
