//! Presentation-layer callback surface.
//!
//! An operator console (or any other collaborator) observes the relay
//! through these hooks; how it renders them is not the relay's concern.

use std::net::SocketAddr;

use reef_wire::WirePayload;
use tracing::info;

use crate::registry::SessionId;

pub trait RelayObserver: Send {
    fn on_accept(&self, session: SessionId, addr: SocketAddr);
    fn on_message(&self, session: SessionId, payload: &WirePayload);
    fn on_disconnect(&self, session: SessionId);
}

/// Default observer: mirrors the relay's activity into the log stream.
#[derive(Debug, Default)]
pub struct LogObserver;

impl RelayObserver for LogObserver {
    fn on_accept(&self, session: SessionId, addr: SocketAddr) {
        info!(session, %addr, "connection accepted");
    }

    fn on_message(&self, session: SessionId, payload: &WirePayload) {
        info!(
            session,
            system = payload.system_message,
            content = %payload.content,
            "frame dispatched"
        );
    }

    fn on_disconnect(&self, session: SessionId) {
        info!(session, "connection closed");
    }
}
