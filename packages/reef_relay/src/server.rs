//! Connection multiplexer.
//!
//! One listener, one event loop. Each accepted socket gets a reader task and
//! a writer task; both talk to the loop only through channels, so the
//! dispatcher's state is touched by exactly one task. Kicks and shutdown
//! arrive over the same event channel via [`RelayHandle`].

use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use reef_wire::{FrameCodec, WirePayload};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::registry::SessionId;

/// Administrative actions, marshalled onto the loop task.
#[derive(Debug)]
pub enum RelayCommand {
    /// Disconnect the session bound to this display name or uuid.
    Kick { selector: String },
    Shutdown,
}

/// Cloneable handle for driving the relay from outside the loop.
#[derive(Clone)]
pub struct RelayHandle {
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl RelayHandle {
    pub fn kick(&self, selector: impl Into<String>) {
        let _ = self.events.send(LoopEvent::Command(RelayCommand::Kick {
            selector: selector.into(),
        }));
    }

    pub fn shutdown(&self) {
        let _ = self
            .events
            .send(LoopEvent::Command(RelayCommand::Shutdown));
    }
}

enum LoopEvent {
    Frame { id: SessionId, payload: WirePayload },
    Closed { id: SessionId },
    Command(RelayCommand),
}

pub struct Relay {
    listener: TcpListener,
    dispatcher: Dispatcher,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
}

impl Relay {
    pub async fn bind(addr: &str, dispatcher: Dispatcher) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            dispatcher,
            events_tx,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("No local address")
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Run until a shutdown command arrives. All dispatcher state is owned
    /// by this task.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr()?, "relay listening");
        let mut next_id: SessionId = 1;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    // Transient accept failures (aborted handshakes, fd
                    // exhaustion) must not take the relay down.
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let id = next_id;
                    next_id += 1;
                    debug!(session = id, %addr, "connection accepted");

                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    let cancel = CancellationToken::new();
                    spawn_connection(id, stream, self.events_tx.clone(), outbound_rx, cancel.clone());
                    self.dispatcher.on_accept(id, addr, outbound_tx, cancel);
                }
                Some(event) = self.events_rx.recv() => match event {
                    LoopEvent::Frame { id, payload } => {
                        if let Err(err) = self.dispatcher.on_message(id, payload).await {
                            warn!(session = id, error = %err, "frame handling failed");
                        }
                    }
                    LoopEvent::Closed { id } => {
                        if let Err(err) = self.dispatcher.on_disconnect(id).await {
                            warn!(session = id, error = %err, "disconnect handling failed");
                        }
                    }
                    LoopEvent::Command(RelayCommand::Kick { selector }) => {
                        if let Err(err) = self.dispatcher.kick(&selector).await {
                            warn!(selector, error = %err, "kick failed");
                        }
                    }
                    LoopEvent::Command(RelayCommand::Shutdown) => {
                        info!("relay shutting down");
                        break;
                    }
                },
            }
        }
        Ok(())
    }
}

/// Reader and writer tasks for one socket.
///
/// The writer drains its channel to the end before closing the write half,
/// so a kick notice queued just before session removal still reaches the
/// client. The reader stops on cancellation, socket close, or a framing
/// error; malformed payloads inside well-formed frames are logged and
/// dropped without ending the connection.
fn spawn_connection(
    id: SessionId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<LoopEvent>,
    mut outbound: mpsc::UnboundedReceiver<WirePayload>,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();

    tokio::spawn(async move {
        let mut framed = FramedWrite::new(write_half, FrameCodec::new());
        while let Some(payload) = outbound.recv().await {
            if let Err(err) = framed.send(payload).await {
                debug!(session = id, error = %err, "write failed");
                return;
            }
        }
        // Sender dropped: everything queued has been flushed.
        let _ = framed.into_inner().shutdown().await;
    });

    tokio::spawn(async move {
        let mut framed = FramedRead::new(read_half, FrameCodec::new());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = framed.next() => match frame {
                    Some(Ok(body)) => match WirePayload::decode(&body) {
                        Ok(payload) => {
                            if events.send(LoopEvent::Frame { id, payload }).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(session = id, error = %err, "dropping malformed payload");
                        }
                    },
                    Some(Err(err)) => {
                        warn!(session = id, error = %err, "framing error, closing connection");
                        break;
                    }
                    None => break,
                },
            }
        }
        let _ = events.send(LoopEvent::Closed { id });
    });
}
