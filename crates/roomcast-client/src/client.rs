//! Room session event loop.
//!
//! [`RoomClient::connect`] joins a room and spawns a loop that fans server
//! events, negotiator events and caller commands into one place. Embedding
//! UIs hold a [`RoomHandle`]: commands in, [`RoomEvent`]s out.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use roomcast_common::{
    ChatMessage, ClientEvent, ConnectionStatus, Participant, Result, ServerEvent,
};

use crate::negotiator::{IceConfig, LinkState, NegotiationTimeouts, Negotiator, NegotiatorEvent};
use crate::presenter::{CaptureSource, PresenterCoordinator};
use crate::signaling::SignalingChannel;
use crate::track::GuardedRemoteTrack;

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 32;

/// Connection parameters for one room session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:5000/ws`.
    pub server_url: String,
    pub room_id: String,
    pub user_name: String,
    pub ice: IceConfig,
    pub timeouts: NegotiationTimeouts,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        room_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            user_name: user_name.into(),
            ice: IceConfig::default(),
            timeouts: NegotiationTimeouts::default(),
        }
    }
}

/// Caller-issued commands.
#[derive(Debug)]
pub enum RoomCommand {
    StartPresenting,
    StopPresenting,
    SendChat(String),
    Leave,
}

/// Events surfaced to the embedding UI.
#[derive(Debug)]
pub enum RoomEvent {
    RosterUpdated(Vec<Participant>),
    ChatMessage(ChatMessage),
    PresenterStarted {
        presenter_id: String,
        presenter_name: String,
    },
    PresenterStopped {
        presenter_id: String,
    },
    RemoteTrack(GuardedRemoteTrack),
    LinkStateChanged {
        peer_id: String,
        state: LinkState,
    },
    /// The session is over: we left, or the server went away.
    Disconnected,
}

/// Caller-facing handle to a running session.
pub struct RoomHandle {
    self_id: String,
    commands: mpsc::Sender<RoomCommand>,
    events: mpsc::Receiver<RoomEvent>,
}

impl RoomHandle {
    /// Our server-assigned participant id.
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub async fn send(&self, command: RoomCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| roomcast_common::Error::signaling("session loop has exited"))
    }

    /// Next session event; `None` after [`RoomEvent::Disconnected`].
    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }
}

/// Joins rooms and runs session loops.
pub struct RoomClient;

impl RoomClient {
    /// Connect, join `config.room_id`, and hand back the session handle.
    pub async fn connect(
        config: ClientConfig,
        capture: Arc<dyn CaptureSource>,
    ) -> Result<RoomHandle> {
        let mut channel = SignalingChannel::connect(&config.server_url).await?;
        let self_id = channel.connection_id().to_string();
        let sender = channel.sender();

        sender
            .send(&ClientEvent::JoinRoom {
                room_id: config.room_id.clone(),
                user_name: config.user_name.clone(),
            })
            .await?;
        info!(room = %config.room_id, id = %self_id, "joined room");

        let (negotiator_tx, negotiator_rx) = mpsc::channel(EVENT_CAPACITY);
        let negotiator = Negotiator::new(
            config.room_id.clone(),
            self_id.clone(),
            sender.clone(),
            config.ice.clone(),
            config.timeouts,
            negotiator_tx,
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        let session = Session {
            config,
            self_id: self_id.clone(),
            channel,
            negotiator,
            coordinator: PresenterCoordinator::new(capture),
            roster: Vec::new(),
            events: event_tx,
        };
        tokio::spawn(session.run(command_rx, negotiator_rx));

        Ok(RoomHandle {
            self_id,
            commands: command_tx,
            events: event_rx,
        })
    }
}

struct Session {
    config: ClientConfig,
    self_id: String,
    channel: SignalingChannel,
    negotiator: Negotiator,
    coordinator: PresenterCoordinator,
    roster: Vec<Participant>,
    events: mpsc::Sender<RoomEvent>,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<RoomCommand>,
        mut negotiator_events: mpsc::Receiver<NegotiatorEvent>,
    ) {
        loop {
            tokio::select! {
                server_event = self.channel.recv() => {
                    match server_event {
                        Some(event) => {
                            if let Err(err) = self.on_server_event(event).await {
                                warn!("server event handling failed: {}", err);
                            }
                        }
                        None => {
                            info!("signaling connection lost");
                            break;
                        }
                    }
                }
                negotiator_event = negotiator_events.recv() => {
                    match negotiator_event {
                        Some(event) => self.on_negotiator_event(event).await,
                        None => break,
                    }
                }
                command = commands.recv() => {
                    // A dropped handle ends the session like an explicit leave.
                    let command = command.unwrap_or(RoomCommand::Leave);
                    match self.on_command(command).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(err) => warn!("command failed: {}", err),
                    }
                }
            }
        }

        self.coordinator.stop().await;
        self.negotiator.close_all().await;
        let _ = self.events.send(RoomEvent::Disconnected).await;
    }

    async fn on_server_event(&mut self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::SessionBound { connection_id } => {
                debug!(id = %connection_id, "session re-bound");
            }
            ServerEvent::ParticipantsUpdated(roster) => {
                self.roster = roster.clone();
                let _ = self.events.send(RoomEvent::RosterUpdated(roster)).await;
            }
            ServerEvent::NewMessage(message) => {
                let _ = self.events.send(RoomEvent::ChatMessage(message)).await;
            }
            ServerEvent::PresenterStarted {
                presenter_id,
                presenter_name,
            } => {
                // The presenter offers to us; nothing to negotiate yet.
                let _ = self
                    .events
                    .send(RoomEvent::PresenterStarted {
                        presenter_id,
                        presenter_name,
                    })
                    .await;
            }
            ServerEvent::PresenterStopped { presenter_id } => {
                self.negotiator.close_peer(&presenter_id).await;
                let _ = self
                    .events
                    .send(RoomEvent::PresenterStopped { presenter_id })
                    .await;
            }
            ServerEvent::WebrtcOffer { offer, sender_id } => {
                self.negotiator.handle_offer(&sender_id, offer).await?;
            }
            ServerEvent::WebrtcAnswer { answer, sender_id } => {
                self.negotiator.handle_answer(&sender_id, answer).await?;
            }
            ServerEvent::WebrtcIceCandidate {
                candidate,
                sender_id,
            } => {
                self.negotiator.handle_candidate(&sender_id, candidate).await?;
            }
            ServerEvent::RefreshStreamForViewer { viewer_id, .. } => {
                // A viewer reported a dead stream; re-offer if we are the
                // one presenting.
                if self.coordinator.is_presenting().await {
                    info!(viewer = %viewer_id, "re-offering on refresh request");
                    self.negotiator.offer_to(&viewer_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_negotiator_event(&mut self, event: NegotiatorEvent) {
        match event {
            NegotiatorEvent::RemoteTrack(track) => {
                let _ = self.events.send(RoomEvent::RemoteTrack(track)).await;
            }
            NegotiatorEvent::LinkStateChanged { peer_id, state } => {
                if let Some(status) = connection_status_for(state) {
                    let update = ClientEvent::ConnectionStatusUpdate {
                        room_id: self.config.room_id.clone(),
                        status,
                    };
                    if let Err(err) = self.channel.sender().send(&update).await {
                        debug!("status update not sent: {}", err);
                    }
                }
                let _ = self
                    .events
                    .send(RoomEvent::LinkStateChanged { peer_id, state })
                    .await;
            }
        }
    }

    /// Returns `true` when the session should end.
    async fn on_command(&mut self, command: RoomCommand) -> Result<bool> {
        match command {
            RoomCommand::StartPresenting => {
                let tracks = self.coordinator.start().await?;
                self.negotiator.set_local_tracks(tracks).await;
                self.channel
                    .sender()
                    .send(&ClientEvent::StartPresenting {
                        room_id: self.config.room_id.clone(),
                        user_name: self.config.user_name.clone(),
                    })
                    .await?;
                // Offer to everyone already in the room.
                let peers: Vec<String> = self
                    .roster
                    .iter()
                    .filter(|p| p.id != self.self_id)
                    .map(|p| p.id.clone())
                    .collect();
                for peer_id in peers {
                    if let Err(err) = self.negotiator.offer_to(&peer_id).await {
                        warn!(peer = %peer_id, "offer failed: {}", err);
                    }
                }
            }
            RoomCommand::StopPresenting => {
                self.coordinator.stop().await;
                self.negotiator.set_local_tracks(Vec::new()).await;
                self.negotiator.close_initiated().await;
                self.channel
                    .sender()
                    .send(&ClientEvent::StopPresenting {
                        room_id: self.config.room_id.clone(),
                        user_name: self.config.user_name.clone(),
                    })
                    .await?;
            }
            RoomCommand::SendChat(text) => {
                self.channel
                    .sender()
                    .send(&ClientEvent::SendMessage {
                        room_id: self.config.room_id.clone(),
                        message: text,
                        user_name: self.config.user_name.clone(),
                        user_id: None,
                    })
                    .await?;
            }
            RoomCommand::Leave => {
                self.channel
                    .sender()
                    .send(&ClientEvent::LeaveRoom {
                        room_id: self.config.room_id.clone(),
                        user_name: self.config.user_name.clone(),
                    })
                    .await?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Wire-visible status for a link state, `None` for states the room roster
/// does not track.
fn connection_status_for(state: LinkState) -> Option<ConnectionStatus> {
    match state {
        LinkState::Offering | LinkState::Answering | LinkState::Checking => {
            Some(ConnectionStatus::Connecting)
        }
        LinkState::Connected => Some(ConnectionStatus::Connected),
        LinkState::Failed => Some(ConnectionStatus::Failed),
        LinkState::Idle | LinkState::Closed => None,
    }
}
