//! Per-peer connection negotiation.
//!
//! One [`LinkMachine`] per remote peer tracks where negotiation stands and
//! decides what to do on failure: the first failure in a session rebuilds
//! the connection restricted to TURN relay candidates, the second is
//! terminal. The machine is pure (no I/O, injectable clock); [`Negotiator`]
//! wires it to real peer connections and the signaling channel.
//!
//! Only the offering side can restart an offer/answer exchange, so a viewer
//! that escalates to relay-only asks the presenter to re-offer via
//! `request-stream-refresh` instead of offering itself.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use roomcast_common::{ClientEvent, Error, Result};

use crate::signaling::SignalSender;
use crate::track::{GuardedRemoteTrack, GuardedTrack, ReleaseFlag};

/// Internal signal channel depth; candidate bursts stay well under this.
const SIGNAL_CAPACITY: usize = 256;

/// A TURN server with long-term credentials.
#[derive(Debug, Clone)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// ICE server inventory used to build peer connections.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: vec![TurnServer {
                urls: vec![
                    "turn:openrelay.metered.ca:80".to_string(),
                    "turn:openrelay.metered.ca:443".to_string(),
                    "turn:openrelay.metered.ca:443?transport=tcp".to_string(),
                ],
                username: "openrelayproject".to_string(),
                credential: "openrelayproject".to_string(),
            }],
        }
    }
}

/// Candidate-gathering restriction for one negotiation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IceMode {
    /// Host, server-reflexive and relay candidates.
    Open,
    /// Relay candidates only; used after a failed open attempt.
    RelayOnly,
}

/// Deadlines governing the escalation policy.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationTimeouts {
    /// How long a negotiation may sit unconnected before it is failed.
    pub check_timeout: Duration,
    /// Pause before rebuilding after a failure.
    pub retry_backoff: Duration,
}

impl Default for NegotiationTimeouts {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Which side of the offer/answer exchange this link plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkRole {
    Offerer,
    Answerer,
}

/// Observable state of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No negotiation in flight (also the resting state between a failure
    /// and its relay-only rebuild).
    Idle,
    Offering,
    Answering,
    Checking,
    Connected,
    /// Terminal: the relay-only retry was already spent.
    Failed,
    Closed,
}

/// What the driver must do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkCommand {
    RebuildRelayOnly { backoff: Duration },
    SurfaceFailed,
}

/// Pure negotiation state machine for a single peer.
///
/// Holds the one-retry escalation budget across rebuilds; the async side
/// keeps the same machine when it replaces the underlying peer connection.
#[derive(Debug)]
pub(crate) struct LinkMachine {
    state: LinkState,
    mode: IceMode,
    relay_retry_used: bool,
    deadline: Option<Instant>,
    timeouts: NegotiationTimeouts,
}

impl LinkMachine {
    pub(crate) fn new(timeouts: NegotiationTimeouts) -> Self {
        Self {
            state: LinkState::Idle,
            mode: IceMode::Open,
            relay_retry_used: false,
            deadline: None,
            timeouts,
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        self.state
    }

    pub(crate) fn mode(&self) -> IceMode {
        self.mode
    }

    /// Start a negotiation attempt. Returns the deadline to arm.
    pub(crate) fn begin(&mut self, role: LinkRole, now: Instant) -> Instant {
        self.state = match role {
            LinkRole::Offerer => LinkState::Offering,
            LinkRole::Answerer => LinkState::Answering,
        };
        let deadline = now + self.timeouts.check_timeout;
        self.deadline = Some(deadline);
        deadline
    }

    /// ICE entered its checking phase. Re-arms the deadline so a slow
    /// signaling round trip does not eat into the checking budget; returns
    /// the new deadline to arm.
    pub(crate) fn on_checking(&mut self, now: Instant) -> Option<Instant> {
        match self.state {
            LinkState::Offering | LinkState::Answering => {
                self.state = LinkState::Checking;
                let deadline = now + self.timeouts.check_timeout;
                self.deadline = Some(deadline);
                Some(deadline)
            }
            _ => None,
        }
    }

    pub(crate) fn on_connected(&mut self) -> bool {
        match self.state {
            LinkState::Offering
            | LinkState::Answering
            | LinkState::Checking
            | LinkState::Idle => {
                self.state = LinkState::Connected;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// The link failed (ICE failure or deadline expiry). Spends the relay
    /// retry if it is still available; otherwise the failure is terminal.
    pub(crate) fn on_failure(&mut self) -> Option<LinkCommand> {
        match self.state {
            LinkState::Failed | LinkState::Closed | LinkState::Idle => None,
            _ => {
                self.deadline = None;
                if self.relay_retry_used {
                    self.state = LinkState::Failed;
                    Some(LinkCommand::SurfaceFailed)
                } else {
                    self.relay_retry_used = true;
                    self.mode = IceMode::RelayOnly;
                    self.state = LinkState::Idle;
                    Some(LinkCommand::RebuildRelayOnly {
                        backoff: self.timeouts.retry_backoff,
                    })
                }
            }
        }
    }

    /// A previously armed deadline fired. Stale timers (connection made or
    /// link already torn down) are ignored.
    pub(crate) fn on_deadline(&mut self, now: Instant) -> Option<LinkCommand> {
        match (self.state, self.deadline) {
            (
                LinkState::Offering | LinkState::Answering | LinkState::Checking,
                Some(deadline),
            ) if now >= deadline => self.on_failure(),
            _ => None,
        }
    }

    pub(crate) fn close(&mut self) {
        self.state = LinkState::Closed;
        self.deadline = None;
    }
}

/// Events surfaced to the embedding client loop.
#[derive(Debug)]
pub enum NegotiatorEvent {
    /// A remote media track arrived from `peer_id`.
    RemoteTrack(GuardedRemoteTrack),
    LinkStateChanged { peer_id: String, state: LinkState },
}

/// Signals from peer-connection callbacks and timers into the driver task.
///
/// Callbacks capture only a sender clone and the peer id, never the link
/// table, so dropping the negotiator tears everything down.
enum LinkSignal {
    IceCandidate {
        peer_id: String,
        candidate: RTCIceCandidateInit,
    },
    IceChecking {
        peer_id: String,
    },
    StateConnected {
        peer_id: String,
    },
    StateFailed {
        peer_id: String,
    },
    RemoteTrack {
        peer_id: String,
        track: Arc<TrackRemote>,
    },
    CheckTimeout {
        peer_id: String,
        attempt: u64,
    },
}

struct PeerLink {
    pc: Option<Arc<RTCPeerConnection>>,
    role: LinkRole,
    machine: LinkMachine,
    /// Bumped on every (re)build; timers carry the value they were armed
    /// with so expiries for torn-down attempts are discarded.
    attempt: u64,
    remote_ready: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
    /// Release flags of every remote track surfaced by the current
    /// connection; released whenever that connection is discarded.
    remote_tracks: Vec<ReleaseFlag>,
}

impl PeerLink {
    /// Drop the current peer connection and release every remote track it
    /// produced. The machine, and with it the retry budget, survives.
    async fn discard_connection(&mut self) {
        if let Some(pc) = self.pc.take() {
            let _ = pc.close().await;
        }
        for track in self.remote_tracks.drain(..) {
            track.release();
        }
        self.remote_ready = false;
        self.pending_candidates.clear();
    }
}

struct Inner {
    room_id: String,
    local_id: String,
    signals: SignalSender,
    ice: IceConfig,
    timeouts: NegotiationTimeouts,
    links: Mutex<HashMap<String, PeerLink>>,
    local_tracks: Mutex<Vec<GuardedTrack>>,
    link_tx: mpsc::Sender<LinkSignal>,
    events: mpsc::Sender<NegotiatorEvent>,
}

/// Drives one peer connection per remote participant.
#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<Inner>,
}

impl Negotiator {
    pub fn new(
        room_id: impl Into<String>,
        local_id: impl Into<String>,
        signals: SignalSender,
        ice: IceConfig,
        timeouts: NegotiationTimeouts,
        events: mpsc::Sender<NegotiatorEvent>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::channel(SIGNAL_CAPACITY);
        let inner = Arc::new(Inner {
            room_id: room_id.into(),
            local_id: local_id.into(),
            signals,
            ice,
            timeouts,
            links: Mutex::new(HashMap::new()),
            local_tracks: Mutex::new(Vec::new()),
            link_tx,
            events,
        });
        tokio::spawn(drive(Arc::downgrade(&inner), link_rx));
        Self { inner }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Replace the set of local tracks attached to future peer connections.
    pub async fn set_local_tracks(&self, tracks: Vec<GuardedTrack>) {
        *self.inner.local_tracks.lock().await = tracks;
    }

    /// Open (or rebuild) a link to `peer_id` and send an offer.
    pub async fn offer_to(&self, peer_id: &str) -> Result<()> {
        send_offer(&self.inner, peer_id).await
    }

    /// An offer arrived from `sender_id`: build the answering side.
    pub async fn handle_offer(&self, sender_id: &str, offer: serde_json::Value) -> Result<()> {
        let inner = &self.inner;
        let offer: RTCSessionDescription =
            serde_json::from_value(offer).map_err(Error::serialization)?;

        let mut links = inner.links.lock().await;
        let link = links.entry(sender_id.to_string()).or_insert_with(|| {
            new_link(LinkRole::Answerer, inner.timeouts)
        });
        // A re-offer for an existing link replaces the peer connection but
        // keeps the machine, so the escalation budget carries over.
        link.discard_connection().await;
        link.role = LinkRole::Answerer;
        link.attempt += 1;

        let pc = build_peer_connection(inner, sender_id, link.machine.mode()).await?;
        attach_local_tracks(inner, &pc).await?;

        pc.set_remote_description(offer)
            .await
            .map_err(Error::negotiation)?;
        link.remote_ready = true;

        let answer = pc.create_answer(None).await.map_err(Error::negotiation)?;
        pc.set_local_description(answer)
            .await
            .map_err(Error::negotiation)?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::negotiation("missing local description after answer"))?;

        link.pc = Some(pc);
        let deadline = link.machine.begin(LinkRole::Answerer, Instant::now());
        arm_deadline(inner, sender_id, link.attempt, deadline);
        let state = link.machine.state();
        drop(links);

        emit_state(inner, sender_id, state).await;
        inner
            .signals
            .send(&ClientEvent::WebrtcAnswer {
                room_id: inner.room_id.clone(),
                answer: serde_json::to_value(&local).map_err(Error::serialization)?,
                target_id: sender_id.to_string(),
            })
            .await
    }

    /// An answer arrived for an offer we sent.
    pub async fn handle_answer(&self, sender_id: &str, answer: serde_json::Value) -> Result<()> {
        let answer: RTCSessionDescription =
            serde_json::from_value(answer).map_err(Error::serialization)?;

        let mut links = self.inner.links.lock().await;
        let link = links
            .get_mut(sender_id)
            .ok_or_else(|| Error::not_found(format!("no link for peer {sender_id}")))?;
        let pc = link
            .pc
            .clone()
            .ok_or_else(|| Error::negotiation("answer for a torn-down connection"))?;
        pc.set_remote_description(answer)
            .await
            .map_err(Error::negotiation)?;
        link.remote_ready = true;
        let pending = std::mem::take(&mut link.pending_candidates);
        drop(links);

        for candidate in pending {
            if let Err(err) = pc.add_ice_candidate(candidate).await {
                warn!(peer = sender_id, "buffered candidate rejected: {}", err);
            }
        }
        Ok(())
    }

    /// A trickled remote candidate. Buffered until the remote description
    /// is in place; silently dropped for unknown peers (late trickle after
    /// teardown is routine).
    pub async fn handle_candidate(
        &self,
        sender_id: &str,
        candidate: serde_json::Value,
    ) -> Result<()> {
        let candidate: RTCIceCandidateInit =
            serde_json::from_value(candidate).map_err(Error::serialization)?;

        let mut links = self.inner.links.lock().await;
        let Some(link) = links.get_mut(sender_id) else {
            debug!(peer = sender_id, "candidate for unknown peer dropped");
            return Ok(());
        };
        if !link.remote_ready {
            link.pending_candidates.push(candidate);
            return Ok(());
        }
        let Some(pc) = link.pc.clone() else {
            return Ok(());
        };
        drop(links);

        pc.add_ice_candidate(candidate)
            .await
            .map_err(Error::negotiation)
    }

    /// Tear down the link to one peer and release its remote tracks.
    pub async fn close_peer(&self, peer_id: &str) {
        let removed = self.inner.links.lock().await.remove(peer_id);
        if let Some(mut link) = removed {
            link.machine.close();
            link.discard_connection().await;
            emit_state(&self.inner, peer_id, LinkState::Closed).await;
        }
    }

    pub async fn close_all(&self) {
        let peers: Vec<String> = self.inner.links.lock().await.keys().cloned().collect();
        for peer_id in peers {
            self.close_peer(&peer_id).await;
        }
    }

    /// Tear down only the links we offered on, leaving links where we are
    /// the viewer intact. Used when the local presentation stops.
    pub async fn close_initiated(&self) {
        let peers: Vec<String> = self
            .inner
            .links
            .lock()
            .await
            .iter()
            .filter(|(_, link)| link.role == LinkRole::Offerer)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in peers {
            self.close_peer(&peer_id).await;
        }
    }
}

fn new_link(role: LinkRole, timeouts: NegotiationTimeouts) -> PeerLink {
    PeerLink {
        pc: None,
        role,
        machine: LinkMachine::new(timeouts),
        attempt: 0,
        remote_ready: false,
        pending_candidates: Vec::new(),
        remote_tracks: Vec::new(),
    }
}

fn rtc_configuration(mode: IceMode, ice: &IceConfig) -> RTCConfiguration {
    let mut ice_servers = Vec::new();
    if mode == IceMode::Open {
        for url in &ice.stun_urls {
            ice_servers.push(RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            });
        }
    }
    for turn in &ice.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }
    RTCConfiguration {
        ice_servers,
        ice_transport_policy: match mode {
            IceMode::Open => RTCIceTransportPolicy::All,
            IceMode::RelayOnly => RTCIceTransportPolicy::Relay,
        },
        ..Default::default()
    }
}

async fn build_peer_connection(
    inner: &Arc<Inner>,
    peer_id: &str,
    mode: IceMode,
) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(Error::negotiation)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(Error::negotiation)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(rtc_configuration(mode, &inner.ice))
            .await
            .map_err(Error::negotiation)?,
    );
    info!(peer = peer_id, ?mode, "peer connection built");

    let tx = inner.link_tx.clone();
    let id = peer_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx
                        .send(LinkSignal::IceCandidate {
                            peer_id: id,
                            candidate: init,
                        })
                        .await;
                }
                Err(err) => warn!("failed to serialize local candidate: {}", err),
            }
        })
    }));

    let tx = inner.link_tx.clone();
    let id = peer_id.to_string();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            if state == RTCIceConnectionState::Checking {
                let _ = tx.send(LinkSignal::IceChecking { peer_id: id }).await;
            }
        })
    }));

    let tx = inner.link_tx.clone();
    let id = peer_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        let id = id.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Connected => {
                    let _ = tx.send(LinkSignal::StateConnected { peer_id: id }).await;
                }
                RTCPeerConnectionState::Failed => {
                    let _ = tx.send(LinkSignal::StateFailed { peer_id: id }).await;
                }
                other => debug!(peer = %id, "peer connection state: {}", other),
            }
        })
    }));

    let tx = inner.link_tx.clone();
    let id = peer_id.to_string();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let _ = tx.send(LinkSignal::RemoteTrack { peer_id: id, track }).await;
            })
        },
    ));

    Ok(pc)
}

async fn attach_local_tracks(inner: &Arc<Inner>, pc: &Arc<RTCPeerConnection>) -> Result<()> {
    let tracks = inner.local_tracks.lock().await.clone();
    for guard in tracks {
        let Some(handle) = guard.handle() else { continue };
        let track: Arc<dyn TrackLocal + Send + Sync> = handle;
        let rtp_sender = pc.add_track(track).await.map_err(Error::negotiation)?;
        // Drain RTCP so the interceptors keep running.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut buf).await {}
        });
    }
    Ok(())
}

/// Build (or rebuild) the offering side of a link and send the offer.
async fn send_offer(inner: &Arc<Inner>, peer_id: &str) -> Result<()> {
    let mut links = inner.links.lock().await;
    let link = links
        .entry(peer_id.to_string())
        .or_insert_with(|| new_link(LinkRole::Offerer, inner.timeouts));
    link.discard_connection().await;
    link.role = LinkRole::Offerer;
    link.attempt += 1;

    let pc = build_peer_connection(inner, peer_id, link.machine.mode()).await?;
    attach_local_tracks(inner, &pc).await?;

    let offer = pc.create_offer(None).await.map_err(Error::negotiation)?;
    pc.set_local_description(offer)
        .await
        .map_err(Error::negotiation)?;
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| Error::negotiation("missing local description after offer"))?;

    link.pc = Some(pc);
    let deadline = link.machine.begin(LinkRole::Offerer, Instant::now());
    arm_deadline(inner, peer_id, link.attempt, deadline);
    let state = link.machine.state();
    drop(links);

    emit_state(inner, peer_id, state).await;
    inner
        .signals
        .send(&ClientEvent::WebrtcOffer {
            room_id: inner.room_id.clone(),
            offer: serde_json::to_value(&local).map_err(Error::serialization)?,
            target_id: peer_id.to_string(),
        })
        .await
}

fn arm_deadline(inner: &Arc<Inner>, peer_id: &str, attempt: u64, deadline: Instant) {
    let tx = inner.link_tx.clone();
    let peer_id = peer_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        let _ = tx.send(LinkSignal::CheckTimeout { peer_id, attempt }).await;
    });
}

async fn emit_state(inner: &Arc<Inner>, peer_id: &str, state: LinkState) {
    let _ = inner
        .events
        .send(NegotiatorEvent::LinkStateChanged {
            peer_id: peer_id.to_string(),
            state,
        })
        .await;
}

/// Consumes link signals. Holds only a weak reference so dropping the last
/// [`Negotiator`] clone ends the task.
async fn drive(inner: Weak<Inner>, mut rx: mpsc::Receiver<LinkSignal>) {
    while let Some(signal) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match signal {
            LinkSignal::IceCandidate { peer_id, candidate } => {
                let payload = match serde_json::to_value(&candidate) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("candidate serialization failed: {}", err);
                        continue;
                    }
                };
                let live = {
                    let links = inner.links.lock().await;
                    links
                        .get(&peer_id)
                        .is_some_and(|link| link.machine.state() != LinkState::Closed)
                };
                if live {
                    let _ = inner
                        .signals
                        .send(&ClientEvent::WebrtcIceCandidate {
                            room_id: inner.room_id.clone(),
                            candidate: payload,
                            target_id: peer_id,
                        })
                        .await;
                }
            }
            LinkSignal::IceChecking { peer_id } => {
                let rearmed = {
                    let mut links = inner.links.lock().await;
                    links.get_mut(&peer_id).and_then(|link| {
                        link.machine
                            .on_checking(Instant::now())
                            .map(|deadline| (link.attempt, deadline))
                    })
                };
                if let Some((attempt, deadline)) = rearmed {
                    arm_deadline(&inner, &peer_id, attempt, deadline);
                    emit_state(&inner, &peer_id, LinkState::Checking).await;
                }
            }
            LinkSignal::StateConnected { peer_id } => {
                let changed = {
                    let mut links = inner.links.lock().await;
                    links
                        .get_mut(&peer_id)
                        .is_some_and(|link| link.machine.on_connected())
                };
                if changed {
                    info!(peer = %peer_id, "link connected");
                    emit_state(&inner, &peer_id, LinkState::Connected).await;
                }
            }
            LinkSignal::StateFailed { peer_id } => {
                let command = {
                    let mut links = inner.links.lock().await;
                    links
                        .get_mut(&peer_id)
                        .and_then(|link| link.machine.on_failure())
                };
                if let Some(command) = command {
                    apply_failure(&inner, &peer_id, command).await;
                }
            }
            LinkSignal::CheckTimeout { peer_id, attempt } => {
                let command = {
                    let mut links = inner.links.lock().await;
                    links
                        .get_mut(&peer_id)
                        .filter(|link| link.attempt == attempt)
                        .and_then(|link| link.machine.on_deadline(Instant::now()))
                };
                if let Some(command) = command {
                    apply_failure(&inner, &peer_id, command).await;
                }
            }
            LinkSignal::RemoteTrack { peer_id, track } => {
                let guard = GuardedRemoteTrack::new(peer_id.clone(), track);
                let mut links = inner.links.lock().await;
                if let Some(link) = links.get_mut(&peer_id) {
                    link.remote_tracks.push(guard.release_flag());
                    drop(links);
                    let _ = inner.events.send(NegotiatorEvent::RemoteTrack(guard)).await;
                }
            }
        }
    }
}

async fn apply_failure(inner: &Arc<Inner>, peer_id: &str, command: LinkCommand) {
    match command {
        LinkCommand::SurfaceFailed => {
            warn!(peer = peer_id, "negotiation failed after relay retry");
            if let Some(link) = inner.links.lock().await.get_mut(peer_id) {
                link.discard_connection().await;
            }
            emit_state(inner, peer_id, LinkState::Failed).await;
        }
        LinkCommand::RebuildRelayOnly { backoff } => {
            info!(peer = peer_id, "escalating to relay-only candidates");
            let role = {
                let mut links = inner.links.lock().await;
                let Some(link) = links.get_mut(peer_id) else { return };
                link.discard_connection().await;
                link.role
            };
            emit_state(inner, peer_id, LinkState::Idle).await;

            let inner = Arc::clone(inner);
            let peer_id = peer_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                match role {
                    LinkRole::Offerer => {
                        if let Err(err) = send_offer(&inner, &peer_id).await {
                            warn!(peer = %peer_id, "relay-only re-offer failed: {}", err);
                        }
                    }
                    // Answerers cannot restart the exchange; ask the
                    // presenter to re-offer to us.
                    LinkRole::Answerer => {
                        let refresh = ClientEvent::RequestStreamRefresh {
                            room_id: inner.room_id.clone(),
                            requester_id: inner.local_id.clone(),
                        };
                        if let Err(err) = inner.signals.send(&refresh).await {
                            warn!(peer = %peer_id, "stream refresh request failed: {}", err);
                        }
                    }
                }
            });
        }
    }
}
