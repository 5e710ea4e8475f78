//! Roomcast client library.
//!
//! Turns relayed signaling events into established peer connections:
//! [`signaling`] carries the WebSocket channel, [`negotiator`] drives one
//! state machine per remote peer (with TURN-relay escalation on failure),
//! [`presenter`] coordinates the local share, and [`client`] ties them into
//! a single event loop for embedding UIs.

#![forbid(unsafe_code)]

pub mod client;
pub mod negotiator;
pub mod presenter;
pub mod signaling;
pub mod track;

pub use client::{ClientConfig, RoomClient, RoomCommand, RoomEvent, RoomHandle};
pub use negotiator::{
    IceConfig, LinkState, Negotiator, NegotiatorEvent, NegotiationTimeouts, TurnServer,
};
pub use presenter::{CaptureSource, PresenterCoordinator};
pub use signaling::{SignalSender, SignalingChannel};
pub use track::{GuardedRemoteTrack, GuardedTrack};
