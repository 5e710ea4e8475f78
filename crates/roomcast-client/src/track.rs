//! Ownership wrappers around media tracks.
//!
//! The original browser client monkey-patched `track.stop` so that
//! re-renders and unrelated stream swaps could not kill an in-flight
//! presentation. Here the same protection is an ownership rule: everything
//! outside this crate gets a handle that cannot release the track, and only
//! the negotiator/coordinator teardown paths call the crate-internal
//! `release()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use roomcast_common::{Error, Result};

/// Shared release flag. Clones observe each other, so the owning link can
/// release a track whose guard has already been handed to the UI.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReleaseFlag(Arc<AtomicBool>);

impl ReleaseFlag {
    pub(crate) fn release(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A locally captured track owned by the presenter coordinator.
///
/// Clones share the release flag: once released, every clone refuses to
/// hand out the underlying track.
#[derive(Clone)]
pub struct GuardedTrack {
    track: Arc<TrackLocalStaticSample>,
    released: ReleaseFlag,
}

impl GuardedTrack {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            track,
            released: ReleaseFlag::default(),
        }
    }

    /// Track handle for attaching to a peer connection. `None` once released.
    pub fn handle(&self) -> Option<Arc<TrackLocalStaticSample>> {
        if self.is_released() {
            None
        } else {
            Some(Arc::clone(&self.track))
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.is_released()
    }

    /// Feed a captured sample. Errors after release so producers notice the
    /// teardown instead of writing into a dead track.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_released() {
            return Err(Error::capture("track has been released"));
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(Error::capture)?;
        Ok(())
    }

    /// Release the track. Idempotent; only teardown paths inside this crate
    /// may call it.
    pub(crate) fn release(&self) {
        self.released.release();
    }
}

/// A remote track surfaced to the embedding UI.
///
/// The UI can read from it but cannot terminate it; the negotiator releases
/// it when the owning peer link closes.
#[derive(Clone)]
pub struct GuardedRemoteTrack {
    peer_id: String,
    track: Arc<TrackRemote>,
    released: ReleaseFlag,
}

impl std::fmt::Debug for GuardedRemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedRemoteTrack")
            .field("peer_id", &self.peer_id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl GuardedRemoteTrack {
    pub(crate) fn new(peer_id: String, track: Arc<TrackRemote>) -> Self {
        Self {
            peer_id,
            track,
            released: ReleaseFlag::default(),
        }
    }

    /// Shared flag kept by the owning peer link so teardown can release the
    /// track after the guard has been surfaced.
    pub(crate) fn release_flag(&self) -> ReleaseFlag {
        self.released.clone()
    }

    /// The remote peer this track came from.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn handle(&self) -> Option<Arc<TrackRemote>> {
        if self.is_released() {
            None
        } else {
            Some(Arc::clone(&self.track))
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.is_released()
    }

    pub(crate) fn release(&self) {
        self.released.release();
    }
}
