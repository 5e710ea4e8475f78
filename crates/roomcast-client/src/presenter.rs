//! Local presentation lifecycle.
//!
//! The coordinator owns the captured tracks for the duration of a share.
//! Start and stop are the only paths that create or release them, so a
//! stray consumer can never kill a live presentation out from under the
//! negotiator.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use roomcast_common::{Error, Result};

use crate::track::GuardedTrack;

/// Source of local media, e.g. a screen or window grabber.
///
/// Implementations capture on demand and hand ownership of the resulting
/// tracks to the coordinator.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture(&self) -> Result<Vec<GuardedTrack>>;
}

/// Owns the local share: at most one active capture at a time.
pub struct PresenterCoordinator {
    source: Arc<dyn CaptureSource>,
    active: Mutex<Option<Vec<GuardedTrack>>>,
}

impl PresenterCoordinator {
    pub fn new(source: Arc<dyn CaptureSource>) -> Self {
        Self {
            source,
            active: Mutex::new(None),
        }
    }

    /// Capture and take ownership of a fresh set of tracks. Fails if a
    /// presentation is already running; callers stop first to replace it.
    pub async fn start(&self) -> Result<Vec<GuardedTrack>> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(Error::capture("presentation already active"));
        }
        let tracks = self.source.capture().await?;
        if tracks.is_empty() {
            return Err(Error::capture("capture source produced no tracks"));
        }
        info!(tracks = tracks.len(), "presentation started");
        *active = Some(tracks.clone());
        Ok(tracks)
    }

    /// Release every active track. Idempotent.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if let Some(tracks) = active.take() {
            for track in &tracks {
                track.release();
            }
            info!("presentation stopped");
        }
    }

    pub async fn is_presenting(&self) -> bool {
        self.active.lock().await.is_some()
    }
}
