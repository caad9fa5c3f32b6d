//! The playback sink the engine reports to.
//!
//! The host integration layer implements [`SpeakerSink`] to receive position,
//! track and availability updates for each renderer.

use serde::Serialize;

use crate::sonos::types::RendererId;
use crate::track::TrackDescriptor;

/// A partial state update for the sink. `None` fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playing: Option<bool>,
}

impl SinkUpdate {
    #[must_use]
    pub fn position(position_ms: u64) -> Self {
        Self {
            position_ms: Some(position_ms),
            ..Default::default()
        }
    }
}

/// Receiver of engine-originated state for the host's speaker abstraction.
pub trait SpeakerSink: Send + Sync {
    /// Publishes a position, track and/or playing-flag update.
    fn update_state(&self, renderer_id: &RendererId, update: SinkUpdate);

    /// Deactivates the renderer as playback target with a human-readable reason.
    fn set_inactive(&self, renderer_id: &RendererId, reason: &str);

    /// Marks the renderer available or unavailable.
    fn set_available(&self, renderer_id: &RendererId, available: bool);
}

/// Sink that discards everything.
pub struct NoopSpeakerSink;

impl SpeakerSink for NoopSpeakerSink {
    fn update_state(&self, _renderer_id: &RendererId, _update: SinkUpdate) {}

    fn set_inactive(&self, _renderer_id: &RendererId, _reason: &str) {}

    fn set_available(&self, _renderer_id: &RendererId, _available: bool) {}
}

/// Sink that logs every call, used by the headless server.
pub struct LoggingSpeakerSink;

impl SpeakerSink for LoggingSpeakerSink {
    fn update_state(&self, renderer_id: &RendererId, update: SinkUpdate) {
        log::info!(
            "[Sink] {} state: position={:?}, playing={:?}, track={:?}",
            renderer_id,
            update.position_ms,
            update.playing,
            update.track.as_ref().map(|t| t.title.as_str())
        );
    }

    fn set_inactive(&self, renderer_id: &RendererId, reason: &str) {
        log::warn!("[Sink] {} inactive: {}", renderer_id, reason);
    }

    fn set_available(&self, renderer_id: &RendererId, available: bool) {
        log::info!("[Sink] {} available={}", renderer_id, available);
    }
}
