//! Domain events emitted by the engine.
//!
//! This module provides:
//! - [`EventEmitter`] trait for services to emit events
//! - [`BroadcastEventEmitter`] forwarding events to a broadcast channel
//! - Event types for topology, renderer lifecycle and playback observations

mod emitter;

pub use emitter::{BroadcastEventEmitter, EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

use crate::sonos::types::RendererId;

/// Events carrying every category, for consumers that want a single stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum EngineEvent {
    Topology(TopologyEvent),
    Renderer(RendererEvent),
    Playback(PlaybackEvent),
}

/// Events from topology synchronization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TopologyEvent {
    /// The resolved coordinator of at least one renderer changed.
    #[serde(rename_all = "camelCase")]
    Changed {
        /// Renderers whose route differs from the previous refresh.
        changed: Vec<RendererId>,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Why a renderer became unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UnavailableReason {
    ConnectionLost,
    Removed,
}

/// Renderer lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RendererEvent {
    /// The renderer is reachable and routed.
    #[serde(rename_all = "camelCase")]
    Available {
        renderer_id: RendererId,
        timestamp: u64,
    },
    /// The renderer went away.
    #[serde(rename_all = "camelCase")]
    Unavailable {
        renderer_id: RendererId,
        reason: UnavailableReason,
        timestamp: u64,
    },
    /// A reconnect attempt is scheduled.
    #[serde(rename_all = "camelCase")]
    ReconnectScheduled {
        renderer_id: RendererId,
        attempt: u32,
        delay_ms: u64,
    },
}

/// Playback observations and outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackEvent {
    /// A track request completed and is now the expected state.
    #[serde(rename_all = "camelCase")]
    TrackCommitted {
        renderer_id: RendererId,
        seq: u64,
        stream_ref: String,
    },
    /// The device's playing flag changed.
    #[serde(rename_all = "camelCase")]
    PlayingChanged { renderer_id: RendererId, playing: bool },
    /// Group volume changed (0-100).
    #[serde(rename_all = "camelCase")]
    VolumeChanged { renderer_id: RendererId, volume: u8 },
    /// Group mute changed.
    #[serde(rename_all = "camelCase")]
    MuteChanged { renderer_id: RendererId, muted: bool },
    /// Reconciliation declared the renderer desynchronized.
    #[serde(rename_all = "camelCase")]
    Desynchronized {
        renderer_id: RendererId,
        strikes: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_category_and_type() {
        let event = EngineEvent::Playback(PlaybackEvent::VolumeChanged {
            renderer_id: RendererId::new("RINCON_A"),
            volume: 30,
        });
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["category"], "playback");
        assert_eq!(json["type"], "volumeChanged");
        assert_eq!(json["rendererId"], "RINCON_A");
    }
}
