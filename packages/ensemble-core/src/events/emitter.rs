//! Event emitter abstraction for decoupling services from delivery.
//!
//! Services depend on the [`EventEmitter`] trait rather than concrete
//! channels, enabling testing and alternative delivery implementations.

use tokio::sync::broadcast;

use super::{EngineEvent, PlaybackEvent, RendererEvent, TopologyEvent};

/// Trait for emitting domain events without knowledge of delivery.
pub trait EventEmitter: Send + Sync {
    /// Emits a topology synchronization event.
    fn emit_topology(&self, event: TopologyEvent);

    /// Emits a renderer lifecycle event.
    fn emit_renderer(&self, event: RendererEvent);

    /// Emits a playback observation or outcome.
    fn emit_playback(&self, event: PlaybackEvent);
}

/// No-op emitter for headless use or testing.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_topology(&self, _event: TopologyEvent) {}

    fn emit_renderer(&self, _event: RendererEvent) {}

    fn emit_playback(&self, _event: PlaybackEvent) {}
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_topology(&self, event: TopologyEvent) {
        tracing::debug!(?event, "topology_event");
    }

    fn emit_renderer(&self, event: RendererEvent) {
        tracing::debug!(?event, "renderer_event");
    }

    fn emit_playback(&self, event: PlaybackEvent) {
        tracing::debug!(?event, "playback_event");
    }
}

/// Forwards every event into a broadcast channel as an [`EngineEvent`].
#[derive(Clone)]
pub struct BroadcastEventEmitter {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastEventEmitter {
    /// Creates a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns a new receiver for the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: EngineEvent) {
        // Ignore send errors - no receivers is fine
        let _ = self.tx.send(event);
    }
}

impl EventEmitter for BroadcastEventEmitter {
    fn emit_topology(&self, event: TopologyEvent) {
        self.send(EngineEvent::Topology(event));
    }

    fn emit_renderer(&self, event: RendererEvent) {
        self.send(EngineEvent::Renderer(event));
    }

    fn emit_playback(&self, event: PlaybackEvent) {
        self.send(EngineEvent::Playback(event));
    }
}
