//! Periodic comparison of what a renderer plays against what it should play.
//!
//! A poller per active renderer fetches the coordinator's current track. A
//! report that disagrees with the expected track (position aside) is a
//! strike; reaching the strike threshold declares the renderer
//! desynchronized and deactivates the sink. A matching report clears the
//! strikes and republishes position and playing state to the sink.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, PlaybackEvent};
use crate::protocol_constants::LOOP_START_TOLERANCE_MS;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::services::renderer_store::RendererStore;
use crate::services::speaker_sink::{SinkUpdate, SpeakerSink};
use crate::sonos::types::{RendererId, TransportSnapshot};
use crate::state::EngineConfig;
use crate::track::TrackDescriptor;

/// Result of one reconciliation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing to compare (inactive sink, no route, transition in flight,
    /// no expected state, or the device did not answer).
    Skipped,
    /// Device agrees; the sink got the reported position and playing flag.
    Matched { position_ms: u64, playing: bool },
    /// Device agrees but just wrapped around to the start of the track.
    LoopedToStart,
    /// Device disagrees; `strikes` consecutive mismatches so far.
    Mismatch { strikes: u32 },
    /// The strike threshold was reached.
    Desynchronized { strikes: u32 },
}

struct PollerInner {
    config: EngineConfig,
    store: Arc<RendererStore>,
    sink: Arc<dyn SpeakerSink>,
    emitter: Arc<dyn EventEmitter>,
    spawner: TokioSpawner,
    pollers: Mutex<HashMap<RendererId, CancellationToken>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ReconciliationPoller {
    inner: Arc<PollerInner>,
}

impl ReconciliationPoller {
    pub fn new(
        config: EngineConfig,
        store: Arc<RendererStore>,
        sink: Arc<dyn SpeakerSink>,
        emitter: Arc<dyn EventEmitter>,
        spawner: TokioSpawner,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                config,
                store,
                sink,
                emitter,
                spawner,
                pollers: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Starts polling a renderer, replacing any running poller for it.
    pub fn arm(&self, renderer_id: &RendererId) {
        let token = self.inner.shutdown.child_token();
        if let Some(previous) = self
            .inner
            .pollers
            .lock()
            .insert(renderer_id.clone(), token.clone())
        {
            previous.cancel();
        }

        let this = self.clone();
        let id = renderer_id.clone();
        let period = self.inner.config.reconciliation_interval();
        self.inner.spawner.spawn_every(token, period, move || {
            let this = this.clone();
            let id = id.clone();
            async move {
                this.tick(&id).await;
            }
        });
        log::debug!("[Reconcile] Armed for {}", renderer_id);
    }

    pub fn disarm(&self, renderer_id: &RendererId) {
        if let Some(token) = self.inner.pollers.lock().remove(renderer_id) {
            token.cancel();
            log::debug!("[Reconcile] Disarmed for {}", renderer_id);
        }
    }

    #[must_use]
    pub fn is_armed(&self, renderer_id: &RendererId) -> bool {
        self.inner.pollers.lock().contains_key(renderer_id)
    }

    /// Runs one comparison for a renderer.
    pub async fn tick(&self, renderer_id: &RendererId) -> ReconcileOutcome {
        let store = &self.inner.store;
        if !self.should_observe(renderer_id) {
            return ReconcileOutcome::Skipped;
        }
        let Some(route) = store.route(renderer_id) else {
            return ReconcileOutcome::Skipped;
        };

        let snapshot = match route.connection.client().poll_track().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::debug!("[Reconcile] {} poll failed: {}", renderer_id, e);
                return ReconcileOutcome::Skipped;
            }
        };

        // A track change may have started while the poll was in flight
        if !self.should_observe(renderer_id) {
            return ReconcileOutcome::Skipped;
        }
        let previous_position_ms = store
            .record_snapshot(renderer_id, &snapshot)
            .map_or(0, |o| o.previous_position_ms);

        let Some(expected) = store.expected(renderer_id) else {
            return ReconcileOutcome::Skipped;
        };
        if !reports_track(&snapshot, &expected.track) {
            return self.strike(renderer_id, &expected.track.title, &snapshot);
        }

        store.reset_strikes(renderer_id);
        self.publish_matched(renderer_id, &expected.track, &snapshot, previous_position_ms)
    }

    /// Forwards a report the renderer published on its own.
    ///
    /// The report reaches the sink only if it would pass a tick: the sink is
    /// active, no transition is running and the expected track matches. A
    /// disagreeing report is dropped without a strike; strikes come from
    /// ticks alone.
    pub fn republish(
        &self,
        renderer_id: &RendererId,
        snapshot: &TransportSnapshot,
        previous_position_ms: u64,
    ) -> ReconcileOutcome {
        if !self.should_observe(renderer_id) {
            return ReconcileOutcome::Skipped;
        }
        let Some(expected) = self.inner.store.expected(renderer_id) else {
            return ReconcileOutcome::Skipped;
        };
        if !reports_track(snapshot, &expected.track) {
            log::trace!("[Reconcile] {} dropped a disagreeing report", renderer_id);
            return ReconcileOutcome::Skipped;
        }
        self.publish_matched(renderer_id, &expected.track, snapshot, previous_position_ms)
    }

    fn publish_matched(
        &self,
        renderer_id: &RendererId,
        expected: &TrackDescriptor,
        snapshot: &TransportSnapshot,
        previous_position_ms: u64,
    ) -> ReconcileOutcome {
        let duration_ms = expected
            .duration_ms
            .or_else(|| snapshot.track.as_ref().and_then(|t| t.duration_ms));
        if self.looped_to_start(previous_position_ms, snapshot.position_ms, duration_ms) {
            log::debug!("[Reconcile] {} looped to start", renderer_id);
            return ReconcileOutcome::LoopedToStart;
        }

        let playing = snapshot.state.is_playing();
        self.inner.sink.update_state(
            renderer_id,
            SinkUpdate {
                position_ms: Some(snapshot.position_ms),
                playing: Some(playing),
                ..Default::default()
            },
        );
        ReconcileOutcome::Matched {
            position_ms: snapshot.position_ms,
            playing,
        }
    }

    fn should_observe(&self, renderer_id: &RendererId) -> bool {
        let store = &self.inner.store;
        store.is_sink_active(renderer_id) && !store.in_transition(renderer_id)
    }

    fn strike(
        &self,
        renderer_id: &RendererId,
        expected_title: &str,
        snapshot: &TransportSnapshot,
    ) -> ReconcileOutcome {
        let store = &self.inner.store;
        let strikes = store.record_mismatch(renderer_id);
        let reported = snapshot
            .track
            .as_ref()
            .map_or("nothing", |t| t.uri.as_str());

        if strikes < self.inner.config.strike_threshold {
            log::info!(
                "[Reconcile] {} mismatch {}/{}: reports {}",
                renderer_id,
                strikes,
                self.inner.config.strike_threshold,
                reported
            );
            return ReconcileOutcome::Mismatch { strikes };
        }

        let reason = format!(
            "desynchronized: expected '{}' but the speaker reports {}",
            expected_title, reported
        );
        log::warn!("[Reconcile] {} {}", renderer_id, reason);

        store.clear_expected(renderer_id);
        self.inner.sink.set_inactive(renderer_id, &reason);
        self.inner.emitter.emit_playback(PlaybackEvent::Desynchronized {
            renderer_id: renderer_id.clone(),
            strikes,
        });
        ReconcileOutcome::Desynchronized { strikes }
    }

    fn looped_to_start(&self, previous_ms: u64, current_ms: u64, duration_ms: Option<u64>) -> bool {
        let Some(duration_ms) = duration_ms.filter(|d| *d > 0) else {
            return false;
        };
        current_ms <= LOOP_START_TOLERANCE_MS
            && previous_ms > LOOP_START_TOLERANCE_MS
            && previous_ms + self.inner.config.loop_end_window_ms() >= duration_ms
    }
}

fn reports_track(snapshot: &TransportSnapshot, expected: &TrackDescriptor) -> bool {
    snapshot
        .track
        .as_ref()
        .is_some_and(|reported| expected.matches(reported))
}
