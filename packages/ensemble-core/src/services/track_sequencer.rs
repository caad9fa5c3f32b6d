//! Per-renderer sequencing of "set track" requests.
//!
//! Every admitted request gets the next sequence number of its renderer and
//! takes over the renderer's single live slot. The request it displaces is
//! cancelled and its caller receives [`EngineError::RequestSuperseded`] at
//! once. Cancellation is cooperative: the displaced runner checks its token
//! after every suspension point and stops, and any result it still produces
//! is discarded because its sequence number is no longer live.
//!
//! A request is applied in one of two modes:
//!
//! - **now** (`delay < now_threshold`): wait out the remaining delay, clear
//!   the coordinator queue and jump to the track, all under the connection's
//!   command lock.
//! - **next**: insert the track after the current item and wait until the
//!   device starts it. If it never does within `delay + grace`, the request
//!   is re-issued once in now mode.
//!
//! A next-mode insertion stays on record until its request commits. The
//! request that supersedes it removes the entry from the queue before
//! dispatching its own track.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::events::{EventEmitter, PlaybackEvent};
use crate::protocol_constants::NEXT_TRACK_STARTED_WITHIN_MS;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::services::action_dispatcher::{ActionDispatcher, ActionMode};
use crate::services::connection_registry::Connection;
use crate::services::renderer_store::{RendererStore, Route};
use crate::services::speaker_sink::{SinkUpdate, SpeakerSink};
use crate::sonos::traits::TransportEvent;
use crate::sonos::types::{RendererId, TransportSnapshot};
use crate::state::EngineConfig;
use crate::track::{TrackDescriptor, TrackOptions, TrackRequest};

#[derive(Default)]
struct Slot {
    last_seq: u64,
    live: Option<LiveRequest>,
    queued_next: Option<QueuedNext>,
}

/// Queue entry added by a next-mode request that has not committed yet.
struct QueuedNext {
    seq: u64,
    connection: Arc<Connection>,
    track_number: u32,
}

struct LiveRequest {
    seq: u64,
    token: CancellationToken,
    outcome: oneshot::Sender<EngineResult<()>>,
}

/// How the arrival wait of a next-mode request ended.
#[derive(Debug, PartialEq, Eq)]
enum Arrival {
    Started,
    TimedOut,
    Cancelled,
}

struct SequencerInner {
    config: EngineConfig,
    store: Arc<RendererStore>,
    dispatcher: Arc<ActionDispatcher>,
    sink: Arc<dyn SpeakerSink>,
    emitter: Arc<dyn EventEmitter>,
    spawner: TokioSpawner,
    slots: Mutex<HashMap<RendererId, Slot>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct TrackSequencer {
    inner: Arc<SequencerInner>,
}

impl TrackSequencer {
    pub fn new(
        config: EngineConfig,
        store: Arc<RendererStore>,
        dispatcher: Arc<ActionDispatcher>,
        sink: Arc<dyn SpeakerSink>,
        emitter: Arc<dyn EventEmitter>,
        spawner: TokioSpawner,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SequencerInner {
                config,
                store,
                dispatcher,
                sink,
                emitter,
                spawner,
                slots: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Admits a track request and resolves once it commits, fails, or is
    /// superseded by a later request for the same renderer.
    pub async fn set_track(
        &self,
        renderer_id: &RendererId,
        track: TrackDescriptor,
        options: TrackOptions,
    ) -> EngineResult<()> {
        let store = &self.inner.store;
        if !store.contains(renderer_id) {
            return Err(EngineError::UnknownRenderer(renderer_id.clone()));
        }
        if store.route(renderer_id).is_none() {
            return Err(EngineError::NoCoordinator(renderer_id.clone()));
        }

        let (tx, rx) = oneshot::channel();
        let token = self.inner.shutdown.child_token();
        let request = self.admit(renderer_id, track, options, token.clone(), tx);

        store.set_transition(renderer_id, true);
        log::info!(
            "[Sequencer] {} #{}: '{}' (delay={}ms, position={}ms, play={})",
            renderer_id,
            request.seq,
            request.track.title,
            options.delay_ms,
            options.position_ms,
            options.start_playing
        );

        let this = self.clone();
        let admitted_at = Instant::now();
        self.inner.spawner.spawn(async move {
            let result = this.run(&request, admitted_at, &token).await;
            this.complete(&request, result);
        });

        // A dropped sender means the slot was discarded without an outcome
        rx.await.unwrap_or(Err(EngineError::RequestSuperseded))
    }

    /// Cancels the live request of a renderer, if any.
    pub fn supersede(&self, renderer_id: &RendererId) {
        let live = self
            .inner
            .slots
            .lock()
            .get_mut(renderer_id)
            .and_then(|slot| slot.live.take());
        if let Some(live) = live {
            live.token.cancel();
            let _ = live.outcome.send(Err(EngineError::RequestSuperseded));
            self.inner.store.set_transition(renderer_id, false);
        }
    }

    /// Forgets a renderer's slot, cancelling its live request.
    pub fn remove(&self, renderer_id: &RendererId) {
        self.supersede(renderer_id);
        self.inner.slots.lock().remove(renderer_id);
    }

    /// Last sequence number assigned to a renderer (0 if none).
    #[must_use]
    pub fn last_seq(&self, renderer_id: &RendererId) -> u64 {
        self.inner
            .slots
            .lock()
            .get(renderer_id)
            .map_or(0, |s| s.last_seq)
    }

    fn admit(
        &self,
        renderer_id: &RendererId,
        track: TrackDescriptor,
        options: TrackOptions,
        token: CancellationToken,
        outcome: oneshot::Sender<EngineResult<()>>,
    ) -> TrackRequest {
        let mut slots = self.inner.slots.lock();
        let slot = slots.entry(renderer_id.clone()).or_default();
        slot.last_seq += 1;
        let seq = slot.last_seq;

        let previous = slot.live.replace(LiveRequest {
            seq,
            token,
            outcome,
        });
        if let Some(previous) = previous {
            log::debug!(
                "[Sequencer] {} #{} superseded by #{}",
                renderer_id,
                previous.seq,
                seq
            );
            previous.token.cancel();
            let _ = previous.outcome.send(Err(EngineError::RequestSuperseded));
        }

        TrackRequest {
            renderer_id: renderer_id.clone(),
            track,
            options,
            seq,
        }
    }

    /// Delivers a runner's result if its request is still the live one.
    fn complete(&self, request: &TrackRequest, result: EngineResult<()>) {
        let id = &request.renderer_id;
        let live = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(id) {
                Some(slot) if slot.live.as_ref().is_some_and(|l| l.seq == request.seq) => {
                    slot.live.take()
                }
                _ => None,
            }
        };

        let Some(live) = live else {
            log::debug!(
                "[Sequencer] {} #{} finished after being superseded, result discarded",
                id,
                request.seq
            );
            return;
        };

        match &result {
            Ok(()) => {
                self.forget_queued_next(id);
                self.inner.store.set_expected(id, request.track.clone());
                self.inner.emitter.emit_playback(PlaybackEvent::TrackCommitted {
                    renderer_id: id.clone(),
                    seq: request.seq,
                    stream_ref: request.track.stream_ref.clone(),
                });
                log::info!("[Sequencer] {} #{} committed", id, request.seq);
            }
            Err(e) => log::warn!("[Sequencer] {} #{} failed: {}", id, request.seq, e),
        }

        self.inner.store.set_transition(id, false);
        let _ = live.outcome.send(result);
    }

    // ─── Runner ───

    async fn run(
        &self,
        request: &TrackRequest,
        admitted_at: Instant,
        token: &CancellationToken,
    ) -> EngineResult<()> {
        let config = &self.inner.config;
        let delay_ms = request.options.delay_ms;

        if config.is_now(delay_ms) {
            if delay_ms > 0 {
                let fire_at = admitted_at + std::time::Duration::from_millis(delay_ms);
                tokio::select! {
                    () = token.cancelled() => return Err(EngineError::RequestSuperseded),
                    () = tokio::time::sleep_until(fire_at) => {}
                }
            }
            return self.run_now(request, token).await;
        }

        let deadline = admitted_at + config.next_track_timeout(delay_ms);
        let route = self.route(request)?;
        {
            let _guard = route.connection.lock_commands().await;
            ensure_live(token)?;
            self.withdraw_stale_entry(request, &route).await;
            ensure_live(token)?;
            let insertion = self
                .inner
                .dispatcher
                .apply(&route, ActionMode::Next, &request.track)
                .await?;
            // Recorded even if superseded meanwhile, so the successor can undo it
            self.record_queued_next(request, &route, insertion.first_track_number);
        }
        ensure_live(token)?;

        match self.wait_for_arrival(request, &route, deadline, token).await {
            Arrival::Started => self.finish(request, &route, token).await,
            Arrival::Cancelled => Err(EngineError::RequestSuperseded),
            Arrival::TimedOut if config.next_track_reissue => {
                log::warn!(
                    "[Sequencer] {} #{} did not start in time, re-issuing now",
                    request.renderer_id,
                    request.seq
                );
                self.run_now(request, token).await
            }
            Arrival::TimedOut => Err(EngineError::ActionFailure(format!(
                "track '{}' did not start within {}ms",
                request.track.title,
                config.next_track_timeout(delay_ms).as_millis()
            ))),
        }
    }

    async fn run_now(&self, request: &TrackRequest, token: &CancellationToken) -> EngineResult<()> {
        ensure_live(token)?;
        let route = self.route(request)?;
        {
            let _guard = route.connection.lock_commands().await;
            ensure_live(token)?;

            match route.connection.client().flush().await {
                Ok(()) => self.forget_queued_next(&request.renderer_id),
                Err(e) => {
                    log::warn!("[Sequencer] {} queue clear failed: {}", request.renderer_id, e);
                    self.withdraw_stale_entry(request, &route).await;
                }
            }
            ensure_live(token)?;

            self.inner
                .dispatcher
                .apply(&route, ActionMode::Now, &request.track)
                .await?;
        }
        ensure_live(token)?;

        self.finish(request, &route, token).await
    }

    // ─── Queued next entries ───

    fn record_queued_next(&self, request: &TrackRequest, route: &Route, track_number: u32) {
        if let Some(slot) = self.inner.slots.lock().get_mut(&request.renderer_id) {
            slot.queued_next = Some(QueuedNext {
                seq: request.seq,
                connection: Arc::clone(&route.connection),
                track_number,
            });
        }
    }

    fn forget_queued_next(&self, renderer_id: &RendererId) {
        if let Some(slot) = self.inner.slots.lock().get_mut(renderer_id) {
            slot.queued_next = None;
        }
    }

    /// Removes the entry an earlier next-mode request left in the queue.
    ///
    /// Must be called with `route`'s command lock held. An entry on a former
    /// coordinator is dropped from the record without touching that queue.
    async fn withdraw_stale_entry(&self, request: &TrackRequest, route: &Route) {
        let stale = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&request.renderer_id) {
                Some(slot)
                    if slot
                        .queued_next
                        .as_ref()
                        .is_some_and(|q| q.seq != request.seq) =>
                {
                    slot.queued_next.take()
                }
                _ => None,
            }
        };
        let Some(stale) = stale else {
            return;
        };

        let id = &request.renderer_id;
        if !Arc::ptr_eq(&stale.connection, &route.connection) {
            log::debug!(
                "[Sequencer] {} #{} entry stays on its former coordinator",
                id,
                stale.seq
            );
            return;
        }
        match route
            .connection
            .client()
            .remove_from_queue(stale.track_number)
            .await
        {
            Ok(()) => log::debug!(
                "[Sequencer] {} withdrew #{} from queue position {}",
                id,
                stale.seq,
                stale.track_number
            ),
            Err(e) => log::warn!(
                "[Sequencer] {} could not withdraw #{} from queue position {}: {}",
                id,
                stale.seq,
                stale.track_number,
                e
            ),
        }
    }

    // ─── Commit ───

    /// Seek, schedule the position republish, then play or pause.
    async fn finish(
        &self,
        request: &TrackRequest,
        route: &Route,
        token: &CancellationToken,
    ) -> EngineResult<()> {
        let client = route.connection.client();
        let options = request.options;

        if options.position_ms > 0 {
            if let Err(e) = client.seek(options.position_ms).await {
                log::warn!("[Sequencer] {} seek failed: {}", request.renderer_id, e);
            }
            ensure_live(token)?;
        }

        self.schedule_position_republish(&request.renderer_id, route, token.child_token());

        let result = if options.start_playing {
            client.play().await
        } else {
            client.pause().await
        };
        if let Err(e) = result {
            log::warn!("[Sequencer] {} play/pause failed: {}", request.renderer_id, e);
        }
        ensure_live(token)
    }

    /// Republishes the device position once the transport has settled, unless
    /// a transport-state observation arrives first.
    fn schedule_position_republish(
        &self,
        renderer_id: &RendererId,
        route: &Route,
        token: CancellationToken,
    ) {
        let inner = Arc::clone(&self.inner);
        let id = renderer_id.clone();
        let client = Arc::clone(route.connection.client());
        let mut events = client.subscribe();
        let window = inner.config.position_stabilize();

        self.inner.spawner.spawn_cancellable(token, async move {
            let settled = tokio::time::sleep(window);
            tokio::pin!(settled);
            loop {
                tokio::select! {
                    () = &mut settled => break,
                    event = events.recv() => match event {
                        Ok(TransportEvent::TransportState(_)) => return,
                        Err(broadcast::error::RecvError::Closed) => {
                            settled.as_mut().await;
                            break;
                        }
                        _ => {}
                    },
                }
            }

            if !inner.store.is_sink_active(&id) {
                return;
            }
            let position_ms = match client.poll_track().await {
                Ok(snapshot) => snapshot.position_ms,
                Err(_) => inner.store.position_ms(&id).unwrap_or_default(),
            };
            log::debug!("[Sequencer] {} settled at {}ms", id, position_ms);
            inner.sink.update_state(&id, SinkUpdate::position(position_ms));
        });
    }

    async fn wait_for_arrival(
        &self,
        request: &TrackRequest,
        route: &Route,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Arrival {
        let client = route.connection.client();
        let track = &request.track;
        let mut events = client.subscribe();
        let mut events_open = true;
        let mut poll = tokio::time::interval(self.inner.config.next_track_poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // A device already on the track counts, unless that is the track
        // being replaced and it has been playing a while.
        let replacing_same = self
            .inner
            .store
            .expected(&request.renderer_id)
            .is_some_and(|e| e.track.stream_ref == track.stream_ref);
        let first_check = |s: &TransportSnapshot| {
            if replacing_same {
                has_started(track, s)
            } else {
                is_on(track, s)
            }
        };
        let mut first = true;

        loop {
            tokio::select! {
                () = token.cancelled() => return Arrival::Cancelled,
                () = tokio::time::sleep_until(deadline) => {
                    // Past the window only the URI counts
                    return match client.poll_track().await {
                        Ok(s) if is_on(track, &s) => Arrival::Started,
                        _ if token.is_cancelled() => Arrival::Cancelled,
                        _ => Arrival::TimedOut,
                    };
                }
                _ = poll.tick() => {
                    if let Ok(s) = client.poll_track().await {
                        let started = if first { first_check(&s) } else { has_started(track, &s) };
                        if started {
                            return Arrival::Started;
                        }
                    }
                    first = false;
                }
                event = events.recv(), if events_open => match event {
                    Ok(TransportEvent::TransportState(s)) if has_started(track, &s) => {
                        return Arrival::Started;
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                    _ => {}
                },
            }
        }
    }

    fn route(&self, request: &TrackRequest) -> EngineResult<Route> {
        self.inner
            .store
            .route(&request.renderer_id)
            .ok_or_else(|| EngineError::NoCoordinator(request.renderer_id.clone()))
    }
}

fn ensure_live(token: &CancellationToken) -> EngineResult<()> {
    if token.is_cancelled() {
        Err(EngineError::RequestSuperseded)
    } else {
        Ok(())
    }
}

fn is_on(track: &TrackDescriptor, snapshot: &TransportSnapshot) -> bool {
    snapshot
        .track
        .as_ref()
        .is_some_and(|t| track.is_reported_uri(&t.uri))
}

fn has_started(track: &TrackDescriptor, snapshot: &TransportSnapshot) -> bool {
    is_on(track, snapshot) && snapshot.position_ms < NEXT_TRACK_STARTED_WITHIN_MS
}
