//! Engine composition root and public API.
//!
//! [`PlaybackEngine`] wires the coordination services together, owns the
//! per-renderer listener subscriptions and runs the event loop that reacts
//! to transport notifications, recoveries and the topology poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::events::{EventEmitter, PlaybackEvent, RendererEvent, UnavailableReason};
use crate::protocol_constants::SOAP_TIMEOUT_SECS;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::services::action_dispatcher::{ActionDispatcher, ActionMode};
use crate::services::connection_registry::{Connection, ConnectionRegistry};
use crate::services::reconciliation::ReconciliationPoller;
use crate::services::reconnect_supervisor::ReconnectSupervisor;
use crate::services::renderer_store::{LinkState, RendererInfo, RendererStore, Route, Subscription};
use crate::services::speaker_sink::SpeakerSink;
use crate::services::topology_sync::TopologySynchronizer;
use crate::services::track_sequencer::TrackSequencer;
use crate::sonos::client::SoapConnectionFactory;
use crate::sonos::traits::{ConnectionFactory, TransportEvent};
use crate::sonos::types::{Endpoint, QueueInsertion, RendererId, TransportSnapshot};
use crate::state::EngineConfig;
use crate::track::{TrackDescriptor, TrackOptions};
use crate::utils::now_millis;

/// A transport notification attributed to the renderer whose listener saw it.
#[derive(Debug)]
struct Signal {
    renderer_id: RendererId,
    event: TransportEvent,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<RendererStore>,
    registry: Arc<ConnectionRegistry>,
    topology: TopologySynchronizer,
    reconnect: ReconnectSupervisor,
    sequencer: TrackSequencer,
    dispatcher: Arc<ActionDispatcher>,
    reconciler: ReconciliationPoller,
    sink: Arc<dyn SpeakerSink>,
    emitter: Arc<dyn EventEmitter>,
    spawner: TokioSpawner,
    signals: mpsc::UnboundedSender<Signal>,
    receivers: Mutex<Option<Receivers>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

struct Receivers {
    signals: mpsc::UnboundedReceiver<Signal>,
    recovered: mpsc::UnboundedReceiver<RendererId>,
}

/// Coordinates playback across a set of grouped renderers.
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<EngineInner>,
}

/// Creates the shared HTTP client for all Sonos communication.
fn create_http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(SOAP_TIMEOUT_SECS))
        .build()
        .expect("Failed to create HTTP client")
}

impl PlaybackEngine {
    /// Wires up an engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if `config` is invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn SpeakerSink>,
        emitter: Arc<dyn EventEmitter>,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Configuration)?;

        let spawner = TokioSpawner::current();
        let shutdown = CancellationToken::new();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (recovered_tx, recovered_rx) = mpsc::unbounded_channel();

        let store = Arc::new(RendererStore::new());
        let registry = Arc::new(ConnectionRegistry::new(factory));
        let dispatcher = Arc::new(ActionDispatcher::new(config.streaming_service.clone()));

        let topology = TopologySynchronizer::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&emitter),
        );
        let reconnect = ReconnectSupervisor::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&emitter),
            spawner.clone(),
            recovered_tx,
            shutdown.clone(),
        );
        let sequencer = TrackSequencer::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&sink),
            Arc::clone(&emitter),
            spawner.clone(),
            shutdown.clone(),
        );
        let reconciler = ReconciliationPoller::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&sink),
            Arc::clone(&emitter),
            spawner.clone(),
            shutdown.clone(),
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                registry,
                topology,
                reconnect,
                sequencer,
                dispatcher,
                reconciler,
                sink,
                emitter,
                spawner,
                signals: signals_tx,
                receivers: Mutex::new(Some(Receivers {
                    signals: signals_rx,
                    recovered: recovered_rx,
                })),
                started: AtomicBool::new(false),
                shutdown,
            }),
        })
    }

    /// Wires up an engine talking SOAP to real Sonos players.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if `config` is invalid.
    pub fn with_soap_transport(
        config: EngineConfig,
        sink: Arc<dyn SpeakerSink>,
        emitter: Arc<dyn EventEmitter>,
    ) -> EngineResult<Self> {
        let factory = Arc::new(SoapConnectionFactory::new(create_http_client()));
        Self::new(config, factory, sink, emitter)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Starts the event loop and the topology poll. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(receivers) = self.inner.receivers.lock().take() else {
            return;
        };

        log::info!(
            "[Engine] Starting (topology every {}ms, reconcile every {}ms)",
            self.inner.config.topology_poll_interval_ms,
            self.inner.config.reconciliation_interval_ms
        );
        let inner = Arc::clone(&self.inner);
        self.inner.spawner.spawn(inner.run(receivers));
    }

    /// Stops every background task. Pending track requests resolve as superseded.
    pub fn shutdown(&self) {
        log::info!("[Engine] Shutting down");
        self.inner.shutdown.cancel();
        for id in self.inner.store.ids() {
            self.inner.sequencer.supersede(&id);
            self.inner.store.clear_subscriptions(&id);
        }
    }

    // ─── Renderer registry ───

    /// Adds a renderer and resolves its route.
    pub async fn add_renderer(&self, renderer_id: RendererId, endpoint: Endpoint) -> EngineResult<()> {
        let inner = &self.inner;
        if !inner.store.insert(renderer_id.clone(), endpoint.clone()) {
            return Err(EngineError::InvalidRequest(format!(
                "renderer {} is already known",
                renderer_id
            )));
        }
        log::info!("[Engine] Added renderer {} at {}", renderer_id, endpoint);

        inner.sink.set_available(&renderer_id, true);
        inner.emitter.emit_renderer(RendererEvent::Available {
            renderer_id: renderer_id.clone(),
            timestamp: now_millis(),
        });
        inner.subscribe(&renderer_id);
        inner.refresh_topology().await;
        Ok(())
    }

    /// Forgets a renderer, releasing its listeners, timers and poller.
    pub fn remove_renderer(&self, renderer_id: &RendererId) -> EngineResult<()> {
        let inner = &self.inner;
        if !inner.store.contains(renderer_id) {
            return Err(EngineError::UnknownRenderer(renderer_id.clone()));
        }

        inner.sequencer.remove(renderer_id);
        inner.reconnect.cancel(renderer_id);
        inner.reconciler.disarm(renderer_id);
        inner.store.remove(renderer_id);

        log::info!("[Engine] Removed renderer {}", renderer_id);
        inner.sink.set_available(renderer_id, false);
        inner.emitter.emit_renderer(RendererEvent::Unavailable {
            renderer_id: renderer_id.clone(),
            reason: UnavailableReason::Removed,
            timestamp: now_millis(),
        });
        Ok(())
    }

    #[must_use]
    pub fn renderer(&self, renderer_id: &RendererId) -> Option<RendererInfo> {
        self.inner.store.info(renderer_id)
    }

    #[must_use]
    pub fn renderers(&self) -> Vec<RendererInfo> {
        self.inner
            .store
            .ids()
            .iter()
            .filter_map(|id| self.inner.store.info(id))
            .collect()
    }

    /// Runs a topology refresh now. Returns the renderers whose route changed,
    /// or `None` if no renderer answered.
    pub async fn refresh_topology(&self) -> Option<Vec<RendererId>> {
        self.inner.refresh_topology().await
    }

    // ─── Playback ───

    /// Plays a track on a renderer. Resolves when the track is committed, the
    /// request fails, or a later request supersedes it.
    pub async fn set_track(
        &self,
        renderer_id: &RendererId,
        track: TrackDescriptor,
        options: TrackOptions,
    ) -> EngineResult<()> {
        self.inner
            .sequencer
            .set_track(renderer_id, track, options)
            .await
    }

    /// Appends a track to the end of the coordinator's queue.
    pub async fn enqueue(
        &self,
        renderer_id: &RendererId,
        track: &TrackDescriptor,
    ) -> EngineResult<QueueInsertion> {
        let route = self.inner.route_for(renderer_id)?;
        let _guard = route.connection.lock_commands().await;
        self.inner
            .dispatcher
            .apply(&route, ActionMode::Queue, track)
            .await
    }

    /// Seeks within the current track.
    pub async fn set_position(&self, renderer_id: &RendererId, position_ms: u64) -> EngineResult<()> {
        let connection = self.inner.connection_for(renderer_id)?;
        let _guard = connection.lock_commands().await;
        connection.client().seek(position_ms).await?;
        Ok(())
    }

    /// Makes the renderer the active playback target, or releases it.
    ///
    /// Both directions clear the coordinator's queue. Activation arms the
    /// reconciliation poller and requires a route.
    pub async fn set_active(&self, renderer_id: &RendererId, active: bool) -> EngineResult<()> {
        let inner = &self.inner;
        if !inner.store.contains(renderer_id) {
            return Err(EngineError::UnknownRenderer(renderer_id.clone()));
        }
        let route = inner.store.route(renderer_id);
        if active && route.is_none() {
            return Err(EngineError::NoCoordinator(renderer_id.clone()));
        }

        inner.store.set_sink_active(renderer_id, active);
        if active {
            inner.reconciler.arm(renderer_id);
        } else {
            inner.reconciler.disarm(renderer_id);
        }
        log::info!("[Engine] {} active={}", renderer_id, active);

        if let Some(route) = route {
            let _guard = route.connection.lock_commands().await;
            if let Err(e) = route.connection.client().flush().await {
                log::warn!("[Engine] {} queue clear failed: {}", renderer_id, e);
            }
        }
        Ok(())
    }

    pub async fn play(&self, renderer_id: &RendererId, playing: bool) -> EngineResult<()> {
        let connection = self.inner.connection_for(renderer_id)?;
        let _guard = connection.lock_commands().await;
        if playing {
            connection.client().play().await?;
        } else {
            connection.client().pause().await?;
        }
        Ok(())
    }

    pub async fn next(&self, renderer_id: &RendererId) -> EngineResult<()> {
        let connection = self.inner.connection_for(renderer_id)?;
        let _guard = connection.lock_commands().await;
        connection.client().next().await?;
        Ok(())
    }

    pub async fn previous(&self, renderer_id: &RendererId) -> EngineResult<()> {
        let connection = self.inner.connection_for(renderer_id)?;
        let _guard = connection.lock_commands().await;
        connection.client().previous().await?;
        Ok(())
    }

    /// Sets the volume of the renderer's group (0-100).
    pub async fn set_group_volume(&self, renderer_id: &RendererId, volume: u8) -> EngineResult<()> {
        if volume > 100 {
            return Err(EngineError::InvalidRequest(format!(
                "volume must be 0-100, got {}",
                volume
            )));
        }
        let connection = self.inner.connection_for(renderer_id)?;
        let _guard = connection.lock_commands().await;
        connection.client().set_volume(volume).await?;
        Ok(())
    }

    pub async fn set_group_mute(&self, renderer_id: &RendererId, muted: bool) -> EngineResult<()> {
        let connection = self.inner.connection_for(renderer_id)?;
        let _guard = connection.lock_commands().await;
        connection.client().set_muted(muted).await?;
        Ok(())
    }
}

impl EngineInner {
    fn route_for(&self, renderer_id: &RendererId) -> EngineResult<Route> {
        if !self.store.contains(renderer_id) {
            return Err(EngineError::UnknownRenderer(renderer_id.clone()));
        }
        self.store
            .route(renderer_id)
            .ok_or_else(|| EngineError::NoCoordinator(renderer_id.clone()))
    }

    fn connection_for(&self, renderer_id: &RendererId) -> EngineResult<Arc<Connection>> {
        self.route_for(renderer_id).map(|r| r.connection)
    }

    // ─── Event loop ───

    async fn run(self: Arc<Self>, mut receivers: Receivers) {
        let mut poll = tokio::time::interval(self.config.topology_poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                Some(signal) = receivers.signals.recv() => {
                    self.on_transport_event(&signal.renderer_id, signal.event);
                }
                Some(renderer_id) = receivers.recovered.recv() => {
                    self.on_recovered(&renderer_id).await;
                }
                _ = poll.tick() => {
                    self.refresh_topology().await;
                }
            }
        }
        log::info!("[Engine] Event loop stopped");
    }

    async fn refresh_topology(&self) -> Option<Vec<RendererId>> {
        let changed = self.topology.refresh().await?;
        for id in &changed {
            self.subscribe(id);
        }
        join_all(changed.iter().map(|id| self.init_capabilities(id))).await;
        Some(changed)
    }

    fn on_transport_event(&self, renderer_id: &RendererId, event: TransportEvent) {
        if !self.store.contains(renderer_id) {
            return;
        }
        match event {
            TransportEvent::Dead => self.on_dead(renderer_id),
            TransportEvent::TransportState(snapshot) => {
                self.on_transport_state(renderer_id, &snapshot);
            }
            TransportEvent::GroupVolume(volume) => self.on_volume(renderer_id, volume),
            TransportEvent::GroupMute(muted) => self.on_mute(renderer_id, muted),
        }
    }

    fn on_transport_state(&self, renderer_id: &RendererId, snapshot: &TransportSnapshot) {
        // Reports during a track change describe the outgoing track
        if self.store.in_transition(renderer_id) {
            return;
        }
        let Some(observed) = self.store.record_snapshot(renderer_id, snapshot) else {
            return;
        };
        let playing = snapshot.state.is_playing();
        if observed.playing_changed {
            self.emitter.emit_playback(PlaybackEvent::PlayingChanged {
                renderer_id: renderer_id.clone(),
                playing,
            });
        }
        self.reconciler
            .republish(renderer_id, snapshot, observed.previous_position_ms);
    }

    fn on_volume(&self, renderer_id: &RendererId, volume: u8) {
        if self.store.record_volume(renderer_id, volume) {
            self.emitter.emit_playback(PlaybackEvent::VolumeChanged {
                renderer_id: renderer_id.clone(),
                volume,
            });
        }
    }

    fn on_mute(&self, renderer_id: &RendererId, muted: bool) {
        if self.store.record_muted(renderer_id, muted) {
            self.emitter.emit_playback(PlaybackEvent::MuteChanged {
                renderer_id: renderer_id.clone(),
                muted,
            });
        }
    }

    fn on_dead(&self, renderer_id: &RendererId) {
        if self.store.link(renderer_id) != Some(LinkState::Alive) {
            return;
        }
        log::warn!("[Engine] Lost connection to {}", renderer_id);

        self.store.set_link(renderer_id, LinkState::Dead);
        self.store.set_route(renderer_id, None);
        self.store.clear_subscriptions(renderer_id);
        self.reconciler.disarm(renderer_id);

        if self.store.is_sink_active(renderer_id) {
            self.sink.set_inactive(renderer_id, "lost connection");
        }
        self.sink.set_available(renderer_id, false);
        self.emitter.emit_renderer(RendererEvent::Unavailable {
            renderer_id: renderer_id.clone(),
            reason: UnavailableReason::ConnectionLost,
            timestamp: now_millis(),
        });

        self.reconnect.connection_lost(renderer_id);
    }

    async fn on_recovered(&self, renderer_id: &RendererId) {
        if !self.store.contains(renderer_id) {
            return;
        }
        log::info!("[Engine] {} recovered", renderer_id);

        self.store.set_link(renderer_id, LinkState::Alive);
        self.sink.set_available(renderer_id, true);
        self.emitter.emit_renderer(RendererEvent::Available {
            renderer_id: renderer_id.clone(),
            timestamp: now_millis(),
        });

        self.subscribe(renderer_id);
        self.refresh_topology().await;

        if self.store.is_sink_active(renderer_id) && self.store.route(renderer_id).is_some() {
            self.reconciler.arm(renderer_id);
        }
    }

    /// Reads volume, mute and playing state from the renderer's coordinator.
    async fn init_capabilities(&self, renderer_id: &RendererId) {
        let Some(route) = self.store.route(renderer_id) else {
            return;
        };
        let client = route.connection.client();

        match client.get_volume().await {
            Ok(volume) => self.on_volume(renderer_id, volume),
            Err(e) => log::debug!("[Engine] {} volume read failed: {}", renderer_id, e),
        }
        match client.get_muted().await {
            Ok(muted) => self.on_mute(renderer_id, muted),
            Err(e) => log::debug!("[Engine] {} mute read failed: {}", renderer_id, e),
        }
        match client.poll_track().await {
            Ok(snapshot) => self.on_transport_state(renderer_id, &snapshot),
            Err(e) => log::debug!("[Engine] {} state read failed: {}", renderer_id, e),
        }
    }

    // ─── Subscriptions ───

    /// (Re)creates a renderer's listeners: its own endpoint for loss of
    /// connection, and its coordinator for transport notifications.
    fn subscribe(&self, renderer_id: &RendererId) {
        let Some(endpoint) = self.store.endpoint(renderer_id) else {
            return;
        };
        if self.store.link(renderer_id) != Some(LinkState::Alive) {
            return;
        }

        let own = self.registry.get(&endpoint);
        let route = self.store.route(renderer_id);
        let mut subscriptions = Vec::with_capacity(2);

        match route {
            Some(route) if Arc::ptr_eq(&route.connection, &own) => {
                subscriptions.push(self.listen(renderer_id, &own, true));
            }
            Some(route) => {
                subscriptions.push(self.listen(renderer_id, &own, false));
                subscriptions.push(self.listen(renderer_id, &route.connection, true));
            }
            None => subscriptions.push(self.listen(renderer_id, &own, false)),
        }

        self.store.set_subscriptions(renderer_id, subscriptions);
    }

    fn listen(
        &self,
        renderer_id: &RendererId,
        connection: &Connection,
        transport_events: bool,
    ) -> Subscription {
        let token = self.shutdown.child_token();
        let mut events = connection.client().subscribe();
        let signals = self.signals.clone();
        let id = renderer_id.clone();

        self.spawner.spawn_cancellable(token.clone(), async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !transport_events && event != TransportEvent::Dead {
                            continue;
                        }
                        let signal = Signal {
                            renderer_id: id.clone(),
                            event,
                        };
                        if signals.send(signal).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("[Engine] Listener for {} skipped {} event(s)", id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription::new(token)
    }
}
