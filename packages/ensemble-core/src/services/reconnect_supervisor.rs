//! Reconnection of renderers whose endpoint stopped answering.
//!
//! A dead renderer is retried after its current backoff. Every failed attempt
//! grows the backoff by the configured multiplier up to the cap and schedules
//! the next one; a successful attempt resets the backoff and hands the
//! renderer back to the engine through the recovery channel. Each renderer has
//! at most one pending retry timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, RendererEvent};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::services::connection_registry::ConnectionRegistry;
use crate::services::renderer_store::{LinkState, RendererStore};
use crate::sonos::types::RendererId;
use crate::state::EngineConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Backoff
// ─────────────────────────────────────────────────────────────────────────────

/// Multiplicative, capped reconnect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base_ms: u64,
    multiplier: f64,
    cap_ms: u64,
    current_ms: u64,
    failures: u32,
    last_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(base_ms: u64, multiplier: f64, cap_ms: u64) -> Self {
        Self {
            base_ms,
            multiplier,
            cap_ms,
            current_ms: base_ms.min(cap_ms),
            failures: 0,
            last_attempt: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.reconnect_base_ms,
            config.reconnect_multiplier,
            config.reconnect_cap_ms,
        )
    }

    /// Wait before the next attempt.
    #[must_use]
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    /// Number of failed attempts since the last reset.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    #[must_use]
    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    pub fn record_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        let grown = (self.current_ms as f64 * self.multiplier).round() as u64;
        self.current_ms = grown.max(self.current_ms).min(self.cap_ms);
    }

    pub fn reset(&mut self) {
        self.current_ms = self.base_ms.min(self.cap_ms);
        self.failures = 0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

struct ReconnectState {
    backoff: Backoff,
    timer: Option<CancellationToken>,
}

struct SupervisorInner {
    config: EngineConfig,
    store: Arc<RendererStore>,
    registry: Arc<ConnectionRegistry>,
    emitter: Arc<dyn EventEmitter>,
    spawner: TokioSpawner,
    recovered: mpsc::UnboundedSender<RendererId>,
    states: Mutex<HashMap<RendererId, ReconnectState>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ReconnectSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ReconnectSupervisor {
    /// Creates a supervisor. Recovered renderer ids are sent on `recovered`.
    pub fn new(
        config: EngineConfig,
        store: Arc<RendererStore>,
        registry: Arc<ConnectionRegistry>,
        emitter: Arc<dyn EventEmitter>,
        spawner: TokioSpawner,
        recovered: mpsc::UnboundedSender<RendererId>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                store,
                registry,
                emitter,
                spawner,
                recovered,
                states: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Starts (or continues) the reconnect cycle of a renderer that went dead.
    pub fn connection_lost(&self, renderer_id: &RendererId) {
        self.inner
            .states
            .lock()
            .entry(renderer_id.clone())
            .or_insert_with(|| ReconnectState {
                backoff: Backoff::from_config(&self.inner.config),
                timer: None,
            });
        self.schedule(renderer_id);
    }

    /// Stops reconnecting a renderer and forgets its backoff.
    pub fn cancel(&self, renderer_id: &RendererId) {
        if let Some(state) = self.inner.states.lock().remove(renderer_id) {
            if let Some(timer) = state.timer {
                timer.cancel();
            }
        }
    }

    /// Current backoff of a renderer, if it is being reconnected.
    #[must_use]
    pub fn backoff(&self, renderer_id: &RendererId) -> Option<Backoff> {
        self.inner
            .states
            .lock()
            .get(renderer_id)
            .map(|s| s.backoff.clone())
    }

    fn schedule(&self, renderer_id: &RendererId) {
        let token = self.inner.shutdown.child_token();
        let (delay, attempt) = {
            let mut states = self.inner.states.lock();
            let Some(state) = states.get_mut(renderer_id) else {
                return;
            };
            if let Some(previous) = state.timer.replace(token.clone()) {
                previous.cancel();
            }
            (state.backoff.current(), state.backoff.failures() + 1)
        };

        log::info!(
            "[Reconnect] {} attempt {} in {}s",
            renderer_id,
            attempt,
            delay.as_secs()
        );
        self.inner.emitter.emit_renderer(RendererEvent::ReconnectScheduled {
            renderer_id: renderer_id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let this = self.clone();
        let id = renderer_id.clone();
        self.inner.spawner.spawn_after(token, delay, async move {
            this.attempt(&id).await;
        });
    }

    async fn attempt(&self, renderer_id: &RendererId) {
        let inner = &self.inner;
        let Some(endpoint) = inner.store.endpoint(renderer_id) else {
            self.cancel(renderer_id);
            return;
        };

        if let Some(state) = inner.states.lock().get_mut(renderer_id) {
            state.backoff.record_attempt();
        }
        inner.store.set_link(renderer_id, LinkState::Reconnecting);

        let connection = inner.registry.get(&endpoint);
        match connection.client().get_topology().await {
            Ok(_) => {
                log::info!("[Reconnect] {} is reachable again", renderer_id);
                inner.states.lock().remove(renderer_id);
                inner.store.set_link(renderer_id, LinkState::Alive);
                let _ = inner.recovered.send(renderer_id.clone());
            }
            Err(e) => {
                log::warn!("[Reconnect] {} still unreachable: {}", renderer_id, e);
                match inner.states.lock().get_mut(renderer_id) {
                    Some(state) => state.backoff.record_failure(),
                    None => return,
                }
                inner.store.set_link(renderer_id, LinkState::Dead);
                self.schedule(renderer_id);
            }
        }
    }
}
