//! Per-renderer engine state.
//!
//! Holds, for every known renderer, its routing (coordinator connection),
//! link state, expected playback state, last observations and the event
//! subscriptions it owns. Each accessor locks one map shard briefly and never
//! across an await.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::services::connection_registry::Connection;
use crate::sonos::types::{Endpoint, PlaybackState, RendererId, ReportedTrack, TransportSnapshot};
use crate::track::TrackDescriptor;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Reachability of a renderer's own endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    Alive,
    Dead,
    Reconnecting,
}

/// Where commands for a renderer go.
#[derive(Debug, Clone)]
pub struct Route {
    pub coordinator_id: RendererId,
    pub connection: Arc<Connection>,
}

impl Route {
    fn same_target(&self, other: &Route) -> bool {
        self.coordinator_id == other.coordinator_id && Arc::ptr_eq(&self.connection, &other.connection)
    }
}

/// What the engine believes the renderer is playing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedState {
    pub track: TrackDescriptor,
    /// Consecutive reconciliation mismatches.
    pub strikes: u32,
}

/// Handle to a listener task. Dropping it stops the listener.
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Read-only view of a renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererInfo {
    pub id: RendererId,
    pub endpoint: Endpoint,
    pub coordinator_id: Option<RendererId>,
    pub link: LinkState,
    pub playback_state: PlaybackState,
    pub position_ms: u64,
    pub track: Option<ReportedTrack>,
    pub expected_track: Option<TrackDescriptor>,
    pub sink_active: bool,
    pub volume: Option<u8>,
    pub muted: Option<bool>,
}

struct RendererEntry {
    endpoint: Endpoint,
    link: LinkState,
    route: Option<Route>,
    expected: Option<ExpectedState>,
    /// Suppresses reconciliation and sink updates while a track change is in flight.
    transition_in_flight: bool,
    sink_active: bool,
    playback_state: PlaybackState,
    position_ms: u64,
    track: Option<ReportedTrack>,
    volume: Option<u8>,
    muted: Option<bool>,
    subscriptions: Vec<Subscription>,
}

impl RendererEntry {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            link: LinkState::Alive,
            route: None,
            expected: None,
            transition_in_flight: false,
            sink_active: false,
            playback_state: PlaybackState::Unknown,
            position_ms: 0,
            track: None,
            volume: None,
            muted: None,
            subscriptions: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Indexed storage of all known renderers.
pub struct RendererStore {
    renderers: DashMap<RendererId, RendererEntry>,
}

impl Default for RendererStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RendererStore {
    pub fn new() -> Self {
        Self {
            renderers: DashMap::new(),
        }
    }

    /// Registers a renderer. Returns false if the id is already known.
    pub fn insert(&self, id: RendererId, endpoint: Endpoint) -> bool {
        match self.renderers.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(RendererEntry::new(endpoint));
                true
            }
        }
    }

    /// Forgets a renderer, releasing its subscriptions.
    pub fn remove(&self, id: &RendererId) -> bool {
        self.renderers.remove(id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: &RendererId) -> bool {
        self.renderers.contains_key(id)
    }

    /// All renderer ids in sorted order.
    #[must_use]
    pub fn ids(&self) -> Vec<RendererId> {
        let mut ids: Vec<_> = self.renderers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Alive renderers in sorted order.
    #[must_use]
    pub fn alive_ids(&self) -> Vec<RendererId> {
        let mut ids: Vec<_> = self
            .renderers
            .iter()
            .filter(|e| e.link == LinkState::Alive)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn endpoint(&self, id: &RendererId) -> Option<Endpoint> {
        self.renderers.get(id).map(|e| e.endpoint.clone())
    }

    #[must_use]
    pub fn info(&self, id: &RendererId) -> Option<RendererInfo> {
        self.renderers.get(id).map(|e| RendererInfo {
            id: id.clone(),
            endpoint: e.endpoint.clone(),
            coordinator_id: e.route.as_ref().map(|r| r.coordinator_id.clone()),
            link: e.link,
            playback_state: e.playback_state,
            position_ms: e.position_ms,
            track: e.track.clone(),
            expected_track: e.expected.as_ref().map(|x| x.track.clone()),
            sink_active: e.sink_active,
            volume: e.volume,
            muted: e.muted,
        })
    }

    // ─── Routing ───

    #[must_use]
    pub fn route(&self, id: &RendererId) -> Option<Route> {
        self.renderers.get(id).and_then(|e| e.route.clone())
    }

    /// Publishes a renderer's route. Returns true if the target changed.
    pub fn set_route(&self, id: &RendererId, route: Option<Route>) -> bool {
        let Some(mut entry) = self.renderers.get_mut(id) else {
            return false;
        };
        let changed = match (&entry.route, &route) {
            (Some(old), Some(new)) => !old.same_target(new),
            (None, None) => false,
            _ => true,
        };
        entry.route = route;
        changed
    }

    // ─── Link state ───

    #[must_use]
    pub fn link(&self, id: &RendererId) -> Option<LinkState> {
        self.renderers.get(id).map(|e| e.link)
    }

    /// Sets the link state, returning the previous one.
    pub fn set_link(&self, id: &RendererId, link: LinkState) -> Option<LinkState> {
        self.renderers
            .get_mut(id)
            .map(|mut e| std::mem::replace(&mut e.link, link))
    }

    /// Replaces the renderer's listener subscriptions; the old ones stop.
    pub fn set_subscriptions(&self, id: &RendererId, subscriptions: Vec<Subscription>) {
        if let Some(mut e) = self.renderers.get_mut(id) {
            e.subscriptions = subscriptions;
        }
    }

    pub fn clear_subscriptions(&self, id: &RendererId) {
        self.set_subscriptions(id, Vec::new());
    }

    // ─── Expected state ───

    #[must_use]
    pub fn expected(&self, id: &RendererId) -> Option<ExpectedState> {
        self.renderers.get(id).and_then(|e| e.expected.clone())
    }

    /// Records a committed track with a clean strike count.
    pub fn set_expected(&self, id: &RendererId, track: TrackDescriptor) {
        if let Some(mut e) = self.renderers.get_mut(id) {
            e.expected = Some(ExpectedState { track, strikes: 0 });
        }
    }

    pub fn clear_expected(&self, id: &RendererId) {
        if let Some(mut e) = self.renderers.get_mut(id) {
            e.expected = None;
        }
    }

    /// Adds a strike and returns the new count (0 without expected state).
    pub fn record_mismatch(&self, id: &RendererId) -> u32 {
        self.renderers
            .get_mut(id)
            .and_then(|mut e| {
                e.expected.as_mut().map(|x| {
                    x.strikes += 1;
                    x.strikes
                })
            })
            .unwrap_or(0)
    }

    pub fn reset_strikes(&self, id: &RendererId) {
        if let Some(mut e) = self.renderers.get_mut(id) {
            if let Some(x) = e.expected.as_mut() {
                x.strikes = 0;
            }
        }
    }

    // ─── Flags ───

    #[must_use]
    pub fn in_transition(&self, id: &RendererId) -> bool {
        self.renderers
            .get(id)
            .is_some_and(|e| e.transition_in_flight)
    }

    pub fn set_transition(&self, id: &RendererId, in_flight: bool) {
        if let Some(mut e) = self.renderers.get_mut(id) {
            e.transition_in_flight = in_flight;
        }
    }

    #[must_use]
    pub fn is_sink_active(&self, id: &RendererId) -> bool {
        self.renderers.get(id).is_some_and(|e| e.sink_active)
    }

    pub fn set_sink_active(&self, id: &RendererId, active: bool) {
        if let Some(mut e) = self.renderers.get_mut(id) {
            e.sink_active = active;
        }
    }

    // ─── Observations ───

    /// Stores a transport observation and returns the previously observed
    /// position and whether the playing flag changed.
    pub fn record_snapshot(&self, id: &RendererId, snapshot: &TransportSnapshot) -> Option<Observed> {
        self.renderers.get_mut(id).map(|mut e| {
            let previous_position_ms = e.position_ms;
            let was_playing = e.playback_state.is_playing();
            e.playback_state = snapshot.state;
            e.position_ms = snapshot.position_ms;
            e.track = snapshot.track.clone();
            Observed {
                previous_position_ms,
                playing_changed: was_playing != snapshot.state.is_playing(),
            }
        })
    }

    #[must_use]
    pub fn position_ms(&self, id: &RendererId) -> Option<u64> {
        self.renderers.get(id).map(|e| e.position_ms)
    }

    /// Stores the group volume. Returns true if it changed.
    pub fn record_volume(&self, id: &RendererId, volume: u8) -> bool {
        self.renderers
            .get_mut(id)
            .is_some_and(|mut e| e.volume.replace(volume) != Some(volume))
    }

    /// Stores the group mute flag. Returns true if it changed.
    pub fn record_muted(&self, id: &RendererId, muted: bool) -> bool {
        self.renderers
            .get_mut(id)
            .is_some_and(|mut e| e.muted.replace(muted) != Some(muted))
    }

    /// Renderers currently routed through the given coordinator.
    #[must_use]
    pub fn routed_through(&self, coordinator_id: &RendererId) -> Vec<RendererId> {
        let mut ids: Vec<_> = self
            .renderers
            .iter()
            .filter(|e| {
                e.route
                    .as_ref()
                    .is_some_and(|r| &r.coordinator_id == coordinator_id)
            })
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Result of [`RendererStore::record_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    pub previous_position_ms: u64,
    pub playing_changed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connection_registry::ConnectionRegistry;
    use crate::services::test_support::MockConnectionFactory;
    use crate::track::Codec;

    fn id(s: &str) -> RendererId {
        RendererId::new(s)
    }

    fn store_with(ids: &[&str]) -> RendererStore {
        let store = RendererStore::new();
        for (i, r) in ids.iter().enumerate() {
            store.insert(id(r), Endpoint::new(format!("10.0.0.{}", i + 1), 1400));
        }
        store
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = store_with(&["RINCON_A"]);
        assert!(!store.insert(id("RINCON_A"), Endpoint::new("10.0.0.9", 1400)));
        assert_eq!(store.endpoint(&id("RINCON_A")), Some(Endpoint::new("10.0.0.1", 1400)));
    }

    #[test]
    fn set_route_reports_changes_only() {
        let store = store_with(&["RINCON_A"]);
        let registry = ConnectionRegistry::new(Arc::new(MockConnectionFactory::new()));
        let route = Route {
            coordinator_id: id("RINCON_A"),
            connection: registry.get(&Endpoint::new("10.0.0.1", 1400)),
        };

        assert!(store.set_route(&id("RINCON_A"), Some(route.clone())));
        assert!(!store.set_route(&id("RINCON_A"), Some(route)));
        assert!(store.set_route(&id("RINCON_A"), None));
        assert!(!store.set_route(&id("RINCON_A"), None));
    }

    #[test]
    fn strikes_accumulate_and_reset() {
        let store = store_with(&["RINCON_A"]);
        assert_eq!(store.record_mismatch(&id("RINCON_A")), 0);

        store.set_expected(
            &id("RINCON_A"),
            TrackDescriptor::new(Codec::HttpStream, "http://a/w.mp3", "W"),
        );
        assert_eq!(store.record_mismatch(&id("RINCON_A")), 1);
        assert_eq!(store.record_mismatch(&id("RINCON_A")), 2);
        store.reset_strikes(&id("RINCON_A"));
        assert_eq!(store.record_mismatch(&id("RINCON_A")), 1);
    }

    #[test]
    fn dropping_subscriptions_cancels_listeners() {
        let store = store_with(&["RINCON_A"]);
        let token = CancellationToken::new();
        store.set_subscriptions(&id("RINCON_A"), vec![Subscription::new(token.clone())]);
        assert!(!token.is_cancelled());

        store.remove(&id("RINCON_A"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn record_volume_detects_change() {
        let store = store_with(&["RINCON_A"]);
        assert!(store.record_volume(&id("RINCON_A"), 20));
        assert!(!store.record_volume(&id("RINCON_A"), 20));
        assert!(store.record_volume(&id("RINCON_A"), 25));
    }
}
