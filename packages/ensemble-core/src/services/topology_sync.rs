//! Resolves every known renderer to its coordinator's connection.
//!
//! Alive renderers are asked for the zone group state in id order until one
//! answers; each renderer in
//! the answer is routed through the registry connection of its group's
//! coordinator. Renderers that are not alive, or that the answer omits, are
//! left unrouted rather than keeping a stale route.

use std::sync::Arc;

use crate::events::{EventEmitter, TopologyEvent};
use crate::services::connection_registry::ConnectionRegistry;
use crate::services::renderer_store::{LinkState, RendererStore, Route};
use crate::sonos::types::{RendererId, TopologySnapshot};
use crate::utils::now_millis;

pub struct TopologySynchronizer {
    store: Arc<RendererStore>,
    registry: Arc<ConnectionRegistry>,
    emitter: Arc<dyn EventEmitter>,
}

impl TopologySynchronizer {
    pub fn new(
        store: Arc<RendererStore>,
        registry: Arc<ConnectionRegistry>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            store,
            registry,
            emitter,
        }
    }

    /// Runs one synchronization cycle.
    ///
    /// Returns the renderers whose route changed, or `None` if no alive
    /// renderer could answer (existing routes are then kept).
    pub async fn refresh(&self) -> Option<Vec<RendererId>> {
        let snapshot = self.query().await?;
        let changed = self.apply(&snapshot);

        if !changed.is_empty() {
            log::info!(
                "[Topology] {} route(s) changed: {:?}",
                changed.len(),
                changed
            );
            self.emitter.emit_topology(TopologyEvent::Changed {
                changed: changed.clone(),
                timestamp: now_millis(),
            });
        }

        Some(changed)
    }

    async fn query(&self) -> Option<TopologySnapshot> {
        for id in self.store.alive_ids() {
            let Some(endpoint) = self.store.endpoint(&id) else {
                continue;
            };
            let connection = self.registry.get(&endpoint);
            match connection.client().get_topology().await {
                Ok(snapshot) => return Some(snapshot),
                // The dead signal from the client drives recovery of this one
                Err(e) => log::warn!("[Topology] Query via {} failed: {}", id, e),
            }
        }
        log::debug!("[Topology] No alive renderer answered");
        None
    }

    /// Publishes routes from `snapshot` and returns the renderers whose route changed.
    pub(crate) fn apply(&self, snapshot: &TopologySnapshot) -> Vec<RendererId> {
        let mut changed = Vec::new();

        for id in self.store.ids() {
            let route = if self.store.link(&id) == Some(LinkState::Alive) {
                snapshot.group_of(&id).map(|group| Route {
                    coordinator_id: group.coordinator_id.clone(),
                    connection: self.registry.get(&group.coordinator),
                })
            } else {
                None
            };

            if self.store.set_route(&id, route) {
                changed.push(id);
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventEmitter;
    use crate::events::EngineEvent;
    use crate::services::test_support::{endpoint_of, topology, MockConnectionFactory};

    struct Fixture {
        factory: Arc<MockConnectionFactory>,
        store: Arc<RendererStore>,
        sync: TopologySynchronizer,
        events: tokio::sync::broadcast::Receiver<EngineEvent>,
    }

    fn fixture(ids: &[&str]) -> Fixture {
        let factory = Arc::new(MockConnectionFactory::new());
        let registry = Arc::new(ConnectionRegistry::new(factory.clone()));
        let store = Arc::new(RendererStore::new());
        for id in ids {
            store.insert(RendererId::new(*id), endpoint_of(id));
        }
        let emitter = BroadcastEventEmitter::new(16);
        let events = emitter.subscribe();
        let sync = TopologySynchronizer::new(store.clone(), registry, Arc::new(emitter));
        Fixture {
            factory,
            store,
            sync,
            events,
        }
    }

    fn coordinator_of(store: &RendererStore, id: &str) -> Option<String> {
        store
            .route(&RendererId::new(id))
            .map(|r| r.coordinator_id.to_string())
    }

    #[tokio::test]
    async fn grouped_renderers_share_the_coordinator_connection() {
        let mut fx = fixture(&["RINCON_A", "RINCON_B"]);
        fx.factory
            .set_topology(topology(&[("RINCON_A", &["RINCON_A", "RINCON_B"])]));

        let changed = fx.sync.refresh().await.expect("refreshed");

        assert_eq!(changed.len(), 2);
        let a = fx.store.route(&RendererId::new("RINCON_A")).expect("routed");
        let b = fx.store.route(&RendererId::new("RINCON_B")).expect("routed");
        assert!(Arc::ptr_eq(&a.connection, &b.connection));
        assert_eq!(a.connection.endpoint(), &endpoint_of("RINCON_A"));
        assert!(matches!(
            fx.events.try_recv(),
            Ok(EngineEvent::Topology(TopologyEvent::Changed { .. }))
        ));
    }

    #[tokio::test]
    async fn unchanged_topology_emits_nothing() {
        let mut fx = fixture(&["RINCON_A"]);
        fx.factory.set_topology(topology(&[("RINCON_A", &["RINCON_A"])]));

        fx.sync.refresh().await.expect("first");
        let _ = fx.events.try_recv();
        let changed = fx.sync.refresh().await.expect("second");

        assert!(changed.is_empty());
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn regrouping_remaps_to_the_new_coordinator() {
        let fx = fixture(&["RINCON_A", "RINCON_B"]);
        fx.factory
            .set_topology(topology(&[("RINCON_A", &["RINCON_A", "RINCON_B"])]));
        fx.sync.refresh().await.expect("first");

        fx.factory.set_topology(topology(&[
            ("RINCON_A", &["RINCON_A"]),
            ("RINCON_B", &["RINCON_B"]),
        ]));
        let changed = fx.sync.refresh().await.expect("second");

        assert_eq!(changed, vec![RendererId::new("RINCON_B")]);
        assert_eq!(coordinator_of(&fx.store, "RINCON_B").as_deref(), Some("RINCON_B"));
    }

    #[tokio::test]
    async fn failed_query_keeps_existing_routes() {
        let fx = fixture(&["RINCON_A"]);
        fx.factory.set_topology(topology(&[("RINCON_A", &["RINCON_A"])]));
        fx.sync.refresh().await.expect("first");

        fx.factory.renderer("RINCON_A").set_down(true);
        assert!(fx.sync.refresh().await.is_none());
        assert_eq!(coordinator_of(&fx.store, "RINCON_A").as_deref(), Some("RINCON_A"));
    }

    #[tokio::test]
    async fn query_falls_through_to_the_next_alive_renderer() {
        let fx = fixture(&["RINCON_A", "RINCON_B"]);
        fx.factory
            .set_topology(topology(&[("RINCON_B", &["RINCON_A", "RINCON_B"])]));
        fx.factory.renderer("RINCON_A").set_down(true);

        let changed = fx.sync.refresh().await.expect("answered by B");

        assert_eq!(changed.len(), 2);
        assert_eq!(fx.factory.renderer("RINCON_A").count("get_topology"), 1);
        assert_eq!(fx.factory.renderer("RINCON_B").count("get_topology"), 1);
        assert_eq!(coordinator_of(&fx.store, "RINCON_A").as_deref(), Some("RINCON_B"));
    }

    #[tokio::test]
    async fn dead_and_missing_renderers_are_unrouted() {
        let fx = fixture(&["RINCON_A", "RINCON_B", "RINCON_C"]);
        fx.factory.set_topology(topology(&[(
            "RINCON_A",
            &["RINCON_A", "RINCON_B"],
        )]));
        fx.store
            .set_link(&RendererId::new("RINCON_B"), LinkState::Dead);

        fx.sync.refresh().await.expect("refreshed");

        assert!(coordinator_of(&fx.store, "RINCON_A").is_some());
        assert!(coordinator_of(&fx.store, "RINCON_B").is_none());
        assert!(coordinator_of(&fx.store, "RINCON_C").is_none());
    }
}
