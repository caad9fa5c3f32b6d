//! Coordination services.
//!
//! This module contains the services the engine composes: routing state,
//! topology synchronization, reconnection, request sequencing, action
//! dispatch and reconciliation.

pub mod action_dispatcher;
pub mod connection_registry;
pub mod reconciliation;
pub mod reconnect_supervisor;
pub mod renderer_store;
pub mod speaker_sink;
#[cfg(test)]
pub(crate) mod test_support;
pub mod topology_sync;
pub mod track_sequencer;

pub use action_dispatcher::{ActionDispatcher, ActionMode};
pub use connection_registry::{Connection, ConnectionRegistry};
pub use reconciliation::{ReconcileOutcome, ReconciliationPoller};
pub use reconnect_supervisor::{Backoff, ReconnectSupervisor};
pub use renderer_store::{LinkState, RendererInfo, RendererStore, Route};
pub use speaker_sink::{LoggingSpeakerSink, NoopSpeakerSink, SinkUpdate, SpeakerSink};
pub use topology_sync::TopologySynchronizer;
pub use track_sequencer::TrackSequencer;
