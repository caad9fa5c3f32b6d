//! Ensemble Core - playback coordination for grouped Sonos renderers.
//!
//! This crate keeps a controller-side view of which renderer leads which
//! group, serializes and debounces "play this track" requests per renderer,
//! detects when a renderer silently stops playing what it should, and
//! recovers lost connections with capped exponential backoff.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`engine`]: Composition root and public API ([`PlaybackEngine`])
//! - [`services`]: Routing state, topology sync, reconnect, sequencing,
//!   action dispatch and reconciliation
//! - [`sonos`]: Transport client traits and the UPnP/SOAP implementation
//! - [`track`]: Track descriptors and codecs
//! - [`events`]: Domain events
//! - [`state`]: Engine configuration
//! - [`runtime`]: Task spawning abstraction
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! - [`TransportClient`](sonos::TransportClient): Primitive operations against one endpoint
//! - [`ConnectionFactory`](sonos::ConnectionFactory): Creates transport clients
//! - [`SpeakerSink`](services::SpeakerSink): Receives position and availability updates
//! - [`EventEmitter`](events::EventEmitter): Emitting domain events
//! - [`TaskSpawner`](runtime::TaskSpawner): Spawning background tasks

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod events;
pub mod protocol_constants;
pub mod runtime;
pub mod services;
pub mod sonos;
pub mod state;
pub mod track;
pub mod utils;

// Re-export commonly used types at the crate root
pub use engine::PlaybackEngine;
pub use error::{EngineError, EngineResult, ErrorCode, SoapResult};
pub use events::{
    BroadcastEventEmitter, EngineEvent, EventEmitter, LoggingEventEmitter, NoopEventEmitter,
    PlaybackEvent, RendererEvent, TopologyEvent, UnavailableReason,
};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use state::{EngineConfig, StreamingServiceConfig};
pub use track::{Codec, TrackDescriptor, TrackOptions};
pub use utils::now_millis;

// Re-export service types
pub use services::{
    LinkState, LoggingSpeakerSink, NoopSpeakerSink, RendererInfo, SinkUpdate, SpeakerSink,
};

// Re-export Sonos types
pub use sonos::types::{Endpoint, PlaybackState, QueueInsertion, RendererId};
pub use sonos::{ConnectionFactory, SoapConnectionFactory, SoapTransportClient, TransportClient};
