//! Sonos transport client.
//!
//! This module implements the transport client the engine drives, speaking
//! UPnP/SOAP to Sonos players.
//!
//! # Module Structure
//!
//! - `types` - Domain types for renderers, zone groups and transport reports
//! - `traits` - Transport client trait abstractions for testability
//! - `client` - `SoapTransportClient` concrete trait implementation
//! - `zone_groups` - ZoneGroupState parsing
//! - `didl` - Codec-specific URI and DIDL-Lite encoding, track report parsing
//! - `retry` - Retry of transient faults on read-only queries
//! - `soap` - SOAP actions, envelopes, service URNs and the HTTP round trip
//! - `utils` - Shared XML and URL helpers

pub mod client;
pub mod didl;
pub(crate) mod retry;
pub mod soap;
pub mod traits;
pub mod types;
pub mod utils;
pub(crate) mod zone_groups;

// Re-export domain types
pub use soap::{SoapAction, SonosService};

// Re-export trait abstractions
pub use traits::{ConnectionFactory, TransportClient, TransportEvent};

// Re-export concrete implementation
pub use client::{SoapConnectionFactory, SoapTransportClient};
