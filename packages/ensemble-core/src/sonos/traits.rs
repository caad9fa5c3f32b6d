//! Trait abstractions for the transport client.
//!
//! The engine depends on these traits rather than on the SOAP client, so
//! services can be driven by mock transports in tests. One client instance is
//! bound to one network endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::SoapResult;
use crate::sonos::types::{
    EnqueueRequest, Endpoint, QueueInsertion, TopologySnapshot, TransportSnapshot,
};

/// Notifications a transport client pushes to its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The endpoint stopped answering at the connection level.
    Dead,
    /// A fresh observation of the transport.
    TransportState(TransportSnapshot),
    /// Group volume observed on the coordinator (0-100).
    GroupVolume(u8),
    /// Group mute observed on the coordinator.
    GroupMute(bool),
}

/// Transport (queue and playback) operations.
#[async_trait]
pub trait TransportControl: Send + Sync {
    /// Reports the current track, queue position, elapsed time and state,
    /// and publishes the report as [`TransportEvent::TransportState`].
    async fn current_track(&self) -> SoapResult<TransportSnapshot>;

    /// Same report as [`current_track`](Self::current_track), not published.
    ///
    /// Periodic polls use this so their reports reach the sink only through
    /// reconciliation.
    async fn poll_track(&self) -> SoapResult<TransportSnapshot>;

    /// Returns the URI of the active transport source.
    async fn transport_uri(&self) -> SoapResult<String>;

    async fn play(&self) -> SoapResult<()>;

    async fn pause(&self) -> SoapResult<()>;

    async fn next(&self) -> SoapResult<()>;

    async fn previous(&self) -> SoapResult<()>;

    /// Seeks within the current track.
    async fn seek(&self, position_ms: u64) -> SoapResult<()>;

    /// Jumps to a 1-based queue position.
    async fn seek_track(&self, track_number: u32) -> SoapResult<()>;

    /// Clears the play queue.
    async fn flush(&self) -> SoapResult<()>;

    /// Removes the item at a 1-based queue position.
    async fn remove_from_queue(&self, track_number: u32) -> SoapResult<()>;

    /// Inserts a URI into the queue and reports where it landed.
    async fn add_uri_to_queue(&self, request: &EnqueueRequest) -> SoapResult<QueueInsertion>;

    /// Replaces the active transport source.
    async fn set_av_transport(&self, uri: &str, metadata: &str) -> SoapResult<()>;
}

/// Zone group topology queries.
#[async_trait]
pub trait TopologyQuery: Send + Sync {
    async fn get_topology(&self) -> SoapResult<TopologySnapshot>;
}

/// Group volume and mute on a coordinator.
#[async_trait]
pub trait GroupVolumeControl: Send + Sync {
    /// Gets the group volume (0-100).
    async fn get_volume(&self) -> SoapResult<u8>;

    /// Sets the group volume; values above 100 are clamped.
    async fn set_volume(&self, volume: u8) -> SoapResult<()>;

    async fn get_muted(&self) -> SoapResult<bool>;

    async fn set_muted(&self, muted: bool) -> SoapResult<()>;
}

/// Complete transport client bound to one endpoint.
pub trait TransportClient: TransportControl + TopologyQuery + GroupVolumeControl {
    /// The endpoint this client talks to.
    fn endpoint(&self) -> &Endpoint;

    /// Subscribes to this client's event stream.
    ///
    /// Dropping the receiver is the only unsubscription needed.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Creates transport clients for endpoints. Used by the connection registry.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Arc<dyn TransportClient>;
}
