//! Translates a track into the protocol actions of one placement mode.
//!
//! The dispatcher performs no retries and takes no locks: the sequencer holds
//! the connection's command lock around every call into it.

use crate::error::EngineResult;
use crate::protocol_constants::QUEUE_URI_PREFIX;
use crate::services::renderer_store::Route;
use crate::sonos::didl::encode_track;
use crate::sonos::types::{EnqueueRequest, QueueInsertion};
use crate::state::StreamingServiceConfig;
use crate::track::TrackDescriptor;

/// Where a track lands in the coordinator's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMode {
    /// Append to the end of the queue.
    Queue,
    /// Insert after the current item and jump to it.
    Now,
    /// Insert after the current item so it plays when the current one ends.
    Next,
}

pub struct ActionDispatcher {
    streaming_service: StreamingServiceConfig,
}

impl ActionDispatcher {
    pub fn new(streaming_service: StreamingServiceConfig) -> Self {
        Self { streaming_service }
    }

    /// Encodes `track` and issues the mode's action sequence on the route's
    /// coordinator.
    pub async fn apply(
        &self,
        route: &Route,
        mode: ActionMode,
        track: &TrackDescriptor,
    ) -> EngineResult<QueueInsertion> {
        let encoded = encode_track(track, &self.streaming_service)?;
        let client = route.connection.client();

        log::debug!(
            "[Dispatch] {:?} '{}' on coordinator {}",
            mode,
            track.title,
            route.coordinator_id
        );

        let (as_next, desired_position) = match mode {
            ActionMode::Queue => (false, 0),
            ActionMode::Now => {
                // Queue actions only take effect while the queue is the source
                let current = client.transport_uri().await?;
                if !current.starts_with(QUEUE_URI_PREFIX) {
                    let queue_uri = format!("{}{}#0", QUEUE_URI_PREFIX, route.coordinator_id);
                    client.set_av_transport(&queue_uri, "").await?;
                }
                let snapshot = client.current_track().await?;
                (true, snapshot.queue_position + 1)
            }
            ActionMode::Next => {
                let snapshot = client.current_track().await?;
                (true, snapshot.queue_position + 1)
            }
        };

        let insertion = client
            .add_uri_to_queue(&EnqueueRequest {
                uri: encoded.uri,
                metadata: encoded.metadata,
                as_next,
                desired_position,
            })
            .await?;

        if mode == ActionMode::Now {
            client.seek_track(insertion.first_track_number).await?;
        }

        Ok(insertion)
    }
}
