//! Domain types for renderers, zone groups and transport observations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Stable identifier of a renderer (the RINCON_xxx UUID for Sonos players).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RendererId(String);

impl RendererId {
    /// Creates a renderer id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RendererId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RendererId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RendererId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Network endpoint of a renderer. Connections are keyed by this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL for HTTP requests to this endpoint (no trailing slash).
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Topology
// ─────────────────────────────────────────────────────────────────────────────

/// A member of a zone group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneGroupMember {
    pub id: RendererId,
    pub endpoint: Endpoint,
    pub zone_name: String,
}

/// One group as reported by the ZoneGroupTopology service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneGroup {
    pub id: String,
    pub coordinator_id: RendererId,
    pub coordinator: Endpoint,
    pub members: Vec<ZoneGroupMember>,
}

impl ZoneGroup {
    /// Returns true if the renderer is a member of this group.
    #[must_use]
    pub fn contains(&self, id: &RendererId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }
}

/// Immutable topology captured at one point in time.
///
/// Construction enforces that each renderer appears in exactly one group and
/// that every group's coordinator is one of its members. Groups violating the
/// latter are dropped, and a renderer listed twice keeps its first group.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySnapshot {
    groups: Vec<ZoneGroup>,
    captured_at: u64,
}

impl TopologySnapshot {
    pub fn new(groups: Vec<ZoneGroup>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let groups = groups
            .into_iter()
            .filter(|g| g.contains(&g.coordinator_id))
            .map(|mut g| {
                g.members.retain(|m| seen.insert(m.id.clone()));
                g
            })
            .filter(|g| g.contains(&g.coordinator_id))
            .collect();

        Self {
            groups,
            captured_at: now_millis(),
        }
    }

    #[must_use]
    pub fn groups(&self) -> &[ZoneGroup] {
        &self.groups
    }

    /// Unix timestamp (ms) at which the snapshot was taken.
    #[must_use]
    pub fn captured_at(&self) -> u64 {
        self.captured_at
    }

    /// Returns the group the renderer belongs to, if any.
    #[must_use]
    pub fn group_of(&self, id: &RendererId) -> Option<&ZoneGroup> {
        self.groups.iter().find(|g| g.contains(id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport observations
// ─────────────────────────────────────────────────────────────────────────────

/// Playback state as last reported by a renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    #[default]
    Unknown,
}

impl PlaybackState {
    /// Maps a UPnP `CurrentTransportState` value.
    #[must_use]
    pub fn from_upnp(value: &str) -> Self {
        match value {
            "PLAYING" => Self::Playing,
            "PAUSED_PLAYBACK" => Self::Paused,
            "STOPPED" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_playing(self) -> bool {
        self == Self::Playing
    }
}

/// Descriptive metadata of the track a device reports as current.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedTrack {
    pub uri: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_ms: Option<u64>,
}

/// A point-in-time observation of a coordinator's transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub state: PlaybackState,
    /// 1-based queue position of the current track (0 when the queue is empty).
    pub queue_position: u32,
    pub position_ms: u64,
    pub track: Option<ReportedTrack>,
}

/// Result of an `AddURIToQueue` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInsertion {
    pub first_track_number: u32,
    pub tracks_added: u32,
    pub queue_length: u32,
}

/// Parameters for inserting a URI into a coordinator's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub uri: String,
    pub metadata: String,
    pub as_next: bool,
    /// Desired 1-based position; 0 appends at the end.
    pub desired_position: u32,
}
