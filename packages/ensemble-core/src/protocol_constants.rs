//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the UPnP/Sonos protocols. Tunable timings live
//! in [`EngineConfig`](crate::state::EngineConfig) instead.

// ─────────────────────────────────────────────────────────────────────────────
// HTTP/SOAP
// ─────────────────────────────────────────────────────────────────────────────

/// Timeout for SOAP HTTP requests (seconds).
///
/// 10 seconds is reasonable for LAN operations.
pub const SOAP_TIMEOUT_SECS: u64 = 10;

/// Default UPnP port of Sonos players.
pub const DEFAULT_SONOS_PORT: u16 = 1400;

// ─────────────────────────────────────────────────────────────────────────────
// Queue and metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Scheme prefix of a coordinator's local queue transport URI.
pub const QUEUE_URI_PREFIX: &str = "x-rincon-queue:";

/// Object id prefix of a queue item, followed by its 1-based position.
pub const QUEUE_OBJECT_PREFIX: &str = "Q:0/";

/// Scheme of queued tracks served by the Spotify music service.
pub const SPOTIFY_URI_SCHEME: &str = "x-sonos-spotify:";

/// Flags sent with Spotify track URIs.
pub const SPOTIFY_URI_FLAGS: u32 = 8224;

/// Item id prefix Sonos expects for Spotify tracks in DIDL-Lite.
pub const SPOTIFY_ITEM_PREFIX: &str = "00032020";

/// Descriptor used for tracks coming from the player's own music library.
pub const ASSOCIATED_ZP_UDN: &str = "RINCON_AssociatedZPUDN";

/// DIDL-Lite namespace declarations shared by all metadata envelopes.
pub const DIDL_NAMESPACES: &str = r#"xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/" xmlns:r="urn:schemas-rinconnetworks-com:metadata-1-0/" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/""#;

// ─────────────────────────────────────────────────────────────────────────────
// Track arrival heuristics
// ─────────────────────────────────────────────────────────────────────────────

/// A queued "next" track counts as started only while its elapsed time is
/// below this bound (ms).
pub const NEXT_TRACK_STARTED_WITHIN_MS: u64 = 10_000;

/// Reported positions at or below this value (ms) count as "at the start".
pub const LOOP_START_TOLERANCE_MS: u64 = 1_500;

// ─────────────────────────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of each transport client's event broadcast channel.
pub const TRANSPORT_EVENT_CHANNEL_CAPACITY: usize = 64;
