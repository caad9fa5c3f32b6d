//! Engine configuration.
//!
//! Every timing the engine relies on is overridable here. Defaults match the
//! reference behavior of the Sonos integration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Account parameters used to encode tracks from the third-party streaming
/// service (Spotify) into Sonos queue URIs and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingServiceConfig {
    /// Sonos music service id (`sid` URI parameter).
    pub service_id: u32,
    /// Service type used in the DIDL-Lite `desc` token.
    pub service_type: u32,
    /// Account serial number (`sn` URI parameter).
    pub account_serial: u32,
}

impl Default for StreamingServiceConfig {
    fn default() -> Self {
        Self {
            service_id: 9,
            service_type: 2311,
            account_serial: 1,
        }
    }
}

/// Configuration for the playback coordination engine.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Topology
    /// Interval between topology refreshes (milliseconds).
    pub topology_poll_interval_ms: u64,

    // Reconciliation
    /// Interval between reconciliation polls of an active renderer (milliseconds).
    pub reconciliation_interval_ms: u64,

    /// Consecutive mismatches that declare a renderer desynchronized.
    pub strike_threshold: u32,

    // Reconnect
    /// First reconnect delay after a renderer goes dead (milliseconds).
    pub reconnect_base_ms: u64,

    /// Growth factor applied to the reconnect delay after each failed attempt.
    pub reconnect_multiplier: f64,

    /// Upper bound of the reconnect delay (milliseconds).
    pub reconnect_cap_ms: u64,

    // Track sequencing
    /// Requests with a delay below this value replace the queue and play now
    /// (milliseconds); longer delays queue the track as next.
    pub now_threshold_ms: u64,

    /// Grace added to the request delay when waiting for a queued track to
    /// start (milliseconds).
    pub next_track_grace_ms: u64,

    /// How often the device is polled while waiting for a queued track to
    /// start (milliseconds).
    pub next_track_poll_interval_ms: u64,

    /// Re-issue a request in "now" mode once when its queued track failed to
    /// start in time. When disabled the request fails instead.
    pub next_track_reissue: bool,

    /// Delay before the device position is republished after a track change
    /// (milliseconds).
    pub position_stabilize_ms: u64,

    // Codec encoding
    /// Streaming service account parameters.
    pub streaming_service: StreamingServiceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            topology_poll_interval_ms: 5_000,
            reconciliation_interval_ms: 5_000,
            strike_threshold: 3,
            reconnect_base_ms: 60_000,
            reconnect_multiplier: 1.5,
            reconnect_cap_ms: 3_600_000,
            now_threshold_ms: 500,
            next_track_grace_ms: 5_000,
            next_track_poll_interval_ms: 1_000,
            next_track_reissue: true,
            position_stabilize_ms: 3_000,
            streaming_service: StreamingServiceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.topology_poll_interval_ms == 0 {
            return Err("topology_poll_interval_ms must be >= 1".to_string());
        }
        if self.reconciliation_interval_ms == 0 {
            return Err("reconciliation_interval_ms must be >= 1".to_string());
        }
        if self.next_track_poll_interval_ms == 0 {
            return Err("next_track_poll_interval_ms must be >= 1".to_string());
        }
        if self.strike_threshold == 0 {
            return Err("strike_threshold must be >= 1".to_string());
        }
        if self.reconnect_base_ms == 0 {
            return Err("reconnect_base_ms must be >= 1".to_string());
        }
        if !(self.reconnect_multiplier.is_finite() && self.reconnect_multiplier >= 1.0) {
            return Err("reconnect_multiplier must be a finite value >= 1.0".to_string());
        }
        if self.reconnect_cap_ms < self.reconnect_base_ms {
            return Err("reconnect_cap_ms must be >= reconnect_base_ms".to_string());
        }
        Ok(())
    }

    #[must_use]
    pub fn topology_poll_interval(&self) -> Duration {
        Duration::from_millis(self.topology_poll_interval_ms)
    }

    #[must_use]
    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.reconciliation_interval_ms)
    }

    #[must_use]
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    #[must_use]
    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    #[must_use]
    pub fn next_track_poll_interval(&self) -> Duration {
        Duration::from_millis(self.next_track_poll_interval_ms)
    }

    #[must_use]
    pub fn position_stabilize(&self) -> Duration {
        Duration::from_millis(self.position_stabilize_ms)
    }

    /// Window in which a queued track must start, counted from admission.
    #[must_use]
    pub fn next_track_timeout(&self, delay_ms: u64) -> Duration {
        Duration::from_millis(delay_ms.saturating_add(self.next_track_grace_ms))
    }

    /// Returns true if a request with this delay replaces the queue and plays now.
    #[must_use]
    pub fn is_now(&self, delay_ms: u64) -> bool {
        delay_ms < self.now_threshold_ms
    }

    /// How close to the end (ms) a previous position must be for a position
    /// near zero to count as the track looping back to its start.
    #[must_use]
    pub fn loop_end_window_ms(&self) -> u64 {
        self.reconciliation_interval_ms.saturating_add(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let config = EngineConfig::default();
        assert_eq!(config.topology_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.reconnect_base(), Duration::from_secs(60));
        assert_eq!(config.reconnect_cap(), Duration::from_secs(3600));
        assert_eq!(config.strike_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn now_threshold_is_exclusive() {
        let config = EngineConfig::default();
        assert!(config.is_now(0));
        assert!(config.is_now(499));
        assert!(!config.is_now(500));
    }

    #[test]
    fn next_track_timeout_adds_grace() {
        let config = EngineConfig::default();
        assert_eq!(config.next_track_timeout(2_000), Duration::from_millis(7_000));
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let config = EngineConfig {
            reconnect_multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_cap_below_base() {
        let config = EngineConfig {
            reconnect_cap_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"strike_threshold": 4}"#).expect("valid config");
        assert_eq!(config.strike_threshold, 4);
        assert_eq!(config.reconnect_base_ms, 60_000);
    }
}
