//! Track descriptors and per-renderer track requests.
//!
//! A [`TrackDescriptor`] is produced by an external catalog and consumed by
//! the action dispatcher. The codec tag selects one of the closed set of
//! encodings in [`Codec`].

use std::fmt;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::sonos::types::{RendererId, ReportedTrack};

/// Separator between the queue container and the track URI in the stream
/// reference of a [`Codec::SonosQueue`] track.
pub const QUEUE_REF_SEPARATOR: char = '!';

/// Marker preceding the track id in a decoded Spotify resource URI.
const SPOTIFY_TRACK_PREFIX: &str = "spotify:track:";

/// Codec families the engine can encode into Sonos actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    /// A track from the player's own library, addressed by queue container
    /// and track URI (`<queue-uri>!<percent-encoded track uri>`).
    #[serde(rename = "sonos:track:uri")]
    SonosQueue,
    /// A Spotify track id served through the Sonos Spotify integration.
    #[serde(rename = "spotify:track:id")]
    Spotify,
    /// A plain HTTP MP3 stream.
    #[serde(rename = "audio:mp3")]
    HttpStream,
}

impl Codec {
    /// Returns the wire tag for this codec.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SonosQueue => "sonos:track:uri",
            Self::Spotify => "spotify:track:id",
            Self::HttpStream => "audio:mp3",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = EngineError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "sonos:track:uri" => Ok(Self::SonosQueue),
            "spotify:track:id" => Ok(Self::Spotify),
            "audio:mp3" => Ok(Self::HttpStream),
            other => Err(EngineError::UnsupportedCodec(other.to_string())),
        }
    }
}

/// Immutable description of a track to play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDescriptor {
    pub codec: Codec,
    /// Codec-specific addressable resource.
    pub stream_ref: String,
    pub title: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub artists: Vec<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub artwork_uris: Vec<String>,
}

impl TrackDescriptor {
    pub fn new(codec: Codec, stream_ref: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            codec,
            stream_ref: stream_ref.into(),
            title: title.into(),
            album: None,
            artists: Vec::new(),
            duration_ms: None,
            artwork_uris: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }

    #[must_use]
    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artists.push(artist.into());
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    #[must_use]
    pub fn with_artwork(mut self, uri: impl Into<String>) -> Self {
        self.artwork_uris.push(uri.into());
        self
    }

    /// Main performing artist, if any.
    #[must_use]
    pub fn primary_artist(&self) -> Option<&str> {
        self.artists.first().map(String::as_str)
    }

    /// The decoded identity a device reports while it plays this track: the
    /// track URI for library and HTTP tracks, the bare id for Spotify.
    #[must_use]
    pub fn match_key(&self) -> String {
        let raw = match self.codec {
            Codec::SonosQueue => self
                .stream_ref
                .split_once(QUEUE_REF_SEPARATOR)
                .map_or(self.stream_ref.as_str(), |(_, track)| track),
            Codec::Spotify | Codec::HttpStream => self.stream_ref.as_str(),
        };
        percent_decode_str(raw).decode_utf8_lossy().into_owned()
    }

    /// Returns true if the device's reported URI refers to this track.
    ///
    /// Both sides are compared decoded and in full. Spotify URIs are reduced
    /// to the id between `spotify:track:` and the query string first.
    #[must_use]
    pub fn is_reported_uri(&self, uri: &str) -> bool {
        let reported = percent_decode_str(uri).decode_utf8_lossy();
        match self.codec {
            Codec::Spotify => reported
                .split_once(SPOTIFY_TRACK_PREFIX)
                .and_then(|(_, rest)| rest.split(['?', '&']).next())
                .is_some_and(|id| id == self.match_key()),
            Codec::SonosQueue | Codec::HttpStream => reported == self.match_key(),
        }
    }

    /// Compares a device report against this descriptor, ignoring position.
    ///
    /// The URI must refer to this track. Descriptive fields only count as a
    /// mismatch when the device reports a value and it differs; durations are
    /// compared at whole-second resolution.
    #[must_use]
    pub fn matches(&self, reported: &ReportedTrack) -> bool {
        if !self.is_reported_uri(&reported.uri) {
            return false;
        }

        let differs = |expected: Option<&str>, actual: &Option<String>| match (expected, actual)
        {
            (Some(e), Some(a)) if !a.is_empty() => e != a,
            _ => false,
        };

        if differs(Some(self.title.as_str()), &reported.title)
            || differs(self.primary_artist(), &reported.artist)
            || differs(self.album.as_deref(), &reported.album)
        {
            return false;
        }

        match (self.duration_ms, reported.duration_ms) {
            (Some(e), Some(a)) if a > 0 => (e + 500) / 1000 == (a + 500) / 1000,
            _ => true,
        }
    }
}

/// Caller options of a "set track" intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackOptions {
    /// Position to seek to after the track is committed (ms).
    pub position_ms: u64,
    /// Submission delay (ms). Below the now-threshold the queue is replaced.
    pub delay_ms: u64,
    pub start_playing: bool,
}

/// One admitted "set track" intent.
#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub renderer_id: RendererId,
    pub track: TrackDescriptor,
    pub options: TrackOptions,
    /// Per-renderer sequence number, strictly increasing from 1.
    pub seq: u64,
}
