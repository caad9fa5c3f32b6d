//! DIDL-Lite metadata for queue insertion and track reports.
//!
//! Each codec family needs its own addressable URI and metadata envelope
//! before Sonos accepts it into the queue. The reverse direction parses the
//! `TrackMetaData` a device reports for its current track.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::{EngineError, EngineResult};
use crate::protocol_constants::{
    ASSOCIATED_ZP_UDN, DIDL_NAMESPACES, SPOTIFY_ITEM_PREFIX, SPOTIFY_URI_FLAGS, SPOTIFY_URI_SCHEME,
};
use crate::sonos::types::ReportedTrack;
use crate::sonos::utils::{escape_xml, extract_xml_text};
use crate::state::StreamingServiceConfig;
use crate::track::{Codec, TrackDescriptor, QUEUE_REF_SEPARATOR};
use crate::utils::{format_upnp_time, parse_upnp_time};

/// Characters left unescaped by JavaScript's `encodeURIComponent`, which is
/// the encoding Sonos item ids are built with.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, URI_COMPONENT).to_string()
}

/// A track encoded for `AddURIToQueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTrack {
    pub uri: String,
    pub metadata: String,
}

/// Encodes a track descriptor into the URI and DIDL-Lite metadata its codec
/// requires.
pub fn encode_track(
    track: &TrackDescriptor,
    service: &StreamingServiceConfig,
) -> EngineResult<EncodedTrack> {
    if track.stream_ref.is_empty() {
        return Err(EngineError::InvalidRequest(
            "track stream reference is empty".into(),
        ));
    }

    match track.codec {
        Codec::SonosQueue => encode_library_track(track),
        Codec::Spotify => Ok(encode_spotify_track(track, service)),
        Codec::HttpStream => Ok(encode_http_stream(track)),
    }
}

fn encode_library_track(track: &TrackDescriptor) -> EngineResult<EncodedTrack> {
    let (queue_uri, track_uri) = track
        .stream_ref
        .split_once(QUEUE_REF_SEPARATOR)
        .filter(|(q, t)| !q.is_empty() && !t.is_empty())
        .ok_or_else(|| {
            EngineError::InvalidRequest(format!(
                "library track reference must be <queue>{}<track>: {}",
                QUEUE_REF_SEPARATOR, track.stream_ref
            ))
        })?;

    let uri = percent_decode_str(track_uri).decode_utf8_lossy().into_owned();

    let duration = track
        .duration_ms
        .map(|ms| (ms as f64 / 1000.0).to_string())
        .unwrap_or_default();
    let summary = [
        track.title.as_str(),
        track.primary_artist().unwrap_or_default(),
        track.album.as_deref().unwrap_or_default(),
        duration.as_str(),
    ]
    .join(",");

    let item_id = format!(
        "{}/{}:A{}",
        queue_uri,
        encode_component(track_uri),
        encode_component(&summary)
    );

    let metadata = format!(
        r#"<DIDL-Lite {ns}><item id="{id}" parentID="{parent}" restricted="true"><upnp:class>object.item.audioItem.musicTrack</upnp:class><desc id="cdudn" nameSpace="urn:schemas-rinconnetworks-com:metadata-1-0/">{udn}</desc></item></DIDL-Lite>"#,
        ns = DIDL_NAMESPACES,
        id = escape_xml(&item_id),
        parent = escape_xml(queue_uri),
        udn = ASSOCIATED_ZP_UDN,
    );

    Ok(EncodedTrack { uri, metadata })
}

fn encode_spotify_track(track: &TrackDescriptor, service: &StreamingServiceConfig) -> EncodedTrack {
    let encoded = encode_component(&format!("spotify:track:{}", track.stream_ref));
    let uri = format!(
        "{}{}?sid={}&flags={}&sn={}",
        SPOTIFY_URI_SCHEME,
        encoded,
        service.service_id,
        SPOTIFY_URI_FLAGS,
        service.account_serial
    );

    let metadata = format!(
        r#"<DIDL-Lite {ns}><item id="{prefix}{id}" restricted="true"><dc:title>{title}</dc:title><upnp:class>object.item.audioItem.musicTrack</upnp:class><desc id="cdudn" nameSpace="urn:schemas-rinconnetworks-com:metadata-1-0/">SA_RINCON{st}_X_#Svc{st}-0-Token</desc></item></DIDL-Lite>"#,
        ns = DIDL_NAMESPACES,
        prefix = SPOTIFY_ITEM_PREFIX,
        id = encoded,
        title = escape_xml(&track.title),
        st = service.service_type,
    );

    EncodedTrack { uri, metadata }
}

fn encode_http_stream(track: &TrackDescriptor) -> EncodedTrack {
    let mut didl = format!(
        r#"<DIDL-Lite {}><item id="0" parentID="-1" restricted="1">"#,
        DIDL_NAMESPACES
    );
    didl.push_str("<upnp:class>object.item.audioItem.musicTrack</upnp:class>");
    didl.push_str(&format!("<dc:title>{}</dc:title>", escape_xml(&track.title)));

    match track.primary_artist() {
        Some(artist) => {
            let artist = escape_xml(artist);
            didl.push_str(&format!(
                r#"<upnp:artist role="Performer">{artist}</upnp:artist><dc:creator>{artist}</dc:creator>"#
            ));
        }
        None => didl.push_str("<dc:creator></dc:creator>"),
    }

    match &track.album {
        Some(album) => didl.push_str(&format!("<upnp:album>{}</upnp:album>", escape_xml(album))),
        None => didl.push_str("<upnp:album />"),
    }

    if let Some(art) = track.artwork_uris.first() {
        didl.push_str(&format!(
            "<upnp:albumArtURI>{}</upnp:albumArtURI>",
            escape_xml(art)
        ));
    }

    let duration = track
        .duration_ms
        .map(|ms| format!(r#" duration="{}""#, format_upnp_time(ms)))
        .unwrap_or_default();
    didl.push_str(&format!(
        r#"<res{} protocolInfo="http-get:*:audio/mpeg:*">{}</res>"#,
        duration,
        escape_xml(&track.stream_ref)
    ));
    didl.push_str("</item></DIDL-Lite>");

    EncodedTrack {
        uri: track.stream_ref.clone(),
        metadata: didl,
    }
}

/// Parses the DIDL-Lite `TrackMetaData` of a position report.
///
/// Devices report `NOT_IMPLEMENTED` or an empty string for sources without
/// metadata; only the URI is known then.
#[must_use]
pub fn parse_track_metadata(uri: &str, didl: &str, duration: Option<&str>) -> ReportedTrack {
    let non_empty = |s: Option<String>| s.filter(|v| !v.is_empty());

    let artist = non_empty(extract_xml_text(didl, "dc:creator"))
        .or_else(|| non_empty(extract_xml_text(didl, "upnp:artist")));

    let duration_ms = duration
        .and_then(parse_upnp_time)
        .or_else(|| {
            didl.find("duration=\"").and_then(|i| {
                let rest = &didl[i + "duration=\"".len()..];
                rest.split('"').next().and_then(parse_upnp_time)
            })
        })
        .filter(|ms| *ms > 0);

    ReportedTrack {
        uri: uri.to_string(),
        title: non_empty(extract_xml_text(didl, "dc:title")),
        artist,
        album: non_empty(extract_xml_text(didl, "upnp:album")),
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> StreamingServiceConfig {
        StreamingServiceConfig::default()
    }

    #[test]
    fn spotify_uri_is_component_encoded() {
        let track = TrackDescriptor::new(Codec::Spotify, "7m9euwqyxRdTgPACE0E8T1", "Song");
        let encoded = encode_track(&track, &service()).expect("encodes");
        assert_eq!(
            encoded.uri,
            "x-sonos-spotify:spotify%3Atrack%3A7m9euwqyxRdTgPACE0E8T1?sid=9&flags=8224&sn=1"
        );
        assert!(encoded
            .metadata
            .contains(r#"id="00032020spotify%3Atrack%3A7m9euwqyxRdTgPACE0E8T1""#));
        assert!(encoded.metadata.contains("SA_RINCON2311_X_#Svc2311-0-Token"));
    }

    #[test]
    fn library_track_decodes_uri_and_builds_item_id() {
        let track = TrackDescriptor::new(
            Codec::SonosQueue,
            "S:/nas!x-file-cifs%3A%2F%2Fnas%2Fa.mp3",
            "Song",
        )
        .with_artist("Band")
        .with_album("LP")
        .with_duration_ms(207_000);

        let encoded = encode_track(&track, &service()).expect("encodes");
        assert_eq!(encoded.uri, "x-file-cifs://nas/a.mp3");
        assert!(encoded
            .metadata
            .contains("S:/nas/x-file-cifs%253A%252F%252Fnas%252Fa.mp3:ASong%2CBand%2CLP%2C207"));
        assert!(encoded.metadata.contains(r#"parentID="S:/nas""#));
        assert!(encoded.metadata.contains(ASSOCIATED_ZP_UDN));
    }

    #[test]
    fn library_track_requires_separator() {
        let track = TrackDescriptor::new(Codec::SonosQueue, "no-separator", "Song");
        assert!(matches!(
            encode_track(&track, &service()),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn http_stream_carries_escaped_metadata() {
        let track = TrackDescriptor::new(Codec::HttpStream, "http://cdn/a.mp3?x=1&y=2", "Tom & Jerry")
            .with_artist("Europe")
            .with_duration_ms(310_000)
            .with_artwork("http://cdn/art.jpg");

        let encoded = encode_track(&track, &service()).expect("encodes");
        assert_eq!(encoded.uri, "http://cdn/a.mp3?x=1&y=2");
        assert!(encoded.metadata.contains("<dc:title>Tom &amp; Jerry</dc:title>"));
        assert!(encoded
            .metadata
            .contains(r#"<upnp:artist role="Performer">Europe</upnp:artist>"#));
        assert!(encoded.metadata.contains(r#"duration="0:05:10""#));
        assert!(encoded.metadata.contains("<upnp:album />"));
    }

    #[test]
    fn empty_stream_ref_is_invalid() {
        let track = TrackDescriptor::new(Codec::HttpStream, "", "Song");
        assert!(encode_track(&track, &service()).is_err());
    }

    #[test]
    fn parses_reported_metadata() {
        let didl = r#"<DIDL-Lite><item><res protocolInfo="x" duration="0:03:27">http://a</res><dc:title>Song</dc:title><dc:creator>Band</dc:creator><upnp:album>LP</upnp:album></item></DIDL-Lite>"#;
        let track = parse_track_metadata("http://a", didl, None);
        assert_eq!(track.title.as_deref(), Some("Song"));
        assert_eq!(track.artist.as_deref(), Some("Band"));
        assert_eq!(track.album.as_deref(), Some("LP"));
        assert_eq!(track.duration_ms, Some(207_000));
    }

    #[test]
    fn not_implemented_metadata_keeps_uri_only() {
        let track = parse_track_metadata("x-rincon-mp3radio://a", "NOT_IMPLEMENTED", Some("NOT_IMPLEMENTED"));
        assert_eq!(track.uri, "x-rincon-mp3radio://a");
        assert!(track.title.is_none());
        assert!(track.duration_ms.is_none());
    }
}
