//! SOAP transport client bound to one Sonos endpoint.
//!
//! Implements the transport traits over the AVTransport,
//! GroupRenderingControl and ZoneGroupTopology services. Besides answering
//! calls, the client publishes what it observes on a broadcast channel:
//! connection loss as [`TransportEvent::Dead`], and every successful position
//! or volume read as a state event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::broadcast;

use crate::error::SoapResult;
use crate::protocol_constants::{QUEUE_OBJECT_PREFIX, TRANSPORT_EVENT_CHANNEL_CAPACITY};
use crate::sonos::didl::parse_track_metadata;
use crate::sonos::retry::with_retry;
use crate::sonos::soap::{SoapAction, SoapError};
use crate::sonos::traits::{
    ConnectionFactory, GroupVolumeControl, TopologyQuery, TransportClient, TransportControl,
    TransportEvent,
};
use crate::sonos::types::{
    EnqueueRequest, Endpoint, PlaybackState, QueueInsertion, TopologySnapshot, TransportSnapshot,
};
use crate::sonos::utils::extract_xml_text;
use crate::sonos::zone_groups::parse_zone_group_xml;
use crate::utils::{format_upnp_time, parse_upnp_time};

/// Parses a required numeric field of a SOAP response.
fn parse_field<T: std::str::FromStr>(xml: &str, tag: &str) -> SoapResult<T> {
    extract_xml_text(xml, tag)
        .and_then(|v| v.trim().parse().ok())
        .ok_or(SoapError::Parse)
}

/// Transport client speaking SOAP to a single Sonos player.
pub struct SoapTransportClient {
    http: Client,
    endpoint: Endpoint,
    events: broadcast::Sender<TransportEvent>,
    /// Cleared on the first connection-level failure so `Dead` fires once per outage.
    reachable: AtomicBool,
}

impl std::fmt::Debug for SoapTransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoapTransportClient")
            .field("endpoint", &self.endpoint)
            .field("reachable", &self.reachable.load(Ordering::Relaxed))
            .finish()
    }
}

impl SoapTransportClient {
    #[must_use]
    pub fn new(http: Client, endpoint: Endpoint) -> Self {
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CHANNEL_CAPACITY);
        Self {
            http,
            endpoint,
            events,
            reachable: AtomicBool::new(true),
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No receivers is fine: nobody routes through this endpoint right now
        let _ = self.events.send(event);
    }

    /// Tracks reachability from a call result and emits `Dead` on loss.
    fn observe<T>(&self, result: SoapResult<T>) -> SoapResult<T> {
        match &result {
            Ok(_) => self.reachable.store(true, Ordering::SeqCst),
            Err(e) if e.is_connection_failure() => {
                if self.reachable.swap(false, Ordering::SeqCst) {
                    log::warn!("[SOAP] {} unreachable: {}", self.endpoint, e);
                    self.emit(TransportEvent::Dead);
                }
            }
            Err(_) => {}
        }
        result
    }

    /// Sends a state-changing action once.
    async fn call(&self, action: SoapAction) -> SoapResult<String> {
        let result = action.send(&self.http, &self.endpoint).await;
        self.observe(result)
    }

    /// Sends a read-only action, retrying transient faults.
    async fn query(&self, action: SoapAction) -> SoapResult<String> {
        let result = with_retry(action.name(), || action.send(&self.http, &self.endpoint)).await;
        self.observe(result)
    }

    async fn read_track(&self) -> SoapResult<TransportSnapshot> {
        let position = self
            .query(SoapAction::av_transport("GetPositionInfo"))
            .await?;
        let transport = self
            .query(SoapAction::av_transport("GetTransportInfo"))
            .await?;

        let uri = extract_xml_text(&position, "TrackURI").unwrap_or_default();
        let track = (!uri.is_empty()).then(|| {
            let didl = extract_xml_text(&position, "TrackMetaData").unwrap_or_default();
            let duration = extract_xml_text(&position, "TrackDuration");
            parse_track_metadata(&uri, &didl, duration.as_deref())
        });

        let snapshot = TransportSnapshot {
            state: extract_xml_text(&transport, "CurrentTransportState")
                .map(|s| PlaybackState::from_upnp(&s))
                .unwrap_or_default(),
            queue_position: parse_field(&position, "Track").unwrap_or(0),
            position_ms: extract_xml_text(&position, "RelTime")
                .and_then(|t| parse_upnp_time(&t))
                .unwrap_or(0),
            track,
        };
        Ok(snapshot)
    }
}

#[async_trait]
impl TransportControl for SoapTransportClient {
    async fn current_track(&self) -> SoapResult<TransportSnapshot> {
        let snapshot = self.read_track().await?;
        self.emit(TransportEvent::TransportState(snapshot.clone()));
        Ok(snapshot)
    }

    async fn poll_track(&self) -> SoapResult<TransportSnapshot> {
        self.read_track().await
    }

    async fn transport_uri(&self) -> SoapResult<String> {
        let response = self.query(SoapAction::av_transport("GetMediaInfo")).await?;
        Ok(extract_xml_text(&response, "CurrentURI").unwrap_or_default())
    }

    async fn play(&self) -> SoapResult<()> {
        self.call(SoapAction::av_transport("Play").arg("Speed", "1"))
            .await
            .map(drop)
    }

    async fn pause(&self) -> SoapResult<()> {
        self.call(SoapAction::av_transport("Pause")).await.map(drop)
    }

    async fn next(&self) -> SoapResult<()> {
        self.call(SoapAction::av_transport("Next")).await.map(drop)
    }

    async fn previous(&self) -> SoapResult<()> {
        self.call(SoapAction::av_transport("Previous")).await.map(drop)
    }

    async fn seek(&self, position_ms: u64) -> SoapResult<()> {
        let action = SoapAction::av_transport("Seek")
            .arg("Unit", "REL_TIME")
            .arg("Target", format_upnp_time(position_ms));
        self.call(action).await.map(drop)
    }

    async fn seek_track(&self, track_number: u32) -> SoapResult<()> {
        let action = SoapAction::av_transport("Seek")
            .arg("Unit", "TRACK_NR")
            .arg("Target", track_number.to_string());
        self.call(action).await.map(drop)
    }

    async fn flush(&self) -> SoapResult<()> {
        self.call(SoapAction::av_transport("RemoveAllTracksFromQueue"))
            .await
            .map(drop)
    }

    async fn remove_from_queue(&self, track_number: u32) -> SoapResult<()> {
        let action = SoapAction::av_transport("RemoveTrackFromQueue")
            .arg("ObjectID", format!("{}{}", QUEUE_OBJECT_PREFIX, track_number))
            .arg("UpdateID", "0");
        self.call(action).await.map(drop)
    }

    async fn add_uri_to_queue(&self, request: &EnqueueRequest) -> SoapResult<QueueInsertion> {
        log::debug!(
            "[SOAP] AddURIToQueue on {}: uri={}, as_next={}, position={}",
            self.endpoint,
            request.uri,
            request.as_next,
            request.desired_position
        );

        let action = SoapAction::av_transport("AddURIToQueue")
            .arg("EnqueuedURI", request.uri.as_str())
            .arg("EnqueuedURIMetaData", request.metadata.as_str())
            .arg(
                "DesiredFirstTrackNumberEnqueued",
                request.desired_position.to_string(),
            )
            .arg("EnqueueAsNext", if request.as_next { "1" } else { "0" });
        let response = self.call(action).await?;

        Ok(QueueInsertion {
            first_track_number: parse_field(&response, "FirstTrackNumberEnqueued")?,
            tracks_added: parse_field(&response, "NumTracksAdded").unwrap_or(1),
            queue_length: parse_field(&response, "NewQueueLength").unwrap_or(0),
        })
    }

    async fn set_av_transport(&self, uri: &str, metadata: &str) -> SoapResult<()> {
        log::info!("[SOAP] SetAVTransportURI on {}: {}", self.endpoint, uri);
        let action = SoapAction::av_transport("SetAVTransportURI")
            .arg("CurrentURI", uri)
            .arg("CurrentURIMetaData", metadata);
        self.call(action).await.map(drop)
    }
}

#[async_trait]
impl TopologyQuery for SoapTransportClient {
    async fn get_topology(&self) -> SoapResult<TopologySnapshot> {
        let response = self
            .query(SoapAction::topology("GetZoneGroupState"))
            .await?;
        let xml = extract_xml_text(&response, "ZoneGroupState").ok_or(SoapError::Parse)?;
        Ok(parse_zone_group_xml(&xml))
    }
}

#[async_trait]
impl GroupVolumeControl for SoapTransportClient {
    async fn get_volume(&self) -> SoapResult<u8> {
        let response = self
            .query(SoapAction::group_rendering("GetGroupVolume"))
            .await?;
        let volume: u8 = parse_field(&response, "CurrentVolume")?;
        self.emit(TransportEvent::GroupVolume(volume));
        Ok(volume)
    }

    async fn set_volume(&self, volume: u8) -> SoapResult<()> {
        let clamped = volume.min(100);
        let action =
            SoapAction::group_rendering("SetGroupVolume").arg("DesiredVolume", clamped.to_string());
        self.call(action).await?;

        self.emit(TransportEvent::GroupVolume(clamped));
        Ok(())
    }

    async fn get_muted(&self) -> SoapResult<bool> {
        let response = self
            .query(SoapAction::group_rendering("GetGroupMute"))
            .await?;
        let muted = extract_xml_text(&response, "CurrentMute").ok_or(SoapError::Parse)? == "1";
        self.emit(TransportEvent::GroupMute(muted));
        Ok(muted)
    }

    async fn set_muted(&self, muted: bool) -> SoapResult<()> {
        let action = SoapAction::group_rendering("SetGroupMute")
            .arg("DesiredMute", if muted { "1" } else { "0" });
        self.call(action).await?;

        self.emit(TransportEvent::GroupMute(muted));
        Ok(())
    }
}

impl TransportClient for SoapTransportClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Creates [`SoapTransportClient`]s sharing one pooled HTTP client.
#[derive(Debug, Clone)]
pub struct SoapConnectionFactory {
    http: Client,
}

impl SoapConnectionFactory {
    #[must_use]
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

impl ConnectionFactory for SoapConnectionFactory {
    fn connect(&self, endpoint: &Endpoint) -> Arc<dyn TransportClient> {
        log::debug!("[SOAP] Opening transport client for {}", endpoint);
        Arc::new(SoapTransportClient::new(self.http.clone(), endpoint.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Both position and transport fields, so one body answers either read.
    const TRACK_REPORT: &str = "<s:Envelope><s:Body><u:Response><Track>2</Track><TrackDuration>0:03:00</TrackDuration><TrackMetaData></TrackMetaData><TrackURI>http://media/a.mp3</TrackURI><RelTime>0:00:10</RelTime><CurrentTransportState>PLAYING</CurrentTransportState></u:Response></s:Body></s:Envelope>";

    /// Answers every request on a loopback port with `body`.
    async fn serve(body: &'static str) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut chunk = [0u8; 4096];
                    while !request_complete(&request) {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => request.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().unwrap_or(0))
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    #[test]
    fn parses_queue_insertion_fields() {
        let xml = "<u:AddURIToQueueResponse><FirstTrackNumberEnqueued>4</FirstTrackNumberEnqueued><NumTracksAdded>1</NumTracksAdded><NewQueueLength>4</NewQueueLength></u:AddURIToQueueResponse>";
        assert_eq!(parse_field::<u32>(xml, "FirstTrackNumberEnqueued").ok(), Some(4));
        assert!(matches!(
            parse_field::<u32>(xml, "Missing"),
            Err(SoapError::Parse)
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_emits_dead_once() {
        // Port 9 on loopback refuses connections
        let client = SoapTransportClient::new(Client::new(), Endpoint::new("127.0.0.1", 9));
        let mut rx = client.subscribe();

        assert!(client.pause().await.is_err());
        assert!(client.pause().await.is_err());

        assert_eq!(rx.try_recv().ok(), Some(TransportEvent::Dead));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_current_track_publishes_its_report() {
        let endpoint = serve(TRACK_REPORT).await;
        let http = Client::builder().no_proxy().build().expect("client");
        let client = SoapTransportClient::new(http, endpoint);
        let mut rx = client.subscribe();

        let polled = client.poll_track().await.expect("polled");
        assert_eq!(polled.position_ms, 10_000);
        assert_eq!(polled.queue_position, 2);
        assert!(polled.state.is_playing());
        assert!(rx.try_recv().is_err());

        let read = client.current_track().await.expect("read");
        assert_eq!(read, polled);
        assert_eq!(rx.try_recv().ok(), Some(TransportEvent::TransportState(read)));
    }
}
