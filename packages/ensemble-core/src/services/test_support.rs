//! In-memory transports and sinks for service tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::SoapResult;
use crate::protocol_constants::TRANSPORT_EVENT_CHANNEL_CAPACITY;
use crate::services::speaker_sink::{SinkUpdate, SpeakerSink};
use crate::sonos::soap::SoapError;
use crate::sonos::traits::{
    ConnectionFactory, GroupVolumeControl, TopologyQuery, TransportClient, TransportControl,
    TransportEvent,
};
use crate::sonos::types::{
    EnqueueRequest, Endpoint, PlaybackState, QueueInsertion, RendererId, ReportedTrack,
    TopologySnapshot, TransportSnapshot, ZoneGroup, ZoneGroupMember,
};

/// Deterministic endpoint for a test renderer id.
pub fn endpoint_of(id: &str) -> Endpoint {
    Endpoint::new(format!("{}.local", id.to_lowercase()), 1400)
}

/// Builds a topology from `(coordinator, members)` pairs.
pub fn topology(groups: &[(&str, &[&str])]) -> TopologySnapshot {
    TopologySnapshot::new(
        groups
            .iter()
            .map(|(coordinator, members)| ZoneGroup {
                id: format!("{}:1", coordinator),
                coordinator_id: RendererId::new(*coordinator),
                coordinator: endpoint_of(coordinator),
                members: members
                    .iter()
                    .map(|m| ZoneGroupMember {
                        id: RendererId::new(*m),
                        endpoint: endpoint_of(m),
                        zone_name: m.to_lowercase(),
                    })
                    .collect(),
            })
            .collect(),
    )
}

type SharedTopology = Arc<Mutex<Option<TopologySnapshot>>>;

/// A transport that keeps a queue in memory and records every call.
///
/// Like the SOAP client it publishes what it observes: `current_track`
/// emits `TransportState`, volume and mute reads and writes emit their
/// group events, and `poll_track` stays silent.
pub struct MockTransport {
    endpoint: Endpoint,
    events: broadcast::Sender<TransportEvent>,
    calls: Mutex<Vec<String>>,
    topology: SharedTopology,
    queue: Mutex<Vec<String>>,
    snapshot: Mutex<TransportSnapshot>,
    transport_uri: Mutex<String>,
    /// Every call fails while set.
    down: AtomicBool,
    /// Delay applied to state-changing calls.
    latency: Mutex<Duration>,
    /// Action name that fails with a SOAP fault.
    failing: Mutex<Option<&'static str>>,
    volume: AtomicU8,
    muted: AtomicBool,
}

impl MockTransport {
    fn new(endpoint: Endpoint, topology: SharedTopology) -> Self {
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CHANNEL_CAPACITY);
        Self {
            endpoint,
            events,
            calls: Mutex::new(Vec::new()),
            topology,
            queue: Mutex::new(Vec::new()),
            snapshot: Mutex::new(TransportSnapshot::default()),
            transport_uri: Mutex::new(String::new()),
            down: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            failing: Mutex::new(None),
            volume: AtomicU8::new(20),
            muted: AtomicBool::new(false),
        }
    }

    /// Recorded calls in order, e.g. `"flush"`, `"seek_track:2"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn queue(&self) -> Vec<String> {
        self.queue.lock().clone()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn fail_action(&self, action: &'static str) {
        *self.failing.lock() = Some(action);
    }

    pub fn set_transport_uri(&self, uri: &str) {
        *self.transport_uri.lock() = uri.to_string();
    }

    /// Overrides the reported transport snapshot.
    pub fn set_snapshot(&self, snapshot: TransportSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn set_position(&self, position_ms: u64) {
        self.snapshot.lock().position_ms = position_ms;
    }

    /// Moves playback to the next queued item, as the device does at track end.
    pub fn advance(&self) {
        let queue = self.queue.lock();
        let mut snapshot = self.snapshot.lock();
        let next = snapshot.queue_position + 1;
        if let Some(uri) = queue.get(next as usize - 1) {
            snapshot.queue_position = next;
            snapshot.position_ms = 0;
            snapshot.track = Some(ReportedTrack {
                uri: uri.clone(),
                ..Default::default()
            });
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn enter(&self, call: String) -> SoapResult<()> {
        let action = call.split(':').next().unwrap_or_default().to_string();
        self.calls.lock().push(call);

        let latency = *self.latency.lock();
        let is_read = matches!(action.as_str(), "current_track" | "poll_track" | "get_topology");
        if !latency.is_zero() && !is_read {
            tokio::time::sleep(latency).await;
        }

        if self.down.load(Ordering::SeqCst) {
            return Err(SoapError::Fault("unreachable".into()));
        }
        if self.failing.lock().as_deref() == Some(action.as_str()) {
            return Err(SoapError::Fault(format!("{} rejected (701)", action)));
        }
        Ok(())
    }

    fn select(&self, track_number: u32) {
        let queue = self.queue.lock();
        let mut snapshot = self.snapshot.lock();
        snapshot.queue_position = track_number;
        snapshot.position_ms = 0;
        snapshot.track = queue
            .get((track_number as usize).saturating_sub(1))
            .map(|uri| ReportedTrack {
                uri: uri.clone(),
                ..Default::default()
            });
    }
}

#[async_trait]
impl TransportControl for MockTransport {
    async fn current_track(&self) -> SoapResult<TransportSnapshot> {
        self.enter("current_track".into()).await?;
        let snapshot = self.snapshot.lock().clone();
        self.emit(TransportEvent::TransportState(snapshot.clone()));
        Ok(snapshot)
    }

    async fn poll_track(&self) -> SoapResult<TransportSnapshot> {
        self.enter("poll_track".into()).await?;
        Ok(self.snapshot.lock().clone())
    }

    async fn transport_uri(&self) -> SoapResult<String> {
        self.enter("transport_uri".into()).await?;
        Ok(self.transport_uri.lock().clone())
    }

    async fn play(&self) -> SoapResult<()> {
        self.enter("play".into()).await?;
        self.snapshot.lock().state = PlaybackState::Playing;
        Ok(())
    }

    async fn pause(&self) -> SoapResult<()> {
        self.enter("pause".into()).await?;
        self.snapshot.lock().state = PlaybackState::Paused;
        Ok(())
    }

    async fn next(&self) -> SoapResult<()> {
        self.enter("next".into()).await?;
        self.advance();
        Ok(())
    }

    async fn previous(&self) -> SoapResult<()> {
        self.enter("previous".into()).await?;
        let current = self.snapshot.lock().queue_position;
        if current > 1 {
            self.select(current - 1);
        }
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> SoapResult<()> {
        self.enter(format!("seek:{}", position_ms)).await?;
        self.set_position(position_ms);
        Ok(())
    }

    async fn seek_track(&self, track_number: u32) -> SoapResult<()> {
        self.enter(format!("seek_track:{}", track_number)).await?;
        self.select(track_number);
        Ok(())
    }

    async fn flush(&self) -> SoapResult<()> {
        self.enter("flush".into()).await?;
        self.queue.lock().clear();
        let mut snapshot = self.snapshot.lock();
        snapshot.queue_position = 0;
        snapshot.position_ms = 0;
        snapshot.track = None;
        Ok(())
    }

    async fn remove_from_queue(&self, track_number: u32) -> SoapResult<()> {
        self.enter(format!("remove_from_queue:{}", track_number))
            .await?;
        let mut queue = self.queue.lock();
        let index = track_number as usize;
        if index >= 1 && index <= queue.len() {
            queue.remove(index - 1);
        }
        Ok(())
    }

    async fn add_uri_to_queue(&self, request: &EnqueueRequest) -> SoapResult<QueueInsertion> {
        self.enter(format!("add_uri_to_queue:{}", request.uri))
            .await?;
        let mut queue = self.queue.lock();
        let index = match request.desired_position {
            0 => queue.len(),
            n => (n as usize - 1).min(queue.len()),
        };
        queue.insert(index, request.uri.clone());
        Ok(QueueInsertion {
            first_track_number: index as u32 + 1,
            tracks_added: 1,
            queue_length: queue.len() as u32,
        })
    }

    async fn set_av_transport(&self, uri: &str, _metadata: &str) -> SoapResult<()> {
        self.enter(format!("set_av_transport:{}", uri)).await?;
        self.set_transport_uri(uri);
        Ok(())
    }
}

#[async_trait]
impl TopologyQuery for MockTransport {
    async fn get_topology(&self) -> SoapResult<TopologySnapshot> {
        self.enter("get_topology".into()).await?;
        self.topology
            .lock()
            .clone()
            .ok_or_else(|| SoapError::Fault("no topology".into()))
    }
}

#[async_trait]
impl GroupVolumeControl for MockTransport {
    async fn get_volume(&self) -> SoapResult<u8> {
        self.enter("get_volume".into()).await?;
        let volume = self.volume.load(Ordering::SeqCst);
        self.emit(TransportEvent::GroupVolume(volume));
        Ok(volume)
    }

    async fn set_volume(&self, volume: u8) -> SoapResult<()> {
        self.enter(format!("set_volume:{}", volume)).await?;
        self.volume.store(volume.min(100), Ordering::SeqCst);
        self.emit(TransportEvent::GroupVolume(volume.min(100)));
        Ok(())
    }

    async fn get_muted(&self) -> SoapResult<bool> {
        self.enter("get_muted".into()).await?;
        let muted = self.muted.load(Ordering::SeqCst);
        self.emit(TransportEvent::GroupMute(muted));
        Ok(muted)
    }

    async fn set_muted(&self, muted: bool) -> SoapResult<()> {
        self.enter(format!("set_muted:{}", muted)).await?;
        self.muted.store(muted, Ordering::SeqCst);
        self.emit(TransportEvent::GroupMute(muted));
        Ok(())
    }
}

impl TransportClient for MockTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Hands out one [`MockTransport`] per endpoint. All transports report the
/// same topology.
pub struct MockConnectionFactory {
    transports: Mutex<HashMap<Endpoint, Arc<MockTransport>>>,
    topology: SharedTopology,
    connects: AtomicUsize,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self {
            transports: Mutex::new(HashMap::new()),
            topology: Arc::new(Mutex::new(None)),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn set_topology(&self, topology: TopologySnapshot) {
        *self.topology.lock() = Some(topology);
    }

    /// Number of `connect` calls made by the registry.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The transport behind an endpoint, created on first access.
    pub fn mock(&self, endpoint: &Endpoint) -> Arc<MockTransport> {
        self.transports
            .lock()
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Arc::new(MockTransport::new(
                    endpoint.clone(),
                    Arc::clone(&self.topology),
                ))
            })
            .clone()
    }

    /// The transport of a test renderer id (see [`endpoint_of`]).
    pub fn renderer(&self, id: &str) -> Arc<MockTransport> {
        self.mock(&endpoint_of(id))
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn connect(&self, endpoint: &Endpoint) -> Arc<dyn TransportClient> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.mock(endpoint)
    }
}

/// A sink call captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Update(RendererId, SinkUpdate),
    Inactive(RendererId, String),
    Available(RendererId, bool),
}

#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().clone()
    }

    pub fn inactive_reasons(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SinkCall::Inactive(_, reason) => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn positions(&self) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SinkCall::Update(_, update) => update.position_ms,
                _ => None,
            })
            .collect()
    }
}

impl SpeakerSink for RecordingSink {
    fn update_state(&self, renderer_id: &RendererId, update: SinkUpdate) {
        self.calls
            .lock()
            .push(SinkCall::Update(renderer_id.clone(), update));
    }

    fn set_inactive(&self, renderer_id: &RendererId, reason: &str) {
        self.calls
            .lock()
            .push(SinkCall::Inactive(renderer_id.clone(), reason.to_string()));
    }

    fn set_available(&self, renderer_id: &RendererId, available: bool) {
        self.calls
            .lock()
            .push(SinkCall::Available(renderer_id.clone(), available));
    }
}
