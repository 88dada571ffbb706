//! In-memory stand-ins for the platform, the transport engine, the relay and
//! the remote media sink.

#![allow(dead_code)]

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Notify;
use url::Url;

use webrtc_call::config::{ClientConfig, ReconnectPolicy};
use webrtc_call::connection::NegotiationState;
use webrtc_call::error::{Error, Result};
use webrtc_call::media::{
    CaptureConstraints, CaptureStream, CaptureStreamManager, DeviceDescriptor, DeviceKind,
    LocalTrack, MediaPlatform, PreferenceStore, TrackKind, VideoConstraints,
};
use webrtc_call::relay::{FrameSink, FrameStream, RelayClient, RelayConnector, RelayState};
use webrtc_call::session::{SessionBuilder, SessionHandle};
use webrtc_call::signaling::{MessageKind, Signal, SignalingMessage};
use webrtc_call::transport::{
    IceCandidate, PeerEvent, PeerEventHandler, RemoteMediaSink, RemoteStream, RemoteTrack,
    RtcConnection, RtcEngine, SessionDescription,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Polls `f` until it holds, failing the test after [`WAIT`].
pub async fn eventually(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !f() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}

// ---------------------------------------------------------------------------
// Media platform

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    device_id: String,
    live: AtomicBool,
    applied: Mutex<Option<VideoConstraints>>,
}

impl FakeTrack {
    pub fn applied(&self) -> Option<VideoConstraints> {
        self.applied.lock().unwrap().clone()
    }

    pub fn device(&self) -> &str {
        &self.device_id
    }
}

#[async_trait]
impl LocalTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn device_id(&self) -> Option<&str> {
        Some(&self.device_id)
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    async fn apply_constraints(&self, constraints: &VideoConstraints) -> Result<()> {
        *self.applied.lock().unwrap() = Some(constraints.clone());
        Ok(())
    }
}

fn device(id: &str, kind: DeviceKind, label: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        id: id.to_owned(),
        kind,
        label: label.to_owned(),
        group_id: "group-1".to_owned(),
    }
}

/// Two cameras, one microphone, two speakers.
pub struct FakePlatform {
    devices: Vec<DeviceDescriptor>,
    deny: AtomicBool,
    counter: AtomicUsize,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
    acquisitions: Mutex<Vec<CaptureConstraints>>,
    output: Mutex<Option<String>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: vec![
                device("cam-1", DeviceKind::CaptureVideo, "Front Camera"),
                device("cam-2", DeviceKind::CaptureVideo, "USB Camera"),
                device("mic-1", DeviceKind::CaptureAudio, "Built-in Microphone"),
                device("spk-1", DeviceKind::OutputAudio, "Speakers"),
                device("spk-2", DeviceKind::OutputAudio, "Headphones"),
            ],
            deny: AtomicBool::new(false),
            counter: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
            acquisitions: Mutex::new(Vec::new()),
            output: Mutex::new(None),
        })
    }

    pub fn deny_permission(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn issued_tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().unwrap().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.issued_tracks().iter().filter(|t| t.is_live()).count()
    }

    pub fn acquisitions(&self) -> Vec<CaptureConstraints> {
        self.acquisitions.lock().unwrap().clone()
    }

    pub fn output(&self) -> Option<String> {
        self.output.lock().unwrap().clone()
    }

    fn resolve(&self, kind: DeviceKind, requested: Option<&str>) -> Result<String> {
        let mut candidates = self.devices.iter().filter(|d| d.kind == kind);
        let found = match requested {
            Some(id) => candidates.find(|d| d.id == id),
            None => candidates.next(),
        };
        found
            .map(|d| d.id.clone())
            .ok_or_else(|| Error::DeviceUnavailable(requested.unwrap_or("default").to_owned()))
    }

    fn track(&self, kind: TrackKind, device_id: String) -> Arc<FakeTrack> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let track = Arc::new(FakeTrack {
            id: format!("{}-{}", kind, n),
            kind,
            device_id,
            live: AtomicBool::new(true),
            applied: Mutex::new(None),
        });
        self.issued.lock().unwrap().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaPlatform for FakePlatform {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied("camera and microphone".into()));
        }
        Ok(self.devices.clone())
    }

    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream> {
        self.acquisitions.lock().unwrap().push(constraints.clone());
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied("camera and microphone".into()));
        }

        let video = match &constraints.video {
            Some(v) => Some(self.resolve(DeviceKind::CaptureVideo, v.device_id.as_deref())?),
            None => None,
        };
        let audio = match &constraints.audio {
            Some(a) => Some(self.resolve(DeviceKind::CaptureAudio, a.device_id.as_deref())?),
            None => None,
        };

        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if let Some(id) = audio {
            tracks.push(self.track(TrackKind::Audio, id));
        }
        if let Some(id) = video {
            tracks.push(self.track(TrackKind::Video, id));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(CaptureStream::new(format!("local-{}", n), tracks))
    }

    async fn set_output_sink(&self, device_id: &str) -> Result<()> {
        let id = self.resolve(DeviceKind::OutputAudio, Some(device_id))?;
        *self.output.lock().unwrap() = Some(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport engine

/// Named engine steps that can be held back by a test.
#[derive(Default)]
pub struct Gates {
    paused: Mutex<HashSet<&'static str>>,
    waiting: AtomicUsize,
    notify: Notify,
}

impl Gates {
    pub fn pause(&self, step: &'static str) {
        self.paused.lock().unwrap().insert(step);
    }

    pub fn resume(&self, step: &'static str) {
        self.paused.lock().unwrap().remove(step);
        self.notify.notify_waiters();
    }

    /// Steps currently held.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn pass(&self, step: &'static str) {
        let mut held = false;
        loop {
            let notified = self.notify.notified();
            if !self.paused.lock().unwrap().contains(step) {
                if held {
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                }
                return;
            }
            if !held {
                held = true;
                self.waiting.fetch_add(1, Ordering::SeqCst);
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub struct FakeRemoteTrack {
    id: String,
}

impl RemoteTrack for FakeRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        if self.id.starts_with("video") {
            TrackKind::Video
        } else {
            TrackKind::Audio
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Connection that "negotiates" by exchanging fake SDP listing its tracks
/// as `a=msid:<stream> <track>` lines. It reports one local candidate per
/// local description and goes connected once both descriptions are set.
pub struct FakeConnection {
    pub id: usize,
    gates: Arc<Gates>,
    handler: Mutex<Option<PeerEventHandler>>,
    tracks: Mutex<Vec<Arc<dyn LocalTrack>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    ops: Mutex<Vec<String>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakeConnection {
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    fn log(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }

    fn emit(&self, event: PeerEvent) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn sdp(&self) -> String {
        let mut sdp = format!("v=0\r\no=fake {} 0 IN IP4 127.0.0.1\r\ns=-\r\n", self.id);
        for track in self.tracks.lock().unwrap().iter() {
            sdp.push_str(&format!("a=msid:stream-{} {}\r\n", self.id, track.id()));
        }
        sdp
    }

    fn maybe_connect(&self) {
        let ready = self.local.lock().unwrap().is_some() && self.remote.lock().unwrap().is_some();
        if ready && !self.connected.swap(true, Ordering::SeqCst) {
            self.emit(PeerEvent::StateChanged(NegotiationState::Connecting));
            self.emit(PeerEvent::StateChanged(NegotiationState::Connected));
        }
    }
}

#[async_trait]
impl RtcConnection for FakeConnection {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        self.log(format!("add_track:{}", track.id()));
        self.tracks.lock().unwrap().push(track);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        self.tracks.lock().unwrap().retain(|t| t.id() != track_id);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.gates.pass("create_offer").await;
        self.log("create_offer");
        Ok(SessionDescription::offer(self.sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.gates.pass("create_answer").await;
        if self.remote.lock().unwrap().is_none() {
            return Err(Error::NegotiationError("answer without remote offer".into()));
        }
        self.log("create_answer");
        Ok(SessionDescription::answer(self.sdp()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.gates.pass("set_local").await;
        self.log("set_local");
        *self.local.lock().unwrap() = Some(description);
        self.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 10.0.0.{} 9 typ host",
                self.id, self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.gates.pass("set_remote").await;
        if !description.sdp.starts_with("v=0") {
            self.log("set_remote:error");
            return Err(Error::NegotiationError("malformed sdp".into()));
        }
        self.log("set_remote");
        let tracks: Vec<(String, String)> = description
            .sdp
            .lines()
            .filter_map(|line| line.strip_prefix("a=msid:"))
            .filter_map(|rest| rest.split_once(' '))
            .map(|(stream, track)| (stream.to_owned(), track.to_owned()))
            .collect();
        *self.remote.lock().unwrap() = Some(description);
        for (stream_id, track) in tracks {
            self.emit(PeerEvent::RemoteTrack {
                stream_id,
                track: Arc::new(FakeRemoteTrack { id: track }),
            });
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote.lock().unwrap().is_none() {
            return Err(Error::InvalidCandidate("no remote description".into()));
        }
        self.log(format!("candidate:{}", candidate.candidate));
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.handler.lock().unwrap().take();
        self.closed.store(true, Ordering::SeqCst);
        self.log("close");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeEngine {
    pub gates: Arc<Gates>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl RtcEngine for FakeEngine {
    async fn create_connection(
        &self,
        on_event: PeerEventHandler,
    ) -> Result<Arc<dyn RtcConnection>> {
        let mut connections = self.connections.lock().unwrap();
        let connection = Arc::new(FakeConnection {
            id: connections.len() + 1,
            gates: self.gates.clone(),
            handler: Mutex::new(Some(on_event)),
            tracks: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        connections.push(connection.clone());
        Ok(connection)
    }
}

// ---------------------------------------------------------------------------
// Relay

#[derive(Default)]
struct Hub {
    next_id: usize,
    clients: HashMap<usize, fmpsc::UnboundedSender<String>>,
    members: HashMap<usize, (String, String)>,
    log: Vec<SignalingMessage>,
    offline: bool,
}

impl Hub {
    fn deliver(&self, to: usize, msg: &SignalingMessage) {
        if let (Some(client), Ok(text)) = (self.clients.get(&to), msg.encode()) {
            let _ = client.unbounded_send(text);
        }
    }

    fn in_channel(&self, channel: &str) -> Vec<usize> {
        let mut ids: Vec<usize> = self
            .members
            .iter()
            .filter(|(_, (c, _))| c == channel)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn announce(&self, channel: &str) {
        let ids = self.in_channel(channel);
        let names = ids.iter().map(|id| self.members[id].1.clone()).collect();
        let msg = SignalingMessage::new(channel, "relay", Signal::Joined(names));
        for id in ids {
            self.deliver(id, &msg);
        }
    }

    fn forward(&self, from: usize, msg: &SignalingMessage) {
        for id in self.in_channel(&msg.channel) {
            if id != from {
                self.deliver(id, msg);
            }
        }
    }
}

/// Channel fan-out relay that keeps a log of every message it routed.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, policy: ReconnectPolicy) -> RelayClient {
        RelayClient::new(Arc::new(self.clone()), policy)
    }

    pub fn log(&self) -> Vec<SignalingMessage> {
        self.hub.lock().unwrap().log.clone()
    }

    pub fn sent_by(&self, user: &str) -> Vec<SignalingMessage> {
        self.log().into_iter().filter(|m| m.from_user == user).collect()
    }

    pub fn count(&self, user: &str, kind: MessageKind) -> usize {
        self.sent_by(user).iter().filter(|m| m.kind() == kind).count()
    }

    pub fn set_offline(&self, offline: bool) {
        self.hub.lock().unwrap().offline = offline;
    }

    /// Closes every client connection as if the relay restarted.
    pub fn drop_connections(&self) {
        let mut hub = self.hub.lock().unwrap();
        hub.clients.clear();
        hub.members.clear();
    }

    fn route(&self, from: usize, frame: &str) {
        let Ok(msg) = SignalingMessage::decode(frame) else {
            return;
        };
        let mut hub = self.hub.lock().unwrap();
        hub.log.push(msg.clone());
        match &msg.signal {
            Signal::Join(membership) => {
                hub.members
                    .insert(from, (membership.channel.clone(), membership.user_name.clone()));
                hub.announce(&membership.channel);
            }
            Signal::Leave(membership) if msg.to_user.is_none() => {
                hub.members.remove(&from);
                hub.forward(from, &msg);
                hub.announce(&membership.channel);
            }
            _ => hub.forward(from, &msg),
        }
    }

    fn remove(&self, id: usize) {
        let mut hub = self.hub.lock().unwrap();
        hub.clients.remove(&id);
        if let Some((channel, _)) = hub.members.remove(&id) {
            hub.announce(&channel);
        }
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, _url: &Url) -> Result<(FrameSink, FrameStream)> {
        let (to_client, from_hub) = fmpsc::unbounded::<String>();
        let (to_hub, mut incoming) = fmpsc::unbounded::<String>();
        let id = {
            let mut hub = self.hub.lock().unwrap();
            if hub.offline {
                return Err(Error::RelayDisconnected);
            }
            hub.next_id += 1;
            let id = hub.next_id;
            hub.clients.insert(id, to_client);
            id
        };

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = incoming.next().await {
                relay.route(id, &frame);
            }
            relay.remove(id);
        });

        let sink = to_hub.sink_map_err(|e| Error::Protocol(e.to_string()));
        Ok((Box::pin(sink), Box::pin(from_hub.map(Ok::<String, Error>))))
    }
}

/// A relay client that joined `channel` as `user` and is driven by the test.
pub async fn scripted(relay: &MemoryRelay, channel: &str, user: &str) -> RelayClient {
    let client = relay.client(ReconnectPolicy::disabled());
    let mut status = client.subscribe_status();
    client
        .connect(Url::parse("ws://relay.test").unwrap())
        .unwrap();
    within(status.wait_for(|s| s.state == RelayState::Connected))
        .await
        .unwrap();
    client.send(&SignalingMessage::new(
        channel,
        user,
        Signal::Join(webrtc_call::signaling::Membership {
            channel: channel.to_owned(),
            user_name: user.to_owned(),
        }),
    ));
    client
}

// ---------------------------------------------------------------------------
// Remote media sink

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Attached { peer: String, stream: String },
    TrackAdded { peer: String, track: String },
    Detached { peer: String },
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl RemoteMediaSink for RecordingSink {
    fn attach(&self, peer: &str, stream: RemoteStream) {
        self.events.lock().unwrap().push(SinkEvent::Attached {
            peer: peer.to_owned(),
            stream: stream.id,
        });
    }

    fn track_added(&self, peer: &str, track: Arc<dyn RemoteTrack>) {
        self.events.lock().unwrap().push(SinkEvent::TrackAdded {
            peer: peer.to_owned(),
            track: track.id(),
        });
    }

    fn detach(&self, peer: &str) {
        self.events.lock().unwrap().push(SinkEvent::Detached {
            peer: peer.to_owned(),
        });
    }
}

// ---------------------------------------------------------------------------
// Wiring

pub fn test_config() -> ClientConfig {
    ClientConfig {
        relay_url: Url::parse("ws://relay.test").unwrap(),
        ice_servers: Vec::new(),
        capture_on_join: false,
        reconnect: ReconnectPolicy::disabled(),
        ..ClientConfig::default()
    }
}

pub fn capture_manager(
    platform: Arc<FakePlatform>,
    prefs: Arc<dyn PreferenceStore>,
) -> Arc<CaptureStreamManager> {
    Arc::new(CaptureStreamManager::new(platform, prefs))
}

/// One participant with fakes for every collaborator.
pub struct Participant {
    pub session: SessionHandle,
    pub relay: RelayClient,
    pub engine: Arc<FakeEngine>,
    pub platform: Arc<FakePlatform>,
    pub capture: Arc<CaptureStreamManager>,
    pub sink: Arc<RecordingSink>,
}

pub fn participant(relay: &MemoryRelay, config: ClientConfig) -> Participant {
    let engine = FakeEngine::new();
    let platform = FakePlatform::new();
    let capture = capture_manager(platform.clone(), config.preference_store());
    let sink = Arc::new(RecordingSink::default());
    let client = relay.client(config.reconnect.clone());

    let session = SessionBuilder::new(config, engine.clone(), capture.clone())
        .relay(client.clone())
        .sink(sink.clone())
        .spawn();

    Participant {
        session,
        relay: client,
        engine,
        platform,
        capture,
        sink,
    }
}
