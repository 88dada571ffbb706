//! The session event loop.
//!
//! One task owns every peer record. User commands, relay messages, relay
//! status changes and completions of asynchronous engine steps are handled
//! one at a time. Engine calls never run inside a reaction: they are spawned
//! and report back as [`Event::Step`] tagged with the record generation they
//! were started for.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::mem;
use std::sync::Arc;

use futures::stream::select_all;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::peer::{PeerRecord, RemoteDescription};
use crate::config::ClientConfig;
use crate::connection::{NegotiationState, PeerRole, SessionMonitor, SessionState};
use crate::error::{Error, Result};
use crate::media::{CaptureStream, CaptureStreamManager, LocalTrack};
use crate::relay::{RelayClient, RelayState, RelayStatus};
use crate::signaling::{Membership, MessageKind, Signal, SignalingMessage};
use crate::transport::{
    IceCandidate, PeerEvent, PeerEventHandler, RemoteMediaSink, RemoteStream, RtcConnection,
    RtcEngine, SdpKind, SessionDescription,
};

/// Relay messages a session reacts to.
const SUBSCRIBED: [MessageKind; 5] = [
    MessageKind::Joined,
    MessageKind::Leave,
    MessageKind::Offer,
    MessageKind::Answer,
    MessageKind::IceCandidate,
];

/// Candidates buffered per peer before its offer arrives.
const MAX_EARLY_CANDIDATES: usize = 32;

pub(crate) enum Command {
    Join {
        channel: String,
        user: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Call {
        peer: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StartCall {
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    EndCall {
        peer: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

enum Step {
    ConnectionCreated(Result<Arc<dyn RtcConnection>>),
    LocalDescription(Result<SessionDescription>),
    RemoteDescriptionSet(Result<()>),
    CandidateApplied(Result<()>),
}

enum Event {
    Step {
        peer: String,
        generation: u64,
        step: Step,
    },
    Peer {
        peer: String,
        generation: u64,
        event: PeerEvent,
    },
    CaptureStarted(Result<()>),
}

pub(crate) struct Reactor {
    config: ClientConfig,
    relay: RelayClient,
    engine: Arc<dyn RtcEngine>,
    capture: Arc<CaptureStreamManager>,
    sink: Arc<dyn RemoteMediaSink>,
    monitor: SessionMonitor,
    events: mpsc::UnboundedSender<Event>,
    inbox: Option<mpsc::UnboundedReceiver<Event>>,

    state: SessionState,
    channel: Option<String>,
    user: Option<String>,
    members: Vec<String>,
    peers: HashMap<String, PeerRecord>,
    /// Candidates from peers we have no record for yet.
    early_candidates: HashMap<String, Vec<IceCandidate>>,
    /// Peers whose call ended; their trickle is dropped until they offer again.
    ended: HashSet<String>,
    next_generation: u64,
    seen_connections: u64,
    pending_join: Option<oneshot::Sender<Result<()>>>,
}

impl Reactor {
    pub fn new(
        config: ClientConfig,
        relay: RelayClient,
        engine: Arc<dyn RtcEngine>,
        capture: Arc<CaptureStreamManager>,
        sink: Arc<dyn RemoteMediaSink>,
        monitor: SessionMonitor,
    ) -> Self {
        let (events, inbox) = mpsc::unbounded_channel();
        Self {
            config,
            relay,
            engine,
            capture,
            sink,
            monitor,
            events,
            inbox: Some(inbox),
            state: SessionState::Idle,
            channel: None,
            user: None,
            members: Vec::new(),
            peers: HashMap::new(),
            early_candidates: HashMap::new(),
            ended: HashSet::new(),
            next_generation: 1,
            seen_connections: 0,
            pending_join: None,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let Some(mut events) = self.inbox.take() else {
            return;
        };

        let mut inbound = select_all(SUBSCRIBED.iter().map(|kind| self.relay.on_message(*kind)));
        let mut relay_status = self.relay.subscribe_status();
        self.seen_connections = relay_status.borrow_and_update().connections;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave { reply }) => {
                        self.leave().await;
                        self.publish();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("session handles dropped, leaving");
                        self.leave().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
                Some(msg) = inbound.next() => self.on_message(msg),
                Ok(()) = relay_status.changed() => {
                    let status = *relay_status.borrow_and_update();
                    self.on_relay_status(status);
                }
            }
            self.publish();
        }
        self.publish();
    }

    fn publish(&self) {
        let peers = self
            .peers
            .iter()
            .map(|(peer, record)| (peer.clone(), record.status()))
            .collect();
        self.monitor.update(|snapshot| {
            snapshot.state = self.state;
            snapshot.channel = self.channel.clone();
            snapshot.user = self.user.clone();
            snapshot.members = self.members.clone();
            snapshot.peers = peers;
        });
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Join {
                channel,
                user,
                reply,
            } => self.join(channel, user, reply),
            Command::Call { peer, reply } => {
                let _ = reply.send(self.call(&peer));
            }
            Command::StartCall { reply } => {
                let _ = reply.send(self.start_call());
            }
            Command::EndCall { peer, reply } => {
                let _ = reply.send(self.end_call(&peer));
            }
            // Handled by the loop, which stops after it.
            Command::Leave { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn join(&mut self, channel: String, user: String, reply: oneshot::Sender<Result<()>>) {
        if self.state != SessionState::Idle {
            let _ = reply.send(Err(Error::InvalidState(self.state.to_string())));
            return;
        }
        let user = if user.trim().is_empty() {
            self.config.guest_name.clone()
        } else {
            user
        };
        if let Err(e) = self.relay.connect(self.config.relay_url.clone()) {
            let _ = reply.send(Err(e));
            return;
        }

        info!(%channel, %user, relay = %self.config.relay_url, "joining channel");
        self.channel = Some(channel);
        self.user = Some(user);
        self.state = SessionState::Joining;
        self.pending_join = Some(reply);
    }

    fn require_joined(&self) -> Result<()> {
        if self.state == SessionState::Joined {
            Ok(())
        } else {
            Err(Error::InvalidState(self.state.to_string()))
        }
    }

    fn active_stream(&self) -> Result<CaptureStream> {
        self.capture
            .current_stream()
            .filter(CaptureStream::is_active)
            .ok_or_else(|| Error::InvalidState("capture is not active".into()))
    }

    fn call(&mut self, peer: &str) -> Result<()> {
        self.require_joined()?;
        if self.user.as_deref() == Some(peer) {
            return Err(Error::InvalidState("calling yourself".into()));
        }
        if self.peers.contains_key(peer) {
            return Err(Error::InvalidState(format!("already negotiating with {}", peer)));
        }
        self.active_stream()?;

        self.ended.remove(peer);
        let generation = self.create_record(peer, PeerRole::Offerer);
        self.spawn_connect(peer, generation);
        info!(%peer, "calling");
        Ok(())
    }

    fn start_call(&mut self) -> Result<Vec<String>> {
        self.require_joined()?;
        self.active_stream()?;
        let targets: Vec<String> = self
            .members
            .iter()
            .filter(|m| self.user.as_deref() != Some(m.as_str()) && !self.peers.contains_key(*m))
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(Error::NoRemotePeers);
        }
        for peer in &targets {
            self.call(peer)?;
        }
        Ok(targets)
    }

    fn end_call(&mut self, peer: &str) -> Result<()> {
        self.require_joined()?;
        if !self.teardown(peer) {
            return Err(Error::InvalidState(format!("not in a call with {}", peer)));
        }
        self.ended.insert(peer.to_owned());
        if let Some(membership) = self.membership() {
            self.send(Signal::Leave(membership), Some(peer));
        }
        Ok(())
    }

    async fn leave(&mut self) {
        let previous = self.state;
        if previous == SessionState::Left {
            return;
        }
        self.state = SessionState::Leaving;
        self.publish();

        let peers: Vec<String> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.teardown(&peer);
        }
        self.early_candidates.clear();
        self.ended.clear();
        if let Some(reply) = self.pending_join.take() {
            let _ = reply.send(Err(Error::InvalidState(SessionState::Leaving.to_string())));
        }

        if previous == SessionState::Joined {
            if let Some(membership) = self.membership() {
                self.send(Signal::Leave(membership), None);
            }
        }
        if matches!(previous, SessionState::Joining | SessionState::Joined) {
            self.relay.disconnect().await;
        }
        self.capture.stop().await;

        self.state = SessionState::Left;
        info!(channel = ?self.channel, "left channel");
    }

    fn membership(&self) -> Option<Membership> {
        Some(Membership {
            channel: self.channel.clone()?,
            user_name: self.user.clone()?,
        })
    }

    fn send(&self, signal: Signal, to: Option<&str>) {
        let (Some(channel), Some(user)) = (&self.channel, &self.user) else {
            return;
        };
        let mut msg = SignalingMessage::new(channel.clone(), user.clone(), signal);
        if let Some(peer) = to {
            msg = msg.to(peer);
        }
        self.relay.send(&msg);
    }

    fn on_relay_status(&mut self, status: RelayStatus) {
        match status.state {
            RelayState::Connected if status.connections > self.seen_connections => {
                self.seen_connections = status.connections;
                self.on_relay_connected();
            }
            RelayState::Connecting if self.state == SessionState::Joined => {
                debug!("relay reconnecting");
            }
            RelayState::Disconnected => match self.state {
                SessionState::Joining => {
                    warn!(relay = %self.config.relay_url, "could not reach relay");
                    self.state = SessionState::Idle;
                    self.channel = None;
                    self.user = None;
                    if let Some(reply) = self.pending_join.take() {
                        let _ = reply.send(Err(Error::RelayDisconnected));
                    }
                }
                SessionState::Joined => {
                    warn!(peers = self.peers.len(), "relay disconnected, keeping peer connections");
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn on_relay_connected(&mut self) {
        if !matches!(self.state, SessionState::Joining | SessionState::Joined) {
            return;
        }
        if let Some(membership) = self.membership() {
            self.send(Signal::Join(membership), None);
        }

        if self.state == SessionState::Joining {
            self.state = SessionState::Joined;
            info!(channel = ?self.channel, user = ?self.user, "joined channel");
            if let Some(reply) = self.pending_join.take() {
                let _ = reply.send(Ok(()));
            }
        } else {
            info!(channel = ?self.channel, "rejoined channel after relay reconnect");
        }

        if self.config.capture_on_join && !self.capture.is_active() {
            let capture = self.capture.clone();
            let monitor = self.monitor.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                let result = start_capture(capture, monitor).await;
                let _ = events.send(Event::CaptureStarted(result));
            });
        }
    }

    fn on_message(&mut self, msg: SignalingMessage) {
        let (Some(channel), Some(user)) = (self.channel.clone(), self.user.clone()) else {
            return;
        };
        if msg.channel != channel {
            debug!(channel = %msg.channel, kind = %msg.kind(), "message for another channel");
            return;
        }
        if self.state != SessionState::Joined {
            debug!(kind = %msg.kind(), state = %self.state, "ignoring message");
            return;
        }
        let for_us = msg.is_for(&user);
        let from = msg.from_user;

        match msg.signal {
            Signal::Joined(members) => {
                debug!(?members, "membership updated");
                self.early_candidates.retain(|peer, _| members.contains(peer));
                self.ended.retain(|peer| members.contains(peer));
                self.members = members;
            }
            _ if !for_us => {}
            Signal::Offer(offer) => self.on_offer(from, offer),
            Signal::Answer(answer) => self.on_answer(from, answer),
            Signal::IceCandidate(candidate) => self.on_remote_candidate(from, candidate),
            Signal::Leave(_) => self.on_peer_left(&from),
            Signal::Join(_) => {}
        }
    }

    fn on_offer(&mut self, from: String, offer: SessionDescription) {
        if self.peers.contains_key(&from) {
            debug!(peer = %from, "duplicate offer ignored");
            return;
        }
        self.ended.remove(&from);
        let generation = self.create_record(&from, PeerRole::Answerer);
        if let Some(record) = self.peers.get_mut(&from) {
            record.pending_remote_description = Some(offer);
        }
        self.spawn_connect(&from, generation);
        info!(peer = %from, "incoming call");
    }

    fn on_answer(&mut self, from: String, answer: SessionDescription) {
        let target = self.peers.get_mut(&from).and_then(|record| {
            let expected = record.role == PeerRole::Offerer
                && record.local_description_sent
                && record.remote == RemoteDescription::Missing;
            let connection = record.connection.clone().filter(|_| expected)?;
            record.remote = RemoteDescription::Applying;
            Some((record.generation, connection))
        });
        let Some((generation, connection)) = target else {
            debug!("dropping answer: {}", Error::StaleMessage(from));
            return;
        };
        self.spawn_step(&from, generation, async move {
            Step::RemoteDescriptionSet(connection.set_remote_description(answer).await)
        });
    }

    fn on_remote_candidate(&mut self, from: String, candidate: IceCandidate) {
        let Some(record) = self.peers.get_mut(&from) else {
            if self.ended.contains(&from) {
                debug!("dropping candidate: {}", Error::StaleMessage(from));
                return;
            }
            let early = self.early_candidates.entry(from).or_default();
            if early.len() >= MAX_EARLY_CANDIDATES {
                debug!(buffered = early.len(), "early candidate buffer full, dropping");
                return;
            }
            early.push(candidate);
            return;
        };
        let ready = match (&record.remote, &record.connection) {
            (RemoteDescription::Applied, Some(connection)) => {
                Some((record.generation, connection.clone()))
            }
            _ => None,
        };
        match ready {
            Some((generation, connection)) => {
                self.apply_candidate(&from, generation, connection, candidate)
            }
            None => record.pending_remote_candidates.push(candidate),
        }
    }

    fn on_peer_left(&mut self, from: &str) {
        self.early_candidates.remove(from);
        self.ended.remove(from);
        if self.teardown(from) {
            info!(peer = %from, "peer left, connection closed");
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Step {
                peer,
                generation,
                step,
            } => {
                if !self.is_live(&peer, generation) {
                    debug!(%peer, generation, "discarding completion for closed record");
                    if let Step::ConnectionCreated(Ok(connection)) = step {
                        close_detached(&peer, connection);
                    }
                    return;
                }
                match step {
                    Step::ConnectionCreated(result) => self.on_connection_created(&peer, result),
                    Step::LocalDescription(result) => self.on_local_description(&peer, result),
                    Step::RemoteDescriptionSet(result) => {
                        self.on_remote_description_set(&peer, result)
                    }
                    Step::CandidateApplied(result) => {
                        if let Err(e) = result {
                            warn!(%peer, "failed to apply remote candidate: {}", e);
                        }
                    }
                }
            }
            Event::Peer {
                peer,
                generation,
                event,
            } => {
                if self.is_live(&peer, generation) {
                    self.on_peer_event(&peer, event);
                }
            }
            Event::CaptureStarted(Ok(())) => debug!("capture started on join"),
            Event::CaptureStarted(Err(e)) => warn!("failed to start capture on join: {}", e),
        }
    }

    fn on_connection_created(&mut self, peer: &str, result: Result<Arc<dyn RtcConnection>>) {
        let connection = match result {
            Ok(connection) => connection,
            Err(e) => return self.fail_record(peer, e),
        };
        let tracks = self.local_tracks();
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        record.connection = Some(connection.clone());
        let generation = record.generation;
        let role = record.role;

        match role {
            PeerRole::Offerer => self.spawn_step(peer, generation, async move {
                Step::LocalDescription(describe(connection, tracks, SdpKind::Offer).await)
            }),
            PeerRole::Answerer => {
                let Some(offer) = record.pending_remote_description.take() else {
                    return;
                };
                record.remote = RemoteDescription::Applying;
                self.spawn_step(peer, generation, async move {
                    Step::RemoteDescriptionSet(connection.set_remote_description(offer).await)
                });
            }
        }
    }

    fn on_local_description(&mut self, peer: &str, result: Result<SessionDescription>) {
        let description = match result {
            Ok(description) => description,
            Err(e) => return self.fail_record(peer, e),
        };
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        record.local_description_sent = true;
        let signal = match description.kind {
            SdpKind::Offer => {
                record.advance(NegotiationState::HaveLocalOffer);
                Signal::Offer(description)
            }
            SdpKind::Answer => {
                record.advance(NegotiationState::Stable);
                Signal::Answer(description)
            }
        };
        let queued = mem::take(&mut record.pending_local_candidates);

        debug!(
            %peer,
            kind = %signal.kind(),
            candidates = queued.len(),
            "sending local description"
        );
        self.send(signal, Some(peer));
        for candidate in queued {
            self.send(Signal::IceCandidate(candidate), Some(peer));
        }
    }

    fn on_remote_description_set(&mut self, peer: &str, result: Result<()>) {
        if let Err(e) = result {
            return self.fail_record(peer, e);
        }
        let tracks = self.local_tracks();
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        record.remote = RemoteDescription::Applied;
        record.advance(match record.role {
            PeerRole::Offerer => NegotiationState::Stable,
            PeerRole::Answerer => NegotiationState::HaveRemoteOffer,
        });
        let generation = record.generation;
        let role = record.role;
        let candidates = mem::take(&mut record.pending_remote_candidates);
        let Some(connection) = record.connection.clone() else {
            return;
        };

        if !candidates.is_empty() {
            debug!(%peer, count = candidates.len(), "applying buffered candidates");
        }
        for candidate in candidates {
            self.apply_candidate(peer, generation, connection.clone(), candidate);
        }
        if role == PeerRole::Answerer {
            self.spawn_step(peer, generation, async move {
                Step::LocalDescription(describe(connection, tracks, SdpKind::Answer).await)
            });
        }
    }

    fn on_peer_event(&mut self, peer: &str, event: PeerEvent) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if record.local_description_sent {
                    self.send(Signal::IceCandidate(candidate), Some(peer));
                } else {
                    record.pending_local_candidates.push(candidate);
                }
            }
            PeerEvent::RemoteTrack { stream_id, track } => {
                if record.remote_stream.as_deref() == Some(stream_id.as_str()) {
                    self.sink.track_added(peer, track);
                } else {
                    debug!(%peer, stream = %stream_id, "attaching remote stream");
                    record.remote_stream = Some(stream_id.clone());
                    self.sink.attach(
                        peer,
                        RemoteStream {
                            id: stream_id,
                            tracks: vec![track],
                        },
                    );
                }
            }
            PeerEvent::StateChanged(NegotiationState::New) => {}
            PeerEvent::StateChanged(state) => {
                info!(%peer, %state, "peer connection state changed");
                record.state = state;
                if state == NegotiationState::Failed {
                    record.last_error = Some("transport failed".into());
                }
            }
        }
    }

    fn is_live(&self, peer: &str, generation: u64) -> bool {
        self.peers
            .get(peer)
            .map_or(false, |record| record.generation == generation)
    }

    fn local_tracks(&self) -> Vec<Arc<dyn LocalTrack>> {
        self.capture
            .current_stream()
            .map(|stream| stream.tracks().to_vec())
            .unwrap_or_default()
    }

    fn create_record(&mut self, peer: &str, role: PeerRole) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        let early = self.early_candidates.remove(peer).unwrap_or_default();
        self.peers
            .insert(peer.to_owned(), PeerRecord::new(generation, role, early));
        generation
    }

    fn fail_record(&mut self, peer: &str, error: Error) {
        warn!(%peer, "negotiation failed: {}", error);
        self.teardown(peer);
    }

    /// Removes the record for `peer`, closes its connection and clears its
    /// sink. Returns whether a record existed.
    fn teardown(&mut self, peer: &str) -> bool {
        let Some(record) = self.peers.remove(peer) else {
            return false;
        };
        if let Some(connection) = record.connection {
            close_detached(peer, connection);
        }
        self.sink.detach(peer);
        debug!(%peer, role = %record.role, "peer record removed");
        true
    }

    fn spawn_connect(&self, peer: &str, generation: u64) {
        let events = self.events.clone();
        let handler_peer = peer.to_owned();
        let on_event: PeerEventHandler = Arc::new(move |event| {
            let _ = events.send(Event::Peer {
                peer: handler_peer.clone(),
                generation,
                event,
            });
        });
        let engine = self.engine.clone();
        self.spawn_step(peer, generation, async move {
            Step::ConnectionCreated(engine.create_connection(on_event).await)
        });
    }

    fn apply_candidate(
        &self,
        peer: &str,
        generation: u64,
        connection: Arc<dyn RtcConnection>,
        candidate: IceCandidate,
    ) {
        self.spawn_step(peer, generation, async move {
            Step::CandidateApplied(connection.add_ice_candidate(candidate).await)
        });
    }

    fn spawn_step<F>(&self, peer: &str, generation: u64, step: F)
    where
        F: Future<Output = Step> + Send + 'static,
    {
        let events = self.events.clone();
        let peer = peer.to_owned();
        tokio::spawn(async move {
            let step = step.await;
            let _ = events.send(Event::Step {
                peer,
                generation,
                step,
            });
        });
    }
}

/// Starts capture for a session that joined, unless it is already on its way
/// out. A stream that finishes opening after leave began is released again.
async fn start_capture(capture: Arc<CaptureStreamManager>, monitor: SessionMonitor) -> Result<()> {
    let leaving = || {
        matches!(
            monitor.current().state,
            SessionState::Leaving | SessionState::Left
        )
    };
    if leaving() {
        return Err(Error::InvalidState("session is leaving".into()));
    }
    capture.start().await?;
    if leaving() {
        capture.stop().await;
        return Err(Error::InvalidState("session left during capture start".into()));
    }
    Ok(())
}

/// Adds the local tracks, then creates and applies the local description.
async fn describe(
    connection: Arc<dyn RtcConnection>,
    tracks: Vec<Arc<dyn LocalTrack>>,
    kind: SdpKind,
) -> Result<SessionDescription> {
    for track in tracks {
        connection.add_track(track).await?;
    }
    let description = match kind {
        SdpKind::Offer => connection.create_offer().await?,
        SdpKind::Answer => connection.create_answer().await?,
    };
    connection.set_local_description(description.clone()).await?;
    Ok(description)
}

fn close_detached(peer: &str, connection: Arc<dyn RtcConnection>) {
    let peer = peer.to_owned();
    tokio::spawn(async move {
        if let Err(e) = connection.close().await {
            debug!(%peer, "error closing peer connection: {}", e);
        }
    });
}
