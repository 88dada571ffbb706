//! Signaling session: channel membership and one negotiated peer connection
//! per remote participant.

mod peer;
mod reactor;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use self::reactor::{Command, Reactor};
use crate::config::ClientConfig;
use crate::connection::{SessionMonitor, SessionSnapshot, SessionState};
use crate::error::{Error, Result};
use crate::media::CaptureStreamManager;
use crate::relay::RelayClient;
use crate::transport::{NullSink, RemoteMediaSink, RtcEngine};

/// Collects the collaborators of a session.
pub struct SessionBuilder {
    config: ClientConfig,
    engine: Arc<dyn RtcEngine>,
    capture: Arc<CaptureStreamManager>,
    relay: Option<RelayClient>,
    sink: Arc<dyn RemoteMediaSink>,
}

impl SessionBuilder {
    pub fn new(
        config: ClientConfig,
        engine: Arc<dyn RtcEngine>,
        capture: Arc<CaptureStreamManager>,
    ) -> Self {
        Self {
            config,
            engine,
            capture,
            relay: None,
            sink: Arc::new(NullSink),
        }
    }

    /// Relay client to use instead of a WebSocket one built from the config.
    pub fn relay(mut self, relay: RelayClient) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Where remote streams are rendered.
    pub fn sink(mut self, sink: Arc<dyn RemoteMediaSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Starts the session task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let relay = self
            .relay
            .unwrap_or_else(|| RelayClient::websocket(self.config.reconnect.clone()));
        let monitor = SessionMonitor::new();
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let reactor = Reactor::new(
            self.config,
            relay,
            self.engine,
            self.capture.clone(),
            self.sink,
            monitor.clone(),
        );
        tokio::spawn(reactor.run(commands_rx));

        SessionHandle {
            commands,
            monitor,
            capture: self.capture,
        }
    }
}

/// Handle to a running session.
///
/// Clones share the session. When the last handle is dropped the session
/// leaves its channel.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    monitor: SessionMonitor,
    capture: Arc<CaptureStreamManager>,
}

fn closed() -> Error {
    Error::InvalidState(SessionState::Left.to_string())
}

impl SessionHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| closed())?;
        response.await.map_err(|_| closed())?
    }

    /// Connects to the relay and announces `user` in `channel`. Resolves once
    /// the relay connection is up. An empty `user` joins as the configured
    /// guest name.
    pub async fn join(&self, channel: &str, user: &str) -> Result<()> {
        let channel = channel.to_owned();
        let user = user.to_owned();
        self.request(|reply| Command::Join {
            channel,
            user,
            reply,
        })
        .await
    }

    /// Calls every member of the channel without a connection yet. Returns
    /// the members called.
    pub async fn start_call(&self) -> Result<Vec<String>> {
        self.request(|reply| Command::StartCall { reply }).await
    }

    /// Sends an offer to one member. Capture must be active.
    pub async fn call(&self, peer: &str) -> Result<()> {
        let peer = peer.to_owned();
        self.request(|reply| Command::Call { peer, reply }).await
    }

    /// Closes the connection with `peer` and tells them.
    pub async fn end_call(&self, peer: &str) -> Result<()> {
        let peer = peer.to_owned();
        self.request(|reply| Command::EndCall { peer, reply }).await
    }

    /// Closes every connection, announces the departure, disconnects from the
    /// relay and stops capture. The session cannot be used afterwards.
    pub async fn leave(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Leave { reply }).is_ok() {
            let _ = done.await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.monitor.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.monitor.subscribe()
    }

    /// Waits until the published snapshot satisfies `f`.
    pub async fn wait_for(
        &self,
        mut f: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut rx = self.monitor.subscribe();
        let snapshot = rx.wait_for(|s| f(s)).await.map_err(|_| closed())?;
        Ok(snapshot.clone())
    }

    pub fn capture(&self) -> &Arc<CaptureStreamManager> {
        &self.capture
    }
}
