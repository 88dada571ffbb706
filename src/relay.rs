//! Duplex message channel to the signaling relay.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, Sink, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::backoff::BackoffDelayer;
use crate::config::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::signaling::{MessageKind, SignalingMessage};

/// How long `disconnect` waits for queued frames to be written.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens the text-frame transport to the relay.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream)>;
}

/// JSON text frames over a WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream)> {
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(Error::from)
            .with(|text: String| future::ready(Ok::<_, Error>(Message::Text(text))));
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(_)) => Some(Err(Error::RelayDisconnected)),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            })
        });
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStatus {
    pub state: RelayState,
    /// Number of successful connections so far, reconnections included.
    pub connections: u64,
}

/// Inbound messages of one kind.
///
/// Ends when the client disconnects.
#[derive(Debug)]
pub struct Subscription {
    kind: MessageKind,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl Subscription {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = SignalingMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

enum PumpEnd {
    /// Outbound side was closed by `disconnect`.
    Closed,
    Lost(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    connector: Arc<dyn RelayConnector>,
    policy: ReconnectPolicy,
    status: watch::Sender<RelayStatus>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    subscribers: Mutex<Vec<(MessageKind, mpsc::UnboundedSender<SignalingMessage>)>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

/// Best-effort, at-most-once relay channel.
///
/// Sends while not connected are dropped. With reconnection enabled, a lost
/// connection is retried with a growing delay.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    pub fn new(connector: Arc<dyn RelayConnector>, policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(RelayStatus {
            state: RelayState::Disconnected,
            connections: 0,
        });
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                status,
                outbound: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                task: Mutex::new(None),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn websocket(policy: ReconnectPolicy) -> Self {
        Self::new(Arc::new(WebSocketConnector), policy)
    }

    pub fn status(&self) -> RelayStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RelayStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status().state == RelayState::Connected
    }

    /// Starts connecting in the background; watch [`RelayClient::status`]
    /// for the outcome.
    pub fn connect(&self, url: Url) -> Result<()> {
        let mut task = lock(&self.inner.task);
        // A task that already reported `Disconnected` has nothing left to do.
        let running = task.as_ref().map_or(false, |t| !t.is_finished())
            && self.status().state != RelayState::Disconnected;
        if running {
            return Err(Error::InvalidState("relay already connecting".into()));
        }
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.set_state(RelayState::Connecting);
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move { inner.run(url).await }));
        Ok(())
    }

    /// Queues a message. Returns `false` when it was dropped because the
    /// relay is not connected.
    pub fn send(&self, msg: &SignalingMessage) -> bool {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = %msg.kind(), "failed to encode message: {}", e);
                return false;
            }
        };
        match lock(&self.inner.outbound).as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => {
                debug!(kind = %msg.kind(), "relay not connected, dropping message");
                false
            }
        }
    }

    pub fn on_message(&self, kind: MessageKind) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push((kind, tx));
        Subscription { kind, rx }
    }

    /// Flushes queued frames, closes the transport and ends every
    /// subscription.
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        lock(&self.inner.subscribers).clear();
        let was_connected = lock(&self.inner.outbound).take().is_some();
        let task = lock(&self.inner.task).take();

        if let Some(mut task) = task {
            if was_connected {
                if tokio::time::timeout(FLUSH_TIMEOUT, &mut task).await.is_err() {
                    warn!("relay did not close in time");
                    task.abort();
                }
            } else {
                task.abort();
            }
        }
        self.inner.set_state(RelayState::Disconnected);
        debug!("relay client disconnected");
    }
}

impl Inner {
    fn set_state(&self, state: RelayState) {
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });
    }

    async fn run(self: Arc<Self>, url: Url) {
        let mut delayer = BackoffDelayer::from_policy(&self.policy);
        let mut failures = 0u32;

        loop {
            self.set_state(RelayState::Connecting);
            match self.connector.connect(&url).await {
                Ok((sink, stream)) => {
                    failures = 0;
                    delayer = BackoffDelayer::from_policy(&self.policy);

                    let (tx, rx) = mpsc::unbounded_channel();
                    if self.closing.load(Ordering::SeqCst) {
                        break;
                    }
                    *lock(&self.outbound) = Some(tx);
                    self.status.send_modify(|status| {
                        status.state = RelayState::Connected;
                        status.connections += 1;
                    });
                    info!(%url, "connected to relay");

                    let end = self.pump(sink, stream, rx).await;
                    lock(&self.outbound).take();
                    match end {
                        PumpEnd::Closed => break,
                        PumpEnd::Lost(reason) => warn!("relay connection lost: {}", reason),
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, "relay connection failed: {}", e);
                }
            }

            if self.closing.load(Ordering::SeqCst) || !self.policy.allows(failures) {
                break;
            }
            self.set_state(RelayState::Connecting);
            delayer.delay().await;
        }

        self.set_state(RelayState::Disconnected);
    }

    async fn pump(
        &self,
        mut sink: FrameSink,
        mut stream: FrameStream,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) -> PumpEnd {
        loop {
            tokio::select! {
                biased;
                frame = outbound.recv() => match frame {
                    Some(text) => {
                        trace!(frame = %text, "relay send");
                        if let Err(e) = sink.send(text).await {
                            return PumpEnd::Lost(e.to_string());
                        }
                    }
                    None => {
                        if let Err(e) = sink.close().await {
                            debug!("error closing relay transport: {}", e);
                        }
                        return PumpEnd::Closed;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
                    None => return PumpEnd::Lost("closed by relay".into()),
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        trace!(frame = %text, "relay recv");
        let msg = match SignalingMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping undecodable relay frame: {}", e);
                return;
            }
        };
        let kind = msg.kind();
        lock(&self.subscribers).retain(|(k, tx)| *k != kind || tx.send(msg.clone()).is_ok());
    }
}
