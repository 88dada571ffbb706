//! Ownership of the single local capture stream.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::{
    CaptureConstraints, CaptureStream, ConstraintStore, ConstraintsPatch, DeviceDirectory,
    DeviceKind, MediaPlatform, PreferenceStore,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Starting,
    Active,
    Reconfiguring,
    Stopped,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureState::Idle => write!(f, "Idle"),
            CaptureState::Starting => write!(f, "Starting"),
            CaptureState::Active => write!(f, "Active"),
            CaptureState::Reconfiguring => write!(f, "Reconfiguring"),
            CaptureState::Stopped => write!(f, "Stopped"),
        }
    }
}

struct Inner {
    constraints: ConstraintStore,
    current: Option<CaptureStream>,
}

/// Owns at most one live [`CaptureStream`].
///
/// Operations are serialized: each one holds the stream slot until it
/// finishes, and any previous stream is released before a new one is
/// acquired.
pub struct CaptureStreamManager {
    platform: Arc<dyn MediaPlatform>,
    inner: Mutex<Inner>,
    state: watch::Sender<CaptureState>,
    stream: watch::Sender<Option<CaptureStream>>,
}

impl CaptureStreamManager {
    pub fn new(platform: Arc<dyn MediaPlatform>, prefs: Arc<dyn PreferenceStore>) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        let (stream, _) = watch::channel(None);
        Self {
            platform,
            inner: Mutex::new(Inner {
                constraints: ConstraintStore::new(prefs),
                current: None,
            }),
            state,
            stream,
        }
    }

    pub fn directory(&self) -> DeviceDirectory {
        DeviceDirectory::new(self.platform.clone())
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    /// Preview sink: yields the current stream every time it is replaced.
    pub fn subscribe(&self) -> watch::Receiver<Option<CaptureStream>> {
        self.stream.subscribe()
    }

    pub fn current_stream(&self) -> Option<CaptureStream> {
        self.stream.borrow().clone()
    }

    /// A stream exists and at least one of its tracks is live.
    pub fn is_active(&self) -> bool {
        self.stream.borrow().as_ref().map_or(false, CaptureStream::is_active)
    }

    pub async fn constraints(&self) -> CaptureConstraints {
        self.inner.lock().await.constraints.current().clone()
    }

    /// Acquires a stream with the stored constraints, falling back once to
    /// the defaults. Any previous stream is released first.
    pub async fn start(&self) -> Result<CaptureStream> {
        let mut inner = self.inner.lock().await;
        self.acquire(&mut inner, CaptureState::Starting).await
    }

    /// Selects a device. Capture devices restart an active stream, the
    /// output device is routed directly and persisted on its own.
    pub async fn switch_device(&self, kind: DeviceKind, device_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let patch = match kind {
            DeviceKind::OutputAudio => {
                self.platform.set_output_sink(device_id).await?;
                inner.constraints.set_output_device(device_id);
                info!(device = device_id, "audio output switched");
                return Ok(());
            }
            DeviceKind::CaptureVideo => ConstraintsPatch::video_device(device_id),
            DeviceKind::CaptureAudio => ConstraintsPatch::audio_device(device_id),
        };
        inner.constraints.merge(&patch);

        let active = inner.current.as_ref().map_or(false, CaptureStream::is_active);
        if active {
            debug!(%kind, device = device_id, "re-acquiring stream for new device");
            self.acquire(&mut inner, CaptureState::Reconfiguring).await?;
        }
        Ok(())
    }

    /// Stores new video dimensions and applies them to live video tracks in
    /// place.
    pub async fn change_resolution(&self, width: u32, height: u32) {
        let mut inner = self.inner.lock().await;
        let video = inner
            .constraints
            .merge(&ConstraintsPatch::resolution(width, height))
            .video
            .clone()
            .unwrap_or_default();

        let Some(stream) = inner.current.as_ref().filter(|s| s.is_active()) else {
            return;
        };
        for track in stream.video_tracks() {
            if let Err(e) = track.apply_constraints(&video).await {
                warn!(track = track.id(), "failed to apply {}x{}: {}", width, height, e);
            }
        }
        debug!(width, height, "resolution changed");
    }

    /// Releases every track. Idempotent.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(stream) = inner.current.take() {
            stream.release();
            info!(stream = stream.id(), "capture stopped");
        }
        self.stream.send_replace(None);
        self.state.send_replace(CaptureState::Stopped);
    }

    async fn acquire(
        &self,
        inner: &mut Inner,
        transitional: CaptureState,
    ) -> Result<CaptureStream> {
        if let Some(previous) = inner.current.take() {
            previous.release();
            debug!(stream = previous.id(), "previous stream released");
        }
        self.stream.send_replace(None);
        self.state.send_replace(transitional);

        let constraints = inner.constraints.current().clone();
        let stream = match self.platform.acquire(&constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("capture failed with stored constraints, retrying with defaults: {}", e);
                inner.constraints.use_defaults();
                match self.platform.acquire(&CaptureConstraints::default()).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("capture failed with default constraints: {}", e);
                        self.state.send_replace(CaptureState::Idle);
                        return Err(Error::CaptureUnavailable(Box::new(e)));
                    }
                }
            }
        };

        if let Some(output) = inner.constraints.output_device() {
            if let Err(e) = self.platform.set_output_sink(&output).await {
                warn!(device = %output, "failed to restore audio output: {}", e);
            }
        }

        info!(
            stream = stream.id(),
            tracks = stream.tracks().len(),
            "capture stream active"
        );
        inner.current = Some(stream.clone());
        self.stream.send_replace(Some(stream.clone()));
        self.state.send_replace(CaptureState::Active);
        Ok(stream)
    }
}
