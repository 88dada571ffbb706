//! Local media: device discovery, capture constraints and the capture stream.

mod capture;
mod constraints;
mod devices;
mod preferences;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use self::capture::{CaptureState, CaptureStreamManager};
pub use self::constraints::{
    AudioConstraints, CaptureConstraints, ConstraintStore, ConstraintsPatch, VideoConstraints,
    CONSTRAINTS_KEY, OUTPUT_DEVICE_KEY,
};
pub use self::devices::{DeviceDirectory, DeviceList};
pub use self::preferences::{JsonFilePreferences, MemoryPreferences, PreferenceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    #[serde(rename = "videoinput")]
    CaptureVideo,
    #[serde(rename = "audioinput")]
    CaptureAudio,
    #[serde(rename = "audiooutput")]
    OutputAudio,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::CaptureVideo => write!(f, "videoinput"),
            DeviceKind::CaptureAudio => write!(f, "audioinput"),
            DeviceKind::OutputAudio => write!(f, "audiooutput"),
        }
    }
}

/// Snapshot of a platform device. Never mutated; re-fetch to refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    #[serde(rename = "deviceId")]
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
    pub group_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A live capture track handed out by the platform.
#[async_trait]
pub trait LocalTrack: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    /// Device the track captures from, if the platform reports it.
    fn device_id(&self) -> Option<&str>;

    fn is_live(&self) -> bool;

    /// Releases the underlying hardware. Idempotent.
    fn stop(&self);

    /// Applies new video dimensions to the running track.
    async fn apply_constraints(&self, constraints: &VideoConstraints) -> Result<()>;
}

/// A set of local tracks acquired together.
#[derive(Debug, Clone)]
pub struct CaptureStream {
    id: String,
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl CaptureStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<dyn LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// At least one track is still capturing.
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn release(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Media capabilities of the host platform.
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Opens the devices described by `constraints`.
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream>;

    /// Routes audio playback to the given output device.
    async fn set_output_sink(&self, device_id: &str) -> Result<()>;
}
