use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DeviceDescriptor, DeviceKind, MediaPlatform};
use crate::error::{Error, Result};

/// Devices grouped by kind, in platform order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceList {
    pub video_source: Vec<DeviceDescriptor>,
    pub audio_source: Vec<DeviceDescriptor>,
    pub output_audio: Vec<DeviceDescriptor>,
}

impl DeviceList {
    pub fn of_kind(&self, kind: DeviceKind) -> &[DeviceDescriptor] {
        match kind {
            DeviceKind::CaptureVideo => &self.video_source,
            DeviceKind::CaptureAudio => &self.audio_source,
            DeviceKind::OutputAudio => &self.output_audio,
        }
    }

    pub fn find(&self, kind: DeviceKind, id: &str) -> Option<&DeviceDescriptor> {
        self.of_kind(kind).iter().find(|d| d.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.video_source.is_empty() && self.audio_source.is_empty() && self.output_audio.is_empty()
    }

    /// Labels stay empty until the platform granted capture permission once.
    pub fn labels_redacted(&self) -> bool {
        [&self.video_source, &self.audio_source, &self.output_audio]
            .iter()
            .flat_map(|devices| devices.iter())
            .any(|d| d.label.is_empty())
    }
}

impl FromIterator<DeviceDescriptor> for DeviceList {
    fn from_iter<I: IntoIterator<Item = DeviceDescriptor>>(iter: I) -> Self {
        let mut list = DeviceList::default();
        for device in iter {
            match device.kind {
                DeviceKind::CaptureVideo => list.video_source.push(device),
                DeviceKind::CaptureAudio => list.audio_source.push(device),
                DeviceKind::OutputAudio => list.output_audio.push(device),
            }
        }
        list
    }
}

/// Read-only view of the platform's devices.
#[derive(Clone)]
pub struct DeviceDirectory {
    platform: Arc<dyn MediaPlatform>,
}

impl DeviceDirectory {
    pub fn new(platform: Arc<dyn MediaPlatform>) -> Self {
        Self { platform }
    }

    /// Enumerates devices. May trigger a permission prompt, and the result
    /// can change between calls.
    pub async fn list_devices(&self) -> Result<DeviceList> {
        let devices = self.platform.enumerate_devices().await.map_err(|e| match e {
            Error::PermissionDenied(_) | Error::EnumerationFailed(_) => e,
            other => Error::EnumerationFailed(other.to_string()),
        });
        let devices = match devices {
            Ok(devices) => devices,
            Err(e) => {
                warn!("device enumeration failed: {}", e);
                return Err(e);
            }
        };

        let list: DeviceList = devices.into_iter().collect();
        debug!(
            video = list.video_source.len(),
            audio = list.audio_source.len(),
            output = list.output_audio.len(),
            "devices enumerated"
        );
        Ok(list)
    }
}
