//! Capture constraints and their persistence.
//!
//! The persisted blob keeps the browser `MediaStreamConstraints` shape, so a
//! disabled kind is stored as `false` and ids as `{"exact": id}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::PreferenceStore;

/// Preference key of the capture constraints blob.
pub const CONSTRAINTS_KEY: &str = "SavedDevices";
/// Preference key of the selected output device.
pub const OUTPUT_DEVICE_KEY: &str = "SavedSpeakers";

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    #[serde(with = "toggle")]
    pub video: Option<VideoConstraints>,
    #[serde(with = "toggle")]
    pub audio: Option<AudioConstraints>,
}

impl Default for CaptureConstraints {
    /// 1280x720 from the default camera plus the default microphone.
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints::default()),
            audio: Some(AudioConstraints::default()),
        }
    }
}

impl CaptureConstraints {
    pub fn audio_only() -> Self {
        Self {
            video: None,
            ..Self::default()
        }
    }

    /// Applies the fields present in `patch`, enabling a kind if the patch
    /// selects a device for it.
    pub fn merge(&mut self, patch: &ConstraintsPatch) {
        if patch.touches_video() {
            let video = self.video.get_or_insert_with(VideoConstraints::default);
            if let Some(id) = &patch.video_device_id {
                video.device_id = Some(id.clone());
            }
            if let Some(width) = patch.width {
                video.width = width;
            }
            if let Some(height) = patch.height {
                video.height = height;
            }
        }
        if let Some(id) = &patch.audio_device_id {
            self.audio.get_or_insert_with(AudioConstraints::default).device_id = Some(id.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    #[serde(
        rename = "deviceId",
        with = "exact",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub device_id: Option<String>,
    #[serde(with = "dimension", default = "default_width")]
    pub width: u32,
    #[serde(with = "dimension", default = "default_height")]
    pub height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    #[serde(
        rename = "deviceId",
        with = "exact",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub device_id: Option<String>,
}

/// Partial update of [`CaptureConstraints`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintsPatch {
    pub video_device_id: Option<String>,
    pub audio_device_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ConstraintsPatch {
    pub fn video_device(id: impl Into<String>) -> Self {
        Self {
            video_device_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn audio_device(id: impl Into<String>) -> Self {
        Self {
            audio_device_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn resolution(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    fn touches_video(&self) -> bool {
        self.video_device_id.is_some() || self.width.is_some() || self.height.is_some()
    }
}

/// Current capture constraints backed by a [`PreferenceStore`].
///
/// Persistence failures are logged and never returned: the defaults can
/// always be regenerated.
pub struct ConstraintStore {
    prefs: Arc<dyn PreferenceStore>,
    current: CaptureConstraints,
}

impl ConstraintStore {
    /// Creates the store and loads the persisted constraints.
    pub fn new(prefs: Arc<dyn PreferenceStore>) -> Self {
        let mut store = Self {
            prefs,
            current: CaptureConstraints::default(),
        };
        store.load();
        store
    }

    /// Re-reads the persisted blob, falling back to the defaults when it is
    /// absent or corrupt.
    pub fn load(&mut self) -> CaptureConstraints {
        self.current = match self.prefs.get(CONSTRAINTS_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("discarding corrupt {} blob: {}", CONSTRAINTS_KEY, e);
                CaptureConstraints::default()
            }),
            Ok(None) => CaptureConstraints::default(),
            Err(e) => {
                warn!("failed to read {}: {}", CONSTRAINTS_KEY, e);
                CaptureConstraints::default()
            }
        };
        self.current.clone()
    }

    pub fn current(&self) -> &CaptureConstraints {
        &self.current
    }

    pub fn save(&mut self, constraints: CaptureConstraints) {
        self.current = constraints;
        self.persist();
    }

    pub fn merge(&mut self, patch: &ConstraintsPatch) -> &CaptureConstraints {
        self.current.merge(patch);
        self.persist();
        &self.current
    }

    /// Switches to the defaults for this run without touching the stored blob.
    pub fn use_defaults(&mut self) {
        self.current = CaptureConstraints::default();
    }

    pub fn output_device(&self) -> Option<String> {
        match self.prefs.get(OUTPUT_DEVICE_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw)
                .map_err(|e| warn!("discarding corrupt {} value: {}", OUTPUT_DEVICE_KEY, e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("failed to read {}: {}", OUTPUT_DEVICE_KEY, e);
                None
            }
        }
    }

    pub fn set_output_device(&mut self, device_id: &str) {
        let result = serde_json::to_string(device_id)
            .map_err(Into::into)
            .and_then(|raw| self.prefs.set(OUTPUT_DEVICE_KEY, &raw));
        if let Err(e) = result {
            warn!("failed to persist output device: {}", e);
        }
    }

    fn persist(&self) {
        let result = serde_json::to_string(&self.current)
            .map_err(Into::into)
            .and_then(|raw| self.prefs.set(CONSTRAINTS_KEY, &raw));
        match result {
            Ok(()) => debug!(constraints = ?self.current, "capture constraints saved"),
            Err(e) => warn!("failed to persist capture constraints: {}", e),
        }
    }
}

mod toggle {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(value) => value.serialize(serializer),
            None => serializer.serialize_bool(false),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Default,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Toggle<T> {
            Flag(bool),
            Value(T),
        }

        Ok(match Toggle::<T>::deserialize(deserializer)? {
            Toggle::Flag(false) => None,
            Toggle::Flag(true) => Some(T::default()),
            Toggle::Value(value) => Some(value),
        })
    }
}

mod exact {
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("exact", id)?;
                map.end()
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Id {
            Plain(String),
            Exact { exact: String },
            Ideal { ideal: String },
        }

        Ok(Option::<Id>::deserialize(deserializer)?.map(|id| match id {
            Id::Plain(id) | Id::Exact { exact: id } | Id::Ideal { ideal: id } => id,
        }))
    }
}

mod dimension {
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u32, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("ideal", value)?;
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u32, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Dimension {
            Plain(u32),
            Ideal { ideal: u32 },
            Exact { exact: u32 },
            Range { max: u32 },
        }

        Ok(match Dimension::deserialize(deserializer)? {
            Dimension::Plain(v)
            | Dimension::Ideal { ideal: v }
            | Dimension::Exact { exact: v }
            | Dimension::Range { max: v } => v,
        })
    }
}
