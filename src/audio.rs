//! Host audio devices through cpal.
//!
//! cpal streams are not `Send`, so every capture runs on its own thread that
//! owns the stream until the track is stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use rand::Rng;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::media::{
    CaptureConstraints, CaptureStream, DeviceDescriptor, DeviceKind, LocalTrack, MediaPlatform,
    TrackKind, VideoConstraints,
};

/// Frames buffered per subscriber before the slowest one starts lagging.
const FRAME_BUFFER: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn find_device(
    mut devices: impl Iterator<Item = cpal::Device>,
    name: &str,
) -> Option<cpal::Device> {
    devices.find(|d| d.name().map_or(false, |n| n == name))
}

fn describe(device: &cpal::Device, kind: DeviceKind) -> anyhow::Result<DeviceDescriptor> {
    let name = device.name().context("device name")?;
    Ok(DeviceDescriptor {
        id: name.clone(),
        kind,
        label: name,
        group_id: String::new(),
    })
}

fn list_devices() -> anyhow::Result<Vec<DeviceDescriptor>> {
    let host = cpal::default_host();
    let mut descriptors = Vec::new();
    for device in host.input_devices().context("input devices")? {
        descriptors.push(describe(&device, DeviceKind::CaptureAudio)?);
    }
    for device in host.output_devices().context("output devices")? {
        descriptors.push(describe(&device, DeviceKind::OutputAudio)?);
    }
    Ok(descriptors)
}

/// Media platform over the default cpal host.
///
/// Device ids are cpal device names. There is no camera backend: video
/// constraints are skipped.
#[derive(Debug, Default)]
pub struct CpalPlatform {
    output: Mutex<Option<String>>,
}

impl CpalPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output device selected through [`MediaPlatform::set_output_sink`].
    pub fn output_device(&self) -> Option<String> {
        lock(&self.output).clone()
    }
}

#[async_trait]
impl MediaPlatform for CpalPlatform {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        tokio::task::spawn_blocking(list_devices)
            .await
            .map_err(|e| Error::EnumerationFailed(e.to_string()))?
            .map_err(|e| Error::EnumerationFailed(format!("{:#}", e)))
    }

    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream> {
        if constraints.video.is_some() {
            info!("no camera backend, skipping video capture");
        }
        let Some(audio) = &constraints.audio else {
            return Err(Error::DeviceUnavailable("no audio capture requested".into()));
        };

        let track = CpalAudioTrack::open(audio.device_id.clone()).await?;
        let stream_id = format!("cpal-{:08x}", rand::thread_rng().gen::<u32>());
        Ok(CaptureStream::new(stream_id, vec![Arc::new(track)]))
    }

    async fn set_output_sink(&self, device_id: &str) -> Result<()> {
        let name = device_id.to_owned();
        let found = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let host = cpal::default_host();
            Ok(find_device(host.output_devices()?, &name).is_some())
        })
        .await
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .map_err(|e| Error::DeviceUnavailable(format!("{:#}", e)))?;

        if !found {
            return Err(Error::DeviceUnavailable(format!("no output device {}", device_id)));
        }
        *lock(&self.output) = Some(device_id.to_owned());
        debug!(device = device_id, "audio output selected");
        Ok(())
    }
}

/// Format of the frames a [`CpalAudioTrack`] publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Microphone capture running on a dedicated thread.
#[derive(Debug)]
pub struct CpalAudioTrack {
    id: String,
    device_id: String,
    format: AudioFormat,
    live: AtomicBool,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    frames: broadcast::Sender<Arc<[f32]>>,
}

impl CpalAudioTrack {
    async fn open(device_id: Option<String>) -> Result<Self> {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let sender = frames.clone();
        thread::Builder::new()
            .name("cpal-capture".into())
            .spawn(move || capture_thread(device_id, sender, ready_tx, stop_rx))?;

        let (name, format) = ready_rx
            .await
            .map_err(|_| Error::DeviceUnavailable("capture thread exited".into()))?
            .map_err(|e| Error::DeviceUnavailable(format!("{:#}", e)))?;

        info!(
            device = %name,
            rate = format.sample_rate,
            channels = format.channels,
            "audio capture started"
        );
        Ok(Self {
            id: format!("audio-{:08x}", rand::thread_rng().gen::<u32>()),
            device_id: name,
            format,
            live: AtomicBool::new(true),
            stop_tx: Mutex::new(Some(stop_tx)),
            frames,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Interleaved f32 frames as delivered by the device.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Arc<[f32]>> {
        self.frames.subscribe()
    }
}

#[async_trait]
impl LocalTrack for CpalAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn device_id(&self) -> Option<&str> {
        Some(&self.device_id)
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            // Dropping the sender ends the capture thread and its stream.
            lock(&self.stop_tx).take();
            debug!(track = %self.id, "audio capture stopped");
        }
    }

    async fn apply_constraints(&self, _constraints: &VideoConstraints) -> Result<()> {
        Ok(())
    }
}

impl Drop for CpalAudioTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

type Ready = anyhow::Result<(String, AudioFormat)>;

fn capture_thread(
    device_id: Option<String>,
    frames: broadcast::Sender<Arc<[f32]>>,
    ready: oneshot::Sender<Ready>,
    stop: std_mpsc::Receiver<()>,
) {
    let stream = match open_input(device_id.as_deref(), frames) {
        Ok((stream, name, format)) => {
            let _ = ready.send(Ok((name, format)));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    // Blocks until the track is stopped or dropped.
    let _ = stop.recv();
    drop(stream);
}

fn open_input(
    device_id: Option<&str>,
    frames: broadcast::Sender<Arc<[f32]>>,
) -> anyhow::Result<(cpal::Stream, String, AudioFormat)> {
    let host = cpal::default_host();
    let device = match device_id {
        Some(id) => find_device(host.input_devices()?, id)
            .ok_or_else(|| anyhow!("no input device {}", id))?,
        None => host
            .default_input_device()
            .ok_or_else(|| anyhow!("no input device available"))?,
    };
    let name = device.name()?;

    let config = device.default_input_config()?;
    let format = AudioFormat {
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
    };
    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config.into(), frames)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config.into(), frames)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config.into(), frames)?,
        sample_format => return Err(anyhow!("unsupported sample format: {:?}", sample_format)),
    };
    stream.play()?;
    Ok((stream, name, format))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frames: broadcast::Sender<Arc<[f32]>>,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if frames.receiver_count() == 0 {
                return;
            }
            let samples: Arc<[f32]> = data.iter().map(|s| f32::from_sample(*s)).collect();
            let _ = frames.send(samples);
        },
        |err| error!("audio input stream error: {}", err),
        None,
    )?;
    Ok(stream)
}
