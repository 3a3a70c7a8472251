use std::path::PathBuf;

use serde::Deserialize;

use crate::error::AppError;

/// Static configuration for the acquisition service.
///
/// Loaded from an optional `spikestream.toml` next to the working directory
/// with `SPIKESTREAM_*` environment variables layered on top; every field
/// has a sensible default so a bare `AcquisitionConfig::default()` is a
/// fully working setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Sample rate used for microphone capture when the device does not
    /// dictate one, and restored after a USB session ends.
    pub audio_sample_rate: u32,
    /// Sample rate of the USB-serial sample stream.
    pub serial_sample_rate: u32,
    /// How many seconds of the most recent signal the ring buffer retains.
    pub max_buffer_seconds: f64,
    /// Directory recordings are written into (created on demand).
    pub recording_dir: PathBuf,
    /// Preferred capture device name; `None` lets the host pick.
    pub input_device: Option<String>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            audio_sample_rate: 44_100,
            serial_sample_rate: 10_000,
            max_buffer_seconds: 2.0,
            recording_dir: PathBuf::from("recordings"),
            input_device: None,
        }
    }
}

impl AcquisitionConfig {
    pub fn load() -> Result<Self, AppError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("spikestream").required(false))
            .add_source(config::Environment::with_prefix("SPIKESTREAM"))
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }
}
