//! Microphone input source: a dedicated capture thread around a cpal
//! stream, feeding raw PCM into the pipeline until stopped or the device
//! goes away.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spikestream_foundation::{AudioError, SourceKind};

use crate::pipeline::Pipeline;
use crate::watchdog::StallWatchdog;

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5);
const SPAWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Negotiated capture format, reported back to the orchestrator so it can
/// align the pipeline sample rate with the device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

pub struct MicrophoneThread {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl MicrophoneThread {
    /// Opens the capture device on a dedicated thread and waits (bounded)
    /// for format negotiation to finish.
    pub fn spawn(
        pipeline: Arc<Pipeline>,
        device_name: Option<String>,
    ) -> Result<(Self, DeviceConfig), AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let negotiated: Arc<Mutex<Option<Result<DeviceConfig, AudioError>>>> =
            Arc::new(Mutex::new(None));

        let thread_running = Arc::clone(&running);
        let thread_negotiated = Arc::clone(&negotiated);
        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let watchdog = StallWatchdog::new(WATCHDOG_TIMEOUT);
                let failed = Arc::new(AtomicBool::new(false));

                // The stream is !Send, so it lives and dies on this thread.
                let stream = match open_stream(
                    &pipeline,
                    device_name.as_deref(),
                    &thread_running,
                    &watchdog,
                    &failed,
                ) {
                    Ok((stream, config)) => {
                        *thread_negotiated.lock() = Some(Ok(config));
                        stream
                    }
                    Err(e) => {
                        *thread_negotiated.lock() = Some(Err(e));
                        return;
                    }
                };

                let monitor = watchdog.spawn_monitor(Arc::clone(&thread_running));
                while thread_running.load(Ordering::Relaxed) {
                    if watchdog.is_triggered() || failed.load(Ordering::Relaxed) {
                        tracing::warn!("microphone stream lost, stopping source");
                        thread_running.store(false, Ordering::Relaxed);
                        pipeline.source_terminated(SourceKind::Microphone);
                        break;
                    }
                    thread::sleep(Duration::from_millis(100));
                }

                thread_running.store(false, Ordering::Relaxed);
                drop(stream);
                let _ = monitor.join();
                tracing::debug!("microphone thread exited");
            })
            .map_err(|e| AudioError::Fatal(format!("failed to spawn mic thread: {e}")))?;

        // Bounded wait for the thread to report its negotiated format.
        let start = Instant::now();
        loop {
            if let Some(result) = negotiated.lock().take() {
                match result {
                    Ok(config) => {
                        return Ok((
                            Self {
                                handle: Some(handle),
                                running,
                            },
                            config,
                        ));
                    }
                    Err(e) => {
                        let _ = handle.join();
                        return Err(e);
                    }
                }
            }
            if start.elapsed() > SPAWN_TIMEOUT {
                running.store(false, Ordering::Relaxed);
                let _ = handle.join();
                return Err(AudioError::Fatal(
                    "no device configuration within timeout".to_string(),
                ));
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Non-blocking stop request; the capture callback observes it before
    /// its next delivery.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MicrophoneThread {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn open_stream(
    pipeline: &Arc<Pipeline>,
    device_name: Option<&str>,
    running: &Arc<AtomicBool>,
    watchdog: &StallWatchdog,
    failed: &Arc<AtomicBool>,
) -> Result<(Stream, DeviceConfig), AudioError> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioError::Fatal(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound {
                name: Some(name.to_string()),
            })?,
        None => host
            .default_input_device()
            .ok_or(AudioError::DeviceNotFound { name: None })?,
    };
    if let Ok(name) = device.name() {
        tracing::info!(device = name, "selected capture device");
    }

    let (config, sample_format) = negotiate_config(&device)?;
    let device_config = DeviceConfig {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let deliver = {
        let pipeline = Arc::clone(pipeline);
        let running = Arc::clone(running);
        let watchdog = watchdog.clone();
        let channels = config.channels as usize;
        let mut mono: Vec<i16> = Vec::new();
        move |data: &[i16]| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            watchdog.feed();
            mono.clear();
            downmix_into(data, channels, &mut mono);
            pipeline.receive_audio(&mono);
        }
    };

    let err_fn = {
        let failed = Arc::clone(failed);
        move |err: cpal::StreamError| {
            tracing::error!("capture stream error: {err}");
            failed.store(true, Ordering::Relaxed);
        }
    };

    let stream = match sample_format {
        SampleFormat::I16 => {
            let mut deliver = deliver;
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &_| deliver(data),
                err_fn,
                None,
            )?
        }
        SampleFormat::F32 => {
            let mut deliver = deliver;
            let mut converted: Vec<i16> = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &_| {
                    converted.clear();
                    converted.extend(
                        data.iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * 32_767.0).round() as i16),
                    );
                    deliver(&converted);
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::U16 => {
            let mut deliver = deliver;
            let mut converted: Vec<i16> = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[u16], _: &_| {
                    converted.clear();
                    converted.extend(data.iter().map(|&s| (s as i32 - 32_768) as i16));
                    deliver(&converted);
                },
                err_fn,
                None,
            )?
        }
        other => {
            return Err(AudioError::FormatNotSupported {
                format: format!("{other:?}"),
            });
        }
    };

    stream.play()?;
    Ok((stream, device_config))
}

fn negotiate_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat), AudioError> {
    if let Ok(default_config) = device.default_input_config() {
        return Ok((
            StreamConfig {
                channels: default_config.channels(),
                sample_rate: default_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            },
            default_config.sample_format(),
        ));
    }

    if let Some(config) = device.supported_input_configs()?.next() {
        let config = config.with_max_sample_rate();
        return Ok((
            StreamConfig {
                channels: config.channels(),
                sample_rate: config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            },
            config.sample_format(),
        ));
    }

    Err(AudioError::FormatNotSupported {
        format: "no supported input formats".to_string(),
    })
}

fn downmix_into(data: &[i16], channels: usize, mono: &mut Vec<i16>) {
    if channels <= 1 {
        mono.extend_from_slice(data);
        return;
    }
    for frame in data.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        mono.push((sum / channels as i32) as i16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_downmix_averages_pairs() {
        let mut mono = Vec::new();
        downmix_into(&[1_000, -1_000, 600, 400], 2, &mut mono);
        assert_eq!(mono, vec![0, 500]);
    }

    #[test]
    fn mono_downmix_is_identity() {
        let mut mono = Vec::new();
        downmix_into(&[1, 2, 3], 1, &mut mono);
        assert_eq!(mono, vec![1, 2, 3]);
    }
}
