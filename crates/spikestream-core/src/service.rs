//! Acquisition orchestrator: owns the pipeline, enforces that exactly one
//! input source feeds it at a time, and exposes the control surface the
//! host application drives.
//!
//! Locking: `control` serializes orchestration transitions (source state
//! and worker handles). The pipeline has its own lock which producer
//! threads take; orchestration never holds the pipeline lock while joining
//! a producer, so the two can never deadlock.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

use spikestream_foundation::{
    real_clock, AcquisitionConfig, AudioError, AudioEvent, BoardType, EventHub, RecoveryAction,
    SharedClock,
};

use crate::filters::Filter;
use crate::mic::MicrophoneThread;
use crate::pipeline::{Pipeline, SampleProcessor};
use crate::playback::PlaybackThread;
use crate::sample_count;
use crate::usb::{UsbHub, UsbListenerThread};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    None,
    Microphone,
    Usb,
    Playback,
}

#[derive(Default)]
struct SourceControl {
    source: SourceState,
    last_source: SourceState,
    mic: Option<MicrophoneThread>,
    usb: Option<UsbListenerThread>,
    playback: Option<PlaybackThread>,
    last_usb_device: Option<String>,
}

impl SourceControl {
    fn active_handle_running(&self) -> bool {
        match self.source {
            SourceState::None => false,
            SourceState::Microphone => self.mic.as_ref().is_some_and(|m| m.is_running()),
            SourceState::Usb => self.usb.as_ref().is_some_and(|u| u.is_running()),
            SourceState::Playback => self.playback.as_ref().is_some_and(|p| p.is_running()),
        }
    }
}

pub struct AcquisitionService {
    control: Mutex<SourceControl>,
    pipeline: Arc<Pipeline>,
    hub: Arc<UsbHub>,
    events: EventHub,
    config: AcquisitionConfig,
    clock: SharedClock,
}

impl AcquisitionService {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self::new_with_clock(config, real_clock())
    }

    pub fn new_with_clock(config: AcquisitionConfig, clock: SharedClock) -> Self {
        let events = EventHub::default();
        let pipeline = Arc::new(Pipeline::new(&config, events.clone()));
        let hub = Arc::new(UsbHub::new(events.clone()));
        Self {
            control: Mutex::new(SourceControl::default()),
            pipeline,
            hub,
            events,
            config,
            clock,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioEvent> {
        self.events.subscribe()
    }

    pub fn usb_hub(&self) -> &Arc<UsbHub> {
        &self.hub
    }

    pub fn usb_device_count(&self) -> usize {
        self.hub.device_count()
    }

    // ---- source orchestration -------------------------------------------

    /// Restarts whichever source was last active (microphone by default);
    /// a USB board that went away falls back to the microphone.
    pub fn start_active_input_source(&self) -> Result<(), AudioError> {
        let last = self.control.lock().last_source;
        match last {
            SourceState::Usb => {
                let device = self.control.lock().last_usb_device.clone();
                if let Some(device_id) = device {
                    match self.connect_to_usb_device(&device_id) {
                        Ok(()) => return Ok(()),
                        Err(e) if e.recovery_action() == RecoveryAction::Fatal => return Err(e),
                        Err(e) => {
                            tracing::warn!(
                                %device_id,
                                error = %e,
                                "last usb board unavailable, using microphone"
                            );
                        }
                    }
                }
                self.start_microphone()
            }
            _ => self.start_microphone(),
        }
    }

    pub fn stop_active_input_source(&self) {
        let mut control = self.control.lock();
        self.turn_off_locked(&mut control);
    }

    pub fn start_microphone(&self) -> Result<(), AudioError> {
        let mut control = self.control.lock();
        if control.source == SourceState::Microphone && control.active_handle_running() {
            return Ok(());
        }
        self.turn_off_locked(&mut control);

        let (mic, device_config) = MicrophoneThread::spawn(
            Arc::clone(&self.pipeline),
            self.config.input_device.clone(),
        )?;
        self.pipeline.set_sample_rate(device_config.sample_rate);
        control.mic = Some(mic);
        control.source = SourceState::Microphone;
        control.last_source = SourceState::Microphone;
        tracing::info!(
            sample_rate = device_config.sample_rate,
            "microphone source active"
        );
        Ok(())
    }

    pub fn stop_microphone(&self) {
        let mut control = self.control.lock();
        if control.source == SourceState::Microphone {
            self.turn_off_locked(&mut control);
        }
    }

    /// Switches to the given USB board; whatever was running is stopped
    /// first, in a fixed order, so no two sources ever overlap.
    pub fn connect_to_usb_device(&self, device_id: &str) -> Result<(), AudioError> {
        let mut control = self.control.lock();
        self.turn_off_locked(&mut control);

        let transport = self.hub.open(device_id)?;
        self.pipeline.reset_serial();
        self.pipeline.set_sample_rate(self.config.serial_sample_rate);

        control.usb = Some(UsbListenerThread::spawn(
            transport,
            Arc::clone(&self.pipeline),
        )?);
        control.source = SourceState::Usb;
        control.last_source = SourceState::Usb;
        control.last_usb_device = Some(device_id.to_string());
        self.events.emit(AudioEvent::UsbTransferStarted);
        tracing::info!(%device_id, "usb source active");
        Ok(())
    }

    pub fn disconnect_from_usb_device(&self) {
        let mut control = self.control.lock();
        if control.source != SourceState::Usb {
            return;
        }
        self.turn_off_locked(&mut control);
        // Back on the line-in rate for whatever source comes next.
        self.pipeline.set_sample_rate(self.config.audio_sample_rate);
    }

    pub fn start_playback(&self, path: &Path, autoplay: bool) -> Result<(), AudioError> {
        let mut control = self.control.lock();
        self.turn_off_locked(&mut control);

        let playback = PlaybackThread::start(
            path,
            autoplay,
            Arc::clone(&self.pipeline),
            self.events.clone(),
            Arc::clone(&self.clock),
        )?;
        self.pipeline.set_sample_rate(playback.sample_rate());
        control.playback = Some(playback);
        control.source = SourceState::Playback;
        control.last_source = SourceState::Playback;
        Ok(())
    }

    pub fn stop_playback(&self) {
        let mut control = self.control.lock();
        if control.source == SourceState::Playback {
            self.turn_off_locked(&mut control);
        }
    }

    pub fn toggle_playback(&self, play: bool) {
        let control = self.control.lock();
        if let Some(playback) = control.playback.as_ref() {
            if play {
                playback.play();
            } else {
                playback.pause();
            }
        }
    }

    /// Repositions the playback cursor to the given sample offset.
    pub fn seek_playback(&self, sample_pos: u64) {
        let control = self.control.lock();
        if let Some(playback) = control.playback.as_ref() {
            playback.seek(sample_pos);
        }
    }

    /// Samples delivered so far, derived from the buffer's byte position.
    /// Zero unless playback is the active mode; live capture advances the
    /// same byte counter but is not a playback position.
    pub fn playback_progress(&self) -> u64 {
        if self.control.lock().source != SourceState::Playback {
            return 0;
        }
        sample_count(self.pipeline.last_byte_position())
    }

    pub fn playback_length(&self) -> u64 {
        self.control
            .lock()
            .playback
            .as_ref()
            .map_or(0, |p| p.total_samples())
    }

    pub fn is_playback_mode(&self) -> bool {
        self.control.lock().source == SourceState::Playback
    }

    pub fn is_audio_playing(&self) -> bool {
        self.control
            .lock()
            .playback
            .as_ref()
            .is_some_and(|p| p.is_playing())
    }

    /// Current source; a producer that died on its own is reaped here so
    /// callers observe `None` instead of a zombie.
    pub fn active_source(&self) -> SourceState {
        let mut control = self.control.lock();
        if control.source != SourceState::None && !control.active_handle_running() {
            tracing::debug!(source = ?control.source, "reaping terminated source");
            self.turn_off_locked(&mut control);
        }
        control.source
    }

    // Stops recording and the running producer, then clears the stale
    // window. Fixed order keeps every switch path identical.
    fn turn_off_locked(&self, control: &mut SourceControl) {
        if control.source == SourceState::None {
            return;
        }
        self.pipeline.stop_recording();

        if let Some(mic) = control.mic.take() {
            mic.stop();
        }
        if let Some(usb) = control.usb.take() {
            usb.stop();
            self.events.emit(AudioEvent::UsbTransferStopped);
        }
        if let Some(playback) = control.playback.take() {
            playback.stop();
        }

        self.pipeline.clear_buffer();
        tracing::info!(source = ?control.source, "input source stopped");
        control.source = SourceState::None;
    }

    // ---- recording ------------------------------------------------------

    /// Opens a recording session. With no source running the microphone is
    /// started implicitly; if that fails the session still opens so data
    /// fed through the raw ingestion surface is captured.
    pub fn start_recording(&self) -> bool {
        if self.pipeline.is_recording() {
            return false;
        }
        if self.active_source() == SourceState::None {
            if let Err(e) = self.start_microphone() {
                tracing::warn!(error = %e, "implicit microphone start failed");
            }
        }
        self.pipeline.start_recording()
    }

    pub fn stop_recording(&self) -> bool {
        self.pipeline.stop_recording()
    }

    pub fn is_recording(&self) -> bool {
        self.pipeline.is_recording()
    }

    // ---- pipeline configuration and pass-throughs -----------------------

    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.pipeline.set_sample_rate(sample_rate);
    }

    pub fn sample_rate(&self) -> u32 {
        self.pipeline.sample_rate()
    }

    /// Size of the retained window, in seconds of signal.
    pub fn set_max_processing_secs(&self, seconds: f64) {
        self.pipeline.set_max_buffer_seconds(seconds);
    }

    pub fn set_filter(&self, filter: Option<Filter>) {
        self.pipeline.set_filter(filter);
    }

    pub fn filter(&self) -> Option<Filter> {
        self.pipeline.filter()
    }

    pub fn set_sample_processor(&self, processor: Box<dyn SampleProcessor>) {
        self.pipeline.set_processor(processor);
    }

    pub fn clear_sample_processor(&self) {
        self.pipeline.clear_processor();
    }

    pub fn has_sample_processor(&self) -> bool {
        self.pipeline.has_processor()
    }

    pub fn is_am_modulation_detected(&self) -> bool {
        self.pipeline.is_am_modulation_detected()
    }

    pub fn board_type(&self) -> Option<BoardType> {
        self.pipeline.board_type()
    }

    pub fn buffer_snapshot(&self) -> Vec<i16> {
        self.pipeline.snapshot()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.pipeline.buffer_capacity()
    }

    /// Raw ingestion surface for external capture subsystems.
    pub fn receive_audio(&self, samples: &[i16]) {
        self.pipeline.receive_audio(samples);
    }

    pub fn receive_audio_with_position(&self, samples: &[i16], byte_position: u64) {
        self.pipeline.receive_audio_with_position(samples, byte_position);
    }

    pub fn receive_sample_stream(&self, chunk: &[u8]) {
        self.pipeline.receive_sample_stream(chunk);
    }
}

impl Drop for AcquisitionService {
    fn drop(&mut self) {
        let mut control = self.control.lock();
        self.turn_off_locked(&mut control);
        self.pipeline.stop_recording();
    }
}
