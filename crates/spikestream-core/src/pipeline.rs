//! Shared sample pipeline: every input source delivers frames here, and
//! every consumer-facing read (snapshots, recording, progress) comes out of
//! here. One lock serializes ingestion against orchestration so a source
//! switch never interleaves with a partially-delivered frame.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

use spikestream_foundation::{
    AcquisitionConfig, AudioEvent, BoardType, EventHub, SourceKind,
};

use crate::am_processor::AmModulationProcessor;
use crate::filters::{Filter, FilterChain};
use crate::recorder::RecordingWriter;
use crate::ring_buffer::SampleRingBuffer;
use crate::stream_processor::SampleStreamProcessor;

/// External per-frame hook, applied after AM demodulation and before the
/// band filters. Implementations must not block.
pub trait SampleProcessor: Send {
    fn process(&mut self, samples: &[i16]) -> Vec<i16>;
}

struct PipelineState {
    ring: SampleRingBuffer,
    filters: FilterChain,
    am: AmModulationProcessor,
    serial: SampleStreamProcessor,
    recording: Option<RecordingWriter>,
    processor: Option<Box<dyn SampleProcessor>>,
    sample_rate: u32,
    max_buffer_seconds: f64,
    recording_dir: PathBuf,
}

impl PipelineState {
    fn ring_capacity(sample_rate: u32, max_buffer_seconds: f64) -> usize {
        (sample_rate as f64 * max_buffer_seconds) as usize
    }

    fn store_and_record(&mut self, samples: &[i16], events: &EventHub) {
        self.ring.push(samples);
        self.record(samples, events);
    }

    fn record(&mut self, samples: &[i16], events: &EventHub) {
        let Some(writer) = self.recording.as_mut() else {
            return;
        };
        match writer.write(samples) {
            Ok(()) => events.emit(AudioEvent::RecordingProgress {
                samples: writer.samples_written(),
            }),
            Err(e) => {
                tracing::error!(error = %e, "recording write failed, closing session");
                if let Some(writer) = self.recording.take() {
                    let _ = writer.finalize();
                }
                events.emit(AudioEvent::RecordingFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    // Runs the optional external hook; a panicking hook loses only its own
    // output for this frame, never the stream.
    fn apply_processor(&mut self, samples: Vec<i16>) -> Vec<i16> {
        let Some(processor) = self.processor.as_mut() else {
            return samples;
        };
        match catch_unwind(AssertUnwindSafe(|| processor.process(&samples))) {
            Ok(out) => out,
            Err(_) => {
                tracing::error!("sample processor panicked, frame passed through unprocessed");
                samples
            }
        }
    }
}

pub struct Pipeline {
    state: Mutex<PipelineState>,
    events: EventHub,
}

impl Pipeline {
    pub fn new(config: &AcquisitionConfig, events: EventHub) -> Self {
        let sample_rate = config.audio_sample_rate.max(1);
        let max_buffer_seconds = config.max_buffer_seconds.max(0.1);
        let state = PipelineState {
            ring: SampleRingBuffer::new(PipelineState::ring_capacity(
                sample_rate,
                max_buffer_seconds,
            )),
            filters: FilterChain::new(sample_rate),
            am: AmModulationProcessor::new(events.clone(), sample_rate),
            serial: SampleStreamProcessor::new(events.clone()),
            recording: None,
            processor: None,
            sample_rate,
            max_buffer_seconds,
            recording_dir: config.recording_dir.clone(),
        };
        Self {
            state: Mutex::new(state),
            events,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Live capture path: AM detection, optional external hook, band
    /// filters, then the ring buffer and any open recording.
    pub fn receive_audio(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let demodulated = state.am.process(samples);
        let mut processed = state.apply_processor(demodulated);
        state.filters.apply(&mut processed);
        state.store_and_record(&processed, &self.events);
    }

    /// Playback path: the file's own byte position is authoritative, so the
    /// frame bypasses detection and filtering and lands verbatim.
    pub fn receive_audio_with_position(&self, samples: &[i16], byte_position: u64) {
        if samples.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.ring.push_with_position(samples, byte_position);
        state.record(samples, &self.events);
    }

    /// USB-serial path: frame decoding and board-message scanning first,
    /// then the same tail as live capture minus AM detection.
    pub fn receive_sample_stream(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let decoded = state.serial.process(chunk);
        if decoded.is_empty() {
            return;
        }
        let mut processed = state.apply_processor(decoded);
        state.filters.apply(&mut processed);
        state.store_and_record(&processed, &self.events);
    }

    /// Opens a recording session at the current sample rate. Returns false
    /// if one is already open or the sink cannot be created.
    pub fn start_recording(&self) -> bool {
        let mut state = self.state.lock();
        if state.recording.is_some() {
            tracing::warn!("recording already in progress");
            return false;
        }
        let dir = state.recording_dir.clone();
        match RecordingWriter::open(&dir, state.sample_rate) {
            Ok(writer) => {
                state.recording = Some(writer);
                self.events.emit(AudioEvent::RecordingStarted);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "could not open recording sink");
                self.events.emit(AudioEvent::RecordingFailed {
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Finalizes the open session; returns false if none was open.
    pub fn stop_recording(&self) -> bool {
        let writer = self.state.lock().recording.take();
        let Some(writer) = writer else {
            return false;
        };
        match writer.finalize() {
            Ok(samples) => {
                self.events.emit(AudioEvent::RecordingStopped { samples });
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "recording finalize failed");
                self.events.emit(AudioEvent::RecordingFailed {
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording.is_some()
    }

    pub fn clear_buffer(&self) {
        self.state.lock().ring.clear();
    }

    /// Consistent copy of the buffered window, oldest first.
    pub fn snapshot(&self) -> Vec<i16> {
        self.state.lock().ring.snapshot()
    }

    pub fn last_byte_position(&self) -> u64 {
        self.state.lock().ring.last_byte_position()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.state.lock().ring.capacity()
    }

    /// Switches the pipeline to a new rate: resizes the buffered window,
    /// rebuilds the filters and AM detector, and notifies subscribers once.
    /// Zero and unchanged values are ignored.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        if sample_rate == 0 {
            tracing::warn!("ignoring sample rate of zero");
            return;
        }
        let mut state = self.state.lock();
        if sample_rate == state.sample_rate {
            return;
        }
        tracing::info!(
            from = state.sample_rate,
            to = sample_rate,
            "sample rate changed"
        );
        state.sample_rate = sample_rate;
        let capacity = PipelineState::ring_capacity(sample_rate, state.max_buffer_seconds);
        state.ring.set_capacity(capacity);
        state.filters.set_sample_rate(sample_rate);
        state.am.set_sample_rate(sample_rate);
        drop(state);
        self.events.emit(AudioEvent::SampleRateChanged(sample_rate));
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    /// Resizes the buffered window; non-positive durations are ignored.
    pub fn set_max_buffer_seconds(&self, seconds: f64) {
        if seconds <= 0.0 {
            tracing::warn!(seconds, "ignoring non-positive buffer duration");
            return;
        }
        let mut state = self.state.lock();
        state.max_buffer_seconds = seconds;
        let capacity = PipelineState::ring_capacity(state.sample_rate, seconds);
        state.ring.set_capacity(capacity);
    }

    pub fn max_buffer_seconds(&self) -> f64 {
        self.state.lock().max_buffer_seconds
    }

    pub fn set_filter(&self, filter: Option<Filter>) {
        self.state.lock().filters.set_filter(filter);
    }

    pub fn filter(&self) -> Option<Filter> {
        self.state.lock().filters.filter()
    }

    pub fn set_processor(&self, processor: Box<dyn SampleProcessor>) {
        self.state.lock().processor = Some(processor);
    }

    pub fn clear_processor(&self) {
        self.state.lock().processor = None;
    }

    pub fn has_processor(&self) -> bool {
        self.state.lock().processor.is_some()
    }

    pub fn is_am_modulation_detected(&self) -> bool {
        self.state.lock().am.is_am_modulation_detected()
    }

    pub fn board_type(&self) -> Option<BoardType> {
        self.state.lock().serial.board_type()
    }

    /// Drops serial decoder state so a fresh connection starts clean.
    pub fn reset_serial(&self) {
        self.state.lock().serial.reset();
    }

    /// Called from a producer thread that died on its own (device loss,
    /// transport failure). Ends any open recording and clears the stale
    /// window so the next source starts from silence.
    pub fn source_terminated(&self, kind: SourceKind) {
        tracing::warn!(?kind, "input source terminated unexpectedly");
        self.stop_recording();
        self.clear_buffer();
        self.events.emit(AudioEvent::SourceStopped(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipeline() -> Pipeline {
        let config = AcquisitionConfig {
            recording_dir: std::env::temp_dir().join("spikestream-pipeline-tests"),
            ..AcquisitionConfig::default()
        };
        Pipeline::new(&config, EventHub::default())
    }

    #[test]
    fn audio_lands_in_the_buffer() {
        let pipeline = test_pipeline();
        pipeline.receive_audio(&[10, -10, 20, -20]);
        assert_eq!(pipeline.snapshot(), vec![10, -10, 20, -20]);
        assert_eq!(pipeline.last_byte_position(), 8);
    }

    #[test]
    fn positioned_audio_tracks_the_file_cursor() {
        let pipeline = test_pipeline();
        pipeline.receive_audio_with_position(&[1, 2, 3], 4_000);
        assert_eq!(pipeline.last_byte_position(), 4_000);
        assert_eq!(pipeline.snapshot(), vec![1, 2, 3]);
    }

    #[test]
    fn sample_rate_change_resizes_and_notifies_once() {
        let pipeline = test_pipeline();
        let mut rx = pipeline.events().subscribe();

        pipeline.set_sample_rate(10_000);
        pipeline.set_sample_rate(10_000);
        pipeline.set_sample_rate(0);

        assert_eq!(pipeline.sample_rate(), 10_000);
        assert_eq!(pipeline.buffer_capacity(), 20_000);
        assert_eq!(rx.try_recv().unwrap(), AudioEvent::SampleRateChanged(10_000));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn buffer_duration_resizes_capacity() {
        let pipeline = test_pipeline();
        pipeline.set_max_buffer_seconds(0.5);
        assert_eq!(pipeline.buffer_capacity(), 22_050);
        pipeline.set_max_buffer_seconds(-1.0);
        assert_eq!(pipeline.buffer_capacity(), 22_050);
    }

    #[test]
    fn source_termination_clears_state() {
        let pipeline = test_pipeline();
        let mut rx = pipeline.events().subscribe();
        pipeline.receive_audio(&[5; 64]);
        pipeline.source_terminated(SourceKind::Usb);

        assert!(pipeline.snapshot().is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            AudioEvent::SourceStopped(SourceKind::Usb)
        );
    }

    #[test]
    fn panicking_processor_passes_frame_through() {
        struct Bomb;
        impl SampleProcessor for Bomb {
            fn process(&mut self, _samples: &[i16]) -> Vec<i16> {
                panic!("boom");
            }
        }

        let pipeline = test_pipeline();
        pipeline.set_processor(Box::new(Bomb));
        pipeline.receive_audio(&[7, 8, 9]);
        assert_eq!(pipeline.snapshot(), vec![7, 8, 9]);
    }

    struct Doubler;
    impl SampleProcessor for Doubler {
        fn process(&mut self, samples: &[i16]) -> Vec<i16> {
            samples.iter().map(|&s| s.saturating_mul(2)).collect()
        }
    }

    #[test]
    fn external_processor_transforms_the_stream() {
        let pipeline = test_pipeline();
        pipeline.set_processor(Box::new(Doubler));
        assert!(pipeline.has_processor());
        pipeline.receive_audio(&[100, -100]);
        assert_eq!(pipeline.snapshot(), vec![200, -200]);

        pipeline.clear_processor();
        assert!(!pipeline.has_processor());
        pipeline.clear_buffer();
        pipeline.receive_audio(&[100, -100]);
        assert_eq!(pipeline.snapshot(), vec![100, -100]);
    }

    #[test]
    fn recording_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = AcquisitionConfig {
            recording_dir: dir.path().to_path_buf(),
            ..AcquisitionConfig::default()
        };
        let pipeline = Pipeline::new(&config, EventHub::default());
        let mut rx = pipeline.events().subscribe();

        assert!(pipeline.start_recording());
        assert!(!pipeline.start_recording());
        assert!(pipeline.is_recording());

        pipeline.receive_audio(&vec![1; 1_000]);
        assert!(pipeline.stop_recording());
        assert!(!pipeline.stop_recording());

        assert_eq!(rx.try_recv().unwrap(), AudioEvent::RecordingStarted);
        assert_eq!(
            rx.try_recv().unwrap(),
            AudioEvent::RecordingProgress { samples: 1_000 }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            AudioEvent::RecordingStopped { samples: 1_000 }
        );
    }
}
