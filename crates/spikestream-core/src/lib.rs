pub mod am_processor;
pub mod filters;
pub mod mic;
pub mod pipeline;
pub mod playback;
pub mod recorder;
pub mod ring_buffer;
pub mod service;
pub mod stream_processor;
pub mod usb;
pub mod watchdog;

// Public API
pub use am_processor::AmModulationProcessor;
pub use filters::{Filter, FilterChain};
pub use mic::{DeviceConfig, MicrophoneThread};
pub use pipeline::{Pipeline, SampleProcessor};
pub use playback::PlaybackThread;
pub use recorder::RecordingWriter;
pub use ring_buffer::SampleRingBuffer;
pub use service::{AcquisitionService, SourceState};
pub use stream_processor::SampleStreamProcessor;
pub use usb::{SerialTransport, TransportError, TransportFactory, UsbHub, UsbListenerThread};
pub use watchdog::StallWatchdog;

/// Raw samples are 16-bit, so byte positions and sample counts convert by a
/// factor of two everywhere (playback progress, seek targets).
pub const BYTES_PER_SAMPLE: u64 = 2;

pub fn sample_count(bytes: u64) -> u64 {
    bytes / BYTES_PER_SAMPLE
}

pub fn byte_count(samples: u64) -> u64 {
    samples * BYTES_PER_SAMPLE
}
