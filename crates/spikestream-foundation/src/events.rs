use tokio::sync::broadcast;

/// Hardware board variant decoded from the serial protocol's framing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardType {
    Plant,
    Muscle,
    Heart,
    Neuron,
    Unknown,
}

/// The three kinds of raw-signal producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Microphone,
    Usb,
    Playback,
}

/// Notifications fired by the acquisition core toward UI/analysis
/// subscribers. Each logical event is emitted exactly once; delivery per
/// subscriber is order-preserving.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    SampleRateChanged(u32),
    PlaybackStarted { total_samples: u64 },
    PlaybackResumed,
    PlaybackProgress { position: u64 },
    PlaybackPaused,
    PlaybackStopped { completed: bool },
    RecordingStarted,
    RecordingProgress { samples: u64 },
    RecordingStopped { samples: u64 },
    RecordingFailed { reason: String },
    UsbDeviceAttached { device_id: String },
    UsbDeviceDetached { device_id: String },
    UsbPermissionGranted { device_id: String },
    UsbPermissionDenied { device_id: String },
    UsbTransferStarted,
    UsbTransferStopped,
    BoardTypeDetected(BoardType),
    AmModulationStarted,
    AmModulationEnded,
    SourceStopped(SourceKind),
}

/// Fan-out point for [`AudioEvent`]s. Emitting never blocks and tolerates
/// having no subscribers; slow subscribers observe `Lagged` rather than
/// stalling producers.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<AudioEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AudioEvent) {
        match self.tx.send(event) {
            Ok(receivers) => {
                tracing::trace!(receivers, "event delivered");
            }
            Err(broadcast::error::SendError(event)) => {
                tracing::debug!(?event, "no subscribers for event");
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
