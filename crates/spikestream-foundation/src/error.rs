use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Audio subsystem error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fatal error, cannot recover: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {name:?}")]
    DeviceNotFound { name: Option<String> },

    #[error("Device disconnected")]
    DeviceDisconnected,

    #[error("Format not supported: {format}")]
    FormatNotSupported { format: String },

    #[error("Playback source unreadable: {0}")]
    Playback(String),

    #[error("Recording sink unavailable: {0}")]
    RecordingUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("CPAL error: {0}")]
    Cpal(#[from] cpal::StreamError),

    #[error("Build stream error: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Play stream error: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Supported stream configs error: {0}")]
    SupportedStreamConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error("Fatal error, cannot recover: {0}")]
    Fatal(String),
}

/// How the pipeline reacts to an error raised inside a producing component.
/// Nothing here may tear down the whole pipeline; the worst outcome for a
/// single source is `StopSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Drop the offending data and keep going (protocol desync, frame drop).
    Ignore,
    /// The producer lost its underlying device/file; implicit stop.
    StopSource,
    /// Surface to subscribers as a non-fatal condition (recording I/O).
    Report,
    /// Unrecoverable within the service.
    Fatal,
}

impl AudioError {
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            AudioError::DeviceDisconnected | AudioError::Cpal(_) => RecoveryAction::StopSource,
            AudioError::RecordingUnavailable(_) | AudioError::Io(_) | AudioError::Wav(_) => {
                RecoveryAction::Report
            }
            AudioError::DeviceNotFound { .. }
            | AudioError::FormatNotSupported { .. }
            | AudioError::Playback(_)
            | AudioError::BuildStream(_)
            | AudioError::PlayStream(_)
            | AudioError::SupportedStreamConfigs(_) => RecoveryAction::Report,
            AudioError::Fatal(_) => RecoveryAction::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_not_found_names_device() {
        let err = AudioError::DeviceNotFound {
            name: Some("spikerbox".to_string()),
        };
        assert!(format!("{}", err).contains("spikerbox"));
    }

    #[test]
    fn recording_errors_are_reported_not_fatal() {
        let err = AudioError::RecordingUnavailable("no writable storage".into());
        assert_eq!(err.recovery_action(), RecoveryAction::Report);
    }

    #[test]
    fn disconnect_stops_the_source() {
        assert_eq!(
            AudioError::DeviceDisconnected.recovery_action(),
            RecoveryAction::StopSource
        );
    }

    #[test]
    fn app_error_wraps_audio_error() {
        let err: AppError = AudioError::DeviceDisconnected.into();
        assert!(matches!(err, AppError::Audio(_)));
    }
}
