//! USB-serial input source. Transport internals (OS plumbing, permissions)
//! live outside the core; this module only sees attach/detach/permission
//! notifications and a byte-read handle per connected board.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use spikestream_foundation::{AudioError, AudioEvent, EventHub, SourceKind};

use crate::pipeline::Pipeline;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Byte source for one connected board.
///
/// `read` must return within a bounded interval: implementations poll the
/// underlying I/O with a short timeout and return `Ok(0)` when nothing is
/// available yet. Stop requests are only observed between reads, so a
/// `read` that blocks indefinitely would stall source switching for the
/// whole service.
pub trait SerialTransport: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Produces a fresh transport for an attached board on each connection.
pub type TransportFactory = Box<dyn Fn() -> Result<Box<dyn SerialTransport>, AudioError> + Send>;

/// Registry of attached boards plus the notification surface the external
/// USB layer drives. The hub never owns a connection; listener threads do.
pub struct UsbHub {
    events: EventHub,
    devices: Mutex<HashMap<String, TransportFactory>>,
}

impl UsbHub {
    pub fn new(events: EventHub) -> Self {
        Self {
            events,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Called by the external layer when a board shows up.
    pub fn attach_device(&self, device_id: impl Into<String>, factory: TransportFactory) {
        let device_id = device_id.into();
        self.devices.lock().insert(device_id.clone(), factory);
        tracing::info!(%device_id, "usb device attached");
        self.events.emit(AudioEvent::UsbDeviceAttached { device_id });
    }

    /// Called by the external layer when a board is unplugged.
    pub fn detach_device(&self, device_id: &str) {
        if self.devices.lock().remove(device_id).is_some() {
            tracing::info!(%device_id, "usb device detached");
            self.events.emit(AudioEvent::UsbDeviceDetached {
                device_id: device_id.to_string(),
            });
        }
    }

    pub fn permission_granted(&self, device_id: &str) {
        self.events.emit(AudioEvent::UsbPermissionGranted {
            device_id: device_id.to_string(),
        });
    }

    pub fn permission_denied(&self, device_id: &str) {
        self.events.emit(AudioEvent::UsbPermissionDenied {
            device_id: device_id.to_string(),
        });
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.lock().keys().cloned().collect()
    }

    /// Opens a transport for the given board.
    pub fn open(&self, device_id: &str) -> Result<Box<dyn SerialTransport>, AudioError> {
        let devices = self.devices.lock();
        let factory = devices
            .get(device_id)
            .ok_or_else(|| AudioError::DeviceNotFound {
                name: Some(device_id.to_string()),
            })?;
        factory()
    }
}

/// Dedicated reader thread for one open transport; feeds raw serial chunks
/// into the pipeline until stopped or the transport dies.
pub struct UsbListenerThread {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

const READ_CHUNK: usize = 1_024;
// Consecutive I/O errors before the connection is declared dead.
const MAX_IO_ERRORS: u32 = 5;

impl UsbListenerThread {
    pub fn spawn(
        mut transport: Box<dyn SerialTransport>,
        pipeline: Arc<Pipeline>,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("usb-listener".to_string())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                let mut io_errors = 0u32;

                while thread_running.load(Ordering::Relaxed) {
                    match transport.read(&mut buf) {
                        Ok(0) => thread::sleep(Duration::from_millis(1)),
                        Ok(n) => {
                            io_errors = 0;
                            pipeline.receive_sample_stream(&buf[..n]);
                        }
                        Err(TransportError::Disconnected) => {
                            tracing::warn!("usb transport disconnected");
                            thread_running.store(false, Ordering::Relaxed);
                            pipeline.source_terminated(SourceKind::Usb);
                        }
                        Err(TransportError::Io(e)) => {
                            io_errors += 1;
                            tracing::warn!(error = %e, io_errors, "usb read failed");
                            if io_errors >= MAX_IO_ERRORS {
                                thread_running.store(false, Ordering::Relaxed);
                                pipeline.source_terminated(SourceKind::Usb);
                            }
                        }
                    }
                }
                tracing::debug!("usb listener exited");
            })
            .map_err(|e| AudioError::Fatal(format!("failed to spawn usb listener thread: {e}")))?;

        Ok(Self {
            handle: Some(handle),
            running,
        })
    }

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

impl Drop for UsbListenerThread {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikestream_foundation::EventHub;

    struct EmptyTransport;
    impl SerialTransport for EmptyTransport {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            Err(TransportError::Disconnected)
        }
    }

    #[test]
    fn attach_detach_roundtrip_emits_events() {
        let hub = UsbHub::new(EventHub::default());
        let mut rx = hub.events.subscribe();

        hub.attach_device("box-1", Box::new(|| Ok(Box::new(EmptyTransport))));
        assert_eq!(hub.device_count(), 1);
        assert!(hub.open("box-1").is_ok());

        hub.detach_device("box-1");
        assert_eq!(hub.device_count(), 0);
        assert!(matches!(
            hub.open("box-1"),
            Err(AudioError::DeviceNotFound { .. })
        ));

        assert_eq!(
            rx.try_recv().unwrap(),
            AudioEvent::UsbDeviceAttached {
                device_id: "box-1".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            AudioEvent::UsbDeviceDetached {
                device_id: "box-1".into()
            }
        );
    }

    #[test]
    fn listener_spawn_succeeds_and_reaps_a_dead_transport() {
        use crate::pipeline::Pipeline;
        use spikestream_foundation::AcquisitionConfig;

        let pipeline = Arc::new(Pipeline::new(
            &AcquisitionConfig::default(),
            EventHub::default(),
        ));
        let mut rx = pipeline.events().subscribe();
        let listener = UsbListenerThread::spawn(Box::new(EmptyTransport), pipeline).unwrap();

        // The transport disconnects on first read; the listener stops itself.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while listener.is_running() {
            assert!(std::time::Instant::now() < deadline, "listener did not stop");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            AudioEvent::SourceStopped(SourceKind::Usb)
        );
    }

    #[test]
    fn detaching_unknown_device_is_silent() {
        let hub = UsbHub::new(EventHub::default());
        let mut rx = hub.events.subscribe();
        hub.detach_device("ghost");
        assert!(rx.try_recv().is_err());
    }
}
