//! File playback input source: streams a WAV file through the pipeline at
//! real-time pace, with pause/resume and sample-accurate seeking.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use spikestream_foundation::{AudioError, AudioEvent, EventHub, SharedClock};

use crate::byte_count;
use crate::pipeline::Pipeline;

enum PlaybackCommand {
    Play,
    Pause,
    Seek(u64),
}

pub struct PlaybackThread {
    handle: Option<JoinHandle<()>>,
    cmd_tx: Sender<PlaybackCommand>,
    running: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
    total_samples: u64,
    sample_rate: u32,
}

impl PlaybackThread {
    /// Loads the file up front and spawns the streaming thread. With
    /// `autoplay` false the source starts paused at position zero.
    pub fn start(
        path: &Path,
        autoplay: bool,
        pipeline: Arc<Pipeline>,
        events: EventHub,
        clock: SharedClock,
    ) -> Result<Self, AudioError> {
        let (samples, sample_rate) = load_wav(path)?;
        let total_samples = samples.len() as u64;
        tracing::info!(
            path = %path.display(),
            total_samples,
            sample_rate,
            "playback source loaded"
        );

        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let playing = Arc::new(AtomicBool::new(autoplay));

        let worker = Worker {
            samples,
            sample_rate,
            pipeline,
            events,
            clock,
            cmd_rx,
            running: Arc::clone(&running),
            playing_flag: Arc::clone(&playing),
        };
        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || worker.run(autoplay))
            .map_err(|e| AudioError::Fatal(format!("failed to spawn playback thread: {e}")))?;

        Ok(Self {
            handle: Some(handle),
            cmd_tx,
            running,
            playing,
            total_samples,
            sample_rate,
        })
    }

    pub fn play(&self) {
        let _ = self.cmd_tx.send(PlaybackCommand::Play);
    }

    pub fn pause(&self) {
        let _ = self.cmd_tx.send(PlaybackCommand::Pause);
    }

    /// Repositions the read cursor; legal while running or paused. The
    /// position is clamped to the file length.
    pub fn seek(&self, sample_pos: u64) {
        let _ = self.cmd_tx.send(PlaybackCommand::Seek(sample_pos));
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stop(mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackThread {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    samples: Vec<i16>,
    sample_rate: u32,
    pipeline: Arc<Pipeline>,
    events: EventHub,
    clock: SharedClock,
    cmd_rx: Receiver<PlaybackCommand>,
    running: Arc<AtomicBool>,
    playing_flag: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, autoplay: bool) {
        let total = self.samples.len();
        // ~25 ms chunks emulate live capture pacing.
        let chunk = (self.sample_rate as usize / 40).max(1);
        let chunk_duration =
            Duration::from_nanos(1_000_000_000u64 * chunk as u64 / self.sample_rate.max(1) as u64);

        self.events.emit(AudioEvent::PlaybackStarted {
            total_samples: total as u64,
        });

        let mut pos = 0usize;
        let mut playing = autoplay;
        let mut eof_reported = false;

        while self.running.load(Ordering::Relaxed) {
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                self.handle_command(cmd, total, &mut pos, &mut playing, &mut eof_reported);
            }

            if !playing {
                // Block on the command channel so a paused source costs
                // nothing; the stop flag is rechecked every wakeup.
                match self.cmd_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(cmd) => {
                        self.handle_command(cmd, total, &mut pos, &mut playing, &mut eof_reported)
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            if pos >= total {
                if !eof_reported {
                    eof_reported = true;
                    self.events.emit(AudioEvent::PlaybackStopped { completed: true });
                }
                playing = false;
                self.playing_flag.store(false, Ordering::Relaxed);
                continue;
            }

            let end = (pos + chunk).min(total);
            self.pipeline
                .receive_audio_with_position(&self.samples[pos..end], byte_count(end as u64));
            pos = end;
            self.events.emit(AudioEvent::PlaybackProgress {
                position: pos as u64,
            });

            if pos < total {
                self.clock.sleep(chunk_duration);
            }
        }

        if !eof_reported {
            self.events
                .emit(AudioEvent::PlaybackStopped { completed: false });
        }
        tracing::debug!("playback thread exited");
    }

    fn handle_command(
        &self,
        cmd: PlaybackCommand,
        total: usize,
        pos: &mut usize,
        playing: &mut bool,
        eof_reported: &mut bool,
    ) {
        match cmd {
            PlaybackCommand::Play => {
                // Replaying past the end restarts from the top.
                if *pos >= total {
                    *pos = 0;
                }
                if !*playing {
                    *playing = true;
                    *eof_reported = false;
                    self.playing_flag.store(true, Ordering::Relaxed);
                    self.events.emit(AudioEvent::PlaybackResumed);
                }
            }
            PlaybackCommand::Pause => {
                if *playing {
                    *playing = false;
                    self.playing_flag.store(false, Ordering::Relaxed);
                    self.events.emit(AudioEvent::PlaybackPaused);
                }
            }
            PlaybackCommand::Seek(sample_pos) => {
                *pos = (sample_pos as usize).min(total);
                if *pos < total {
                    *eof_reported = false;
                }
                self.events.emit(AudioEvent::PlaybackProgress {
                    position: *pos as u64,
                });
            }
        }
    }
}

fn load_wav(path: &Path) -> Result<(Vec<i16>, u32), AudioError> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| AudioError::Playback(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader.samples::<i16>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * 32_767.0) as i16))
            .collect::<Result<_, _>>()?,
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };

    Ok((mono, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn loads_mono_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav(&path, 1, &[1, 2, 3, 4]);

        let (samples, rate) = load_wav(&path).unwrap();
        assert_eq!(samples, vec![1, 2, 3, 4]);
        assert_eq!(rate, 8_000);
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 2, &[100, 200, -100, 100]);

        let (samples, _) = load_wav(&path).unwrap();
        assert_eq!(samples, vec![150, 0]);
    }

    #[test]
    fn missing_file_is_a_playback_error() {
        let err = load_wav(Path::new("/nonexistent/file.wav")).unwrap_err();
        assert!(matches!(err, AudioError::Playback(_)));
    }
}
