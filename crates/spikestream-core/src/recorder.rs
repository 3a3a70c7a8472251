//! On-disk recording sink. One writer per session, mono 16-bit WAV at the
//! pipeline's current sample rate.

use std::path::{Path, PathBuf};

use spikestream_foundation::AudioError;

pub struct RecordingWriter {
    writer: hound::WavWriter<std::io::BufWriter<std::fs::File>>,
    path: PathBuf,
    samples_written: u64,
}

impl RecordingWriter {
    /// Creates the recording directory if needed and opens a timestamped
    /// WAV file in it.
    pub fn open(dir: &Path, sample_rate: u32) -> Result<Self, AudioError> {
        std::fs::create_dir_all(dir)?;
        let filename = chrono::Local::now()
            .format("rec-%Y%m%d-%H%M%S.wav")
            .to_string();
        let path = dir.join(filename);

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)?;
        tracing::info!(path = %path.display(), sample_rate, "recording started");

        Ok(Self {
            writer,
            path,
            samples_written: 0,
        })
    }

    pub fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        for &sample in samples {
            self.writer.write_sample(sample)?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes the header and closes the file; returns the sample count.
    pub fn finalize(self) -> Result<u64, AudioError> {
        let samples = self.samples_written;
        let path = self.path;
        self.writer.finalize()?;
        tracing::info!(path = %path.display(), samples, "recording finalized");
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_readable_wav() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RecordingWriter::open(dir.path(), 44_100).unwrap();
        writer.write(&[1, -1, 2, -2]).unwrap();
        writer.write(&[3, -3]).unwrap();
        assert_eq!(writer.samples_written(), 6);

        let path = writer.path().to_path_buf();
        let samples = writer.finalize().unwrap();
        assert_eq!(samples, 6);

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 44_100);
        assert_eq!(spec.bits_per_sample, 16);
        let read: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(read, vec![1, -1, 2, -2, 3, -3]);
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let writer = RecordingWriter::open(&nested, 10_000).unwrap();
        assert!(writer.path().starts_with(&nested));
        writer.finalize().unwrap();
    }
}
