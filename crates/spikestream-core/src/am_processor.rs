//! Detects and demodulates the amplitude-modulated carrier some boards use
//! over the microphone line-in transport.

use spikestream_foundation::{AudioEvent, EventHub};

use crate::filters::{Biquad, DcBlocker};

const CARRIER_HZ: f64 = 5_000.0;
const CARRIER_Q: f64 = 5.0;
const ENVELOPE_CUTOFF_HZ: f64 = 500.0;
// Mean absolute level of the carrier band that counts as "carrier present".
const DETECTION_THRESHOLD: f64 = 1_500.0;
// Consecutive chunks the level must hold before a transition fires.
const DETECTION_STREAK: u32 = 3;
// Rectified carrier averages 2A/pi; bring the envelope back to full scale.
const DEMODULATION_GAIN: f64 = std::f64::consts::PI / 2.0;

pub struct AmModulationProcessor {
    events: EventHub,
    sample_rate: u32,
    carrier_band: Biquad,
    envelope: Biquad,
    dc_blocker: DcBlocker,
    detected: bool,
    above_streak: u32,
    below_streak: u32,
}

impl AmModulationProcessor {
    pub fn new(events: EventHub, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        Self {
            events,
            sample_rate,
            carrier_band: Biquad::band_pass(sample_rate as f64, CARRIER_HZ, CARRIER_Q),
            envelope: Biquad::low_pass(
                sample_rate as f64,
                ENVELOPE_CUTOFF_HZ,
                std::f64::consts::FRAC_1_SQRT_2,
            ),
            dc_blocker: DcBlocker::new(0.995),
            detected: false,
            above_streak: 0,
            below_streak: 0,
        }
    }

    /// Whether the carrier is currently present.
    pub fn is_am_modulation_detected(&self) -> bool {
        self.detected
    }

    /// Rebuilds all internal filters for the new rate and drops detection
    /// state; fires the end notification if a carrier was active.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        let sample_rate = sample_rate.max(1);
        if sample_rate == self.sample_rate {
            return;
        }
        self.sample_rate = sample_rate;
        self.carrier_band = Biquad::band_pass(sample_rate as f64, CARRIER_HZ, CARRIER_Q);
        self.envelope = Biquad::low_pass(
            sample_rate as f64,
            ENVELOPE_CUTOFF_HZ,
            std::f64::consts::FRAC_1_SQRT_2,
        );
        self.dc_blocker.reset();
        self.above_streak = 0;
        self.below_streak = 0;
        if self.detected {
            self.detected = false;
            self.events.emit(AudioEvent::AmModulationEnded);
        }
    }

    /// Passes raw microphone samples through carrier detection; returns the
    /// demodulated baseband while a carrier is present, the input unchanged
    /// otherwise. Detection notifications are edge-triggered.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        if samples.is_empty() || !self.carrier_representable() {
            return samples.to_vec();
        }

        let band: Vec<f64> = samples
            .iter()
            .map(|&s| self.carrier_band.process(s as f64))
            .collect();
        let mean_level = band.iter().map(|v| v.abs()).sum::<f64>() / band.len() as f64;
        self.update_detection(mean_level);

        if !self.detected {
            return samples.to_vec();
        }

        band.iter()
            .map(|v| {
                let envelope = self.envelope.process(v.abs());
                let baseband = self.dc_blocker.process(envelope) * DEMODULATION_GAIN;
                baseband.clamp(i16::MIN as f64, i16::MAX as f64) as i16
            })
            .collect()
    }

    // A 5 kHz carrier needs comfortable headroom below Nyquist; at serial
    // rates detection is off and the stream passes through untouched.
    fn carrier_representable(&self) -> bool {
        (self.sample_rate as f64) > CARRIER_HZ * 2.5
    }

    fn update_detection(&mut self, mean_level: f64) {
        if mean_level >= DETECTION_THRESHOLD {
            self.above_streak += 1;
            self.below_streak = 0;
            if !self.detected && self.above_streak >= DETECTION_STREAK {
                self.detected = true;
                tracing::info!(mean_level, "AM carrier detected");
                self.events.emit(AudioEvent::AmModulationStarted);
            }
        } else {
            self.below_streak += 1;
            self.above_streak = 0;
            if self.detected && self.below_streak >= DETECTION_STREAK {
                self.detected = false;
                tracing::info!("AM carrier lost");
                self.events.emit(AudioEvent::AmModulationEnded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikestream_foundation::EventHub;

    const RATE: u32 = 44_100;
    const CHUNK: usize = 2_048;

    fn carrier_chunk(amplitude: f64, offset: usize) -> Vec<i16> {
        (0..CHUNK)
            .map(|i| {
                let t = (offset + i) as f64 / RATE as f64;
                (amplitude * (2.0 * std::f64::consts::PI * CARRIER_HZ * t).sin()) as i16
            })
            .collect()
    }

    fn silence_chunk() -> Vec<i16> {
        vec![0; CHUNK]
    }

    #[test]
    fn detection_start_is_edge_triggered() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let mut am = AmModulationProcessor::new(hub, RATE);

        for n in 0..6 {
            am.process(&carrier_chunk(10_000.0, n * CHUNK));
        }
        assert!(am.is_am_modulation_detected());
        assert_eq!(rx.try_recv().unwrap(), AudioEvent::AmModulationStarted);
        // Six chunks above threshold, still only one start notification.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn detection_ends_when_carrier_disappears() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let mut am = AmModulationProcessor::new(hub, RATE);

        for n in 0..4 {
            am.process(&carrier_chunk(10_000.0, n * CHUNK));
        }
        for _ in 0..4 {
            am.process(&silence_chunk());
        }
        assert!(!am.is_am_modulation_detected());
        assert_eq!(rx.try_recv().unwrap(), AudioEvent::AmModulationStarted);
        assert_eq!(rx.try_recv().unwrap(), AudioEvent::AmModulationEnded);
    }

    #[test]
    fn plain_audio_passes_through_unchanged() {
        let hub = EventHub::default();
        let mut am = AmModulationProcessor::new(hub, RATE);

        // 200 Hz is far outside the carrier band; detection never trips.
        let chunk: Vec<i16> = (0..CHUNK)
            .map(|i| {
                let t = i as f64 / RATE as f64;
                ((2.0 * std::f64::consts::PI * 200.0 * t).sin() * 10_000.0) as i16
            })
            .collect();
        let out = am.process(&chunk);
        assert_eq!(out, chunk);
        assert!(!am.is_am_modulation_detected());
    }

    #[test]
    fn low_sample_rates_disable_detection() {
        let hub = EventHub::default();
        let mut am = AmModulationProcessor::new(hub, 10_000);
        let chunk = carrier_chunk(10_000.0, 0);
        assert_eq!(am.process(&chunk), chunk);
        assert!(!am.is_am_modulation_detected());
    }

    #[test]
    fn rate_change_while_detected_fires_end() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let mut am = AmModulationProcessor::new(hub, RATE);

        for n in 0..4 {
            am.process(&carrier_chunk(10_000.0, n * CHUNK));
        }
        assert!(am.is_am_modulation_detected());
        am.set_sample_rate(22_050);
        assert!(!am.is_am_modulation_detected());
        assert_eq!(rx.try_recv().unwrap(), AudioEvent::AmModulationStarted);
        assert_eq!(rx.try_recv().unwrap(), AudioEvent::AmModulationEnded);
    }
}
