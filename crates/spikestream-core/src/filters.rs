//! User-selectable band-limit filters plus the biquad primitives shared
//! with the AM demodulation stage.

/// A band-limit description: everything below `low_cutoff_hz` and above
/// `high_cutoff_hz` is attenuated. A cutoff of `0.0` / `f64::MAX` disables
/// the corresponding edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Filter {
    pub low_cutoff_hz: f64,
    pub high_cutoff_hz: f64,
}

impl Filter {
    pub const fn new(low_cutoff_hz: f64, high_cutoff_hz: f64) -> Self {
        Self {
            low_cutoff_hz,
            high_cutoff_hz,
        }
    }

    // Presets matching the signal bands of the supported experiments.
    pub const HEART: Filter = Filter::new(1.0, 50.0);
    pub const BRAIN: Filter = Filter::new(1.0, 100.0);
    pub const PLANT: Filter = Filter::new(0.0, 5.0);
    pub const MUSCLE: Filter = Filter::new(70.0, 2_500.0);
    pub const NEURON: Filter = Filter::new(160.0, 3_700.0);

    fn has_high_pass(&self) -> bool {
        self.low_cutoff_hz > 0.0
    }

    fn has_low_pass(&self, sample_rate: f64) -> bool {
        self.high_cutoff_hz > 0.0 && self.high_cutoff_hz < sample_rate / 2.0
    }
}

/// Direct Form 1 biquad with RBJ cookbook coefficients.
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    fn from_normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn low_pass(sample_rate: f64, cutoff_hz: f64, q: f64) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * cutoff_hz / sample_rate;
        let alpha = w0.sin() / (2.0 * q);
        let cos_w0 = w0.cos();
        Self::from_normalized(
            (1.0 - cos_w0) / 2.0,
            1.0 - cos_w0,
            (1.0 - cos_w0) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w0,
            1.0 - alpha,
        )
    }

    pub fn high_pass(sample_rate: f64, cutoff_hz: f64, q: f64) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * cutoff_hz / sample_rate;
        let alpha = w0.sin() / (2.0 * q);
        let cos_w0 = w0.cos();
        Self::from_normalized(
            (1.0 + cos_w0) / 2.0,
            -(1.0 + cos_w0),
            (1.0 + cos_w0) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w0,
            1.0 - alpha,
        )
    }

    pub fn band_pass(sample_rate: f64, center_hz: f64, q: f64) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * center_hz / sample_rate;
        let alpha = w0.sin() / (2.0 * q);
        let cos_w0 = w0.cos();
        Self::from_normalized(alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    pub fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

/// Single-pole DC blocker placed after envelope detection.
#[derive(Debug, Clone)]
pub struct DcBlocker {
    r: f64,
    x1: f64,
    y1: f64,
}

impl DcBlocker {
    pub fn new(r: f64) -> Self {
        Self {
            r: r.clamp(0.9, 0.9999),
            x1: 0.0,
            y1: 0.0,
        }
    }

    pub fn process(&mut self, x: f64) -> f64 {
        let y = x - self.x1 + self.r * self.y1;
        self.x1 = x;
        self.y1 = y;
        y
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.y1 = 0.0;
    }
}

const BUTTERWORTH_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// The active user filter plus the stages realizing it. Coefficients are
/// rebuilt whenever the sample rate or the filter selection changes, so
/// they are always consistent with the reported rate before any sample is
/// filtered.
pub struct FilterChain {
    sample_rate: f64,
    filter: Option<Filter>,
    high_pass: Option<Biquad>,
    low_pass: Option<Biquad>,
}

impl FilterChain {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1) as f64,
            filter: None,
            high_pass: None,
            low_pass: None,
        }
    }

    pub fn filter(&self) -> Option<Filter> {
        self.filter
    }

    pub fn set_filter(&mut self, filter: Option<Filter>) {
        self.filter = filter;
        self.rebuild();
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1) as f64;
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.high_pass = None;
        self.low_pass = None;
        if let Some(filter) = self.filter {
            if filter.has_high_pass() {
                self.high_pass = Some(Biquad::high_pass(
                    self.sample_rate,
                    filter.low_cutoff_hz,
                    BUTTERWORTH_Q,
                ));
            }
            if filter.has_low_pass(self.sample_rate) {
                self.low_pass = Some(Biquad::low_pass(
                    self.sample_rate,
                    filter.high_cutoff_hz,
                    BUTTERWORTH_Q,
                ));
            }
        }
    }

    /// Filters samples in place. A chain with no active filter is a no-op.
    pub fn apply(&mut self, samples: &mut [i16]) {
        if self.high_pass.is_none() && self.low_pass.is_none() {
            return;
        }
        for s in samples.iter_mut() {
            let mut v = *s as f64;
            if let Some(hp) = self.high_pass.as_mut() {
                v = hp.process(v);
            }
            if let Some(lp) = self.low_pass.as_mut() {
                v = lp.process(v);
            }
            *s = v.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        }
    }
}
