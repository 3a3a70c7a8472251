use crate::BYTES_PER_SAMPLE;

/// Fixed-capacity circular store of the most recent samples.
///
/// One logical writer at a time (the currently active producer, serialized
/// by the acquisition service); readers only ever work on [`snapshot`]
/// copies, never the live write cursor.
///
/// [`snapshot`]: SampleRingBuffer::snapshot
pub struct SampleRingBuffer {
    buf: Vec<i16>,
    head: usize,
    len: usize,
    byte_position: u64,
}

impl SampleRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: vec![0; capacity],
            head: 0,
            len: 0,
            byte_position: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends samples, overwriting the oldest data once full. The byte
    /// position advances by two bytes per sample.
    pub fn push(&mut self, samples: &[i16]) {
        let position = self.byte_position + samples.len() as u64 * BYTES_PER_SAMPLE;
        self.push_with_position(samples, position);
    }

    /// Appends samples with an externally supplied byte position (playback
    /// reports its file read cursor here so progress survives buffer wrap).
    pub fn push_with_position(&mut self, samples: &[i16], last_byte_position: u64) {
        let capacity = self.buf.len();
        // Only the trailing window of an oversized write can survive.
        let tail = if samples.len() > capacity {
            &samples[samples.len() - capacity..]
        } else {
            samples
        };

        for &s in tail {
            self.buf[self.head] = s;
            self.head = (self.head + 1) % capacity;
        }
        self.len = (self.len + tail.len()).min(capacity);
        self.byte_position = last_byte_position;
    }

    /// Copies current content oldest-to-newest. Readers hold this copy;
    /// a concurrent `clear` or overwrite never invalidates it.
    pub fn snapshot(&self) -> Vec<i16> {
        let capacity = self.buf.len();
        let start = (self.head + capacity - self.len) % capacity;
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            out.push(self.buf[(start + i) % capacity]);
        }
        out
    }

    /// Logically empties the buffer without reallocating.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.byte_position = 0;
    }

    /// Reallocates to the given capacity, discarding current content.
    pub fn set_capacity(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        self.buf = vec![0; capacity];
        self.clear();
    }

    /// Total bytes ever written; monotone except across `clear`.
    pub fn last_byte_position(&self) -> u64 {
        self.byte_position
    }
}
