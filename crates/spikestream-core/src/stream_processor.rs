//! Decodes the SpikerBox serial byte protocol into normalized samples.
//!
//! Wire format: every sample is two bytes, a header byte with bit 7 set
//! followed by a trailer byte with bit 7 clear; the 14 payload bits are
//! recentred and scaled to i16. Hardware messages (board type and friends)
//! arrive bracketed by fixed escape sequences and never reach the sample
//! stream.

use spikestream_foundation::{AudioEvent, BoardType, EventHub};

const SAMPLE_HEADER_BIT: u8 = 0x80;
const ESCAPE_START: [u8; 6] = [0xFF, 0xFF, 0x01, 0x01, 0x80, 0xFF];
const ESCAPE_END: [u8; 6] = [0xFF, 0xFF, 0x01, 0x01, 0x81, 0xFF];
// Messages longer than this cannot be real; treat the opener as line noise.
const MAX_MESSAGE_LEN: usize = 64;

pub struct SampleStreamProcessor {
    events: EventHub,
    pending: Vec<u8>,
    board_type: Option<BoardType>,
    desynced_bytes: u64,
}

impl SampleStreamProcessor {
    pub fn new(events: EventHub) -> Self {
        Self {
            events,
            pending: Vec::new(),
            board_type: None,
            desynced_bytes: 0,
        }
    }

    /// Decodes a chunk into samples. Incomplete frames are buffered for the
    /// next call; unsynced bytes are dropped until framing locks again.
    /// Never panics on malformed input.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<i16> {
        self.pending.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(self.pending.len() / 2);
        let mut dropped = 0u64;
        let mut i = 0;

        while i < self.pending.len() {
            let rest = &self.pending[i..];

            if rest[0] == ESCAPE_START[0] && could_be_escape(rest) {
                match self.try_consume_message(i) {
                    MessageScan::Consumed(next) => {
                        i = next;
                        continue;
                    }
                    MessageScan::NeedMoreData => break,
                    MessageScan::NotAMessage => {}
                }
            }

            let hi = self.pending[i];
            if hi & SAMPLE_HEADER_BIT == 0 {
                // Trailer byte with no header: still re-syncing.
                dropped += 1;
                i += 1;
                continue;
            }
            let Some(&lo) = self.pending.get(i + 1) else {
                // Partial frame, wait for the next chunk.
                break;
            };
            if lo & SAMPLE_HEADER_BIT != 0 {
                // Two headers back to back: the first one is garbage.
                dropped += 1;
                i += 1;
                continue;
            }

            out.push(decode_sample(hi, lo));
            i += 2;
        }

        self.pending.drain(..i);
        if dropped > 0 {
            self.desynced_bytes += dropped;
            tracing::warn!(
                dropped,
                total = self.desynced_bytes,
                "skipped unsynced serial bytes"
            );
        }

        out
    }

    /// Forgets buffered bytes and the detected board type; called on a new
    /// connection so detection fires again for the next device.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.board_type = None;
        self.desynced_bytes = 0;
    }

    pub fn board_type(&self) -> Option<BoardType> {
        self.board_type
    }

    // Attempts to consume an escaped message starting at `start`.
    fn try_consume_message(&mut self, start: usize) -> MessageScan {
        let rest = &self.pending[start..];
        if rest.len() < ESCAPE_START.len() {
            return MessageScan::NeedMoreData;
        }
        if rest[..ESCAPE_START.len()] != ESCAPE_START {
            return MessageScan::NotAMessage;
        }

        let body = &rest[ESCAPE_START.len()..];
        if let Some(end) = find_sequence(body, &ESCAPE_END) {
            let message = body[..end].to_vec();
            self.handle_message(&message);
            MessageScan::Consumed(start + ESCAPE_START.len() + end + ESCAPE_END.len())
        } else if body.len() > MAX_MESSAGE_LEN {
            // No terminator within a plausible window; the opener was noise.
            MessageScan::NotAMessage
        } else {
            MessageScan::NeedMoreData
        }
    }

    fn handle_message(&mut self, message: &[u8]) {
        let Ok(text) = std::str::from_utf8(message) else {
            tracing::warn!("non-ASCII hardware message, ignoring");
            return;
        };

        if let Some(name) = text.strip_prefix("HWT:").and_then(|m| m.strip_suffix(';')) {
            let board = match name {
                "PLANTSS" => BoardType::Plant,
                "MUSCLESS" => BoardType::Muscle,
                "HEARTSS" => BoardType::Heart,
                "NEURONSS" => BoardType::Neuron,
                _ => BoardType::Unknown,
            };
            if self.board_type != Some(board) {
                self.board_type = Some(board);
                self.events.emit(AudioEvent::BoardTypeDetected(board));
            }
        } else {
            tracing::debug!(message = text, "unhandled hardware message");
        }
    }
}

enum MessageScan {
    Consumed(usize),
    NeedMoreData,
    NotAMessage,
}

// A prefix match is enough to hold bytes back at a chunk boundary.
fn could_be_escape(rest: &[u8]) -> bool {
    let n = rest.len().min(ESCAPE_START.len());
    rest[..n] == ESCAPE_START[..n]
}

fn find_sequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn decode_sample(hi: u8, lo: u8) -> i16 {
    let value = ((hi as i32 & 0x7F) << 7) | (lo as i32 & 0x7F);
    let centered = value - 0x2000;
    (centered << 2).clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikestream_foundation::EventHub;

    fn encode(value: u16) -> [u8; 2] {
        [
            SAMPLE_HEADER_BIT | ((value >> 7) as u8 & 0x7F),
            (value & 0x7F) as u8,
        ]
    }

    fn processor() -> SampleStreamProcessor {
        SampleStreamProcessor::new(EventHub::default())
    }

    #[test]
    fn decodes_well_formed_frames() {
        let mut p = processor();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode(0x2000)); // midpoint -> 0
        bytes.extend_from_slice(&encode(0x2000 + 100));
        let out = p.process(&bytes);
        assert_eq!(out, vec![0, 400]);
    }

    #[test]
    fn frame_split_across_chunks_is_buffered() {
        let mut p = processor();
        let frame = encode(0x2000 + 5);
        assert!(p.process(&frame[..1]).is_empty());
        assert_eq!(p.process(&frame[1..]), vec![20]);
    }

    #[test]
    fn garbage_mid_stream_resyncs_without_panicking() {
        let mut p = processor();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode(0x2000));
        bytes.extend_from_slice(&[0x12, 0x34, 0x56]); // three trailer-looking bytes
        bytes.extend_from_slice(&encode(0x2000 + 1));
        let out = p.process(&bytes);
        assert_eq!(out, vec![0, 4]);
    }

    #[test]
    fn board_type_message_is_detected_once() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let mut p = SampleStreamProcessor::new(hub);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ESCAPE_START);
        bytes.extend_from_slice(b"HWT:MUSCLESS;");
        bytes.extend_from_slice(&ESCAPE_END);
        bytes.extend_from_slice(&encode(0x2000));

        let out = p.process(&bytes);
        assert_eq!(out, vec![0]);
        assert_eq!(p.board_type(), Some(BoardType::Muscle));
        assert_eq!(
            rx.try_recv().unwrap(),
            AudioEvent::BoardTypeDetected(BoardType::Muscle)
        );

        // Same message again: idempotent, no second notification.
        let mut again = Vec::new();
        again.extend_from_slice(&ESCAPE_START);
        again.extend_from_slice(b"HWT:MUSCLESS;");
        again.extend_from_slice(&ESCAPE_END);
        p.process(&again);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn message_split_across_chunks() {
        let hub = EventHub::default();
        let mut p = SampleStreamProcessor::new(hub);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ESCAPE_START);
        bytes.extend_from_slice(b"HWT:PLA");
        assert!(p.process(&bytes).is_empty());
        assert_eq!(p.board_type(), None);

        let mut tail = Vec::new();
        tail.extend_from_slice(b"NTSS;");
        tail.extend_from_slice(&ESCAPE_END);
        p.process(&tail);
        assert_eq!(p.board_type(), Some(BoardType::Plant));
    }

    #[test]
    fn unterminated_escape_is_treated_as_noise() {
        let mut p = processor();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ESCAPE_START);
        bytes.extend(std::iter::repeat(0x41).take(MAX_MESSAGE_LEN + 8));
        bytes.extend_from_slice(&encode(0x2000 + 2));
        let out = p.process(&bytes);
        // The well-formed frame at the tail still decodes.
        assert_eq!(*out.last().unwrap(), 8);
    }

    #[test]
    fn reset_forgets_board_type() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let mut p = SampleStreamProcessor::new(hub);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ESCAPE_START);
        bytes.extend_from_slice(b"HWT:HEARTSS;");
        bytes.extend_from_slice(&ESCAPE_END);
        p.process(&bytes);
        let _ = rx.try_recv();

        p.reset();
        p.process(&bytes);
        // Detection fires again for the new connection.
        assert_eq!(
            rx.try_recv().unwrap(),
            AudioEvent::BoardTypeDetected(BoardType::Heart)
        );
    }
}
