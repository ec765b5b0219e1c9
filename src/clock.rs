//! External clock contract.
//!
//! The scheduler is driven by an audio-server-style clock: once per
//! fixed-size buffer it is told the buffer length and the absolute
//! frame, and it writes events into per-port buffers at frame offsets.
//! This module defines that boundary (the transport surface, the
//! per-port event buffer, frame/time conversions) plus the internal
//! clock used when no external server drives playback.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Externally visible transport motion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    /// Relocated and waiting for every client to confirm the new
    /// position before rolling.
    Starting,
    Rolling,
}

/// Transport surface of the external clock.
pub trait Transport {
    /// Current state and transport frame position.
    fn query(&self) -> (TransportState, u64);
    /// Relocate the transport to an absolute frame.
    fn locate(&self, frame: u64);
    fn start(&self);
    fn stop(&self);
    /// The wall clock in frames, running regardless of transport state.
    fn frame_time(&self) -> u64;
}

pub fn frames_to_seconds(frames: u64, sample_rate: u32) -> f64 {
    frames as f64 / sample_rate as f64
}

pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> i64 {
    (seconds * sample_rate as f64) as i64
}

pub fn frames_to_ms(frames: u32, sample_rate: u32) -> f64 {
    frames as f64 * 1000.0 / sample_rate as f64
}

/// One output port's writable buffer for the current cycle.
pub trait EventSink {
    fn clear(&mut self);
    /// Reserve `len` writable bytes at frame offset `offset` within the
    /// current buffer. `None` when the buffer is out of space.
    fn reserve(&mut self, offset: u32, len: usize) -> Option<&mut [u8]>;
}

/// Vec-backed [`EventSink`] with a byte capacity, used by the driver
/// and by tests.
#[derive(Debug)]
pub struct BufferSink {
    events: Vec<(u32, Vec<u8>)>,
    capacity: usize,
    used: usize,
}

impl BufferSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
            used: 0,
        }
    }

    /// Events written this cycle as `(frame_offset, bytes)`.
    pub fn events(&self) -> &[(u32, Vec<u8>)] {
        &self.events
    }

    /// Drain this cycle's events in frame order.
    pub fn take(&mut self) -> Vec<(u32, Vec<u8>)> {
        self.used = 0;
        let mut events = std::mem::take(&mut self.events);
        events.sort_by_key(|&(offset, _)| offset);
        events
    }
}

impl EventSink for BufferSink {
    fn clear(&mut self) {
        self.events.clear();
        self.used = 0;
    }

    fn reserve(&mut self, offset: u32, len: usize) -> Option<&mut [u8]> {
        if self.used + len > self.capacity {
            return None;
        }
        self.used += len;
        self.events.push((offset, vec![0; len]));
        Some(&mut self.events.last_mut().unwrap().1)
    }
}

const STATE_STOPPED: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_ROLLING: u8 = 2;

/// Internal clock: a frame counter the driver advances every cycle,
/// with the stopped/starting/rolling handshake of an external server.
///
/// Relocation moves the transport into `Starting` until the position
/// request settles, exactly like an external transport master would.
pub struct InternalClock {
    frame: AtomicU64,
    transport_frame: AtomicU64,
    state: AtomicU8,
}

impl InternalClock {
    pub fn new() -> Self {
        Self {
            frame: AtomicU64::new(0),
            transport_frame: AtomicU64::new(0),
            state: AtomicU8::new(STATE_STOPPED),
        }
    }

    /// Advance the wall clock by one buffer; the transport position
    /// advances only while rolling.
    pub fn advance(&self, nframes: u32) {
        self.frame.fetch_add(u64::from(nframes), Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) == STATE_ROLLING {
            self.transport_frame
                .fetch_add(u64::from(nframes), Ordering::SeqCst);
        }
    }

    /// Run the position handshake: while `Starting`, ask the client
    /// whether the requested position is ready; roll once it is.
    pub fn settle<F: FnOnce(u64) -> bool>(&self, position_ready: F) {
        if self.state.load(Ordering::SeqCst) != STATE_STARTING {
            return;
        }
        if position_ready(self.transport_frame.load(Ordering::SeqCst)) {
            self.state.store(STATE_ROLLING, Ordering::SeqCst);
        }
    }

    fn state(&self) -> TransportState {
        match self.state.load(Ordering::SeqCst) {
            STATE_ROLLING => TransportState::Rolling,
            STATE_STARTING => TransportState::Starting,
            _ => TransportState::Stopped,
        }
    }
}

impl Default for InternalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for InternalClock {
    fn query(&self) -> (TransportState, u64) {
        (self.state(), self.transport_frame.load(Ordering::SeqCst))
    }

    fn locate(&self, frame: u64) {
        self.transport_frame.store(frame, Ordering::SeqCst);
        // A moving transport has to re-confirm the new position.
        if self.state.load(Ordering::SeqCst) != STATE_STOPPED {
            self.state.store(STATE_STARTING, Ordering::SeqCst);
        }
    }

    fn start(&self) {
        if self.state.load(Ordering::SeqCst) == STATE_STOPPED {
            self.state.store(STATE_STARTING, Ordering::SeqCst);
        }
    }

    fn stop(&self) {
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
    }

    fn frame_time(&self) -> u64 {
        self.frame.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sink_capacity() {
        let mut sink = BufferSink::new(5);
        assert!(sink.reserve(0, 3).is_some());
        assert!(sink.reserve(10, 3).is_none());
        assert!(sink.reserve(10, 2).is_some());
        assert_eq!(sink.events().len(), 2);
        sink.clear();
        assert!(sink.reserve(0, 5).is_some());
    }

    #[test]
    fn test_buffer_sink_take_sorts_by_offset() {
        let mut sink = BufferSink::new(64);
        sink.reserve(9, 1).unwrap()[0] = 2;
        sink.reserve(3, 1).unwrap()[0] = 1;
        let events = sink.take();
        assert_eq!(events[0], (3, vec![1]));
        assert_eq!(events[1], (9, vec![2]));
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_internal_clock_handshake() {
        let clock = InternalClock::new();
        assert_eq!(clock.query().0, TransportState::Stopped);

        clock.start();
        assert_eq!(clock.query().0, TransportState::Starting);

        // Position not ready: stays in starting, does not advance.
        clock.settle(|_| false);
        clock.advance(256);
        assert_eq!(clock.query(), (TransportState::Starting, 0));

        clock.settle(|_| true);
        clock.advance(256);
        assert_eq!(clock.query(), (TransportState::Rolling, 256));
        assert_eq!(clock.frame_time(), 512);
    }

    #[test]
    fn test_internal_clock_relocate_while_rolling() {
        let clock = InternalClock::new();
        clock.start();
        clock.settle(|_| true);
        clock.advance(100);

        clock.locate(4800);
        assert_eq!(clock.query(), (TransportState::Starting, 4800));
        let mut asked_at = None;
        clock.settle(|frame| {
            asked_at = Some(frame);
            true
        });
        assert_eq!(asked_at, Some(4800));
        assert_eq!(clock.query().0, TransportState::Rolling);
    }

    #[test]
    fn test_internal_clock_locate_while_stopped_stays_stopped() {
        let clock = InternalClock::new();
        clock.locate(960);
        assert_eq!(clock.query(), (TransportState::Stopped, 960));
    }

    #[test]
    fn test_frame_conversions() {
        assert_eq!(seconds_to_frames(0.5, 48_000), 24_000);
        assert!((frames_to_seconds(24_000, 48_000) - 0.5).abs() < 1e-9);
        assert!((frames_to_ms(256, 48_000) - 5.333).abs() < 0.001);
    }
}
