//! Real-time event scheduler.
//!
//! Runs once per fixed-size clock buffer: reconciles transport state,
//! drains the events due within the buffer from the active song's
//! cursor into the per-port sinks, and handles metadata events as
//! side-effecting triggers. Everything here is called from the clock's
//! real-time context: no blocking, no I/O. Problems turn into skips,
//! drops, or deferred [`Notice`]s.

use tracing::debug;

use crate::clock::{frames_to_ms, seconds_to_frames, EventSink, Transport, TransportState};
use crate::marker::Marker;
use crate::playback::{Notice, Player, ANCHOR_UNSET};

const MIDI_CONTROLLER: u8 = 0xB0;
const MIDI_ALL_SOUND_OFF: u8 = 120;

/// What the run loop should do after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    /// The shutdown drain has completed; stop the clock and exit.
    Terminate,
}

/// Per-cycle scheduling state that persists across buffers.
pub struct Scheduler {
    sample_rate: u32,
    /// Byte-per-millisecond output budget; 0 or less disables limiting.
    rate_limit: f64,
    /// Emit on the global port only.
    single_output: bool,
    prev_transport: TransportState,
    prev_anchor: i64,
    prev_paused: bool,
}

impl Scheduler {
    pub fn new(sample_rate: u32, rate_limit: f64, single_output: bool) -> Self {
        Self {
            sample_rate,
            rate_limit,
            single_output,
            prev_transport: TransportState::Stopped,
            prev_anchor: ANCHOR_UNSET,
            prev_paused: false,
        }
    }

    /// One clock buffer: `nframes` frames starting at absolute frame
    /// `last_frame_time`.
    pub fn run_cycle<S: EventSink>(
        &mut self,
        player: &Player,
        transport: &dyn Transport,
        nframes: u32,
        last_frame_time: u64,
        sinks: &mut [S],
    ) -> CycleOutcome {
        if nframes == 0 {
            player.notify(Notice::Warn("process cycle with zero frames; clock bug?"));
            return CycleOutcome::Continue;
        }
        if sinks.is_empty() {
            return CycleOutcome::Continue;
        }

        // Never block the clock: a contended lock skips this buffer.
        let Some(mut guard) = player.try_active() else {
            return CycleOutcome::Continue;
        };

        for sink in sinks.iter_mut() {
            sink.clear();
        }

        if player.abort_requested() {
            // Drain across two buffers so the sound-off actually leaves
            // the port before the process goes away.
            self.all_sound_off(player, sinks);
            if player.bump_abort() >= 3 {
                return CycleOutcome::Terminate;
            }
            return CycleOutcome::Continue;
        }

        let Some(active) = guard.as_mut() else {
            return CycleOutcome::Continue;
        };

        if player.is_paused() {
            if !self.prev_paused {
                self.all_sound_off(player, sinks);
            }
            self.prev_paused = true;
            return CycleOutcome::Continue;
        }
        self.prev_paused = false;

        if player.follows_transport() {
            let (state, frame) = transport.query();
            match state {
                TransportState::Stopped => {
                    if self.prev_transport == TransportState::Rolling {
                        self.all_sound_off(player, sinks);
                    }
                    player.clear_anchor();
                }
                TransportState::Starting => player.clear_anchor(),
                TransportState::Rolling => {
                    if self.prev_transport != TransportState::Rolling {
                        player.set_song_position(frame);
                        player.set_anchor(last_frame_time as i64);
                    }
                }
            }
            self.prev_transport = state;
        } else {
            let anchor = player.anchor();
            if anchor < 0 && self.prev_anchor >= 0 {
                self.all_sound_off(player, sinks);
                player.notify(Notice::SongEnd);
            }
            self.prev_anchor = anchor;
        }

        let anchor = player.anchor();
        if anchor < 0 {
            // Song not started.
            return CycleOutcome::Continue;
        }

        let mut bytes_remaining = frames_to_ms(nframes, self.sample_rate) * self.rate_limit;
        let loop_offset = active.resolve_loop(player.is_looping());
        let song_position = player.song_position();

        loop {
            let Some(event) = active.cursor.peek(&active.song) else {
                self.end_of_song(player);
                break;
            };

            if event.is_metadata() {
                if self.handle_metadata(player, &event.payload) {
                    self.end_of_song(player);
                    break;
                }
                active.cursor.consume(&active.song);
                continue;
            }

            bytes_remaining -= event.payload.len() as f64;
            if self.rate_limit > 0.0 && bytes_remaining <= 0.0 {
                player.notify(Notice::Warn("rate limiting in effect"));
                break;
            }

            let t = seconds_to_frames(event.time_seconds + loop_offset, self.sample_rate)
                + anchor
                - song_position as i64
                - last_frame_time as i64;

            // Not due within this buffer yet.
            if t >= i64::from(nframes) {
                break;
            }
            // Missed the previous cycle (xrun); emit as early as possible.
            let t = t.max(0) as u32;

            let event = active.cursor.consume(&active.song).unwrap();

            if !write_bytes(&mut sinks[0], t, &event.payload) {
                player.notify(Notice::Warn("event reserve failed, note lost"));
                break;
            }

            if self.single_output {
                continue;
            }
            let track = event.track_number;
            if track == 0 || track >= sinks.len() {
                continue;
            }

            // Per-track copy goes out with the channel nibble zeroed;
            // the global copy above keeps the original channel.
            let mut bytes = event.payload.clone();
            if (0x80..=0xEF).contains(&bytes[0]) {
                bytes[0] &= 0xF0;
            }
            if !write_bytes(&mut sinks[track], t, &bytes) {
                player.notify(Notice::Warn("event reserve failed, note lost"));
                break;
            }
        }

        CycleOutcome::Continue
    }

    fn end_of_song(&self, player: &Player) {
        debug!("end of song");
        player.clear_anchor();
        if !player.follows_transport() {
            player.request_abort();
        }
    }

    /// Decode a metadata event and dispatch its side effect. Returns
    /// `true` when playback must stop here (end marker, looping off).
    fn handle_metadata(&self, player: &Player, payload: &[u8]) -> bool {
        let Some(marker) = Marker::decode(payload) else {
            return false;
        };
        debug!(?marker, "metadata");
        match marker {
            Marker::Bar(n) => player.notify(Notice::BarNumber(n)),
            Marker::Line(n) => player.notify(Notice::LineNumber(n)),
            Marker::End => {
                if !player.is_looping() {
                    player.notify(Notice::SongEnd);
                    return true;
                }
            }
            Marker::Other(_) => {}
        }
        false
    }

    /// One All Sound Off control message per channel on every port.
    fn all_sound_off<S: EventSink>(&self, player: &Player, sinks: &mut [S]) {
        for sink in sinks.iter_mut() {
            for channel in 0..16u8 {
                match sink.reserve(0, 3) {
                    Some(buf) => {
                        buf.copy_from_slice(&[MIDI_CONTROLLER | channel, MIDI_ALL_SOUND_OFF, 0])
                    }
                    None => {
                        player.notify(Notice::Warn("cannot send all sound off"));
                        break;
                    }
                }
            }
            if self.single_output {
                break;
            }
        }
    }
}

fn write_bytes<S: EventSink>(sink: &mut S, offset: u32, bytes: &[u8]) -> bool {
    match sink.reserve(offset, bytes.len()) {
        Some(buf) => {
            buf.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}
