//! Transport synchronization callbacks.
//!
//! Two entry points the external clock calls into, never the other way
//! around: the position request that settles a relocation before the
//! transport may roll, and the timebase derivation that publishes
//! bar/beat/tick for other transport clients.

use tracing::debug;

use crate::clock::frames_to_seconds;
use crate::playback::Player;
use crate::song::{Cursor, Song};

/// Position handshake: resolve the requested transport position into
/// the active song's cursor.
///
/// Runs in the clock's context, so the lock is taken non-blocking; a
/// contended lock reports "not ready" and the clock retries. With
/// transport-following off, or no active song, the position is trivially
/// accepted.
pub fn position_request(player: &Player, frame: u64) -> bool {
    if !player.follows_transport() {
        return true;
    }
    let Some(mut guard) = player.try_active() else {
        return false;
    };
    match guard.as_mut() {
        None => true,
        Some(active) => {
            let seconds = frames_to_seconds(frame, player.sample_rate());
            debug!("seeking to {} seconds", seconds);
            active.resolve_seek(seconds)
        }
    }
}

/// Bar/beat/tick position, in the shape transport clients consume.
#[derive(Debug, Clone, Copy, Default)]
pub struct BbtPos {
    pub frame: u64,
    pub frame_rate: u32,
    pub bar: i64,
    pub beat: i64,
    pub tick: f64,
    pub bar_start_tick: f64,
    pub beats_per_bar: f64,
    pub beat_type: f64,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

/// Timebase derivation state: remembers which tempo entry the previous
/// buffer used, so unchanged tempo advances incrementally.
#[derive(Debug, Default)]
pub struct Timebase {
    prev_tempo_pulses: Option<u64>,
}

impl Timebase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill `pos` for the buffer of `nframes` frames. `new_pos` forces
    /// a from-scratch recomputation (hard relocation); so does a tempo
    /// change under the next pending event.
    pub fn update(
        &mut self,
        pos: &mut BbtPos,
        nframes: u32,
        new_pos: bool,
        song: &Song,
        cursor: &Cursor,
    ) {
        let Some(event) = cursor.peek(song) else {
            return;
        };
        let tempo = song.tempo_map.entry_at(event.time_pulses);

        if new_pos || self.prev_tempo_pulses != Some(tempo.pulses) {
            pos.beats_per_bar = f64::from(tempo.numerator);
            pos.beat_type = 1.0 / f64::from(tempo.denominator);
            pos.ticks_per_beat = f64::from(song.ppqn);
            pos.beats_per_minute = 60_000_000.0 / f64::from(tempo.microseconds_per_quarter_note);

            let minutes = pos.frame as f64 / (pos.frame_rate as f64 * 60.0);
            let abs_tick = (minutes * pos.beats_per_minute * pos.ticks_per_beat) as i64;
            let abs_beat = (abs_tick as f64 / pos.ticks_per_beat) as i64;

            pos.bar = (abs_beat as f64 / pos.beats_per_bar) as i64;
            pos.beat = abs_beat - (pos.bar as f64 * pos.beats_per_bar) as i64 + 1;
            pos.tick = abs_tick as f64 - abs_beat as f64 * pos.ticks_per_beat;
            pos.bar_start_tick = pos.bar as f64 * pos.beats_per_bar * pos.ticks_per_beat;
            pos.bar += 1; // position is reported 1-based

            self.prev_tempo_pulses = Some(tempo.pulses);
        } else {
            // Advance from the previous buffer's values.
            pos.tick += f64::from(nframes) * pos.ticks_per_beat * pos.beats_per_minute
                / (pos.frame_rate as f64 * 60.0);

            while pos.tick >= pos.ticks_per_beat {
                pos.tick -= pos.ticks_per_beat;
                pos.beat += 1;
                if pos.beat as f64 > pos.beats_per_bar {
                    pos.beat = 1;
                    pos.bar += 1;
                    pos.bar_start_tick += pos.beats_per_bar * pos.ticks_per_beat;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{InternalClock, Transport};
    use crate::edit::LoopTags;
    use crate::marker::Marker;
    use crate::playback::{ActiveSong, Notice, Player};
    use crossbeam::channel::{unbounded, Receiver};

    const SR: u32 = 48_000;
    const PPQN: u16 = 480;

    fn make_player() -> (Player, Receiver<Notice>) {
        let (tx, rx) = unbounded();
        (Player::new(SR, tx), rx)
    }

    fn make_active() -> ActiveSong {
        let mut song = Song::new(PPQN, 1, 1);
        for i in 0..8u64 {
            song.add_event(1, i * 480, vec![0x90, 60, 100]);
        }
        song.add_event(0, 8 * 480, Marker::End.encode());
        let tags = LoopTags {
            intro_end_pulses: 0,
            song_end_pulses: 8 * 480,
            song_length_pulses: 8 * 480,
            intro_end_seconds: 0.0,
            song_end_seconds: 4.0,
            song_length_seconds: 4.0,
        };
        ActiveSong::new(song, Some(tags))
    }

    #[test]
    fn test_position_request_trivial_without_transport() {
        let (player, _rx) = make_player();
        player.set_follow_transport(false);
        assert!(position_request(&player, 1_000_000));
    }

    #[test]
    fn test_position_request_trivial_without_song() {
        let (player, _rx) = make_player();
        assert!(position_request(&player, 0));
    }

    #[test]
    fn test_position_request_fails_under_contention() {
        let (player, _rx) = make_player();
        player.install(Song::new(PPQN, 1, 0), None);
        let guard = player.active();
        assert!(!position_request(&player, 0));
        drop(guard);
        assert!(position_request(&player, 0));
    }

    #[test]
    fn test_position_request_seeks_active_song() {
        let (player, _rx) = make_player();
        {
            let mut guard = player.active();
            *guard = Some(make_active());
        }
        // 1 s = frame 48000 = pulse 960.
        assert!(position_request(&player, 48_000));
        let guard = player.active();
        let active = guard.as_ref().unwrap();
        assert_eq!(active.cursor.peek(&active.song).unwrap().time_pulses, 960);
    }

    #[test]
    fn test_timebase_full_recompute() {
        let mut tb = Timebase::new();
        let mut pos = BbtPos {
            frame: 48_000, // 1 s
            frame_rate: SR,
            ..Default::default()
        };
        let active = make_active();

        tb.update(&mut pos, 256, true, &active.song, &active.cursor);
        // 120 BPM, 4/4, 480 ticks per beat: one second in is two beats,
        // i.e. bar 1 beat 3, tick 0.
        assert_eq!(pos.bar, 1);
        assert_eq!(pos.beat, 3);
        assert_eq!(pos.tick, 0.0);
        assert_eq!(pos.beats_per_minute, 120.0);
        assert_eq!(pos.ticks_per_beat, 480.0);
    }

    #[test]
    fn test_timebase_incremental_advance_carries_bars() {
        let mut tb = Timebase::new();
        let mut pos = BbtPos {
            frame: 0,
            frame_rate: SR,
            ..Default::default()
        };
        let active = make_active();

        tb.update(&mut pos, 256, true, &active.song, &active.cursor);
        assert_eq!((pos.bar, pos.beat), (1, 1));

        // One beat is 0.5 s = 24000 frames; advance two beats in
        // quarter-beat steps.
        for _ in 0..48 {
            tb.update(&mut pos, 1000, false, &active.song, &active.cursor);
        }
        assert_eq!((pos.bar, pos.beat), (1, 3));

        // Two more beats wrap into bar 2.
        for _ in 0..48 {
            tb.update(&mut pos, 1000, false, &active.song, &active.cursor);
        }
        assert_eq!((pos.bar, pos.beat), (2, 1));
        assert_eq!(pos.bar_start_tick, 4.0 * 480.0);
    }

    #[test]
    fn test_timebase_recomputes_on_tempo_change() {
        let mut song = Song::new(PPQN, 1, 1);
        song.add_event(1, 0, vec![0x90, 60, 100]);
        // 60 BPM from beat 2.
        song.add_event(0, 960, vec![0xFF, 0x51, 3, 0x0F, 0x42, 0x40]);
        song.add_event(1, 960, vec![0x90, 62, 100]);
        song.add_event(1, 1440, vec![0x80, 62, 0]);
        let mut active = ActiveSong::new(song, None);

        let mut tb = Timebase::new();
        let mut pos = BbtPos {
            frame: 0,
            frame_rate: SR,
            ..Default::default()
        };
        tb.update(&mut pos, 256, true, &active.song, &active.cursor);
        assert_eq!(pos.beats_per_minute, 120.0);

        // Move the cursor under the new tempo entry: the derivation
        // starts from scratch with the new BPM.
        active.cursor.seek_to_pulses(&active.song, 960);
        pos.frame = 72_000;
        tb.update(&mut pos, 256, false, &active.song, &active.cursor);
        assert_eq!(pos.beats_per_minute, 60.0);
    }

    #[test]
    fn test_internal_clock_settles_through_position_request() {
        let (player, _rx) = make_player();
        {
            let mut guard = player.active();
            *guard = Some(make_active());
        }
        let clock = InternalClock::new();
        clock.locate(48_000);
        clock.start();
        clock.settle(|frame| position_request(&player, frame));
        let guard = player.active();
        let active = guard.as_ref().unwrap();
        assert_eq!(active.cursor.peek(&active.song).unwrap().time_pulses, 960);
    }
}
