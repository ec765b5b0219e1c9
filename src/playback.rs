//! Playback state and control operations.
//!
//! A [`Player`] is the shared handle over everything both execution
//! contexts touch: the active playing song with its cursor and loop
//! state behind a mutex, and the plain flag scalars beside it.
//!
//! # Thread safety
//! The real-time path acquires the song lock with `try_lock` and skips
//! the cycle on contention; the control path blocks, but only across a
//! pointer swap or a resolved seek, never across I/O. Flags are atomics
//! read by the real-time path and written by the control path; a stale
//! read costs at most one buffer.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::Sender;
use tracing::{debug, error};

use crate::clock::{seconds_to_frames, Transport};
use crate::edit::{self, LoopTags};
use crate::error::Result;
use crate::song::{Cursor, Song};

/// Anchor value meaning "playback not started".
pub const ANCHOR_UNSET: i64 = -1;

/// Events consumed at most by one bounded forward seek.
const PARTIAL_SEEK_LENGTH: usize = 10;

/// Notices emitted by the real-time path and drained on the control
/// side: playhead feedback for the remote session, plus deferred
/// warnings that must not be logged from the callback itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    BarNumber(u32),
    LineNumber(u32),
    SongEnd,
    Warn(&'static str),
}

/// The active playing song, its cursor, and the loop state that only
/// ever changes under the song lock.
pub struct ActiveSong {
    pub song: Song,
    pub cursor: Cursor,
    pub tags: Option<LoopTags>,
    pub loop_count: u32,
    pub loop_offset: f64,
}

impl ActiveSong {
    pub fn new(song: Song, tags: Option<LoopTags>) -> Self {
        let cursor = Cursor::new(&song);
        Self {
            song,
            cursor,
            tags,
            loop_count: 0,
            loop_offset: 0.0,
        }
    }

    /// Current cumulative loop-time offset, wrapping the cursor back by
    /// one song length first if it has crossed the loop boundary.
    ///
    /// The offset formula multiplies the single-period time delta by the
    /// incremented iteration count; this mirrors the historical behavior
    /// and is pinned by a regression test.
    pub fn resolve_loop(&mut self, looping: bool) -> f64 {
        if !looping {
            return self.loop_offset;
        }
        let Some(tags) = self.tags else {
            return self.loop_offset;
        };
        let Some(next) = self.cursor.peek(&self.song) else {
            return self.loop_offset;
        };
        if next.time_pulses > tags.song_end_pulses {
            let old_seconds = next.time_seconds;
            let target = next.time_pulses - tags.song_length_pulses;
            debug!("loop: seeking to {} pulses", target);
            self.cursor.seek_to_pulses(&self.song, target);
            if let Some(wrapped) = self.cursor.peek(&self.song) {
                self.loop_count += 1;
                self.loop_offset = (old_seconds - wrapped.time_seconds) * self.loop_count as f64;
            }
        }
        self.loop_offset
    }

    /// Resolve an absolute transport time into a position inside one
    /// loop period and seek there. Returns whether the seek settled;
    /// on `false` the caller retries on a later buffer.
    pub fn resolve_seek(&mut self, seconds: f64) -> bool {
        self.loop_count = 0;
        self.loop_offset = 0.0;
        let mut target = seconds;
        if let Some(tags) = self.tags {
            if seconds > tags.song_end_seconds && tags.song_length_seconds > 0.0 {
                while target
                    > tags.intro_end_seconds
                        + (self.loop_count + 1) as f64 * tags.song_length_seconds
                {
                    self.loop_count += 1;
                }
                self.loop_offset = self.loop_count as f64 * tags.song_length_seconds;
                target -= self.loop_offset;
            }
        }
        self.partial_seek(target)
    }

    /// Bounded incremental forward scan: consume at most
    /// [`PARTIAL_SEEK_LENGTH`] events on the way to `seconds`. A full
    /// rewind first when the cursor already sits past the target.
    fn partial_seek(&mut self, seconds: f64) -> bool {
        match self.cursor.peek(&self.song) {
            Some(event) if event.time_seconds < seconds => {}
            _ => self.cursor.rewind(),
        }

        if self.reached(seconds) {
            return true;
        }
        for _ in 0..PARTIAL_SEEK_LENGTH {
            self.cursor.consume(&self.song);
            if self.reached(seconds) {
                return true;
            }
        }
        false
    }

    fn reached(&self, seconds: f64) -> bool {
        match self.cursor.peek(&self.song) {
            None => {
                error!("trying to seek past the end of song");
                true
            }
            Some(event) => event.time_seconds >= seconds,
        }
    }
}

struct PlayerShared {
    active: Mutex<Option<ActiveSong>>,
    paused: AtomicBool,
    looping: AtomicBool,
    follow_transport: AtomicBool,
    intro_bars: AtomicU32,
    /// Wall-clock frame at which playback started, or [`ANCHOR_UNSET`].
    anchor: AtomicI64,
    /// Transport frame position captured together with the anchor.
    song_position: AtomicU64,
    /// 0 = not aborting; counts scheduler cycles once armed.
    abort: AtomicU32,
    notices: Sender<Notice>,
    sample_rate: u32,
}

/// Shared playback handle, cheap to clone across threads.
#[derive(Clone)]
pub struct Player {
    shared: Arc<PlayerShared>,
}

impl Player {
    pub fn new(sample_rate: u32, notices: Sender<Notice>) -> Self {
        Self {
            shared: Arc::new(PlayerShared {
                active: Mutex::new(None),
                paused: AtomicBool::new(false),
                looping: AtomicBool::new(true),
                follow_transport: AtomicBool::new(true),
                intro_bars: AtomicU32::new(2),
                anchor: AtomicI64::new(ANCHOR_UNSET),
                song_position: AtomicU64::new(0),
                abort: AtomicU32::new(0),
                notices,
                sample_rate,
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::SeqCst)
    }

    pub fn set_looping(&self, on: bool) {
        self.shared.looping.store(on, Ordering::SeqCst);
    }

    pub fn follows_transport(&self) -> bool {
        self.shared.follow_transport.load(Ordering::SeqCst)
    }

    pub fn set_follow_transport(&self, on: bool) {
        self.shared.follow_transport.store(on, Ordering::SeqCst);
    }

    pub fn intro_bars(&self) -> u32 {
        self.shared.intro_bars.load(Ordering::SeqCst)
    }

    pub fn set_intro_bars(&self, bars: u32) {
        self.shared.intro_bars.store(bars, Ordering::SeqCst);
    }

    pub fn anchor(&self) -> i64 {
        self.shared.anchor.load(Ordering::SeqCst)
    }

    pub fn set_anchor(&self, frame: i64) {
        self.shared.anchor.store(frame, Ordering::SeqCst);
    }

    pub fn clear_anchor(&self) {
        self.shared.anchor.store(ANCHOR_UNSET, Ordering::SeqCst);
    }

    pub fn song_position(&self) -> u64 {
        self.shared.song_position.load(Ordering::SeqCst)
    }

    pub fn set_song_position(&self, frame: u64) {
        self.shared.song_position.store(frame, Ordering::SeqCst);
    }

    /// Arm the shutdown drain. The scheduler emits all-sound-off for
    /// two further cycles and then reports termination.
    pub fn request_abort(&self) {
        let _ = self
            .shared
            .abort
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.shared.abort.load(Ordering::SeqCst) > 0
    }

    /// Count one drain cycle; returns the new count.
    pub fn bump_abort(&self) -> u32 {
        self.shared.abort.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn notify(&self, notice: Notice) {
        let _ = self.shared.notices.send(notice);
    }

    /// Non-blocking lock for the real-time path. `None` means the
    /// control context holds the state; skip this cycle.
    pub fn try_active(&self) -> Option<MutexGuard<'_, Option<ActiveSong>>> {
        self.shared.active.try_lock().ok()
    }

    /// Blocking lock for the control path.
    pub fn active(&self) -> MutexGuard<'_, Option<ActiveSong>> {
        self.shared.active.lock().unwrap()
    }

    /// Swap in a freshly built playable copy. The previous active song
    /// is dropped once the new one is installed.
    pub fn install(&self, song: Song, tags: Option<LoopTags>) {
        *self.active() = Some(ActiveSong::new(song, tags));
    }

    /// Stop playback: halt the external transport or clear the internal
    /// anchor, and leave pause behind.
    pub fn stop(&self, transport: &dyn Transport) {
        if self.follows_transport() {
            transport.stop();
            self.notify(Notice::SongEnd);
        } else {
            self.clear_anchor();
        }
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    /// Start playback of the installed song from its current position.
    fn start(&self, transport: &dyn Transport) {
        if let Some(active) = self.active().as_mut() {
            active.loop_count = 0;
            active.loop_offset = 0.0;
        }
        debug!("use transport {}", self.follows_transport());
        if self.follows_transport() {
            transport.start();
        } else {
            self.set_anchor(transport.frame_time() as i64);
        }
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    /// PLAY: build a loop-extended copy of the source and start it from
    /// the origin.
    pub fn play(&self, source: &Song, transport: &dyn Transport) -> Result<()> {
        self.stop(transport);
        let mut song = edit::copy(source);
        let tags = edit::loop_extend(&mut song, self.intro_bars())?;
        self.install(song, Some(tags));
        if self.follows_transport() {
            transport.locate(0);
        } else {
            self.set_song_position(0);
        }
        self.start(transport);
        Ok(())
    }

    /// PLAY_BAR: as [`Player::play`], starting at bar `bar`.
    pub fn play_from_bar(&self, source: &Song, bar: u32, transport: &dyn Transport) -> Result<()> {
        debug!("playing from bar {}", bar);
        self.stop(transport);
        let mut song = edit::copy(source);
        let tags = edit::loop_extend(&mut song, self.intro_bars())?;
        let start_time = edit::bar_seconds(&song, bar)?;
        debug!("bar start time {}", start_time);
        let start_frame = seconds_to_frames(start_time, self.shared.sample_rate) as u64;
        {
            let mut guard = self.active();
            *guard = Some(ActiveSong::new(song, Some(tags)));
            if !self.follows_transport() {
                let active = guard.as_mut().unwrap();
                active.cursor.seek_to_seconds(&active.song, start_time);
            }
        }
        if self.follows_transport() {
            transport.locate(start_frame);
        } else {
            self.set_song_position(start_frame);
        }
        self.start(transport);
        Ok(())
    }

    /// PLAY_BARS: extract a bar range and start it from the origin,
    /// loop-extended with no intro.
    pub fn play_bars(
        &self,
        source: &Song,
        bar_start: u32,
        bar_end: u32,
        transport: &dyn Transport,
    ) -> Result<()> {
        self.stop(transport);
        let mut song = edit::copy_bars(source, bar_start, bar_end)?;
        let tags = edit::loop_extend(&mut song, 0)?;
        self.install(song, Some(tags));
        if self.follows_transport() {
            transport.locate(0);
        } else {
            self.set_song_position(0);
        }
        self.start(transport);
        Ok(())
    }

    /// PAUSE_ON / PAUSE_OFF. Pausing while already paused is a no-op.
    pub fn pause(&self, on: bool, transport: &dyn Transport) {
        if on {
            if self.follows_transport() && !self.is_paused() {
                transport.stop();
            }
            self.shared.paused.store(true, Ordering::SeqCst);
        } else {
            if self.follows_transport() && self.is_paused() {
                transport.start();
            }
            self.shared.paused.store(false, Ordering::SeqCst);
        }
    }
}
