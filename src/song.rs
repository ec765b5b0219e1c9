//! Song document model.
//!
//! A [`Song`] is a complete piece: pulses-per-quarter-note resolution, a
//! tempo map, and a set of tracks holding time-ordered MIDI events.
//! Track 0 is reserved for tempo and marker metadata; tracks 1..N map
//! 1:1 to instrument output ports.
//!
//! A [`Cursor`] is a forward-progress read position over all tracks
//! merged in time order. The playback engine owns exactly one cursor per
//! active song; consuming never moves time backward, seeking may.

/// Default tempo when a document carries no tempo event: 120 BPM.
pub const DEFAULT_USPQN: u32 = 500_000;

/// One entry of the tempo map: the tempo and time signature in force
/// from `pulses` onward, with the absolute time of that boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoEntry {
    pub pulses: u64,
    pub microseconds_per_quarter_note: u32,
    pub numerator: u8,
    pub denominator: u8,
    /// Absolute time of `pulses`, integrated over all prior entries.
    pub seconds: f64,
}

/// Ordered tempo-change list. Always holds an entry at pulse 0.
#[derive(Debug, Clone)]
pub struct TempoMap {
    entries: Vec<TempoEntry>,
}

impl TempoMap {
    pub fn new() -> Self {
        Self {
            entries: vec![TempoEntry {
                pulses: 0,
                microseconds_per_quarter_note: DEFAULT_USPQN,
                numerator: 4,
                denominator: 4,
                seconds: 0.0,
            }],
        }
    }

    /// The entry governing `pulses`: the last entry at or before it.
    pub fn entry_at(&self, pulses: u64) -> &TempoEntry {
        let idx = self.entries.partition_point(|e| e.pulses <= pulses);
        &self.entries[idx - 1]
    }

    /// Absolute time of `pulses`, integrating the map.
    pub fn seconds_at(&self, ppqn: u16, pulses: u64) -> f64 {
        let entry = self.entry_at(pulses);
        entry.seconds + pulse_span_seconds(ppqn, pulses - entry.pulses, entry)
    }

    /// Record a tempo change. Entries must arrive in non-decreasing
    /// pulse order; a change at an existing boundary replaces it.
    pub fn set_tempo(&mut self, ppqn: u16, pulses: u64, uspqn: u32) {
        let (numerator, denominator) = {
            let last = self.entries.last().unwrap();
            (last.numerator, last.denominator)
        };
        self.push_entry(ppqn, pulses, uspqn, numerator, denominator);
    }

    /// Record a time-signature change, carrying the current tempo.
    pub fn set_time_signature(&mut self, ppqn: u16, pulses: u64, numerator: u8, denominator: u8) {
        let uspqn = self.entries.last().unwrap().microseconds_per_quarter_note;
        self.push_entry(ppqn, pulses, uspqn, numerator, denominator);
    }

    fn push_entry(&mut self, ppqn: u16, pulses: u64, uspqn: u32, numerator: u8, denominator: u8) {
        let seconds = self.seconds_at(ppqn, pulses);
        let last = self.entries.last_mut().unwrap();
        debug_assert!(last.pulses <= pulses);
        if last.pulses == pulses {
            last.microseconds_per_quarter_note = uspqn;
            last.numerator = numerator;
            last.denominator = denominator;
            return;
        }
        self.entries.push(TempoEntry {
            pulses,
            microseconds_per_quarter_note: uspqn,
            numerator,
            denominator,
            seconds,
        });
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::new()
    }
}

fn pulse_span_seconds(ppqn: u16, pulses: u64, entry: &TempoEntry) -> f64 {
    pulses as f64 * entry.microseconds_per_quarter_note as f64 / (1_000_000.0 * ppqn as f64)
}

/// A single timed event: raw MIDI bytes at a document position.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Owning track; 0 is the global metadata track.
    pub track_number: usize,
    /// Document-relative time in pulses.
    pub time_pulses: u64,
    /// Derived from the tempo map at insertion time.
    pub time_seconds: f64,
    /// Raw MIDI status + data bytes (meta events start with 0xFF).
    pub payload: Vec<u8>,
}

impl Event {
    /// Metadata events are decoded and consumed by the scheduler, never
    /// written to an output port.
    pub fn is_metadata(&self) -> bool {
        self.payload.first() == Some(&crate::marker::META_STATUS)
    }
}

/// Ordered sequence of events, time non-decreasing.
#[derive(Debug, Clone, Default)]
pub struct Track {
    pub events: Vec<Event>,
}

/// A complete song document.
#[derive(Debug, Clone)]
pub struct Song {
    pub ppqn: u16,
    pub format: u16,
    pub tempo_map: TempoMap,
    pub tracks: Vec<Track>,
}

impl Song {
    /// Create an empty song with a metadata track plus
    /// `instrument_tracks` instrument tracks.
    pub fn new(ppqn: u16, format: u16, instrument_tracks: usize) -> Self {
        Self {
            ppqn,
            format,
            tempo_map: TempoMap::new(),
            tracks: vec![Track::default(); instrument_tracks + 1],
        }
    }

    /// An empty song with the same resolution, format and track layout.
    pub fn empty_like(&self) -> Self {
        Self::new(self.ppqn, self.format, self.instrument_tracks())
    }

    pub fn instrument_tracks(&self) -> usize {
        self.tracks.len() - 1
    }

    /// Append an event, deriving its seconds from the tempo map.
    ///
    /// Tempo and time-signature meta events extend the map before the
    /// derivation, so events added in global time order always satisfy
    /// the seconds/pulses consistency invariant.
    pub fn add_event(&mut self, track: usize, pulses: u64, payload: Vec<u8>) {
        self.note_tempo_payload(pulses, &payload);
        let seconds = self.tempo_map.seconds_at(self.ppqn, pulses);
        let event = Event {
            track_number: track,
            time_pulses: pulses,
            time_seconds: seconds,
            payload,
        };
        let events = &mut self.tracks[track].events;
        match events.last() {
            Some(last) if last.time_pulses > pulses => {
                let idx = events.partition_point(|e| e.time_pulses <= pulses);
                events.insert(idx, event);
            }
            _ => events.push(event),
        }
    }

    fn note_tempo_payload(&mut self, pulses: u64, payload: &[u8]) {
        match payload {
            [0xFF, 0x51, 3, a, b, c, ..] => {
                let uspqn = u32::from(*a) << 16 | u32::from(*b) << 8 | u32::from(*c);
                self.tempo_map.set_tempo(self.ppqn, pulses, uspqn);
            }
            [0xFF, 0x58, 4, nn, dd, ..] => {
                self.tempo_map
                    .set_time_signature(self.ppqn, pulses, *nn, 1u8 << *dd);
            }
            _ => {}
        }
    }

    /// Total number of events across all tracks.
    pub fn event_count(&self) -> usize {
        self.tracks.iter().map(|t| t.events.len()).sum()
    }
}

/// Forward-only merged read position over a song's tracks.
///
/// A cursor is only meaningful for the song it was created from; the
/// playback engine keeps the two bundled so they can never drift apart.
#[derive(Debug, Clone)]
pub struct Cursor {
    next: Vec<usize>,
}

impl Cursor {
    pub fn new(song: &Song) -> Self {
        Self {
            next: vec![0; song.tracks.len()],
        }
    }

    pub fn rewind(&mut self) {
        for idx in &mut self.next {
            *idx = 0;
        }
    }

    /// The next event in merged time order, without consuming it.
    /// Ties between tracks go to the lowest track number.
    pub fn peek<'a>(&self, song: &'a Song) -> Option<&'a Event> {
        self.best(song).map(|(_, event)| event)
    }

    /// Consume and return the next event. Equal to the previous `peek`.
    pub fn consume<'a>(&mut self, song: &'a Song) -> Option<&'a Event> {
        let (track, event) = self.best(song)?;
        self.next[track] += 1;
        Some(event)
    }

    /// Reposition so the next event is the first with
    /// `time_pulses >= pulses`.
    pub fn seek_to_pulses(&mut self, song: &Song, pulses: u64) {
        for (track, state) in song.tracks.iter().zip(self.next.iter_mut()) {
            *state = track.events.partition_point(|e| e.time_pulses < pulses);
        }
    }

    /// Reposition so the next event is the first with
    /// `time_seconds >= seconds`.
    pub fn seek_to_seconds(&mut self, song: &Song, seconds: f64) {
        for (track, state) in song.tracks.iter().zip(self.next.iter_mut()) {
            *state = track.events.partition_point(|e| e.time_seconds < seconds);
        }
    }

    fn best<'a>(&self, song: &'a Song) -> Option<(usize, &'a Event)> {
        let mut best: Option<(usize, &'a Event)> = None;
        for (track, events) in song.tracks.iter().enumerate() {
            if let Some(event) = events.events.get(self.next[track]) {
                let better = match best {
                    Some((_, b)) => event.time_pulses < b.time_pulses,
                    None => true,
                };
                if better {
                    best = Some((track, event));
                }
            }
        }
        best
    }
}
