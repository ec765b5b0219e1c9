//! Derived-document operations.
//!
//! Playable copies are always derived from the source document: a full
//! structural copy for PLAY, a bar-range extraction for PLAY_BARS, and
//! the loop pre-extension that duplicates the post-intro region after
//! the song end. The pre-extension is what lets the scheduler stream
//! straight across a loop boundary: the next iteration is already
//! physically present after the original end marker.

use tracing::debug;

use crate::error::{Error, Result};
use crate::marker::Marker;
use crate::song::{Cursor, Song};

/// The loop boundary triple of a playable copy, in pulses and seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoopTags {
    pub intro_end_pulses: u64,
    pub song_end_pulses: u64,
    pub song_length_pulses: u64,
    pub intro_end_seconds: f64,
    pub song_end_seconds: f64,
    pub song_length_seconds: f64,
}

/// Full structural clone preserving resolution, format, tempo map and
/// all events.
pub fn copy(song: &Song) -> Song {
    let mut copy = song.empty_like();
    append_range(&mut copy, events_in_range(song, 0, u64::MAX), 0, 0);
    copy
}

/// Extract bars `bar_start..=bar_end` into a fresh document.
///
/// Pulse times are rebased to start at 0. Time-0 global metadata is
/// preserved, except bar markers, and a new end-of-song marker is
/// appended at the extracted length. A bar without a marker is a load
/// error.
pub fn copy_bars(song: &Song, bar_start: u32, bar_end: u32) -> Result<Song> {
    let mut copy = song.empty_like();

    // Time-0 metadata (tempo, time signature, line markers) carries
    // over so the extraction is self-describing.
    for event in &song.tracks[0].events {
        if event.time_pulses > 0 {
            break;
        }
        if !matches!(Marker::decode(&event.payload), Some(Marker::Bar(_))) {
            copy.add_event(0, 0, event.payload.clone());
        }
    }

    let mut copied_length = 0;
    for bar in bar_start..=bar_end {
        let (start, end) = bar_offsets(song, bar)?;
        append_range(&mut copy, events_in_range(song, start, end), start, copied_length);
        copied_length += end - start;
    }

    copy.add_event(0, copied_length, Marker::End.encode());
    Ok(copy)
}

/// Extend `song` in place with one extra loop period and return the
/// loop tags of the result.
///
/// The intro ends at the `(intro_bars + 1)`-th bar boundary; the
/// `[intro_end, song_end)` region is appended immediately after the
/// original end marker, followed by a fresh end marker at
/// `song_end + song_length`.
pub fn loop_extend(song: &mut Song, intro_bars: u32) -> Result<LoopTags> {
    let mut tags = LoopTags::default();

    let mut cursor = Cursor::new(song);
    for _ in 0..=intro_bars {
        let (pulses, seconds) = next_bar_end(song, &mut cursor)?;
        tags.intro_end_pulses = pulses;
        tags.intro_end_seconds = seconds;
    }

    let mut cursor = Cursor::new(song);
    let (end_pulses, end_seconds) = find_song_end(song, &mut cursor)?;
    tags.song_end_pulses = end_pulses;
    tags.song_end_seconds = end_seconds;
    tags.song_length_pulses = tags.song_end_pulses - tags.intro_end_pulses;
    tags.song_length_seconds = tags.song_end_seconds - tags.intro_end_seconds;
    debug!(
        intro_end = tags.intro_end_pulses,
        song_end = tags.song_end_pulses,
        "loop tags"
    );

    let period = events_in_range(song, tags.intro_end_pulses, tags.song_end_pulses);
    append_range(song, period, tags.intro_end_pulses, tags.song_end_pulses);
    song.add_event(
        0,
        tags.song_end_pulses + tags.song_length_pulses,
        Marker::End.encode(),
    );
    Ok(tags)
}

/// Absolute time in seconds of bar `bar`'s boundary marker.
pub fn bar_seconds(song: &Song, bar: u32) -> Result<f64> {
    let mut cursor = Cursor::new(song);
    let (_, seconds) = find_bar_number(song, &mut cursor, bar)?;
    Ok(seconds)
}

/// Pulse range `[start, end)` covered by bar `bar`.
fn bar_offsets(song: &Song, bar: u32) -> Result<(u64, u64)> {
    let mut cursor = Cursor::new(song);
    let (start, _) = find_bar_number(song, &mut cursor, bar)?;
    let (end, _) = next_bar_end(song, &mut cursor)?;
    Ok((start, end))
}

/// Advance to the next bar boundary: a bar marker or the end marker.
fn next_bar_end(song: &Song, cursor: &mut Cursor) -> Result<(u64, f64)> {
    while let Some(event) = cursor.consume(song) {
        if event.is_metadata() {
            match Marker::decode(&event.payload) {
                Some(Marker::Bar(_)) | Some(Marker::End) => {
                    return Ok((event.time_pulses, event.time_seconds));
                }
                _ => {}
            }
        }
    }
    Err(Error::Load("no bar boundary marker found".into()))
}

/// Advance to the marker for bar `bar`.
fn find_bar_number(song: &Song, cursor: &mut Cursor, bar: u32) -> Result<(u64, f64)> {
    while let Some(event) = cursor.consume(song) {
        if event.is_metadata() && Marker::decode(&event.payload) == Some(Marker::Bar(bar)) {
            return Ok((event.time_pulses, event.time_seconds));
        }
    }
    Err(Error::BarNotFound(bar))
}

/// Advance to the terminal end-of-song marker.
fn find_song_end(song: &Song, cursor: &mut Cursor) -> Result<(u64, f64)> {
    while let Some(event) = cursor.consume(song) {
        if event.is_metadata() && Marker::decode(&event.payload) == Some(Marker::End) {
            return Ok((event.time_pulses, event.time_seconds));
        }
    }
    Err(Error::Load("no end-of-song marker found".into()))
}

/// Collect `(track, pulses, payload)` for every event in `[start, end)`,
/// in merged time order.
fn events_in_range(song: &Song, start: u64, end: u64) -> Vec<(usize, u64, Vec<u8>)> {
    let mut cursor = Cursor::new(song);
    cursor.seek_to_pulses(song, start);
    let mut items = Vec::new();
    while let Some(event) = cursor.consume(song) {
        if event.time_pulses >= end {
            break;
        }
        items.push((
            event.track_number,
            event.time_pulses,
            event.payload.clone(),
        ));
    }
    items
}

/// Append collected events to `dst`, shifted from `start` to `dst_start`.
fn append_range(dst: &mut Song, items: Vec<(usize, u64, Vec<u8>)>, start: u64, dst_start: u64) {
    for (track, pulses, payload) in items {
        dst.add_event(track, dst_start + pulses - start, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PPQN: u16 = 480;
    const BAR: u64 = 4 * PPQN as u64;

    /// Three bars with one note each, bar markers at every boundary and
    /// an end marker after the last bar.
    fn make_test_song() -> Song {
        let mut song = Song::new(PPQN, 1, 1);
        for bar in 0..3u64 {
            song.add_event(0, bar * BAR, Marker::Bar(bar as u32).encode());
            song.add_event(1, bar * BAR, vec![0x90, 60 + bar as u8, 100]);
            song.add_event(1, bar * BAR + BAR / 2, vec![0x80, 60 + bar as u8, 0]);
        }
        song.add_event(0, 3 * BAR, Marker::End.encode());
        song
    }

    #[test]
    fn test_copy_preserves_everything() {
        let song = make_test_song();
        let copied = copy(&song);
        assert_eq!(copied.ppqn, song.ppqn);
        assert_eq!(copied.tracks.len(), song.tracks.len());
        for (a, b) in song.tracks.iter().zip(copied.tracks.iter()) {
            assert_eq!(a.events, b.events);
        }
    }

    #[test]
    fn test_copy_bars_single_bar_round_trip() {
        let song = make_test_song();
        let extracted = copy_bars(&song, 1, 1).unwrap();

        // Exactly the events of bar 1, rebased to pulse 0: the bar
        // marker, note on, note off, plus the fresh end marker.
        let notes = &extracted.tracks[1].events;
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].time_pulses, 0);
        assert_eq!(notes[0].payload, vec![0x90, 61, 100]);
        assert_eq!(notes[1].time_pulses, BAR / 2);

        let meta = &extracted.tracks[0].events;
        assert_eq!(meta.len(), 2);
        assert_eq!(Marker::decode(&meta[0].payload), Some(Marker::Bar(1)));
        assert_eq!(meta[0].time_pulses, 0);
        assert_eq!(Marker::decode(&meta[1].payload), Some(Marker::End));
        assert_eq!(meta[1].time_pulses, BAR);
    }

    #[test]
    fn test_copy_bars_strips_time_zero_bar_marker() {
        let song = make_test_song();
        let extracted = copy_bars(&song, 1, 2).unwrap();
        // Bar 0's marker sits at time 0 in the source but is not a
        // time-0 global meta worth keeping.
        let bar_zero = extracted.tracks[0]
            .events
            .iter()
            .filter(|e| Marker::decode(&e.payload) == Some(Marker::Bar(0)))
            .count();
        assert_eq!(bar_zero, 0);
    }

    #[test]
    fn test_copy_bars_missing_bar_is_error() {
        let song = make_test_song();
        match copy_bars(&song, 7, 9) {
            Err(Error::BarNotFound(7)) => {}
            other => panic!("expected BarNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_loop_extend_duplicates_post_intro_region() {
        let mut song = make_test_song();
        // Intro is one bar: intro end at the second bar boundary.
        let tags = loop_extend(&mut song, 1).unwrap();

        assert_eq!(tags.intro_end_pulses, 2 * BAR);
        assert_eq!(tags.song_end_pulses, 3 * BAR);
        assert_eq!(tags.song_length_pulses, BAR);

        // The event right after the original song end is a structural
        // copy of the event right after the intro end, shifted by the
        // song length.
        let mut cursor = Cursor::new(&song);
        cursor.seek_to_pulses(&song, tags.intro_end_pulses);
        let after_intro = cursor.peek(&song).unwrap().clone();
        cursor.seek_to_pulses(&song, tags.song_end_pulses);
        // The original end marker itself sits at S; the copied region
        // starts right behind it.
        while Marker::decode(&cursor.peek(&song).unwrap().payload) == Some(Marker::End) {
            cursor.consume(&song);
        }
        let after_end = cursor.peek(&song).unwrap().clone();
        assert_eq!(after_end.payload, after_intro.payload);
        assert_eq!(
            after_end.time_pulses,
            after_intro.time_pulses + tags.song_length_pulses
        );

        // New terminal marker at 2*S - I.
        let last_meta = song.tracks[0].events.last().unwrap();
        assert_eq!(Marker::decode(&last_meta.payload), Some(Marker::End));
        assert_eq!(
            last_meta.time_pulses,
            2 * tags.song_end_pulses - tags.intro_end_pulses
        );
    }

    #[test]
    fn test_loop_extend_zero_intro() {
        let mut song = make_test_song();
        let tags = loop_extend(&mut song, 0).unwrap();
        // Intro ends at the first bar boundary, which is bar 0's marker
        // at pulse 0.
        assert_eq!(tags.intro_end_pulses, 0);
        assert_eq!(tags.song_length_pulses, 3 * BAR);
        assert!((tags.song_length_seconds - tags.song_end_seconds).abs() < 1e-9);
    }

    #[test]
    fn test_loop_extend_seconds_follow_tempo_map() {
        let mut song = make_test_song();
        let tags = loop_extend(&mut song, 1).unwrap();
        // 120 BPM throughout: one 4/4 bar is 2 s.
        assert!((tags.intro_end_seconds - 4.0).abs() < 1e-9);
        assert!((tags.song_end_seconds - 6.0).abs() < 1e-9);
        assert!((tags.song_length_seconds - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_bar_seconds() {
        let song = make_test_song();
        assert!((bar_seconds(&song, 2).unwrap() - 8.0).abs() < 1e-9);
        assert!(matches!(
            bar_seconds(&song, 5),
            Err(Error::BarNotFound(5))
        ));
    }
}
