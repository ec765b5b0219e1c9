//! SMF decoding boundary.
//!
//! `midly` handles the binary Standard MIDI File format; this module
//! turns its parse output into a [`Song`], merging all tracks into
//! global time order so the tempo map is fully known before any event
//! derives its seconds.

use std::fs;
use std::path::Path;

use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use tracing::debug;

use crate::error::{Error, Result};
use crate::song::Song;

/// Load a song from a Standard MIDI File on disk.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Song> {
    let data = fs::read(path)?;
    load_bytes(&data)
}

/// Decode a song from raw Standard MIDI File bytes.
pub fn load_bytes(data: &[u8]) -> Result<Song> {
    let smf = Smf::parse(data).map_err(|e| Error::Load(format!("SMF parse failed: {}", e)))?;

    let ppqn = match smf.header.timing {
        Timing::Metrical(ppq) => ppq.as_int(),
        Timing::Timecode(_, _) => {
            return Err(Error::Load("timecode-based MIDI files not supported".into()))
        }
    };
    let format = match smf.header.format {
        Format::SingleTrack => 0,
        Format::Parallel => 1,
        Format::Sequential => 2,
    };
    if smf.tracks.is_empty() {
        return Err(Error::Load("MIDI file contains no tracks".into()));
    }

    // Merge all tracks by absolute tick before building the song;
    // stable sort keeps per-track order and puts track 0 first on ties.
    let mut merged: Vec<(u64, usize, Vec<u8>)> = Vec::new();
    for (track_number, track) in smf.tracks.iter().enumerate() {
        let mut tick: u64 = 0;
        for event in track.iter() {
            tick += u64::from(event.delta.as_int());
            if let Some(payload) = event_payload(&event.kind) {
                merged.push((tick, track_number, payload));
            }
        }
    }
    merged.sort_by_key(|&(tick, _, _)| tick);

    let mut song = Song::new(ppqn, format, smf.tracks.len() - 1);
    for (tick, track_number, payload) in merged {
        song.add_event(track_number, tick, payload);
    }

    debug!(
        ppqn,
        format,
        tracks = song.tracks.len(),
        events = song.event_count(),
        "song loaded"
    );
    for (number, track) in song.tracks.iter().enumerate() {
        debug!(track = number, events = track.events.len(), "track");
    }
    Ok(song)
}

/// Raw byte image of a track event, or `None` for events the player
/// has no use for.
fn event_payload(kind: &TrackEventKind) -> Option<Vec<u8>> {
    match kind {
        TrackEventKind::Midi { channel, message } => {
            Some(channel_payload(channel.as_int(), message))
        }
        TrackEventKind::Meta(meta) => meta_payload(meta),
        TrackEventKind::SysEx(data) => {
            let mut payload = Vec::with_capacity(data.len() + 1);
            payload.push(0xF0);
            payload.extend_from_slice(data);
            Some(payload)
        }
        TrackEventKind::Escape(_) => None,
    }
}

fn channel_payload(channel: u8, message: &MidiMessage) -> Vec<u8> {
    match *message {
        MidiMessage::NoteOn { key, vel } => {
            vec![0x90 | channel, key.as_int(), vel.as_int()]
        }
        MidiMessage::NoteOff { key, vel } => {
            vec![0x80 | channel, key.as_int(), vel.as_int()]
        }
        MidiMessage::Aftertouch { key, vel } => {
            vec![0xA0 | channel, key.as_int(), vel.as_int()]
        }
        MidiMessage::Controller { controller, value } => {
            vec![0xB0 | channel, controller.as_int(), value.as_int()]
        }
        MidiMessage::ProgramChange { program } => {
            vec![0xC0 | channel, program.as_int()]
        }
        MidiMessage::ChannelAftertouch { vel } => {
            vec![0xD0 | channel, vel.as_int()]
        }
        MidiMessage::PitchBend { bend } => {
            let value = bend.as_int() as u16;
            vec![0xE0 | channel, (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
        }
    }
}

fn meta_payload(meta: &MetaMessage) -> Option<Vec<u8>> {
    match *meta {
        MetaMessage::Tempo(uspqn) => {
            let v = uspqn.as_int();
            Some(vec![
                0xFF,
                0x51,
                3,
                (v >> 16) as u8,
                (v >> 8) as u8,
                v as u8,
            ])
        }
        MetaMessage::TimeSignature(nn, dd, cc, bb) => {
            Some(vec![0xFF, 0x58, 4, nn, dd, cc, bb])
        }
        MetaMessage::Marker(text) => Some(raw_meta(0x06, text)),
        MetaMessage::Text(text) => Some(raw_meta(0x01, text)),
        MetaMessage::TrackName(text) => Some(raw_meta(0x03, text)),
        MetaMessage::Lyric(text) => Some(raw_meta(0x05, text)),
        MetaMessage::CuePoint(text) => Some(raw_meta(0x07, text)),
        MetaMessage::Unknown(kind, data) => Some(raw_meta(kind, data)),
        MetaMessage::EndOfTrack => None,
        ref other => {
            debug!(?other, "meta event dropped at load");
            None
        }
    }
}

fn raw_meta(kind: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + 3);
    payload.push(0xFF);
    payload.push(kind);
    payload.push(data.len() as u8);
    payload.extend_from_slice(data);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::Marker;
    use midly::num::{u15, u24, u28, u4, u7};
    use midly::{Header, TrackEvent};

    fn midi_event(delta: u32, channel: u8, message: MidiMessage) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(channel),
                message,
            },
        }
    }

    fn meta_event(delta: u32, meta: MetaMessage<'static>) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Meta(meta),
        }
    }

    /// Two-track SMF: meta track with tempo and markers, one instrument
    /// track with a note pair.
    fn make_test_smf() -> Vec<u8> {
        let smf = Smf {
            header: Header {
                format: Format::Parallel,
                timing: Timing::Metrical(u15::new(480)),
            },
            tracks: vec![
                vec![
                    meta_event(0, MetaMessage::Tempo(u24::new(500_000))),
                    meta_event(0, MetaMessage::Marker(b"BAR0")),
                    meta_event(1920, MetaMessage::Marker(b"END")),
                    meta_event(0, MetaMessage::EndOfTrack),
                ],
                vec![
                    midi_event(
                        0,
                        3,
                        MidiMessage::NoteOn {
                            key: u7::new(60),
                            vel: u7::new(100),
                        },
                    ),
                    midi_event(
                        480,
                        3,
                        MidiMessage::NoteOff {
                            key: u7::new(60),
                            vel: u7::new(0),
                        },
                    ),
                    meta_event(0, MetaMessage::EndOfTrack),
                ],
            ],
        };
        let mut data = Vec::new();
        smf.write_std(&mut data).unwrap();
        data
    }

    #[test]
    fn test_load_builds_tracks_and_markers() {
        let song = load_bytes(&make_test_smf()).unwrap();
        assert_eq!(song.ppqn, 480);
        assert_eq!(song.format, 1);
        assert_eq!(song.instrument_tracks(), 1);

        let markers: Vec<_> = song.tracks[0]
            .events
            .iter()
            .filter_map(|e| Marker::decode(&e.payload))
            .collect();
        assert_eq!(markers, vec![Marker::Bar(0), Marker::End]);
    }

    #[test]
    fn test_load_keeps_channel_in_payload() {
        let song = load_bytes(&make_test_smf()).unwrap();
        let notes = &song.tracks[1].events;
        assert_eq!(notes[0].payload, vec![0x90 | 3, 60, 100]);
        assert_eq!(notes[1].payload, vec![0x80 | 3, 60, 0]);
        assert_eq!(notes[1].time_pulses, 480);
    }

    #[test]
    fn test_load_derives_seconds_from_tempo() {
        let song = load_bytes(&make_test_smf()).unwrap();
        // 120 BPM: 480 pulses = 0.5 s, the end marker at 1920 = 2.0 s.
        let note_off = &song.tracks[1].events[1];
        assert!((note_off.time_seconds - 0.5).abs() < 1e-9);
        let end = song.tracks[0].events.last().unwrap();
        assert_eq!(end.time_pulses, 1920);
        assert!((end.time_seconds - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_garbage_is_error() {
        assert!(matches!(
            load_bytes(b"not a midi file"),
            Err(Error::Load(_))
        ));
    }
}
