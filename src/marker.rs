//! Marker meta-event codec.
//!
//! Control markers are piggybacked on the MIDI stream as marker meta
//! events (`FF 06 len text`). The sequencer front end writes `BAR<n>` at
//! every bar boundary, a bare line number for source-line feedback, and
//! `END` as the terminal end-of-song marker. Marker events are never
//! emitted to an output port; the scheduler consumes them as
//! side-effecting triggers.

/// Status byte shared by all meta events.
pub const META_STATUS: u8 = 0xFF;
/// Meta event type for text markers.
pub const META_MARKER: u8 = 0x06;

const BAR_TAG: &str = "BAR";
const END_TAG: &str = "END";

/// A decoded control marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// Bar boundary, carrying the bar number.
    Bar(u32),
    /// Source line number for editor playhead feedback.
    Line(u32),
    /// Terminal end-of-song marker.
    End,
    /// Any other marker text, passed through untouched.
    Other(String),
}

impl Marker {
    /// Decode a marker from a raw meta-event payload.
    ///
    /// Returns `None` for payloads that are not marker meta events
    /// (channel messages, tempo changes, and so on).
    pub fn decode(payload: &[u8]) -> Option<Marker> {
        let text = marker_text(payload)?;
        Some(Marker::from_text(&text))
    }

    fn from_text(text: &str) -> Marker {
        if let Some(rest) = text.strip_prefix(BAR_TAG) {
            if let Some(n) = parse_leading_digits(rest) {
                return Marker::Bar(n);
            }
        }
        if text.starts_with(END_TAG) {
            return Marker::End;
        }
        if let Some(n) = parse_leading_digits(text) {
            return Marker::Line(n);
        }
        Marker::Other(text.to_string())
    }

    /// Encode this marker as a raw meta-event payload.
    pub fn encode(&self) -> Vec<u8> {
        let text = match self {
            Marker::Bar(n) => format!("{}{}", BAR_TAG, n),
            Marker::Line(n) => n.to_string(),
            Marker::End => END_TAG.to_string(),
            Marker::Other(s) => s.clone(),
        };
        let mut payload = Vec::with_capacity(3 + text.len());
        payload.push(META_STATUS);
        payload.push(META_MARKER);
        payload.push(text.len() as u8);
        payload.extend_from_slice(text.as_bytes());
        payload
    }
}

/// Extract the text of a marker meta event, or `None` if the payload is
/// not a marker.
fn marker_text(payload: &[u8]) -> Option<String> {
    if payload.len() < 3 || payload[0] != META_STATUS || payload[1] != META_MARKER {
        return None;
    }
    let len = payload[2] as usize;
    let text = payload.get(3..3 + len)?;
    Some(String::from_utf8_lossy(text).into_owned())
}

/// Parse a decimal number from the start of `s`, ignoring any trailing
/// non-digit characters. `None` if `s` does not start with a digit.
fn parse_leading_digits(s: &str) -> Option<u32> {
    let digits: &str = &s[..s.bytes().take_while(|b| b.is_ascii_digit()).count()];
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bar_marker() {
        let payload = Marker::Bar(12).encode();
        assert_eq!(payload[..3], [0xFF, 0x06, 5]);
        assert_eq!(Marker::decode(&payload), Some(Marker::Bar(12)));
    }

    #[test]
    fn test_decode_end_marker() {
        let payload = Marker::End.encode();
        assert_eq!(Marker::decode(&payload), Some(Marker::End));
    }

    #[test]
    fn test_decode_line_marker() {
        let payload = Marker::Line(42).encode();
        assert_eq!(Marker::decode(&payload), Some(Marker::Line(42)));
    }

    #[test]
    fn test_other_marker_text_passes_through() {
        let payload = Marker::Other("Verse 1".to_string()).encode();
        assert_eq!(
            Marker::decode(&payload),
            Some(Marker::Other("Verse 1".to_string()))
        );
    }

    #[test]
    fn test_non_marker_meta_is_none() {
        // Tempo change meta event
        let payload = [0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20];
        assert_eq!(Marker::decode(&payload), None);
    }

    #[test]
    fn test_channel_message_is_none() {
        assert_eq!(Marker::decode(&[0x90, 60, 100]), None);
    }

    #[test]
    fn test_bar_without_number_is_other() {
        let payload = Marker::Other("BARx".to_string()).encode();
        assert_eq!(
            Marker::decode(&payload),
            Some(Marker::Other("BARx".to_string()))
        );
    }
}
