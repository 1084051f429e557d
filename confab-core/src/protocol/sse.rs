//! SSE record framing.
//!
//! The server streams text blocks of the form
//!
//! ```text
//! data: {"type":"text","content":"..."}\n
//! \n
//! ```
//!
//! Records are delimited by a blank line; the `data:` marker may or may not
//! be followed by a space. Bytes for a not-yet-complete record stay
//! buffered until the next network chunk — a record is never dropped just
//! because it straddled a read boundary. Malformed records are logged and
//! skipped; the stream keeps going.

use tracing::warn;

use super::Event;

/// Incremental parser over the raw response byte stream.
#[derive(Debug, Default)]
pub struct SseParser {
    /// Undelimited tail of the stream, carried across `push` calls.
    buf: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = find_blank_line(&self.buf) {
            let record: Vec<u8> = self.buf.drain(..pos + 2).collect();
            self.parse_record(&record[..pos], &mut events);
        }
        events
    }

    /// Whether a partial record is still buffered (stream ended mid-frame).
    pub fn has_partial(&self) -> bool {
        !self.buf.iter().all(|b| b.is_ascii_whitespace())
    }

    fn parse_record(&self, record: &[u8], events: &mut Vec<Event>) {
        let text = match std::str::from_utf8(record) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "skipping non-UTF-8 stream record");
                return;
            }
        };

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            let Some(body) = line.strip_prefix("data:") else {
                // event:/id:/comment lines — nothing we consume
                continue;
            };
            let body = body.trim_start();
            if body.is_empty() {
                continue;
            }
            match Event::from_json(body) {
                Ok(ev) => events.push(ev),
                Err(e) => warn!(error = %e, record = body, "skipping malformed stream record"),
            }
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_records() {
        let mut p = SseParser::new();
        let events = p.push(
            b"data: {\"type\":\"text\",\"content\":\"Hello\"}\n\n\
              data: {\"type\":\"text\",\"content\":\" world\"}\n\n",
        );
        assert_eq!(
            events,
            vec![Event::Text("Hello".into()), Event::Text(" world".into())]
        );
        assert!(!p.has_partial());
    }

    #[test]
    fn buffers_partial_record_until_complete() {
        let mut p = SseParser::new();
        assert!(p.push(b"data: {\"type\":\"te").is_empty());
        assert!(p.has_partial());
        let events = p.push(b"xt\",\"content\":\"Hi\"}\n\n");
        assert_eq!(events, vec![Event::Text("Hi".into())]);
        assert!(!p.has_partial());
    }

    #[test]
    fn accepts_prefix_without_space() {
        let mut p = SseParser::new();
        let events = p.push(b"data:{\"type\":\"interrupted\"}\n\n");
        assert_eq!(events, vec![Event::Interrupted]);
    }

    #[test]
    fn skips_malformed_record_and_continues() {
        let mut p = SseParser::new();
        let events = p.push(
            b"data: {broken json\n\n\
              data: {\"type\":\"text\",\"content\":\"ok\"}\n\n",
        );
        assert_eq!(events, vec![Event::Text("ok".into())]);
    }

    #[test]
    fn ignores_non_data_lines() {
        let mut p = SseParser::new();
        let events = p.push(
            b": keepalive\nevent: message\ndata: {\"type\":\"text\",\"content\":\"x\"}\n\n",
        );
        assert_eq!(events, vec![Event::Text("x".into())]);
    }

    #[test]
    fn handles_crlf_line_endings() {
        let mut p = SseParser::new();
        let events = p.push(b"data: {\"type\":\"text\",\"content\":\"x\"}\r\n\n");
        assert_eq!(events, vec![Event::Text("x".into())]);
    }

    #[test]
    fn audio_record_survives_split_mid_payload() {
        let mut p = SseParser::new();
        let first = b"data: {\"type\":\"audio\",\"content\":\"data:audio/wav;base64,AA";
        let second = b"AA\"}\n\n";
        assert!(p.push(first).is_empty());
        let events = p.push(second);
        assert_eq!(
            events,
            vec![Event::Audio("data:audio/wav;base64,AAAA".into())]
        );
    }
}
