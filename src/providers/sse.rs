// Incremental SSE framing
//
// Server-Sent Events arrive as arbitrary transport chunks that rarely align
// with event boundaries. The framer buffers bytes across calls and yields
// only complete events (terminated by a blank line), keeping any partial
// tail for the next push. Raw bytes are preserved per frame, delimiters
// included, so the sum of frame bytes reproduces the wire stream.

use bytes::{Bytes, BytesMut};

/// One complete SSE event as it appeared on the wire
#[derive(Debug, Clone)]
pub struct SseFrame {
    /// Frame bytes verbatim, including the terminating blank line
    pub raw: Bytes,
    /// Value of the `event:` field, if the frame carried one
    pub event: Option<String>,
    /// Concatenated `data:` lines, joined with newlines per the SSE spec
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseFramer {
    buf: BytesMut,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append transport bytes and pull out every newly complete frame
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(end) = find_frame_end(&self.buf) {
            let raw = self.buf.split_to(end).freeze();
            frames.push(parse_frame(raw));
        }
        frames
    }

    /// Take whatever incomplete bytes remain. Called once at stream end so a
    /// truncated final event is still accounted for.
    pub fn take_tail(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}

/// Find the end offset (exclusive) of the first complete frame, i.e. the
/// position just past its blank-line terminator. Handles both LF and CRLF.
fn find_frame_end(buf: &[u8]) -> Option<usize> {
    let lf = find(buf, b"\n\n").map(|p| p + 2);
    let crlf = find(buf, b"\r\n\r\n").map(|p| p + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_frame(raw: Bytes) -> SseFrame {
    let text = String::from_utf8_lossy(&raw);
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // Comment lines (leading ':') and unknown fields are skipped
    }

    let data = data_lines.join("\n");

    SseFrame { raw, event, data }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_event_in_one_push() {
        let mut framer = SseFramer::new();
        let frames = framer.push(b"data: {\"x\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"x\":1}");
        assert!(frames[0].event.is_none());
        assert!(framer.take_tail().is_none());
    }

    #[test]
    fn event_split_across_pushes() {
        let mut framer = SseFramer::new();
        assert!(framer.push(b"event: message_start\ndata: {\"ty").is_empty());
        let frames = framer.push(b"pe\":\"message_start\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn multiple_events_per_push() {
        let mut framer = SseFramer::new();
        let frames = framer.push(b"data: a\n\ndata: b\n\ndata: c");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "a");
        assert_eq!(frames[1].data, "b");
        let tail = framer.take_tail().expect("partial tail");
        assert_eq!(&tail[..], b"data: c");
    }

    #[test]
    fn crlf_delimiters() {
        let mut framer = SseFramer::new();
        let frames = framer.push(b"event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("ping"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn raw_bytes_sum_to_input() {
        let input: &[u8] = b"data: one\n\nevent: e\ndata: two\n\ndata: tr";
        let mut framer = SseFramer::new();
        let frames = framer.push(input);
        let mut total: Vec<u8> = frames.iter().flat_map(|f| f.raw.to_vec()).collect();
        if let Some(tail) = framer.take_tail() {
            total.extend_from_slice(&tail);
        }
        assert_eq!(total, input);
    }

    #[test]
    fn multi_line_data_joined() {
        let mut framer = SseFramer::new();
        let frames = framer.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }
}
