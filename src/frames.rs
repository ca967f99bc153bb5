use bytes::{Buf, BytesMut};

/// Which side of the container's output a decoded line came from. The
/// engine tags stdout frames with 1; everything else is treated as
/// diagnostic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOrigin {
    Primary,
    Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub origin: LogOrigin,
    pub text: String,
}

const HEADER_LEN: usize = 8;

/// Incremental decoder for the engine's multiplexed output protocol:
/// an 8-byte header (origin tag, three reserved bytes, big-endian u32
/// payload length) followed by that many bytes of UTF-8 text.
///
/// Frames routinely straddle read boundaries, so the decoder buffers
/// whatever it cannot yet complete and picks it up on the next feed.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk from the underlying stream and return every line
    /// that became complete. Trailing whitespace is trimmed and empty
    /// payloads are dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ConsoleLine> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }

            let payload_len = u32::from_be_bytes([
                self.buf[4],
                self.buf[5],
                self.buf[6],
                self.buf[7],
            ]) as usize;

            if self.buf.len() < HEADER_LEN + payload_len {
                break;
            }

            let origin = if self.buf[0] == 1 {
                LogOrigin::Primary
            } else {
                LogOrigin::Diagnostic
            };

            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(payload_len);

            let text = String::from_utf8_lossy(&payload);
            let text = text.trim_end();
            if !text.is_empty() {
                lines.push(ConsoleLine {
                    origin,
                    text: text.to_string(),
                });
            }
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decodes_single_primary_frame() {
        let mut decoder = FrameDecoder::new();
        let lines = decoder.feed(&frame(1, b"hello"));
        assert_eq!(
            lines,
            vec![ConsoleLine {
                origin: LogOrigin::Primary,
                text: "hello".to_string()
            }]
        );
    }

    #[test]
    fn zero_length_payload_emits_nothing() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&frame(1, b"")).is_empty());
    }

    #[test]
    fn non_primary_tags_are_diagnostic() {
        let mut decoder = FrameDecoder::new();
        let lines = decoder.feed(&frame(2, b"oops"));
        assert_eq!(lines[0].origin, LogOrigin::Diagnostic);

        let lines = decoder.feed(&frame(0, b"raw"));
        assert_eq!(lines[0].origin, LogOrigin::Diagnostic);
    }

    #[test]
    fn trailing_whitespace_is_trimmed() {
        let mut decoder = FrameDecoder::new();
        let lines = decoder.feed(&frame(1, b"ready\r\n"));
        assert_eq!(lines[0].text, "ready");
    }

    #[test]
    fn whitespace_only_payload_is_dropped() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&frame(1, b"\n")).is_empty());
    }

    #[test]
    fn frame_split_across_feeds_is_reassembled() {
        let mut decoder = FrameDecoder::new();
        let bytes = frame(1, b"partial delivery");

        assert!(decoder.feed(&bytes[..3]).is_empty());
        assert!(decoder.feed(&bytes[3..10]).is_empty());
        let lines = decoder.feed(&bytes[10..]);

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "partial delivery");
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = frame(1, b"one");
        bytes.extend_from_slice(&frame(2, b"two"));

        let lines = decoder.feed(&bytes);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "one");
        assert_eq!(lines[0].origin, LogOrigin::Primary);
        assert_eq!(lines[1].text, "two");
        assert_eq!(lines[1].origin, LogOrigin::Diagnostic);
    }
}
