// src/ami/codec.rs
//! Wire codec: manager protocol blocks to typed frames and back
//!
//! A block is a run of `Key: Value` lines closed by one blank line. The
//! switch terminates lines with `\r\n`; bare `\n` is accepted too.

use crate::ami::action::Action;
use crate::ami::constants::{BANNER_PREFIX, KEY_EVENT, KEY_RESPONSE, MAX_BLOCK_SIZE};
use crate::ami::event::AmiEvent;
use crate::ami::headers::Headers;
use crate::ami::response::AmiResponse;
use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// One decoded unit from the socket.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Greeting line, carries the protocol version
    Banner(String),
    Response(AmiResponse),
    Event(AmiEvent),
    /// Block that could not be understood. Reported instead of failing the
    /// stream so one bad block does not take the connection down.
    Malformed(String),
}

#[derive(Debug)]
pub struct AmiCodec {
    banner_pending: bool,
    discarding: bool,
    max_block_size: usize,
}

impl AmiCodec {
    pub fn new() -> Self {
        Self {
            banner_pending: true,
            discarding: false,
            max_block_size: MAX_BLOCK_SIZE,
        }
    }

    pub fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    /// Codec for a stream that does not start with a greeting line.
    pub fn without_banner(mut self) -> Self {
        self.banner_pending = false;
        self
    }
}

impl Default for AmiCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Index just past the first blank-line terminator, if the buffer holds one.
fn find_block_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match (buf.get(i + 1), buf.get(i + 2)) {
                (Some(b'\n'), _) => return Some(i + 2),
                (Some(b'\r'), Some(b'\n')) => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn skip_leading_blank_lines(buf: &mut BytesMut) {
    loop {
        if buf.starts_with(b"\r\n") {
            buf.advance(2);
        } else if buf.starts_with(b"\n") {
            buf.advance(1);
        } else {
            return;
        }
    }
}

fn parse_block(block: &[u8]) -> Frame {
    let text = match std::str::from_utf8(block) {
        Ok(text) => text,
        Err(e) => return Frame::Malformed(format!("invalid UTF-8 in block: {}", e)),
    };

    let mut headers = Headers::new();
    let mut loose_lines = Vec::new();

    for raw in text.split('\n') {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() => {
                headers.push(key.trim(), value.trim());
            }
            _ => loose_lines.push(line.to_string()),
        }
    }

    if headers.contains(KEY_EVENT) {
        if let Some(line) = loose_lines.first() {
            return Frame::Malformed(format!("line without ':' in event block: {:?}", line));
        }
        return match AmiEvent::from_headers(headers) {
            Some(event) => Frame::Event(event),
            None => Frame::Malformed("event block with empty Event name".to_string()),
        };
    }

    if headers.contains(KEY_RESPONSE) {
        let follows = headers
            .get(KEY_RESPONSE)
            .map(|s| s.eq_ignore_ascii_case("Follows"))
            .unwrap_or(false);
        if !follows {
            if let Some(line) = loose_lines.first() {
                return Frame::Malformed(format!(
                    "line without ':' in response block: {:?}",
                    line
                ));
            }
        }
        return match AmiResponse::from_headers(headers, loose_lines) {
            Some(response) => Frame::Response(response),
            None => Frame::Malformed("response block without Response key".to_string()),
        };
    }

    Frame::Malformed(format!(
        "block carries neither Event nor Response ({} lines)",
        headers.len() + loose_lines.len()
    ))
}

impl Decoder for AmiCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            if self.discarding {
                match find_block_end(buf) {
                    Some(end) => {
                        buf.advance(end);
                        self.discarding = false;
                        trace!("[DECODE] Resynchronized after oversized block");
                        continue;
                    }
                    None => {
                        // Keep a short tail in case the terminator straddles reads.
                        let keep = buf.len().min(3);
                        let drop = buf.len() - keep;
                        buf.advance(drop);
                        return Ok(None);
                    }
                }
            }

            skip_leading_blank_lines(buf);
            if buf.is_empty() {
                return Ok(None);
            }

            if self.banner_pending {
                let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
                    return Ok(None);
                };
                let line = String::from_utf8_lossy(&buf[..newline])
                    .trim_end_matches('\r')
                    .to_string();
                self.banner_pending = false;
                if let Some(rest) = line.strip_prefix(BANNER_PREFIX) {
                    buf.advance(newline + 1);
                    let version = rest.trim_start_matches('/').trim().to_string();
                    return Ok(Some(Frame::Banner(version)));
                }
            }

            return match find_block_end(buf) {
                Some(end) => {
                    let block = buf.split_to(end);
                    Ok(Some(parse_block(&block)))
                }
                None if buf.len() > self.max_block_size => {
                    let size = buf.len();
                    let keep = size.min(3);
                    buf.advance(size - keep);
                    self.discarding = true;
                    Ok(Some(Frame::Malformed(format!(
                        "block exceeds {} bytes, discarding",
                        self.max_block_size
                    ))))
                }
                None => Ok(None),
            };
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.iter().all(|b| b.is_ascii_whitespace()) {
            buf.clear();
            return Ok(None);
        }
        let size = buf.len();
        buf.clear();
        Ok(Some(Frame::Malformed(format!(
            "connection closed inside a block ({} bytes pending)",
            size
        ))))
    }
}

impl Encoder<Action> for AmiCodec {
    type Error = io::Error;

    fn encode(&mut self, action: Action, dst: &mut BytesMut) -> Result<(), io::Error> {
        if let Some(field) = action.framing_violation() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("line break in action field '{}'", field),
            ));
        }
        dst.extend_from_slice(action.to_wire_format().as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut AmiCodec, data: &str) -> Vec<Frame> {
        let mut buf = BytesMut::from(data);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_banner_then_response() {
        let mut codec = AmiCodec::new();
        let frames = decode_all(
            &mut codec,
            "Asterisk Call Manager/5.0.1\r\nResponse: Success\r\nMessage: Authentication accepted\r\n\r\n",
        );
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Banner(v) if v == "5.0.1"));
        match &frames[1] {
            Frame::Response(r) => {
                assert!(r.is_success());
                assert_eq!(r.message(), Some("Authentication accepted"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_event_with_bare_newlines() {
        let mut codec = AmiCodec::new().without_banner();
        let frames = decode_all(
            &mut codec,
            "Event: Hangup\nUniqueid: 1700000000.7\nCause-txt: Normal Clearing\n\n",
        );
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Event(e) => {
                assert_eq!(e.name(), "Hangup");
                assert_eq!(e.unique_id(), Some("1700000000.7"));
                assert_eq!(e.header("Cause-txt"), Some("Normal Clearing"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_partial_block_waits_for_terminator() {
        let mut codec = AmiCodec::new().without_banner();
        let mut buf = BytesMut::from("Response: Success\r\nPing: Pong\r\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\r\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Response(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_value_may_contain_colons() {
        let mut codec = AmiCodec::new().without_banner();
        let frames = decode_all(
            &mut codec,
            "Event: VarSet\r\nVariable: CDR(recordingfile)\r\nValue: /var/spool/rec:1.wav\r\n\r\n",
        );
        match &frames[0] {
            Frame::Event(e) => assert_eq!(e.header("Value"), Some("/var/spool/rec:1.wav")),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_malformed_block_does_not_stop_stream() {
        let mut codec = AmiCodec::new().without_banner();
        let frames = decode_all(
            &mut codec,
            "garbage without colon\r\nEvent: Foo\r\n\r\nFoo: bar\r\n\r\nEvent: Hangup\r\nUniqueid: 1.1\r\n\r\n",
        );
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], Frame::Malformed(_)));
        assert!(matches!(frames[1], Frame::Malformed(_)));
        assert!(matches!(&frames[2], Frame::Event(e) if e.name() == "Hangup"));
    }

    #[test]
    fn test_follows_keeps_output_lines() {
        let mut codec = AmiCodec::new().without_banner();
        let frames = decode_all(
            &mut codec,
            "Response: Follows\r\nPrivilege: Command\r\nCore uptime 5 days\r\n--END COMMAND--\r\n\r\n",
        );
        match &frames[0] {
            Frame::Response(r) => {
                assert!(r.is_success());
                assert_eq!(r.output().len(), 2);
                assert_eq!(r.output()[1], "--END COMMAND--");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_oversized_block_is_discarded() {
        let mut codec = AmiCodec::new().without_banner().with_max_block_size(32);
        let mut buf = BytesMut::from("Event: Big\r\nPayload: ");
        buf.extend_from_slice(&[b'x'; 64]);

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Malformed(_))
        ));
        buf.extend_from_slice(b"xxxx\r\n\r\nResponse: Success\r\n\r\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Response(_))
        ));
    }

    #[test]
    fn test_eof_inside_block() {
        let mut codec = AmiCodec::new().without_banner();
        let mut buf = BytesMut::from("Event: Hangup\r\nUniq");
        assert!(matches!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(Frame::Malformed(_))
        ));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_action() {
        let mut codec = AmiCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(Action::ping().with_action_id("7"), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], b"Action: Ping\r\nActionID: 7\r\n\r\n");
    }

    #[test]
    fn test_encode_rejects_line_breaks() {
        let mut codec = AmiCodec::new();
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Action::new("Originate").param("Channel", "a\nb"), &mut dst)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn test_framed_read_across_split_reads() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let io = tokio_test::io::Builder::new()
            .read(b"Asterisk Call Manager/5.0.1\r\nEvent: Newchannel\r\nUnique")
            .read(b"id: 1.1\r\n\r\nbogus line\r\n\r\n")
            .read(b"Response: Success\r\nPing: Pong\r\n\r\n")
            .build();
        let frames: Vec<Frame> = FramedRead::new(io, AmiCodec::new())
            .map(|frame| frame.unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 4);
        assert!(matches!(&frames[0], Frame::Banner(_)));
        assert!(matches!(&frames[1], Frame::Event(e) if e.unique_id() == Some("1.1")));
        assert!(matches!(&frames[2], Frame::Malformed(_)));
        assert!(matches!(&frames[3], Frame::Response(r) if r.attribute("Ping") == Some("Pong")));
    }
}
