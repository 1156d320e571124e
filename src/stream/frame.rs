//! CRLF frame assembly for the streaming response body.
//!
//! The feed sends one JSON document per CRLF-terminated line and interleaves
//! blank keep-alive lines. [`FrameAssembler`] buffers partial lines across
//! chunk boundaries and yields decoded messages in arrival order.

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::stream::proto::Message;

const FRAME_DELIMITER: &[u8] = b"\r\n";

/// Largest frame [`FrameAssembler::new`] buffers before discarding it.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Accumulates body chunks and splits them into decoded messages.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    /// Offset up to which `buffer` is known to contain no delimiter.
    scanned: usize,
    max_frame_len: usize,
    /// Set while skipping the tail of an oversized frame up to its delimiter.
    discarding: bool,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames longer than `max_frame_len` bytes are dropped with a `debug!`
    /// event instead of being buffered until their delimiter arrives.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_frame_len: max_frame_len.max(1),
            discarding: false,
        }
    }

    /// Appends `chunk` and returns an iterator over the messages it completes.
    ///
    /// Frames that are not pulled from the iterator stay buffered and are
    /// yielded first by the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames { assembler: self }
    }

    /// Bytes held for a frame whose delimiter has not arrived yet.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.discarding = false;
    }

    fn next_frame(&mut self) -> Option<BytesMut> {
        loop {
            // A delimiter may straddle the previous scan boundary.
            let start = self.scanned.saturating_sub(FRAME_DELIMITER.len() - 1);
            match find_delimiter(&self.buffer[start..]) {
                Some(position) => {
                    let mut frame =
                        self.buffer.split_to(start + position + FRAME_DELIMITER.len());
                    frame.truncate(frame.len() - FRAME_DELIMITER.len());
                    self.scanned = 0;
                    if std::mem::take(&mut self.discarding) {
                        continue;
                    }
                    if frame.len() > self.max_frame_len {
                        debug!(
                            event = "stream_frame_oversized",
                            len = frame.len(),
                            max = self.max_frame_len
                        );
                        continue;
                    }
                    return Some(frame);
                }
                None => {
                    if self.buffer.len() > self.max_frame_len {
                        if !self.discarding {
                            debug!(
                                event = "stream_frame_oversized",
                                len = self.buffer.len(),
                                max = self.max_frame_len
                            );
                        }
                        // Keep a possible leading half of the delimiter.
                        let keep = FRAME_DELIMITER.len() - 1;
                        self.buffer.advance(self.buffer.len() - keep);
                        self.discarding = true;
                        self.scanned = 0;
                    } else {
                        self.scanned = self.buffer.len();
                    }
                    return None;
                }
            }
        }
    }
}

/// Lazy, in-order sequence of messages completed by one [`FrameAssembler::feed`].
#[derive(Debug)]
pub struct Frames<'a> {
    assembler: &'a mut FrameAssembler,
}

impl Iterator for Frames<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        while let Some(mut frame) = self.assembler.next_frame() {
            let leading = frame
                .iter()
                .position(|byte| !byte.is_ascii_whitespace())
                .unwrap_or(frame.len());
            frame.advance(leading);
            let trailing = frame
                .iter()
                .rposition(|byte| !byte.is_ascii_whitespace())
                .map_or(0, |last| last + 1);
            frame.truncate(trailing);

            if frame.is_empty() {
                debug!(event = "stream_keep_alive");
                continue;
            }

            match Message::from_slice(&frame) {
                Ok(message) => return Some(message),
                Err(err) => {
                    debug!(
                        event = "stream_frame_dropped",
                        len = frame.len(),
                        error = %err
                    );
                }
            }
        }
        None
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::FrameAssembler;

    const FEED: &[u8] =
        b"{\"id\":1}\r\n\r\n  \r\n{\"id\":2,\"text\":\"a\\r\\nb\"}\r\nnot json\r\n{\"id\":3}\r\n{\"id\":";

    fn collect(assembler: &mut FrameAssembler, chunk: &[u8]) -> Vec<Value> {
        assembler.feed(chunk).map(|message| message.into_value()).collect()
    }

    fn expected() -> Vec<Value> {
        vec![
            json!({"id": 1}),
            json!({"id": 2, "text": "a\r\nb"}),
            json!({"id": 3}),
        ]
    }

    #[test]
    fn contiguous_feed_yields_messages_in_order() {
        let mut assembler = FrameAssembler::new();
        assert_eq!(collect(&mut assembler, FEED), expected());
        assert_eq!(assembler.buffered_len(), b"{\"id\":".len());
    }

    #[test]
    fn every_split_point_matches_contiguous_feed() {
        for split in 0..=FEED.len() {
            let mut assembler = FrameAssembler::new();
            let mut messages = collect(&mut assembler, &FEED[..split]);
            messages.extend(collect(&mut assembler, &FEED[split..]));
            assert_eq!(messages, expected(), "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time_matches_contiguous_feed() {
        let mut assembler = FrameAssembler::new();
        let mut messages = Vec::new();
        for byte in FEED {
            messages.extend(collect(&mut assembler, std::slice::from_ref(byte)));
        }
        assert_eq!(messages, expected());
    }

    #[test]
    fn whitespace_lines_yield_nothing_and_keep_framing() {
        let mut assembler = FrameAssembler::new();
        assert!(collect(&mut assembler, b"\r\n").is_empty());
        assert!(collect(&mut assembler, b" \t \r\n").is_empty());
        assert!(collect(&mut assembler, b"{\"a\":").is_empty());
        assert!(collect(&mut assembler, b"\r\n").is_empty());
        assert_eq!(assembler.buffered_len(), 0);
        assert_eq!(collect(&mut assembler, b"{\"b\":2}\r\n"), vec![json!({"b": 2})]);
    }

    #[test]
    fn unpulled_frames_are_yielded_by_next_feed() {
        let mut assembler = FrameAssembler::new();
        let first = assembler.feed(b"{\"id\":1}\r\n{\"id\":2}\r\n").next();
        assert_eq!(first.map(|m| m.into_value()), Some(json!({"id": 1})));

        assert_eq!(
            collect(&mut assembler, b"{\"id\":3}\r\n"),
            vec![json!({"id": 2}), json!({"id": 3})]
        );
    }

    #[test]
    fn lone_line_feed_is_not_a_delimiter() {
        let mut assembler = FrameAssembler::new();
        assert!(collect(&mut assembler, b"{\"id\":1}\n").is_empty());
        assert_eq!(collect(&mut assembler, b"\r\n"), vec![json!({"id": 1})]);
    }

    #[test]
    fn oversized_partial_frame_is_discarded_through_its_delimiter() {
        let mut assembler = FrameAssembler::with_max_frame_len(16);
        assert_eq!(
            collect(&mut assembler, b"{\"id\":1}\r\n{\"text\":\""),
            vec![json!({"id": 1})]
        );
        for _ in 0..64 {
            assert!(collect(&mut assembler, b"xxxxxxxxxxxxxxxx").is_empty());
            assert!(assembler.buffered_len() <= 16);
        }
        assert_eq!(
            collect(&mut assembler, b"\"}\r\n{\"id\":2}\r\n"),
            vec![json!({"id": 2})]
        );
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn oversized_frame_delimiter_split_at_cap_is_still_found() {
        let mut assembler = FrameAssembler::with_max_frame_len(4);
        assert!(collect(&mut assembler, b"\"abcdef\"\r").is_empty());
        assert_eq!(assembler.buffered_len(), 1);
        assert_eq!(collect(&mut assembler, b"\n7\r\n"), vec![json!(7)]);
    }

    #[test]
    fn complete_oversized_frame_is_dropped() {
        let mut assembler = FrameAssembler::with_max_frame_len(8);
        assert_eq!(
            collect(&mut assembler, b"{\"text\":\"too long\"}\r\n{\"id\":3}\r\n"),
            vec![json!({"id": 3})]
        );
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut assembler = FrameAssembler::new();
        assert!(collect(&mut assembler, b"{\"id\":").is_empty());
        assembler.reset();
        assert_eq!(assembler.buffered_len(), 0);
        assert_eq!(collect(&mut assembler, b"{\"id\":9}\r\n"), vec![json!({"id": 9})]);
    }
}
