use crate::error::MllpError;
use crate::{CARRIAGE_RETURN, END_BLOCK, START_BLOCK};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a single frame payload (1 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Decoded unit of MLLP traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete, non-empty payload
    Message(Bytes),
    /// An empty frame used as a no-op probe
    KeepAlive,
    /// A frame exceeded the maximum length before its terminator arrived;
    /// `buffered` bytes were dropped and the remainder of the frame will be
    /// skipped
    Oversized { buffered: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for a start-of-block byte
    Seeking,
    /// Inside a frame; `scanned` bytes of the buffer hold no terminator
    InFrame { scanned: usize },
    /// Skipping the tail of an oversized frame
    Discarding,
}

#[derive(Debug, Clone)]
pub struct MllpCodec {
    max_frame_length: usize,
    state: State,
}

impl MllpCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            state: State::Seeking,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of the first `<FS><CR>` at or after `from`.
fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    (from..buf.len() - 1).find(|&i| buf[i] == END_BLOCK && buf[i + 1] == CARRIAGE_RETURN)
}

/// Drop everything except a trailing `<FS>` that may be the first half of a
/// terminator split across reads.
fn drain_keeping_partial_terminator(src: &mut BytesMut) {
    let keep = usize::from(src.last() == Some(&END_BLOCK));
    let drop = src.len() - keep;
    src.advance(drop);
}

impl Decoder for MllpCodec {
    type Item = Frame;
    type Error = MllpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MllpError> {
        loop {
            match self.state {
                State::Seeking => match src.iter().position(|b| *b == START_BLOCK) {
                    Some(start) => {
                        if start > 0 {
                            tracing::debug!(bytes = start, "Discarding bytes outside MLLP frame");
                        }
                        src.advance(start + 1);
                        self.state = State::InFrame { scanned: 0 };
                    }
                    None => {
                        if !src.is_empty() {
                            tracing::debug!(
                                bytes = src.len(),
                                "Discarding bytes outside MLLP frame"
                            );
                            src.clear();
                        }
                        return Ok(None);
                    }
                },
                State::InFrame { scanned } => {
                    if let Some(end) = find_terminator(&src[..], scanned) {
                        if end > self.max_frame_length {
                            src.advance(end + 2);
                            self.state = State::Seeking;
                            return Ok(Some(Frame::Oversized { buffered: end }));
                        }
                        let payload = src.split_to(end).freeze();
                        src.advance(2);
                        self.state = State::Seeking;
                        if payload.is_empty() {
                            return Ok(Some(Frame::KeepAlive));
                        }
                        return Ok(Some(Frame::Message(payload)));
                    }

                    // A trailing FS may be the first half of the terminator.
                    let payload_len = src.len() - usize::from(src.last() == Some(&END_BLOCK));
                    if payload_len > self.max_frame_length {
                        let buffered = src.len();
                        drain_keeping_partial_terminator(src);
                        self.state = State::Discarding;
                        return Ok(Some(Frame::Oversized { buffered }));
                    }

                    // Resume scanning where the previous pass stopped; the last
                    // byte may be the first half of a terminator.
                    self.state = State::InFrame {
                        scanned: src.len().saturating_sub(1),
                    };
                    src.reserve(1024);
                    return Ok(None);
                }
                State::Discarding => match find_terminator(&src[..], 0) {
                    Some(end) => {
                        src.advance(end + 2);
                        self.state = State::Seeking;
                    }
                    None => {
                        drain_keeping_partial_terminator(src);
                        return Ok(None);
                    }
                },
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MllpError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match self.state {
            State::InFrame { .. } => {
                let buffered = src.len();
                src.clear();
                self.state = State::Seeking;
                Err(MllpError::IncompleteFrame { buffered })
            }
            _ => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for MllpCodec {
    type Error = MllpError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), MllpError> {
        let payload = item.as_ref();
        if payload.contains(&START_BLOCK) {
            return Err(MllpError::InvalidPayload(
                "payload contains a start-of-block byte".into(),
            ));
        }
        if find_terminator(payload, 0).is_some() {
            return Err(MllpError::InvalidPayload(
                "payload contains an end-of-block sequence".into(),
            ));
        }

        dst.reserve(payload.len() + 3);
        dst.put_u8(START_BLOCK);
        dst.put_slice(payload);
        dst.put_u8(END_BLOCK);
        dst.put_u8(CARRIAGE_RETURN);
        Ok(())
    }
}

/// Frame a payload without going through a `Framed` transport.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, MllpError> {
    let mut dst = BytesMut::with_capacity(payload.len() + 3);
    MllpCodec::new().encode(payload, &mut dst)?;
    Ok(dst.freeze())
}
