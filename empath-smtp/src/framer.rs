//! Splits raw connection bytes into protocol frames: RFC 5321 command/data
//! lines, and RFC 3030 `BDAT` byte chunks.
//!
//! Lines are decoded as ISO-8859-1 (Latin-1): every byte 0-255 maps directly
//! to the Unicode codepoint of the same value, so decoding never fails and
//! never loses information, unlike strict UTF-8 decoding of arbitrary
//! client-supplied octets. `BDAT` chunk payloads are handed back as raw
//! bytes and never run through line parsing at all.

use crate::error::FramingError;

/// Maximum length of a command line outside DATA (RFC 5321 Section 4.5.3.1.4).
const MAX_COMMAND_LINE: usize = 512;

/// Maximum length of a line while accumulating a message body (RFC 5321
/// Section 4.5.3.1.6 allows up to 998 octets plus CRLF).
const MAX_DATA_LINE: usize = 998;

/// Largest `BDAT` chunk this server accepts in one go, regardless of what the
/// client declares. Guards against a single declared chunk size forcing an
/// unbounded buffer before backpressure ever gets a chance to act.
const MAX_BDAT_CHUNK: usize = 32 * 1024 * 1024;

/// A single decoded unit of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A CRLF-terminated line, decoded from ISO-8859-1 (the terminator is
    /// stripped).
    Line(String),
    /// A fixed number of raw bytes making up (part of) a `BDAT` chunk.
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Line,
    Bytes { remaining: usize },
}

/// Incremental framer sitting between the raw connection and the session.
///
/// Feed it bytes as they arrive over the wire; it yields zero or more
/// complete [`Frame`]s per call, buffering anything incomplete for the next
/// `feed`.
#[derive(Debug)]
pub struct Framer {
    mode: Mode,
    buffer: Vec<u8>,
    in_data_mode: bool,
}

impl Default for Framer {
    fn default() -> Self {
        Self {
            mode: Mode::Line,
            buffer: Vec::new(),
            in_data_mode: false,
        }
    }
}

impl Framer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch line-length limits from command mode (512) to DATA mode (998);
    /// called once the session enters `Reading`.
    pub fn enter_data_mode(&mut self) {
        self.in_data_mode = true;
    }

    /// Switch back to command-mode line limits; called once `PostDot`
    /// completes or a transaction resets.
    pub fn exit_data_mode(&mut self) {
        self.in_data_mode = false;
    }

    /// Begin byte-mode framing for a `BDAT` chunk of `size` bytes.
    ///
    /// # Errors
    /// Returns [`FramingError::ChunkTooLarge`] if `size` exceeds the hard
    /// cap this server accepts for a single chunk.
    pub fn begin_bytes(&mut self, size: usize) -> Result<(), FramingError> {
        if size > MAX_BDAT_CHUNK {
            return Err(FramingError::ChunkTooLarge {
                size,
                limit: MAX_BDAT_CHUNK,
            });
        }
        self.mode = Mode::Bytes { remaining: size };
        Ok(())
    }

    /// Whether bytes are already buffered ahead of what's been framed, i.e.
    /// whether the client pipelined input. Used by the TLS Upgrade Manager
    /// to refuse `STARTTLS` when commands were sent ahead of the server's
    /// response (RFC 3207 Section 4.2).
    #[must_use]
    pub fn has_buffered_input(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Append newly-received bytes to the internal buffer without framing
    /// them yet. Pair with repeated [`Framer::next_frame`] calls so the
    /// caller can react to a frame (e.g. call [`Framer::begin_bytes`] after
    /// a `BDAT` command line) before the next frame is extracted from
    /// whatever arrived in the same read.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extract at most one complete frame from the buffer.
    ///
    /// # Errors
    /// Returns [`FramingError`] if a line or chunk exceeds the configured
    /// limit; the caller should reject the command and close or reset the
    /// connection rather than keep framing with a now out-of-sync buffer.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        match self.mode {
            Mode::Bytes { remaining } => {
                if self.buffer.len() < remaining {
                    return Ok(None);
                }
                let chunk: Vec<u8> = self.buffer.drain(..remaining).collect();
                self.mode = Mode::Line;
                Ok(Some(Frame::Bytes(chunk)))
            }
            Mode::Line => {
                let limit = self.line_limit();
                let Some(pos) = find_crlf(&self.buffer) else {
                    if self.buffer.len() > limit {
                        return Err(FramingError::LineTooLong { limit });
                    }
                    return Ok(None);
                };

                if pos > limit {
                    return Err(FramingError::LineTooLong { limit });
                }

                let full: Vec<u8> = self.buffer.drain(..pos + 2).collect();
                Ok(Some(Frame::Line(decode_latin1(&full[..pos]))))
            }
        }
    }

    /// Feed newly-received bytes and drain as many complete frames as
    /// possible in one pass, without reacting to any of them in between.
    ///
    /// This is a convenience for callers that don't need to call
    /// [`Framer::begin_bytes`] partway through (tests, mostly); a real
    /// session loop that can receive a `BDAT` command and its payload in the
    /// same read should use [`Framer::push`]/[`Framer::next_frame`] instead,
    /// reacting to each frame before asking for the next.
    ///
    /// # Errors
    /// See [`Framer::next_frame`].
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FramingError> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    const fn line_limit(&self) -> usize {
        if self.in_data_mode {
            MAX_DATA_LINE
        } else {
            MAX_COMMAND_LINE
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decode bytes as ISO-8859-1: every byte maps directly to the Unicode
/// codepoint of the same value. Always succeeds.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
