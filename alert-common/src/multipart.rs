//! Incremental splitting of a `multipart/*` response body into frames.
//!
//! The alert stream never ends, so the splitter works on whatever chunks the transport hands
//! over: `feed` appends bytes, and iterating yields every frame completed so far. Network reads do
//! not line up with part boundaries, so any delimiter, header line or body may arrive in pieces.
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// One boundary-delimited part of the stream, not yet validated as markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    content_type: Option<String>,
    body: Bytes,
}

impl Frame {
    pub fn new(content_type: Option<String>, body: Bytes) -> Self {
        Self { content_type, body }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitError {
    #[error("frame exceeds the maximum size of {limit} bytes")]
    FrameTooLarge { limit: usize },
}

#[derive(Debug)]
enum State {
    /// Discarding bytes until the next delimiter.
    Seeking,
    /// A delimiter was consumed, the rest of its line decides what it was.
    DelimiterLine,
    /// Reading part headers up to the blank line.
    Headers {
        content_type: Option<String>,
        content_length: Option<usize>,
        consumed: usize,
    },
    /// Reading the part body.
    Body {
        content_type: Option<String>,
        content_length: Option<usize>,
    },
}

/// Splits a multipart byte stream into `Frame`s, in arrival order.
///
/// Memory use is bounded by `max_frame_size`: a part that grows beyond it without completing is
/// reported once as `SplitError::FrameTooLarge`, and the splitter then skips ahead to the next
/// delimiter instead of giving up on the stream.
#[derive(Debug)]
pub struct FrameSplitter {
    delimiter: Vec<u8>,
    max_frame_size: usize,
    buffer: BytesMut,
    state: State,
}

impl FrameSplitter {
    pub fn new(boundary: &str, max_frame_size: usize) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());

        Self {
            delimiter,
            max_frame_size,
            buffer: BytesMut::new(),
            state: State::Seeking,
        }
    }

    /// Append a chunk read from the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes currently held back waiting for more input.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn too_large(&mut self) -> Option<Result<Frame, SplitError>> {
        self.state = State::Seeking;
        Some(Err(SplitError::FrameTooLarge {
            limit: self.max_frame_size,
        }))
    }

    /// Returns `false` when more input is needed.
    fn seek_delimiter(&mut self) -> bool {
        match find(&self.buffer, &self.delimiter) {
            Some(index) => {
                self.buffer.advance(index + self.delimiter.len());
                self.state = State::DelimiterLine;
                true
            }
            None => {
                // Keep enough of the tail to complete a delimiter split across reads.
                let keep = self.delimiter.len() - 1;
                if self.buffer.len() > keep {
                    let discard = self.buffer.len() - keep;
                    self.buffer.advance(discard);
                }
                false
            }
        }
    }

    /// Returns `false` when more input is needed.
    fn read_delimiter_line(&mut self) -> bool {
        if self.buffer.starts_with(b"--") {
            // Close delimiter: whatever follows is epilogue until the next delimiter.
            self.buffer.advance(2);
            self.state = State::Seeking;
            return true;
        }
        if self.buffer.as_ref() == b"-" {
            return false;
        }

        for (index, byte) in self.buffer.iter().enumerate() {
            match byte {
                b' ' | b'\t' | b'\r' => continue,
                b'\n' => {
                    self.buffer.advance(index + 1);
                    self.state = State::Headers {
                        content_type: None,
                        content_length: None,
                        consumed: 0,
                    };
                    return true;
                }
                _ => {
                    // The boundary was a prefix of something else, keep scanning.
                    self.state = State::Seeking;
                    return true;
                }
            }
        }

        if self.buffer.len() > self.max_frame_size {
            self.state = State::Seeking;
            return true;
        }
        false
    }
}

impl Iterator for FrameSplitter {
    type Item = Result<Frame, SplitError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                State::Seeking => {
                    if !self.seek_delimiter() {
                        return None;
                    }
                }
                State::DelimiterLine => {
                    if !self.read_delimiter_line() {
                        return None;
                    }
                }
                State::Headers {
                    content_type,
                    content_length,
                    consumed,
                } => {
                    let budget = self.max_frame_size.saturating_sub(*consumed);
                    let Some(eol) = self.buffer.iter().position(|b| *b == b'\n') else {
                        if self.buffer.len() > budget {
                            return self.too_large();
                        }
                        return None;
                    };
                    if eol + 1 > budget {
                        return self.too_large();
                    }

                    let line = trim_line_end(&self.buffer[..eol]);
                    if line.is_empty() {
                        self.buffer.advance(eol + 1);
                        self.state = State::Body {
                            content_type: content_type.take(),
                            content_length: content_length.take(),
                        };
                        continue;
                    }

                    match parse_header(line) {
                        Some((name, value)) => {
                            if name.eq_ignore_ascii_case("content-type") {
                                *content_type = Some(value.to_owned());
                            } else if name.eq_ignore_ascii_case("content-length") {
                                *content_length = value.parse().ok();
                            }
                            *consumed += eol + 1;
                            self.buffer.advance(eol + 1);
                        }
                        None => {
                            // No header block at all, the body starts right after the delimiter.
                            self.state = State::Body {
                                content_type: content_type.take(),
                                content_length: content_length.take(),
                            };
                        }
                    }
                }
                State::Body {
                    content_type,
                    content_length: Some(length),
                } => {
                    let length = *length;
                    if length > self.max_frame_size {
                        return self.too_large();
                    }

                    // An overstated length must not swallow the next part: a delimiter line inside
                    // the declared body ends it early.
                    let window = self.buffer.len().min(length + self.delimiter.len());
                    let early_end = find_delimiter_line(&self.buffer[..window], &self.delimiter)
                        .filter(|index| *index < length);
                    if let Some(index) = early_end {
                        let content_type = content_type.take();
                        let body = self.buffer.split_to(index).freeze();
                        let body = body.slice(..trim_line_end(&body).len());
                        self.state = State::Seeking;
                        return Some(Ok(Frame::new(content_type, body)));
                    }

                    if self.buffer.len() < length {
                        return None;
                    }
                    if self.buffer.len() < length + self.delimiter.len()
                        && ends_with_partial_delimiter(&self.buffer[..length], &self.delimiter)
                    {
                        return None;
                    }

                    let content_type = content_type.take();
                    let body = self.buffer.split_to(length).freeze();
                    self.state = State::Seeking;
                    return Some(Ok(Frame::new(content_type, body)));
                }
                State::Body {
                    content_type,
                    content_length: None,
                } => {
                    let Some(index) = find(&self.buffer, &self.delimiter) else {
                        // Even if a delimiter starts in the last bytes, the body is already longer
                        // than allowed once we hold this much.
                        if self.buffer.len() > self.max_frame_size + self.delimiter.len() + 1 {
                            return self.too_large();
                        }
                        return None;
                    };

                    let content_type = content_type.take();
                    let body = self.buffer.split_to(index).freeze();
                    let body = body.slice(..trim_line_end(&body).len());
                    if body.len() > self.max_frame_size {
                        return self.too_large();
                    }
                    self.state = State::Seeking;
                    return Some(Ok(Frame::new(content_type, body)));
                }
            }
        }
    }
}

/// Extract the boundary parameter of a `multipart/*` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let mime = parts.next()?.trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }

    parts.find_map(|parameter| {
        let (name, value) = parameter.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_owned())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// First delimiter that starts a line, i.e. sits at the start of `data` or right after a `\n`.
fn find_delimiter_line(data: &[u8], delimiter: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(offset) = find(&data[from..], delimiter) {
        let index = from + offset;
        if index == 0 || data[index - 1] == b'\n' {
            return Some(index);
        }
        from = index + 1;
    }
    None
}

/// Whether `data` ends with a line break followed by the start of a delimiter.
fn ends_with_partial_delimiter(data: &[u8], delimiter: &[u8]) -> bool {
    (1..delimiter.len()).any(|taken| {
        data.len() > taken
            && data.ends_with(&delimiter[..taken])
            && data[data.len() - taken - 1] == b'\n'
    })
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_header(line: &[u8]) -> Option<(&str, &str)> {
    let line = std::str::from_utf8(line).ok()?;
    if line.starts_with('<') || line.starts_with('{') {
        return None;
    }
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some((name, value.trim()))
}
