//! Incremental STOMP frame decoder.
//!
//! A single transport message may carry several frames, a partial frame, or
//! only heart-beats. The decoder buffers input until a whole frame is
//! available.

use super::frame::{unescape_header, Command, Frame};
use super::{headers, FrameError};

/// Largest frame accepted from the broker, headers included.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// One decoded unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Frame(Frame),
    HeartBeat,
}

/// Streaming decoder. Feed it transport payloads with [`FrameDecoder::push`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True when the partial frame held back has outgrown
    /// [`MAX_FRAME_SIZE`]. The stream cannot be resynchronised after that.
    pub fn is_oversized(&self) -> bool {
        self.buf.len() > MAX_FRAME_SIZE
    }

    /// Append `chunk` and return every complete unit now available.
    ///
    /// A malformed frame yields an `Err` entry and is skipped up to its NUL
    /// terminator; decoding continues with the next frame.
    pub fn push(&mut self, chunk: &str) -> Vec<Result<Incoming, FrameError>> {
        self.buf.extend_from_slice(chunk.as_bytes());
        let mut out = Vec::new();

        loop {
            match self.buf.first() {
                None => break,
                Some(b'\n') => {
                    self.buf.drain(..1);
                    out.push(Ok(Incoming::HeartBeat));
                    continue;
                }
                Some(b'\r') => match self.buf.get(1) {
                    None => break,
                    Some(b'\n') => {
                        self.buf.drain(..2);
                        out.push(Ok(Incoming::HeartBeat));
                        continue;
                    }
                    Some(_) => {}
                },
                Some(_) => {}
            }

            let Some((head_len, body_start)) = find_header_end(&self.buf) else {
                break;
            };

            let head = match parse_head(&self.buf[..head_len]) {
                Ok(head) => head,
                Err(e) => {
                    if !self.skip_to_nul(body_start) {
                        break;
                    }
                    out.push(Err(e));
                    continue;
                }
            };

            let content_length = match head.content_length() {
                Ok(len) => len,
                Err(e) => {
                    if !self.skip_to_nul(body_start) {
                        break;
                    }
                    out.push(Err(e));
                    continue;
                }
            };

            let (body_end, frame_end) = match content_length {
                Some(len) => {
                    let Some(body_end) = body_start.checked_add(len) else {
                        if !self.skip_to_nul(body_start) {
                            break;
                        }
                        out.push(Err(FrameError::InvalidContentLength(len.to_string())));
                        continue;
                    };
                    if self.buf.len() <= body_end {
                        break;
                    }
                    if self.buf[body_end] != 0 {
                        if !self.skip_to_nul(body_end) {
                            break;
                        }
                        out.push(Err(FrameError::MissingTerminator));
                        continue;
                    }
                    (body_end, body_end + 1)
                }
                None => match find_nul(&self.buf, body_start) {
                    Some(nul) => (nul, nul + 1),
                    None => break,
                },
            };

            let body = String::from_utf8(self.buf[body_start..body_end].to_vec());
            self.buf.drain(..frame_end);

            match body {
                Ok(body) => out.push(Ok(Incoming::Frame(Frame {
                    command: head.command,
                    headers: head.headers,
                    body,
                }))),
                Err(_) => out.push(Err(FrameError::InvalidUtf8)),
            }
        }

        out
    }

    /// Discard through the next NUL at or after `from`. Returns false if the
    /// terminator has not arrived yet (the buffer is left untouched).
    fn skip_to_nul(&mut self, from: usize) -> bool {
        match find_nul(&self.buf, from) {
            Some(nul) => {
                self.buf.drain(..=nul);
                true
            }
            None => false,
        }
    }
}

struct Head {
    command: Command,
    headers: Vec<(String, String)>,
}

impl Head {
    fn content_length(&self) -> Result<Option<usize>, FrameError> {
        self.headers
            .iter()
            .find(|(k, _)| k == headers::CONTENT_LENGTH)
            .map(|(_, v)| match v.trim().parse::<usize>() {
                Ok(len) if len <= MAX_FRAME_SIZE => Ok(len),
                _ => Err(FrameError::InvalidContentLength(v.clone())),
            })
            .transpose()
    }
}

fn parse_head(raw: &[u8]) -> Result<Head, FrameError> {
    let text = std::str::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8)?;
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let command = Command::parse(lines.next().unwrap_or_default())?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(FrameError::MalformedHeader(line.to_string()));
        };
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    Ok(Head { command, headers })
}

/// Position of the blank line that ends the headers: returns the length of
/// the head (command + header lines) and the offset of the body.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, i + 2));
    let crlf = buf.windows(3).position(|w| w == b"\n\r\n").map(|i| (i, i + 3));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find_nul(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == 0)
        .map(|i| from + i)
}
