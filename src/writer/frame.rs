//! Reconstruction of an HTTP/1.x response head from a raw byte stream.

use http::header::{HeaderName, HeaderValue};
use http::StatusCode;

/// Largest response head buffered before the interceptor gives up on it.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Interceptor progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// No complete status line yet.
    AwaitingStatusLine,
    /// Status line seen, waiting for the blank line.
    BufferingHeaders,
    /// Head emitted, no body bytes yet.
    Committed,
    /// Body bytes are being forwarded.
    Streaming,
}

/// Line terminator observed at the end of the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    CrLf,
    Lf,
}

impl Delimiter {
    fn as_bytes(&self) -> &'static [u8] {
        match self {
            Delimiter::CrLf => b"\r\n",
            Delimiter::Lf => b"\n",
        }
    }
}

/// A complete response head, split off the buffered bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    /// Status line without its terminator.
    pub status_line: Vec<u8>,
    /// Header lines including their terminators.
    pub fields: Vec<u8>,
    /// Bytes after the blank line.
    pub body: Vec<u8>,
}

impl HeaderBlock {
    pub fn status_code(&self) -> Option<StatusCode> {
        parse_status_code(&self.status_line)
    }

    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        parse_header_fields(&self.fields)
    }
}

/// Accumulates pre-commit bytes until the header block is complete.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    delimiter: Option<Delimiter>,
    /// Offset just past the status line terminator.
    status_line_end: usize,
    /// Offset from which the blank line search resumes.
    scan_from: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delimiter(&self) -> Option<Delimiter> {
        self.delimiter
    }

    pub fn state(&self) -> FrameState {
        match self.delimiter {
            None => FrameState::AwaitingStatusLine,
            Some(_) => FrameState::BufferingHeaders,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append bytes; returns the head once the blank line was seen.
    pub fn push(&mut self, bytes: &[u8]) -> Option<HeaderBlock> {
        self.buf.extend_from_slice(bytes);

        let delimiter = match self.delimiter {
            Some(d) => d,
            None => {
                let lf = self.buf.iter().position(|b| *b == b'\n')?;
                let d = if lf > 0 && self.buf[lf - 1] == b'\r' {
                    Delimiter::CrLf
                } else {
                    Delimiter::Lf
                };
                self.delimiter = Some(d);
                self.status_line_end = lf + 1;
                // The blank line may directly follow the status line.
                self.scan_from = self.status_line_end - d.as_bytes().len();
                d
            }
        };

        let delim = delimiter.as_bytes();
        let pattern: Vec<u8> = [delim, delim].concat();

        let found = find(&self.buf[self.scan_from..], &pattern).map(|i| i + self.scan_from);
        match found {
            Some(pos) => Some(self.split(pos, delim.len())),
            None => {
                // Keep a partial match at the end searchable.
                self.scan_from = self
                    .buf
                    .len()
                    .saturating_sub(pattern.len() - 1)
                    .max(self.scan_from);
                None
            }
        }
    }

    /// Give up waiting for the blank line and take whatever was buffered.
    pub fn take(&mut self) -> HeaderBlock {
        let buf = std::mem::take(&mut self.buf);
        let block = match self.delimiter {
            Some(d) => {
                let dlen = d.as_bytes().len();
                HeaderBlock {
                    status_line: buf[..self.status_line_end - dlen].to_vec(),
                    fields: buf[self.status_line_end..].to_vec(),
                    body: Vec::new(),
                }
            }
            None => HeaderBlock {
                status_line: buf,
                ..Default::default()
            },
        };
        *self = Self::default();
        block
    }

    fn split(&mut self, blank_at: usize, dlen: usize) -> HeaderBlock {
        let buf = std::mem::take(&mut self.buf);
        let status_line = buf[..self.status_line_end - dlen].to_vec();
        let fields_end = blank_at + dlen;
        let fields = if fields_end > self.status_line_end {
            buf[self.status_line_end..fields_end].to_vec()
        } else {
            Vec::new()
        };
        let body = buf[blank_at + 2 * dlen..].to_vec();
        *self = Self::default();
        HeaderBlock {
            status_line,
            fields,
            body,
        }
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Status code from bytes 9..12 of the status line (`HTTP/1.1 200 OK`).
pub fn parse_status_code(status_line: &[u8]) -> Option<StatusCode> {
    let digits = status_line.get(9..12)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    StatusCode::from_bytes(digits).ok()
}

/// Parse header lines best effort.
///
/// Lines without a colon or with an invalid name/value are skipped. Lines
/// starting with whitespace continue the previous field.
pub fn parse_header_fields(fields: &[u8]) -> Vec<(HeaderName, HeaderValue)> {
    let mut raw: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    // Whether the last line produced a field that may be continued.
    let mut can_continue = false;

    for line in fields.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            can_continue = false;
            continue;
        }

        if line[0] == b' ' || line[0] == b'\t' {
            if can_continue {
                if let Some((_, value)) = raw.last_mut() {
                    value.push(b' ');
                    value.extend_from_slice(trim(line));
                }
            }
            continue;
        }

        can_continue = false;
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            continue;
        };
        let name = trim(&line[..colon]);
        if name.is_empty() || name.len() != line[..colon].len() {
            continue;
        }
        raw.push((name.to_vec(), trim(&line[colon + 1..]).to_vec()));
        can_continue = true;
    }

    raw.into_iter()
        .filter_map(|(name, value)| {
            let name = HeaderName::from_bytes(&name).ok()?;
            let value = HeaderValue::from_bytes(&value).ok()?;
            Some((name, value))
        })
        .collect()
}
