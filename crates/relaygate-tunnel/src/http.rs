//! Lightweight HTTP framing heuristics
//!
//! The tunnel never parses HTTP. It only needs to know, from the first bytes of a
//! stream, whether those bytes start a request and whether that request streams a
//! chunked body. Both questions are answered with a tri-state [`Answer`], because
//! the bytes seen so far may simply be too few to decide.
//!
//! [`HttpRequestBuffer`] accumulates raw bytes and hands out one complete request at
//! a time. It is a resynchronising splitter, not a message parser: bodies are framed
//! by `Content-Length` only and chunked bodies are not supported.

/// Result of inspecting a prefix of a byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Answer {
    /// The bytes cannot be what was asked about
    No,
    /// The bytes are a plausible prefix, but too short to decide
    CanBe,
    /// The bytes are definitely what was asked about
    Yes,
}

/// Request methods recognised at the start of a request line
const METHODS: [&[u8]; 9] = [
    b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"CONNECT", b"OPTIONS", b"TRACE", b"PATCH",
];

/// Supported protocol versions
const VERSIONS: [&[u8]; 2] = [b"HTTP/1.0", b"HTTP/1.1"];

const VERSION_LEN: usize = 8;

const TRANSFER_ENCODING: &[u8] = b"transfer-encoding";
const CONTENT_LENGTH: &[u8] = b"content-length";
const CHUNKED: &[u8] = b"chunked";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestLine {
    Invalid,
    Partial,
    /// Offset just past the line terminator
    Complete(usize),
}

fn scan_request_line(bytes: &[u8]) -> RequestLine {
    let Some(method) = METHODS
        .iter()
        .find(|m| bytes.len() > m.len() && bytes.starts_with(m) && bytes[m.len()] == b' ')
    else {
        return RequestLine::Invalid;
    };

    let target_start = method.len() + 1;
    let rest = &bytes[target_start..];
    if rest.is_empty() {
        return RequestLine::Invalid;
    }

    let mut target_len = None;
    for (i, &b) in rest.iter().enumerate() {
        if b == b' ' {
            target_len = Some(i);
            break;
        }
        if b < 0x21 || b == 0x7f {
            return RequestLine::Invalid;
        }
    }
    let Some(target_len) = target_len else {
        return RequestLine::Partial;
    };
    if target_len == 0 {
        return RequestLine::Invalid;
    }

    let version_start = target_start + target_len + 1;
    let version = &bytes[version_start..];
    if version.len() < VERSION_LEN {
        return if VERSIONS.iter().any(|v| v.starts_with(version)) {
            RequestLine::Partial
        } else {
            RequestLine::Invalid
        };
    }
    if !VERSIONS.contains(&&version[..VERSION_LEN]) {
        return RequestLine::Invalid;
    }

    let eol = version_start + VERSION_LEN;
    match (bytes.get(eol), bytes.get(eol + 1)) {
        (None, _) | (Some(b'\r'), None) => RequestLine::Partial,
        (Some(b'\n'), _) => RequestLine::Complete(eol + 1),
        (Some(b'\r'), Some(b'\n')) => RequestLine::Complete(eol + 2),
        _ => RequestLine::Invalid,
    }
}

/// Check whether `bytes` look like the start of an HTTP request
///
/// - [`Answer::Yes`]: a complete request line (method, target, supported version,
///   line terminator) is present.
/// - [`Answer::CanBe`]: the bytes start with a method, a space and at least one
///   target byte, and everything present is a valid request-line prefix.
/// - [`Answer::No`]: anything else, including a bare method name.
#[must_use]
pub fn looks_like_http_request_start(bytes: &[u8]) -> Answer {
    match scan_request_line(bytes) {
        RequestLine::Invalid => Answer::No,
        RequestLine::Partial => Answer::CanBe,
        RequestLine::Complete(_) => Answer::Yes,
    }
}

/// Check whether `bytes` start an HTTP request with a chunked body
///
/// Returns the request-start answer unchanged unless it is [`Answer::Yes`].
/// Otherwise scans the header lines up to the first blank line for
/// `Transfer-Encoding: chunked` (case-insensitive name and value).
#[must_use]
pub fn looks_like_chunked_http_request(bytes: &[u8]) -> Answer {
    let mut pos = match scan_request_line(bytes) {
        RequestLine::Invalid => return Answer::No,
        RequestLine::Partial => return Answer::CanBe,
        RequestLine::Complete(end) => end,
    };

    while let Some(line_end) = find_newline(bytes, pos) {
        let line = trim_cr(&bytes[pos..line_end]);
        if line.is_empty() {
            return Answer::No;
        }
        if header_value(line, TRANSFER_ENCODING)
            .is_some_and(|v| v.eq_ignore_ascii_case(CHUNKED))
        {
            return Answer::Yes;
        }
        pos = line_end + 1;
    }

    Answer::CanBe
}

fn find_newline(bytes: &[u8], from: usize) -> Option<usize> {
    bytes[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| from + i)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let colon = line.iter().position(|&b| b == b':')?;
    let (header, value) = line.split_at(colon);
    header
        .trim_ascii()
        .eq_ignore_ascii_case(name)
        .then(|| value[1..].trim_ascii())
}

// =============================================================================
// Request buffer
// =============================================================================

/// Accumulates raw bytes and extracts one complete HTTP request at a time
#[derive(Debug, Default)]
pub struct HttpRequestBuffer {
    buf: Vec<u8>,
}

impl HttpRequestBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet handed out
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no bytes are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Extract the next complete request (request line, headers and body)
    ///
    /// Bytes before the first request line are discarded. While the header block or
    /// the `Content-Length` body is incomplete the bytes stay buffered and `None` is
    /// returned, unless a complete request line already follows the header block, in
    /// which case the partial request is dropped and extraction restarts there.
    pub fn next_request(&mut self) -> Option<Vec<u8>> {
        loop {
            let line_end = self.align_to_request_line()?;

            let (headers_end, content_length) = scan_headers(&self.buf, line_end)?;
            // An overflowing length can never be satisfied
            let total = headers_end.checked_add(content_length);
            if let Some(total) = total.filter(|&total| self.buf.len() >= total) {
                let rest = self.buf.split_off(total);
                return Some(std::mem::replace(&mut self.buf, rest));
            }

            let resync = line_starts(&self.buf, headers_end).find(|&off| {
                matches!(
                    scan_request_line(&self.buf[off..]),
                    RequestLine::Complete(_)
                )
            })?;
            tracing::debug!(
                dropped = resync,
                expected_body = content_length,
                "discarding incomplete request, next request line already buffered"
            );
            self.buf.drain(..resync);
        }
    }

    /// Drop bytes before the first request line and return the offset just past it
    fn align_to_request_line(&mut self) -> Option<usize> {
        let mut found = None;
        let mut keep_from = None;
        for off in line_starts(&self.buf, 0) {
            match scan_request_line(&self.buf[off..]) {
                RequestLine::Complete(end) => {
                    found = Some((off, end));
                    break;
                }
                RequestLine::Partial => {
                    keep_from = Some(off);
                    break;
                }
                RequestLine::Invalid => {}
            }
        }

        if let Some((off, end)) = found {
            self.buf.drain(..off);
            return Some(end);
        }

        // Nothing usable yet; keep only the trailing unterminated line, which may
        // still grow into a request line.
        let keep_from = keep_from.unwrap_or_else(|| {
            self.buf
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |i| i + 1)
        });
        self.buf.drain(..keep_from);
        None
    }
}

/// Offsets at which a line starts, from `from` onwards
fn line_starts(bytes: &[u8], from: usize) -> impl Iterator<Item = usize> + '_ {
    std::iter::once(from)
        .chain(
            bytes[from..]
                .iter()
                .enumerate()
                .filter(|&(_, &b)| b == b'\n')
                .map(move |(i, _)| from + i + 1),
        )
        .filter(move |&off| off < bytes.len())
}

/// Returns the offset just past the blank line and the declared body length
fn scan_headers(bytes: &[u8], mut pos: usize) -> Option<(usize, usize)> {
    let mut content_length = 0;
    loop {
        let line_end = find_newline(bytes, pos)?;
        let line = trim_cr(&bytes[pos..line_end]);
        if line.is_empty() {
            return Some((line_end + 1, content_length));
        }
        if let Some(value) = header_value(line, CONTENT_LENGTH) {
            content_length = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
        pos = line_end + 1;
    }
}
