// src/request.rs
use std::ops::Range;
use std::str;

use tracing::{debug, error};

use crate::buffer::Buffer;

/// Request paths that resolve to a canned html page when given bare.
const DEFAULT_HTML: [&str; 4] = ["/index", "/welcome", "/video", "/picture"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Parsed HTTP/1.1 request head.
///
/// The parser takes ownership of the inbound buffer for the duration of a
/// request; method, version, headers and body are byte ranges into it and
/// are invalidated by [`clear`](Self::clear). The path is owned because it
/// is rewritten during normalization.
pub struct Request {
    raw: Buffer,
    state: ParseState,
    method: Range<usize>,
    version: Range<usize>,
    path: String,
    headers: Vec<(Range<usize>, Range<usize>)>,
    body: Range<usize>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            raw: Buffer::new(),
            state: ParseState::RequestLine,
            method: 0..0,
            version: 0..0,
            path: String::new(),
            headers: Vec::new(),
            body: 0..0,
        }
    }
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset parse state and parsed slices. Buffer capacity is retained.
    pub fn clear(&mut self) {
        self.raw.clear();
        self.state = ParseState::RequestLine;
        self.method = 0..0;
        self.version = 0..0;
        self.path.clear();
        self.headers.clear();
        self.body = 0..0;
    }

    /// Unconsumed bytes left over from a previous parse.
    pub fn has_pending(&self) -> bool {
        !self.raw.is_empty()
    }

    /// Consume `data` and run the state machine over its current view.
    /// Returns false on a malformed request line (the caller answers 400).
    pub fn parse(&mut self, data: Buffer) -> bool {
        self.raw = data;
        match scan(self.raw.view()) {
            Some(scan) => {
                self.state = scan.state;
                self.method = scan.method;
                self.version = scan.version;
                self.path = scan.path;
                self.headers = scan.headers;
                self.body = scan.body;
                debug!(
                    "[method: {}] [path: {}] [version: {}]",
                    self.method(),
                    self.path,
                    self.version()
                );
                true
            }
            None => {
                error!("failed to parse request line");
                false
            }
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> &str {
        self.str_at(&self.method)
    }

    pub fn version(&self) -> &str {
        self.str_at(&self.version)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> &[u8] {
        &self.raw.view()[self.body.clone()]
    }

    /// Header lookup. Names compare case-insensitively; values are
    /// returned verbatim.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| self.str_at(n).eq_ignore_ascii_case(name))
            .map(|(_, v)| self.str_at(v))
    }

    /// True iff the version is HTTP/1.1 and the Connection header carries
    /// the exact value `keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        self.version() == "HTTP/1.1" && self.header("Connection") == Some("keep-alive")
    }

    fn str_at(&self, range: &Range<usize>) -> &str {
        str::from_utf8(&self.raw.view()[range.clone()]).unwrap_or("")
    }
}

struct Scan {
    state: ParseState,
    method: Range<usize>,
    version: Range<usize>,
    path: String,
    headers: Vec<(Range<usize>, Range<usize>)>,
    body: Range<usize>,
}

/// CRLF-driven state machine over the whole view. Ranges are absolute
/// offsets into `view`.
fn scan(view: &[u8]) -> Option<Scan> {
    let mut out = Scan {
        state: ParseState::RequestLine,
        method: 0..0,
        version: 0..0,
        path: String::new(),
        headers: Vec::new(),
        body: 0..0,
    };

    let mut pos = 0;
    while pos < view.len() && out.state != ParseState::Finish {
        match out.state {
            ParseState::RequestLine => {
                let (line, next) = next_line(view, pos);
                parse_request_line(view, line, &mut out)?;
                out.state = ParseState::Headers;
                pos = next;
            }
            ParseState::Headers => {
                let (line, next) = next_line(view, pos);
                if !parse_header_line(view, line, &mut out.headers)? {
                    out.state = ParseState::Body;
                }
                pos = next;
            }
            ParseState::Body => {
                out.body = pos..view.len();
                out.state = ParseState::Finish;
                pos = view.len();
            }
            ParseState::Finish => {}
        }
    }
    Some(out)
}

/// The line starting at `pos` (exclusive of CRLF) and the offset of the
/// following line. Trailing bytes without a terminator count as a line.
fn next_line(view: &[u8], pos: usize) -> (Range<usize>, usize) {
    let mut i = pos;
    while i + 1 < view.len() {
        if view[i] == b'\r' && view[i + 1] == b'\n' {
            return (pos..i, i + 2);
        }
        i += 1;
    }
    (pos..view.len(), view.len())
}

/// `METHOD SP PATH SP VERSION`. The second space is located after
/// advancing past the first. A missing space, an empty path, or invalid
/// UTF-8 fails the parse.
fn parse_request_line(view: &[u8], line: Range<usize>, out: &mut Scan) -> Option<()> {
    let base = line.start;
    let text = str::from_utf8(&view[line]).ok()?;

    let sp1 = text.find(' ')?;
    let rest = &text[sp1 + 1..];
    let sp2 = rest.find(' ')?;

    let path = &rest[..sp2];
    if path.is_empty() {
        return None;
    }

    out.method = base..base + sp1;
    out.version = base + sp1 + 1 + sp2 + 1..base + text.len();
    out.path = normalize_path(path);
    Some(())
}

/// One header line. `Some(false)` means the line terminates the header
/// section (empty, or no colon); the delimiter line itself is discarded.
fn parse_header_line(
    view: &[u8],
    line: Range<usize>,
    headers: &mut Vec<(Range<usize>, Range<usize>)>,
) -> Option<bool> {
    if line.is_empty() {
        return Some(false);
    }
    let base = line.start;
    let text = str::from_utf8(&view[line]).ok()?;

    let Some(colon) = text.find(':') else {
        return Some(false);
    };

    // A single optional space after the colon is consumed.
    let mut value_start = colon + 1;
    if text.as_bytes().get(value_start) == Some(&b' ') {
        value_start += 1;
    }

    headers.push((base..base + colon, base + value_start..base + text.len()));
    Some(true)
}

fn normalize_path(path: &str) -> String {
    if path == "/" {
        return "/index.html".to_string();
    }
    if DEFAULT_HTML.contains(&path) {
        return format!("{path}.html");
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &'static [u8]) -> (Request, bool) {
        let mut req = Request::new();
        let ok = req.parse(Buffer::from_static(bytes));
        (req, ok)
    }

    #[test]
    fn full_request_roundtrip() {
        let (req, ok) = parse(
            b"GET /site/page.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\npayload",
        );
        assert!(ok);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/site/page.html");
        assert_eq!(req.version(), "HTTP/1.1");
        assert_eq!(req.header("Host"), Some("localhost"));
        assert_eq!(req.header("Connection"), Some("keep-alive"));
        assert_eq!(req.body(), b"payload");
        assert_eq!(req.state(), ParseState::Finish);
    }

    #[test]
    fn body_is_the_remainder_of_the_view() {
        let (req, ok) = parse(b"POST /p HTTP/1.1\r\n\r\nline one\r\nline two");
        assert!(ok);
        assert_eq!(req.body(), b"line one\r\nline two");
    }

    #[test]
    fn root_path_normalizes_to_index() {
        let (req, ok) = parse(b"GET / HTTP/1.1\r\n\r\n");
        assert!(ok);
        assert_eq!(req.path(), "/index.html");
    }

    #[test]
    fn bare_default_pages_get_html_suffix() {
        for (given, want) in [
            ("/index", "/index.html"),
            ("/welcome", "/welcome.html"),
            ("/video", "/video.html"),
            ("/picture", "/picture.html"),
        ] {
            assert_eq!(normalize_path(given), want);
        }
        assert_eq!(normalize_path("/other"), "/other");
    }

    #[test]
    fn missing_second_space_fails() {
        let (_, ok) = parse(b"GARBAGE\r\n");
        assert!(!ok);
        let (_, ok) = parse(b"GET /only-one-space\r\n\r\n");
        assert!(!ok);
    }

    #[test]
    fn empty_path_fails() {
        let (_, ok) = parse(b"GET  HTTP/1.1\r\n\r\n");
        assert!(!ok);
    }

    #[test]
    fn keep_alive_requires_version_and_header() {
        let (req, _) = parse(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(req.is_keep_alive());

        let (req, _) = parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(!req.is_keep_alive());

        let (req, _) = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!req.is_keep_alive());

        let (req, _) = parse(b"GET / HTTP/1.1\r\n\r\n");
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn header_names_are_case_insensitive_values_are_not() {
        let (req, _) = parse(b"GET / HTTP/1.1\r\nconnection: keep-alive\r\n\r\n");
        assert!(req.is_keep_alive());

        // The value comparison stays exact.
        let (req, _) = parse(b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn header_value_space_is_optional() {
        let (req, _) = parse(b"GET / HTTP/1.1\r\nHost:tight\r\nAgent:  padded\r\n\r\n");
        assert_eq!(req.header("Host"), Some("tight"));
        // Only a single space is consumed.
        assert_eq!(req.header("Agent"), Some(" padded"));
    }

    #[test]
    fn headerless_line_ends_the_header_section() {
        let (req, ok) = parse(b"GET / HTTP/1.1\r\nHost: h\r\nnot a header\r\nbody bytes");
        assert!(ok);
        assert_eq!(req.header("Host"), Some("h"));
        assert_eq!(req.body(), b"body bytes");
    }

    #[test]
    fn clear_resets_everything() {
        let (mut req, ok) = parse(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(ok);
        req.clear();
        assert_eq!(req.state(), ParseState::RequestLine);
        assert_eq!(req.method(), "");
        assert_eq!(req.path(), "");
        assert!(!req.has_pending());
        assert!(!req.is_keep_alive());
    }
}
