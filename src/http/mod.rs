//! HTTP/1.1 codec.
//!
//! Decoding works over a `Cursor<&[u8]>` the same way frames are
//! usually parsed out of a read buffer: a parse attempt either yields a
//! complete message and leaves the cursor on the first unconsumed byte,
//! or fails with [`Error::IncompleteMessage`] so the caller can read
//! more bytes and retry. Emission goes through
//! [`Connection`](crate::Connection).

use crate::{Error, Result};
use std::fmt;
use std::io::Cursor;

pub mod chunked;
pub mod request;
pub mod response;

pub use request::HttpRequest;
pub use response::HttpResponse;

/// Hard cap on the header block of a single message.
pub const MAX_HEADER_SIZE: usize = 4 * 1024;
/// Hard cap on a single decoded chunk.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Request methods the server side recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol versions the codec speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Persistent by default only on 1.1.
    pub fn default_keep_alive(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response status code with its canonical reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

/// Message flags detected while parsing headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const CONTENT_LENGTH: Flags = Flags(1 << 0);
    pub const CHUNKED: Flags = Flags(1 << 1);
    pub const GZIP: Flags = Flags(1 << 2);
    pub const KEEP_ALIVE: Flags = Flags(1 << 3);
    pub const CLOSE: Flags = Flags(1 << 4);
    pub const UPGRADE: Flags = Flags(1 << 5);

    pub fn set(&mut self, flag: Flags) {
        self.0 |= flag.0;
    }

    pub fn contains(&self, flag: Flags) -> bool {
        self.0 & flag.0 == flag.0
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every occurrence of `name`, or append if absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Case-insensitive structural equality, order ignored.
    pub fn semantically_equals(&self, other: &Headers) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        let mut matched = vec![false; other.entries.len()];
        'outer: for (n, v) in &self.entries {
            for (i, (on, ov)) in other.entries.iter().enumerate() {
                if !matched[i] && n.eq_ignore_ascii_case(on) && v == ov {
                    matched[i] = true;
                    continue 'outer;
                }
            }
            return false;
        }
        true
    }

    fn last_value_mut(&mut self) -> Option<&mut String> {
        self.entries.last_mut().map(|(_, v)| v)
    }
}

fn is_token_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}

/// Locate `\r\n\r\n` within the first `cap` bytes from the cursor.
///
/// Returns the offset just past the terminator, relative to the cursor
/// position. Missing terminator inside the cap is
/// [`Error::IncompleteMessage`]; beyond the cap it is
/// [`Error::TooLarge`].
pub(crate) fn find_header_end(src: &Cursor<&[u8]>, cap: usize) -> Result<usize> {
    let buf = &src.get_ref()[src.position() as usize..];
    let window = &buf[..buf.len().min(cap)];
    if let Some(idx) = window.windows(4).position(|w| w == b"\r\n\r\n") {
        return Ok(idx + 4);
    }
    if buf.len() >= cap {
        return Err(Error::TooLarge(format!(
            "header block exceeds {cap} bytes"
        )));
    }
    Err(Error::IncompleteMessage)
}

/// Read one `\r\n`-terminated line out of the cursor, excluding the
/// terminator.
pub(crate) fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8]> {
    let start = src.position() as usize;
    let buf = *src.get_ref();
    if buf.len() < start + 2 {
        return Err(Error::IncompleteMessage);
    }
    for i in start..buf.len() - 1 {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);
            return Ok(&buf[start..i]);
        }
    }
    Err(Error::IncompleteMessage)
}

/// Parse a header block terminated by an empty line, folding
/// continuation lines (leading SP/HT) into the previous value.
pub(crate) fn parse_headers(src: &mut Cursor<&[u8]>) -> Result<(Headers, Flags, Option<usize>)> {
    let mut headers = Headers::new();
    let mut flags = Flags::default();
    let mut content_length = None;
    let mut has_previous = false;

    loop {
        let line = get_line(src)?;
        if line.is_empty() {
            break;
        }

        // Folded continuation of the previous header value
        if line[0] == b' ' || line[0] == b'\t' {
            if !has_previous {
                return Err(Error::Protocol("continuation before any header".into()));
            }
            let folded = trim_ows(line);
            let folded = std::str::from_utf8(folded)
                .map_err(|e| Error::Protocol(format!("bad header encoding: {e}")))?;
            if let Some(value) = headers.last_value_mut() {
                value.push(' ');
                value.push_str(folded);
            }
            continue;
        }

        let colon = line
            .iter()
            .position(|&c| c == b':')
            .ok_or_else(|| Error::Protocol("header line without colon".into()))?;
        let (name, rest) = line.split_at(colon);
        if name.is_empty() || !name.iter().all(|&c| is_token_byte(c)) {
            return Err(Error::Protocol("bad header name".into()));
        }
        let value = trim_ows(&rest[1..]);

        let name = std::str::from_utf8(name)
            .map_err(|e| Error::Protocol(format!("bad header encoding: {e}")))?;
        let value = std::str::from_utf8(value)
            .map_err(|e| Error::Protocol(format!("bad header encoding: {e}")))?;

        if name.eq_ignore_ascii_case("Content-Length") {
            let len = atoi::atoi::<usize>(value.as_bytes())
                .ok_or_else(|| Error::Protocol(format!("bad Content-Length `{value}`")))?;
            flags.set(Flags::CONTENT_LENGTH);
            content_length = Some(len);
        } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
            for coding in value.split(',') {
                match coding.trim().to_ascii_lowercase().as_str() {
                    "chunked" => flags.set(Flags::CHUNKED),
                    "gzip" => flags.set(Flags::GZIP),
                    other => {
                        return Err(Error::Protocol(format!(
                            "unsupported transfer encoding `{other}`"
                        )))
                    }
                }
            }
        } else if name.eq_ignore_ascii_case("Connection") {
            for token in value.split(',') {
                match token.trim().to_ascii_lowercase().as_str() {
                    "keep-alive" => flags.set(Flags::KEEP_ALIVE),
                    "close" => flags.set(Flags::CLOSE),
                    "upgrade" => flags.set(Flags::UPGRADE),
                    _ => {}
                }
            }
        }

        headers.add(name, value);
        has_previous = true;
    }

    Ok((headers, flags, content_length))
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_end() {
        let data = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nrest";
        let cur = Cursor::new(&data[..]);
        assert_eq!(find_header_end(&cur, MAX_HEADER_SIZE).unwrap(), 27);
    }

    #[test]
    fn test_find_header_end_incomplete() {
        let data = b"GET / HTTP/1.1\r\nHost:";
        let cur = Cursor::new(&data[..]);
        assert!(matches!(
            find_header_end(&cur, MAX_HEADER_SIZE),
            Err(Error::IncompleteMessage)
        ));
    }

    #[test]
    fn test_find_header_end_over_cap() {
        let data = vec![b'a'; 64];
        let cur = Cursor::new(&data[..]);
        assert!(matches!(
            find_header_end(&cur, 32),
            Err(Error::TooLarge(_))
        ));
    }

    #[test]
    fn test_parse_headers_folding() {
        let data = b"X-Long: first\r\n  second\r\n\tthird\r\nHost: h\r\n\r\n";
        let mut cur = Cursor::new(&data[..]);
        let (headers, _, _) = parse_headers(&mut cur).unwrap();
        assert_eq!(headers.get("x-long"), Some("first second third"));
        assert_eq!(headers.get("HOST"), Some("h"));
    }

    #[test]
    fn test_parse_headers_flags() {
        let data =
            b"Content-Length: 12\r\nTransfer-Encoding: chunked, gzip\r\nConnection: close\r\n\r\n";
        let mut cur = Cursor::new(&data[..]);
        let (_, flags, len) = parse_headers(&mut cur).unwrap();
        assert!(flags.contains(Flags::CONTENT_LENGTH));
        assert!(flags.contains(Flags::CHUNKED));
        assert!(flags.contains(Flags::GZIP));
        assert!(flags.contains(Flags::CLOSE));
        assert_eq!(len, Some(12));
    }

    #[test]
    fn test_parse_headers_rejects_garbage() {
        let mut cur = Cursor::new(&b"No Colon Here\r\n\r\n"[..]);
        assert!(parse_headers(&mut cur).is_err());

        let mut cur = Cursor::new(&b"Content-Length: twelve\r\n\r\n"[..]);
        assert!(parse_headers(&mut cur).is_err());
    }

    #[test]
    fn test_headers_semantic_equality() {
        let mut a = Headers::new();
        a.add("Host", "x");
        a.add("Accept", "*/*");
        let mut b = Headers::new();
        b.add("accept", "*/*");
        b.add("HOST", "x");
        assert!(a.semantically_equals(&b));

        b.add("Extra", "1");
        assert!(!a.semantically_equals(&b));
    }
}
