//! Server-side request decoding and the request model.

use super::{chunked, find_header_end, Flags, Headers, Method, Version, MAX_HEADER_SIZE};
use crate::uri::Uri;
use crate::{Error, Result};
use bytes::{Buf, Bytes};
use std::io::Cursor;

/// A decoded HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: Headers,
    pub flags: Flags,
    pub content_length: Option<usize>,
    pub body: Bytes,
}

impl HttpRequest {
    /// Build an outbound request with an empty header set.
    pub fn new(method: Method, uri: Uri) -> Self {
        HttpRequest {
            method,
            uri,
            version: Version::Http11,
            headers: Headers::new(),
            flags: Flags::default(),
            content_length: None,
            body: Bytes::new(),
        }
    }

    /// Parse one complete request out of the cursor.
    ///
    /// On success the cursor sits on the first byte after the request.
    /// Returns [`Error::IncompleteMessage`] while the header block or
    /// body is still short, so the caller can buffer more and retry.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<HttpRequest> {
        find_header_end(src, MAX_HEADER_SIZE)?;

        let line = super::get_line(src)?;
        let (method, uri, version) =
            parse_request_line(line).map_err(|e| match e {
                Error::IncompleteMessage => e,
                other => Error::Protocol(format!("bad request line: {other}")),
            })?;

        let (headers, flags, content_length) = super::parse_headers(src)?;

        let mut uri = uri;
        if let Some(host) = headers.get("Host") {
            uri.set_host(host);
        }

        // Content-Length wins when it is the only length indicator;
        // chunked coding wins when both are present.
        let body = if flags.contains(Flags::CHUNKED) {
            chunked::decode(src)?
        } else if let Some(len) = content_length {
            if src.remaining() < len {
                return Err(Error::IncompleteMessage);
            }
            let start = src.position() as usize;
            let body = Bytes::copy_from_slice(&src.get_ref()[start..start + len]);
            src.advance(len);
            body
        } else {
            Bytes::new()
        };

        Ok(HttpRequest {
            method,
            uri,
            version,
            headers,
            flags,
            content_length,
            body,
        })
    }

    /// Whether the connection should stay open after this exchange.
    pub fn keep_alive(&self) -> bool {
        if self.flags.contains(Flags::CLOSE) {
            return false;
        }
        if self.flags.contains(Flags::KEEP_ALIVE) {
            return true;
        }
        self.version.default_keep_alive()
    }

    /// Serialize into wire form.
    ///
    /// `Content-Length` is always emitted for a known body and any
    /// stale length header is replaced.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.uri.path().as_bytes());
        if self.uri.has_query() {
            out.push(b'?');
            out.extend_from_slice(self.uri.query().as_bytes());
        }
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() || self.method == Method::Post {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);

        out.into()
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Uri, Version)> {
    let mut parts = line.split(|&c| c == b' ');

    let method = match parts.next() {
        Some(m) if m.eq_ignore_ascii_case(b"GET") => Method::Get,
        Some(m) if m.eq_ignore_ascii_case(b"POST") => Method::Post,
        Some(other) => {
            return Err(Error::Protocol(format!(
                "unknown method `{}`",
                String::from_utf8_lossy(other)
            )))
        }
        None => return Err(Error::Protocol("empty request line".into())),
    };

    let target = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Protocol("missing request target".into()))?;
    let target = std::str::from_utf8(target)
        .map_err(|e| Error::Protocol(format!("bad request target: {e}")))?;
    let uri = Uri::parse(target)?;

    let version = parse_version(parts.next())?;

    if parts.next().is_some() {
        return Err(Error::Protocol("redundant data after protocol version".into()));
    }

    Ok((method, uri, version))
}

fn parse_version(part: Option<&[u8]>) -> Result<Version> {
    match part {
        Some(v) if v.eq_ignore_ascii_case(b"HTTP/1.1") => Ok(Version::Http11),
        Some(v) if v.eq_ignore_ascii_case(b"HTTP/1.0") => Ok(Version::Http10),
        Some(other) => Err(Error::Protocol(format!(
            "unsupported protocol `{}`",
            String::from_utf8_lossy(other)
        ))),
        None => Err(Error::Protocol("missing protocol version".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(wire: &[u8]) -> HttpRequest {
        let mut cur = Cursor::new(wire);
        let req = HttpRequest::parse(&mut cur).unwrap();
        assert_eq!(cur.position() as usize, wire.len());
        req
    }

    #[test]
    fn test_get_minimal() {
        let req = parse_ok(b"GET /status HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.uri.path(), "/status");
        assert_eq!(req.uri.host(), "example.com");
        assert_eq!(req.version, Version::Http11);
        assert!(req.body.is_empty());
        assert!(req.keep_alive());
    }

    #[test]
    fn test_post_content_length() {
        let req = parse_ok(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.content_length, Some(5));
        assert_eq!(&req.body[..], b"hello");
    }

    #[test]
    fn test_post_chunked() {
        let req = parse_ok(
            b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );
        assert_eq!(&req.body[..], b"hello world");
    }

    #[test]
    fn test_incomplete_body() {
        let mut cur = Cursor::new(&b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhi"[..]);
        assert!(matches!(
            HttpRequest::parse(&mut cur),
            Err(Error::IncompleteMessage)
        ));
    }

    #[test]
    fn test_http10_close_by_default() {
        let req = parse_ok(b"GET / HTTP/1.0\r\n\r\n");
        assert!(!req.keep_alive());

        let req = parse_ok(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(req.keep_alive());

        let req = parse_ok(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_rejects_unknown_method_and_version() {
        let mut cur = Cursor::new(&b"PUT / HTTP/1.1\r\n\r\n"[..]);
        assert!(matches!(HttpRequest::parse(&mut cur), Err(Error::Protocol(_))));

        let mut cur = Cursor::new(&b"GET / HTTP/2.0\r\n\r\n"[..]);
        assert!(matches!(HttpRequest::parse(&mut cur), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversize_header_block() {
        let mut wire = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        wire.extend(std::iter::repeat(b'a').take(8 * 1024));
        wire.extend_from_slice(b"\r\n\r\n");
        let mut cur = Cursor::new(&wire[..]);
        assert!(matches!(HttpRequest::parse(&mut cur), Err(Error::TooLarge(_))));
    }

    #[test]
    fn test_reemission_is_semantically_equal() {
        let wire = b"POST /a/b?k=v HTTP/1.1\r\nHost: h\r\nX-One: 1\r\nContent-Length: 5\r\n\r\nhello";
        let first = parse_ok(wire);
        let emitted = first.encode();
        let mut cur = Cursor::new(&emitted[..]);
        let second = HttpRequest::parse(&mut cur).unwrap();

        assert_eq!(first.method, second.method);
        assert_eq!(first.uri.path(), second.uri.path());
        assert_eq!(first.uri.query(), second.uri.query());
        assert!(first.headers.semantically_equals(&second.headers));
        assert_eq!(first.body, second.body);
    }
}
