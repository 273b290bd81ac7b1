//! Response emission (server side) and decoding (client side).

use super::{chunked, find_header_end, Flags, Headers, StatusCode, Version, MAX_HEADER_SIZE};
use crate::{Error, Result};
use bytes::{Buf, Bytes};
use std::io::Cursor;

/// An HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: StatusCode,
    pub headers: Headers,
    pub flags: Flags,
    pub content_length: Option<usize>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        HttpResponse {
            version: Version::Http11,
            status,
            headers: Headers::new(),
            flags: Flags::default(),
            content_length: None,
            body: Bytes::new(),
        }
    }

    /// Response with a body and content type.
    pub fn with_body(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut response = HttpResponse::new(status);
        response.headers.set("Content-Type", content_type);
        response.body = body.into();
        response
    }

    /// Plain-text response, `text/plain; charset=utf-8`.
    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        HttpResponse::with_body(status, "text/plain; charset=utf-8", body)
    }

    /// JSON response, `application/json`.
    pub fn json(status: StatusCode, body: impl Into<Bytes>) -> Self {
        HttpResponse::with_body(status, "application/json", body)
    }

    /// Parse one response out of the cursor (client side).
    ///
    /// `eof` tells the parser the peer has closed its half; a response
    /// with neither `Content-Length` nor chunked coding extends until
    /// close, so it only completes once `eof` is set.
    pub fn parse(src: &mut Cursor<&[u8]>, eof: bool) -> Result<HttpResponse> {
        find_header_end(src, MAX_HEADER_SIZE)?;

        let line = super::get_line(src)?;
        let (version, status) = parse_status_line(line)?;

        let (headers, flags, content_length) = super::parse_headers(src)?;

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
            // Until-close body
            if !eof {
                return Err(Error::IncompleteMessage);
            }
            let start = src.position() as usize;
            let body = Bytes::copy_from_slice(&src.get_ref()[start..]);
            src.set_position(src.get_ref().len() as u64);
            body
        };

        Ok(HttpResponse {
            version,
            status,
            headers,
            flags,
            content_length,
            body,
        })
    }

    pub fn keep_alive(&self) -> bool {
        if self.flags.contains(Flags::CLOSE) {
            return false;
        }
        if self.flags.contains(Flags::KEEP_ALIVE) {
            return true;
        }
        self.version.default_keep_alive()
    }

    /// Serialize the status line, headers and body.
    ///
    /// `Content-Length` is always set from the actual body;
    /// `Connection` is emitted from `keep_alive`.
    pub fn encode(&self, keep_alive: bool) -> Bytes {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Content-Length")
                || name.eq_ignore_ascii_case("Connection")
            {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(
            if keep_alive {
                b"Connection: keep-alive\r\n".as_slice()
            } else {
                b"Connection: close\r\n".as_slice()
            },
        );
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);

        out.into()
    }

    /// Status line and headers for a chunked streaming response; body
    /// chunks follow through [`chunked::encode_chunk`].
    pub fn encode_chunked_head(&self, keep_alive: bool) -> Bytes {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Content-Length")
                || name.eq_ignore_ascii_case("Connection")
                || name.eq_ignore_ascii_case("Transfer-Encoding")
            {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        out.extend_from_slice(
            if keep_alive {
                b"Connection: keep-alive\r\n".as_slice()
            } else {
                b"Connection: close\r\n".as_slice()
            },
        );
        out.extend_from_slice(b"\r\n");
        out.into()
    }
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
    let mut parts = line.splitn(3, |&c| c == b' ');

    let version = match parts.next() {
        Some(v) if v.eq_ignore_ascii_case(b"HTTP/1.1") => Version::Http11,
        Some(v) if v.eq_ignore_ascii_case(b"HTTP/1.0") => Version::Http10,
        _ => return Err(Error::Protocol("bad status line protocol".into())),
    };

    let code = parts
        .next()
        .and_then(|c| atoi::atoi::<u16>(c))
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| Error::Protocol("bad status code".into()))?;

    // The reason phrase is free-form and ignored.
    Ok((version, StatusCode(code)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_length_body() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let mut cur = Cursor::new(&wire[..]);
        let response = HttpResponse::parse(&mut cur, false).unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"ok");
        assert!(response.keep_alive());
    }

    #[test]
    fn test_parse_chunked_body() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n";
        let mut cur = Cursor::new(&wire[..]);
        let response = HttpResponse::parse(&mut cur, false).unwrap();
        assert_eq!(&response.body[..], b"ok");
    }

    #[test]
    fn test_parse_until_close_body() {
        let wire = b"HTTP/1.0 200 OK\r\n\r\neverything until eof";
        let mut cur = Cursor::new(&wire[..]);
        assert!(matches!(
            HttpResponse::parse(&mut cur, false),
            Err(Error::IncompleteMessage)
        ));

        let mut cur = Cursor::new(&wire[..]);
        let response = HttpResponse::parse(&mut cur, true).unwrap();
        assert_eq!(&response.body[..], b"everything until eof");
        assert!(!response.keep_alive());
    }

    #[test]
    fn test_parse_rejects_bad_status() {
        let mut cur = Cursor::new(&b"HTTP/1.1 abc Bad\r\n\r\n"[..]);
        assert!(HttpResponse::parse(&mut cur, true).is_err());

        let mut cur = Cursor::new(&b"SPDY/3 200 OK\r\n\r\n"[..]);
        assert!(HttpResponse::parse(&mut cur, true).is_err());
    }

    #[test]
    fn test_encode_sets_length_and_connection() {
        let response = HttpResponse::text(StatusCode::OK, "hello");
        let wire = String::from_utf8(response.encode(true).to_vec()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(wire.contains("Connection: keep-alive\r\n"));
        assert!(wire.ends_with("\r\n\r\nhello"));

        let wire = String::from_utf8(response.encode(false).to_vec()).unwrap();
        assert!(wire.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_chunked_head() {
        let response = HttpResponse::text(StatusCode::OK, "");
        let head = String::from_utf8(response.encode_chunked_head(true).to_vec()).unwrap();
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!head.contains("Content-Length"));
        assert!(head.ends_with("\r\n\r\n"));
    }
}
