//! Chunked transfer coding.

use super::{get_line, MAX_CHUNK_SIZE};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Decode a complete chunked body from the cursor.
///
/// The cursor must sit on the first size line. Consumes up to and
/// including the terminating zero chunk and any trailer block. Returns
/// [`Error::IncompleteMessage`] until the whole body is buffered.
pub fn decode(src: &mut Cursor<&[u8]>) -> Result<Bytes> {
    let mut body = BytesMut::new();

    loop {
        let line = get_line(src)?;
        // Chunk extensions after ';' are ignored.
        let size_part = line
            .split(|&c| c == b';')
            .next()
            .unwrap_or_default();
        let size = parse_hex(size_part)?;
        if size > MAX_CHUNK_SIZE {
            return Err(Error::TooLarge(format!(
                "chunk of {size} bytes exceeds {MAX_CHUNK_SIZE}"
            )));
        }

        if size == 0 {
            // Trailer block: header lines until an empty one.
            loop {
                let trailer = get_line(src)?;
                if trailer.is_empty() {
                    return Ok(body.freeze());
                }
            }
        }

        if src.remaining() < size + 2 {
            return Err(Error::IncompleteMessage);
        }
        let start = src.position() as usize;
        body.put_slice(&src.get_ref()[start..start + size]);
        src.advance(size);

        let tail = &src.get_ref()[src.position() as usize..src.position() as usize + 2];
        if tail != b"\r\n" {
            return Err(Error::Protocol("chunk data not terminated by CRLF".into()));
        }
        src.advance(2);
    }
}

/// Encode `data` as a single chunk; an empty slice emits the
/// terminating zero chunk.
pub fn encode_chunk(data: &[u8], dst: &mut BytesMut) {
    if data.is_empty() {
        dst.put_slice(b"0\r\n\r\n");
        return;
    }
    dst.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

/// Encode a whole body as chunked coding, one chunk per input slice,
/// followed by the terminator.
pub fn encode<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Bytes {
    let mut out = BytesMut::new();
    for chunk in chunks {
        if !chunk.is_empty() {
            encode_chunk(chunk, &mut out);
        }
    }
    encode_chunk(&[], &mut out);
    out.freeze()
}

fn parse_hex(bytes: &[u8]) -> Result<usize> {
    let bytes = bytes.trim_ascii();
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(Error::Protocol("bad chunk size line".into()));
    }
    let mut value: usize = 0;
    for &c in bytes {
        let digit = (c as char)
            .to_digit(16)
            .ok_or_else(|| Error::Protocol("bad chunk size line".into()))?;
        value = (value << 4) | digit as usize;
    }
    Ok(value)
}
