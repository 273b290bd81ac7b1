//! Stored/deflate payload envelope.
//!
//! One byte of framing: `0` means the raw payload follows, `1` means a
//! 4-byte little-endian original length followed by zlib-compressed
//! bytes. Payloads of up to 1024 bytes are always stored; so is
//! anything the compressor fails on.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Write;

const STORED: u8 = 0;
const DEFLATE: u8 = 1;

/// Payloads at or below this size skip compression.
pub const MIN_COMPRESS_SIZE: usize = 1024;

/// Wrap `input` in the envelope, compressing when it pays off.
pub fn deflate(input: &[u8]) -> Bytes {
    if input.len() > MIN_COMPRESS_SIZE {
        if let Ok(compressed) = zlib_compress(input) {
            let mut out = BytesMut::with_capacity(1 + 4 + compressed.len());
            out.put_u8(DEFLATE);
            out.put_u32_le(input.len() as u32);
            out.put_slice(&compressed);
            return out.freeze();
        }
    }

    let mut out = BytesMut::with_capacity(1 + input.len());
    out.put_u8(STORED);
    out.put_slice(input);
    out.freeze()
}

/// Unwrap an envelope produced by [`deflate`].
pub fn inflate(input: &[u8]) -> Result<Bytes> {
    let (&flag, rest) = input
        .split_first()
        .ok_or_else(|| Error::Protocol("not enough data for decompression".into()))?;

    match flag {
        STORED => Ok(Bytes::copy_from_slice(rest)),
        DEFLATE => {
            if rest.len() < 4 {
                return Err(Error::Protocol("truncated deflate header".into()));
            }
            let (len_bytes, compressed) = rest.split_at(4);
            let original_len =
                u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                    as usize;

            let decompressed = zlib_decompress(compressed)?;
            if decompressed.len() != original_len {
                return Err(Error::Protocol(format!(
                    "decompressed length {} does not match header {}",
                    decompressed.len(),
                    original_len
                )));
            }
            Ok(decompressed.into())
        }
        other => Err(Error::Protocol(format!("unknown envelope flag {other}"))),
    }
}

fn zlib_compress(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input)?;
    encoder.finish()
}

fn zlib_decompress(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder
        .write_all(input)
        .map_err(|e| Error::Protocol(format!("decompression failed: {e}")))?;
    decoder
        .finish()
        .map_err(|e| Error::Protocol(format!("decompression failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_stored() {
        let payload = b"short payload";
        let framed = deflate(payload);
        assert_eq!(framed[0], STORED);
        assert_eq!(&framed[1..], payload);
        assert_eq!(&inflate(&framed).unwrap()[..], payload);
    }

    #[test]
    fn test_boundary_is_stored() {
        let payload = vec![b'x'; MIN_COMPRESS_SIZE];
        let framed = deflate(&payload);
        assert_eq!(framed[0], STORED);
        assert_eq!(framed.len(), payload.len() + 1);
    }

    #[test]
    fn test_large_payload_compressed() {
        let payload: Vec<u8> = b"abcdefgh".iter().copied().cycle().take(8192).collect();
        let framed = deflate(&payload);
        assert_eq!(framed[0], DEFLATE);
        // Repetitive input must actually shrink.
        assert!(framed.len() < payload.len());
        assert_eq!(
            u32::from_le_bytes([framed[1], framed[2], framed[3], framed[4]]),
            payload.len() as u32
        );
        assert_eq!(&inflate(&framed).unwrap()[..], &payload[..]);
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        assert!(inflate(&[]).is_err());
        assert!(inflate(&[7, 1, 2, 3]).is_err());
        assert!(inflate(&[DEFLATE, 1, 0]).is_err());
        // Valid header, junk body.
        assert!(inflate(&[DEFLATE, 4, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn test_length_header_mismatch() {
        let payload: Vec<u8> = std::iter::repeat(b'z').take(4096).collect();
        let mut framed = deflate(&payload).to_vec();
        assert_eq!(framed[0], DEFLATE);
        framed[1] ^= 0xff;
        assert!(inflate(&framed).is_err());
    }
}
