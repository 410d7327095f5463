//! Upstream body inflation.
//!
//! Kiro responses arrive gzip- or deflate-encoded; the non-stream path
//! inflates the whole body before the recognizer runs over it.

use std::io::Read;

use crate::error::{Error, Result};

/// Inflate a response body according to its `Content-Encoding`.
///
/// Unknown or absent encodings return the bytes unchanged; a body that
/// fails to inflate is a decode error (the host answers 502).
pub fn inflate(body: &[u8], content_encoding: Option<&str>) -> Result<Vec<u8>> {
    match content_encoding.map(str::trim) {
        Some("gzip") => {
            let mut decoder = flate2::read::GzDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::Decode(format!("gzip body: {e}")))?;
            Ok(out)
        }
        Some("deflate") => {
            // Try zlib-wrapped first, then raw deflate.
            let mut out = Vec::new();
            let mut zlib = flate2::read::ZlibDecoder::new(body);
            if zlib.read_to_end(&mut out).is_ok() {
                return Ok(out);
            }
            out.clear();
            let mut raw = flate2::read::DeflateDecoder::new(body);
            raw.read_to_end(&mut out)
                .map_err(|e| Error::Decode(format!("deflate body: {e}")))?;
            Ok(out)
        }
        _ => Ok(body.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_identity_passthrough() {
        assert_eq!(inflate(b"plain", None).unwrap(), b"plain");
        assert_eq!(inflate(b"plain", Some("identity")).unwrap(), b"plain");
    }

    #[test]
    fn test_gzip_round_trip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"payload").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(inflate(&compressed, Some("gzip")).unwrap(), b"payload");
    }

    #[test]
    fn test_deflate_round_trip() {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"payload").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(inflate(&compressed, Some("deflate")).unwrap(), b"payload");
    }

    #[test]
    fn test_corrupt_gzip_is_decode_error() {
        let err = inflate(b"not gzip at all", Some("gzip")).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
