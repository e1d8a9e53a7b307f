//! Block payload compression.
//!
//! A block header names its codec with a 4-byte ASCII code; four NUL bytes
//! (or ASCII zeros) mean the payload is stored verbatim.  Codes are frozen:
//! a reader that does not recognise a code must fail, not guess.

use std::io::{Read, Write};

use crate::error::{AsdfError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zlib,
    Bzp2,
}

impl Compression {
    /// The 4-byte code written into the block header.
    pub fn code(self) -> [u8; 4] {
        match self {
            Compression::Zlib => *b"zlib",
            Compression::Bzp2 => *b"bzp2",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Compression::Zlib => "zlib",
            Compression::Bzp2 => "bzp2",
        }
    }

    /// Decode a header code.  `None` means no compression.
    pub fn from_code(code: &[u8; 4]) -> Result<Option<Compression>> {
        match code {
            [0, 0, 0, 0] | b"0000" => Ok(None),
            b"zlib" => Ok(Some(Compression::Zlib)),
            b"bzp2" => Ok(Some(Compression::Bzp2)),
            other => Err(AsdfError::UnknownCompression {
                code: String::from_utf8_lossy(other).into_owned(),
            }),
        }
    }

    /// Parse a user-facing name.  The empty string means no compression.
    pub fn from_name(name: &str) -> Result<Option<Compression>> {
        match name {
            "" => Ok(None),
            "zlib" => Ok(Some(Compression::Zlib)),
            "bzp2" => Ok(Some(Compression::Bzp2)),
            other => Err(AsdfError::UnknownCompression {
                code: other.to_string(),
            }),
        }
    }
}

/// Header code for an optional codec.
pub fn code_of(compression: Option<Compression>) -> [u8; 4] {
    compression.map(Compression::code).unwrap_or([0u8; 4])
}

pub fn compress(data: &[u8], compression: Option<Compression>) -> Result<Vec<u8>> {
    match compression {
        None => Ok(data.to_vec()),
        Some(Compression::Zlib) => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        Some(Compression::Bzp2) => {
            let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
    }
}

/// Decompress `data` into exactly `data_size` bytes.
pub fn decompress(
    data: &[u8],
    compression: Option<Compression>,
    data_size: usize,
) -> Result<Vec<u8>> {
    let out = match compression {
        None => data.to_vec(),
        Some(Compression::Zlib) => {
            let mut out = Vec::with_capacity(data_size);
            flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
            out
        }
        Some(Compression::Bzp2) => {
            let mut out = Vec::with_capacity(data_size);
            bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
            out
        }
    };
    if out.len() != data_size {
        return Err(AsdfError::io_invalid(format!(
            "decompressed to {} bytes, header declares {}",
            out.len(),
            data_size
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for c in [Compression::Zlib, Compression::Bzp2] {
            assert_eq!(Compression::from_code(&c.code()).unwrap(), Some(c));
        }
        assert_eq!(Compression::from_code(&[0; 4]).unwrap(), None);
        assert!(matches!(
            Compression::from_code(b"lzma"),
            Err(AsdfError::UnknownCompression { .. })
        ));
    }

    #[test]
    fn zlib_round_trip() {
        let data = b"the quick brown fox".repeat(100);
        let packed = compress(&data, Some(Compression::Zlib)).unwrap();
        assert!(packed.len() < data.len());
        let back = decompress(&packed, Some(Compression::Zlib), data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn bzp2_round_trip() {
        let data = b"repetitive repetitive repetitive".repeat(64);
        let packed = compress(&data, Some(Compression::Bzp2)).unwrap();
        let back = decompress(&packed, Some(Compression::Bzp2), data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn size_mismatch_rejected() {
        let packed = compress(b"abc", Some(Compression::Zlib)).unwrap();
        assert!(decompress(&packed, Some(Compression::Zlib), 2).is_err());
    }
}
