//! Frame body compression.
//!
//! The algorithm is chosen once per connection, during the STARTUP handshake, by
//! name. Names are matched case-insensitively and anything unknown, empty or absent
//! falls back to [`Compression::None`] instead of failing.
//!
//! LZ4 bodies carry the uncompressed length as a 4-byte big-endian prefix in front
//! of a raw LZ4 block; Snappy bodies are a raw Snappy block.
use log::warn;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("lz4 body shorter than its 4-byte length prefix")]
    MissingLength,

    #[error("lz4 decompression failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),

    #[error("snappy codec failed: {0}")]
    Snappy(#[from] snap::Error),

    #[error("body inflates to {size} bytes, over the limit of {max} bytes")]
    TooLarge { size: usize, max: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    /// Fast byte-oriented compressor.
    Lz4,
    /// Higher-ratio compressor.
    Snappy,
}

impl Compression {
    pub fn from_name(name: Option<&str>) -> Self {
        let Some(name) = name.map(str::trim) else {
            return Compression::None;
        };
        match name.to_lowercase().as_str() {
            "lz4" => Compression::Lz4,
            "snappy" => Compression::Snappy,
            "" | "none" => Compression::None,
            other => {
                warn!("unknown compression '{other}', falling back to none");
                Compression::None
            }
        }
    }

    /// Name sent in the STARTUP options, `None` when compression is off.
    pub fn name(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Lz4 => Some("lz4"),
            Compression::Snappy => Some("snappy"),
        }
    }

    pub fn is_enabled(self) -> bool {
        self != Compression::None
    }

    pub fn compress(self, body: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Compression::None => Ok(body.to_vec()),
            Compression::Lz4 => {
                let compressed = lz4_flex::block::compress(body);
                let mut out = Vec::with_capacity(4 + compressed.len());
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(&compressed);
                Ok(out)
            }
            Compression::Snappy => Ok(snap::raw::Encoder::new().compress_vec(body)?),
        }
    }

    /// Inflate `body`, refusing before allocation when its declared length is
    /// over `max_len`.
    pub fn decompress(self, body: &[u8], max_len: usize) -> Result<Vec<u8>, CompressionError> {
        let check = |size: usize| {
            if size > max_len {
                return Err(CompressionError::TooLarge { size, max: max_len });
            }
            Ok(())
        };
        match self {
            Compression::None => {
                check(body.len())?;
                Ok(body.to_vec())
            }
            Compression::Lz4 => {
                if body.len() < 4 {
                    return Err(CompressionError::MissingLength);
                }
                let (len, block) = body.split_at(4);
                let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
                check(len)?;
                Ok(lz4_flex::block::decompress(block, len)?)
            }
            Compression::Snappy => {
                check(snap::raw::decompress_len(body)?)?;
                Ok(snap::raw::Decoder::new().decompress_vec(body)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_names() {
        for name in ["lz4", "lZ4", "Lz4", "LZ4"] {
            assert_eq!(Compression::from_name(Some(name)), Compression::Lz4);
        }
    }

    #[test]
    fn snappy_names() {
        for name in ["snappy", "SNAPPY", "sNaPpY", "SNapPy"] {
            assert_eq!(Compression::from_name(Some(name)), Compression::Snappy);
        }
    }

    #[test]
    fn none_when_undefined() {
        assert_eq!(Compression::from_name(None), Compression::None);
        assert_eq!(Compression::from_name(Some("")), Compression::None);
    }

    #[test]
    fn none_when_defined_as_none() {
        for name in ["none", "NONE", "NoNe", "nONe"] {
            assert_eq!(Compression::from_name(Some(name)), Compression::None);
        }
    }

    #[test]
    fn unknown_names_fall_back_to_none() {
        assert_eq!(Compression::from_name(Some("zstd")), Compression::None);
    }

    #[test]
    fn lz4_body_is_length_prefixed() {
        let body = b"select * from system.local where key = 'local'".repeat(8);
        let compressed = Compression::Lz4.compress(&body).unwrap();

        assert_eq!(&compressed[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(Compression::Lz4.decompress(&compressed, usize::MAX).unwrap(), body);
    }

    #[test]
    fn snappy_round_trip() {
        let body = b"insert into ks.t (k, v) values (1, 2)".repeat(8);
        let compressed = Compression::Snappy.compress(&body).unwrap();

        assert_eq!(Compression::Snappy.decompress(&compressed, usize::MAX).unwrap(), body);
    }

    #[test]
    fn corrupt_lz4_body_fails() {
        assert!(matches!(
            Compression::Lz4.decompress(&[0, 0], usize::MAX),
            Err(CompressionError::MissingLength)
        ));
        assert!(Compression::Lz4.decompress(&[0, 0, 0, 64, 0xff], usize::MAX).is_err());
    }

    #[test]
    fn declared_length_over_the_limit_is_refused() {
        let body = vec![0; 32 * 1024];

        for compression in [Compression::Lz4, Compression::Snappy] {
            let compressed = compression.compress(&body).unwrap();
            assert!(compressed.len() < 4096);
            assert!(matches!(
                compression.decompress(&compressed, 4096),
                Err(CompressionError::TooLarge { size, max: 4096 }) if size == body.len()
            ));
            assert_eq!(compression.decompress(&compressed, body.len()).unwrap(), body);
        }
    }
}
