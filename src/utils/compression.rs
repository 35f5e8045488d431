use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};

/// Compression algorithm used by the compression cipher
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    Lz4,
    Zstd,
}

/// Compresses data using the specified compression algorithm
///
/// # Errors
/// Returns `NetError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| NetError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses data that was compressed with the specified algorithm
///
/// The output may not exceed `limit` bytes; the LZ4 size prefix is checked
/// before anything is allocated.
///
/// # Errors
/// Returns `NetError::DecompressionFailure` if:
/// - Decompression fails
/// - Output size exceeds `limit`
pub fn decompress(data: &[u8], kind: CompressionKind, limit: usize) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => {
            if data.len() < 4 {
                return Err(NetError::DecompressionFailure);
            }

            // lz4_flex prepends the uncompressed size as a 4-byte little-endian u32
            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > limit {
                return Err(NetError::DecompressionFailure);
            }

            let decompressed = lz4_flex::decompress_size_prepended(data)
                .map_err(|_| NetError::DecompressionFailure)?;

            if decompressed.len() > limit {
                return Err(NetError::DecompressionFailure);
            }
            Ok(decompressed)
        }
        CompressionKind::Zstd => {
            use std::io::Read;

            let mut out = Vec::new();
            let mut reader =
                zstd::stream::Decoder::new(data).map_err(|_| NetError::DecompressionFailure)?;

            // Read in chunks to enforce the size limit
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > limit {
                            return Err(NetError::DecompressionFailure);
                        }
                    }
                    Err(_) => return Err(NetError::DecompressionFailure),
                }
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_lz4_compression_roundtrip() {
        let original = b"Hello, World! This is a test of LZ4 compression.";
        let compressed = compress(original, CompressionKind::Lz4).unwrap();
        let decompressed = decompress(&compressed, CompressionKind::Lz4, LIMIT).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zstd_compression_roundtrip() {
        let original = b"Hello, World! This is a test of Zstd compression.";
        let compressed = compress(original, CompressionKind::Zstd).unwrap();
        let decompressed = decompress(&compressed, CompressionKind::Zstd, LIMIT).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_lz4_claimed_size_over_limit() {
        // Claims to decompress to ~3 GB
        let payload = vec![0x2b, 0x60, 0xbb, 0xbb];
        assert!(decompress(&payload, CompressionKind::Lz4, LIMIT).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_limit_is_a_parameter() {
        let data = vec![7u8; 4096];
        let compressed = compress(&data, CompressionKind::Lz4).unwrap();
        assert!(decompress(&compressed, CompressionKind::Lz4, 4095).is_err());
        assert!(decompress(&compressed, CompressionKind::Lz4, 4096).is_ok());

        let compressed = compress(&data, CompressionKind::Zstd).unwrap();
        assert!(decompress(&compressed, CompressionKind::Zstd, 1000).is_err());
    }

    #[test]
    fn test_lz4_short_input_rejection() {
        let short_input = vec![0x2b, 0x60];
        assert!(decompress(&short_input, CompressionKind::Lz4, LIMIT).is_err());
    }

    #[test]
    fn test_malformed_compressed_data() {
        let malformed = vec![0x10, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff];
        assert!(decompress(&malformed, CompressionKind::Lz4, LIMIT).is_err());
    }
}
