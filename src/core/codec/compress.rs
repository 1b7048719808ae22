//! Brotli helpers used by the codec worker.

use super::CodecError;
use crate::core::config::COMPRESSION_WINDOW;
use brotli::{CompressorWriter, Decompressor};
use std::io::{Read, Write};

const IO_BUFFER: usize = 4096;

/// Compress `data` with the given brotli quality (clamped to 0..=11).
pub fn compress_data(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2);
    {
        let mut w = CompressorWriter::new(&mut out, IO_BUFFER, level.min(11), COMPRESSION_WINDOW);
        w.write_all(data)?;
    }
    Ok(out)
}

/// Decompress brotli `data`, refusing to produce more than `limit` bytes.
pub fn decompress_data(data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut dec = Decompressor::new(data, IO_BUFFER).take(limit as u64 + 1);
    let mut out = Vec::with_capacity(limit.min(data.len().saturating_mul(4)));
    dec.read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(CodecError::TooLarge { limit });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_at_several_levels() {
        let data: Vec<u8> = b"peerdrop ".iter().copied().cycle().take(40_000).collect();
        for level in [0, 4, 11, 99] {
            let packed = compress_data(&data, level).unwrap();
            assert!(packed.len() < data.len());
            assert_eq!(decompress_data(&packed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn output_past_the_limit_is_refused() {
        let bomb = compress_data(&vec![0u8; 64 * 1024 * 1024], 5).unwrap();
        assert!(bomb.len() < 100_000);
        let err = decompress_data(&bomb, 512 * 1024).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { limit: 524_288 }));

        let exact = compress_data(b"twelve bytes", 5).unwrap();
        assert_eq!(decompress_data(&exact, 12).unwrap(), b"twelve bytes");
        assert!(decompress_data(&exact, 11).is_err());
    }
}
