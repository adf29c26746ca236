//! Scrape payload codec
//!
//! Scrape bodies are zstd-compressed on the poller and only decompressed by
//! the receiver right before pushing.

use crate::metrics::Metrics;
use std::time::Instant;
use streams_core::StageError;

/// zstd level used for scrape payloads
pub const COMPRESSION_LEVEL: i32 = 3;

/// Compress a scrape body
pub fn compress(data: &[u8]) -> Result<Vec<u8>, StageError> {
    let start = Instant::now();
    let compressed = zstd::encode_all(data, COMPRESSION_LEVEL)
        .map_err(|e| StageError::Compression(e.to_string()))?;

    if let Some(metrics) = Metrics::get() {
        metrics
            .poller_compress_time
            .observe(start.elapsed().as_secs_f64());
    }
    Ok(compressed)
}

/// Decompress a scrape payload
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, StageError> {
    let start = Instant::now();
    let raw = zstd::decode_all(data).map_err(|e| StageError::Compression(e.to_string()))?;

    if let Some(metrics) = Metrics::get() {
        metrics
            .receiver_decompress_time
            .observe(start.elapsed().as_secs_f64());
    }
    Ok(raw)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_text() {
        let body = b"# HELP up Target is up\n# TYPE up gauge\nup{job=\"node\"} 1\n".repeat(50);
        let compressed = compress(&body).unwrap();
        assert!(compressed.len() < body.len());
        assert_eq!(decompress(&compressed).unwrap(), body);
    }

    #[test]
    fn round_trip_binary_and_empty() {
        let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        assert_eq!(decompress(&compress(&binary).unwrap()).unwrap(), binary);
        assert!(decompress(&compress(&[]).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_compression_error() {
        let err = decompress(b"definitely not zstd").unwrap_err();
        assert!(matches!(err, StageError::Compression(_)));
    }
}
