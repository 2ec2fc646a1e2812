//! Block decompression.
//!
//! Stateless and reentrant; worker threads call into this module
//! concurrently. Codec selection is explicit enum dispatch on
//! [`CodecTag`] — no trait objects on the decode path.

use crate::pool::CancelFlag;
use sfs_error::{Result, SfsError};
use sfs_types::{BlockId, CodecTag};
use std::io::Read;
use tracing::trace;

/// Step size for the cancellable streaming decode path.
const DECODE_STEP: usize = 64 * 1024;

/// Decompress one block.
///
/// `expected_len` is the decompressed size recorded for the block; a
/// mismatch is reported as corruption. For streaming codecs the
/// cancellation flag is polled between steps until the decoded
/// fraction reaches `decompress_ratio`, after which the remainder is
/// materialized upfront without further polls.
pub fn decode_block(
    compressed: &[u8],
    codec_raw: u8,
    expected_len: usize,
    block: BlockId,
    decompress_ratio: f64,
    cancel: &CancelFlag,
) -> Result<Vec<u8>> {
    let codec = CodecTag::from_raw(codec_raw).map_err(SfsError::UnsupportedCodec)?;

    trace!(
        target: "sfs::block::decode",
        event = "decode_start",
        block = block.0,
        codec = %codec,
        compressed_len = compressed.len(),
        expected_len
    );

    let bytes = match codec {
        CodecTag::None => compressed.to_vec(),
        CodecTag::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(compressed)
                .map_err(|err| corrupt(block, &err))?;
            read_cancellable(decoder, expected_len, decompress_ratio, cancel, block)?
        }
        CodecTag::Lzma => {
            let mut input = compressed;
            let mut out = Vec::with_capacity(expected_len);
            lzma_rs::lzma_decompress(&mut input, &mut out)
                .map_err(|err| corrupt(block, &err))?;
            out
        }
        CodecTag::Lz4 => lz4_flex::block::decompress(compressed, expected_len)
            .map_err(|err| corrupt(block, &err))?,
        CodecTag::Brotli => {
            let decoder = brotli::Decompressor::new(compressed, DECODE_STEP);
            read_cancellable(decoder, expected_len, decompress_ratio, cancel, block)?
        }
    };

    if bytes.len() != expected_len {
        return Err(SfsError::CorruptBlock {
            block: u64::from(block.0),
            detail: format!(
                "decompressed to {} bytes, expected {expected_len}",
                bytes.len()
            ),
        });
    }

    Ok(bytes)
}

/// Drain a streaming decoder in steps, polling the cancellation flag
/// until `ratio * expected_len` bytes are out.
fn read_cancellable(
    mut decoder: impl Read,
    expected_len: usize,
    ratio: f64,
    cancel: &CancelFlag,
    block: BlockId,
) -> Result<Vec<u8>> {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    let poll_until = (expected_len as f64 * ratio.clamp(0.0, 1.0)) as usize;

    let mut out = Vec::with_capacity(expected_len);
    let mut step = vec![0_u8; DECODE_STEP];

    while out.len() < poll_until {
        if cancel.is_cancelled() {
            return Err(SfsError::Cancelled);
        }
        let n = decoder
            .read(&mut step)
            .map_err(|err| corrupt(block, &err))?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&step[..n]);
    }

    // Past the ratio: short-circuit and materialize the rest upfront.
    decoder
        .read_to_end(&mut out)
        .map_err(|err| corrupt(block, &err))?;
    Ok(out)
}

fn corrupt(block: BlockId, err: &dyn std::fmt::Display) -> SfsError {
    SfsError::CorruptBlock {
        block: u64::from(block.0),
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATIO: f64 = 0.8;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn decode_passthrough() {
        let data = sample(100);
        let out = decode_block(&data, 0, 100, BlockId(0), RATIO, &CancelFlag::default())
            .expect("decode none");
        assert_eq!(out, data);
    }

    #[test]
    fn decode_zstd_round_trip() {
        let data = sample(200_000);
        let compressed = zstd::bulk::compress(&data, 3).expect("compress");
        let out = decode_block(
            &compressed,
            1,
            data.len(),
            BlockId(7),
            RATIO,
            &CancelFlag::default(),
        )
        .expect("decode zstd");
        assert_eq!(out, data);
    }

    #[test]
    fn decode_lzma_round_trip() {
        let data = sample(5000);
        let mut compressed = Vec::new();
        lzma_rs::lzma_compress(&mut data.as_slice(), &mut compressed).expect("compress");
        let out = decode_block(
            &compressed,
            2,
            data.len(),
            BlockId(1),
            RATIO,
            &CancelFlag::default(),
        )
        .expect("decode lzma");
        assert_eq!(out, data);
    }

    #[test]
    fn decode_lz4_round_trip() {
        let data = sample(5000);
        let compressed = lz4_flex::block::compress(&data);
        let out = decode_block(
            &compressed,
            3,
            data.len(),
            BlockId(2),
            RATIO,
            &CancelFlag::default(),
        )
        .expect("decode lz4");
        assert_eq!(out, data);
    }

    #[test]
    fn decode_brotli_round_trip() {
        let data = sample(5000);
        let mut compressed = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            std::io::Write::write_all(&mut writer, &data).expect("compress");
        }
        let out = decode_block(
            &compressed,
            4,
            data.len(),
            BlockId(3),
            RATIO,
            &CancelFlag::default(),
        )
        .expect("decode brotli");
        assert_eq!(out, data);
    }

    #[test]
    fn unknown_codec_is_reported() {
        let err = decode_block(&[], 42, 0, BlockId(0), RATIO, &CancelFlag::default())
            .unwrap_err();
        assert!(matches!(err, SfsError::UnsupportedCodec(42)));
    }

    #[test]
    fn truncated_zstd_is_corrupt() {
        let data = sample(10_000);
        let compressed = zstd::bulk::compress(&data, 3).expect("compress");
        let err = decode_block(
            &compressed[..compressed.len() / 2],
            1,
            data.len(),
            BlockId(9),
            RATIO,
            &CancelFlag::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SfsError::CorruptBlock { block: 9, .. }));
    }

    #[test]
    fn short_output_is_corrupt() {
        let data = sample(100);
        let err = decode_block(&data, 0, 200, BlockId(4), RATIO, &CancelFlag::default())
            .unwrap_err();
        assert!(matches!(err, SfsError::CorruptBlock { .. }));
    }

    #[test]
    fn cancelled_background_decode_stops() {
        let data = sample(400_000);
        let compressed = zstd::bulk::compress(&data, 1).expect("compress");
        let cancel = CancelFlag::default();
        cancel.cancel();
        let err = decode_block(
            &compressed,
            1,
            data.len(),
            BlockId(5),
            RATIO,
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, SfsError::Cancelled));
    }
}
