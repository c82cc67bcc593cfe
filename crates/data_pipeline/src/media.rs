//! src/media.rs
//!
//! Media transformer contract: decoding one encoded item into a fixed-size
//! region. Image, audio and text specifics live behind this trait; the
//! pipeline only cares that a successful return filled the output.
//!
//! Transformers are stateful (decode scratch, per-worker randomness) and are
//! never shared: the decode pool creates one instance per worker through a
//! [`MediaFactory`].

use anyhow::Result;
use std::sync::Arc;

/// Decodes encoded items into fixed-stride output.
pub trait MediaTransformer: Send {
    /// Decodes one datum into `out` (the full decoded stride) and returns the
    /// per-item metadata scalar.
    fn transform(&mut self, encoded: &[u8], out: &mut [u8]) -> Result<i32>;

    /// Decodes a datum and its target together, with coupled randomization
    /// (e.g. shared crop geometry between an image and its mask).
    fn transform_joint(
        &mut self,
        enc_datum: &[u8],
        enc_target: &[u8],
        out_datum: &mut [u8],
        out_target: &mut [u8],
    ) -> Result<()>;
}

/// Creates one transformer per decode worker, keyed by worker id.
pub type MediaFactory = Arc<dyn Fn(usize) -> Box<dyn MediaTransformer> + Send + Sync>;

/// Wraps a plain constructor closure into a [`MediaFactory`].
pub fn media_factory<M, F>(f: F) -> MediaFactory
where
    M: MediaTransformer + 'static,
    F: Fn(usize) -> M + Send + Sync + 'static,
{
    Arc::new(move |worker_id| Box::new(f(worker_id)))
}

/// Byte-identity transformer: copies the encoded bytes, truncating or
/// zero-padding to the output stride. The metadata scalar is the encoded
/// length. Deterministic, so single- and multi-threaded decodes of the same
/// items are byte-identical.
#[derive(Clone, Copy, Default)]
pub struct RawMedia;

impl MediaTransformer for RawMedia {
    fn transform(&mut self, encoded: &[u8], out: &mut [u8]) -> Result<i32> {
        let n = encoded.len().min(out.len());
        out[..n].copy_from_slice(&encoded[..n]);
        out[n..].fill(0);
        Ok(encoded.len() as i32)
    }

    fn transform_joint(
        &mut self,
        enc_datum: &[u8],
        enc_target: &[u8],
        out_datum: &mut [u8],
        out_target: &mut [u8],
    ) -> Result<()> {
        self.transform(enc_datum, out_datum)?;
        self.transform(enc_target, out_target)?;
        Ok(())
    }
}

#[cfg(test)]
mod media_test {
    use super::*;

    #[test]
    fn test_raw_media_pads_and_truncates() -> Result<()> {
        let mut media = RawMedia;

        let mut out = [0xFFu8; 6];
        let meta = media.transform(b"abc", &mut out)?;
        assert_eq!(&out, b"abc\0\0\0");
        assert_eq!(meta, 3);

        let mut short = [0u8; 2];
        let meta = media.transform(b"abcdef", &mut short)?;
        assert_eq!(&short, b"ab");
        assert_eq!(meta, 6);
        Ok(())
    }

    #[test]
    fn test_raw_media_joint() -> Result<()> {
        let mut media = RawMedia;
        let mut datum = [0u8; 4];
        let mut target = [0u8; 4];
        media.transform_joint(b"wxyz", b"01", &mut datum, &mut target)?;
        assert_eq!(&datum, b"wxyz");
        assert_eq!(&target, b"01\0\0");
        Ok(())
    }
}
