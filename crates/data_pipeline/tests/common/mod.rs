#![allow(dead_code)]

use anyhow::{anyhow, Result};
use data_pipeline::{
    BufferTuple, Device, Loader, MediaTransformer, RawMedia, Reader, TargetMode,
};

/// Deterministic synthetic reader. Item `k` (a global counter across
/// minibatches) gets an encoded datum of `1 + k % datum_enc_max` patterned
/// bytes and an encoded target of exactly `target_enc_len` patterned bytes,
/// so any subset of the stream can be re-derived independently.
pub struct PatternReader {
    batch_size: usize,
    datum_enc_max: usize,
    target_enc_len: usize,
    cursor: usize,
    reads: usize,
    fail_after: Option<usize>,
}

impl PatternReader {
    pub fn new(batch_size: usize, datum_enc_max: usize, target_enc_len: usize) -> Self {
        Self {
            batch_size,
            datum_enc_max,
            target_enc_len,
            cursor: 0,
            reads: 0,
            fail_after: None,
        }
    }

    /// Makes `read` fail unrecoverably after `reads` successful calls.
    pub fn fail_after(mut self, reads: usize) -> Self {
        self.fail_after = Some(reads);
        self
    }

    pub fn datum_bytes(&self, k: usize) -> Vec<u8> {
        let len = 1 + k % self.datum_enc_max;
        (0..len)
            .map(|j| ((k.wrapping_mul(31).wrapping_add(j)) % 251) as u8)
            .collect()
    }

    pub fn target_bytes(&self, k: usize) -> Vec<u8> {
        (0..self.target_enc_len)
            .map(|j| ((k.wrapping_mul(17).wrapping_add(j)) % 249) as u8)
            .collect()
    }
}

impl Reader for PatternReader {
    fn read(&mut self, batch: &mut BufferTuple) -> Result<()> {
        if let Some(limit) = self.fail_after {
            if self.reads >= limit {
                return Err(anyhow!("synthetic reader exhausted after {limit} reads"));
            }
        }
        self.reads += 1;
        for _ in 0..self.batch_size {
            let k = self.cursor;
            self.cursor += 1;
            batch.data.push_item(&self.datum_bytes(k));
            batch.targets.push_item(&self.target_bytes(k));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.reads = 0;
    }
}

pub fn byte_sum(bytes: &[u8]) -> u64 {
    bytes.iter().map(|&b| b as u64).sum()
}

/// Single-threaded reference: reads and decodes the same stream without the
/// pipeline, returning the byte sum of every decoded datum and target.
pub fn reference_sum(
    reader: &mut dyn Reader,
    media: &mut dyn MediaTransformer,
    epochs: usize,
    minibatches: usize,
    batch_size: usize,
    datum_len: usize,
    target_len: usize,
    mode: TargetMode,
) -> Result<u64> {
    let mut batch = BufferTuple::default();
    let mut datum_out = vec![0u8; datum_len];
    let mut target_out = vec![0u8; target_len];
    let mut sum = 0u64;

    for _ in 0..epochs {
        reader.reset();
        for _ in 0..minibatches {
            batch.reset();
            reader.read(&mut batch)?;
            for j in 0..batch_size {
                let enc_datum = batch.data.try_item(j)?;
                let enc_target = batch.targets.try_item(j)?;
                match mode {
                    TargetMode::ReadContents => {
                        media.transform_joint(
                            enc_datum,
                            enc_target,
                            &mut datum_out,
                            &mut target_out,
                        )?;
                    }
                    TargetMode::RawCopy => {
                        media.transform(enc_datum, &mut datum_out)?;
                        let copied = enc_target.len().min(target_len);
                        target_out[..copied].copy_from_slice(&enc_target[..copied]);
                        target_out[copied..].fill(0);
                    }
                }
                sum += byte_sum(&datum_out) + byte_sum(&target_out);
            }
        }
    }
    Ok(sum)
}

/// Per-minibatch sums of the single-threaded reference decode, for
/// order-sensitive comparisons against the pipeline.
pub fn reference_minibatch_sums(
    reader: &mut dyn Reader,
    minibatches: usize,
    batch_size: usize,
    datum_len: usize,
    target_len: usize,
) -> Result<Vec<u64>> {
    let mut media = RawMedia;
    let mut batch = BufferTuple::default();
    let mut datum_out = vec![0u8; datum_len];
    let mut target_out = vec![0u8; target_len];
    let mut sums = Vec::with_capacity(minibatches);

    reader.reset();
    for _ in 0..minibatches {
        batch.reset();
        reader.read(&mut batch)?;
        let mut sum = 0u64;
        for j in 0..batch_size {
            media.transform(batch.data.try_item(j)?, &mut datum_out)?;
            let enc_target = batch.targets.try_item(j)?;
            let copied = enc_target.len().min(target_len);
            target_out[..copied].copy_from_slice(&enc_target[..copied]);
            target_out[copied..].fill(0);
            sum += byte_sum(&datum_out) + byte_sum(&target_out);
        }
        sums.push(sum);
    }
    Ok(sums)
}

/// Reference decode of a single item, for exact-content comparisons.
pub fn reference_item(reader: &PatternReader, k: usize, datum_len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; datum_len];
    let mut media = RawMedia;
    media.transform(&reader.datum_bytes(k), &mut out)?;
    Ok(out)
}

/// Runs the full pipeline for `epochs x minibatches`, copying each
/// minibatch back from its device slot and summing the bytes. Also checks
/// that the device slots alternate 0, 1, 0, 1 within each epoch.
pub fn pipeline_sum(loader: &mut Loader, epochs: usize, minibatches: usize) -> Result<u64> {
    let config = loader.config().clone();
    let data_len = config.batch_size * config.datum_len();
    let target_len = config.batch_size * config.target_len();
    let device = loader.device();

    let mut data = vec![0u8; data_len];
    let mut targets = vec![0u8; target_len];
    let mut sum = 0u64;

    loader.start()?;
    for _ in 0..epochs {
        loader.reset()?;
        for i in 0..minibatches {
            let slot = loader.next()?;
            assert_eq!(slot, i % 2, "device slots must alternate");
            device.copy_data_back(slot, &mut data)?;
            device.copy_labels_back(slot, &mut targets)?;
            sum += byte_sum(&data) + byte_sum(&targets);
        }
    }
    loader.stop();
    Ok(sum)
}

/// Per-minibatch sums for an already started loader.
pub fn collect_sums(loader: &mut Loader, minibatches: usize) -> Result<Vec<u64>> {
    let config = loader.config().clone();
    let data_len = config.batch_size * config.datum_len();
    let target_len = config.batch_size * config.target_len();
    let device = loader.device();

    let mut data = vec![0u8; data_len];
    let mut targets = vec![0u8; target_len];
    let mut sums = Vec::with_capacity(minibatches);

    for _ in 0..minibatches {
        let slot = loader.next()?;
        device.copy_data_back(slot, &mut data)?;
        device.copy_labels_back(slot, &mut targets)?;
        sums.push(byte_sum(&data) + byte_sum(&targets));
    }
    Ok(sums)
}
