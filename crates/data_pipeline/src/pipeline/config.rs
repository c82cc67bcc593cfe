//! src/pipeline/config.rs
//!
//! Configuration for the loader pipeline.
//!
//! `LoaderConfig` stores the fixed-per-run minibatch layout and the options
//! forwarded to the reader.
//!
//! Example:
//! ```ignore
//! let config = LoaderConfig::builder()
//!     .batch_size(128)
//!     .datum_size(3 * 32 * 32)
//!     .target_size(1)
//!     .target_type_size(4)
//!     .build();
//! ```
//!
//! # Performance considerations:
//! - `num_workers = 0` derives the decode worker count from the hardware so
//!   each worker's item share saturates the available cores.
//! - Larger `batch_size` amortizes per-round barrier cost but raises latency
//!   and memory for both buffer pools.

use anyhow::{anyhow, Result};

/// How encoded targets become decoded targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TargetMode {
    /// Decode datum and target together through the transformer's joint
    /// entry point (coupled randomization).
    ReadContents,
    /// Copy the raw encoded target, truncating to the target stride and
    /// zero-padding; the original encoded length is recorded in the second
    /// half of the minibatch metadata.
    #[default]
    RawCopy,
}

/// Configuration for the loader.
#[derive(Clone)]
pub struct LoaderConfig {
    /// Items per minibatch.
    pub batch_size: usize,
    /// Decoded datum elements per item.
    pub datum_size: usize,
    /// Bytes per decoded datum element.
    pub datum_type_size: usize,
    /// Decoded target elements per item.
    pub target_size: usize,
    /// Bytes per decoded target element.
    pub target_type_size: usize,
    /// Target conversion mode.
    pub target_conversion: TargetMode,
    /// Decode workers (0 = derive from available parallelism).
    pub num_workers: usize,
    /// Reader pass-through: shuffle the item order each epoch.
    pub shuffle: bool,
    /// Reader pass-through: reshuffle archives between epochs.
    pub reshuffle: bool,
    /// Reader pass-through: first archive file index.
    pub start_file_idx: usize,
    /// Reader pass-through: percentage of the dataset to expose.
    pub subset_percent: u8,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            datum_size: 1,
            datum_type_size: 1,
            target_size: 1,
            target_type_size: 1,
            target_conversion: TargetMode::default(),
            num_workers: 0,
            shuffle: false,
            reshuffle: false,
            start_file_idx: 0,
            subset_percent: 100,
        }
    }
}

impl LoaderConfig {
    pub fn builder() -> LoaderConfigBuilder {
        LoaderConfigBuilder::default()
    }

    /// Decoded datum stride in bytes.
    pub fn datum_len(&self) -> usize {
        self.datum_size * self.datum_type_size
    }

    /// Decoded target stride in bytes.
    pub fn target_len(&self) -> usize {
        self.target_size * self.target_type_size
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be greater than 0"));
        }
        if self.datum_size == 0 || self.datum_type_size == 0 {
            return Err(anyhow!("datum dimensions must be greater than 0"));
        }
        if self.target_size == 0 || self.target_type_size == 0 {
            return Err(anyhow!("target dimensions must be greater than 0"));
        }
        if self.subset_percent > 100 {
            return Err(anyhow!(
                "subset_percent must be within 0..=100, got {}",
                self.subset_percent
            ));
        }
        Ok(())
    }
}

/// Builder for LoaderConfig with method chaining.
#[derive(Default)]
pub struct LoaderConfigBuilder {
    config: LoaderConfig,
}

impl LoaderConfigBuilder {
    /// Set the number of items per minibatch (must be > 0).
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the decoded datum shape (elements per item).
    pub fn datum_size(mut self, size: usize) -> Self {
        self.config.datum_size = size;
        self
    }

    /// Set the decoded datum element width in bytes.
    pub fn datum_type_size(mut self, size: usize) -> Self {
        self.config.datum_type_size = size;
        self
    }

    /// Set the decoded target shape (elements per item).
    pub fn target_size(mut self, size: usize) -> Self {
        self.config.target_size = size;
        self
    }

    /// Set the decoded target element width in bytes.
    pub fn target_type_size(mut self, size: usize) -> Self {
        self.config.target_type_size = size;
        self
    }

    /// Set how targets are converted.
    pub fn target_conversion(mut self, mode: TargetMode) -> Self {
        self.config.target_conversion = mode;
        self
    }

    /// Set the decode worker count; 0 derives it from the hardware.
    pub fn num_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = workers;
        self
    }

    /// Reader pass-through: shuffle the item order each epoch.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.config.shuffle = shuffle;
        self
    }

    /// Reader pass-through: reshuffle archives between epochs.
    pub fn reshuffle(mut self, reshuffle: bool) -> Self {
        self.config.reshuffle = reshuffle;
        self
    }

    /// Reader pass-through: first archive file index.
    pub fn start_file_idx(mut self, idx: usize) -> Self {
        self.config.start_file_idx = idx;
        self
    }

    /// Reader pass-through: percentage of the dataset to expose.
    pub fn subset_percent(mut self, percent: u8) -> Self {
        self.config.subset_percent = percent;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> LoaderConfig {
        self.config
    }
}
