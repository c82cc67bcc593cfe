//! src/pipeline/loader.rs
//!
//! The `Loader` facade: wires the reader, the buffer pools, the decode stage
//! and the device together, and exposes the trainer-facing surface
//! (`start`, `stop`, `reset`, `next`).

use anyhow::{anyhow, Result};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

use crate::device::{Device, DeviceKind};
use crate::media::MediaFactory;
use crate::pipeline::config::LoaderConfig;
use crate::pipeline::decode::DecodePool;
use crate::pipeline::pool::BufferPool;
use crate::pipeline::read_stage::ReadStage;
use crate::reader::Reader;

/// Counters accumulated since the last `start`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoaderStats {
    /// Minibatches decoded and copied to the device.
    pub minibatches: u64,
    /// Encoded targets that exceeded the target stride and were clipped.
    pub truncated_targets: u64,
}

/// Everything that only exists while the pipeline is running.
struct Running {
    read_pool: Arc<BufferPool>,
    decode_pool: Arc<BufferPool>,
    read_stage: ReadStage,
    decode: DecodePool,
}

/// Prefetching minibatch loader.
///
/// The loader owns the reader, the device handle and both buffer pools; the
/// stages hold shared pool references for the lifetime of one run. `next()`
/// blocks until a decoded minibatch is resident on the device and returns
/// the device slot holding it; the previous minibatch's slot is released on
/// the following call, so the trainer always computes on one slot while the
/// pipeline fills the other.
///
/// # Example
/// ```ignore
/// let mut loader = Loader::new(config, reader, media_factory(|_| RawMedia), device)?;
/// loader.start()?;
/// for _ in 0..minibatches {
///     let slot = loader.next()?;
///     // consume device slot `slot`
/// }
/// loader.stop();
/// ```
pub struct Loader {
    config: LoaderConfig,
    device: Arc<dyn Device>,
    reader: Arc<Mutex<Box<dyn Reader>>>,
    media_factory: MediaFactory,
    running: Option<Running>,
    first: bool,
}

impl Loader {
    /// Creates a stopped loader. Fails on invalid configuration; nothing is
    /// spawned until [`Loader::start`].
    pub fn new(
        config: LoaderConfig,
        reader: Box<dyn Reader>,
        media_factory: MediaFactory,
        device: Arc<dyn Device>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device,
            reader: Arc::new(Mutex::new(reader)),
            media_factory,
            running: None,
            first: true,
        })
    }

    /// Allocates the pools and spawns the pipeline threads: decode stage
    /// first, then the read thread, so reads are drained from the start.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(anyhow!("pipeline already started"));
        }

        let data_len = self.config.batch_size * self.config.datum_len();
        let target_len = self.config.batch_size * self.config.target_len();
        let meta_len = 2 * self.config.batch_size;

        // Read slots start at an estimate of the encoded size and grow on
        // demand; decode slots hold the exact decoded minibatch.
        let read_pool = Arc::new(BufferPool::new(
            (data_len / 8).max(1),
            target_len,
            meta_len,
            false,
        ));
        let pinned = self.device.kind() != DeviceKind::Cpu;
        let decode_pool = Arc::new(BufferPool::new(data_len, target_len, meta_len, pinned));

        let worker_count = self.worker_count();
        let decode = DecodePool::spawn(
            worker_count,
            &self.config,
            Arc::clone(&read_pool),
            Arc::clone(&decode_pool),
            Arc::clone(&self.device),
            &self.media_factory,
        )?;
        let read_stage = ReadStage::spawn(Arc::clone(&read_pool), Arc::clone(&self.reader))?;

        self.running = Some(Running {
            read_pool,
            decode_pool,
            read_stage,
            decode,
        });
        self.first = true;
        debug!(workers = worker_count, "pipeline started");
        Ok(())
    }

    /// Stops the pipeline and joins every thread. No-op when not running.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let Running {
            read_pool,
            decode_pool,
            read_stage,
            mut decode,
        } = running;

        read_stage.request_stop();
        // Keep draining decoded output so the read thread can push its last
        // minibatch and observe the stop flag.
        while !read_stage.is_stopped() && !decode.is_manager_stopped() {
            decode_pool.try_release_read();
            thread::yield_now();
        }
        while (!decode_pool.is_empty() || !read_pool.is_empty()) && !decode.is_manager_stopped() {
            decode_pool.try_release_read();
            thread::yield_now();
        }

        decode.stop();
        read_stage.join();
        self.first = true;
        debug!("pipeline stopped");
    }

    /// `stop`, rewind the reader, `start`. Restarts from the reader's
    /// initial position with the same configuration.
    pub fn reset(&mut self) -> Result<()> {
        self.stop();
        {
            let mut reader = self
                .reader
                .lock()
                .map_err(|_| anyhow!("reader lock poisoned"))?;
            reader.reset();
        }
        self.start()
    }

    /// Blocks until the next minibatch is resident on the device and returns
    /// the device slot holding it.
    ///
    /// The previous minibatch's slot is released first (except on the first
    /// call after `start`), which lets the decode stage refill it while the
    /// trainer consumes the new one. Errors once the pipeline has stopped —
    /// including after a reader or device failure has drained through.
    pub fn next(&mut self) -> Result<usize> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| anyhow!("pipeline is not started"))?;

        if self.first {
            self.first = false;
        } else {
            running.decode_pool.release_read();
        }

        running
            .decode_pool
            .wait_non_empty(|slot| slot.device_slot)
            .ok_or_else(|| {
                if running.read_stage.has_failed() {
                    anyhow!("pipeline stopped: reader failed")
                } else {
                    anyhow!("pipeline stopped before the next minibatch was ready")
                }
            })
    }

    /// Blocking dequeue that copies the decoded host buffers out and
    /// immediately releases the slot. Validation path; do not interleave
    /// with [`Loader::next`], which holds its slot across calls.
    pub fn next_into(&mut self, data: &mut [u8], targets: &mut [u8]) -> Result<()> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| anyhow!("pipeline is not started"))?;

        let outcome = running.decode_pool.consume(|slot| {
            if slot.data.len() < data.len() || slot.targets.len() < targets.len() {
                return Err(anyhow!(
                    "minibatch holds {}+{} bytes, caller asked for {}+{}",
                    slot.data.len(),
                    slot.targets.len(),
                    data.len(),
                    targets.len()
                ));
            }
            data.copy_from_slice(&slot.data.as_slice()[..data.len()]);
            targets.copy_from_slice(&slot.targets.as_slice()[..targets.len()]);
            Ok(())
        })?;

        outcome.ok_or_else(|| anyhow!("pipeline stopped before the next minibatch was ready"))
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn device(&self) -> Arc<dyn Device> {
        Arc::clone(&self.device)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Counters for the current run; zeros while stopped.
    pub fn stats(&self) -> LoaderStats {
        match &self.running {
            Some(running) => LoaderStats {
                minibatches: running.decode.minibatches(),
                truncated_targets: running.decode.truncated_targets(),
            },
            None => LoaderStats::default(),
        }
    }

    /// Smallest worker count whose per-worker item share saturates the
    /// available cores, capped at the batch size. An explicit
    /// `config.num_workers` overrides the derivation.
    fn worker_count(&self) -> usize {
        let batch = self.config.batch_size;
        if self.config.num_workers > 0 {
            return self.config.num_workers.min(batch);
        }
        let cores = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let items_per_thread = (batch - 1) / cores + 1;
        ((batch - 1) / items_per_thread + 1).min(batch)
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.stop();
    }
}
