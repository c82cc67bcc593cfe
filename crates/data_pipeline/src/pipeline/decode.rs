//! src/pipeline/decode.rs
//!
//! Multi-worker decode stage: a manager thread pulls encoded minibatches
//! from the read pool, fans the items out to `N` decode workers, awaits the
//! per-round barrier, assembles the decoded minibatch in element-major
//! layout and copies it to the device.
//!
//! # Round protocol
//!
//! Each worker owns one bounded(1) task channel; the manager starts a round
//! by sending every worker a task carrying the shared encoded input and the
//! worker's scratch partition. A worker can never observe a second start
//! before the manager has collected its previous completion, because the
//! scratch it needs travels inside the messages. The barrier is the manager
//! receiving exactly `N` completions on the shared done channel.
//!
//! The scratch partitions keep the write side partitioned: worker `id` only
//! ever produces bytes for items `[start_ind, end_ind)`. The manager
//! scatters each returned partition straight into its transposed position in
//! the output slot.
//!
//! # Double buffering
//!
//! The device retains two minibatch slots. The manager copies round `k` into
//! slot `k % 2` (a private toggle) and records the slot in the published
//! tuple, so the trainer reads slot `k` while round `k + 1` is being
//! transferred into the other one.
//!
//! # Shutdown
//!
//! The manager closes both pools on every exit path (device failure, decode
//! failure, upstream close), which wakes any stage blocked on a pool.
//! Workers exit when their task channel disconnects or the done flag is set.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn};

use crate::buffer::BufferTuple;
use crate::device::Device;
use crate::matrix;
use crate::media::{MediaFactory, MediaTransformer};
use crate::pipeline::config::{LoaderConfig, TargetMode};
use crate::pipeline::pool::BufferPool;

/// Minibatch layout constants shared by the manager and every worker.
#[derive(Clone)]
struct DecodeParams {
    batch_size: usize,
    datum_size: usize,
    datum_type_size: usize,
    target_size: usize,
    target_type_size: usize,
    datum_len: usize,
    target_len: usize,
    target_conversion: TargetMode,
}

impl DecodeParams {
    fn from_config(config: &LoaderConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            datum_size: config.datum_size,
            datum_type_size: config.datum_type_size,
            target_size: config.target_size,
            target_type_size: config.target_type_size,
            datum_len: config.datum_len(),
            target_len: config.target_len(),
            target_conversion: config.target_conversion,
        }
    }
}

/// Splits `[0, batch_size)` into `worker_count` contiguous ranges of
/// `ceil(batch_size / worker_count)` items, the last one short.
fn partition(batch_size: usize, worker_count: usize) -> Vec<(usize, usize)> {
    let items_per_thread = (batch_size - 1) / worker_count + 1;
    (0..worker_count)
        .map(|id| {
            let start = id * items_per_thread;
            let end = (start + items_per_thread).min(batch_size);
            (start, end)
        })
        .take_while(|&(start, end)| start < end)
        .collect()
}

/// One worker's owned output region: decoded items `[start_ind, end_ind)`
/// in item-major layout, plus the per-item metadata halves.
struct WorkerScratch {
    start_ind: usize,
    end_ind: usize,
    data: Vec<u8>,
    targets: Vec<u8>,
    meta: Vec<i32>,
    target_lens: Vec<i32>,
}

impl WorkerScratch {
    fn new(start_ind: usize, end_ind: usize, params: &DecodeParams) -> Self {
        let items = end_ind - start_ind;
        Self {
            start_ind,
            end_ind,
            data: vec![0; items * params.datum_len],
            targets: vec![0; items * params.target_len],
            meta: vec![0; items],
            target_lens: vec![0; items],
        }
    }
}

struct RoundTask {
    input: Arc<BufferTuple>,
    scratch: WorkerScratch,
}

struct RoundDone {
    id: usize,
    scratch: WorkerScratch,
    result: Result<()>,
}

pub(crate) struct DecodeShared {
    done: AtomicBool,
    manager_stopped: AtomicBool,
    minibatches: AtomicU64,
    truncated_targets: AtomicU64,
}

/// The decode stage: `N` workers plus one manager thread.
pub(crate) struct DecodePool {
    manager: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
    read_pool: Arc<BufferPool>,
    decode_pool: Arc<BufferPool>,
    shared: Arc<DecodeShared>,
}

impl DecodePool {
    pub(crate) fn spawn(
        worker_count: usize,
        config: &LoaderConfig,
        read_pool: Arc<BufferPool>,
        decode_pool: Arc<BufferPool>,
        device: Arc<dyn Device>,
        media_factory: &MediaFactory,
    ) -> Result<Self> {
        let params = DecodeParams::from_config(config);
        let bounds = partition(config.batch_size, worker_count);
        let shared = Arc::new(DecodeShared {
            done: AtomicBool::new(false),
            manager_stopped: AtomicBool::new(false),
            minibatches: AtomicU64::new(0),
            truncated_targets: AtomicU64::new(0),
        });

        let (done_tx, done_rx) = bounded(bounds.len());
        let mut task_txs = Vec::with_capacity(bounds.len());
        let mut scratches = Vec::with_capacity(bounds.len());
        let mut workers = Vec::with_capacity(bounds.len());

        for (id, &(start_ind, end_ind)) in bounds.iter().enumerate() {
            let (task_tx, task_rx) = bounded(1);
            task_txs.push(task_tx);
            scratches.push(Some(WorkerScratch::new(start_ind, end_ind, &params)));

            let media = media_factory(id);
            let done_tx = done_tx.clone();
            let worker_params = params.clone();
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("decode-worker-{id}"))
                .spawn(move || worker_loop(id, task_rx, done_tx, media, worker_params, worker_shared))
                .with_context(|| format!("failed to spawn decode worker {id}"))?;
            workers.push(handle);
        }
        // Workers hold the only senders now; the channel disconnects when
        // they all exit.
        drop(done_tx);

        debug!(workers = bounds.len(), "decode pool starting");
        let manager_state = Manager {
            read_pool: Arc::clone(&read_pool),
            decode_pool: Arc::clone(&decode_pool),
            device,
            task_txs,
            done_rx,
            scratches,
            buffer_index: 0,
            params,
            shared: Arc::clone(&shared),
        };
        let manager = thread::Builder::new()
            .name("decode-manager".to_string())
            .spawn(move || manager_state.run())
            .context("failed to spawn decode manager")?;

        Ok(Self {
            manager: Some(manager),
            workers,
            read_pool,
            decode_pool,
            shared,
        })
    }

    /// Stops the stage: closes both pools, joins the manager, then the
    /// workers (their task channels disconnect when the manager drops them).
    pub(crate) fn stop(&mut self) {
        self.shared.done.store(true, Ordering::Relaxed);
        self.read_pool.close();
        self.decode_pool.close();
        if let Some(handle) = self.manager.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub(crate) fn is_manager_stopped(&self) -> bool {
        self.shared.manager_stopped.load(Ordering::Acquire)
    }

    pub(crate) fn minibatches(&self) -> u64 {
        self.shared.minibatches.load(Ordering::Relaxed)
    }

    pub(crate) fn truncated_targets(&self) -> u64 {
        self.shared.truncated_targets.load(Ordering::Relaxed)
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Manager {
    read_pool: Arc<BufferPool>,
    decode_pool: Arc<BufferPool>,
    device: Arc<dyn Device>,
    task_txs: Vec<Sender<RoundTask>>,
    done_rx: Receiver<RoundDone>,
    scratches: Vec<Option<WorkerScratch>>,
    buffer_index: usize,
    params: DecodeParams,
    shared: Arc<DecodeShared>,
}

impl Manager {
    fn run(mut self) {
        match self.device.init() {
            Ok(()) => self.consume_loop(),
            Err(err) => error!("device initialization failed: {err:#}"),
        }
        // Unblock every stage regardless of why we are exiting.
        self.read_pool.close();
        self.decode_pool.close();
        self.shared.manager_stopped.store(true, Ordering::Release);
    }

    fn consume_loop(&mut self) {
        while !self.shared.done.load(Ordering::Relaxed) {
            match self.consume() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    error!("decode round failed, stopping pipeline: {err:#}");
                    break;
                }
            }
        }
    }

    /// Takes one encoded minibatch from the read pool and runs a decode
    /// round on it. Returns whether a minibatch was committed downstream.
    fn consume(&mut self) -> Result<bool> {
        let read_pool = Arc::clone(&self.read_pool);
        let outcome = read_pool.consume(|slot| {
            // Share the encoded batch with the workers for the duration of
            // the round, then put it back for slot reuse.
            let input = Arc::new(std::mem::take(slot));
            let produced = self.produce(&input);
            match Arc::try_unwrap(input) {
                Ok(tuple) => {
                    *slot = tuple;
                    produced
                }
                Err(_) => produced.and(Err(anyhow!(
                    "encoded minibatch still shared after its decode round"
                ))),
            }
        })?;
        Ok(matches!(outcome, Some(true)))
    }

    /// Runs the decode round while holding the output slot. Returns `false`
    /// if the decode pool closed before a slot was free.
    fn produce(&mut self, input: &Arc<BufferTuple>) -> Result<bool> {
        let decode_pool = Arc::clone(&self.decode_pool);
        let committed = decode_pool.produce(|out| self.run_round(input, out))?;
        Ok(committed.is_some())
    }

    fn run_round(&mut self, input: &Arc<BufferTuple>, out: &mut BufferTuple) -> Result<()> {
        let batch_size = self.params.batch_size;
        out.data.fill_len(batch_size * self.params.datum_len);
        out.targets.fill_len(batch_size * self.params.target_len);
        out.meta.fill_len(2 * batch_size);

        // Fan out one task per worker.
        for id in 0..self.task_txs.len() {
            let scratch = self.scratches[id]
                .take()
                .ok_or_else(|| anyhow!("decode worker {id} scratch missing"))?;
            self.task_txs[id]
                .send(RoundTask {
                    input: Arc::clone(input),
                    scratch,
                })
                .map_err(|_| anyhow!("decode worker {id} is gone"))?;
        }

        // Barrier: the minibatch is whole only after all workers report.
        let mut round = Ok(());
        for _ in 0..self.task_txs.len() {
            let done = self
                .done_rx
                .recv()
                .map_err(|_| anyhow!("decode workers disconnected mid-round"))?;
            self.gather(&done.scratch, out);
            if round.is_ok() {
                round = done.result;
            }
            self.scratches[done.id] = Some(done.scratch);
        }
        round?;

        // Host to device, then flip the slot for the next round.
        self.device
            .copy_data(self.buffer_index, out.data.as_slice())?;
        self.device
            .copy_labels(self.buffer_index, out.targets.as_slice())?;
        self.device
            .copy_meta(self.buffer_index, out.meta.as_slice())?;
        out.device_slot = self.buffer_index;
        self.buffer_index = 1 - self.buffer_index;
        self.shared.minibatches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Scatters one worker's item-major partition into the element-major
    /// output slot, and its metadata into the two halves of `meta`.
    fn gather(&self, scratch: &WorkerScratch, out: &mut BufferTuple) {
        matrix::transpose_rows(
            &scratch.data,
            out.data.as_mut_slice(),
            scratch.start_ind,
            self.params.batch_size,
            self.params.datum_size,
            self.params.datum_type_size,
        );
        matrix::transpose_rows(
            &scratch.targets,
            out.targets.as_mut_slice(),
            scratch.start_ind,
            self.params.batch_size,
            self.params.target_size,
            self.params.target_type_size,
        );
        let meta = out.meta.as_mut_slice();
        for (k, i) in (scratch.start_ind..scratch.end_ind).enumerate() {
            meta[i] = scratch.meta[k];
            meta[self.params.batch_size + i] = scratch.target_lens[k];
        }
    }
}

fn worker_loop(
    id: usize,
    task_rx: Receiver<RoundTask>,
    done_tx: Sender<RoundDone>,
    mut media: Box<dyn MediaTransformer>,
    params: DecodeParams,
    shared: Arc<DecodeShared>,
) {
    while !shared.done.load(Ordering::Relaxed) {
        let RoundTask { input, mut scratch } = match task_rx.recv() {
            Ok(task) => task,
            Err(_) => break,
        };
        let result = decode_partition(&input, &mut scratch, media.as_mut(), &params, &shared);
        // Release the shared input before reporting, so the manager can
        // reclaim it once the barrier completes.
        drop(input);
        if done_tx.send(RoundDone { id, scratch, result }).is_err() {
            break;
        }
    }
}

/// Decodes one worker's item range into its scratch partition.
fn decode_partition(
    input: &BufferTuple,
    scratch: &mut WorkerScratch,
    media: &mut dyn MediaTransformer,
    params: &DecodeParams,
    shared: &DecodeShared,
) -> Result<()> {
    let datum_len = params.datum_len;
    let target_len = params.target_len;
    scratch.meta.fill(0);
    scratch.target_lens.fill(0);

    let mut decoded = 0;
    for (k, i) in (scratch.start_ind..scratch.end_ind).enumerate() {
        // The reader contract is a full batch every read; a short batch
        // decodes the items present.
        let Some(enc_datum) = input.data.item(i) else {
            break;
        };
        let enc_target = input.targets.item(i).unwrap_or(&[]);
        let datum_out = &mut scratch.data[k * datum_len..(k + 1) * datum_len];
        let target_out = &mut scratch.targets[k * target_len..(k + 1) * target_len];

        match params.target_conversion {
            TargetMode::ReadContents => {
                media
                    .transform_joint(enc_datum, enc_target, datum_out, target_out)
                    .with_context(|| format!("joint decode failed for item {i}"))?;
            }
            TargetMode::RawCopy => {
                scratch.meta[k] = media
                    .transform(enc_datum, datum_out)
                    .with_context(|| format!("datum decode failed for item {i}"))?;
                if enc_target.len() > target_len
                    && shared.truncated_targets.fetch_add(1, Ordering::Relaxed) == 0
                {
                    warn!(
                        "encoded target ({} bytes) exceeds the {} byte stride; truncating and counting",
                        enc_target.len(),
                        target_len
                    );
                }
                let copied = enc_target.len().min(target_len);
                target_out[..copied].copy_from_slice(&enc_target[..copied]);
                target_out[copied..].fill(0);
                scratch.target_lens[k] = enc_target.len() as i32;
            }
        }
        decoded += 1;
    }

    // Anything the reader did not supply decodes to zeros.
    scratch.data[decoded * datum_len..].fill(0);
    scratch.targets[decoded * target_len..].fill(0);
    Ok(())
}

#[cfg(test)]
mod decode_test {
    use super::*;

    #[test]
    fn test_partition_covers_batch_exactly() {
        assert_eq!(partition(7, 3), vec![(0, 3), (3, 6), (6, 7)]);
        assert_eq!(partition(1, 1), vec![(0, 1)]);
        assert_eq!(partition(4, 4), vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
        assert_eq!(partition(128, 1), vec![(0, 128)]);
    }

    #[test]
    fn test_partition_never_overlaps_or_leaks() {
        for batch_size in 1..=64usize {
            for worker_count in 1..=batch_size {
                let bounds = partition(batch_size, worker_count);
                let mut covered = vec![0u8; batch_size];
                for &(start, end) in &bounds {
                    assert!(start < end, "empty range for B={batch_size} N={worker_count}");
                    for item in start..end {
                        covered[item] += 1;
                    }
                }
                assert!(
                    covered.iter().all(|&c| c == 1),
                    "coverage broken for B={batch_size} N={worker_count}"
                );
                assert_eq!(bounds.last().map(|&(_, end)| end), Some(batch_size));
            }
        }
    }

    #[test]
    fn test_partition_drops_idle_workers() {
        // More workers than items: trailing workers get no range at all.
        let bounds = partition(2, 8);
        assert_eq!(bounds, vec![(0, 1), (1, 2)]);
    }

    fn test_params(batch_size: usize) -> DecodeParams {
        DecodeParams {
            batch_size,
            datum_size: 4,
            datum_type_size: 1,
            target_size: 2,
            target_type_size: 1,
            datum_len: 4,
            target_len: 2,
            target_conversion: TargetMode::RawCopy,
        }
    }

    fn test_shared() -> DecodeShared {
        DecodeShared {
            done: AtomicBool::new(false),
            manager_stopped: AtomicBool::new(false),
            minibatches: AtomicU64::new(0),
            truncated_targets: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_decode_partition_raw_copy() -> Result<()> {
        let params = test_params(3);
        let shared = test_shared();
        let mut input = BufferTuple::default();
        input.data.push_item(b"aa");
        input.data.push_item(b"bbbbbb");
        input.data.push_item(b"c");
        input.targets.push_item(b"x");
        input.targets.push_item(b"yyyy");
        input.targets.push_item(b"z");

        let mut scratch = WorkerScratch::new(0, 3, &params);
        let mut media = crate::media::RawMedia;
        decode_partition(&input, &mut scratch, &mut media, &params, &shared)?;

        assert_eq!(&scratch.data[..8], &b"aa\0\0bbbb"[..]);
        assert_eq!(&scratch.data[8..], &b"c\0\0\0"[..]);
        assert_eq!(&scratch.targets[..], &b"x\0yyz\0"[..]);
        assert_eq!(scratch.meta, vec![2, 6, 1]);
        // Original encoded lengths, including the truncated one.
        assert_eq!(scratch.target_lens, vec![1, 4, 1]);
        assert_eq!(shared.truncated_targets.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn test_decode_partition_zeroes_missing_items() -> Result<()> {
        let params = test_params(4);
        let shared = test_shared();
        let mut input = BufferTuple::default();
        input.data.push_item(b"only");
        input.targets.push_item(b"t");

        let mut scratch = WorkerScratch::new(0, 4, &params);
        scratch.data.fill(0xFF);
        scratch.targets.fill(0xFF);
        let mut media = crate::media::RawMedia;
        decode_partition(&input, &mut scratch, &mut media, &params, &shared)?;

        assert_eq!(&scratch.data[..4], b"only");
        assert!(scratch.data[4..].iter().all(|&b| b == 0));
        assert!(scratch.targets[2..].iter().all(|&b| b == 0));
        Ok(())
    }
}
