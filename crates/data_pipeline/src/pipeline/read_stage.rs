//! src/pipeline/read_stage.rs
//!
//! Single-worker stage that fills read-pool slots with encoded minibatches.

use anyhow::anyhow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::error;

use crate::pipeline::pool::BufferPool;
use crate::reader::Reader;

pub(crate) struct ReadStage {
    handle: Option<thread::JoinHandle<()>>,
    shared: Arc<ReadShared>,
}

struct ReadShared {
    stop: AtomicBool,
    stopped: AtomicBool,
    failed: AtomicBool,
}

impl ReadStage {
    pub(crate) fn spawn(
        pool: Arc<BufferPool>,
        reader: Arc<Mutex<Box<dyn Reader>>>,
    ) -> anyhow::Result<Self> {
        let shared = Arc::new(ReadShared {
            stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("pipeline-read".to_string())
            .spawn(move || Self::run(pool, reader, thread_shared))?;

        Ok(Self {
            handle: Some(handle),
            shared,
        })
    }

    fn run(pool: Arc<BufferPool>, reader: Arc<Mutex<Box<dyn Reader>>>, shared: Arc<ReadShared>) {
        while !shared.stop.load(Ordering::Relaxed) {
            let outcome = pool.produce(|slot| {
                slot.reset();
                let mut reader = reader
                    .lock()
                    .map_err(|_| anyhow!("reader lock poisoned"))?;
                reader.read(slot)
            });

            match outcome {
                Ok(Some(())) => {}
                // Pool closed underneath us: the pipeline is stopping.
                Ok(None) => break,
                Err(err) => {
                    error!("reader failed, stopping pipeline: {err:#}");
                    shared.failed.store(true, Ordering::Release);
                    // Fatal: closing the pool surfaces the failure downstream.
                    pool.close();
                    break;
                }
            }
        }
        shared.stopped.store(true, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
