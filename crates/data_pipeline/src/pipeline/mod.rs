//! src/pipeline/mod.rs
//!
//! The staged minibatch loading pipeline.
//!
//! Training consumes fixed-size minibatches of decoded items; decoding is
//! CPU-heavy and variable-latency while training steps are short. The
//! pipeline hides the asymmetry behind prefetching and double buffering so
//! `next()` returns minibatches already resident on the device.
//!
//! # Architecture Overview
//!
//! ```text
//!           read pool (2 slots)          decode pool (2 slots)
//! Reader ─────────────────► DecodePool ─────────────────► Device
//! (1 thread)               (N workers +                 (2 slots,
//!                           1 manager)                   ping-pong)
//! ```
//!
//! - The read stage fills read-pool slots with encoded minibatches.
//! - The decode manager pulls a filled slot, fans the items out to `N`
//!   workers (each owns a contiguous item range), awaits all of them,
//!   transposes the decoded batch to element-major layout and copies it
//!   into the device slot the trainer is *not* using.
//! - `Loader::next` blocks until a decoded slot is available, releasing the
//!   previously held one first.
//!
//! Both pools are bounded, so a stalled trainer backpressures the decoder
//! and a stalled decoder backpressures the reader.
//!
//! # Module Structure
//!
//! ```text
//! src/pipeline/
//! ├── mod.rs             # Public API exports + architecture docs
//! ├── config.rs          # LoaderConfig, builder, and validation
//! ├── pool.rs            # Bounded BufferPool mailbox between stages
//! ├── read_stage.rs      # Single-threaded encoded-minibatch producer
//! ├── decode.rs          # DecodePool: N workers + manager + barrier
//! └── loader.rs          # Loader facade (start/stop/reset/next)
//! ```

mod config;
mod decode;
mod loader;
mod pool;
mod read_stage;

pub use config::{LoaderConfig, LoaderConfigBuilder, TargetMode};
pub use loader::{Loader, LoaderStats};
