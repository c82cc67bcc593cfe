use crate::buffer::BufferTuple;
use anyhow::Result;

/// Source of encoded minibatches.
///
/// `read` fills the tuple with one minibatch: `batch_size` encoded items in
/// `data`, the corresponding encoded targets in `targets`, and optionally
/// meta. The pipeline resets the tuple's buffers before each call. An `Err`
/// is unrecoverable and shuts the pipeline down.
pub trait Reader: Send {
    fn read(&mut self, batch: &mut BufferTuple) -> Result<()>;

    /// Rewinds to the first item of the first epoch. Does not touch buffers.
    fn reset(&mut self);
}
