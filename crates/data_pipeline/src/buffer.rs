//! src/buffer.rs
//!
//! Item buffers shared between pipeline stages.
//!
//! A [`Buffer`] stores `k` variable-length items concatenated end-to-end in a
//! single contiguous region, plus a per-item index so `item(i)` resolves to a
//! slice without scanning. The read stage fills buffers with encoded items;
//! the decode stage treats its buffers as one fixed-stride block and ignores
//! the index.
//!
//! Buffers grow on demand and never shrink: [`Buffer::reset`] drops the items
//! but keeps the allocation, so steady-state epochs reuse the same memory.

use anyhow::{anyhow, Result};

/// A contiguous region holding concatenated variable-length items.
pub struct Buffer<T> {
    data: Vec<T>,
    items: Vec<(usize, usize)>,
    pinned: bool,
}

impl<T: Copy + Default> Buffer<T> {
    /// Creates an empty buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            items: Vec::new(),
            pinned: false,
        }
    }

    /// Creates a buffer whose allocation is intended for device DMA
    /// registration. The CPU device ignores the hint.
    pub fn pinned(capacity: usize) -> Self {
        Self {
            pinned: true,
            ..Self::with_capacity(capacity)
        }
    }

    /// Drops all items, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
        self.items.clear();
    }

    /// Appends one item, growing the region if needed.
    pub fn push_item(&mut self, item: &[T]) {
        self.items.push((self.data.len(), item.len()));
        self.data.extend_from_slice(item);
    }

    /// Returns the slice for item `i`, or `None` past the end.
    pub fn item(&self, i: usize) -> Option<&[T]> {
        let &(offset, len) = self.items.get(i)?;
        Some(&self.data[offset..offset + len])
    }

    /// Resolves item `i` or fails with an indexed error.
    pub fn try_item(&self, i: usize) -> Result<&[T]> {
        self.item(i)
            .ok_or_else(|| anyhow!("item {} out of range ({} items)", i, self.items.len()))
    }

    /// Sizes the buffer to exactly `len` elements, zero-filling new space.
    /// Used by the decode stage, which writes fixed strides in place.
    pub fn fill_len(&mut self, len: usize) {
        self.data.resize(len, T::default());
        self.items.clear();
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Copy + Default> Default for Buffer<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

/// The unit of exchange between pipeline stages: encoded or decoded data,
/// targets, and per-item metadata for one minibatch.
///
/// `meta` holds `2 * batch_size` ints. The first half are per-item scalars
/// written by the media transformer; the second half are per-item encoded
/// target lengths when target decoding is disabled.
#[derive(Default)]
pub struct BufferTuple {
    pub data: Buffer<u8>,
    pub targets: Buffer<u8>,
    pub meta: Buffer<i32>,
    /// Device slot this minibatch was copied into, recorded by the decode
    /// manager before the tuple is published.
    pub device_slot: usize,
}

impl BufferTuple {
    pub fn with_capacity(data_len: usize, target_len: usize, meta_len: usize) -> Self {
        Self {
            data: Buffer::with_capacity(data_len),
            targets: Buffer::with_capacity(target_len),
            meta: Buffer::with_capacity(meta_len),
            device_slot: 0,
        }
    }

    pub fn pinned(data_len: usize, target_len: usize, meta_len: usize) -> Self {
        Self {
            data: Buffer::pinned(data_len),
            targets: Buffer::pinned(target_len),
            meta: Buffer::pinned(meta_len),
            device_slot: 0,
        }
    }

    /// Resets all three buffers, keeping their allocations.
    pub fn reset(&mut self) {
        self.data.reset();
        self.targets.reset();
        self.meta.reset();
    }
}
