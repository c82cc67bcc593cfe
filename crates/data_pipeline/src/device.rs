//! src/device.rs
//!
//! Target memory for decoded minibatches.
//!
//! The pipeline keeps two device-resident slots and alternates between them:
//! while the trainer computes on slot `k`, the decode manager copies the next
//! minibatch into slot `1 - k`. The device is opaque to the pipeline beyond
//! this copy-in/copy-out contract.

use anyhow::{anyhow, Result};
use std::sync::Mutex;

/// Number of device-resident minibatch slots. The decode manager's toggle
/// and the trainer's read alternate over exactly two.
pub const DEVICE_SLOTS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

/// Copy contract between host buffers and the two device slots.
///
/// `init` runs on the decode manager thread before any minibatch is
/// processed; a failure is fatal to the pipeline. The copy-back entry points
/// exist for validation paths that compare device contents against a
/// reference decode.
pub trait Device: Send + Sync {
    fn init(&self) -> Result<()>;

    fn kind(&self) -> DeviceKind;

    fn copy_data(&self, slot: usize, host: &[u8]) -> Result<()>;

    fn copy_labels(&self, slot: usize, host: &[u8]) -> Result<()>;

    fn copy_meta(&self, slot: usize, host: &[i32]) -> Result<()>;

    fn copy_data_back(&self, slot: usize, host: &mut [u8]) -> Result<()>;

    fn copy_labels_back(&self, slot: usize, host: &mut [u8]) -> Result<()>;
}

#[derive(Default)]
struct CpuSlot {
    data: Vec<u8>,
    labels: Vec<u8>,
    meta: Vec<i32>,
}

/// Host-memory device: the two slots are plain buffers and "transfer" is a
/// memcpy. Decode buffers feeding this device are not pinned.
#[derive(Default)]
pub struct CpuDevice {
    slots: [Mutex<CpuSlot>; DEVICE_SLOTS],
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, slot: usize) -> Result<&Mutex<CpuSlot>> {
        self.slots
            .get(slot)
            .ok_or_else(|| anyhow!("device slot {} out of range", slot))
    }

    /// Snapshot of a slot's metadata. Not part of the [`Device`] contract;
    /// the CPU device exposes its backing memory for validation, the way a
    /// real accelerator exposes a debug readback.
    pub fn meta(&self, slot: usize) -> Result<Vec<i32>> {
        let guard = self
            .slot(slot)?
            .lock()
            .map_err(|_| anyhow!("device slot {} poisoned", slot))?;
        Ok(guard.meta.clone())
    }
}

impl Device for CpuDevice {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn copy_data(&self, slot: usize, host: &[u8]) -> Result<()> {
        let mut guard = self
            .slot(slot)?
            .lock()
            .map_err(|_| anyhow!("device slot {} poisoned", slot))?;
        guard.data.clear();
        guard.data.extend_from_slice(host);
        Ok(())
    }

    fn copy_labels(&self, slot: usize, host: &[u8]) -> Result<()> {
        let mut guard = self
            .slot(slot)?
            .lock()
            .map_err(|_| anyhow!("device slot {} poisoned", slot))?;
        guard.labels.clear();
        guard.labels.extend_from_slice(host);
        Ok(())
    }

    fn copy_meta(&self, slot: usize, host: &[i32]) -> Result<()> {
        let mut guard = self
            .slot(slot)?
            .lock()
            .map_err(|_| anyhow!("device slot {} poisoned", slot))?;
        guard.meta.clear();
        guard.meta.extend_from_slice(host);
        Ok(())
    }

    fn copy_data_back(&self, slot: usize, host: &mut [u8]) -> Result<()> {
        let guard = self
            .slot(slot)?
            .lock()
            .map_err(|_| anyhow!("device slot {} poisoned", slot))?;
        if guard.data.len() < host.len() {
            return Err(anyhow!(
                "device slot {} holds {} data bytes, caller asked for {}",
                slot,
                guard.data.len(),
                host.len()
            ));
        }
        host.copy_from_slice(&guard.data[..host.len()]);
        Ok(())
    }

    fn copy_labels_back(&self, slot: usize, host: &mut [u8]) -> Result<()> {
        let guard = self
            .slot(slot)?
            .lock()
            .map_err(|_| anyhow!("device slot {} poisoned", slot))?;
        if guard.labels.len() < host.len() {
            return Err(anyhow!(
                "device slot {} holds {} label bytes, caller asked for {}",
                slot,
                guard.labels.len(),
                host.len()
            ));
        }
        host.copy_from_slice(&guard.labels[..host.len()]);
        Ok(())
    }
}
