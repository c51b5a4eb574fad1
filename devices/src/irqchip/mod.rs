// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interrupt controller models for the RK3399 board.
//!
//! The GICv3 model lives here together with its ITS child device. Wiring
//! between CPUs and the controller is the board's job (see the `aarch64`
//! crate); this module only exposes the line-level primitives the board
//! connects.

mod gicv3;
mod its;

use std::result;

use remain::sorted;
use thiserror::Error;

pub use gicv3::GicDistributorFrame;
pub use gicv3::GicIrqLine;
pub use gicv3::GicRedistributorFrame;
pub use gicv3::GicV3;
pub use gicv3::GicV3Config;
pub use gicv3::GICD_MMIO_SIZE;
pub use gicv3::GICR_FRAME_SIZE;
pub use gicv3::GIC_INTERNAL_IRQS;
pub use gicv3::GIC_LPI_BASE;
pub use gicv3::GIC_NR_SGIS;
pub use gicv3::GIC_SPURIOUS_INTID;
pub use its::Its;
pub use its::GITS_MMIO_SIZE;

/// A single fire-and-forget interrupt signal.
///
/// Asserting a line is a non-blocking side effect with no acknowledgment
/// channel back to the asserter. Implementations must not call back into the
/// device that drives them.
pub trait IrqLine: Send + Sync {
    /// Sets the line level.
    fn set_level(&self, level: bool);
}

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("interrupt controller is already realized")]
    AlreadyRealized,
    #[error("cpu index {0} out of range")]
    CpuOutOfRange(usize),
    #[error("invalid interrupt count {0}, must be a multiple of 32 in (32, 1024]")]
    InvalidIrqCount(u32),
    #[error("interrupt input line {0} out of range")]
    InvalidIrqLine(u32),
    #[error("interrupt output line {0} out of range")]
    InvalidOutputLine(u32),
    #[error("unsupported distributor revision {0}, only GICv3 is modeled")]
    InvalidRevision(u32),
    #[error("translation unit requires a controller with LPI support")]
    ItsWithoutLpi,
    #[error("failed to read the LPI configuration table: {0}")]
    LpiConfigTableAccess(vm_memory::Error),
    #[error("intid {0} is below the LPI range")]
    LpiOutOfRange(u32),
    #[error("LPIs are not supported by this controller")]
    LpisDisabled,
    #[error("interrupt controller is not realized")]
    NotRealized,
    #[error("parent interrupt controller is gone or not realized")]
    ParentNotRealized,
    #[error("{regions} redistributor frames cannot serve {num_cpus} cpus")]
    RedistributorCapacity { regions: u32, num_cpus: usize },
    #[error("unsupported cpu count {0}")]
    UnsupportedCpuCount(usize),
}

pub type Result<T> = result::Result<T, Error>;

/// Reads a little-endian u32 from the start of `data`.
pub(crate) fn read_le_u32(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let len = std::cmp::min(data.len(), 4);
    bytes[..len].copy_from_slice(&data[..len]);
    u32::from_le_bytes(bytes)
}

/// Writes a little-endian u32 to the start of `data`.
pub(crate) fn write_le_u32(data: &mut [u8], value: u32) {
    let bytes = value.to_le_bytes();
    let len = std::cmp::min(data.len(), 4);
    data[..len].copy_from_slice(&bytes[..len]);
}
