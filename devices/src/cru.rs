// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Clock and reset unit (CRU) register blocks.
//!
//! The RK3399 has two of these: the PMU CRU and the main CRU. Neither models
//! a real clock tree. The register file is plain storage with one deliberate
//! protocol override: writes to a PLL lock-status word come back with bit 31
//! set, so guest clock drivers that busy-wait for PLL lock terminate on the
//! first read instead of spinning forever.

use log::trace;
use log::warn;

use crate::BusAccessInfo;
use crate::BusDevice;

/// Size of a CRU register window in bytes.
pub const CRU_MMIO_SIZE: u64 = 0x1000;

/// Lock-status bit in PLL control words.
const PLL_LOCK_BIT: u32 = 1 << 31;

// Power-on register contents probed by boot-time clock drivers.
const PLL_CON_RESET_OFFSET: u64 = 0x8;
const PLL_CON_RESET_VALUE: u32 = 0x0000_031f;
const CLKSEL_RESET_OFFSET: u64 = 0x90;
const CLKSEL_RESET_VALUE: u32 = 0x2dc;

/// Selects which register offsets report PLL lock status.
///
/// This is per-instance configuration: the two CRU blocks share all other
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PllLockPolicy {
    /// A single lock-status word at the given offset. The PMU CRU exposes one
    /// PLL with its status word at 0x8.
    SingleWord(u64),
    /// One lock-status word per 0x20-byte PLL register group below the given
    /// boundary. The main CRU packs its PLLs in 0x20-byte groups below 0x100
    /// with the status word at group offset 0x8.
    GroupedBelow(u64),
}

impl PllLockPolicy {
    fn forces_lock(&self, offset: u64) -> bool {
        match *self {
            PllLockPolicy::SingleWord(lock_offset) => offset == lock_offset,
            PllLockPolicy::GroupedBelow(limit) => offset < limit && offset % 0x20 == 0x8,
        }
    }
}

/// A memory-mapped clock/reset register file.
pub struct ClockResetUnit {
    debug_label: String,
    lock_policy: PllLockPolicy,
    regs: Box<[u8]>,
}

impl ClockResetUnit {
    /// Constructs a zeroed register file seeded with the power-on defaults,
    /// applying `lock_policy` to writes.
    pub fn new(debug_label: &str, lock_policy: PllLockPolicy) -> ClockResetUnit {
        let mut cru = ClockResetUnit {
            debug_label: debug_label.to_string(),
            lock_policy,
            regs: vec![0u8; CRU_MMIO_SIZE as usize].into_boxed_slice(),
        };
        cru.store_reg(PLL_CON_RESET_OFFSET, PLL_CON_RESET_VALUE);
        cru.store_reg(CLKSEL_RESET_OFFSET, CLKSEL_RESET_VALUE);
        cru
    }

    /// The power-management clock/reset unit instance.
    pub fn pmu() -> ClockResetUnit {
        ClockResetUnit::new("pmucru", PllLockPolicy::SingleWord(0x8))
    }

    /// The main clock/reset unit instance.
    pub fn main() -> ClockResetUnit {
        ClockResetUnit::new("cru", PllLockPolicy::GroupedBelow(0x100))
    }

    // Register-width accesses only; the bus keeps offsets inside the window,
    // so a failed bounds check here means a misconfigured window, not a guest
    // bug. Degrade to RAZ/WI rather than panicking either way.
    fn load_reg(&self, offset: u64) -> u32 {
        let offset = offset as usize;
        match self.regs.get(offset..offset + 4) {
            Some(bytes) => {
                let mut word = [0u8; 4];
                word.copy_from_slice(bytes);
                u32::from_le_bytes(word)
            }
            None => 0,
        }
    }

    fn store_reg(&mut self, offset: u64, value: u32) {
        let offset = offset as usize;
        if let Some(bytes) = self.regs.get_mut(offset..offset + 4) {
            bytes.copy_from_slice(&value.to_le_bytes());
        }
    }
}

fn register_access(info: BusAccessInfo, len: usize) -> bool {
    len == 4 && info.offset % 4 == 0
}

impl BusDevice for ClockResetUnit {
    fn debug_label(&self) -> String {
        self.debug_label.clone()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if !register_access(info, data.len()) {
            warn!(
                "{}: unsupported read of {} bytes at {}",
                self.debug_label,
                data.len(),
                info
            );
            for v in data.iter_mut() {
                *v = 0;
            }
            return;
        }
        let value = self.load_reg(info.offset);
        trace!("{}: read {:#x} = {:#010x}", self.debug_label, info.offset, value);
        data.copy_from_slice(&value.to_le_bytes());
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if !register_access(info, data.len()) {
            warn!(
                "{}: unsupported write of {} bytes at {}",
                self.debug_label,
                data.len(),
                info
            );
            return;
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(data);
        let mut value = u32::from_le_bytes(word);
        if self.lock_policy.forces_lock(info.offset) {
            // Report the PLL as locked on the same write that would have
            // started the lock sequence on hardware. Linux clock drivers spin
            // on this bit.
            value |= PLL_LOCK_BIT;
        }
        trace!("{}: write {:#x} = {:#010x}", self.debug_label, info.offset, value);
        self.store_reg(info.offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(offset: u64) -> BusAccessInfo {
        BusAccessInfo {
            offset,
            address: offset,
        }
    }

    fn read_reg(cru: &mut ClockResetUnit, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        cru.read(info(offset), &mut data);
        u32::from_le_bytes(data)
    }

    fn write_reg(cru: &mut ClockResetUnit, offset: u64, value: u32) {
        cru.write(info(offset), &value.to_le_bytes());
    }

    #[test]
    fn reset_values_seeded() {
        for mut cru in [ClockResetUnit::pmu(), ClockResetUnit::main()] {
            assert_eq!(read_reg(&mut cru, 0x8), 0x0000_031f);
            assert_eq!(read_reg(&mut cru, 0x90), 0x2dc);
            assert_eq!(read_reg(&mut cru, 0x0), 0);
        }
    }

    #[test]
    fn pmu_forces_lock_at_fixed_offset() {
        let mut cru = ClockResetUnit::pmu();
        write_reg(&mut cru, 0x8, 0x1234_5678);
        assert_eq!(read_reg(&mut cru, 0x8), 0x1234_5678 | (1 << 31));
        // A value with bit 31 already set is stored unchanged.
        write_reg(&mut cru, 0x8, 0x8000_0001);
        assert_eq!(read_reg(&mut cru, 0x8), 0x8000_0001);
        // Other offsets are plain storage.
        write_reg(&mut cru, 0x28, 0x55);
        assert_eq!(read_reg(&mut cru, 0x28), 0x55);
    }

    #[test]
    fn main_forces_lock_per_pll_group() {
        let mut cru = ClockResetUnit::main();
        // Group-1 lock word.
        write_reg(&mut cru, 0x28, 0x2);
        assert_eq!(read_reg(&mut cru, 0x28), 0x8000_0002);
        // Group-1 non-lock word.
        write_reg(&mut cru, 0x20, 0x2);
        assert_eq!(read_reg(&mut cru, 0x20), 0x2);
        // Same modulus beyond the 0x100 boundary is not a lock word.
        write_reg(&mut cru, 0x108, 0x2);
        assert_eq!(read_reg(&mut cru, 0x108), 0x2);
    }

    #[test]
    fn unsupported_widths_are_ignored() {
        let mut cru = ClockResetUnit::main();
        for width in [1usize, 2, 8] {
            let data = vec![0xffu8; width];
            cru.write(info(0x28), &data);
            assert_eq!(read_reg(&mut cru, 0x28), 0);

            let mut out = vec![0xaau8; width];
            cru.read(info(0x8), &mut out);
            assert!(out.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn misaligned_access_is_ignored() {
        let mut cru = ClockResetUnit::pmu();
        write_reg(&mut cru, 0x6, 0xdead_beef);
        assert_eq!(read_reg(&mut cru, 0x8), 0x0000_031f);
        assert_eq!(read_reg(&mut cru, 0x4), 0);
    }

    #[test]
    fn reads_are_idempotent() {
        let mut cru = ClockResetUnit::main();
        write_reg(&mut cru, 0x48, 0x7777_0001);
        for _ in 0..3 {
            assert_eq!(read_reg(&mut cru, 0x48), 0x8000_0000 | 0x7777_0001);
        }
    }
}
