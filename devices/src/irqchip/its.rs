// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interrupt Translation Service (ITS) register frame.
//!
//! The ITS advertises itself to the guest and stores the table base
//! registers the guest programs, but does not walk the command queue or
//! translate device events. LPIs reach the redistributors through
//! [`GicV3::set_lpi_pending`](super::GicV3::set_lpi_pending) instead. This is
//! enough for guests that probe for an ITS and fall back to direct LPI
//! injection paths.

use std::sync::Mutex;
use std::sync::Weak;

use log::trace;
use log::warn;

use super::gicv3::GicState;
use super::read_le_u32;
use super::write_le_u32;
use super::Error;
use super::GicV3;
use super::Result;

use crate::BusAccessInfo;
use crate::BusDevice;

/// Size of the ITS register window (control + translation 64KiB pages).
pub const GITS_MMIO_SIZE: u64 = 0x20000;

const GITS_CTLR: u64 = 0x0000;
const GITS_IIDR: u64 = 0x0004;
const GITS_TYPER: u64 = 0x0008;
const GITS_TYPER_HI: u64 = 0x000c;
const GITS_CBASER: u64 = 0x0080;
const GITS_CBASER_HI: u64 = 0x0084;
const GITS_CWRITER: u64 = 0x0088;
const GITS_CWRITER_HI: u64 = 0x008c;
const GITS_CREADR: u64 = 0x0090;
const GITS_CREADR_HI: u64 = 0x0094;
const GITS_BASER: u64 = 0x0100;
const GITS_PIDR2: u64 = 0xffe8;

const GITS_CTLR_ENABLED: u32 = 1 << 0;

// GITS_TYPER: physical LPIs, 16-bit event IDs, 16-bit device IDs.
const GITS_TYPER_VALUE: u32 = 1 | (0xf << 5) | (0xf << 13);

const GIC_PIDR2_ARCH_GICV3: u32 = 0x3 << 4;
const GIC_IIDR_IMPLEMENTER: u32 = 0x43b;

/// The translation service, a child of [`GicV3`].
///
/// Holds a non-owning link to its parent controller. The parent must be
/// realized before the service is; the link is only used to enforce that
/// ordering and to surface parent teardown as an error instead of a dangling
/// reference.
pub struct Its {
    parent: Weak<Mutex<GicState>>,
    realized: bool,
    ctlr: u32,
    cbaser: u64,
    cwriter: u64,
    creadr: u64,
    baser: [u64; 8],
}

impl Its {
    /// Builds an unrealized translation service attached to `gic`.
    pub fn new(gic: &GicV3) -> Result<Its> {
        if !gic.config().has_lpi {
            return Err(Error::ItsWithoutLpi);
        }
        Ok(Its {
            parent: gic.state_weak(),
            realized: false,
            ctlr: 0,
            cbaser: 0,
            cwriter: 0,
            creadr: 0,
            baser: [0; 8],
        })
    }

    /// Realizes the service. One-shot, and only valid once the parent
    /// controller has been realized.
    pub fn realize(&mut self) -> Result<()> {
        if self.realized {
            return Err(Error::AlreadyRealized);
        }
        let parent = self.parent.upgrade().ok_or(Error::ParentNotRealized)?;
        if !parent.lock().unwrap().realized {
            return Err(Error::ParentNotRealized);
        }
        self.realized = true;
        Ok(())
    }

    pub fn realized(&self) -> bool {
        self.realized
    }

    fn baser_slot(offset: u64) -> Option<(usize, bool)> {
        if (GITS_BASER..GITS_BASER + 0x40).contains(&offset) {
            let rel = offset - GITS_BASER;
            Some(((rel / 8) as usize, rel % 8 >= 4))
        } else {
            None
        }
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            GITS_CTLR => self.ctlr,
            GITS_IIDR => GIC_IIDR_IMPLEMENTER,
            GITS_TYPER => GITS_TYPER_VALUE,
            GITS_TYPER_HI => 0,
            GITS_CBASER => self.cbaser as u32,
            GITS_CBASER_HI => (self.cbaser >> 32) as u32,
            GITS_CWRITER => self.cwriter as u32,
            GITS_CWRITER_HI => (self.cwriter >> 32) as u32,
            GITS_CREADR => self.creadr as u32,
            GITS_CREADR_HI => (self.creadr >> 32) as u32,
            GITS_PIDR2 => GIC_PIDR2_ARCH_GICV3,
            o => match Its::baser_slot(o) {
                Some((slot, true)) => (self.baser[slot] >> 32) as u32,
                Some((slot, false)) => self.baser[slot] as u32,
                None => {
                    trace!("GITS read from unhandled offset {:#x}", offset);
                    0
                }
            },
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            GITS_CTLR => self.ctlr = value & GITS_CTLR_ENABLED,
            GITS_IIDR | GITS_TYPER | GITS_TYPER_HI | GITS_PIDR2 => {}
            GITS_CBASER => {
                self.cbaser = (self.cbaser & 0xffff_ffff_0000_0000) | value as u64;
            }
            GITS_CBASER_HI => {
                self.cbaser = (self.cbaser & 0xffff_ffff) | ((value as u64) << 32);
            }
            GITS_CWRITER => {
                self.cwriter = (self.cwriter & 0xffff_ffff_0000_0000) | value as u64;
                // Commands are not interpreted; consume the queue so the
                // guest's completion polls terminate.
                self.creadr = self.cwriter;
            }
            GITS_CWRITER_HI => {
                self.cwriter = (self.cwriter & 0xffff_ffff) | ((value as u64) << 32);
                self.creadr = self.cwriter;
            }
            GITS_CREADR | GITS_CREADR_HI => {}
            o => match Its::baser_slot(o) {
                Some((slot, true)) => {
                    self.baser[slot] =
                        (self.baser[slot] & 0xffff_ffff) | ((value as u64) << 32);
                }
                Some((slot, false)) => {
                    self.baser[slot] =
                        (self.baser[slot] & 0xffff_ffff_0000_0000) | value as u64;
                }
                None => {
                    trace!(
                        "GITS write to unhandled offset {:#x} value {:#x}",
                        offset,
                        value
                    );
                }
            },
        }
    }
}

fn register_access(info: BusAccessInfo, len: usize) -> bool {
    len == 4 && info.offset % 4 == 0
}

impl BusDevice for Its {
    fn debug_label(&self) -> String {
        "GICv3 ITS".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if !register_access(info, data.len()) {
            warn!("GITS: unsupported read of {} bytes at {}", data.len(), info);
            for v in data.iter_mut() {
                *v = 0;
            }
            return;
        }
        write_le_u32(data, self.read_reg(info.offset));
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if !register_access(info, data.len()) {
            warn!("GITS: unsupported write of {} bytes at {}", data.len(), info);
            return;
        }
        self.write_reg(info.offset, read_le_u32(data));
    }
}

#[cfg(test)]
mod tests {
    use super::super::GicV3Config;
    use super::*;
    use std::sync::Arc;
    use vm_memory::GuestMemory;

    fn test_gic(has_lpi: bool) -> GicV3 {
        let config = GicV3Config {
            revision: 3,
            num_cpus: 1,
            num_irqs: 256 + 32,
            security_extensions: true,
            has_lpi,
            redist_region_count: vec![1],
        };
        let sysmem = Arc::new(GuestMemory::new(0x1000).unwrap());
        GicV3::new(config, sysmem).unwrap()
    }

    fn info(offset: u64) -> BusAccessInfo {
        BusAccessInfo {
            offset,
            address: offset,
        }
    }

    fn read_reg(its: &mut Its, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        its.read(info(offset), &mut data);
        u32::from_le_bytes(data)
    }

    fn write_reg(its: &mut Its, offset: u64, value: u32) {
        its.write(info(offset), &value.to_le_bytes());
    }

    #[test]
    fn requires_lpi_capable_parent() {
        let gic = test_gic(false);
        assert!(matches!(Its::new(&gic), Err(Error::ItsWithoutLpi)));
    }

    #[test]
    fn realize_requires_realized_parent() {
        let mut gic = test_gic(true);
        let mut its = Its::new(&gic).unwrap();
        assert!(matches!(its.realize(), Err(Error::ParentNotRealized)));
        gic.realize().unwrap();
        its.realize().unwrap();
        assert!(its.realized());
        assert!(matches!(its.realize(), Err(Error::AlreadyRealized)));
    }

    #[test]
    fn identification_registers() {
        let mut gic = test_gic(true);
        gic.realize().unwrap();
        let mut its = Its::new(&gic).unwrap();
        its.realize().unwrap();
        assert_eq!(read_reg(&mut its, GITS_IIDR), 0x43b);
        assert_eq!(read_reg(&mut its, GITS_PIDR2), 0x3 << 4);
        // Physical LPIs supported.
        assert_ne!(read_reg(&mut its, GITS_TYPER) & 1, 0);
    }

    #[test]
    fn command_queue_drains_immediately() {
        let mut gic = test_gic(true);
        gic.realize().unwrap();
        let mut its = Its::new(&gic).unwrap();
        its.realize().unwrap();

        write_reg(&mut its, GITS_CBASER, 0x8000);
        assert_eq!(read_reg(&mut its, GITS_CBASER), 0x8000);

        write_reg(&mut its, GITS_CWRITER, 0x40);
        assert_eq!(read_reg(&mut its, GITS_CREADR), 0x40);
        // CREADR itself is read-only.
        write_reg(&mut its, GITS_CREADR, 0);
        assert_eq!(read_reg(&mut its, GITS_CREADR), 0x40);
    }

    #[test]
    fn table_base_registers_are_stored() {
        let mut gic = test_gic(true);
        gic.realize().unwrap();
        let mut its = Its::new(&gic).unwrap();
        its.realize().unwrap();

        write_reg(&mut its, GITS_BASER, 0xdead_b000);
        write_reg(&mut its, GITS_BASER + 4, 0x1);
        assert_eq!(read_reg(&mut its, GITS_BASER), 0xdead_b000);
        assert_eq!(read_reg(&mut its, GITS_BASER + 4), 0x1);
        // Slot 7 is the last one.
        write_reg(&mut its, GITS_BASER + 0x38, 0x77);
        assert_eq!(read_reg(&mut its, GITS_BASER + 0x38), 0x77);
    }
}
