// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GICv3 emulation for the RK3399 board.
//!
//! This is a minimal GICv3 sufficient for a Linux guest to boot and take
//! timer interrupts: a distributor for SPIs, one redistributor per CPU for
//! SGIs/PPIs and the LPI tables, and a per-CPU output-line table the board
//! wires back to its virtual CPUs. The CPU interface (ICC system registers)
//! belongs to the CPU model and is not emulated here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use log::trace;
use log::warn;

use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

use super::read_le_u32;
use super::write_le_u32;
use super::Error;
use super::IrqLine;
use super::Result;

use crate::BusAccessInfo;
use crate::BusDevice;

/// Interrupt lines the architecture reserves for each CPU's private
/// interrupts (16 SGIs + 16 PPIs).
pub const GIC_INTERNAL_IRQS: u32 = 32;

/// Number of SGIs (Software Generated Interrupts).
pub const GIC_NR_SGIS: u32 = 16;

/// Special INTID meaning "no interrupt pending".
pub const GIC_SPURIOUS_INTID: u32 = 1023;

/// First INTID of the LPI range.
pub const GIC_LPI_BASE: u32 = 8192;

/// Size of the distributor register window.
pub const GICD_MMIO_SIZE: u64 = 0x10000;

/// Size of one redistributor frame (RD + SGI 64KiB pages).
pub const GICR_FRAME_SIZE: u64 = 0x20000;

// Distributor register offsets.
const GICD_CTLR: u64 = 0x0000;
const GICD_TYPER: u64 = 0x0004;
const GICD_IIDR: u64 = 0x0008;
const GICD_TYPER2: u64 = 0x000c;
const GICD_IGROUPR: u64 = 0x0080;
const GICD_ISENABLER: u64 = 0x0100;
const GICD_ICENABLER: u64 = 0x0180;
const GICD_ISPENDR: u64 = 0x0200;
const GICD_ICPENDR: u64 = 0x0280;
const GICD_ISACTIVER: u64 = 0x0300;
const GICD_ICACTIVER: u64 = 0x0380;
const GICD_IPRIORITYR: u64 = 0x0400;
const GICD_ICFGR: u64 = 0x0c00;
const GICD_IGRPMODR: u64 = 0x0d00;
const GICD_IROUTER: u64 = 0x6000;
const GICD_PIDR2: u64 = 0xffe8;

// GICD_CTLR bits.
const GICD_CTLR_ENABLE_G0: u32 = 1 << 0;
const GICD_CTLR_ENABLE_G1NS: u32 = 1 << 1;
const GICD_CTLR_ENABLE_G1S: u32 = 1 << 2;
const GICD_CTLR_ARE_S: u32 = 1 << 4;
const GICD_CTLR_ARE_NS: u32 = 1 << 5;

// Redistributor register offsets, RD frame.
const GICR_CTLR: u64 = 0x0000;
const GICR_IIDR: u64 = 0x0004;
const GICR_TYPER: u64 = 0x0008;
const GICR_TYPER_HI: u64 = 0x000c;
const GICR_WAKER: u64 = 0x0014;
const GICR_PROPBASER: u64 = 0x0070;
const GICR_PROPBASER_HI: u64 = 0x0074;
const GICR_PENDBASER: u64 = 0x0078;
const GICR_PENDBASER_HI: u64 = 0x007c;
const GICR_PIDR2: u64 = 0xffe8;

// Redistributor register offsets, SGI frame (second 64KiB page).
const GICR_SGI_BASE: u64 = 0x10000;
const GICR_IGROUPR0: u64 = GICR_SGI_BASE + 0x0080;
const GICR_ISENABLER0: u64 = GICR_SGI_BASE + 0x0100;
const GICR_ICENABLER0: u64 = GICR_SGI_BASE + 0x0180;
const GICR_ISPENDR0: u64 = GICR_SGI_BASE + 0x0200;
const GICR_ICPENDR0: u64 = GICR_SGI_BASE + 0x0280;
const GICR_ISACTIVER0: u64 = GICR_SGI_BASE + 0x0300;
const GICR_ICACTIVER0: u64 = GICR_SGI_BASE + 0x0380;
const GICR_IPRIORITYR: u64 = GICR_SGI_BASE + 0x0400;
const GICR_ICFGR0: u64 = GICR_SGI_BASE + 0x0c00;
const GICR_ICFGR1: u64 = GICR_SGI_BASE + 0x0c04;
const GICR_IGRPMODR0: u64 = GICR_SGI_BASE + 0x0d00;

// GICR_CTLR bits.
const GICR_CTLR_ENABLE_LPIS: u32 = 1 << 0;

// GICR_WAKER bits.
const GICR_WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
const GICR_WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;

// Architecture version in PIDR2.
const GIC_PIDR2_ARCH_GICV3: u32 = 0x3 << 4;

// JEP106 code for Arm, reported in the IIDR implementer field.
const GIC_IIDR_IMPLEMENTER: u32 = 0x43b;

// Physical address field of GICR_PROPBASER, bits [51:12].
const GICR_PROPBASER_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
// IDbits field of GICR_PROPBASER, bits [4:0].
const GICR_PROPBASER_IDBITS_MASK: u64 = 0x1f;

/// Typed configuration for [`GicV3`].
///
/// All knobs are fixed before realize; there is no reconfiguration once the
/// controller is realized.
#[derive(Debug, Clone)]
pub struct GicV3Config {
    /// Architectural revision. Only 3 is modeled.
    pub revision: u32,
    /// Number of CPUs served by the controller.
    pub num_cpus: usize,
    /// Total interrupt lines, counting both the configurable external lines
    /// and the 32 architecturally mandated internal lines.
    pub num_irqs: u32,
    /// Report the GIC security extensions in GICD_TYPER.
    pub security_extensions: bool,
    /// Support locality-specific peripheral interrupts (LPIs).
    pub has_lpi: bool,
    /// Redistributor frames per region. This board uses a single region.
    pub redist_region_count: Vec<u32>,
}

/// Decoded distributor register.
enum DistReg {
    Ctlr,
    Typer,
    Typer2,
    Iidr,
    Pidr2,
    Group(usize),
    SetEnable(usize),
    ClearEnable(usize),
    SetPending(usize),
    ClearPending(usize),
    SetActive(usize),
    ClearActive(usize),
    Priority(usize),
    Config(usize),
    GroupMod(usize),
    Router { intid: u32, high: bool },
}

fn decode_dist_reg(offset: u64) -> Option<DistReg> {
    let word = |base: u64| ((offset - base) / 4) as usize;
    match offset {
        GICD_CTLR => Some(DistReg::Ctlr),
        GICD_TYPER => Some(DistReg::Typer),
        GICD_TYPER2 => Some(DistReg::Typer2),
        GICD_IIDR => Some(DistReg::Iidr),
        GICD_PIDR2 => Some(DistReg::Pidr2),
        o if (GICD_IGROUPR..GICD_IGROUPR + 0x80).contains(&o) => {
            Some(DistReg::Group(word(GICD_IGROUPR)))
        }
        o if (GICD_ISENABLER..GICD_ISENABLER + 0x80).contains(&o) => {
            Some(DistReg::SetEnable(word(GICD_ISENABLER)))
        }
        o if (GICD_ICENABLER..GICD_ICENABLER + 0x80).contains(&o) => {
            Some(DistReg::ClearEnable(word(GICD_ICENABLER)))
        }
        o if (GICD_ISPENDR..GICD_ISPENDR + 0x80).contains(&o) => {
            Some(DistReg::SetPending(word(GICD_ISPENDR)))
        }
        o if (GICD_ICPENDR..GICD_ICPENDR + 0x80).contains(&o) => {
            Some(DistReg::ClearPending(word(GICD_ICPENDR)))
        }
        o if (GICD_ISACTIVER..GICD_ISACTIVER + 0x80).contains(&o) => {
            Some(DistReg::SetActive(word(GICD_ISACTIVER)))
        }
        o if (GICD_ICACTIVER..GICD_ICACTIVER + 0x80).contains(&o) => {
            Some(DistReg::ClearActive(word(GICD_ICACTIVER)))
        }
        o if (GICD_IPRIORITYR..GICD_IPRIORITYR + 0x400).contains(&o) => {
            Some(DistReg::Priority(word(GICD_IPRIORITYR)))
        }
        o if (GICD_ICFGR..GICD_ICFGR + 0x100).contains(&o) => {
            Some(DistReg::Config(word(GICD_ICFGR)))
        }
        o if (GICD_IGRPMODR..GICD_IGRPMODR + 0x80).contains(&o) => {
            Some(DistReg::GroupMod(word(GICD_IGRPMODR)))
        }
        o if (GICD_IROUTER..GICD_IROUTER + 0x2000).contains(&o) => Some(DistReg::Router {
            intid: ((o - GICD_IROUTER) / 8) as u32,
            high: (o - GICD_IROUTER) % 8 >= 4,
        }),
        _ => None,
    }
}

/// Distributor state: SPI banks plus the identification registers.
///
/// Bit-bank word 0 (SGIs/PPIs) belongs to the redistributors and reads as
/// zero here; writes to it are ignored.
struct Distributor {
    num_cpus: usize,
    num_spis: u32,
    security_extensions: bool,
    has_lpi: bool,
    ctlr: u32,
    group: Vec<u32>,
    enable: Vec<u32>,
    pending: Vec<u32>,
    active: Vec<u32>,
    /// One byte per SPI, stored four to a word.
    priority: Vec<u32>,
    /// Two bits per SPI.
    cfg: Vec<u32>,
    group_mod: Vec<u32>,
    /// Affinity routing, one entry per SPI.
    router: Vec<u64>,
}

impl Distributor {
    fn new(config: &GicV3Config) -> Distributor {
        let num_spis = config.num_irqs - GIC_INTERNAL_IRQS;
        let words = (num_spis / 32) as usize;
        Distributor {
            num_cpus: config.num_cpus,
            num_spis,
            security_extensions: config.security_extensions,
            has_lpi: config.has_lpi,
            ctlr: 0,
            group: vec![0; words],
            enable: vec![0; words],
            pending: vec![0; words],
            active: vec![0; words],
            priority: vec![0; (num_spis / 4) as usize],
            cfg: vec![0; (num_spis / 16) as usize],
            group_mod: vec![0; words],
            router: vec![0; num_spis as usize],
        }
    }

    fn typer(&self) -> u32 {
        // ITLinesNumber encodes the interrupt count as 32 * (n + 1).
        let it_lines = (self.num_spis + GIC_INTERNAL_IRQS) / 32 - 1;
        let cpu_number = (self.num_cpus as u32 - 1) << 5;
        let mut typer = it_lines | cpu_number;
        if self.security_extensions {
            typer |= 1 << 10;
        }
        if self.has_lpi {
            // LPIS plus 16 bits of INTID space.
            typer |= 1 << 17;
            typer |= 0xf << 19;
        }
        typer
    }

    // SPI bit banks skip word 0, which covers the private interrupts.
    fn spi_bank(&self, word: usize) -> Option<usize> {
        if word == 0 || word > self.group.len() {
            None
        } else {
            Some(word - 1)
        }
    }

    fn read_reg(&self, offset: u64) -> u32 {
        let reg = match decode_dist_reg(offset) {
            Some(reg) => reg,
            None => {
                trace!("GICD read from unhandled offset {:#x}", offset);
                return 0;
            }
        };
        match reg {
            DistReg::Ctlr => self.ctlr,
            DistReg::Typer => self.typer(),
            DistReg::Typer2 => 0,
            DistReg::Iidr => GIC_IIDR_IMPLEMENTER,
            DistReg::Pidr2 => GIC_PIDR2_ARCH_GICV3,
            DistReg::Group(w) => self.spi_bank(w).map_or(0, |i| self.group[i]),
            DistReg::SetEnable(w) | DistReg::ClearEnable(w) => {
                self.spi_bank(w).map_or(0, |i| self.enable[i])
            }
            DistReg::SetPending(w) | DistReg::ClearPending(w) => {
                self.spi_bank(w).map_or(0, |i| self.pending[i])
            }
            DistReg::SetActive(w) | DistReg::ClearActive(w) => {
                self.spi_bank(w).map_or(0, |i| self.active[i])
            }
            DistReg::Priority(w) => {
                // The first eight words cover the private interrupts.
                if w >= 8 && w - 8 < self.priority.len() {
                    self.priority[w - 8]
                } else {
                    0
                }
            }
            DistReg::Config(w) => {
                if w >= 2 && w - 2 < self.cfg.len() {
                    self.cfg[w - 2]
                } else {
                    0
                }
            }
            DistReg::GroupMod(w) => self.spi_bank(w).map_or(0, |i| self.group_mod[i]),
            DistReg::Router { intid, high } => match self.router_index(intid) {
                Some(i) if high => (self.router[i] >> 32) as u32,
                Some(i) => self.router[i] as u32,
                None => 0,
            },
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        let reg = match decode_dist_reg(offset) {
            Some(reg) => reg,
            None => {
                trace!(
                    "GICD write to unhandled offset {:#x} value {:#x}",
                    offset,
                    value
                );
                return;
            }
        };
        match reg {
            DistReg::Ctlr => {
                self.ctlr = value
                    & (GICD_CTLR_ENABLE_G0
                        | GICD_CTLR_ENABLE_G1NS
                        | GICD_CTLR_ENABLE_G1S
                        | GICD_CTLR_ARE_S
                        | GICD_CTLR_ARE_NS);
            }
            DistReg::Typer | DistReg::Typer2 | DistReg::Iidr | DistReg::Pidr2 => {}
            DistReg::Group(w) => {
                if let Some(i) = self.spi_bank(w) {
                    self.group[i] = value;
                }
            }
            DistReg::SetEnable(w) => {
                if let Some(i) = self.spi_bank(w) {
                    self.enable[i] |= value;
                }
            }
            DistReg::ClearEnable(w) => {
                if let Some(i) = self.spi_bank(w) {
                    self.enable[i] &= !value;
                }
            }
            DistReg::SetPending(w) => {
                if let Some(i) = self.spi_bank(w) {
                    self.pending[i] |= value;
                }
            }
            DistReg::ClearPending(w) => {
                if let Some(i) = self.spi_bank(w) {
                    self.pending[i] &= !value;
                }
            }
            DistReg::SetActive(w) => {
                if let Some(i) = self.spi_bank(w) {
                    self.active[i] |= value;
                }
            }
            DistReg::ClearActive(w) => {
                if let Some(i) = self.spi_bank(w) {
                    self.active[i] &= !value;
                }
            }
            DistReg::Priority(w) => {
                if w >= 8 && w - 8 < self.priority.len() {
                    self.priority[w - 8] = value;
                }
            }
            DistReg::Config(w) => {
                if w >= 2 && w - 2 < self.cfg.len() {
                    self.cfg[w - 2] = value;
                }
            }
            DistReg::GroupMod(w) => {
                if let Some(i) = self.spi_bank(w) {
                    self.group_mod[i] = value;
                }
            }
            DistReg::Router { intid, high } => {
                if let Some(i) = self.router_index(intid) {
                    if high {
                        self.router[i] = (self.router[i] & 0xffff_ffff) | ((value as u64) << 32);
                    } else {
                        self.router[i] =
                            (self.router[i] & 0xffff_ffff_0000_0000) | value as u64;
                    }
                }
            }
        }
    }

    fn router_index(&self, intid: u32) -> Option<usize> {
        if intid >= GIC_INTERNAL_IRQS && intid < GIC_INTERNAL_IRQS + self.num_spis {
            Some((intid - GIC_INTERNAL_IRQS) as usize)
        } else {
            None
        }
    }

    /// Drives the level of SPI input `spi` (0-based, INTID = spi + 32).
    fn set_spi_level(&mut self, spi: u32, level: bool) {
        if spi >= self.num_spis {
            warn!("SPI {} out of range", spi);
            return;
        }
        let word = (spi / 32) as usize;
        let bit = 1 << (spi % 32);
        if level {
            self.pending[word] |= bit;
        } else {
            self.pending[word] &= !bit;
        }
    }

    fn spi_priority(&self, spi: u32) -> u8 {
        let word = (spi / 4) as usize;
        let shift = (spi % 4) * 8;
        ((self.priority[word] >> shift) & 0xff) as u8
    }

    /// CPU an SPI routes to: affinity level 0 of its IROUTER entry, falling
    /// back to CPU 0 for unconfigured or out-of-range affinities.
    fn spi_target(&self, spi: u32) -> usize {
        let aff0 = (self.router[spi as usize] & 0xff) as usize;
        if aff0 < self.num_cpus {
            aff0
        } else {
            0
        }
    }

    fn group1_enabled(&self) -> bool {
        self.ctlr & GICD_CTLR_ENABLE_G1NS != 0
    }

    /// Highest priority pending-and-enabled SPI routed to `cpu`.
    fn best_pending_spi(&self, cpu: usize) -> Option<(u32, u8)> {
        let mut best: Option<(u32, u8)> = None;
        for spi in 0..self.num_spis {
            let word = (spi / 32) as usize;
            let bit = 1 << (spi % 32);
            if self.pending[word] & self.enable[word] & bit == 0 {
                continue;
            }
            if self.spi_target(spi) != cpu {
                continue;
            }
            let priority = self.spi_priority(spi);
            match best {
                Some((_, p)) if p <= priority => {}
                _ => best = Some((spi + GIC_INTERNAL_IRQS, priority)),
            }
        }
        best
    }
}

/// Per-CPU redistributor state.
struct Redistributor {
    cpu: usize,
    last: bool,
    has_lpi: bool,
    ctlr: u32,
    waker: u32,
    group0: u32,
    enable0: u32,
    pending0: u32,
    active0: u32,
    icfgr: [u32; 2],
    group_mod0: u32,
    /// One byte per private interrupt, stored four to a word.
    priority: [u32; 8],
    propbaser: u64,
    pendbaser: u64,
    /// Pending LPIs and the priority latched from the configuration table.
    lpi_pending: BTreeMap<u32, u8>,
}

impl Redistributor {
    fn new(cpu: usize, last: bool, has_lpi: bool) -> Redistributor {
        Redistributor {
            cpu,
            last,
            has_lpi,
            ctlr: 0,
            // Awake from reset.
            waker: 0,
            group0: 0,
            enable0: 0,
            pending0: 0,
            active0: 0,
            icfgr: [0; 2],
            group_mod0: 0,
            priority: [0; 8],
            propbaser: 0,
            pendbaser: 0,
            lpi_pending: BTreeMap::new(),
        }
    }

    fn typer(&self) -> u32 {
        let mut typer = (self.cpu as u32) << 8;
        if self.last {
            typer |= 1 << 4;
        }
        if self.has_lpi {
            typer |= 1 << 0;
        }
        typer
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            GICR_CTLR => self.ctlr,
            GICR_IIDR => GIC_IIDR_IMPLEMENTER,
            GICR_TYPER => self.typer(),
            // Affinity 0 mirrors the CPU index.
            GICR_TYPER_HI => self.cpu as u32,
            GICR_WAKER => self.waker,
            GICR_PROPBASER => self.propbaser as u32,
            GICR_PROPBASER_HI => (self.propbaser >> 32) as u32,
            GICR_PENDBASER => self.pendbaser as u32,
            GICR_PENDBASER_HI => (self.pendbaser >> 32) as u32,
            GICR_PIDR2 => GIC_PIDR2_ARCH_GICV3,
            GICR_IGROUPR0 => self.group0,
            GICR_ISENABLER0 | GICR_ICENABLER0 => self.enable0,
            GICR_ISPENDR0 | GICR_ICPENDR0 => self.pending0,
            GICR_ISACTIVER0 | GICR_ICACTIVER0 => self.active0,
            GICR_ICFGR0 => self.icfgr[0],
            GICR_ICFGR1 => self.icfgr[1],
            GICR_IGRPMODR0 => self.group_mod0,
            o if (GICR_IPRIORITYR..GICR_IPRIORITYR + 32).contains(&o) => {
                self.priority[((o - GICR_IPRIORITYR) / 4) as usize]
            }
            _ => {
                trace!("GICR read from unhandled offset {:#x}", offset);
                0
            }
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            GICR_CTLR => {
                if self.has_lpi {
                    self.ctlr = value & GICR_CTLR_ENABLE_LPIS;
                }
            }
            GICR_WAKER => {
                // Clearing ProcessorSleep wakes the children too.
                let mut waker = value & GICR_WAKER_PROCESSOR_SLEEP;
                if waker & GICR_WAKER_PROCESSOR_SLEEP != 0 {
                    waker |= GICR_WAKER_CHILDREN_ASLEEP;
                }
                self.waker = waker;
            }
            GICR_PROPBASER => {
                self.propbaser = (self.propbaser & 0xffff_ffff_0000_0000) | value as u64;
            }
            GICR_PROPBASER_HI => {
                self.propbaser = (self.propbaser & 0xffff_ffff) | ((value as u64) << 32);
            }
            GICR_PENDBASER => {
                self.pendbaser = (self.pendbaser & 0xffff_ffff_0000_0000) | value as u64;
            }
            GICR_PENDBASER_HI => {
                self.pendbaser = (self.pendbaser & 0xffff_ffff) | ((value as u64) << 32);
            }
            GICR_IGROUPR0 => self.group0 = value,
            GICR_ISENABLER0 => self.enable0 |= value,
            GICR_ICENABLER0 => self.enable0 &= !value,
            GICR_ISPENDR0 => self.pending0 |= value,
            GICR_ICPENDR0 => self.pending0 &= !value,
            GICR_ISACTIVER0 => self.active0 |= value,
            GICR_ICACTIVER0 => self.active0 &= !value,
            GICR_ICFGR0 => self.icfgr[0] = value,
            GICR_ICFGR1 => self.icfgr[1] = value,
            GICR_IGRPMODR0 => self.group_mod0 = value,
            o if (GICR_IPRIORITYR..GICR_IPRIORITYR + 32).contains(&o) => {
                self.priority[((o - GICR_IPRIORITYR) / 4) as usize] = value;
            }
            _ => {
                trace!(
                    "GICR write to unhandled offset {:#x} value {:#x}",
                    offset,
                    value
                );
            }
        }
    }

    /// Drives the level of private interrupt `intid` (0..32) for this CPU.
    fn set_private_level(&mut self, intid: u32, level: bool) {
        let bit = 1 << intid;
        if level {
            self.pending0 |= bit;
        } else {
            self.pending0 &= !bit;
        }
    }

    fn private_priority(&self, intid: u32) -> u8 {
        let word = (intid / 4) as usize;
        let shift = (intid % 4) * 8;
        ((self.priority[word] >> shift) & 0xff) as u8
    }

    fn lpis_enabled(&self) -> bool {
        self.ctlr & GICR_CTLR_ENABLE_LPIS != 0
    }

    /// Highest priority pending-and-enabled private interrupt or LPI.
    fn best_pending(&self) -> Option<(u32, u8)> {
        let mut best: Option<(u32, u8)> = None;
        let deliverable = self.pending0 & self.enable0;
        for intid in 0..GIC_INTERNAL_IRQS {
            if deliverable & (1 << intid) == 0 {
                continue;
            }
            let priority = self.private_priority(intid);
            match best {
                Some((_, p)) if p <= priority => {}
                _ => best = Some((intid, priority)),
            }
        }
        if self.lpis_enabled() {
            for (&intid, &priority) in &self.lpi_pending {
                match best {
                    Some((_, p)) if p <= priority => {}
                    _ => best = Some((intid, priority)),
                }
            }
        }
        best
    }
}

pub(crate) struct GicState {
    pub(crate) realized: bool,
    num_cpus: usize,
    num_spis: u32,
    dist: Distributor,
    redists: Vec<Redistributor>,
    /// Controller-to-CPU output lines, indexed `cpu + kind * num_cpus`.
    /// Only the group-1 IRQ outputs (kind 0) are actively driven.
    outputs: Vec<Option<Arc<dyn IrqLine>>>,
    sysmem: Arc<GuestMemory>,
}

impl GicState {
    fn set_irq_line(&mut self, line: u32, level: bool) {
        if line < self.num_spis {
            self.dist.set_spi_level(line, level);
        } else {
            let private = line - self.num_spis;
            let cpu = (private / GIC_INTERNAL_IRQS) as usize;
            let intid = private % GIC_INTERNAL_IRQS;
            match self.redists.get_mut(cpu) {
                Some(redist) => redist.set_private_level(intid, level),
                None => {
                    warn!("interrupt input line {} has no redistributor", line);
                    return;
                }
            }
        }
        self.update_outputs();
    }

    fn best_pending(&self, cpu: usize) -> Option<(u32, u8)> {
        let mut best = self.redists.get(cpu).and_then(|r| r.best_pending());
        if let Some((intid, priority)) = self.dist.best_pending_spi(cpu) {
            match best {
                Some((_, p)) if p <= priority => {}
                _ => best = Some((intid, priority)),
            }
        }
        best
    }

    /// Re-evaluates and drives every CPU's IRQ output line. Assertion is
    /// fire-and-forget; there is no acknowledgment path back here.
    fn update_outputs(&self) {
        let group1 = self.dist.group1_enabled();
        for cpu in 0..self.num_cpus {
            let level = group1 && self.best_pending(cpu).is_some();
            if let Some(line) = self.outputs.get(cpu).and_then(|l| l.as_ref()) {
                line.set_level(level);
            }
        }
    }
}

/// The GICv3 interrupt controller.
///
/// Created once per machine, realized before any wiring, never destroyed for
/// the life of the machine. The system memory link passed at construction is
/// non-owning from the guest's point of view: the controller reads
/// guest-resident LPI tables through it but does not manage the region.
pub struct GicV3 {
    config: GicV3Config,
    state: Arc<Mutex<GicState>>,
}

impl GicV3 {
    /// Builds an unrealized controller from `config`, bound to the system
    /// memory region.
    pub fn new(config: GicV3Config, sysmem: Arc<GuestMemory>) -> Result<GicV3> {
        if config.revision != 3 {
            return Err(Error::InvalidRevision(config.revision));
        }
        if config.num_cpus == 0 || config.num_cpus > 8 {
            return Err(Error::UnsupportedCpuCount(config.num_cpus));
        }
        if config.num_irqs % 32 != 0
            || config.num_irqs <= GIC_INTERNAL_IRQS
            || config.num_irqs > 1024
        {
            return Err(Error::InvalidIrqCount(config.num_irqs));
        }
        let dist = Distributor::new(&config);
        let num_spis = config.num_irqs - GIC_INTERNAL_IRQS;
        let state = GicState {
            realized: false,
            num_cpus: config.num_cpus,
            num_spis,
            dist,
            redists: Vec::new(),
            outputs: Vec::new(),
            sysmem,
        };
        Ok(GicV3 {
            config,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Realizes the controller: sizes the redistributors and the output-line
    /// table. One-shot; the controller may not be reconfigured afterwards.
    pub fn realize(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.realized {
            return Err(Error::AlreadyRealized);
        }
        let frames: u32 = self.config.redist_region_count.iter().sum();
        if (frames as usize) < self.config.num_cpus {
            return Err(Error::RedistributorCapacity {
                regions: frames,
                num_cpus: self.config.num_cpus,
            });
        }
        let num_cpus = self.config.num_cpus;
        state.redists = (0..num_cpus)
            .map(|cpu| Redistributor::new(cpu, cpu == num_cpus - 1, self.config.has_lpi))
            .collect();
        state.outputs = vec![None; 4 * num_cpus];
        state.realized = true;
        Ok(())
    }

    pub fn realized(&self) -> bool {
        self.state.lock().unwrap().realized
    }

    pub fn config(&self) -> &GicV3Config {
        &self.config
    }

    pub fn num_cpus(&self) -> usize {
        self.config.num_cpus
    }

    /// Total input lines: the external lines followed by one 32-line private
    /// block per CPU.
    pub fn num_input_lines(&self) -> u32 {
        self.config.num_irqs - GIC_INTERNAL_IRQS
            + GIC_INTERNAL_IRQS * self.config.num_cpus as u32
    }

    /// Size of the redistributor MMIO window covering every frame.
    pub fn redistributor_window_size(&self) -> u64 {
        let frames: u32 = self.config.redist_region_count.iter().sum();
        frames as u64 * GICR_FRAME_SIZE
    }

    /// Returns a handle that drives input line `line`.
    pub fn irq_line(&self, line: u32) -> Result<GicIrqLine> {
        if !self.realized() {
            return Err(Error::NotRealized);
        }
        if line >= self.num_input_lines() {
            return Err(Error::InvalidIrqLine(line));
        }
        Ok(GicIrqLine {
            state: self.state.clone(),
            line,
        })
    }

    /// Connects controller output `line` to `sink`. Output lines are indexed
    /// `cpu + kind * num_cpus` with kinds IRQ, FIQ, VIRQ, VFIQ.
    pub fn connect_output(&self, line: u32, sink: Arc<dyn IrqLine>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.realized {
            return Err(Error::NotRealized);
        }
        let slot = state
            .outputs
            .get_mut(line as usize)
            .ok_or(Error::InvalidOutputLine(line))?;
        *slot = Some(sink);
        Ok(())
    }

    /// Drives input line `line`. Prefer [`GicV3::irq_line`] handles for
    /// connections built at assembly time.
    pub fn set_irq_line(&self, line: u32, level: bool) {
        self.state.lock().unwrap().set_irq_line(line, level);
    }

    /// Marks LPI `intid` pending on `cpu` if the guest's LPI configuration
    /// table enables it. The table lives in guest memory at the address the
    /// guest programmed into GICR_PROPBASER; this is the DMA-style path that
    /// needs the system memory link.
    pub fn set_lpi_pending(&self, cpu: usize, intid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.realized {
            return Err(Error::NotRealized);
        }
        if !self.config.has_lpi {
            return Err(Error::LpisDisabled);
        }
        if intid < GIC_LPI_BASE {
            return Err(Error::LpiOutOfRange(intid));
        }
        let sysmem = state.sysmem.clone();
        let redist = state
            .redists
            .get_mut(cpu)
            .ok_or(Error::CpuOutOfRange(cpu))?;
        if !redist.lpis_enabled() {
            trace!("dropping LPI {} for cpu {}: LPIs not enabled", intid, cpu);
            return Ok(());
        }
        let idbits = redist.propbaser & GICR_PROPBASER_IDBITS_MASK;
        if u64::from(intid) >= 1u64 << (idbits + 1) {
            trace!("dropping LPI {}: beyond configured INTID space", intid);
            return Ok(());
        }
        let table = redist.propbaser & GICR_PROPBASER_ADDR_MASK;
        let entry = GuestAddress(table + u64::from(intid - GIC_LPI_BASE));
        let cfg = sysmem
            .read_u8_at(entry)
            .map_err(Error::LpiConfigTableAccess)?;
        if cfg & 1 != 0 {
            redist.lpi_pending.insert(intid, cfg & 0xfc);
            state.update_outputs();
        }
        Ok(())
    }

    /// Clears a pending LPI, e.g. once the guest has serviced it.
    pub fn clear_lpi_pending(&self, cpu: usize, intid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let redist = state
            .redists
            .get_mut(cpu)
            .ok_or(Error::CpuOutOfRange(cpu))?;
        redist.lpi_pending.remove(&intid);
        state.update_outputs();
        Ok(())
    }

    /// Highest priority deliverable interrupt for `cpu`, or `None` (the
    /// spurious case, INTID 1023).
    pub fn highest_priority_pending(&self, cpu: usize) -> Option<(u32, u8)> {
        self.state.lock().unwrap().best_pending(cpu)
    }

    /// The distributor MMIO frame. Available once realized.
    pub fn distributor_frame(&self) -> Result<GicDistributorFrame> {
        if !self.realized() {
            return Err(Error::NotRealized);
        }
        Ok(GicDistributorFrame {
            state: self.state.clone(),
        })
    }

    /// The redistributor MMIO frame covering every redistributor in the
    /// single region this board uses. Available once realized.
    pub fn redistributor_frame(&self) -> Result<GicRedistributorFrame> {
        if !self.realized() {
            return Err(Error::NotRealized);
        }
        Ok(GicRedistributorFrame {
            state: self.state.clone(),
        })
    }

    pub(crate) fn state_weak(&self) -> Weak<Mutex<GicState>> {
        Arc::downgrade(&self.state)
    }
}

/// Handle driving a single controller input line.
pub struct GicIrqLine {
    state: Arc<Mutex<GicState>>,
    line: u32,
}

impl GicIrqLine {
    pub fn line(&self) -> u32 {
        self.line
    }
}

impl IrqLine for GicIrqLine {
    fn set_level(&self, level: bool) {
        self.state.lock().unwrap().set_irq_line(self.line, level);
    }
}

fn register_access(info: BusAccessInfo, len: usize) -> bool {
    len == 4 && info.offset % 4 == 0
}

/// Distributor MMIO window.
pub struct GicDistributorFrame {
    state: Arc<Mutex<GicState>>,
}

impl BusDevice for GicDistributorFrame {
    fn debug_label(&self) -> String {
        "GICv3 distributor".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if !register_access(info, data.len()) {
            warn!("GICD: unsupported read of {} bytes at {}", data.len(), info);
            for v in data.iter_mut() {
                *v = 0;
            }
            return;
        }
        let state = self.state.lock().unwrap();
        write_le_u32(data, state.dist.read_reg(info.offset));
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if !register_access(info, data.len()) {
            warn!("GICD: unsupported write of {} bytes at {}", data.len(), info);
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.dist.write_reg(info.offset, read_le_u32(data));
        state.update_outputs();
    }
}

/// Redistributor MMIO window; decodes the per-CPU frame from the offset.
pub struct GicRedistributorFrame {
    state: Arc<Mutex<GicState>>,
}

impl GicRedistributorFrame {
    fn frame(info: BusAccessInfo) -> (usize, u64) {
        (
            (info.offset / GICR_FRAME_SIZE) as usize,
            info.offset % GICR_FRAME_SIZE,
        )
    }
}

impl BusDevice for GicRedistributorFrame {
    fn debug_label(&self) -> String {
        "GICv3 redistributor".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if !register_access(info, data.len()) {
            warn!("GICR: unsupported read of {} bytes at {}", data.len(), info);
            for v in data.iter_mut() {
                *v = 0;
            }
            return;
        }
        let (cpu, offset) = GicRedistributorFrame::frame(info);
        let state = self.state.lock().unwrap();
        let value = match state.redists.get(cpu) {
            Some(redist) => redist.read_reg(offset),
            // Frames beyond the last CPU within the region read as zero.
            None => 0,
        };
        write_le_u32(data, value);
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if !register_access(info, data.len()) {
            warn!("GICR: unsupported write of {} bytes at {}", data.len(), info);
            return;
        }
        let (cpu, offset) = GicRedistributorFrame::frame(info);
        let mut state = self.state.lock().unwrap();
        if let Some(redist) = state.redists.get_mut(cpu) {
            redist.write_reg(offset, read_le_u32(data));
            state.update_outputs();
        }
    }
}
