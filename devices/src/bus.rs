// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory-mapped I/O dispatch for the system address space.
//!
//! Each device registers exactly one window of the guest physical address
//! space. Windows may not overlap. Every access to a given device is
//! serialized by that device's mutex; devices rely on this instead of
//! implementing their own locking discipline.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::result;
use std::sync::Arc;
use std::sync::Mutex;

use log::trace;
use remain::sorted;
use thiserror::Error;

/// Information about how a device was accessed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusAccessInfo {
    /// Offset from the start of the device's bus range.
    pub offset: u64,
    /// Absolute address of the access on the bus.
    pub address: u64,
}

impl fmt::Display for BusAccessInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "address {:#x} (offset {:#x})", self.address, self.offset)
    }
}

/// A device mapped into the system address space.
///
/// The bus bounds-checks accesses against the registered window before they
/// reach the device, so `info.offset` is always inside the window. Width is
/// not validated here; devices reject widths they do not implement.
pub trait BusDevice: Send {
    /// Returns a label suitable for debug output.
    fn debug_label(&self) -> String;

    /// Reads at `offset` from this device.
    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        let _ = (info, data);
    }

    /// Writes at `offset` into this device.
    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        let _ = (info, data);
    }
}

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("device window {base:#x}+{len:#x} overlaps an existing device")]
    Overlap { base: u64, len: u64 },
    #[error("device window at {base:#x} has zero length")]
    ZeroSizedRange { base: u64 },
}

pub type Result<T> = result::Result<T, Error>;

/// Holds a base and length representing the address space occupied by a
/// `BusDevice`.
#[derive(Debug, Copy, Clone)]
pub struct BusRange {
    pub base: u64,
    pub len: u64,
}

impl BusRange {
    /// Returns true if `addr` is within this range.
    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr - self.base < self.len
    }

    /// Returns true if this range overlaps with `other`.
    pub fn overlaps(&self, other: &BusRange) -> bool {
        self.base < other.base.saturating_add(other.len)
            && other.base < self.base.saturating_add(self.len)
    }
}

impl Eq for BusRange {}

impl PartialEq for BusRange {
    fn eq(&self, other: &BusRange) -> bool {
        self.base == other.base
    }
}

impl Ord for BusRange {
    fn cmp(&self, other: &BusRange) -> Ordering {
        self.base.cmp(&other.base)
    }
}

impl PartialOrd for BusRange {
    fn partial_cmp(&self, other: &BusRange) -> Option<Ordering> {
        Some(self.base.cmp(&other.base))
    }
}

/// A system bus containing mapped devices.
///
/// The bus is cheap to clone; clones share the same device map.
#[derive(Clone, Default)]
pub struct Bus {
    devices: Arc<Mutex<BTreeMap<BusRange, Arc<Mutex<dyn BusDevice>>>>>,
}

impl Bus {
    /// Constructs an empty bus.
    pub fn new() -> Bus {
        Bus {
            devices: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Puts the given device at the given address window on the bus.
    pub fn insert(&self, device: Arc<Mutex<dyn BusDevice>>, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::ZeroSizedRange { base });
        }
        let range = BusRange { base, len };
        let mut devices = self.devices.lock().unwrap();
        for existing in devices.keys() {
            if existing.overlaps(&range) {
                return Err(Error::Overlap { base, len });
            }
        }
        devices.insert(range, device);
        Ok(())
    }

    fn resolve(&self, addr: u64) -> Option<(u64, Arc<Mutex<dyn BusDevice>>)> {
        let devices = self.devices.lock().unwrap();
        let probe = BusRange { base: addr, len: 1 };
        let (range, device) = devices.range(..=probe).next_back()?;
        if range.contains(addr) {
            Some((addr - range.base, device.clone()))
        } else {
            None
        }
    }

    /// Reads `data.len()` bytes at `addr`.
    ///
    /// Returns true on success, false if no device claims the address.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> bool {
        match self.resolve(addr) {
            Some((offset, device)) => {
                let info = BusAccessInfo {
                    offset,
                    address: addr,
                };
                device.lock().unwrap().read(info, data);
                true
            }
            None => {
                trace!("no device claims read at {:#x}", addr);
                false
            }
        }
    }

    /// Writes `data.len()` bytes at `addr`.
    ///
    /// Returns true on success, false if no device claims the address.
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        match self.resolve(addr) {
            Some((offset, device)) => {
                let info = BusAccessInfo {
                    offset,
                    address: addr,
                };
                device.lock().unwrap().write(info, data);
                true
            }
            None => {
                trace!("no device claims write at {:#x}", addr);
                false
            }
        }
    }
}
