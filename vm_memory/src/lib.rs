// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest memory addressing and the system RAM region shared by the board's
//! devices.

use std::fmt;
use std::result;
use std::sync::Mutex;

use remain::sorted;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("guest address {0} is outside guest memory")]
    InvalidGuestAddress(GuestAddress),
    #[error("invalid guest memory size {0:#x}")]
    InvalidSize(u64),
}

pub type Result<T> = result::Result<T, Error>;

/// An address in the guest's physical address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    /// Creates a guest address from a raw physical address.
    pub fn new(raw_addr: u64) -> GuestAddress {
        GuestAddress(raw_addr)
    }

    /// Returns the address as a raw number.
    pub fn offset(self) -> u64 {
        self.0
    }

    /// Returns the offset from this address to the given base address.
    pub fn offset_from(self, base: GuestAddress) -> u64 {
        self.0 - base.0
    }

    /// Returns the result of the add or `None` on overflow.
    pub fn checked_add(self, other: u64) -> Option<GuestAddress> {
        self.0.checked_add(other).map(GuestAddress)
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The system memory region backing guest RAM.
///
/// Devices hold non-owning `Arc` links to this region; the interrupt
/// controller uses it to read guest-resident interrupt configuration tables.
/// All accesses are bounds checked.
pub struct GuestMemory {
    mem: Mutex<Box<[u8]>>,
    size: u64,
}

impl GuestMemory {
    /// Creates a zeroed guest RAM region of `size` bytes.
    pub fn new(size: u64) -> Result<GuestMemory> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }
        let mem = vec![0u8; size as usize].into_boxed_slice();
        Ok(GuestMemory {
            mem: Mutex::new(mem),
            size,
        })
    }

    /// Returns the size of the region in bytes.
    pub fn memory_size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, addr: GuestAddress, len: u64) -> Result<usize> {
        let end = addr
            .checked_add(len)
            .ok_or(Error::InvalidGuestAddress(addr))?;
        if end.offset() > self.size {
            return Err(Error::InvalidGuestAddress(addr));
        }
        Ok(addr.offset() as usize)
    }

    /// Reads exactly `buf.len()` bytes starting at `addr`.
    pub fn read_exact_at(&self, addr: GuestAddress, buf: &mut [u8]) -> Result<()> {
        let offset = self.check_range(addr, buf.len() as u64)?;
        let mem = self.mem.lock().unwrap();
        buf.copy_from_slice(&mem[offset..offset + buf.len()]);
        Ok(())
    }

    /// Writes all of `buf` starting at `addr`.
    pub fn write_all_at(&self, addr: GuestAddress, buf: &[u8]) -> Result<()> {
        let offset = self.check_range(addr, buf.len() as u64)?;
        let mut mem = self.mem.lock().unwrap();
        mem[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    /// Reads a single byte at `addr`.
    pub fn read_u8_at(&self, addr: GuestAddress) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact_at(addr, &mut byte)?;
        Ok(byte[0])
    }
}
