// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulated devices for the RK3399 virtual machine.

mod bus;
mod cru;
mod unimplemented;

pub mod irqchip;

pub use crate::bus::Bus;
pub use crate::bus::BusAccessInfo;
pub use crate::bus::BusDevice;
pub use crate::bus::BusRange;
pub use crate::bus::Error as BusError;
pub use crate::cru::ClockResetUnit;
pub use crate::cru::PllLockPolicy;
pub use crate::cru::CRU_MMIO_SIZE;
pub use crate::unimplemented::UnimplementedDevice;
