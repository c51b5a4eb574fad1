// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Placeholder for peripherals the board maps but does not model.

use log::debug;

use crate::BusAccessInfo;
use crate::BusDevice;

/// Accepts any access and does nothing meaningful: reads return zero, writes
/// are discarded. Keeps guest drivers that probe an address window from
/// faulting on a missing device.
pub struct UnimplementedDevice {
    debug_label: String,
}

impl UnimplementedDevice {
    pub fn new(debug_label: &str) -> UnimplementedDevice {
        UnimplementedDevice {
            debug_label: debug_label.to_string(),
        }
    }
}

impl BusDevice for UnimplementedDevice {
    fn debug_label(&self) -> String {
        self.debug_label.clone()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        debug!(
            "{}: unimplemented read of {} bytes at {}",
            self.debug_label,
            data.len(),
            info
        );
        for v in data.iter_mut() {
            *v = 0;
        }
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        debug!(
            "{}: unimplemented write of {} bytes at {}",
            self.debug_label,
            data.len(),
            info
        );
    }
}
