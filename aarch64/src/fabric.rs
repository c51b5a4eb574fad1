// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interrupt fabric assembly.
//!
//! Builds the board's interrupt topology in one pass: the GICv3, its ITS
//! child, the per-CPU device sources feeding controller inputs, and the
//! controller outputs feeding the CPU exception inputs. Every connection is
//! recorded in an explicit table so the wiring can be inspected after
//! assembly instead of being implied by hidden line numbers.

use std::sync::Arc;
use std::sync::Mutex;

use devices::irqchip::GicV3;
use devices::irqchip::GicV3Config;
use devices::irqchip::IrqLine;
use devices::irqchip::Its;
use devices::irqchip::GICD_MMIO_SIZE;
use devices::irqchip::GIC_INTERNAL_IRQS;
use devices::irqchip::GITS_MMIO_SIZE;
use devices::Bus;
use vm_memory::GuestMemory;

use crate::ArmCpu;
use crate::Error;
use crate::Result;
use crate::RK3399_GICD_BASE;
use crate::RK3399_GICR_BASE;
use crate::RK3399_ITS_BASE;
use crate::RK3399_NUM_IRQS;

/// The architectural generic timers, one set per CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// EL1 physical timer.
    Physical,
    /// EL1 virtual timer.
    Virtual,
    /// EL2 physical timer.
    Hypervisor,
    /// Secure EL1 physical timer.
    Secure,
    /// EL2 virtual timer.
    HypervisorVirtual,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::Physical,
        TimerKind::Virtual,
        TimerKind::Hypervisor,
        TimerKind::Secure,
        TimerKind::HypervisorVirtual,
    ];

    /// Architectural PPI INTID of this timer's interrupt.
    pub fn intid(self) -> u32 {
        match self {
            TimerKind::Physical => 30,
            TimerKind::Virtual => 27,
            TimerKind::Hypervisor => 26,
            TimerKind::Secure => 29,
            TimerKind::HypervisorVirtual => 28,
        }
    }
}

/// A per-CPU interrupt source wired into the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSourceKind {
    Timer(TimerKind),
    /// Virtual interface maintenance interrupt.
    Maintenance,
    /// Performance monitor overflow interrupt.
    PerformanceMonitor,
}

impl IrqSourceKind {
    /// Architectural PPI INTID of this source.
    pub fn intid(self) -> u32 {
        match self {
            IrqSourceKind::Timer(timer) => timer.intid(),
            IrqSourceKind::Maintenance => 25,
            IrqSourceKind::PerformanceMonitor => 23,
        }
    }
}

/// CPU exception inputs driven by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuIrqInput {
    Irq,
    Fiq,
    Virq,
    Vfiq,
}

impl CpuIrqInput {
    pub const ALL: [CpuIrqInput; 4] = [
        CpuIrqInput::Irq,
        CpuIrqInput::Fiq,
        CpuIrqInput::Virq,
        CpuIrqInput::Vfiq,
    ];

    /// Output-group index within the controller's output-line table.
    pub fn index(self) -> u32 {
        match self {
            CpuIrqInput::Irq => 0,
            CpuIrqInput::Fiq => 1,
            CpuIrqInput::Virq => 2,
            CpuIrqInput::Vfiq => 3,
        }
    }
}

/// One device-to-controller connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConnection {
    pub cpu: usize,
    pub source: IrqSourceKind,
    /// Controller input line the source drives.
    pub gic_input: u32,
}

/// One controller-to-CPU connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConnection {
    pub cpu: usize,
    pub input: CpuIrqInput,
    /// Controller output line feeding the CPU input.
    pub gic_output: u32,
}

/// The assembled interrupt topology.
pub struct InterruptFabric {
    gic: GicV3,
    its: Arc<Mutex<Its>>,
    device_connections: Vec<DeviceConnection>,
    output_connections: Vec<OutputConnection>,
}

impl InterruptFabric {
    pub fn gic(&self) -> &GicV3 {
        &self.gic
    }

    pub fn its(&self) -> &Arc<Mutex<Its>> {
        &self.its
    }

    pub fn device_connections(&self) -> &[DeviceConnection] {
        &self.device_connections
    }

    pub fn output_connections(&self) -> &[OutputConnection] {
        &self.output_connections
    }

    /// Drives the level of `source` on `cpu`, resolving the controller input
    /// line from the same formula assembly used.
    pub fn set_source_level(&self, cpu: usize, source: IrqSourceKind, level: bool) -> Result<()> {
        let input = gic_input_line(cpu, source.intid());
        let line = self.gic.irq_line(input).map_err(Error::ConnectIrq)?;
        line.set_level(level);
        Ok(())
    }
}

/// Controller input line for private interrupt `intid` on `cpu`: the private
/// blocks follow the shared interrupt lines, 32 lines per CPU.
fn gic_input_line(cpu: usize, intid: u32) -> u32 {
    RK3399_NUM_IRQS + cpu as u32 * GIC_INTERNAL_IRQS + intid
}

/// Controller output line for `input` on `cpu`: outputs are grouped by kind,
/// one line per CPU within each group.
fn gic_output_line(num_cpus: usize, cpu: usize, input: CpuIrqInput) -> u32 {
    cpu as u32 + input.index() * num_cpus as u32
}

/// Builds and wires the interrupt fabric for `cpus`.
///
/// Assembly order is fixed: create and realize the controller, map its
/// register frames, connect the per-CPU sources, connect the CPU inputs,
/// then create, realize and map the ITS. The ITS must come last since it
/// refuses to realize before its parent.
pub fn assemble_interrupt_fabric(
    cpus: &[Arc<dyn ArmCpu>],
    sysmem: Arc<GuestMemory>,
    mmio_bus: &Bus,
) -> Result<InterruptFabric> {
    let num_cpus = cpus.len();
    let config = GicV3Config {
        revision: 3,
        num_cpus,
        num_irqs: RK3399_NUM_IRQS + GIC_INTERNAL_IRQS,
        security_extensions: true,
        has_lpi: true,
        redist_region_count: vec![num_cpus.min(6) as u32],
    };
    let mut gic = GicV3::new(config, sysmem).map_err(Error::CreateGic)?;
    gic.realize().map_err(Error::RealizeGic)?;

    let dist = gic.distributor_frame().map_err(Error::CreateGic)?;
    mmio_bus
        .insert(Arc::new(Mutex::new(dist)), RK3399_GICD_BASE, GICD_MMIO_SIZE)
        .map_err(|err| Error::MapMmioDevice {
            name: "gicd",
            base: RK3399_GICD_BASE,
            err,
        })?;
    let redist = gic.redistributor_frame().map_err(Error::CreateGic)?;
    let redist_len = gic.redistributor_window_size();
    mmio_bus
        .insert(Arc::new(Mutex::new(redist)), RK3399_GICR_BASE, redist_len)
        .map_err(|err| Error::MapMmioDevice {
            name: "gicr",
            base: RK3399_GICR_BASE,
            err,
        })?;

    let mut device_connections = Vec::new();
    for (cpu_index, cpu) in cpus.iter().enumerate() {
        let mut connect = |source: IrqSourceKind| -> Result<()> {
            let gic_input = gic_input_line(cpu_index, source.intid());
            let line = gic.irq_line(gic_input).map_err(Error::ConnectIrq)?;
            cpu.connect_irq_output(source, Arc::new(line));
            device_connections.push(DeviceConnection {
                cpu: cpu_index,
                source,
                gic_input,
            });
            Ok(())
        };
        for timer in TimerKind::ALL {
            connect(IrqSourceKind::Timer(timer))?;
        }
        connect(IrqSourceKind::Maintenance)?;
        connect(IrqSourceKind::PerformanceMonitor)?;
    }

    let mut output_connections = Vec::new();
    for (cpu_index, cpu) in cpus.iter().enumerate() {
        for input in CpuIrqInput::ALL {
            let gic_output = gic_output_line(num_cpus, cpu_index, input);
            gic.connect_output(gic_output, cpu.irq_input(input))
                .map_err(Error::ConnectIrq)?;
            output_connections.push(OutputConnection {
                cpu: cpu_index,
                input,
                gic_output,
            });
        }
    }

    let mut its = Its::new(&gic).map_err(Error::CreateIts)?;
    its.realize().map_err(Error::RealizeIts)?;
    let its = Arc::new(Mutex::new(its));
    mmio_bus
        .insert(its.clone(), RK3399_ITS_BASE, GITS_MMIO_SIZE)
        .map_err(|err| Error::MapMmioDevice {
            name: "its",
            base: RK3399_ITS_BASE,
            err,
        })?;

    Ok(InterruptFabric {
        gic,
        its,
        device_connections,
        output_connections,
    })
}
