// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! RK3399 board emulation.
//!
//! Assembles the machine from its fixed memory map: guest RAM, the GICv3
//! interrupt fabric, two clock/reset units, and stub windows for the
//! peripherals Linux probes but the board does not model. CPU and boot-image
//! construction are behind traits so the board logic stays independent of
//! any particular hypervisor backend.

mod fabric;

use std::result;
use std::sync::Arc;
use std::sync::Mutex;

use log::info;
use remain::sorted;
use thiserror::Error as ThisError;

use devices::irqchip;
use devices::irqchip::IrqLine;
use devices::Bus;
use devices::BusDevice;
use devices::BusError;
use devices::ClockResetUnit;
use devices::UnimplementedDevice;
use devices::CRU_MMIO_SIZE;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

pub use crate::fabric::assemble_interrupt_fabric;
pub use crate::fabric::CpuIrqInput;
pub use crate::fabric::DeviceConnection;
pub use crate::fabric::InterruptFabric;
pub use crate::fabric::IrqSourceKind;
pub use crate::fabric::OutputConnection;
pub use crate::fabric::TimerKind;

// Fixed physical memory map.
pub const RK3399_GICD_BASE: u64 = 0xfee0_0000;
pub const RK3399_ITS_BASE: u64 = 0xfee2_0000;
pub const RK3399_GICR_BASE: u64 = 0xfef0_0000;
pub const RK3399_PMUCRU_BASE: u64 = 0xff75_0000;
pub const RK3399_CRU_BASE: u64 = 0xff76_0000;
pub const RK3399_GRF_BASE: u64 = 0xff77_0000;
pub const RK3399_GRF_SIZE: u64 = 0x10000;
pub const RK3399_PMU_BASE: u64 = 0xff31_0000;
pub const RK3399_PMU_SIZE: u64 = 0x1000;
pub const RK3399_RKTIMER_BASE: u64 = 0xff85_0000;
pub const RK3399_RKTIMER_SIZE: u64 = 0x20;
pub const RK3399_UART_BASES: [u64; 4] = [0xff18_0000, 0xff19_0000, 0xff1a_0000, 0xff1b_0000];
pub const RK3399_UART_SIZE: u64 = 0x100;
pub const RK3399_CPU_DEBUG_BASES: [u64; 6] = [
    0xfe43_0000,
    0xfe43_2000,
    0xfe43_4000,
    0xfe43_6000,
    0xfe61_0000,
    0xfe71_0000,
];
pub const RK3399_CPU_DEBUG_SIZE: u64 = 0x1000;

/// Shared (non-private) interrupt lines into the controller.
pub const RK3399_NUM_IRQS: u32 = 256;

/// Largest CPU count the board supports.
pub const RK3399_MAX_CPUS: usize = 4;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("failed to connect an interrupt line: {0}")]
    ConnectIrq(irqchip::Error),
    #[error("failed to create cpus: {0}")]
    CreateCpus(anyhow::Error),
    #[error("failed to create the interrupt controller: {0}")]
    CreateGic(irqchip::Error),
    #[error("failed to create guest memory: {0}")]
    CreateGuestMemory(vm_memory::Error),
    #[error("failed to create the translation service: {0}")]
    CreateIts(irqchip::Error),
    #[error("invalid cpu count {0}, the board supports 1 to 4 cpus")]
    InvalidCpuCount(usize),
    #[error("failed to load the boot image: {0}")]
    LoadBootImage(anyhow::Error),
    #[error("failed to map {name} at {base:#x}: {err}")]
    MapMmioDevice {
        name: &'static str,
        base: u64,
        err: BusError,
    },
    #[error("failed to realize the interrupt controller: {0}")]
    RealizeGic(irqchip::Error),
    #[error("failed to realize the translation service: {0}")]
    RealizeIts(irqchip::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Exception-level features requested for each CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuConfig {
    pub has_el2: bool,
    pub has_el3: bool,
}

/// How the guest calls into PSCI firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsciConduit {
    Disabled,
    Hvc,
    Smc,
}

/// Boot-image placement handed to the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootParams {
    pub ram_size: u64,
    pub loader_start: GuestAddress,
    pub psci_conduit: PsciConduit,
}

/// A virtual CPU as the board sees it: a sink for controller outputs and a
/// set of per-CPU interrupt sources the fabric wires up.
pub trait ArmCpu: Send + Sync {
    /// Hands the CPU the line it must drive when `source` fires.
    fn connect_irq_output(&self, source: IrqSourceKind, line: Arc<dyn IrqLine>);

    /// The line driving this CPU's `input` exception input.
    fn irq_input(&self, input: CpuIrqInput) -> Arc<dyn IrqLine>;
}

/// Creates the board's CPUs. Implemented by the hypervisor backend.
pub trait CpuFactory {
    fn create_cpus(&self, count: usize, config: CpuConfig)
        -> anyhow::Result<Vec<Arc<dyn ArmCpu>>>;
}

/// Places the boot image into guest memory.
pub trait BootLoader {
    fn load_boot_image(&mut self, mem: &GuestMemory, params: &BootParams) -> anyhow::Result<()>;
}

/// Board configuration.
#[derive(Debug, Clone, Copy)]
pub struct Rk3399Config {
    pub ram_size: u64,
    pub cpu_count: usize,
}

/// The assembled board.
pub struct Rk3399 {
    guest_mem: Arc<GuestMemory>,
    mmio_bus: Bus,
    cpus: Vec<Arc<dyn ArmCpu>>,
    fabric: InterruptFabric,
    pmucru: Arc<Mutex<ClockResetUnit>>,
    cru: Arc<Mutex<ClockResetUnit>>,
}

impl Rk3399 {
    /// Builds the machine: RAM, CPUs without EL2/EL3, the interrupt fabric,
    /// both clock/reset units, the stub peripherals, and finally the boot
    /// image at the base of RAM with PSCI over SMC.
    pub fn build(
        config: Rk3399Config,
        cpu_factory: &dyn CpuFactory,
        boot_loader: &mut dyn BootLoader,
    ) -> Result<Rk3399> {
        if config.cpu_count == 0 || config.cpu_count > RK3399_MAX_CPUS {
            return Err(Error::InvalidCpuCount(config.cpu_count));
        }
        let guest_mem =
            Arc::new(GuestMemory::new(config.ram_size).map_err(Error::CreateGuestMemory)?);

        // PSCI carries power control, so the CPUs get neither EL2 nor EL3.
        let cpu_config = CpuConfig {
            has_el2: false,
            has_el3: false,
        };
        let cpus = cpu_factory
            .create_cpus(config.cpu_count, cpu_config)
            .map_err(Error::CreateCpus)?;

        let mmio_bus = Bus::new();
        let fabric = assemble_interrupt_fabric(&cpus, guest_mem.clone(), &mmio_bus)?;
        info!(
            "interrupt fabric assembled for {} cpus: {} device connections, {} output connections",
            config.cpu_count,
            fabric.device_connections().len(),
            fabric.output_connections().len()
        );

        let pmucru = Arc::new(Mutex::new(ClockResetUnit::pmu()));
        Rk3399::map(&mmio_bus, pmucru.clone(), "pmucru", RK3399_PMUCRU_BASE, CRU_MMIO_SIZE)?;
        let cru = Arc::new(Mutex::new(ClockResetUnit::main()));
        Rk3399::map(&mmio_bus, cru.clone(), "cru", RK3399_CRU_BASE, CRU_MMIO_SIZE)?;

        Rk3399::map_stub(&mmio_bus, "grf", RK3399_GRF_BASE, RK3399_GRF_SIZE)?;
        Rk3399::map_stub(&mmio_bus, "pmu", RK3399_PMU_BASE, RK3399_PMU_SIZE)?;
        Rk3399::map_stub(&mmio_bus, "rktimer", RK3399_RKTIMER_BASE, RK3399_RKTIMER_SIZE)?;
        for (i, base) in RK3399_UART_BASES.iter().enumerate() {
            let name: &'static str = ["uart0", "uart1", "uart2", "uart3"][i];
            Rk3399::map_stub(&mmio_bus, name, *base, RK3399_UART_SIZE)?;
        }
        for (i, base) in RK3399_CPU_DEBUG_BASES.iter().enumerate() {
            let name: &'static str = [
                "cpu-debug0",
                "cpu-debug1",
                "cpu-debug2",
                "cpu-debug3",
                "cpu-debug4",
                "cpu-debug5",
            ][i];
            Rk3399::map_stub(&mmio_bus, name, *base, RK3399_CPU_DEBUG_SIZE)?;
        }

        let boot_params = BootParams {
            ram_size: config.ram_size,
            loader_start: GuestAddress(0),
            psci_conduit: PsciConduit::Smc,
        };
        boot_loader
            .load_boot_image(&guest_mem, &boot_params)
            .map_err(Error::LoadBootImage)?;
        info!(
            "boot image loaded at {} with {:?} psci conduit",
            boot_params.loader_start, boot_params.psci_conduit
        );

        Ok(Rk3399 {
            guest_mem,
            mmio_bus,
            cpus,
            fabric,
            pmucru,
            cru,
        })
    }

    fn map(
        bus: &Bus,
        device: Arc<Mutex<dyn BusDevice>>,
        name: &'static str,
        base: u64,
        len: u64,
    ) -> Result<()> {
        bus.insert(device, base, len)
            .map_err(|err| Error::MapMmioDevice { name, base, err })
    }

    fn map_stub(bus: &Bus, name: &'static str, base: u64, len: u64) -> Result<()> {
        Rk3399::map(
            bus,
            Arc::new(Mutex::new(UnimplementedDevice::new(name))),
            name,
            base,
            len,
        )
    }

    pub fn guest_mem(&self) -> &Arc<GuestMemory> {
        &self.guest_mem
    }

    pub fn mmio_bus(&self) -> &Bus {
        &self.mmio_bus
    }

    pub fn cpus(&self) -> &[Arc<dyn ArmCpu>] {
        &self.cpus
    }

    pub fn fabric(&self) -> &InterruptFabric {
        &self.fabric
    }

    pub fn pmucru(&self) -> &Arc<Mutex<ClockResetUnit>> {
        &self.pmucru
    }

    pub fn cru(&self) -> &Arc<Mutex<ClockResetUnit>> {
        &self.cru
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    pub(crate) struct LevelLine {
        level: AtomicBool,
    }

    impl LevelLine {
        fn new() -> Arc<LevelLine> {
            Arc::new(LevelLine {
                level: AtomicBool::new(false),
            })
        }
    }

    impl IrqLine for LevelLine {
        fn set_level(&self, level: bool) {
            self.level.store(level, Ordering::SeqCst);
        }
    }

    /// Records its wiring; fires nothing on its own.
    pub(crate) struct TestCpu {
        inputs: [Arc<LevelLine>; 4],
        outputs: Mutex<Vec<(IrqSourceKind, Arc<dyn IrqLine>)>>,
    }

    impl TestCpu {
        pub(crate) fn new() -> TestCpu {
            TestCpu {
                inputs: [
                    LevelLine::new(),
                    LevelLine::new(),
                    LevelLine::new(),
                    LevelLine::new(),
                ],
                outputs: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn input_level(&self, input: CpuIrqInput) -> bool {
            self.inputs[input.index() as usize].level.load(Ordering::SeqCst)
        }

        pub(crate) fn connected_sources(&self) -> Vec<IrqSourceKind> {
            self.outputs.lock().unwrap().iter().map(|(s, _)| *s).collect()
        }

        /// Fires a recorded source line directly, as the CPU model would.
        pub(crate) fn fire(&self, source: IrqSourceKind, level: bool) {
            let outputs = self.outputs.lock().unwrap();
            for (kind, line) in outputs.iter() {
                if *kind == source {
                    line.set_level(level);
                }
            }
        }
    }

    impl ArmCpu for TestCpu {
        fn connect_irq_output(&self, source: IrqSourceKind, line: Arc<dyn IrqLine>) {
            self.outputs.lock().unwrap().push((source, line));
        }

        fn irq_input(&self, input: CpuIrqInput) -> Arc<dyn IrqLine> {
            self.inputs[input.index() as usize].clone()
        }
    }

    pub(crate) struct TestCpuFactory {
        pub(crate) created: Mutex<Vec<Arc<TestCpu>>>,
        pub(crate) config_seen: Mutex<Option<CpuConfig>>,
    }

    impl TestCpuFactory {
        pub(crate) fn new() -> TestCpuFactory {
            TestCpuFactory {
                created: Mutex::new(Vec::new()),
                config_seen: Mutex::new(None),
            }
        }
    }

    impl CpuFactory for TestCpuFactory {
        fn create_cpus(
            &self,
            count: usize,
            config: CpuConfig,
        ) -> anyhow::Result<Vec<Arc<dyn ArmCpu>>> {
            *self.config_seen.lock().unwrap() = Some(config);
            let mut created = self.created.lock().unwrap();
            let mut cpus: Vec<Arc<dyn ArmCpu>> = Vec::new();
            for _ in 0..count {
                let cpu = Arc::new(TestCpu::new());
                created.push(cpu.clone());
                cpus.push(cpu);
            }
            Ok(cpus)
        }
    }

    pub(crate) struct TestLoader {
        pub(crate) params_seen: Option<BootParams>,
    }

    impl TestLoader {
        pub(crate) fn new() -> TestLoader {
            TestLoader { params_seen: None }
        }
    }

    impl BootLoader for TestLoader {
        fn load_boot_image(
            &mut self,
            mem: &GuestMemory,
            params: &BootParams,
        ) -> anyhow::Result<()> {
            // A fragment at the load address, standing in for a kernel.
            mem.write_all_at(params.loader_start, &[0xd5, 0x03, 0x20, 0x1f])?;
            self.params_seen = Some(*params);
            Ok(())
        }
    }

    fn test_config() -> Rk3399Config {
        Rk3399Config {
            ram_size: 0x10_0000,
            cpu_count: 4,
        }
    }

    #[test]
    fn build_rejects_bad_cpu_counts() {
        for count in [0usize, 5, 64] {
            let factory = TestCpuFactory::new();
            let mut loader = TestLoader::new();
            let config = Rk3399Config {
                ram_size: 0x1000,
                cpu_count: count,
            };
            assert!(matches!(
                Rk3399::build(config, &factory, &mut loader),
                Err(Error::InvalidCpuCount(c)) if c == count
            ));
        }
    }

    #[test]
    fn build_creates_cpus_without_el2_or_el3() {
        let factory = TestCpuFactory::new();
        let mut loader = TestLoader::new();
        let machine = Rk3399::build(test_config(), &factory, &mut loader).unwrap();
        assert_eq!(machine.cpus().len(), 4);
        assert_eq!(
            *factory.config_seen.lock().unwrap(),
            Some(CpuConfig {
                has_el2: false,
                has_el3: false,
            })
        );
    }

    #[test]
    fn build_loads_boot_image_at_ram_base_with_smc_psci() {
        let factory = TestCpuFactory::new();
        let mut loader = TestLoader::new();
        let machine = Rk3399::build(test_config(), &factory, &mut loader).unwrap();
        assert_eq!(
            loader.params_seen,
            Some(BootParams {
                ram_size: 0x10_0000,
                loader_start: GuestAddress(0),
                psci_conduit: PsciConduit::Smc,
            })
        );
        let mut word = [0u8; 4];
        machine
            .guest_mem()
            .read_exact_at(GuestAddress(0), &mut word)
            .unwrap();
        assert_eq!(word, [0xd5, 0x03, 0x20, 0x1f]);
    }

    #[test]
    fn every_cpu_gets_its_private_sources() {
        let factory = TestCpuFactory::new();
        let mut loader = TestLoader::new();
        let _machine = Rk3399::build(test_config(), &factory, &mut loader).unwrap();
        for cpu in factory.created.lock().unwrap().iter() {
            let sources = cpu.connected_sources();
            assert_eq!(sources.len(), 7);
            for timer in TimerKind::ALL {
                assert!(sources.contains(&IrqSourceKind::Timer(timer)));
            }
            assert!(sources.contains(&IrqSourceKind::Maintenance));
            assert!(sources.contains(&IrqSourceKind::PerformanceMonitor));
        }
    }

    #[test]
    fn cru_windows_respond_on_the_bus() {
        let factory = TestCpuFactory::new();
        let mut loader = TestLoader::new();
        let machine = Rk3399::build(test_config(), &factory, &mut loader).unwrap();
        let bus = machine.mmio_bus();

        // Power-on values visible at both windows.
        let mut word = [0u8; 4];
        assert!(bus.read(RK3399_PMUCRU_BASE + 0x8, &mut word));
        assert_eq!(u32::from_le_bytes(word), 0x0000_031f);
        assert!(bus.read(RK3399_CRU_BASE + 0x90, &mut word));
        assert_eq!(u32::from_le_bytes(word), 0x2dc);

        // A PLL configuration write reads back as locked.
        assert!(bus.write(RK3399_CRU_BASE + 0x28, &0x1234u32.to_le_bytes()));
        assert!(bus.read(RK3399_CRU_BASE + 0x28, &mut word));
        assert_eq!(u32::from_le_bytes(word), 0x1234 | (1 << 31));
    }

    #[test]
    fn stub_windows_accept_accesses() {
        let factory = TestCpuFactory::new();
        let mut loader = TestLoader::new();
        let machine = Rk3399::build(test_config(), &factory, &mut loader).unwrap();
        let bus = machine.mmio_bus();

        let mut word = [0xaau8; 4];
        for base in RK3399_UART_BASES {
            assert!(bus.write(base, &[0x55; 4]));
            assert!(bus.read(base, &mut word));
            assert_eq!(word, [0; 4]);
        }
        for base in RK3399_CPU_DEBUG_BASES {
            assert!(bus.read(base + 0xff0, &mut word));
        }
        assert!(bus.read(RK3399_GRF_BASE + 0xe220, &mut word));
        assert!(bus.read(RK3399_RKTIMER_BASE + 0x18, &mut word));
        assert!(bus.read(RK3399_PMU_BASE, &mut word));

        // Holes in the map stay unclaimed.
        assert!(!bus.read(0xdead_0000, &mut word));
    }

    #[test]
    fn cpu_fired_timer_reaches_the_gic() {
        let factory = TestCpuFactory::new();
        let mut loader = TestLoader::new();
        let machine = Rk3399::build(test_config(), &factory, &mut loader).unwrap();
        let bus = machine.mmio_bus();

        // Enable group 1 and the physical timer PPI on CPU 0.
        bus.write(RK3399_GICD_BASE, &2u32.to_le_bytes());
        bus.write(
            RK3399_GICR_BASE + 0x10000 + 0x100,
            &(1u32 << 30).to_le_bytes(),
        );

        let cpus = factory.created.lock().unwrap();
        cpus[0].fire(IrqSourceKind::Timer(TimerKind::Physical), true);
        assert!(cpus[0].input_level(CpuIrqInput::Irq));
        assert!(!cpus[1].input_level(CpuIrqInput::Irq));
        cpus[0].fire(IrqSourceKind::Timer(TimerKind::Physical), false);
        assert!(!cpus[0].input_level(CpuIrqInput::Irq));
    }
}
