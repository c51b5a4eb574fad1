// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Whole-board test driving the machine the way early guest boot code does:
//! MMIO only, through the system bus.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use aarch64::ArmCpu;
use aarch64::BootLoader;
use aarch64::BootParams;
use aarch64::CpuConfig;
use aarch64::CpuFactory;
use aarch64::CpuIrqInput;
use aarch64::IrqSourceKind;
use aarch64::PsciConduit;
use aarch64::Rk3399;
use aarch64::Rk3399Config;
use aarch64::TimerKind;
use aarch64::RK3399_CRU_BASE;
use aarch64::RK3399_GICD_BASE;
use aarch64::RK3399_GICR_BASE;
use aarch64::RK3399_ITS_BASE;
use aarch64::RK3399_PMUCRU_BASE;
use devices::irqchip::IrqLine;
use devices::Bus;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

struct LevelLine {
    level: AtomicBool,
}

impl IrqLine for LevelLine {
    fn set_level(&self, level: bool) {
        self.level.store(level, Ordering::SeqCst);
    }
}

struct FakeCpu {
    inputs: [Arc<LevelLine>; 4],
    sources: Mutex<Vec<(IrqSourceKind, Arc<dyn IrqLine>)>>,
}

impl FakeCpu {
    fn new() -> FakeCpu {
        let line = || {
            Arc::new(LevelLine {
                level: AtomicBool::new(false),
            })
        };
        FakeCpu {
            inputs: [line(), line(), line(), line()],
            sources: Mutex::new(Vec::new()),
        }
    }

    fn irq_level(&self) -> bool {
        self.inputs[CpuIrqInput::Irq.index() as usize]
            .level
            .load(Ordering::SeqCst)
    }

    fn fire(&self, source: IrqSourceKind, level: bool) {
        for (kind, line) in self.sources.lock().unwrap().iter() {
            if *kind == source {
                line.set_level(level);
            }
        }
    }
}

impl ArmCpu for FakeCpu {
    fn connect_irq_output(&self, source: IrqSourceKind, line: Arc<dyn IrqLine>) {
        self.sources.lock().unwrap().push((source, line));
    }

    fn irq_input(&self, input: CpuIrqInput) -> Arc<dyn IrqLine> {
        self.inputs[input.index() as usize].clone()
    }
}

struct FakeCpuFactory {
    cpus: Mutex<Vec<Arc<FakeCpu>>>,
}

impl CpuFactory for FakeCpuFactory {
    fn create_cpus(
        &self,
        count: usize,
        _config: CpuConfig,
    ) -> anyhow::Result<Vec<Arc<dyn ArmCpu>>> {
        let mut cpus = self.cpus.lock().unwrap();
        let mut out: Vec<Arc<dyn ArmCpu>> = Vec::new();
        for _ in 0..count {
            let cpu = Arc::new(FakeCpu::new());
            cpus.push(cpu.clone());
            out.push(cpu);
        }
        Ok(out)
    }
}

struct BlobLoader {
    params: Option<BootParams>,
}

impl BootLoader for BlobLoader {
    fn load_boot_image(&mut self, mem: &GuestMemory, params: &BootParams) -> anyhow::Result<()> {
        mem.write_all_at(params.loader_start, b"kernel image")?;
        self.params = Some(*params);
        Ok(())
    }
}

fn build_machine(cpu_count: usize) -> (Rk3399, FakeCpuFactory, BlobLoader) {
    let factory = FakeCpuFactory {
        cpus: Mutex::new(Vec::new()),
    };
    let mut loader = BlobLoader { params: None };
    let machine = Rk3399::build(
        Rk3399Config {
            ram_size: 0x20_0000,
            cpu_count,
        },
        &factory,
        &mut loader,
    )
    .unwrap();
    (machine, factory, loader)
}

fn read_u32(bus: &Bus, addr: u64) -> u32 {
    let mut data = [0u8; 4];
    assert!(bus.read(addr, &mut data), "no device at {:#x}", addr);
    u32::from_le_bytes(data)
}

fn write_u32(bus: &Bus, addr: u64, value: u32) {
    assert!(bus.write(addr, &value.to_le_bytes()), "no device at {:#x}", addr);
}

#[test]
fn boot_image_and_psci_setup() {
    let (machine, _factory, loader) = build_machine(4);
    let params = loader.params.unwrap();
    assert_eq!(params.loader_start, GuestAddress(0));
    assert_eq!(params.ram_size, 0x20_0000);
    assert_eq!(params.psci_conduit, PsciConduit::Smc);

    let mut blob = [0u8; 12];
    machine
        .guest_mem()
        .read_exact_at(GuestAddress(0), &mut blob)
        .unwrap();
    assert_eq!(&blob, b"kernel image");
}

#[test]
fn clock_driver_pll_polling_terminates() {
    let (machine, _factory, _loader) = build_machine(2);
    let bus = machine.mmio_bus();

    // A clock driver reprograms a main-CRU PLL and polls for lock.
    write_u32(bus, RK3399_CRU_BASE + 0x28, 0x0000_1100);
    let mut spins = 0;
    while read_u32(bus, RK3399_CRU_BASE + 0x28) & (1 << 31) == 0 {
        spins += 1;
        assert!(spins < 1000, "PLL never reported lock");
    }
    assert_eq!(spins, 0);

    // Same for the PMU CRU's single PLL.
    write_u32(bus, RK3399_PMUCRU_BASE + 0x8, 0x0000_2200);
    assert_ne!(read_u32(bus, RK3399_PMUCRU_BASE + 0x8) & (1 << 31), 0);

    // The probed defaults are in place before any write.
    assert_eq!(read_u32(bus, RK3399_CRU_BASE + 0x90), 0x2dc);
}

#[test]
fn gic_probe_sequence() {
    let (machine, _factory, _loader) = build_machine(4);
    let bus = machine.mmio_bus();

    // Distributor identification.
    assert_eq!(read_u32(bus, RK3399_GICD_BASE + 0xffe8), 0x3 << 4);
    let typer = read_u32(bus, RK3399_GICD_BASE + 0x4);
    // 288 interrupt lines, security extensions, LPIs.
    assert_eq!(((typer & 0x1f) + 1) * 32, 288);
    assert_ne!(typer & (1 << 10), 0);
    assert_ne!(typer & (1 << 17), 0);

    // Redistributor walk: TYPER.Last set only on the final frame.
    for cpu in 0..4u64 {
        let typer = read_u32(bus, RK3399_GICR_BASE + cpu * 0x20000 + 0x8);
        assert_eq!(typer & (1 << 4) != 0, cpu == 3);
    }

    // Wake the first redistributor and check ChildrenAsleep clears.
    write_u32(bus, RK3399_GICR_BASE + 0x14, 0);
    assert_eq!(read_u32(bus, RK3399_GICR_BASE + 0x14) & (1 << 2), 0);

    // The ITS is discoverable.
    assert_eq!(read_u32(bus, RK3399_ITS_BASE + 0xffe8), 0x3 << 4);
    assert_ne!(read_u32(bus, RK3399_ITS_BASE + 0x8) & 1, 0);
}

#[test]
fn per_cpu_timer_interrupts_stay_private() {
    let (machine, factory, _loader) = build_machine(4);
    let bus = machine.mmio_bus();

    // Group 1 enable, then each CPU enables its own virtual timer PPI.
    write_u32(bus, RK3399_GICD_BASE, 0x2);
    for cpu in 0..4u64 {
        write_u32(
            bus,
            RK3399_GICR_BASE + cpu * 0x20000 + 0x10000 + 0x100,
            1 << 27,
        );
    }

    let cpus = factory.cpus.lock().unwrap();
    for (i, cpu) in cpus.iter().enumerate() {
        cpu.fire(IrqSourceKind::Timer(TimerKind::Virtual), true);
        for (j, other) in cpus.iter().enumerate() {
            assert_eq!(other.irq_level(), i == j, "cpu {} vs {}", i, j);
        }
        cpu.fire(IrqSourceKind::Timer(TimerKind::Virtual), false);
        assert!(!cpu.irq_level());
    }
}
