//! Demo binary exercising the `vmm_core` library: boots a flat binary image with no kernel loader
//! of its own, runs it to halt, and (optionally) round-trips a snapshot through it.
//!
//! This is not a general-purpose VMM frontend; it is a thin harness that builds the typed config
//! structs the library consumes and reports what happened, in the style of the reference VMM's
//! `[VMM]`-tagged progress lines.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use vmm_core::arch::{aarch64, x86_64};
use vmm_core::hypervisor::vm::{Loader, VmConfig};
use vmm_core::{Architecture, CancelToken, Error, Hypervisor, RegisterValue, Result, RunExit, Vm};

#[derive(Parser, Debug)]
#[command(name = "vmm-core-demo")]
#[command(about = "Demo harness for the vmm_core hypervisor abstraction layer")]
struct Args {
    /// Path to a flat binary image, loaded at the base of guest RAM
    #[arg(short, long)]
    image: String,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "256")]
    memory: u64,

    /// Number of vCPUs
    #[arg(short, long, default_value = "1")]
    cpus: u32,

    /// Bring up the in-kernel interrupt controller and PIT (x86-64) or vGIC (AArch64)
    #[arg(long)]
    interrupts: bool,

    /// Capture a snapshot immediately after the guest halts and restore it into a second VM
    #[arg(long)]
    snapshot_round_trip: bool,
}

/// Writes `image` at the base of guest RAM and points vCPU 0 at it with the minimum bring-up each
/// architecture needs to execute flat machine code: flat 32-bit protected mode on x86-64 (so a demo
/// image doesn't need to carry its own page tables), MMU-off EL1 on AArch64.
struct FlatImageLoader {
    image: Vec<u8>,
    memory_base: u64,
    memory_size: u64,
}

impl Loader for FlatImageLoader {
    fn load(&self, vm: &Vm) -> Result<()> {
        vm.write_at(self.memory_base, &self.image)?;

        match vm.architecture() {
            Architecture::X86_64 => {
                vm.virtual_cpu_call(0, |worker| {
                    x86_64::set_protected_mode(&worker.fd).map_err(Error::from)
                })?;

                let stack_top = self.memory_base + self.memory_size - 0x1000;
                let mut regs = HashMap::new();
                regs.insert(x86_64::RegisterId::Rip, RegisterValue::Scalar(self.memory_base));
                regs.insert(x86_64::RegisterId::Rsp, RegisterValue::Scalar(stack_top));
                regs.insert(x86_64::RegisterId::Rflags, RegisterValue::Scalar(0x2));
                vm.set_vcpu_registers_x86(0, regs)
            }
            Architecture::Aarch64 => {
                let mut regs = HashMap::new();
                regs.insert(aarch64::RegisterId::Pc, RegisterValue::Scalar(self.memory_base));
                vm.set_vcpu_registers_arm64(0, regs)
            }
            Architecture::RiscV64 => Err(Error::InvalidArgument(
                "no bring-up support for this host architecture".to_string(),
            )),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<()> {
    eprintln!("[VMM] vmm-core-demo starting...");
    eprintln!("[VMM] Image: {}", args.image);
    eprintln!("[VMM] Memory: {} MB", args.memory);
    eprintln!("[VMM] CPUs: {}", args.cpus);

    let image = std::fs::read(&args.image)?;
    let memory_base = 0u64;
    let memory_size = args.memory * 1024 * 1024;

    let hypervisor = Hypervisor::open()?;
    eprintln!("[VMM] Opened hypervisor for {:?}", hypervisor.architecture());

    let loader: Arc<dyn Loader> = Arc::new(FlatImageLoader {
        image,
        memory_base,
        memory_size,
    });
    let config = VmConfig {
        memory_base,
        memory_size,
        cpu_count: args.cpus,
        needs_interrupt_support: args.interrupts,
        loader: Some(loader),
        ..Default::default()
    };

    let vm = hypervisor.new_virtual_machine(config)?;
    eprintln!("[VMM] VM created, entering guest...");

    let cancel = CancelToken::new();
    let exit = vm.run(&cancel)?;
    report_exit(exit);

    if args.snapshot_round_trip {
        eprintln!("[VMM] Capturing snapshot...");
        let snapshot = vm.capture_snapshot()?;
        let bytes = snapshot.to_bytes()?;
        eprintln!("[VMM] Snapshot serialized to {} bytes", bytes.len());
        let replayed = vmm_core::Snapshot::from_bytes(&bytes)?;
        vm.restore_snapshot(&replayed)?;
        eprintln!("[VMM] Snapshot restored onto the same VM");
    }

    Ok(())
}

fn report_exit(exit: RunExit) {
    match exit {
        RunExit::Halted => eprintln!("[VMM] Guest halted"),
        RunExit::GuestRequestedReboot => eprintln!("[VMM] Guest requested reboot"),
        RunExit::Yield => eprintln!("[VMM] Run loop yielded without a guest halt"),
    }
}
