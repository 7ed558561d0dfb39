//! Hypervisor/VM/vCPU object model (spec §3, §4.1).
//!
//! Grounded on the teacher's `kvm/mod.rs`/`kvm/vm.rs`/`kvm/vcpu.rs`: the same `KvmError` taxonomy,
//! the same "open device, query capabilities, create VM, bring up TSS/IRQ chip/PIT" sequencing — but
//! generalized to the spec's `Hypervisor`/`Vm`/`Vcpu` three-layer split and its pinned-worker-thread
//! concurrency model (the teacher drives the whole vCPU loop on the calling thread).

pub mod vcpu;
pub mod vm;

pub use vcpu::{CancelToken, Vcpu};
pub use vm::{Vm, VmCallbacks, VmConfig};

use std::sync::Arc;

use kvm_ioctls::Kvm;
use thiserror::Error;

use crate::arch::Architecture;
use crate::error::Result;

/// Every way a raw host ioctl can fail, named by capability rather than by the underlying ABI
/// constant (spec §6).
#[derive(Error, Debug)]
pub enum KvmError {
    #[error("failed to open hypervisor device: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("unsupported hypervisor ABI version {0}")]
    UnsupportedApiVersion(i32),

    #[error("failed to create vm: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to create vcpu: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to run vcpu: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("failed to set tss address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("failed to create irq chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to create pit2: {0}")]
    CreatePit2(#[source] kvm_ioctls::Error),

    #[error("failed to get supported cpuid: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set cpuid: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to get msrs: {0}")]
    GetMsrs(#[source] kvm_ioctls::Error),

    #[error("failed to set msrs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),

    #[error("failed to get msr index list: {0}")]
    GetMsrIndexList(#[source] kvm_ioctls::Error),

    #[error("failed to enable capability: {0}")]
    EnableCap(#[source] kvm_ioctls::Error),

    #[error("failed to create device: {0}")]
    CreateDevice(#[source] kvm_ioctls::Error),

    #[error("failed to set device attribute: {0}")]
    SetDeviceAttr(#[source] kvm_ioctls::Error),

    #[error("failed to get preferred target: {0}")]
    GetPreferredTarget(#[source] kvm_ioctls::Error),

    #[error("failed to init vcpu: {0}")]
    VcpuInit(#[source] kvm_ioctls::Error),

    #[error("failed to get clock: {0}")]
    GetClock(#[source] kvm_ioctls::Error),

    #[error("failed to set clock: {0}")]
    SetClock(#[source] kvm_ioctls::Error),

    #[error("failed to get irq chip state: {0}")]
    GetIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to set irq chip state: {0}")]
    SetIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to get pit2 state: {0}")]
    GetPit2(#[source] kvm_ioctls::Error),

    #[error("failed to set pit2 state: {0}")]
    SetPit2(#[source] kvm_ioctls::Error),

    #[error("failed to signal msi: {0}")]
    SignalMsi(#[source] kvm_ioctls::Error),

    #[error("failed to set irq line: {0}")]
    IrqLine(#[source] kvm_ioctls::Error),

    #[error("failed to set gsi routing: {0}")]
    SetGsiRouting(#[source] kvm_ioctls::Error),

    #[error("guest memory access failed: {0}")]
    MemoryAccess(String),

    #[error("invalid register: {0}")]
    InvalidRegister(String),
}

/// Process-wide handle on the host virtualization device (spec's "Hypervisor" data type). Cheap to
/// keep around for the life of the process; owns the one `/dev/kvm`-equivalent file descriptor.
pub struct Hypervisor {
    kvm: Arc<Kvm>,
    arch: Architecture,
}

impl Hypervisor {
    /// Open the host virtualization device and validate its ABI version.
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;
        let version = kvm.get_api_version();
        if version != 12 {
            return Err(KvmError::UnsupportedApiVersion(version).into());
        }
        let arch = Architecture::host()
            .ok_or_else(|| crate::error::Error::HypervisorUnavailable(
                "host architecture has no bring-up support in this core".to_string(),
            ))?;
        Ok(Self { kvm: Arc::new(kvm), arch })
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    pub(crate) fn kvm(&self) -> &Kvm {
        &self.kvm
    }

    /// A cloned handle the `Vm` keeps past `Hypervisor::new_virtual_machine` returning, so the
    /// snapshot engine can still query host-supported MSRs after the fact (spec §3's "Caches ...
    /// the supported-MSR index list", realized per-`Vm` rather than as global mutable state).
    pub(crate) fn kvm_handle(&self) -> Arc<Kvm> {
        self.kvm.clone()
    }

    /// Create a fully configured, running VM per spec §4.1.
    pub fn new_virtual_machine(&self, config: VmConfig) -> Result<Vm> {
        vm::create(self, config)
    }
}
