//! Architecture-specific bring-up and register models (spec §4.5, §4.6).
//!
//! The hypervisor/VM/vCPU object model in [`crate::hypervisor`] is architecture-neutral; everything
//! that differs between host CPU families lives here and in [`x86_64`]/[`aarch64`]. Both modules are
//! compiled for every target (so `cargo doc`/IDE tooling works cross-platform) but their bring-up
//! functions are only ever called when [`Architecture`] matches the host.

pub mod aarch64;
pub mod x86_64;

/// Target architecture a [`crate::hypervisor::Hypervisor`] drives. RISC-V-64 is named by the data
/// model (spec §3) as a future target but has no bring-up implementation in this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86_64,
    Aarch64,
    RiscV64,
}

impl Architecture {
    /// The architecture this binary was built for, if it is one the core can drive.
    pub fn host() -> Option<Architecture> {
        if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Architecture::Aarch64)
        } else {
            None
        }
    }
}

/// A register's value: either a plain 64-bit scalar or a 128-bit vector (used by AArch64 FP/SIMD
/// registers that this core's catalog exposes as a single slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    Scalar(u64),
    Vector(u128),
}

impl RegisterValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RegisterValue::Scalar(v) => Some(*v),
            RegisterValue::Vector(_) => None,
        }
    }
}
