//! `vmm-core`: hypervisor abstraction layer and supporting subsystems for a user-space VMM.
//!
//! [`hypervisor`] is the entry point: open a [`hypervisor::Hypervisor`], create a
//! [`hypervisor::Vm`] from it, attach [`chipset::Device`]s, then call [`hypervisor::Vm::run`] on a
//! pinned vCPU worker thread. [`snapshot`] captures and restores a running VM's full state;
//! [`acpi`] synthesizes the guest-visible ACPI tables; [`irq`] routes interrupts between devices
//! and the in-kernel LAPIC; [`memory`] manages the guest physical address space; [`debuglog`] is
//! this crate's own lock-free binary trace log, independent of the `eprintln!` progress lines used
//! for coarse setup/teardown reporting.

pub mod acpi;
pub mod arch;
pub mod chipset;
pub mod debuglog;
pub mod error;
pub mod hypervisor;
pub mod irq;
pub mod memory;
pub mod snapshot;

pub use arch::{Architecture, RegisterValue};
pub use error::{Error, Result, RunExit};
pub use hypervisor::{CancelToken, Hypervisor, KvmError, Vcpu, Vm, VmCallbacks, VmConfig};
pub use snapshot::Snapshot;
