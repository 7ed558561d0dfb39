//! Top-level error taxonomy for the VMM core.
//!
//! Every subsystem (`debuglog`, `memory`, `acpi`, `chipset`, `hypervisor`, `snapshot`) defines its
//! own `thiserror` enum for the failures specific to it; this module wraps them into a single
//! `Error` type so callers one layer up (a CLI, an FFI shim, a test) have one thing to match on.
//!
//! Sentinels returned by a normal guest exit (`Halted`, `GuestRequestedReboot`, `Yield`) are *not*
//! part of this enum — they travel in `RunExit` so a caller cannot accidentally propagate a guest
//! halt through a `?` as if it were a bug.

use thiserror::Error;

use crate::acpi::AcpiError;
use crate::chipset::ChipsetError;
use crate::debuglog::DebugLogError;
use crate::hypervisor::KvmError;
use crate::snapshot::SnapshotError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the VMM core.
#[derive(Error, Debug)]
pub enum Error {
    /// The host virtualization device is absent or its ABI version doesn't match.
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    /// Operation attempted on a closed or never-created object.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Bad bounds, overlap, unknown register, wrong snapshot type, or config-hash mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller interacted with a VM that has already exited.
    #[error("vm is not running: {0}")]
    NotRunning(String),

    /// KVM reported `KVM_EXIT_INTERNAL_ERROR` on a vcpu run. kvm-ioctls surfaces this exit as a
    /// unit variant, so the in-kernel suberror code isn't available here.
    #[error("vcpu internal error: {0}")]
    VcpuInternal(String),

    /// Double close of a resource.
    #[error("already closed: {0}")]
    AlreadyClosed(String),

    /// Context deadline exceeded during `Run`/`VirtualCPUCall`.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Context was cancelled during `Run`/`VirtualCPUCall`.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Wraps a raw host ioctl failure (kvm-ioctls) with an operation name.
    #[error("kvm error: {0}")]
    Kvm(#[from] KvmError),

    #[error("acpi error: {0}")]
    Acpi(#[from] AcpiError),

    #[error("chipset error: {0}")]
    Chipset(#[from] ChipsetError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("debug log error: {0}")]
    DebugLog(#[from] DebugLogError),

    /// Any other I/O failure (mmap, file, etc).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-error outcomes of a vCPU run loop. These are sentinels, not bugs: callers switch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The guest executed HLT, or an in-kernel chip reported shutdown, or a system event of type
    /// "shutdown" was raised.
    Halted,
    /// A system event of type "reset" was raised.
    GuestRequestedReboot,
    /// The run loop was asked to yield back to the caller without the guest having halted
    /// (used by cancellation/timeout bookkeeping in `Run`).
    Yield,
}
