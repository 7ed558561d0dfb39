//! x86-64 bring-up and register model (spec §4.5).
//!
//! VM/vCPU init is grounded on the teacher's `kvm/vm.rs` (TSS address, IRQ chip, PIT, paravirt CPUID
//! leaves) and `kvm/vcpu.rs` (boot MSR list); the split-irqchip path and the parameterized long-mode
//! page table builder generalize the teacher's always-in-kernel-chip, fixed-1GiB-identity-map
//! approach (`boot/paging.rs`) to what this core's data model requires.

use std::collections::HashMap;

use kvm_bindings::{
    kvm_cpuid_entry2, kvm_enable_cap, kvm_fpu, kvm_msr_entry, kvm_pit_config, kvm_regs, kvm_segment,
    kvm_sregs, CpuId, Msrs, KVM_CAP_SPLIT_IRQCHIP, KVM_PIT_SPEAKER_DUMMY,
};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};

use crate::arch::RegisterValue;
use crate::hypervisor::KvmError;
use crate::memory::AddressSpace;

/// Address KVM requires for the (unused-by-us) TSS page under unrestricted-guest VMX.
pub const TSS_ADDRESS: u64 = 0xFFFB_D000;
/// Pin count of the userspace IOAPIC when running with the split IRQ chip.
pub const SPLIT_IOAPIC_PINS: u32 = 24;

/// Code/data selectors `SetProtectedMode` uses for its flat segments.
pub const PROTECTED_MODE_CODE_SELECTOR: u16 = 0x08;
pub const PROTECTED_MODE_DATA_SELECTOR: u16 = 0x10;

const X86_CR0_PE: u64 = 1 << 0;
const X86_CR0_MP: u64 = 1 << 1;
const X86_CR0_ET: u64 = 1 << 4;
const X86_CR0_NE: u64 = 1 << 5;
const X86_CR0_WP: u64 = 1 << 16;
const X86_CR0_AM: u64 = 1 << 18;
const X86_CR0_PG: u64 = 1 << 31;
const X86_CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

const PAGE_PRESENT_RW: u64 = 0x03;
const PAGE_PRESENT_RW_US_PS: u64 = 0x87;

/// Whether interrupt support was enabled, returned so the caller can populate the VM's
/// interrupt-controller bundle (has-irqchip / split-irqchip / has-PIT flags).
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptInit {
    pub split_irqchip: bool,
    pub has_pit: bool,
}

/// VM-level x86-64 bring-up: TSS address, and — when interrupt support is requested — the split
/// IRQ chip capability plus PIT. The in-kernel LAPIC is implied by split-irqchip; the userspace
/// IOAPIC device itself is attached by the caller like any other [`crate::chipset::Device`].
pub fn init_vm(vm: &VmFd, needs_interrupt_support: bool) -> Result<InterruptInit, KvmError> {
    vm.set_tss_address(TSS_ADDRESS as usize)
        .map_err(KvmError::SetTssAddress)?;

    if !needs_interrupt_support {
        return Ok(InterruptInit::default());
    }

    let cap = kvm_enable_cap {
        cap: KVM_CAP_SPLIT_IRQCHIP,
        args: [SPLIT_IOAPIC_PINS as u64, 0, 0, 0],
        ..Default::default()
    };
    vm.enable_cap(&cap).map_err(KvmError::CreateIrqChip)?;

    let pit_config = kvm_pit_config {
        flags: KVM_PIT_SPEAKER_DUMMY,
        ..Default::default()
    };
    vm.create_pit2(pit_config).map_err(KvmError::CreatePit2)?;

    Ok(InterruptInit {
        split_irqchip: true,
        has_pit: true,
    })
}

/// Query the host-supported CPUID table, normalize the APIC-ID-bearing leaves for a single-vCPU
/// topology, and inject the KVM paravirt leaves. Call once per vCPU before its first run.
pub fn build_cpuid(kvm: &kvm_ioctls::Kvm, max_entries: usize) -> Result<CpuId, KvmError> {
    let supported = kvm
        .get_supported_cpuid(max_entries)
        .map_err(KvmError::GetSupportedCpuid)?;
    let mut entries: Vec<kvm_cpuid_entry2> = supported.as_slice().to_vec();

    for entry in &mut entries {
        if entry.function == 1 {
            // Initial APIC ID lives in EBX[31:24]; single logical CPU, so ID 0.
            entry.ebx &= 0x00ff_ffff;
        }
        if entry.function == 0xB {
            entry.eax = 0;
            entry.ebx = 1;
            entry.edx = 0; // x2APIC ID 0
        }
    }

    entries.retain(|e| e.function < 0x4000_0000 || e.function > 0x4000_00ff);

    entries.push(kvm_cpuid_entry2 {
        function: 0x4000_0000,
        eax: 0x4000_0001,
        ebx: 0x4b4d_564b, // "KVMK"
        ecx: 0x564b_4d56, // "VMKV"
        edx: 0x0000_004d, // "M\0\0\0"
        ..Default::default()
    });

    const KVM_FEATURE_CLOCKSOURCE: u32 = 1 << 0;
    const KVM_FEATURE_CLOCKSOURCE2: u32 = 1 << 3;
    entries.push(kvm_cpuid_entry2 {
        function: 0x4000_0001,
        eax: KVM_FEATURE_CLOCKSOURCE | KVM_FEATURE_CLOCKSOURCE2,
        ..Default::default()
    });

    CpuId::from_entries(&entries).map_err(|_| KvmError::SetCpuid(kvm_ioctls::Error::new(libc::EINVAL)))
}

/// Model-specific register indices needed for Linux boot (spec §4.8's snapshot MSR whitelist draws
/// from this same set).
pub mod msr {
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    pub const IA32_SYSENTER_EIP: u32 = 0x176;
    pub const IA32_PAT: u32 = 0x277;
    pub const STAR: u32 = 0xc000_0081;
    pub const LSTAR: u32 = 0xc000_0082;
    pub const CSTAR: u32 = 0xc000_0083;
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    pub const FS_BASE: u32 = 0xc000_0100;
    pub const GS_BASE: u32 = 0xc000_0101;
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
    pub const IA32_TSC: u32 = 0x10;
    pub const TSC_AUX: u32 = 0xc000_0103;

    /// MSRs captured/restored by the snapshot engine, intersected with the host-supported list.
    pub const SNAPSHOT_WHITELIST: &[u32] = &[
        IA32_TSC,
        IA32_SYSENTER_CS,
        IA32_SYSENTER_ESP,
        IA32_SYSENTER_EIP,
        IA32_PAT,
        STAR,
        LSTAR,
        CSTAR,
        SYSCALL_MASK,
        FS_BASE,
        GS_BASE,
        KERNEL_GS_BASE,
        TSC_AUX,
    ];
}

/// Read the snapshot MSR whitelist, intersected with the host-supported MSR list (spec §4.8 step 1).
pub fn capture_msrs(kvm: &Kvm, vcpu: &VcpuFd) -> Result<Vec<(u32, u64)>, KvmError> {
    let supported = kvm.get_msr_index_list().map_err(KvmError::GetMsrIndexList)?;
    let indices: Vec<u32> = msr::SNAPSHOT_WHITELIST
        .iter()
        .copied()
        .filter(|i| supported.as_slice().contains(i))
        .collect();
    let entries: Vec<kvm_msr_entry> = indices
        .iter()
        .map(|&index| kvm_msr_entry {
            index,
            ..Default::default()
        })
        .collect();
    let mut msrs = Msrs::from_entries(&entries).map_err(|_| KvmError::GetMsrs(kvm_ioctls::Error::new(libc::EINVAL)))?;
    vcpu.get_msrs(&mut msrs).map_err(KvmError::GetMsrs)?;
    Ok(msrs.as_slice().iter().map(|e| (e.index, e.data)).collect())
}

/// Push previously captured MSR values back onto a vCPU.
pub fn restore_msrs(vcpu: &VcpuFd, values: &[(u32, u64)]) -> Result<(), KvmError> {
    let entries: Vec<kvm_msr_entry> = values
        .iter()
        .map(|&(index, data)| kvm_msr_entry {
            index,
            data,
            ..Default::default()
        })
        .collect();
    let msrs = Msrs::from_entries(&entries).map_err(|_| KvmError::SetMsrs(kvm_ioctls::Error::new(libc::EINVAL)))?;
    vcpu.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;
    Ok(())
}

/// MSRs a freshly created vCPU needs before its first entry.
pub fn set_boot_msrs(vcpu: &VcpuFd) -> Result<(), KvmError> {
    let entry = |index: u32, data: u64| kvm_msr_entry {
        index,
        data,
        ..Default::default()
    };
    let entries = vec![
        entry(msr::IA32_SYSENTER_CS, 0),
        entry(msr::IA32_SYSENTER_ESP, 0),
        entry(msr::IA32_SYSENTER_EIP, 0),
        entry(msr::STAR, 0),
        entry(msr::LSTAR, 0),
        entry(msr::CSTAR, 0),
        entry(msr::SYSCALL_MASK, 0),
        entry(msr::KERNEL_GS_BASE, 0),
        entry(msr::IA32_TSC, 0),
    ];
    let msrs = Msrs::from_entries(&entries).map_err(|_| KvmError::SetMsrs(kvm_ioctls::Error::new(libc::EINVAL)))?;
    vcpu.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;
    Ok(())
}

/// Register identifiers exposed by `GetRegisters`/`SetRegisters`. `Cr3` is the only *special*
/// register this core's data model names; everything else is a *regular* GPR/flags/IP register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterId {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Cr3,
}

impl RegisterId {
    fn is_special(self) -> bool {
        matches!(self, RegisterId::Cr3)
    }
}

/// Stable string tag for a register, used by the snapshot engine's self-describing encoding so a
/// snapshot file doesn't depend on this enum's discriminant values.
pub fn register_tag(id: RegisterId) -> &'static str {
    match id {
        RegisterId::Rax => "rax",
        RegisterId::Rbx => "rbx",
        RegisterId::Rcx => "rcx",
        RegisterId::Rdx => "rdx",
        RegisterId::Rsi => "rsi",
        RegisterId::Rdi => "rdi",
        RegisterId::Rsp => "rsp",
        RegisterId::Rbp => "rbp",
        RegisterId::R8 => "r8",
        RegisterId::R9 => "r9",
        RegisterId::R10 => "r10",
        RegisterId::R11 => "r11",
        RegisterId::R12 => "r12",
        RegisterId::R13 => "r13",
        RegisterId::R14 => "r14",
        RegisterId::R15 => "r15",
        RegisterId::Rip => "rip",
        RegisterId::Rflags => "rflags",
        RegisterId::Cr3 => "cr3",
    }
}

/// Inverse of [`register_tag`]; unknown tags return `None` rather than erroring the whole restore,
/// so a snapshot taken by a newer build with extra registers still restores on an older one.
pub fn register_from_tag(tag: &str) -> Option<RegisterId> {
    Some(match tag {
        "rax" => RegisterId::Rax,
        "rbx" => RegisterId::Rbx,
        "rcx" => RegisterId::Rcx,
        "rdx" => RegisterId::Rdx,
        "rsi" => RegisterId::Rsi,
        "rdi" => RegisterId::Rdi,
        "rsp" => RegisterId::Rsp,
        "rbp" => RegisterId::Rbp,
        "r8" => RegisterId::R8,
        "r9" => RegisterId::R9,
        "r10" => RegisterId::R10,
        "r11" => RegisterId::R11,
        "r12" => RegisterId::R12,
        "r13" => RegisterId::R13,
        "r14" => RegisterId::R14,
        "r15" => RegisterId::R15,
        "rip" => RegisterId::Rip,
        "rflags" => RegisterId::Rflags,
        "cr3" => RegisterId::Cr3,
        _ => return None,
    })
}

/// Every register the snapshot engine captures/restores for this architecture.
pub const ALL: &[RegisterId] = &[
    RegisterId::Rax,
    RegisterId::Rbx,
    RegisterId::Rcx,
    RegisterId::Rdx,
    RegisterId::Rsi,
    RegisterId::Rdi,
    RegisterId::Rsp,
    RegisterId::Rbp,
    RegisterId::R8,
    RegisterId::R9,
    RegisterId::R10,
    RegisterId::R11,
    RegisterId::R12,
    RegisterId::R13,
    RegisterId::R14,
    RegisterId::R15,
    RegisterId::Rip,
    RegisterId::Rflags,
    RegisterId::Cr3,
];

/// Fetch the requested registers, reading the regular-register and special-register partitions
/// only when at least one requested ID falls in that partition.
pub fn get_registers(
    vcpu: &VcpuFd,
    ids: &[RegisterId],
) -> Result<HashMap<RegisterId, RegisterValue>, KvmError> {
    let regs = if ids.iter().any(|id| !id.is_special()) {
        Some(vcpu.get_regs().map_err(KvmError::GetRegisters)?)
    } else {
        None
    };
    let sregs = if ids.iter().any(|id| id.is_special()) {
        Some(vcpu.get_sregs().map_err(KvmError::GetRegisters)?)
    } else {
        None
    };

    let mut out = HashMap::with_capacity(ids.len());
    for &id in ids {
        let value = if id.is_special() {
            let s = sregs.as_ref().expect("special partition fetched");
            match id {
                RegisterId::Cr3 => s.cr3,
                _ => unreachable!(),
            }
        } else {
            let r = regs.as_ref().expect("regular partition fetched");
            regular_field(r, id)
        };
        out.insert(id, RegisterValue::Scalar(value));
    }
    Ok(out)
}

/// Merge the requested updates into the current register state and push each touched partition
/// back in a single ioctl.
pub fn set_registers(
    vcpu: &VcpuFd,
    values: &HashMap<RegisterId, RegisterValue>,
) -> Result<(), KvmError> {
    let need_regular = values.keys().any(|id| !id.is_special());
    let need_special = values.keys().any(|id| id.is_special());

    if need_regular {
        let mut regs = vcpu.get_regs().map_err(KvmError::GetRegisters)?;
        for (&id, value) in values.iter().filter(|(id, _)| !id.is_special()) {
            let v = value.as_u64().unwrap_or(0);
            set_regular_field(&mut regs, id, v);
        }
        vcpu.set_regs(&regs).map_err(KvmError::SetRegisters)?;
    }
    if need_special {
        let mut sregs = vcpu.get_sregs().map_err(KvmError::GetRegisters)?;
        for (&id, value) in values.iter().filter(|(id, _)| id.is_special()) {
            let v = value.as_u64().unwrap_or(0);
            match id {
                RegisterId::Cr3 => sregs.cr3 = v,
                _ => unreachable!(),
            }
        }
        vcpu.set_sregs(&sregs).map_err(KvmError::SetRegisters)?;
    }
    Ok(())
}

fn regular_field(r: &kvm_regs, id: RegisterId) -> u64 {
    match id {
        RegisterId::Rax => r.rax,
        RegisterId::Rbx => r.rbx,
        RegisterId::Rcx => r.rcx,
        RegisterId::Rdx => r.rdx,
        RegisterId::Rsi => r.rsi,
        RegisterId::Rdi => r.rdi,
        RegisterId::Rsp => r.rsp,
        RegisterId::Rbp => r.rbp,
        RegisterId::R8 => r.r8,
        RegisterId::R9 => r.r9,
        RegisterId::R10 => r.r10,
        RegisterId::R11 => r.r11,
        RegisterId::R12 => r.r12,
        RegisterId::R13 => r.r13,
        RegisterId::R14 => r.r14,
        RegisterId::R15 => r.r15,
        RegisterId::Rip => r.rip,
        RegisterId::Rflags => r.rflags,
        RegisterId::Cr3 => unreachable!("Cr3 is in the special partition"),
    }
}

fn set_regular_field(r: &mut kvm_regs, id: RegisterId, v: u64) {
    match id {
        RegisterId::Rax => r.rax = v,
        RegisterId::Rbx => r.rbx = v,
        RegisterId::Rcx => r.rcx = v,
        RegisterId::Rdx => r.rdx = v,
        RegisterId::Rsi => r.rsi = v,
        RegisterId::Rdi => r.rdi = v,
        RegisterId::Rsp => r.rsp = v,
        RegisterId::Rbp => r.rbp = v,
        RegisterId::R8 => r.r8 = v,
        RegisterId::R9 => r.r9 = v,
        RegisterId::R10 => r.r10 = v,
        RegisterId::R11 => r.r11 = v,
        RegisterId::R12 => r.r12 = v,
        RegisterId::R13 => r.r13 = v,
        RegisterId::R14 => r.r14 = v,
        RegisterId::R15 => r.r15 = v,
        RegisterId::Rip => r.rip = v,
        RegisterId::Rflags => r.rflags = v,
        RegisterId::Cr3 => unreachable!("Cr3 is in the special partition"),
    }
}

fn flat_segment(selector: u16, long_mode_code: bool) -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector,
        type_: if long_mode_code { 0xb } else { 0x3 },
        present: 1,
        dpl: 0,
        db: if long_mode_code { 0 } else { 1 },
        s: 1,
        l: if long_mode_code { 1 } else { 0 },
        g: 1,
        ..Default::default()
    }
}

/// Configure flat 4 GiB code/data segments and set CR0.PE, leaving the vCPU in 32-bit protected
/// mode. Used by loaders that boot a 32-bit entry point directly.
pub fn set_protected_mode(vcpu: &VcpuFd) -> Result<(), KvmError> {
    let mut sregs = vcpu.get_sregs().map_err(KvmError::GetRegisters)?;
    let code = flat_segment(PROTECTED_MODE_CODE_SELECTOR, false);
    let data = flat_segment(PROTECTED_MODE_DATA_SELECTOR, false);
    sregs.cs = code;
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;
    sregs.cr0 |= X86_CR0_PE;
    vcpu.set_sregs(&sregs).map_err(KvmError::SetRegisters)?;

    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu).map_err(KvmError::SetRegisters)?;
    Ok(())
}

/// Lay out identity-mapping page tables for `size_gib` gigabytes of guest RAM at `paging_base`.
/// `paging_base` and `size_gib` are caller-supplied (the teacher hardcodes both to a fixed 1 GiB
/// identity map; here the loader picks them so larger guests or a relocated table location both
/// work). Split out from sreg setup so a loader outside this crate can run it through `Vm::write_at`
/// without needing direct `AddressSpace` access.
pub fn build_long_mode_page_tables(
    memory: &AddressSpace,
    paging_base: u64,
    size_gib: u32,
) -> Result<(), KvmError> {
    let pml4_addr = paging_base;
    let pdpt_addr = paging_base + 0x1000;

    memory
        .write_at(pml4_addr, &(pdpt_addr | PAGE_PRESENT_RW).to_le_bytes())
        .map_err(|e| KvmError::MemoryAccess(e.to_string()))?;

    let mut pdpt_entries = Vec::with_capacity(size_gib as usize);
    for n in 0..size_gib as u64 {
        let pd_addr = paging_base + 0x2000 + n * 0x1000;
        pdpt_entries.extend_from_slice(&(pd_addr | PAGE_PRESENT_RW).to_le_bytes());
    }
    memory
        .write_at(pdpt_addr, &pdpt_entries)
        .map_err(|e| KvmError::MemoryAccess(e.to_string()))?;

    for n in 0..size_gib as u64 {
        let pd_addr = paging_base + 0x2000 + n * 0x1000;
        let mut pd = Vec::with_capacity(512 * 8);
        for i in 0..512u64 {
            let phys = n * (1 << 30) + (i << 21);
            pd.extend_from_slice(&(phys | PAGE_PRESENT_RW_US_PS).to_le_bytes());
        }
        memory
            .write_at(pd_addr, &pd)
            .map_err(|e| KvmError::MemoryAccess(e.to_string()))?;
    }

    Ok(())
}

/// Put the vCPU in 64-bit long mode with `cr3` pointing at identity-mapping page tables already
/// written by [`build_long_mode_page_tables`].
pub fn set_long_mode_sregs(
    vcpu: &VcpuFd,
    cr3: u64,
    code_selector: u16,
    data_selector: u16,
) -> Result<(), KvmError> {
    let mut sregs = vcpu.get_sregs().map_err(KvmError::GetRegisters)?;
    let code = flat_segment(code_selector, true);
    let mut data = flat_segment(data_selector, false);
    data.db = 1;
    sregs.cs = code;
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;
    sregs.cr3 = cr3;
    sregs.cr4 |= X86_CR4_PAE;
    sregs.cr0 |= X86_CR0_PE | X86_CR0_MP | X86_CR0_ET | X86_CR0_NE | X86_CR0_WP | X86_CR0_AM | X86_CR0_PG;
    sregs.efer |= EFER_LME | EFER_LMA;
    vcpu.set_sregs(&sregs).map_err(KvmError::SetRegisters)?;
    Ok(())
}

/// Lay out identity-mapping page tables and put the vCPU in long mode in one call; a thin wrapper
/// over [`build_long_mode_page_tables`] + [`set_long_mode_sregs`] for callers inside this crate that
/// already hold both the `VcpuFd` and the `AddressSpace` on the same thread.
pub fn set_long_mode_with_selectors(
    vcpu: &VcpuFd,
    memory: &AddressSpace,
    paging_base: u64,
    size_gib: u32,
    code_selector: u16,
    data_selector: u16,
) -> Result<(), KvmError> {
    build_long_mode_page_tables(memory, paging_base, size_gib)?;
    set_long_mode_sregs(vcpu, paging_base, code_selector, data_selector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_partition_is_singleton_special() {
        assert!(RegisterId::Cr3.is_special());
        assert!(!RegisterId::Rax.is_special());
        assert!(!RegisterId::Rip.is_special());
    }

    #[test]
    fn flat_segment_long_mode_code_has_l_bit() {
        let seg = flat_segment(0x08, true);
        assert_eq!(seg.l, 1);
        assert_eq!(seg.db, 0);
    }
}
