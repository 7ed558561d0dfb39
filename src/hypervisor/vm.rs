//! The `Vm` object: memory, devices, vCPUs, and the operations exposed to callers and device
//! models (spec §3, §4.2).
//!
//! Grounded on the teacher's `kvm/vm.rs` (`VmFd::new()`'s bring-up sequence, `set_user_memory_region`
//! wrapper, `create_vcpu`) generalized to the spec's richer `VmConfig`/lifecycle-callback shape and
//! to the split memory layout/chipset cache this core's data model adds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;

use super::vcpu::{CancelToken, Vcpu};
use super::{Hypervisor, KvmError};
use crate::acpi::{self, AcpiConfig};
use crate::arch::{aarch64, x86_64, Architecture, RegisterValue};
use crate::chipset::{self, Chipset, Device, SharedDevice};
use crate::error::{Error, Result, RunExit};
use crate::irq::{self, DeliveryMode, IoApic, IoApicModel, MsiMessage, RoutingCallback};
use crate::memory::AddressSpace;

/// Lifecycle hooks invoked at specific points of `NewVirtualMachine` (spec §4.1 step 3/7/8).
pub trait VmCallbacks: Send + Sync {
    fn on_create_vm(&self, _vm: &VmFd) {}
    fn on_create_vm_with_memory(&self, _memory: &AddressSpace) {}
    fn on_create_vcpu(&self, _id: u32) {}
}

struct NoopCallbacks;
impl VmCallbacks for NoopCallbacks {}

/// Writes guest-entry code/data and, on AArch64, may request an exception-vector placement.
pub trait Loader: Send + Sync {
    fn load(&self, vm: &Vm) -> Result<()>;
}

pub struct VmConfig {
    pub memory_base: u64,
    pub memory_size: u64,
    pub cpu_count: u32,
    pub needs_interrupt_support: bool,
    pub loader: Option<Arc<dyn Loader>>,
    pub callbacks: Arc<dyn VmCallbacks>,
    pub acpi_oem_id: [u8; 6],
    pub isa_overrides: Vec<acpi::IsaOverride>,
    pub virtio_devices: Vec<acpi::VirtioDeviceConfig>,
    pub hpet: Option<acpi::HpetConfig>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_base: 0,
            memory_size: 256 * 1024 * 1024,
            cpu_count: 1,
            needs_interrupt_support: false,
            loader: None,
            callbacks: Arc::new(NoopCallbacks),
            acpi_oem_id: *b"VMCORE",
            isa_overrides: Vec::new(),
            virtio_devices: Vec::new(),
            hpet: None,
        }
    }
}

/// x86-64 interrupt-controller bundle (spec §3's "per-arch interrupt-controller bundle").
#[derive(Default)]
pub(crate) struct X86Irq {
    pub(crate) split_irqchip: bool,
    pub(crate) has_pit: bool,
}

/// AArch64 interrupt-controller bundle.
pub(crate) struct Arm64Irq {
    pub(crate) gic: aarch64::GicInfo,
    pub(crate) device: kvm_ioctls::DeviceFd,
}

pub(crate) enum InterruptBundle {
    X86(X86Irq),
    Arm64(Arm64Irq),
    None,
}

struct VmFdRoutingCallback {
    vm_fd: Arc<Mutex<VmFd>>,
}

impl RoutingCallback for VmFdRoutingCallback {
    fn inject(&self, msg: MsiMessage) -> std::result::Result<(), irq::IrqError> {
        use kvm_bindings::kvm_msi;
        let flags = if msg.dest_mode_logical { 1 << 1 } else { 0 };
        let msi = kvm_msi {
            address_lo: 0xFEE0_0000 | ((msg.dest as u32) << 12),
            address_hi: 0,
            data: msg.vector as u32 | delivery_mode_bits(msg.delivery),
            flags,
            ..Default::default()
        };
        let vm = self.vm_fd.lock().unwrap();
        vm.signal_msi(msi).map_err(KvmError::SignalMsi)?;
        Ok(())
    }
}

fn delivery_mode_bits(mode: DeliveryMode) -> u32 {
    let bits: u32 = match mode {
        DeliveryMode::Fixed => 0b000,
        DeliveryMode::Nmi => 0b100,
        DeliveryMode::Init => 0b101,
        DeliveryMode::ExtInt => 0b111,
    };
    bits << 8
}

/// A running, fully configured virtual machine (spec §3's "Virtual machine" data type).
pub struct Vm {
    fd: Arc<Mutex<VmFd>>,
    kvm: Arc<kvm_ioctls::Kvm>,
    arch: Architecture,
    memory: RwLock<AddressSpace>,
    vcpus: Mutex<HashMap<u32, Arc<Vcpu>>>,
    /// Persistent, ordered device list. Every compiled [`Chipset`] holds clones of the same
    /// [`SharedDevice`] handles, so rebuilding the cache after `AddDevice` never loses a
    /// previously registered device's live state.
    devices: Mutex<Vec<SharedDevice>>,
    chipset: Mutex<Option<Arc<Chipset>>>,
    interrupts: InterruptBundle,
    next_slot: Mutex<u32>,
}

impl Vm {
    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// `AllocateMemory(physAddr, size)`: host-mmap a second anonymous region and register it with
    /// the next free memory slot (spec §4.2).
    pub fn allocate_memory(&self, phys_addr: u64, size: u64) -> Result<()> {
        let region = {
            let mut memory = self.memory.write().unwrap();
            memory
                .add_ram_region(phys_addr, size)
                .map_err(|e| Error::InvalidArgument(e.to_string()))?
        };
        let kvm_region = kvm_userspace_memory_region {
            slot: region.slot,
            guest_phys_addr: region.guest_base,
            memory_size: region.size,
            userspace_addr: region.host_addr(),
            flags: 0,
        };
        unsafe {
            self.fd
                .lock()
                .unwrap()
                .set_user_memory_region(kvm_region)
                .map_err(KvmError::SetMemoryRegion)?;
        }
        *self.next_slot.lock().unwrap() += 1;
        Ok(())
    }

    /// `AllocateMMIO(request)`: first-fit allocation from the MMIO hole/window free list.
    pub fn allocate_mmio(&self, size: u64, align: u64) -> Result<u64> {
        let mut memory = self.memory.write().unwrap();
        memory
            .allocate_mmio(size, align)
            .map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    /// `RegisterFixedMMIO(name, base, size)`.
    pub fn register_fixed_mmio(&self, label: &'static str, base: u64, size: u64) -> Result<()> {
        let mut memory = self.memory.write().unwrap();
        memory
            .reserve(base, size, label)
            .map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    /// `ReadAt`/`WriteAt`: GPA-based, bounds-checked.
    pub fn read_at(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        self.memory
            .read()
            .unwrap()
            .read_at(gpa, buf)
            .map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    pub fn write_at(&self, gpa: u64, buf: &[u8]) -> Result<()> {
        self.memory
            .read()
            .unwrap()
            .write_at(gpa, buf)
            .map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    /// `AddDevice(device)`: calls `device.Init(vm)`, then appends to the device list and
    /// invalidates the cached chipset (spec §4.2).
    pub fn add_device(&self, device: Box<dyn Device>) -> Result<()> {
        let shared: SharedDevice = Arc::new(Mutex::new(device));
        shared.lock().unwrap().init(self)?;
        self.devices.lock().unwrap().push(shared);
        *self.chipset.lock().unwrap() = None;
        Ok(())
    }

    /// `ensureChipset`: lazily (re)compiles the dispatch tables from the current device list. The
    /// persistent list is only read, never drained, so devices registered before a cache rebuild
    /// keep their state across it.
    pub(crate) fn ensure_chipset(&self) -> Result<Arc<Chipset>> {
        {
            if let Some(existing) = self.chipset.lock().unwrap().as_ref() {
                return Ok(existing.clone());
            }
        }
        let mut builder = chipset::Builder::new();
        for device in self.devices.lock().unwrap().iter() {
            builder.add(device.clone());
        }
        let compiled = Arc::new(builder.build().map_err(Error::from)?);
        *self.chipset.lock().unwrap() = Some(compiled.clone());
        Ok(compiled)
    }

    /// `Run(ctx, runConfig)`: schedules the inner loop onto vCPU 0's pinned worker and awaits it.
    pub fn run(&self, cancel: &CancelToken) -> Result<RunExit> {
        let chipset = self.ensure_chipset()?;
        let vcpu0 = self
            .vcpus
            .lock()
            .unwrap()
            .get(&0)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument("vm has no vcpu 0".to_string()))?;
        let cancel = cancel.clone();
        vcpu0.call(move |worker| worker.run_loop(&chipset, &cancel))
    }

    /// `VirtualCPUCall(id, fn)`.
    pub fn virtual_cpu_call<F, R>(&self, id: u32, f: F) -> Result<R>
    where
        F: FnOnce(&mut super::vcpu::VcpuWorker) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let vcpu = self
            .vcpus
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no such vcpu {id}")))?;
        vcpu.call(f)
    }

    /// `PulseIRQ(line)`: x86 userspace-IOAPIC edge assertion, ARM64 SPI pulse.
    pub fn pulse_irq(&self, line: u32) -> Result<()> {
        self.set_irq(line, true)?;
        self.set_irq(line, false)
    }

    /// `SetIRQ(line, level)`.
    pub fn set_irq(&self, line: u32, level: bool) -> Result<()> {
        match &self.interrupts {
            InterruptBundle::X86(bundle) => {
                if bundle.split_irqchip {
                    // Level is carried to the IOAPIC device model via its own MMIO-mapped
                    // redirection table, not through this path; the legacy non-split chip uses the
                    // host "IRQ line" ioctl directly.
                    Err(Error::InvalidArgument(
                        "SetIRQ is a legacy path only valid with the full in-kernel chip".to_string(),
                    ))
                } else {
                    self.fd
                        .lock()
                        .unwrap()
                        .set_irq_line(line, level)
                        .map_err(KvmError::IrqLine)?;
                    Ok(())
                }
            }
            InterruptBundle::Arm64(_) => {
                let word = irq::encode_arm64_irq_line(line)
                    .map_err(|e| Error::InvalidArgument(e.to_string()))?;
                self.fd
                    .lock()
                    .unwrap()
                    .set_irq_line(word, level)
                    .map_err(KvmError::IrqLine)?;
                Ok(())
            }
            InterruptBundle::None => Err(Error::InvalidArgument(
                "interrupt support was not requested for this vm".to_string(),
            )),
        }
    }

    /// `InjectInterrupt(vector, dest, destMode, delivery)`: x86 MSI-style injection from the
    /// userspace IOAPIC's routing callback path.
    pub fn inject_interrupt(
        &self,
        vector: u8,
        dest: u8,
        dest_mode_logical: bool,
        delivery: DeliveryMode,
    ) -> Result<()> {
        let callback = VmFdRoutingCallback {
            vm_fd: self.fd.clone(),
        };
        callback
            .inject(MsiMessage {
                vector,
                dest,
                dest_mode_logical,
                delivery,
                level: true,
            })
            .map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    /// `Arm64GICInfo() → (info, ok)`.
    pub fn arm64_gic_info(&self) -> Option<aarch64::GicInfo> {
        match &self.interrupts {
            InterruptBundle::Arm64(bundle) => Some(bundle.gic),
            _ => None,
        }
    }

    /// AArch64 exception-vector placement (spec §4.6): a `Loader` that supplies a vector `table`
    /// calls this with the guest layout it just wrote; the core decides the placement
    /// (`align_up(base_addr + code_size + bss_size, table_align)`), writes the table there, and
    /// points `VBAR_EL1` at it.
    pub fn place_aarch64_exception_vectors(
        &self,
        id: u32,
        base_addr: u64,
        code_size: u64,
        bss_size: u64,
        table: &[u8],
    ) -> Result<u64> {
        if self.arch != Architecture::Aarch64 {
            return Err(Error::InvalidArgument(
                "exception-vector placement is aarch64-only".to_string(),
            ));
        }
        let addr = aarch64::exception_vector_placement(
            base_addr,
            code_size,
            bss_size,
            aarch64::EXCEPTION_VECTOR_TABLE_ALIGN,
        );
        self.write_at(addr, table)?;
        let mut regs = HashMap::new();
        regs.insert(aarch64::RegisterId::Vbar, RegisterValue::Scalar(addr));
        self.set_vcpu_registers_arm64(id, regs)?;
        Ok(addr)
    }

    pub(crate) fn vm_fd(&self) -> Arc<Mutex<VmFd>> {
        self.fd.clone()
    }

    pub(crate) fn kvm_handle(&self) -> Arc<kvm_ioctls::Kvm> {
        self.kvm.clone()
    }

    pub(crate) fn memory(&self) -> &RwLock<AddressSpace> {
        &self.memory
    }

    /// vCPU IDs in creation order, used by the snapshot engine to iterate every vCPU.
    pub(crate) fn vcpu_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.vcpus.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn cpu_count(&self) -> u32 {
        self.vcpus.lock().unwrap().len() as u32
    }

    pub(crate) fn interrupt_bundle(&self) -> &InterruptBundle {
        &self.interrupts
    }

    /// `CaptureSnapshot()` (spec §4.2, §4.8).
    pub fn capture_snapshot(&self) -> Result<crate::snapshot::Snapshot> {
        crate::snapshot::capture(self)
    }

    /// `RestoreSnapshot(snap)` (spec §4.2, §4.8).
    pub fn restore_snapshot(&self, snapshot: &crate::snapshot::Snapshot) -> Result<()> {
        crate::snapshot::restore(self, snapshot)
    }

    /// Set register values on a vCPU, regardless of architecture (used by loaders and by the
    /// snapshot engine's restore path).
    pub fn set_vcpu_registers_x86(
        &self,
        id: u32,
        values: HashMap<x86_64::RegisterId, RegisterValue>,
    ) -> Result<()> {
        self.virtual_cpu_call(id, move |worker| {
            x86_64::set_registers(&worker.fd, &values).map_err(Error::from)
        })
    }

    pub fn set_vcpu_registers_arm64(
        &self,
        id: u32,
        values: HashMap<aarch64::RegisterId, RegisterValue>,
    ) -> Result<()> {
        self.virtual_cpu_call(id, move |worker| {
            aarch64::set_registers(&worker.fd, &values).map_err(Error::from)
        })
    }

    pub(crate) fn get_vcpu_registers_x86(
        &self,
        id: u32,
        ids: &'static [x86_64::RegisterId],
    ) -> Result<HashMap<x86_64::RegisterId, RegisterValue>> {
        self.virtual_cpu_call(id, move |worker| {
            x86_64::get_registers(&worker.fd, ids).map_err(Error::from)
        })
    }

    pub(crate) fn get_vcpu_registers_arm64(
        &self,
        id: u32,
        ids: &'static [aarch64::RegisterId],
        gic: Option<aarch64::GicInfo>,
    ) -> Result<HashMap<aarch64::RegisterId, RegisterValue>> {
        self.virtual_cpu_call(id, move |worker| {
            aarch64::get_registers(&worker.fd, ids, gic.as_ref()).map_err(Error::from)
        })
    }

    pub(crate) fn capture_vcpu_msrs(&self, id: u32) -> Result<Vec<(u32, u64)>> {
        let kvm = self.kvm.clone();
        self.virtual_cpu_call(id, move |worker| {
            x86_64::capture_msrs(&kvm, &worker.fd).map_err(Error::from)
        })
    }

    pub(crate) fn restore_vcpu_msrs(&self, id: u32, values: Vec<(u32, u64)>) -> Result<()> {
        self.virtual_cpu_call(id, move |worker| {
            x86_64::restore_msrs(&worker.fd, &values).map_err(Error::from)
        })
    }
}

/// `NewVirtualMachine`: the 11-step bring-up sequence (spec §4.1).
pub(crate) fn create(hypervisor: &Hypervisor, config: VmConfig) -> Result<Vm> {
    let arch = hypervisor.architecture();

    // 1. Issue "create VM" ioctl. AArch64 first queries the host's maximum IPA size.
    let vm_fd = if arch == Architecture::Aarch64 {
        let ipa_bits = hypervisor
            .kvm()
            .get_host_ipa_limit()
            .max(0) as u64;
        hypervisor
            .kvm()
            .create_vm_with_type(ipa_bits)
            .map_err(KvmError::CreateVm)?
    } else {
        hypervisor.kvm().create_vm().map_err(KvmError::CreateVm)?
    };

    // 2. Architecture bring-up.
    let interrupts = match arch {
        Architecture::X86_64 => {
            let init = x86_64::init_vm(&vm_fd, config.needs_interrupt_support)?;
            InterruptBundle::X86(X86Irq {
                split_irqchip: init.split_irqchip,
                has_pit: init.has_pit,
            })
        }
        Architecture::Aarch64 => InterruptBundle::None, // vGIC needs >=1 vcpu; created at step 9
        Architecture::RiscV64 => InterruptBundle::None,
    };

    // 3. onCreateVM.
    config.callbacks.on_create_vm(&vm_fd);

    // 4. mmap guest RAM and 5. register memory slot(s), honoring the PCI-hole split.
    let mut memory = AddressSpace::new(arch, config.memory_base, config.memory_size)
        .map_err(|e| Error::InvalidArgument(e.to_string()))?;

    if arch == Architecture::Aarch64 {
        // No legacy PCI hole on this model; seed a generic high window the MMIO allocator can use
        // for virtio-mmio transports and the vGIC redistributor doesn't already claim.
        let window_base = (config.memory_base + config.memory_size).max(0x4000_0000);
        let _ = memory.add_mmio_window(window_base, 256 * 1024 * 1024);
    }

    for region in memory.regions() {
        let kvm_region = kvm_userspace_memory_region {
            slot: region.slot,
            guest_phys_addr: region.guest_base,
            memory_size: region.size,
            userspace_addr: region.host_addr(),
            flags: 0,
        };
        unsafe {
            vm_fd
                .set_user_memory_region(kvm_region)
                .map_err(KvmError::SetMemoryRegion)?;
        }
    }

    // 6. x86-64 + interrupts: synthesize ACPI tables.
    if arch == Architecture::X86_64 && config.needs_interrupt_support {
        let acpi_config = AcpiConfig {
            oem_id: config.acpi_oem_id,
            vcpu_count: config.cpu_count as u8,
            isa_overrides: config.isa_overrides.clone(),
            virtio_devices: config.virtio_devices.clone(),
            hpet: config.hpet,
        };
        // 64 KiB reserved just below the PCI hole (or at the top of RAM when contiguous), per
        // spec §4.7, so tables never collide with a loader's image at the base of RAM.
        const ACPI_TABLES_RESERVED: u64 = 64 * 1024;
        let tables_base = match memory.low_size() {
            Some(low_size) => config.memory_base + low_size - ACPI_TABLES_RESERVED,
            None => config.memory_base + config.memory_size - ACPI_TABLES_RESERVED,
        };
        acpi::install(&memory, config.memory_base, tables_base, &acpi_config)
            .map_err(Error::from)?;
    }

    // 7. onCreateVMWithMemory.
    config.callbacks.on_create_vm_with_memory(&memory);

    let fd = Arc::new(Mutex::new(vm_fd));

    // 8. Per-CPU bring-up.
    let mut vcpus = HashMap::new();
    for index in 0..config.cpu_count {
        let vcpu_fd = fd
            .lock()
            .unwrap()
            .create_vcpu(index as u64)
            .map_err(KvmError::CreateVcpu)?;

        match arch {
            Architecture::X86_64 => {
                let max_entries = 80;
                let cpuid = x86_64::build_cpuid(hypervisor.kvm(), max_entries)?;
                vcpu_fd.set_cpuid2(&cpuid).map_err(KvmError::SetCpuid)?;
                x86_64::set_boot_msrs(&vcpu_fd)?;
            }
            Architecture::Aarch64 => {
                aarch64::init_vcpu(&fd.lock().unwrap(), &vcpu_fd)?;
            }
            Architecture::RiscV64 => {}
        }

        let vcpu = Arc::new(Vcpu::spawn(index, vcpu_fd, arch));
        vcpus.insert(index, vcpu);
        config.callbacks.on_create_vcpu(index);
    }

    // 9. Per-arch post-vCPU init: finalize vGIC now that vCPUs exist.
    let interrupts = if arch == Architecture::Aarch64 {
        let (device, gic) = aarch64::create_vgic(&fd.lock().unwrap())?;
        aarch64::finalize_vgic(&device)?;
        InterruptBundle::Arm64(Arm64Irq { gic, device })
    } else {
        interrupts
    };

    let vm = Vm {
        fd,
        kvm: hypervisor.kvm_handle(),
        arch,
        memory: RwLock::new(memory),
        vcpus: Mutex::new(vcpus),
        devices: Mutex::new(Vec::new()),
        chipset: Mutex::new(None),
        interrupts,
        next_slot: Mutex::new(2),
    };

    if let InterruptBundle::X86(bundle) = &vm.interrupts {
        if bundle.split_irqchip {
            let callback = VmFdRoutingCallback { vm_fd: vm.fd.clone() };
            let ioapic = IoApic::new(Box::new(callback));
            vm.add_device(Box::new(IoApicModel(ioapic)))?;
        }
    }

    // 10. Loader.
    if let Some(loader) = &config.loader {
        loader.load(&vm)?;
    }

    // 11. A finalizer attaches in Drop below (spec's "detects and cleans up VMs dropped without
    // explicit Close" — realized here as an ordinary `Drop` impl rather than a separate registered
    // finalizer object, since Rust's ownership model makes that the idiomatic equivalent).
    Ok(vm)
}

impl Drop for Vm {
    fn drop(&mut self) {
        // vCPU work queues close synchronously via `Vcpu::drop`. The teacher's background-worker
        // munmap/close optimization for non-AArch64 hosts is not reproduced here: this core closes
        // everything synchronously on every target, trading the 10-20ms teardown stall the spec
        // calls out for a simpler, single code path. See `DESIGN.md`.
        self.vcpus.lock().unwrap().clear();
    }
}
