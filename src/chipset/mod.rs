//! Chipset dispatch layer: routes port-I/O and MMIO vCPU exits to registered device models
//! (spec §3, §4.4).
//!
//! Grounded on the teacher's `devices/mmio.rs` (`MmioBus`: sorted-by-base device list, linear
//! range scan) generalized two ways: port I/O gets its own dense, O(1)-indexed table alongside the
//! MMIO range list, and capability discovery happens once at `Builder` registration time through
//! explicit trait accessor methods rather than the teacher's single fixed `MmioDevice` trait —
//! this core never reaches for `downcast-rs` or `std::any::Any` to find out what a device supports.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::error::Result;

#[derive(Error, Debug)]
pub enum ChipsetError {
    #[error("port range [{base:#x}, {end:#x}) overlaps device {other}")]
    PortOverlap { base: u16, end: u32, other: String },

    #[error("mmio range [{base:#x}, {end:#x}) overlaps device {other}")]
    MmioOverlap { base: u64, end: u128, other: String },

    #[error("no device claims port {0:#x}")]
    UnclaimedPort(u16),

    #[error("no device claims mmio address {0:#x}")]
    UnclaimedMmio(u64),

    #[error("snapshot has no entry for device {0:?}")]
    MissingDeviceSnapshot(String),
}

/// A contiguous port-I/O range a device wants dispatched to it.
#[derive(Debug, Clone, Copy)]
pub struct PortIoRange {
    pub base: u16,
    pub len: u16,
}

/// A contiguous MMIO range a device wants dispatched to it.
#[derive(Debug, Clone, Copy)]
pub struct MmioRange {
    pub base: u64,
    pub len: u64,
}

/// Base capability every registered device implements.
pub trait Device: Send {
    fn name(&self) -> &str;

    /// VM-dependent setup run once, right after `AddDevice` attaches this device (spec §3's
    /// created/attached → `Init(vm)` lifecycle, §4.2's `AddDevice`). Devices that need to claim
    /// MMIO/port ranges or register fixed regions do it here rather than at construction time,
    /// since they don't have a `Vm` to do it against until now.
    fn init(&mut self, vm: &crate::hypervisor::vm::Vm) -> Result<()>;

    /// The device's interrupt/GSI line, if it owns one fixed at attachment time (spec §3's
    /// `(id,base,size,irq)` config-hash tuple). Devices that don't own a single fixed line (e.g. an
    /// IOAPIC routing many) return `None`.
    fn irq_line(&self) -> Option<u32> {
        None
    }

    /// Ranges and handler for port I/O, if this device does port I/O at all.
    fn supports_port_io(&mut self) -> Option<(Vec<PortIoRange>, &mut dyn PortIoHandler)> {
        None
    }

    /// Ranges and handler for MMIO, if this device does MMIO at all.
    fn supports_mmio(&mut self) -> Option<(Vec<MmioRange>, &mut dyn MmioHandler)> {
        None
    }

    /// Poll hook, if this device needs to make progress outside of an exit (e.g. serial reading
    /// from stdin).
    fn supports_poll_device(&mut self) -> Option<&mut dyn PollHandler> {
        None
    }

    /// The IOAPIC device, if this is one; `Vm::add_device` records it for IRQ routing without a
    /// downcast.
    fn as_ioapic(&mut self) -> Option<&mut dyn crate::irq::IoApicDevice> {
        None
    }

    /// Snapshotter contract, if this device carries state across `CaptureSnapshot`/`RestoreSnapshot`.
    fn supports_snapshot(&mut self) -> Option<&mut dyn SnapshotHandler> {
        None
    }
}

/// Opaque device-state capture/restore, keyed by the device's self-reported identifier (spec §3,
/// §4.8 step 4/6).
pub trait SnapshotHandler: Send {
    fn device_id(&self) -> String;
    fn capture_snapshot(&mut self) -> Vec<u8>;
    fn restore_snapshot(&mut self, data: &[u8]) -> Result<()>;
}

pub trait PortIoHandler: Send {
    fn port_io(&mut self, port: u16, data: &mut [u8], is_write: bool);
}

pub trait MmioHandler: Send {
    fn mmio(&mut self, addr: u64, data: &mut [u8], is_write: bool);
}

pub trait PollHandler: Send {
    fn poll(&mut self);
}

/// Adapts a device that only knows the teacher's single-trait `MmioDevice` shape into the new
/// multi-capability [`Device`] so legacy models keep working without rewriting them.
pub struct LegacyMmioAdapter<T> {
    name: String,
    ranges: Vec<MmioRange>,
    inner: T,
}

impl<T: LegacyMmioDevice + Send> LegacyMmioAdapter<T> {
    pub fn new(name: impl Into<String>, base: u64, size: u64, inner: T) -> Self {
        Self {
            name: name.into(),
            ranges: vec![MmioRange { base, len: size }],
            inner,
        }
    }
}

/// The teacher's original `MmioDevice` trait shape, kept so legacy device models can be wrapped
/// rather than rewritten.
pub trait LegacyMmioDevice: Send {
    fn read(&mut self, offset: u64, data: &mut [u8]);
    fn write(&mut self, offset: u64, data: &[u8]);
}

impl<T: LegacyMmioDevice + Send> Device for LegacyMmioAdapter<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, _vm: &crate::hypervisor::vm::Vm) -> Result<()> {
        // Base/size were fixed at construction (`LegacyMmioAdapter::new`); nothing left to do here.
        Ok(())
    }

    fn supports_mmio(&mut self) -> Option<(Vec<MmioRange>, &mut dyn MmioHandler)> {
        Some((self.ranges.clone(), &mut self.inner))
    }
}

impl<T: LegacyMmioDevice + Send> MmioHandler for T {
    fn mmio(&mut self, addr: u64, data: &mut [u8], is_write: bool) {
        if is_write {
            self.write(addr, data);
        } else {
            let mut buf = vec![0u8; data.len()];
            self.read(addr, &mut buf);
            data.copy_from_slice(&buf);
        }
    }
}

/// A device shared between the VM's persistent ordered device list and every compiled [`Chipset`]
/// built from it, so rebuilding the cache after `AddDevice` never loses a previously registered
/// device's state.
pub type SharedDevice = Arc<Mutex<Box<dyn Device>>>;

struct PortEntry {
    device: SharedDevice,
    range: PortIoRange,
}

struct MmioEntry {
    device: SharedDevice,
    range: MmioRange,
}

/// Compiled dispatch tables built by [`Builder`]: a dense port array and a sorted MMIO range list,
/// plus the poll list (spec §3's "two dispatch tables" description).
pub struct Chipset {
    devices: Vec<SharedDevice>,
    port_table: Vec<Option<usize>>,
    port_entries: Vec<PortEntry>,
    mmio_entries: Vec<MmioEntry>,
    pollable: Vec<SharedDevice>,
    timeslice_markers: Mutex<Vec<u32>>,
}

impl Chipset {
    /// Dispatch a port-I/O exit. Unclaimed ports are not an error at this layer — per spec §4.3 an
    /// unclaimed port read returns all-ones and a write is dropped, matching common x86 firmware
    /// expectations for probed-but-absent legacy ports.
    pub fn handle_pio(&self, port: u16, data: &mut [u8], is_write: bool) {
        match self.port_table.get(port as usize).copied().flatten() {
            Some(entry_idx) => {
                let entry = &self.port_entries[entry_idx];
                let mut device = entry.device.lock().unwrap();
                if let Some((_, handler)) = device.supports_port_io() {
                    handler.port_io(port, data, is_write);
                }
            }
            None => {
                if !is_write {
                    data.fill(0xFF);
                }
            }
        }
    }

    /// Dispatch an MMIO exit. Returns `Err` (propagated by the caller as the guest's run error) if
    /// no device claims the address, per spec §4.4.
    pub fn handle_mmio_checked(&self, addr: u64, data: &mut [u8], is_write: bool) -> Result<()> {
        let len = data.len() as u64;
        let entry = self
            .mmio_entries
            .iter()
            .find(|e| addr >= e.range.base && addr + len <= e.range.base + e.range.len);
        match entry {
            Some(entry) => {
                let mut device = entry.device.lock().unwrap();
                if let Some((_, handler)) = device.supports_mmio() {
                    handler.mmio(addr, data, is_write);
                }
                Ok(())
            }
            None => Err(ChipsetError::UnclaimedMmio(addr).into()),
        }
    }

    /// Same as [`Chipset::handle_mmio_checked`] but swallows unclaimed-address errors, matching the
    /// vCPU run loop's tolerant dispatch path for probe reads/writes that aren't worth failing the
    /// whole run over.
    pub fn handle_mmio(&self, addr: u64, data: &mut [u8], is_write: bool) {
        if self.handle_mmio_checked(addr, data, is_write).is_err() && !is_write {
            data.fill(0xFF);
        }
    }

    pub fn poll(&self) {
        for device in &self.pollable {
            let mut device = device.lock().unwrap();
            if let Some(handler) = device.supports_poll_device() {
                handler.poll();
            }
        }
    }

    pub fn record_timeslice_marker(&self, id: u32) {
        self.timeslice_markers.lock().unwrap().push(id);
    }

    pub fn take_timeslice_markers(&self) -> Vec<u32> {
        std::mem::take(&mut *self.timeslice_markers.lock().unwrap())
    }

    /// Capture every snapshottable device's opaque blob, keyed by its self-reported ID (spec §4.8
    /// step 4).
    pub fn capture_device_snapshots(&self) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        for device in &self.devices {
            let mut device = device.lock().unwrap();
            if let Some(handler) = device.supports_snapshot() {
                out.push((handler.device_id(), handler.capture_snapshot()));
            }
        }
        out
    }

    /// Restore every snapshottable device's blob by matching `device_id()`; a missing entry for a
    /// snapshotter device is an error (spec §4.8 step 6).
    pub fn restore_device_snapshots(&self, snapshots: &[(String, Vec<u8>)]) -> Result<()> {
        for device in &self.devices {
            let mut device = device.lock().unwrap();
            if let Some(handler) = device.supports_snapshot() {
                let id = handler.device_id();
                let data = snapshots
                    .iter()
                    .find(|(snap_id, _)| *snap_id == id)
                    .map(|(_, data)| data.as_slice())
                    .ok_or_else(|| ChipsetError::MissingDeviceSnapshot(id.clone()))?;
                handler.restore_snapshot(data)?;
            }
        }
        Ok(())
    }

    /// `(id, base, size, irq)` per device, in attachment order, for the snapshot config hash (spec
    /// §3). `irq` is `u32::MAX` for devices that report no fixed line, so "no IRQ" never collides
    /// with a real GSI 0.
    pub fn device_config_tuples(&self) -> Vec<(String, u64, u64, u32)> {
        self.devices
            .iter()
            .map(|device| {
                let mut device = device.lock().unwrap();
                let name = device.name().to_string();
                let (base, size) = device
                    .supports_mmio()
                    .and_then(|(ranges, _)| ranges.first().copied())
                    .map(|r| (r.base, r.len))
                    .unwrap_or((0, 0));
                let irq = device.irq_line().unwrap_or(u32::MAX);
                (name, base, size, irq)
            })
            .collect()
    }

    pub fn notify_ioapic_eoi(&self, vector: u8) {
        for device in &self.devices {
            let mut device = device.lock().unwrap();
            if let Some(ioapic) = device.as_ioapic() {
                ioapic.end_of_interrupt(vector);
                return;
            }
        }
    }
}

/// Compiles a [`Chipset`] from an ordered device list, rejecting overlapping ranges (spec §4.4).
/// Devices are shared (`Arc<Mutex<_>>`) with the VM's persistent device list, so rebuilding the
/// cache after `AddDevice` recompiles the dispatch tables without losing any device's live state.
#[derive(Default)]
pub struct Builder {
    devices: Vec<SharedDevice>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, device: SharedDevice) {
        self.devices.push(device);
    }

    pub fn build(self) -> std::result::Result<Chipset, ChipsetError> {
        let mut port_table: Vec<Option<usize>> = vec![None; u16::MAX as usize + 1];
        let mut port_entries: Vec<PortEntry> = Vec::new();
        let mut mmio_entries: Vec<MmioEntry> = Vec::new();
        let mut pollable = Vec::new();

        for device in &self.devices {
            let mut locked = device.lock().unwrap();

            if let Some((ranges, _)) = locked.supports_port_io() {
                for range in ranges {
                    let end = range.base as u32 + range.len as u32;
                    let last = end.min(u16::MAX as u32 + 1) as u16;
                    for p in range.base..last {
                        if let Some(existing) = port_table[p as usize] {
                            return Err(ChipsetError::PortOverlap {
                                base: range.base,
                                end,
                                other: port_entries[existing].device.lock().unwrap().name().to_string(),
                            });
                        }
                    }
                    let entry_idx = port_entries.len();
                    port_entries.push(PortEntry {
                        device: device.clone(),
                        range,
                    });
                    for p in range.base..last {
                        port_table[p as usize] = Some(entry_idx);
                    }
                }
            }

            if let Some((ranges, _)) = locked.supports_mmio() {
                for range in ranges {
                    let end = range.base as u128 + range.len as u128;
                    if let Some(existing) = mmio_entries.iter().find(|e| {
                        let other_end = e.range.base as u128 + e.range.len as u128;
                        (range.base as u128) < other_end && end > e.range.base as u128
                    }) {
                        return Err(ChipsetError::MmioOverlap {
                            base: range.base,
                            end,
                            other: existing.device.lock().unwrap().name().to_string(),
                        });
                    }
                    mmio_entries.push(MmioEntry {
                        device: device.clone(),
                        range,
                    });
                }
            }

            if locked.supports_poll_device().is_some() {
                pollable.push(device.clone());
            }
        }

        mmio_entries.sort_by_key(|e| e.range.base);

        Ok(Chipset {
            devices: self.devices,
            port_table,
            port_entries,
            mmio_entries,
            pollable,
            timeslice_markers: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        reads: u32,
    }

    impl PortIoHandler for Counter {
        fn port_io(&mut self, _port: u16, data: &mut [u8], is_write: bool) {
            if !is_write {
                self.reads += 1;
                data[0] = 0x42;
            }
        }
    }

    struct CounterDevice(Counter);

    impl Device for CounterDevice {
        fn name(&self) -> &str {
            "counter"
        }

        fn init(&mut self, _vm: &crate::hypervisor::vm::Vm) -> Result<()> {
            Ok(())
        }

        fn supports_port_io(&mut self) -> Option<(Vec<PortIoRange>, &mut dyn PortIoHandler)> {
            Some((vec![PortIoRange { base: 0x80, len: 1 }], &mut self.0))
        }
    }

    fn shared(device: CounterDevice) -> SharedDevice {
        Arc::new(Mutex::new(Box::new(device) as Box<dyn Device>))
    }

    #[test]
    fn dispatches_claimed_port() {
        let mut builder = Builder::new();
        builder.add(shared(CounterDevice(Counter { reads: 0 })));
        let chipset = builder.build().unwrap();
        let mut data = [0u8; 1];
        chipset.handle_pio(0x80, &mut data, false);
        assert_eq!(data[0], 0x42);
    }

    #[test]
    fn unclaimed_port_read_returns_all_ones() {
        let chipset = Builder::new().build().unwrap();
        let mut data = [0u8; 1];
        chipset.handle_pio(0x99, &mut data, false);
        assert_eq!(data[0], 0xFF);
    }

    #[test]
    fn overlapping_ports_are_rejected() {
        let mut builder = Builder::new();
        builder.add(shared(CounterDevice(Counter { reads: 0 })));
        builder.add(shared(CounterDevice(Counter { reads: 0 })));
        assert!(builder.build().is_err());
    }

    #[test]
    fn unclaimed_mmio_is_an_error() {
        let chipset = Builder::new().build().unwrap();
        let mut data = [0u8; 4];
        assert!(chipset.handle_mmio_checked(0x1000, &mut data, false).is_err());
    }
}
