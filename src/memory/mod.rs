//! Guest physical address space management (spec §4.9).
//!
//! Wraps `vm_memory::GuestMemoryMmap` the way the teacher's `boot/memory.rs` does, generalized from
//! a single region starting at GPA 0 to the split-memory layout a full x86-64 VM needs: when the
//! requested size pushes past the legacy `[3 GiB, 4 GiB)` PCI hole, RAM is carved into a low region
//! below the hole and a high region above it, each backed by its own anonymous mmap through
//! `GuestMemoryMmap::from_ranges` (vm-memory does not expose a way to back two disjoint GPA ranges
//! with a single contiguous host mmap short of constructing `MmapRegion`s from a raw file offset by
//! hand; two independent regions is how rust-vmm VMMs with a PCI hole do this in practice, and is
//! what's used here — see `DESIGN.md`). [`AddressSpace::snapshot_offset`] gives the snapshot engine a
//! single logical ordinal across both regions so RAM still serializes as one contiguous stream.

use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

use crate::arch::Architecture;

const GIB: u64 = 1 << 30;

/// Start of the legacy PCI/MMIO hole on x86-64.
pub const PCI_HOLE_START: u64 = 3 * GIB;
/// End of the legacy PCI/MMIO hole on x86-64 (exclusive).
pub const PCI_HOLE_END: u64 = 4 * GIB;

/// In-kernel IOAPIC MMIO window (x86-64).
pub const IOAPIC_BASE: u64 = 0xFEC0_0000;
pub const IOAPIC_SIZE: u64 = 0x1000;
/// In-kernel LAPIC MMIO window (x86-64).
pub const LAPIC_BASE: u64 = 0xFEE0_0000;
pub const LAPIC_SIZE: u64 = 0x1000;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to allocate guest memory: {0}")]
    Allocation(#[source] io::Error),

    #[error("guest address {gpa:#x} (len {len}) is out of range")]
    OutOfRange { gpa: u64, len: u64 },

    #[error("region [{base:#x}, {end:#x}) overlaps existing region [{other_base:#x}, {other_end:#x}) ({label})")]
    Overlap {
        base: u64,
        end: u64,
        other_base: u64,
        other_end: u64,
        label: &'static str,
    },

    #[error("no free MMIO range of size {size:#x} with alignment {align:#x}")]
    NoFreeRange { size: u64, align: u64 },

    #[error("alignment {0:#x} is not a power of two")]
    BadAlignment(u64),

    #[error("vm-memory error: {0}")]
    GuestMemory(String),
}

/// A named reservation in GPA space (architecture-fixed devices, the PCI hole itself, or anything
/// else the caller wants to protect from the MMIO allocator).
#[derive(Debug, Clone, Copy)]
struct Reservation {
    base: u64,
    size: u64,
    label: &'static str,
}

impl Reservation {
    fn end(&self) -> u64 {
        self.base + self.size
    }

    fn overlaps(&self, base: u64, size: u64) -> bool {
        base < self.end() && self.base < base + size
    }
}

/// A dynamically-assignable memory slot handed to the hypervisor layer for `set-user-memory-region`
/// registration (spec's "Memory region" data type).
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub slot: u32,
    pub guest_base: u64,
    pub size: u64,
    host_addr: u64,
}

impl MemoryRegion {
    /// Host virtual address of the start of this region, valid only while the owning
    /// [`AddressSpace`] is alive.
    pub fn host_addr(&self) -> u64 {
        self.host_addr
    }
}

/// A RAM region mmap'd after initial construction (`AllocateMemory`). Kept outside
/// `GuestMemoryMmap` because vm-memory builds that collection once, up front, from a fixed set of
/// ranges; hot-added regions are instead tracked here and served directly off the raw mapping.
struct ExtraRegion {
    guest_base: u64,
    size: u64,
    host_addr: NonNull<u8>,
}

// SAFETY: the mapping is anonymous, owned exclusively by this `ExtraRegion`, and never shared
// across address spaces; the only sharing that happens is the `AddressSpace` it lives in being
// passed between threads behind the crate's own locking.
unsafe impl Send for ExtraRegion {}
unsafe impl Sync for ExtraRegion {}

impl Drop for ExtraRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munmap(self.host_addr.cast(), self.size as usize);
        }
    }
}

/// Guest physical address space: backing RAM plus the bookkeeping needed to lay out MMIO devices
/// around it without collisions.
pub struct AddressSpace {
    memory: GuestMemoryMmap,
    memory_base: u64,
    size: u64,
    /// `Some(low_size)` when split around the PCI hole; the low region is `[memory_base, memory_base
    /// + low_size)` and the high region is `[PCI_HOLE_END, PCI_HOLE_END + (size - low_size))`.
    low_size: Option<u64>,
    reservations: Vec<Reservation>,
    /// Free ranges available to [`AddressSpace::allocate_mmio`], sorted by base and kept disjoint.
    free: Vec<(u64, u64)>,
    /// RAM regions added after construction via [`AddressSpace::add_ram_region`].
    extra_regions: Vec<ExtraRegion>,
}

impl AddressSpace {
    /// Allocate `size` bytes of guest RAM starting at `memory_base`, splitting around the PCI hole
    /// on x86-64 when necessary. AArch64 never splits (no legacy PCI hole in this model).
    pub fn new(arch: Architecture, memory_base: u64, size: u64) -> Result<Self, MemoryError> {
        let split = arch == Architecture::X86_64 && memory_base + size > PCI_HOLE_START;

        let (ranges, low_size) = if split {
            let low_size = PCI_HOLE_START - memory_base;
            let high_size = size - low_size;
            (
                vec![
                    (GuestAddress(memory_base), low_size as usize),
                    (GuestAddress(PCI_HOLE_END), high_size as usize),
                ],
                Some(low_size),
            )
        } else {
            (vec![(GuestAddress(memory_base), size as usize)], None)
        };

        let memory = GuestMemoryMmap::from_ranges(&ranges)
            .map_err(|e| MemoryError::Allocation(io::Error::other(e.to_string())))?;

        let mut space = Self {
            memory,
            memory_base,
            size,
            low_size,
            reservations: Vec::new(),
            free: Vec::new(),
            extra_regions: Vec::new(),
        };

        if split {
            space.reserve_internal(PCI_HOLE_START, PCI_HOLE_END - PCI_HOLE_START, "pci-hole")?;
            space.reserve_internal(IOAPIC_BASE, IOAPIC_SIZE, "ioapic")?;
            space.reserve_internal(LAPIC_BASE, LAPIC_SIZE, "lapic")?;
            // Everything in the hole not already carved out by a fixed device is available to the
            // MMIO allocator (virtio-mmio transports, HPET, etc).
            space.seed_free_from_hole();
        }

        Ok(space)
    }

    fn seed_free_from_hole(&mut self) {
        let mut cursor = PCI_HOLE_START;
        let mut carve_outs: Vec<(u64, u64)> = self
            .reservations
            .iter()
            .filter(|r| r.label != "pci-hole" && r.base >= PCI_HOLE_START && r.end() <= PCI_HOLE_END)
            .map(|r| (r.base, r.size))
            .collect();
        carve_outs.sort_by_key(|&(base, _)| base);
        for (base, size) in carve_outs {
            if base > cursor {
                self.free.push((cursor, base - cursor));
            }
            cursor = cursor.max(base + size);
        }
        if cursor < PCI_HOLE_END {
            self.free.push((cursor, PCI_HOLE_END - cursor));
        }
    }

    /// GPA of the first byte of guest RAM.
    pub fn memory_base(&self) -> u64 {
        self.memory_base
    }

    /// Total guest RAM size in bytes (RAM only; excludes the PCI hole even when split).
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_split(&self) -> bool {
        self.low_size.is_some()
    }

    pub fn low_size(&self) -> Option<u64> {
        self.low_size
    }

    /// Memory-slot descriptors ready for `set-user-memory-region` registration. Slot 0 is always the
    /// low (or only) region; slot 1, when present, is the high region; slots beyond that are
    /// regions added later via [`AddressSpace::add_ram_region`].
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.memory
            .iter()
            .enumerate()
            .map(|(slot, region)| MemoryRegion {
                slot: slot as u32,
                guest_base: region.start_addr().raw_value(),
                size: region.len(),
                host_addr: region.as_ptr() as u64,
            })
            .chain(self.extra_regions.iter().enumerate().map(|(i, region)| MemoryRegion {
                slot: (self.memory.num_regions() + i) as u32,
                guest_base: region.guest_base,
                size: region.size,
                host_addr: region.host_addr.as_ptr() as u64,
            }))
            .collect()
    }

    /// `AllocateMemory(physAddr, size)`: mmap a new anonymous region and reserve its GPA range so
    /// the caller (the hypervisor layer) can register it as the next `set-user-memory-region` slot.
    /// Returns the descriptor to register; the region itself is tracked here so later reads/writes
    /// and the next `AllocateMemory` call see it.
    pub fn add_ram_region(&mut self, base: u64, size: u64) -> Result<MemoryRegion, MemoryError> {
        self.reserve_internal(base, size, "hot-added-ram")?;
        self.remove_from_free(base, size);

        let len = NonZeroUsize::new(size as usize)
            .ok_or(MemoryError::OutOfRange { gpa: base, len: size })?;
        let host_addr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| MemoryError::Allocation(io::Error::from(e)))?;

        let slot = (self.memory.num_regions() + self.extra_regions.len()) as u32;
        self.extra_regions.push(ExtraRegion {
            guest_base: base,
            size,
            host_addr,
        });
        Ok(MemoryRegion {
            slot,
            guest_base: base,
            size,
            host_addr: host_addr.as_ptr() as u64,
        })
    }

    fn find_extra_region(&self, gpa: u64, len: u64) -> Option<&ExtraRegion> {
        self.extra_regions
            .iter()
            .find(|r| gpa >= r.guest_base && gpa + len <= r.guest_base + r.size)
    }

    /// Reserve `[base, base+size)` for a fixed-location device or other protected use. Returns an
    /// error if it overlaps an existing reservation.
    pub fn reserve(&mut self, base: u64, size: u64, label: &'static str) -> Result<(), MemoryError> {
        self.reserve_internal(base, size, label)?;
        self.remove_from_free(base, size);
        Ok(())
    }

    fn reserve_internal(&mut self, base: u64, size: u64, label: &'static str) -> Result<(), MemoryError> {
        if let Some(existing) = self.reservations.iter().find(|r| r.overlaps(base, size)) {
            return Err(MemoryError::Overlap {
                base,
                end: base + size,
                other_base: existing.base,
                other_end: existing.end(),
                label: existing.label,
            });
        }
        self.reservations.push(Reservation { base, size, label });
        Ok(())
    }

    fn remove_from_free(&mut self, base: u64, size: u64) {
        let end = base + size;
        let mut next = Vec::with_capacity(self.free.len());
        for &(fbase, fsize) in &self.free {
            let fend = fbase + fsize;
            if end <= fbase || base >= fend {
                next.push((fbase, fsize));
                continue;
            }
            if fbase < base {
                next.push((fbase, base - fbase));
            }
            if end < fend {
                next.push((end, fend - end));
            }
        }
        self.free = next;
    }

    /// Register an additional free MMIO range the allocator may hand out (used by AArch64 bring-up,
    /// which has no fixed PCI hole to seed from automatically).
    pub fn add_mmio_window(&mut self, base: u64, size: u64) -> Result<(), MemoryError> {
        self.reserve_internal(base, size, "mmio-window")?;
        self.free.push((base, size));
        self.free.sort_by_key(|&(b, _)| b);
        Ok(())
    }

    /// First-fit allocation of an MMIO range of `size` bytes aligned to `align` (must be a power of
    /// two). Removes the allocated range from the free list.
    pub fn allocate_mmio(&mut self, size: u64, align: u64) -> Result<u64, MemoryError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(MemoryError::BadAlignment(align));
        }
        for &(base, len) in &self.free {
            let aligned_base = (base + align - 1) & !(align - 1);
            let slack = aligned_base.saturating_sub(base);
            if slack < len && len - slack >= size {
                self.remove_from_free(aligned_base, size);
                return Ok(aligned_base);
            }
        }
        Err(MemoryError::NoFreeRange { size, align })
    }

    /// Translate a GPA into an ordinal offset across the logical contiguous RAM stream (low region
    /// followed by high region), used by the snapshot engine to serialize RAM without reproducing
    /// the hole. Not used for ordinary reads/writes, which go through vm-memory's own region lookup.
    pub fn snapshot_offset(&self, gpa: u64) -> Result<u64, MemoryError> {
        match self.low_size {
            None => {
                if gpa < self.memory_base || gpa >= self.memory_base + self.size {
                    return Err(MemoryError::OutOfRange { gpa, len: 0 });
                }
                Ok(gpa - self.memory_base)
            }
            Some(low_size) => {
                if gpa >= self.memory_base && gpa < self.memory_base + low_size {
                    Ok(gpa - self.memory_base)
                } else if gpa >= PCI_HOLE_END && gpa < PCI_HOLE_END + (self.size - low_size) {
                    Ok(low_size + (gpa - PCI_HOLE_END))
                } else {
                    Err(MemoryError::OutOfRange { gpa, len: 0 })
                }
            }
        }
    }

    /// Bounds-checked guest-physical read, falling through to hot-added regions the base
    /// `GuestMemoryMmap` doesn't know about.
    pub fn read_at(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        if let Some(region) = self.find_extra_region(gpa, buf.len() as u64) {
            let offset = (gpa - region.guest_base) as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(region.host_addr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
            }
            return Ok(());
        }
        self.memory
            .read_slice(buf, GuestAddress(gpa))
            .map_err(|e| self.map_access_error(gpa, buf.len() as u64, e))
    }

    /// Bounds-checked guest-physical write, falling through to hot-added regions.
    pub fn write_at(&self, gpa: u64, buf: &[u8]) -> Result<(), MemoryError> {
        if let Some(region) = self.find_extra_region(gpa, buf.len() as u64) {
            let offset = (gpa - region.guest_base) as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), region.host_addr.as_ptr().add(offset), buf.len());
            }
            return Ok(());
        }
        self.memory
            .write_slice(buf, GuestAddress(gpa))
            .map_err(|e| self.map_access_error(gpa, buf.len() as u64, e))
    }

    fn map_access_error(&self, gpa: u64, len: u64, e: impl std::fmt::Display) -> MemoryError {
        if self.snapshot_offset(gpa).is_err() {
            MemoryError::OutOfRange { gpa, len }
        } else {
            MemoryError::GuestMemory(e.to_string())
        }
    }

    /// Iterate full RAM contents in snapshot order (low region then high region), calling `f` with
    /// successive chunks. Used by the snapshot engine's RAM capture path.
    pub fn for_each_chunk(
        &self,
        chunk_size: usize,
        mut f: impl FnMut(&[u8]) -> Result<(), MemoryError>,
    ) -> Result<(), MemoryError> {
        let mut buf = vec![0u8; chunk_size];
        for region in self.memory.iter() {
            let base = region.start_addr().raw_value();
            let len = region.len();
            let mut off = 0u64;
            while off < len {
                let want = (len - off).min(chunk_size as u64) as usize;
                self.read_at(base + off, &mut buf[..want])?;
                f(&buf[..want])?;
                off += want as u64;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_split_layout_round_trips() {
        let mut space = AddressSpace::new(Architecture::Aarch64, 0, 64 * 1024 * 1024).unwrap();
        assert!(!space.is_split());
        space.write_at(0x1000, b"hello").unwrap();
        let mut buf = [0u8; 5];
        space.read_at(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn split_layout_carves_pci_hole() {
        let space = AddressSpace::new(Architecture::X86_64, 0, 4 * GIB).unwrap();
        assert!(space.is_split());
        assert_eq!(space.low_size(), Some(PCI_HOLE_START));
        assert!(space.snapshot_offset(PCI_HOLE_START + 1).is_err());
        assert_eq!(space.snapshot_offset(PCI_HOLE_END).unwrap(), PCI_HOLE_START);
    }

    #[test]
    fn reservations_reject_overlap() {
        let mut space = AddressSpace::new(Architecture::X86_64, 0, 4 * GIB).unwrap();
        assert!(space.reserve(IOAPIC_BASE, 0x1000, "dup-ioapic").is_err());
    }

    #[test]
    fn mmio_allocator_avoids_fixed_devices() {
        let mut space = AddressSpace::new(Architecture::X86_64, 0, 4 * GIB).unwrap();
        let addr = space.allocate_mmio(0x1000, 0x1000).unwrap();
        assert!(addr < IOAPIC_BASE || addr >= LAPIC_BASE + LAPIC_SIZE);
        assert!(!(IOAPIC_BASE..IOAPIC_BASE + IOAPIC_SIZE).contains(&addr));
        assert!(!(LAPIC_BASE..LAPIC_BASE + LAPIC_SIZE).contains(&addr));
    }

    #[test]
    fn allocate_mmio_fails_when_exhausted() {
        let mut space = AddressSpace::new(Architecture::Aarch64, 0, 16 * 1024 * 1024).unwrap();
        assert!(space.allocate_mmio(0x1000, 0x1000).is_err());
        space.add_mmio_window(0x4000_0000, 0x1000).unwrap();
        assert_eq!(space.allocate_mmio(0x1000, 0x1000).unwrap(), 0x4000_0000);
        assert!(space.allocate_mmio(0x1000, 0x1000).is_err());
    }
}
