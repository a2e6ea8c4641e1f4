//! Dispatches bus accesses to dynamically-registered [`Device`]s by base address.

use crate::address_range::AddressRange;
use crate::bus::{AddressOutOfBounds, Device};
use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("address range {new} overlaps already-registered range {existing}")]
pub struct AddressOverlap {
    pub new: AddressRange,
    pub existing: AddressRange,
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("no device registered at address {address:#x}")]
pub struct NoDeviceAtAddress {
    pub address: u64,
}

struct Entry {
    range: AddressRange,
    device: Box<dyn Device>,
}

/// A system bus that devices are registered onto at runtime, rather than a fixed set of
/// board-level resources.
///
/// Kept sorted by base address so lookups read like a binary search candidate, though the
/// current implementation scans; correctness does not depend on the sort, only `register`'s
/// overlap check does.
#[derive(Default)]
pub struct SystemBus {
    entries: Vec<Entry>,
}

impl SystemBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `device` at `base`, occupying `[base, base + device.size() - 1]`.
    ///
    /// Fails with [`AddressOverlap`] if the new range intersects any already-registered range.
    pub fn register(&mut self, base: u64, device: Box<dyn Device>) -> Result<(), AddressOverlap> {
        let size = device.size();
        let end = base
            .checked_add(size.saturating_sub(1))
            .expect("device size overflows address space");
        let range = AddressRange::new(base, end).expect("device must occupy a non-empty range");
        if let Some(existing) = self.entries.iter().find(|e| e.range.overlaps(range)) {
            return Err(AddressOverlap {
                new: range,
                existing: existing.range,
            });
        }
        let index = self
            .entries
            .partition_point(|e| e.range.start() < range.start());
        self.entries.insert(index, Entry { range, device });
        Ok(())
    }

    fn locate(&self, address: u64) -> Result<(&Entry, u64), NoDeviceAtAddress> {
        self.entries
            .iter()
            .find(|e| e.range.contains(address))
            .map(|e| (e, address - e.range.start()))
            .ok_or(NoDeviceAtAddress { address })
    }

    fn locate_mut(&mut self, address: u64) -> Result<(&mut Entry, u64), NoDeviceAtAddress> {
        let index = self
            .entries
            .iter()
            .position(|e| e.range.contains(address))
            .ok_or(NoDeviceAtAddress { address })?;
        let entry = &mut self.entries[index];
        let offset = address - entry.range.start();
        Ok((entry, offset))
    }

    pub fn read(&self, address: u64, size: u8) -> Result<u64, BusError> {
        let (entry, offset) = self.locate(address)?;
        Ok(entry.device.read(offset, size)?)
    }

    pub fn write(&mut self, address: u64, size: u8, value: u64) -> Result<(), BusError> {
        let (entry, offset) = self.locate_mut(address)?;
        Ok(entry.device.write(offset, size, value)?)
    }
}

/// Any error a dispatched bus access can produce.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum BusError {
    #[error(transparent)]
    NoDevice(#[from] NoDeviceAtAddress),
    #[error(transparent)]
    OutOfBounds(#[from] AddressOutOfBounds),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    #[test]
    fn test_register_and_dispatch() {
        let mut bus = SystemBus::new();
        bus.register(0x1000, Box::new(Memory::new(4096))).unwrap();
        bus.write(0x1000, 4, 0xDEAD_BEEF).unwrap();
        assert_eq!(bus.read(0x1000, 4).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut bus = SystemBus::new();
        bus.register(0x1000, Box::new(Memory::new(4096))).unwrap();
        let err = bus.register(0x1800, Box::new(Memory::new(4096)));
        assert!(err.is_err());
    }

    #[test]
    fn test_miss_returns_no_device() {
        let mut bus = SystemBus::new();
        bus.register(0x1000, Box::new(Memory::new(4096))).unwrap();
        assert!(matches!(bus.read(0x9000, 4), Err(BusError::NoDevice(_))));
    }

    #[test]
    fn test_adjacent_ranges_do_not_overlap() {
        let mut bus = SystemBus::new();
        bus.register(0x1000, Box::new(Memory::new(4096))).unwrap();
        assert!(bus.register(0x2000, Box::new(Memory::new(4096))).is_ok());
    }
}
