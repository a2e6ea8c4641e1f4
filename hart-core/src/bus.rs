//! A [`Device`] is anything that can be mapped onto the [system bus](crate::system_bus) and
//! answer sized, little-endian reads and writes.
//!
//! The concept is based on a TileLink-like bus interface, but simplified: accesses are made for
//! any `(address, size)` pair, addresses need not be naturally aligned to the access size, and
//! values are always serialized in little-endian byte order regardless of the host's native
//! endianness. A device declares the address range it occupies and must reject, rather than
//! panic on, any access outside of it.
use thiserror::Error;

/// Raised by a [`Device`] when an access falls outside the bytes it actually backs.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("address {address:#x} (size {size}) is out of bounds")]
pub struct AddressOutOfBounds {
    pub address: u64,
    pub size: u8,
}

/// A memory-mapped device that can be registered on a [`SystemBus`](crate::system_bus::SystemBus).
pub trait Device {
    /// Size of this device's address range, in bytes.
    fn size(&self) -> u64;

    /// Reads `size` bytes (1, 2, 4, or 8) at the device-relative `offset`, little-endian.
    fn read(&self, offset: u64, size: u8) -> Result<u64, AddressOutOfBounds>;

    /// Writes the low `size` bytes (1, 2, 4, or 8) of `value` at the device-relative `offset`,
    /// little-endian.
    fn write(&mut self, offset: u64, size: u8, value: u64) -> Result<(), AddressOutOfBounds>;
}
