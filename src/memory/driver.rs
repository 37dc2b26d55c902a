// Memory drivers for SPOS heaps
//
// A driver is the byte store behind a heap's use area. Addresses are offsets
// into the driver, starting at 0.
use alloc::vec;
use alloc::vec::Vec;

use crate::memory::{MemAddr, MemValue};

pub trait MemDriver: Send {
    /// Called once when the heap is set up.
    fn init(&mut self) {}
    fn read(&self, addr: MemAddr) -> MemValue;
    fn write(&mut self, addr: MemAddr, value: MemValue);
    /// Number of addressable bytes
    fn size(&self) -> usize;
}

/// Driver backed by plain RAM
#[derive(Debug, Clone)]
pub struct RamDriver {
    cells: Vec<MemValue>,
}

impl RamDriver {
    pub fn new(size: usize) -> Self {
        Self { cells: vec![0; size] }
    }
}

impl MemDriver for RamDriver {
    fn init(&mut self) {
        self.cells.fill(0);
    }

    fn read(&self, addr: MemAddr) -> MemValue {
        self.cells.get(addr as usize).copied().unwrap_or(0)
    }

    fn write(&mut self, addr: MemAddr, value: MemValue) {
        if let Some(cell) = self.cells.get_mut(addr as usize) {
            *cell = value;
        }
    }

    fn size(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_driver_stores_bytes() {
        let mut ram = RamDriver::new(16);
        ram.write(3, 0xAB);
        assert_eq!(ram.read(3), 0xAB);
        assert_eq!(ram.size(), 16);

        ram.init();
        assert_eq!(ram.read(3), 0);
    }

    #[test]
    fn out_of_range_access_is_ignored() {
        let mut ram = RamDriver::new(4);
        ram.write(10, 1);
        assert_eq!(ram.read(10), 0);
    }
}
