// Memory Management Module for SPOS
pub mod driver;
pub mod heap;
pub mod strategies;

pub use driver::{MemDriver, RamDriver};
pub use heap::{Heap, MapEntry, Owner, SharedState, MAP_ENTRY_SIZE};
pub use strategies::{AllocStrategy, FreeRegion};

/// Address in a heap's address space
pub type MemAddr = u16;

/// Content of one memory cell
pub type MemValue = u8;

/// Index of a heap in the kernel's heap list
pub type HeapId = usize;
