// Memory Management Service for SPOS
use alloc::vec::Vec;

use crate::memory::{AllocStrategy, Heap, HeapId, MemAddr};
use crate::services::with_kernel;
use crate::KernelResult;

/// Heap statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub name: &'static str,
    pub strategy: AllocStrategy,
    pub map_capacity: usize,
    pub map_entries: usize,
    pub use_size: u16,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

impl HeapStats {
    fn of(heap: &Heap) -> Self {
        Self {
            name: heap.name(),
            strategy: heap.strategy(),
            map_capacity: heap.map_capacity(),
            map_entries: heap.map_entries(),
            use_size: heap.use_size(),
            used_bytes: heap.used_bytes(),
            free_bytes: heap.free_bytes(),
        }
    }
}

/// Allocate for the current process.
pub fn malloc(heap: HeapId, size: u16) -> KernelResult<MemAddr> {
    with_kernel(|kernel| kernel.malloc(heap, size))
}

pub fn free(heap: HeapId, addr: MemAddr) -> KernelResult<()> {
    with_kernel(|kernel| kernel.free(heap, addr))
}

pub fn realloc(heap: HeapId, addr: MemAddr, size: u16) -> KernelResult<MemAddr> {
    with_kernel(|kernel| kernel.realloc(heap, addr, size))
}

pub fn sh_malloc(heap: HeapId, size: u16) -> KernelResult<MemAddr> {
    with_kernel(|kernel| kernel.sh_malloc(heap, size))
}

pub fn sh_free(heap: HeapId, addr: MemAddr) -> KernelResult<()> {
    with_kernel(|kernel| kernel.sh_free(heap, addr))
}

pub fn set_allocation_strategy(heap: HeapId, strategy: AllocStrategy) -> KernelResult<()> {
    with_kernel(|kernel| kernel.set_allocation_strategy(heap, strategy))
}

pub fn heap_stats(heap: HeapId) -> KernelResult<HeapStats> {
    with_kernel(|kernel| kernel.heap(heap).map(HeapStats::of))
}

pub fn all_heap_stats() -> KernelResult<Vec<HeapStats>> {
    with_kernel(|kernel| (0..kernel.heap_count()).map(|heap| kernel.heap(heap).map(HeapStats::of)).collect())
}
