// Allocation strategies for SPOS heaps
//
// A strategy only picks a start address among the free regions. Free regions
// are derived from the heap map on demand and passed in ascending order.
use crate::memory::MemAddr;

/// Maximal run of unallocated bytes in a use area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub addr: MemAddr,
    pub size: u16,
}

impl FreeRegion {
    /// First address after the region
    pub fn end(&self) -> u32 {
        u32::from(self.addr) + u32::from(self.size)
    }

    fn fits(&self, size: u16) -> bool {
        self.size >= size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    NextFit,
    FirstFit,
    BestFit,
    WorstFit,
}

impl AllocStrategy {
    pub const ALL: [AllocStrategy; 4] = [
        AllocStrategy::NextFit,
        AllocStrategy::FirstFit,
        AllocStrategy::BestFit,
        AllocStrategy::WorstFit,
    ];

    /// Start address for a chunk of `size` bytes, or `None` if no region is
    /// large enough. `cursor` is where the previous allocation ended and is
    /// only consulted by next-fit.
    pub fn select(self, free: &[FreeRegion], size: u16, cursor: MemAddr) -> Option<MemAddr> {
        match self {
            AllocStrategy::FirstFit => first_fit(free, size),
            AllocStrategy::NextFit => next_fit(free, size, cursor),
            AllocStrategy::BestFit => best_fit(free, size),
            AllocStrategy::WorstFit => worst_fit(free, size),
        }
    }
}

fn first_fit(free: &[FreeRegion], size: u16) -> Option<MemAddr> {
    free.iter().find(|region| region.fits(size)).map(|region| region.addr)
}

/// Search from the cursor onwards, then wrap around to the start.
fn next_fit(free: &[FreeRegion], size: u16, cursor: MemAddr) -> Option<MemAddr> {
    free.iter()
        .filter(|region| region.end() > u32::from(cursor))
        .find_map(|region| {
            let start = region.addr.max(cursor);
            (region.end() - u32::from(start) >= u32::from(size)).then_some(start)
        })
        .or_else(|| first_fit(free, size))
}

// `min_by_key`/`max_by_key` resolve ties differently, so both are spelled out
// to keep the lowest address on ties.
fn best_fit(free: &[FreeRegion], size: u16) -> Option<MemAddr> {
    let mut best: Option<&FreeRegion> = None;
    for region in free.iter().filter(|region| region.fits(size)) {
        if best.map_or(true, |leader| region.size < leader.size) {
            best = Some(region);
        }
    }
    best.map(|region| region.addr)
}

fn worst_fit(free: &[FreeRegion], size: u16) -> Option<MemAddr> {
    let mut worst: Option<&FreeRegion> = None;
    for region in free.iter().filter(|region| region.fits(size)) {
        if worst.map_or(true, |leader| region.size > leader.size) {
            worst = Some(region);
        }
    }
    worst.map(|region| region.addr)
}
