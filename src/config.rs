// Kernel configuration for SPOS
//
// Table sizes are fixed at compile time; the runtime part selects strategies
// and lays out the heaps at bring-up.
use alloc::vec;
use alloc::vec::Vec;

use crate::memory::AllocStrategy;
use crate::process::{Priority, SchedulingStrategy};

/// Process table capacity, including the idle process in slot 0.
pub const MAX_NUMBER_OF_PROCESSES: usize = 8;

/// Program table capacity, including the idle program in slot 0.
pub const MAX_NUMBER_OF_PROGRAMS: usize = 16;

/// Stack bytes reserved for every process slot.
pub const STACK_SIZE_PROC: usize = 256;

/// Priority used for autostarted programs.
pub const DEFAULT_PRIORITY: Priority = 17;

/// Concurrent readers a shared chunk admits.
pub const MAX_SHARED_READERS: u8 = 5;

/// Number of levels of the multi-level feedback queue.
pub const MLFQ_LEVELS: usize = 4;

/// Tunable weights of the scheduling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTuning {
    /// Even: a process gets `priority / even_divisor + 1` consecutive turns.
    pub even_divisor: u8,
    /// Inactive aging: age gained per skipped round on top of the priority.
    pub aging_credit: u16,
    /// Seed of the PRNG used by the random strategy.
    pub random_seed: u64,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            even_divisor: 32,
            aging_credit: 1,
            random_seed: 0x5EED_0F_5B05,
        }
    }
}

/// Layout of one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    pub name: &'static str,
    /// Number of map entries, i.e. the maximum number of live chunks.
    pub map_capacity: usize,
    /// Bytes in the use area.
    pub use_size: u16,
    pub strategy: AllocStrategy,
}

impl HeapConfig {
    pub const fn new(name: &'static str, map_capacity: usize, use_size: u16) -> Self {
        Self {
            name,
            map_capacity,
            use_size,
            strategy: AllocStrategy::FirstFit,
        }
    }

    pub const fn with_strategy(mut self, strategy: AllocStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Runtime configuration applied by [`crate::Kernel::new`].
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub scheduling: SchedulingStrategy,
    pub tuning: SchedulerTuning,
    pub heaps: Vec<HeapConfig>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            scheduling: SchedulingStrategy::Even,
            tuning: SchedulerTuning::default(),
            heaps: vec![
                HeapConfig::new("internal", 64, 1024),
                HeapConfig::new("external", 256, 16384),
            ],
        }
    }
}

impl KernelConfig {
    pub fn with_scheduling(mut self, strategy: SchedulingStrategy) -> Self {
        self.scheduling = strategy;
        self
    }

    pub fn with_tuning(mut self, tuning: SchedulerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_heaps(mut self, heaps: Vec<HeapConfig>) -> Self {
        self.heaps = heaps;
        self
    }
}
