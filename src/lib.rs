// SPOS kernel core: process scheduler and segmented heap manager
//
// The crate is `no_std` + `alloc` so it can be linked into firmware. Hardware
// bring-up, the timer, drivers and the console live outside and reach the
// core through the traits in `hal` and `memory::driver`.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod critical;
pub mod hal;
pub mod kernel;
pub mod memory;
pub mod process;
pub mod services;
pub mod syscalls;

use core::fmt;

pub use config::{HeapConfig, KernelConfig, SchedulerTuning};
pub use kernel::{Kernel, TickOutcome};
pub use memory::{AllocStrategy, Heap, HeapId, MemAddr, MemValue};
pub use process::{Priority, ProcessId, ProcessState, Program, ProgramFn, ProgramId, SchedulingStrategy};

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Fixed-capacity tables that can run out of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Programs,
    Processes,
    HeapMap,
}

/// Kernel error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free slot left in the named table
    TableFull(Table),
    /// The process slot is not occupied
    NoSuchProcess,
    /// No program registered under that id
    NoSuchProgram,
    /// No heap registered under that index
    NoSuchHeap,
    /// The idle process cannot be killed
    ProtectedProcess,
    /// Address does not belong to any chunk (or a shared chunk was passed
    /// to a private free)
    InvalidFree,
    /// Chunk is owned by another process
    NotOwner,
    /// No free region satisfies the request
    OutOfMemory,
    /// Access outside the bounds of a chunk
    OutOfBounds,
    /// Shared chunk is currently opened in a conflicting mode
    WouldBlock,
    /// Shared chunk closed more often than opened
    NotOpen,
    /// Stack checksum mismatch on switch-in
    StackCorruption,
    /// Unbalanced critical section
    GuardMisuse,
    /// The system stopped after an unrecoverable error
    Halted,
    /// The scheduler is already running
    AlreadyStarted,
}

impl KernelError {
    /// Errors that mean memory safety is already compromised. These are
    /// reported through the fatal sink in addition to being returned.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::StackCorruption | KernelError::GuardMisuse | KernelError::Halted)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Table::Programs => write!(f, "program table"),
            Table::Processes => write!(f, "process table"),
            Table::HeapMap => write!(f, "heap map"),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::TableFull(table) => write!(f, "{} is full", table),
            KernelError::NoSuchProcess => write!(f, "No such process"),
            KernelError::NoSuchProgram => write!(f, "No such program"),
            KernelError::NoSuchHeap => write!(f, "No such heap"),
            KernelError::ProtectedProcess => write!(f, "Idle process cannot be killed"),
            KernelError::InvalidFree => write!(f, "Address is not allocated"),
            KernelError::NotOwner => write!(f, "Chunk belongs to another process"),
            KernelError::OutOfMemory => write!(f, "Out of memory"),
            KernelError::OutOfBounds => write!(f, "Access outside of chunk"),
            KernelError::WouldBlock => write!(f, "Shared memory busy"),
            KernelError::NotOpen => write!(f, "Shared memory not open"),
            KernelError::StackCorruption => write!(f, "Invalid stack checksum"),
            KernelError::GuardMisuse => write!(f, "Unbalanced critical section"),
            KernelError::Halted => write!(f, "System halted"),
            KernelError::AlreadyStarted => write!(f, "Scheduler already started"),
        }
    }
}
