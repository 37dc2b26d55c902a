// Collaborator interfaces the kernel core consumes
//
// The timer, the time base and the error display are board specific. The
// integrator implements these traits and hands them to `Kernel`.
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::KernelError;

/// Periodic tick that drives the dispatcher.
///
/// `pause` masks the tick interrupt, `resume` unmasks it again. Both are
/// called by the critical section on its outermost enter/leave only.
pub trait TickSource: Send {
    fn pause(&mut self);
    fn resume(&mut self);
}

/// Monotonic time base, used for scheduling bookkeeping only.
pub trait Clock: Send {
    /// Coarse timestamp in milliseconds
    fn coarse(&self) -> u32;
    /// Precise timestamp in microseconds
    fn precise(&self) -> u64;
}

/// Receives unrecoverable conditions before the kernel halts the affected
/// process or the system.
pub trait FatalSink: Send {
    fn report(&mut self, error: KernelError, reason: &str);
}

/// Tick source for boards where the dispatcher is driven by hand.
#[derive(Debug, Default)]
pub struct NullTicker {
    paused: bool,
}

impl NullTicker {
    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

impl TickSource for NullTicker {
    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }
}

/// Clock advanced explicitly by whoever owns a clone of it.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn coarse(&self) -> u32 {
        (self.micros.load(Ordering::Relaxed) / 1000) as u32
    }

    fn precise(&self) -> u64 {
        self.micros.load(Ordering::Relaxed)
    }
}

/// Fatal sink that writes to the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl FatalSink for LogSink {
    fn report(&mut self, error: KernelError, reason: &str) {
        log::error!("FATAL {}: {}", error, reason);
    }
}
