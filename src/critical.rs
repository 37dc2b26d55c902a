// Reentrant critical section for SPOS
//
// While the nesting depth is non-zero the tick source is paused and the
// dispatcher refuses to run, so the process table and the heap maps are never
// observed half-updated.
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use spin::Mutex;

use crate::hal::TickSource;
use crate::{KernelError, KernelResult};

pub struct CriticalSection {
    depth: AtomicU8,
    epoch: AtomicU32,
    ticker: Mutex<Box<dyn TickSource>>,
}

impl CriticalSection {
    pub fn new(ticker: Box<dyn TickSource>) -> Self {
        Self {
            depth: AtomicU8::new(0),
            epoch: AtomicU32::new(0),
            ticker: Mutex::new(ticker),
        }
    }

    /// Enter and get a guard that leaves again when dropped.
    pub fn enter(this: &Arc<Self>) -> CriticalGuard {
        let counted = match this.acquire() {
            Ok(()) => true,
            Err(_) => {
                log::error!("critical section nesting overflow");
                false
            }
        };
        CriticalGuard {
            section: Arc::clone(this),
            epoch: this.epoch.load(Ordering::SeqCst),
            counted,
        }
    }

    /// Raw enter. Pauses the tick source on the outermost level.
    pub fn acquire(&self) -> KernelResult<()> {
        let previous = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| depth.checked_add(1))
            .map_err(|_| KernelError::GuardMisuse)?;
        if previous == 0 {
            self.ticker.lock().pause();
        }
        Ok(())
    }

    /// Raw leave. Resumes the tick source when the outermost level is left.
    /// Leaving an unheld section is refused and the depth stays at zero.
    pub fn release(&self) -> KernelResult<()> {
        let previous = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| depth.checked_sub(1))
            .map_err(|_| KernelError::GuardMisuse)?;
        if previous == 1 {
            self.ticker.lock().resume();
        }
        Ok(())
    }

    /// Drop every nesting level at once. Guards taken before this call
    /// become inert.
    pub fn abandon(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.depth.swap(0, Ordering::SeqCst) != 0 {
            self.ticker.lock().resume();
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.depth() != 0
    }
}

/// Scoped critical section, released on every exit path.
#[must_use = "the critical section is left as soon as the guard is dropped"]
pub struct CriticalGuard {
    section: Arc<CriticalSection>,
    epoch: u32,
    counted: bool,
}

impl CriticalGuard {
    /// False when entering overflowed the nesting depth. Such a guard holds
    /// no level and leaves nothing on drop.
    pub fn is_counted(&self) -> bool {
        self.counted
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        if !self.counted || self.section.epoch.load(Ordering::SeqCst) != self.epoch {
            return;
        }
        if self.section.release().is_err() {
            log::error!("critical section guard released an unheld section");
        }
    }
}
