// Process-wide kernel instance for SPOS
//
// Bring-up code and the timer ISR have no `&mut Kernel` at hand; they reach
// the single kernel through these services. Programs must use the kernel
// reference passed to their entry point instead, the lock is held while they
// run.
use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};

use crate::config::KernelConfig;
use crate::kernel::{Kernel, TickOutcome};
use crate::{KernelError, KernelResult};

pub mod memory_service;
pub mod process_service;

lazy_static! {
    pub static ref KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);
}

/// Timer interrupts that found the kernel locked, not yet counted by it.
static DROPPED_TICKS: AtomicU64 = AtomicU64::new(0);

/// Hand ticks dropped by `timer_interrupt` over to the kernel's statistics.
fn settle_dropped_ticks(slot: &mut MutexGuard<Option<Kernel>>) {
    if let Some(kernel) = slot.as_mut() {
        let dropped = DROPPED_TICKS.swap(0, Ordering::SeqCst);
        if dropped != 0 {
            kernel.record_deferred_ticks(dropped);
        }
    }
}

fn lock() -> MutexGuard<'static, Option<Kernel>> {
    let mut slot = KERNEL.lock();
    settle_dropped_ticks(&mut slot);
    slot
}

/// Ticks dropped since the kernel last took the lock.
pub fn pending_dropped_ticks() -> u64 {
    DROPPED_TICKS.load(Ordering::SeqCst)
}

/// Build the kernel from `config` and make it the system kernel, replacing
/// any previous one.
pub fn init(config: KernelConfig) -> KernelResult<()> {
    install(Kernel::new(config)?);
    Ok(())
}

/// Make an already configured kernel the system kernel.
pub fn install(kernel: Kernel) {
    *KERNEL.lock() = Some(kernel);
    log::info!("kernel installed");
}

pub fn is_initialized() -> bool {
    KERNEL.lock().is_some()
}

/// Run `f` on the system kernel. Before `init` the system counts as halted.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> KernelResult<R>) -> KernelResult<R> {
    match lock().as_mut() {
        Some(kernel) => f(kernel),
        None => Err(KernelError::Halted),
    }
}

/// Timer ISR entry. If the lock is taken the interrupt arrived in the middle
/// of a kernel call and the tick is dropped.
pub fn timer_interrupt() -> TickOutcome {
    match KERNEL.try_lock() {
        Some(mut slot) => {
            settle_dropped_ticks(&mut slot);
            slot.as_mut().map_or(TickOutcome::Deferred, Kernel::tick)
        }
        None => {
            DROPPED_TICKS.fetch_add(1, Ordering::SeqCst);
            log::trace!("timer tick while kernel locked");
            TickOutcome::Deferred
        }
    }
}
