// Process Management Service for SPOS
use crate::kernel::TickOutcome;
use crate::process::{
    Priority, ProcessId, ProcessState, Program, ProgramId, SchedulerStats, SchedulingStrategy,
};
use crate::services::with_kernel;
use crate::KernelResult;

/// Snapshot of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub pid: ProcessId,
    pub program: ProgramId,
    pub state: ProcessState,
    pub priority: Priority,
    pub cpu_ticks: u64,
    /// Bytes owned on all heaps
    pub memory_usage: usize,
    pub created_at: u64,
    pub last_run: u64,
}

/// System statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemStats {
    pub total_processes: usize,
    pub running_processes: usize,
    pub ready_processes: usize,
    pub blocked_processes: usize,
    pub registered_programs: usize,
    pub scheduler: SchedulerStats,
}

pub fn register_program(program: Program) -> KernelResult<ProgramId> {
    with_kernel(|kernel| kernel.register_program(program))
}

pub fn exec(program: ProgramId, priority: Priority) -> KernelResult<ProcessId> {
    with_kernel(|kernel| kernel.exec(program, priority))
}

pub fn kill(pid: ProcessId) -> KernelResult<()> {
    with_kernel(|kernel| kernel.kill(pid))
}

pub fn init_scheduler() -> KernelResult<usize> {
    with_kernel(|kernel| kernel.init_scheduler())
}

pub fn start_scheduler() -> KernelResult<()> {
    with_kernel(|kernel| kernel.start_scheduler())
}

/// One pass of the current program; the board's main loop calls this
/// forever.
pub fn run_current() -> KernelResult<()> {
    with_kernel(|kernel| kernel.run_current())
}

pub fn yield_now() -> KernelResult<TickOutcome> {
    with_kernel(|kernel| Ok(kernel.yield_now()))
}

pub fn current_process() -> KernelResult<ProcessId> {
    with_kernel(|kernel| Ok(kernel.current_process()))
}

pub fn set_scheduling_strategy(strategy: SchedulingStrategy) -> KernelResult<()> {
    with_kernel(|kernel| {
        kernel.set_scheduling_strategy(strategy);
        Ok(())
    })
}

pub fn get_process_stats(pid: ProcessId) -> KernelResult<ProcessStats> {
    with_kernel(|kernel| {
        let process = *kernel.process(pid)?;
        let memory_usage = (0..kernel.heap_count())
            .filter_map(|heap| kernel.heap(heap).ok())
            .map(|heap| heap.owned_bytes(pid))
            .sum();
        Ok(ProcessStats {
            pid,
            program: process.program,
            state: process.state,
            priority: process.priority,
            cpu_ticks: process.cpu_ticks,
            memory_usage,
            created_at: process.created_at,
            last_run: process.last_run,
        })
    })
}

pub fn get_system_stats() -> KernelResult<SystemStats> {
    with_kernel(|kernel| {
        let count = |state: ProcessState| kernel.processes().iter().filter(|p| p.state == state).count();
        Ok(SystemStats {
            total_processes: kernel.active_processes(),
            running_processes: count(ProcessState::Running),
            ready_processes: count(ProcessState::Ready),
            blocked_processes: count(ProcessState::Blocked),
            registered_programs: kernel.registered_programs(),
            scheduler: kernel.scheduler_stats(),
        })
    })
}
