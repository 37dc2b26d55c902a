// Process Management Module for SPOS
pub mod context;
pub mod pcb;
pub mod scheduler;

pub use context::{RegisterFile, StackArena, LAUNCH_VECTOR};
pub use pcb::{
    Priority, Process, ProcessId, ProcessState, ProcessTable, Program, ProgramFn, ProgramId, ProgramTable,
    StackChecksum, IDLE_PROCESS, IDLE_PROGRAM,
};
pub use scheduler::{SchedulerStats, SchedulingInfo, SchedulingStrategy};
