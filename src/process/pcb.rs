// Process Control Block (PCB) and program registry for SPOS
use core::fmt;

use crate::config::{MAX_NUMBER_OF_PROCESSES, MAX_NUMBER_OF_PROGRAMS};
use crate::kernel::Kernel;
use crate::{KernelError, KernelResult, Table};

/// Process ID type, an index into the process table
pub type ProcessId = u8;

/// Program ID type, an index into the program table
pub type ProgramId = u8;

/// 0 means least favourable, 255 most favourable
pub type Priority = u8;

/// XOR over the used part of a process stack
pub type StackChecksum = u8;

/// Slot of the idle process, which is never killed
pub const IDLE_PROCESS: ProcessId = 0;

/// Slot of the idle program
pub const IDLE_PROGRAM: ProgramId = 0;

/// Entry point of a program. Returning from it terminates the process.
pub type ProgramFn = fn(&mut Kernel);

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    Unused,   // Slot is free
    Ready,    // Ready to run, waiting for CPU
    Running,  // Currently executing
    Blocked,  // Sits out the next scheduling round
}

/// Statically registered program
#[derive(Clone, Copy)]
pub struct Program {
    pub entry: ProgramFn,
    pub autostart: bool,
}

impl Program {
    pub const fn new(entry: ProgramFn) -> Self {
        Self { entry, autostart: false }
    }

    /// Program that `Kernel::init_scheduler` starts at bring-up
    pub const fn autostart(entry: ProgramFn) -> Self {
        Self { entry, autostart: true }
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Program")
            .field("entry", &(self.entry as usize as *const ()))
            .field("autostart", &self.autostart)
            .finish()
    }
}

/// Process Control Block (PCB)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Process {
    pub pid: ProcessId,
    pub program: ProgramId,
    pub state: ProcessState,
    pub priority: Priority,
    /// Saved stack pointer, an offset into the process's stack region
    pub sp: usize,
    /// Checksum stored when the process was last switched out
    pub checksum: StackChecksum,
    pub created_at: u64,
    pub last_run: u64,
    pub cpu_ticks: u64,
}

impl Process {
    pub const fn unused(pid: ProcessId) -> Self {
        Self {
            pid,
            program: IDLE_PROGRAM,
            state: ProcessState::Unused,
            priority: 0,
            sp: 0,
            checksum: 0,
            created_at: 0,
            last_run: 0,
            cpu_ticks: 0,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.state != ProcessState::Unused
    }

    /// Ready or running
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, ProcessState::Ready | ProcessState::Running)
    }
}

/// Fixed-capacity process table. Slot index and ProcessID coincide.
#[derive(Debug, Clone)]
pub struct ProcessTable {
    slots: [Process; MAX_NUMBER_OF_PROCESSES],
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|i| Process::unused(i as ProcessId)),
        }
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.slots.get(pid as usize)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.slots.get_mut(pid as usize)
    }

    /// Occupied slot or `NoSuchProcess`
    pub fn occupied(&self, pid: ProcessId) -> KernelResult<&Process> {
        self.get(pid)
            .filter(|process| process.is_occupied())
            .ok_or(KernelError::NoSuchProcess)
    }

    pub fn as_slice(&self) -> &[Process] {
        &self.slots
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Process> {
        self.slots.iter_mut()
    }

    pub fn first_unused(&self) -> Option<ProcessId> {
        self.slots
            .iter()
            .position(|process| !process.is_occupied())
            .map(|slot| slot as ProcessId)
    }

    /// Number of slots that are not unused
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|process| process.is_occupied()).count()
    }

    pub fn running_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|process| process.state == ProcessState::Running)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity program table; programs are never unregistered.
#[derive(Debug, Clone)]
pub struct ProgramTable {
    slots: [Option<Program>; MAX_NUMBER_OF_PROGRAMS],
}

impl ProgramTable {
    pub fn new() -> Self {
        Self {
            slots: [None; MAX_NUMBER_OF_PROGRAMS],
        }
    }

    /// Insert into the first free slot
    pub fn register(&mut self, program: Program) -> KernelResult<ProgramId> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::TableFull(Table::Programs))?;
        self.slots[slot] = Some(program);
        Ok(slot as ProgramId)
    }

    pub fn lookup(&self, id: ProgramId) -> KernelResult<&Program> {
        self.slots
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(KernelError::NoSuchProgram)
    }

    pub fn check_autostart(&self, id: ProgramId) -> bool {
        self.lookup(id).map(|program| program.autostart).unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProgramId, &Program)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|program| (id as ProgramId, program)))
    }
}

impl Default for ProgramTable {
    fn default() -> Self {
        Self::new()
    }
}
