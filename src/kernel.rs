// SPOS kernel: process lifecycle, dispatcher and memory front end
//
// `Kernel` owns every table. Each mutating operation runs inside the critical
// section, and `tick` refuses to dispatch while it is held, so the timer never
// sees a table half-updated.
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::{KernelConfig, DEFAULT_PRIORITY};
use crate::critical::{CriticalGuard, CriticalSection};
use crate::hal::{Clock, FatalSink, LogSink, ManualClock, NullTicker, TickSource};
use crate::memory::{AllocStrategy, Heap, HeapId, MemAddr, MemValue, Owner};
use crate::process::{
    Priority, Process, ProcessId, ProcessState, ProcessTable, Program, ProgramId, ProgramTable, RegisterFile,
    SchedulerStats, SchedulingInfo, SchedulingStrategy, StackArena, StackChecksum, IDLE_PROCESS, IDLE_PROGRAM,
};
use crate::{KernelError, KernelResult, Table};

/// What a dispatcher invocation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The critical section was held; nothing changed.
    Deferred,
    /// The current process keeps the CPU.
    Continued(ProcessId),
    Switched { from: ProcessId, to: ProcessId },
    /// The idle process is corrupt; the system stopped.
    Halted,
}

/// What brought the dispatcher in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Tick,
    Yield,
    Kill,
}

/// Body of the idle process. The board's idle loop calls `run_current`
/// repeatedly, so a single pass just returns.
fn idle(_: &mut Kernel) {}

pub struct Kernel {
    programs: ProgramTable,
    processes: ProcessTable,
    stacks: StackArena,
    /// Register state of whoever holds the CPU
    registers: RegisterFile,
    current: ProcessId,
    critical: Arc<CriticalSection>,
    strategy: SchedulingStrategy,
    info: SchedulingInfo,
    heaps: Vec<Heap>,
    clock: Box<dyn Clock>,
    fatal: Box<dyn FatalSink>,
    started: bool,
    halted: bool,
    total_switches: u64,
    total_ticks: u64,
    deferred_ticks: u64,
}

impl Kernel {
    /// Set up the heaps and the tables. The idle program is registered and
    /// started in slot 0; nothing runs before `start_scheduler`.
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        let heaps = config
            .heaps
            .iter()
            .map(Heap::with_ram)
            .collect::<KernelResult<Vec<_>>>()?;

        let mut kernel = Self {
            programs: ProgramTable::new(),
            processes: ProcessTable::new(),
            stacks: StackArena::new(),
            registers: RegisterFile::default(),
            current: IDLE_PROCESS,
            critical: Arc::new(CriticalSection::new(Box::new(NullTicker::default()))),
            strategy: config.scheduling,
            info: SchedulingInfo::new(config.tuning),
            heaps,
            clock: Box::new(ManualClock::new()),
            fatal: Box::new(LogSink),
            started: false,
            halted: false,
            total_switches: 0,
            total_ticks: 0,
            deferred_ticks: 0,
        };

        let program = kernel.register_program(Program::new(idle))?;
        debug_assert_eq!(program, IDLE_PROGRAM);
        let pid = kernel.exec(program, DEFAULT_PRIORITY)?;
        debug_assert_eq!(pid, IDLE_PROCESS);

        log::info!(
            "kernel initialized: {} heaps, {:?} scheduling",
            kernel.heaps.len(),
            kernel.strategy
        );
        Ok(kernel)
    }

    /// Replace the tick source. Call before anything enters the critical
    /// section.
    pub fn with_tick_source(mut self, ticker: Box<dyn TickSource>) -> Self {
        self.critical = Arc::new(CriticalSection::new(ticker));
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fatal_sink(mut self, sink: Box<dyn FatalSink>) -> Self {
        self.fatal = sink;
        self
    }

    fn guard(&mut self) -> CriticalGuard {
        let guard = CriticalSection::enter(&self.critical);
        if !guard.is_counted() {
            self.report(KernelError::GuardMisuse, "critical section nesting overflow");
        }
        guard
    }

    fn ensure_alive(&self) -> KernelResult<()> {
        if self.halted {
            Err(KernelError::Halted)
        } else {
            Ok(())
        }
    }

    fn report(&mut self, error: KernelError, reason: &str) {
        self.fatal.report(error, reason);
    }

    // ---- programs and processes ----

    pub fn register_program(&mut self, program: Program) -> KernelResult<ProgramId> {
        self.ensure_alive()?;
        let _guard = self.guard();
        let id = self.programs.register(program)?;
        log::debug!("registered program {} (autostart: {})", id, program.autostart);
        Ok(id)
    }

    pub fn check_autostart_program(&self, id: ProgramId) -> bool {
        self.programs.check_autostart(id)
    }

    /// Start `program` in the first free process slot.
    pub fn exec(&mut self, program: ProgramId, priority: Priority) -> KernelResult<ProcessId> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.programs.lookup(program)?;
        let pid = self
            .processes
            .first_unused()
            .ok_or(KernelError::TableFull(Table::Processes))?;

        let sp = self.stacks.prepare(pid);
        let checksum = self.stacks.checksum(pid, sp);
        let now = self.clock.precise();
        let slot = self.processes.get_mut(pid).ok_or(KernelError::NoSuchProcess)?;
        *slot = Process {
            pid,
            program,
            state: ProcessState::Ready,
            priority,
            sp,
            checksum,
            created_at: now,
            last_run: 0,
            cpu_ticks: 0,
        };
        self.info.reset_process(pid, priority);

        log::info!("exec program {} as process {} (priority {})", program, pid, priority);
        Ok(pid)
    }

    /// Terminate a process and reclaim its memory on every heap. Killing the
    /// current process dispatches before returning.
    pub fn kill(&mut self, pid: ProcessId) -> KernelResult<()> {
        self.ensure_alive()?;
        let guard = self.guard();
        self.processes.occupied(pid)?;
        if pid == IDLE_PROCESS {
            return Err(KernelError::ProtectedProcess);
        }

        let reclaimed = self.reap(pid);
        log::info!("killed process {} ({} bytes reclaimed)", pid, reclaimed);

        if pid == self.current && self.started {
            // The dead process cannot leave the sections it entered.
            self.critical.abandon();
            drop(guard);
            if self.dispatch(Trigger::Kill) == TickOutcome::Halted {
                return Err(KernelError::Halted);
            }
        }
        Ok(())
    }

    /// Clear a slot and free everything it owned.
    fn reap(&mut self, pid: ProcessId) -> usize {
        if let Some(slot) = self.processes.get_mut(pid) {
            *slot = Process::unused(pid);
        }
        self.info.forget(pid);
        self.free_process_memory(pid)
    }

    /// Exec every autostart program with the default priority. Returns the
    /// number of processes started.
    pub fn init_scheduler(&mut self) -> KernelResult<usize> {
        let autostart: Vec<ProgramId> = self
            .programs
            .iter()
            .filter(|(id, program)| *id != IDLE_PROGRAM && program.autostart)
            .map(|(id, _)| id)
            .collect();
        for &program in &autostart {
            self.exec(program, DEFAULT_PRIORITY)?;
        }
        Ok(autostart.len())
    }

    /// Hand the CPU to the idle process. Ticks before this are ignored.
    /// Starting twice is refused.
    pub fn start_scheduler(&mut self) -> KernelResult<()> {
        self.ensure_alive()?;
        if self.started {
            return Err(KernelError::AlreadyStarted);
        }
        let _guard = self.guard();
        self.switch_in(IDLE_PROCESS)?;
        self.current = IDLE_PROCESS;
        self.mark_running(IDLE_PROCESS);
        self.started = true;
        log::info!("scheduler started");
        Ok(())
    }

    /// Run the current process's program. Returning from a program ends its
    /// process; the idle program runs again on the next call.
    pub fn run_current(&mut self) -> KernelResult<()> {
        self.ensure_alive()?;
        let pid = self.current;
        let program = self.processes.occupied(pid)?.program;
        let entry = self.programs.lookup(program)?.entry;
        entry(self);

        if pid != IDLE_PROCESS && self.current == pid && self.processes.occupied(pid).is_ok() {
            self.kill(pid)?;
        }
        Ok(())
    }

    // ---- dispatcher ----

    /// Timer entry point.
    pub fn tick(&mut self) -> TickOutcome {
        if self.halted {
            return TickOutcome::Halted;
        }
        self.total_ticks += 1;
        if !self.started || self.critical.is_held() {
            self.deferred_ticks += 1;
            log::trace!("tick deferred");
            return TickOutcome::Deferred;
        }
        self.dispatch(Trigger::Tick)
    }

    /// Count ticks the timer dropped before they reached `tick`.
    pub fn record_deferred_ticks(&mut self, count: u64) {
        self.total_ticks += count;
        self.deferred_ticks += count;
    }

    /// Give up the rest of the time slice. The caller sits out the next
    /// selection.
    pub fn yield_now(&mut self) -> TickOutcome {
        if self.halted {
            return TickOutcome::Halted;
        }
        if !self.started {
            return TickOutcome::Deferred;
        }
        self.dispatch(Trigger::Yield)
    }

    fn dispatch(&mut self, trigger: Trigger) -> TickOutcome {
        let _guard = self.guard();
        let from = self.current;
        let mut outgoing = self.processes.occupied(from).is_ok();
        if let Some(process) = self.processes.get_mut(from) {
            match trigger {
                Trigger::Tick => process.cpu_ticks += 1,
                Trigger::Yield if from != IDLE_PROCESS => process.state = ProcessState::Blocked,
                _ => {}
            }
            if process.state == ProcessState::Running {
                process.state = ProcessState::Ready;
            }
        }

        loop {
            let next = self.strategy.select(self.processes.as_slice(), self.current, &mut self.info);
            for process in self.processes.iter_mut() {
                if process.state == ProcessState::Blocked {
                    process.state = ProcessState::Ready;
                }
            }

            if next == from && outgoing {
                self.mark_running(next);
                return TickOutcome::Continued(next);
            }
            if outgoing {
                self.save_context(from);
                outgoing = false;
            }

            match self.switch_in(next) {
                Ok(()) => {
                    self.current = next;
                    self.mark_running(next);
                    if next == from {
                        return TickOutcome::Continued(next);
                    }
                    self.total_switches += 1;
                    log::trace!("switch {} -> {}", from, next);
                    return TickOutcome::Switched { from, to: next };
                }
                Err(error) => {
                    self.report(error, "stack checksum mismatch on switch-in");
                    if next == IDLE_PROCESS {
                        self.halted = true;
                        log::error!("idle process corrupt, system halted");
                        return TickOutcome::Halted;
                    }
                    let reclaimed = self.reap(next);
                    log::warn!("halted process {} ({} bytes reclaimed)", next, reclaimed);
                }
            }
        }
    }

    fn save_context(&mut self, pid: ProcessId) {
        if let Some(process) = self.processes.get_mut(pid) {
            process.sp = self.stacks.save(pid, process.sp, &self.registers);
            process.checksum = self.stacks.checksum(pid, process.sp);
        }
    }

    /// Verify the stack of `pid` and load its registers.
    fn switch_in(&mut self, pid: ProcessId) -> KernelResult<()> {
        let process = *self.processes.occupied(pid)?;
        if self.stacks.checksum(pid, process.sp) != process.checksum {
            return Err(KernelError::StackCorruption);
        }
        let (registers, sp) = self.stacks.restore(pid, process.sp);
        self.registers = registers;
        if let Some(process) = self.processes.get_mut(pid) {
            process.sp = sp;
        }
        Ok(())
    }

    fn mark_running(&mut self, pid: ProcessId) {
        let now = self.clock.precise();
        if let Some(process) = self.processes.get_mut(pid) {
            process.state = ProcessState::Running;
            process.last_run = now;
        }
    }

    // ---- critical sections for programs ----

    pub fn enter_critical_section(&mut self) {
        if let Err(error) = self.critical.acquire() {
            self.report(error, "critical section nesting overflow");
        }
    }

    pub fn leave_critical_section(&mut self) {
        if let Err(error) = self.critical.release() {
            self.report(error, "critical section left more often than entered");
        }
    }

    pub fn critical_section(&self) -> &Arc<CriticalSection> {
        &self.critical
    }

    // ---- strategies ----

    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Switch strategy; all strategy metadata starts over.
    pub fn set_scheduling_strategy(&mut self, strategy: SchedulingStrategy) {
        let _guard = self.guard();
        self.strategy = strategy;
        self.info.reset(self.processes.as_slice());
        log::info!("scheduling strategy set to {:?}", strategy);
    }

    pub fn allocation_strategy(&self, heap: HeapId) -> KernelResult<AllocStrategy> {
        Ok(self.heap(heap)?.strategy())
    }

    pub fn set_allocation_strategy(&mut self, heap: HeapId, strategy: AllocStrategy) -> KernelResult<()> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.heap_mut(heap)?.set_strategy(strategy);
        Ok(())
    }

    // ---- memory ----

    pub fn heap(&self, heap: HeapId) -> KernelResult<&Heap> {
        self.heaps.get(heap).ok_or(KernelError::NoSuchHeap)
    }

    fn heap_mut(&mut self, heap: HeapId) -> KernelResult<&mut Heap> {
        self.heaps.get_mut(heap).ok_or(KernelError::NoSuchHeap)
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Allocate on behalf of the current process.
    pub fn malloc(&mut self, heap: HeapId, size: u16) -> KernelResult<MemAddr> {
        self.ensure_alive()?;
        let _guard = self.guard();
        let owner = self.current;
        self.heap_mut(heap)?.allocate(size, owner)
    }

    /// Free a chunk of the current process.
    pub fn free(&mut self, heap: HeapId, addr: MemAddr) -> KernelResult<()> {
        let requester = self.current;
        self.free_owner_restricted(heap, addr, requester)
    }

    pub fn free_owner_restricted(&mut self, heap: HeapId, addr: MemAddr, requester: ProcessId) -> KernelResult<()> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.heap_mut(heap)?.free_owner_restricted(addr, requester)
    }

    /// Free everything `pid` owns on every heap. Returns the bytes reclaimed.
    pub fn free_process_memory(&mut self, pid: ProcessId) -> usize {
        let _guard = self.guard();
        self.heaps.iter_mut().map(|heap| heap.free_process_memory(pid)).sum()
    }

    /// Resize a chunk of the current process; see [`Heap::resize`].
    pub fn realloc(&mut self, heap: HeapId, addr: MemAddr, size: u16) -> KernelResult<MemAddr> {
        self.ensure_alive()?;
        let _guard = self.guard();
        let requester = self.current;
        self.heap_mut(heap)?.resize(addr, size, requester)
    }

    fn check_private(&self, heap: HeapId, addr: MemAddr) -> KernelResult<()> {
        match self.heap(heap)?.owner_of(addr) {
            Some(Owner::Process(owner)) if owner == self.current => Ok(()),
            Some(_) => Err(KernelError::NotOwner),
            None => Err(KernelError::InvalidFree),
        }
    }

    /// Read from a chunk of the current process.
    pub fn read_bytes(&self, heap: HeapId, addr: MemAddr, offset: u16, buf: &mut [MemValue]) -> KernelResult<()> {
        self.check_private(heap, addr)?;
        self.heap(heap)?.read_bytes(addr, offset, buf)
    }

    /// Write into a chunk of the current process.
    pub fn write_bytes(&mut self, heap: HeapId, addr: MemAddr, offset: u16, data: &[MemValue]) -> KernelResult<()> {
        self.ensure_alive()?;
        self.check_private(heap, addr)?;
        let _guard = self.guard();
        self.heap_mut(heap)?.write_bytes(addr, offset, data)
    }

    pub fn sh_malloc(&mut self, heap: HeapId, size: u16) -> KernelResult<MemAddr> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.heap_mut(heap)?.sh_allocate(size)
    }

    pub fn sh_read_open(&mut self, heap: HeapId, addr: MemAddr) -> KernelResult<()> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.heap_mut(heap)?.sh_read_open(addr)
    }

    pub fn sh_write_open(&mut self, heap: HeapId, addr: MemAddr) -> KernelResult<()> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.heap_mut(heap)?.sh_write_open(addr)
    }

    pub fn sh_close(&mut self, heap: HeapId, addr: MemAddr) -> KernelResult<()> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.heap_mut(heap)?.sh_close(addr)
    }

    pub fn sh_read(&mut self, heap: HeapId, addr: MemAddr, offset: u16, buf: &mut [MemValue]) -> KernelResult<()> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.heap_mut(heap)?.sh_read(addr, offset, buf)
    }

    pub fn sh_write(&mut self, heap: HeapId, addr: MemAddr, offset: u16, data: &[MemValue]) -> KernelResult<()> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.heap_mut(heap)?.sh_write(addr, offset, data)
    }

    pub fn sh_free(&mut self, heap: HeapId, addr: MemAddr) -> KernelResult<()> {
        self.ensure_alive()?;
        let _guard = self.guard();
        self.heap_mut(heap)?.sh_free(addr)
    }

    // ---- queries ----

    pub fn current_process(&self) -> ProcessId {
        self.current
    }

    pub fn active_processes(&self) -> usize {
        self.processes.active_count()
    }

    pub fn registered_programs(&self) -> usize {
        self.programs.count()
    }

    pub fn process(&self, pid: ProcessId) -> KernelResult<&Process> {
        self.processes.occupied(pid)
    }

    pub fn processes(&self) -> &[Process] {
        self.processes.as_slice()
    }

    pub fn program(&self, id: ProgramId) -> KernelResult<&Program> {
        self.programs.lookup(id)
    }

    /// Fresh checksum over the used part of the stack of `pid`
    pub fn stack_checksum(&self, pid: ProcessId) -> KernelResult<StackChecksum> {
        let process = self.processes.occupied(pid)?;
        Ok(self.stacks.checksum(pid, process.sp))
    }

    pub fn scheduling_info(&self) -> &SchedulingInfo {
        &self.info
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        SchedulerStats {
            current_process: self.current,
            strategy: self.strategy,
            total_switches: self.total_switches,
            total_ticks: self.total_ticks,
            deferred_ticks: self.deferred_ticks,
        }
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeapConfig, MAX_NUMBER_OF_PROCESSES};
    use spin::Mutex;

    fn noop(_: &mut Kernel) {}

    fn allocating(kernel: &mut Kernel) {
        kernel.malloc(0, 16).unwrap();
        kernel.malloc(1, 32).unwrap();
    }

    fn suicidal(kernel: &mut Kernel) {
        let pid = kernel.current_process();
        kernel.kill(pid).unwrap();
    }

    #[derive(Clone)]
    struct Recorder(Arc<Mutex<Vec<KernelError>>>);

    impl Recorder {
        fn new() -> Self {
            Recorder(Arc::new(Mutex::new(Vec::new())))
        }
    }

    impl FatalSink for Recorder {
        fn report(&mut self, error: KernelError, _reason: &str) {
            self.0.lock().push(error);
        }
    }

    fn config(strategy: SchedulingStrategy) -> KernelConfig {
        KernelConfig::default()
            .with_scheduling(strategy)
            .with_heaps(alloc::vec![HeapConfig::new("a", 8, 128), HeapConfig::new("b", 8, 256)])
    }

    /// Started kernel with `count` ready noop processes and a fatal recorder.
    fn kernel(strategy: SchedulingStrategy, count: usize) -> (Kernel, Recorder) {
        let recorder = Recorder::new();
        let mut kernel = Kernel::new(config(strategy))
            .unwrap()
            .with_fatal_sink(Box::new(recorder.clone()));
        let program = kernel.register_program(Program::new(noop)).unwrap();
        for _ in 0..count {
            kernel.exec(program, 10).unwrap();
        }
        kernel.start_scheduler().unwrap();
        (kernel, recorder)
    }

    fn ticks(kernel: &mut Kernel, rounds: usize) -> Vec<ProcessId> {
        (0..rounds)
            .map(|_| {
                kernel.tick();
                kernel.current_process()
            })
            .collect()
    }

    #[test]
    fn idle_process_occupies_slot_zero() {
        let (kernel, _) = kernel(SchedulingStrategy::Even, 0);
        assert_eq!(kernel.current_process(), IDLE_PROCESS);
        assert_eq!(kernel.active_processes(), 1);
        assert_eq!(kernel.registered_programs(), 2);
        assert_eq!(kernel.process(IDLE_PROCESS).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn exec_fills_the_process_table() {
        let (mut kernel, _) = kernel(SchedulingStrategy::Even, 0);
        for expected in 1..MAX_NUMBER_OF_PROCESSES {
            assert_eq!(kernel.exec(1, 5), Ok(expected as ProcessId));
        }
        assert_eq!(kernel.exec(1, 5), Err(KernelError::TableFull(Table::Processes)));
        assert_eq!(kernel.exec(9, 5), Err(KernelError::NoSuchProgram));
    }

    #[test]
    fn exec_lays_out_a_verifiable_stack() {
        let (mut kernel, _) = kernel(SchedulingStrategy::Even, 0);
        let pid = kernel.exec(1, 5).unwrap();
        let process = *kernel.process(pid).unwrap();
        assert_eq!(process.state, ProcessState::Ready);
        assert_eq!(kernel.stack_checksum(pid), Ok(process.checksum));
    }

    #[test]
    fn kill_guards_idle_and_free_slots() {
        let (mut kernel, _) = kernel(SchedulingStrategy::Even, 1);
        assert_eq!(kernel.kill(IDLE_PROCESS), Err(KernelError::ProtectedProcess));
        assert_eq!(kernel.kill(5), Err(KernelError::NoSuchProcess));
        assert_eq!(kernel.kill(1), Ok(()));
        assert_eq!(kernel.kill(1), Err(KernelError::NoSuchProcess));
    }

    #[test]
    fn round_robin_dispatch() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 3);
        assert_eq!(ticks(&mut kernel, 5), [1, 2, 3, 1, 2]);
        let stats = kernel.scheduler_stats();
        assert_eq!(stats.total_ticks, 5);
        assert_eq!(stats.total_switches, 5);
        assert_eq!(kernel.processes().iter().filter(|p| p.state == ProcessState::Running).count(), 1);
    }

    #[test]
    fn ticks_before_start_are_deferred() {
        let mut kernel = Kernel::new(config(SchedulingStrategy::RoundRobin)).unwrap();
        assert_eq!(kernel.tick(), TickOutcome::Deferred);
        assert!(!kernel.is_started());
    }

    #[test]
    fn tick_is_deferred_inside_critical_section() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 2);
        kernel.enter_critical_section();
        assert_eq!(kernel.tick(), TickOutcome::Deferred);
        assert_eq!(kernel.current_process(), IDLE_PROCESS);
        kernel.leave_critical_section();
        assert_eq!(kernel.tick(), TickOutcome::Switched { from: 0, to: 1 });
        assert_eq!(kernel.scheduler_stats().deferred_ticks, 1);
    }

    #[test]
    fn registers_survive_a_round_trip() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 2);
        kernel.tick();
        assert_eq!(kernel.current_process(), 1);
        kernel.registers_mut().general[0] = 0xAA;
        kernel.registers_mut().pc = 0x0100;

        kernel.tick();
        assert_eq!(kernel.current_process(), 2);
        assert_eq!(kernel.registers().general[0], 0);
        assert_eq!(kernel.registers().pc, crate::process::LAUNCH_VECTOR);

        kernel.tick();
        assert_eq!(kernel.current_process(), 1);
        assert_eq!(kernel.registers().general[0], 0xAA);
        assert_eq!(kernel.registers().pc, 0x0100);
    }

    #[test]
    fn yield_sits_out_one_round() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RunToCompletion, 1);
        kernel.tick();
        assert_eq!(kernel.current_process(), 1);
        assert_eq!(kernel.yield_now(), TickOutcome::Switched { from: 1, to: 0 });
        assert_eq!(kernel.process(1).unwrap().state, ProcessState::Ready);
        assert_eq!(kernel.tick(), TickOutcome::Switched { from: 0, to: 1 });
    }

    #[test]
    fn corrupt_stack_halts_the_process() {
        let (mut kernel, recorder) = kernel(SchedulingStrategy::RoundRobin, 2);
        kernel.tick();
        kernel.malloc(0, 8).unwrap();
        kernel.tick();
        assert_eq!(kernel.current_process(), 2);

        kernel.stacks.region_mut(1)[StackArena::bottom()] ^= 0xFF;
        assert_eq!(kernel.tick(), TickOutcome::Continued(2));
        assert_eq!(recorder.0.lock().as_slice(), [KernelError::StackCorruption]);
        assert_eq!(kernel.process(1).err(), Some(KernelError::NoSuchProcess));
        assert_eq!(kernel.heap(0).unwrap().owned_bytes(1), 0);
        assert!(!kernel.is_halted());
    }

    #[test]
    fn corrupt_idle_stack_halts_the_system() {
        let (mut kernel, recorder) = kernel(SchedulingStrategy::RoundRobin, 1);
        kernel.tick();
        kernel.stacks.region_mut(IDLE_PROCESS)[StackArena::bottom()] ^= 0x01;
        assert_eq!(kernel.yield_now(), TickOutcome::Halted);
        assert!(kernel.is_halted());
        assert_eq!(kernel.tick(), TickOutcome::Halted);
        assert_eq!(kernel.exec(1, 1), Err(KernelError::Halted));
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[test]
    fn returning_program_is_terminated_and_reclaimed() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 0);
        let program = kernel.register_program(Program::new(allocating)).unwrap();
        let pid = kernel.exec(program, 10).unwrap();
        kernel.tick();
        assert_eq!(kernel.current_process(), pid);

        kernel.run_current().unwrap();
        assert_eq!(kernel.process(pid).err(), Some(KernelError::NoSuchProcess));
        assert_eq!(kernel.current_process(), IDLE_PROCESS);
        assert_eq!(kernel.heap(0).unwrap().used_bytes(), 0);
        assert_eq!(kernel.heap(1).unwrap().used_bytes(), 0);
    }

    #[test]
    fn program_may_kill_itself() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 1);
        let program = kernel.register_program(Program::new(suicidal)).unwrap();
        let pid = kernel.exec(program, 10).unwrap();
        kernel.tick();
        kernel.tick();
        assert_eq!(kernel.current_process(), pid);
        assert_eq!(kernel.run_current(), Ok(()));
        assert_eq!(kernel.process(pid).err(), Some(KernelError::NoSuchProcess));
        assert_eq!(kernel.current_process(), 1);
        assert!(!kernel.critical_section().is_held());
    }

    #[test]
    fn idle_program_never_terminates() {
        let (mut kernel, _) = kernel(SchedulingStrategy::Even, 0);
        kernel.run_current().unwrap();
        assert_eq!(kernel.process(IDLE_PROCESS).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn autostart_programs_start_at_init() {
        let mut kernel = Kernel::new(config(SchedulingStrategy::Even)).unwrap();
        kernel.register_program(Program::autostart(noop)).unwrap();
        kernel.register_program(Program::new(noop)).unwrap();
        kernel.register_program(Program::autostart(noop)).unwrap();
        assert!(kernel.check_autostart_program(1));
        assert!(!kernel.check_autostart_program(2));
        assert_eq!(kernel.init_scheduler(), Ok(2));
        assert_eq!(kernel.active_processes(), 3);
        assert_eq!(kernel.process(2).unwrap().program, 3);
        assert_eq!(kernel.process(2).unwrap().priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn free_is_restricted_to_owner() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 2);
        kernel.tick();
        let addr = kernel.malloc(0, 10).unwrap();
        kernel.write_bytes(0, addr, 0, &[1, 2, 3]).unwrap();
        kernel.tick();
        assert_eq!(kernel.free(0, addr), Err(KernelError::NotOwner));
        let mut buf = [0; 3];
        assert_eq!(kernel.read_bytes(0, addr, 0, &mut buf), Err(KernelError::NotOwner));
        assert_eq!(kernel.free_owner_restricted(0, addr, 1), Ok(()));
        assert_eq!(kernel.malloc(7, 1), Err(KernelError::NoSuchHeap));
    }

    #[test]
    fn kill_reclaims_on_every_heap() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 2);
        kernel.tick();
        kernel.malloc(0, 10).unwrap();
        kernel.malloc(1, 20).unwrap();
        kernel.sh_malloc(1, 4).unwrap();
        kernel.tick();
        kernel.kill(1).unwrap();
        assert_eq!(kernel.heap(0).unwrap().used_bytes(), 0);
        assert_eq!(kernel.heap(1).unwrap().used_bytes(), 4);
        assert_eq!(kernel.current_process(), 2);
    }

    #[test]
    fn realloc_moves_the_callers_chunk() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 1);
        kernel.tick();
        let a = kernel.malloc(0, 4).unwrap();
        kernel.malloc(0, 4).unwrap();
        kernel.write_bytes(0, a, 0, &[5, 6, 7, 8]).unwrap();
        let moved = kernel.realloc(0, a, 16).unwrap();
        assert_ne!(moved, a);
        let mut buf = [0; 4];
        kernel.read_bytes(0, moved, 0, &mut buf).unwrap();
        assert_eq!(buf, [5, 6, 7, 8]);
    }

    #[test]
    fn strategy_switch_resets_metadata() {
        let (mut kernel, _) = kernel(SchedulingStrategy::InactiveAging, 2);
        kernel.tick();
        assert!(kernel.scheduling_info().age(2) > 0);
        kernel.set_scheduling_strategy(SchedulingStrategy::RoundRobin);
        assert_eq!(kernel.scheduling_info().age(2), 0);
        assert_eq!(kernel.scheduling_strategy(), SchedulingStrategy::RoundRobin);

        kernel.set_allocation_strategy(1, AllocStrategy::BestFit).unwrap();
        assert_eq!(kernel.allocation_strategy(1), Ok(AllocStrategy::BestFit));
        assert_eq!(kernel.allocation_strategy(2), Err(KernelError::NoSuchHeap));
    }

    #[test]
    fn unbalanced_leave_is_reported() {
        let (mut kernel, recorder) = kernel(SchedulingStrategy::Even, 0);
        kernel.leave_critical_section();
        assert_eq!(recorder.0.lock().as_slice(), [KernelError::GuardMisuse]);
        assert_eq!(kernel.critical_section().depth(), 0);
    }

    #[test]
    fn second_start_is_refused() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 1);
        kernel.tick();
        assert_eq!(kernel.start_scheduler(), Err(KernelError::AlreadyStarted));
        assert_eq!(kernel.current_process(), 1);
        let running: Vec<ProcessId> = kernel
            .processes()
            .iter()
            .filter(|p| p.state == ProcessState::Running)
            .map(|p| p.pid)
            .collect();
        assert_eq!(running, [1]);
    }

    #[test]
    fn only_timer_ticks_are_charged() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 2);
        kernel.tick();
        kernel.tick();
        assert_eq!(kernel.current_process(), 2);
        assert_eq!(kernel.process(1).unwrap().cpu_ticks, 1);

        kernel.yield_now();
        assert_eq!(kernel.process(2).unwrap().cpu_ticks, 0);
        assert_eq!(kernel.process(2).unwrap().state, ProcessState::Ready);

        assert_eq!(kernel.current_process(), 1);
        kernel.kill(1).unwrap();
        assert_eq!(kernel.current_process(), 2);
        assert_eq!(kernel.process(2).unwrap().cpu_ticks, 0);
        assert!(!kernel.critical_section().is_held());
    }

    #[test]
    fn halted_kernel_refuses_mutation() {
        let (mut kernel, _) = kernel(SchedulingStrategy::RoundRobin, 1);
        kernel.tick();
        let addr = kernel.malloc(0, 8).unwrap();
        kernel.stacks.region_mut(IDLE_PROCESS)[StackArena::bottom()] ^= 0x01;
        assert_eq!(kernel.yield_now(), TickOutcome::Halted);

        assert_eq!(kernel.register_program(Program::new(noop)), Err(KernelError::Halted));
        assert_eq!(kernel.kill(1), Err(KernelError::Halted));
        assert_eq!(kernel.malloc(0, 4), Err(KernelError::Halted));
        assert_eq!(kernel.free_owner_restricted(0, addr, 1), Err(KernelError::Halted));
        assert_eq!(kernel.realloc(0, addr, 16), Err(KernelError::Halted));
        assert_eq!(kernel.sh_malloc(1, 4), Err(KernelError::Halted));
        assert_eq!(kernel.set_allocation_strategy(0, AllocStrategy::BestFit), Err(KernelError::Halted));
        assert_eq!(kernel.registered_programs(), 2);
        assert_eq!(kernel.heap(0).unwrap().used_bytes(), 8);
        assert_eq!(kernel.heap(1).unwrap().used_bytes(), 0);
    }

    #[test]
    fn guard_overflow_reaches_the_fatal_sink() {
        let (mut kernel, recorder) = kernel(SchedulingStrategy::Even, 0);
        for _ in 0..u8::MAX {
            kernel.enter_critical_section();
        }
        assert!(recorder.0.lock().is_empty());

        assert!(kernel.malloc(0, 4).is_ok());
        assert_eq!(recorder.0.lock().as_slice(), [KernelError::GuardMisuse]);
        assert_eq!(kernel.critical_section().depth(), u8::MAX);

        for _ in 0..u8::MAX {
            kernel.leave_critical_section();
        }
        assert_eq!(kernel.critical_section().depth(), 0);
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[test]
    fn bookkeeping_uses_the_clock() {
        let clock = ManualClock::new();
        let mut kernel = Kernel::new(config(SchedulingStrategy::RoundRobin))
            .unwrap()
            .with_clock(Box::new(clock.clone()));
        kernel.exec(0, 1).unwrap();
        kernel.start_scheduler().unwrap();
        clock.advance(500);
        kernel.tick();
        kernel.tick();
        let process = kernel.process(1).unwrap();
        assert_eq!(process.last_run, 500);
        assert_eq!(process.cpu_ticks, 1);
    }
}
