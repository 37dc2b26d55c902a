// Scheduling strategies for SPOS
//
// A strategy only decides which process runs next. Switching stacks and
// updating the process table is the dispatcher's job (`Kernel::tick`).
use alloc::collections::VecDeque;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::{SchedulerTuning, MLFQ_LEVELS, MAX_NUMBER_OF_PROCESSES};
use crate::process::pcb::{Priority, Process, ProcessId, IDLE_PROCESS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    Even,
    Random,
    RunToCompletion,
    RoundRobin,
    InactiveAging,
    MultiLevelFeedbackQueue,
}

impl SchedulingStrategy {
    pub const ALL: [SchedulingStrategy; 6] = [
        SchedulingStrategy::Even,
        SchedulingStrategy::Random,
        SchedulingStrategy::RunToCompletion,
        SchedulingStrategy::RoundRobin,
        SchedulingStrategy::InactiveAging,
        SchedulingStrategy::MultiLevelFeedbackQueue,
    ];

    /// Pick the process to run next. `processes` is indexed by ProcessID;
    /// the idle process is returned when nothing else is ready.
    pub fn select(self, processes: &[Process], current: ProcessId, info: &mut SchedulingInfo) -> ProcessId {
        match self {
            SchedulingStrategy::Even => info.select_even(processes, current),
            SchedulingStrategy::Random => info.select_random(processes),
            SchedulingStrategy::RunToCompletion => select_run_to_completion(processes, current),
            SchedulingStrategy::RoundRobin => next_cyclic(processes, current).unwrap_or(IDLE_PROCESS),
            SchedulingStrategy::InactiveAging => info.select_inactive_aging(processes, current),
            SchedulingStrategy::MultiLevelFeedbackQueue => info.select_mlfq(processes),
        }
    }
}

/// Blocked and unused processes never run; the idle process is the fallback.
fn eligible(process: &Process) -> bool {
    process.pid != IDLE_PROCESS && process.is_runnable()
}

fn is_eligible(processes: &[Process], pid: ProcessId) -> bool {
    processes.get(pid as usize).map_or(false, eligible)
}

/// First eligible process after `current`, wrapping around the table.
/// `current` itself is the last candidate.
fn next_cyclic(processes: &[Process], current: ProcessId) -> Option<ProcessId> {
    let len = processes.len();
    (1..=len)
        .map(|offset| (current as usize + offset) % len)
        .find(|&slot| eligible(&processes[slot]))
        .map(|slot| slot as ProcessId)
}

fn select_run_to_completion(processes: &[Process], current: ProcessId) -> ProcessId {
    if is_eligible(processes, current) {
        return current;
    }
    processes
        .iter()
        .find(|process| eligible(process))
        .map_or(IDLE_PROCESS, |process| process.pid)
}

/// Strategy-private bookkeeping, indexed by ProcessID.
#[derive(Debug, Clone)]
pub struct SchedulingInfo {
    tuning: SchedulerTuning,
    rng: SmallRng,
    /// Even: consecutive turns the current process has left
    turns_left: u16,
    /// Inactive aging: credit gathered while being passed over
    age: [u32; MAX_NUMBER_OF_PROCESSES],
    /// MLFQ: one queue per level, level 0 is served first
    queues: [VecDeque<ProcessId>; MLFQ_LEVELS],
    /// MLFQ: turns left in the current level
    slices: [u8; MAX_NUMBER_OF_PROCESSES],
}

impl SchedulingInfo {
    pub fn new(tuning: SchedulerTuning) -> Self {
        Self {
            tuning,
            rng: SmallRng::seed_from_u64(tuning.random_seed),
            turns_left: 0,
            age: [0; MAX_NUMBER_OF_PROCESSES],
            queues: core::array::from_fn(|_| VecDeque::with_capacity(MAX_NUMBER_OF_PROCESSES)),
            slices: [0; MAX_NUMBER_OF_PROCESSES],
        }
    }

    pub fn tuning(&self) -> SchedulerTuning {
        self.tuning
    }

    /// Reinitialize the metadata of every process, e.g. on a strategy switch.
    pub fn reset(&mut self, processes: &[Process]) {
        self.turns_left = 0;
        self.age = [0; MAX_NUMBER_OF_PROCESSES];
        self.slices = [0; MAX_NUMBER_OF_PROCESSES];
        self.queues.iter_mut().for_each(VecDeque::clear);
        for process in processes.iter().filter(|process| process.is_occupied()) {
            self.admit(process.pid, process.priority);
        }
    }

    /// Reinitialize one process's metadata after it was created.
    pub fn reset_process(&mut self, pid: ProcessId, priority: Priority) {
        self.forget(pid);
        self.admit(pid, priority);
    }

    /// Drop every trace of a process that left the table.
    pub fn forget(&mut self, pid: ProcessId) {
        if let Some(age) = self.age.get_mut(pid as usize) {
            *age = 0;
        }
        if let Some(slice) = self.slices.get_mut(pid as usize) {
            *slice = 0;
        }
        for queue in self.queues.iter_mut() {
            queue.retain(|&queued| queued != pid);
        }
    }

    pub fn age(&self, pid: ProcessId) -> u32 {
        self.age.get(pid as usize).copied().unwrap_or(0)
    }

    /// MLFQ level a process is queued in
    pub fn level_of(&self, pid: ProcessId) -> Option<usize> {
        self.queues.iter().position(|queue| queue.contains(&pid))
    }

    fn admit(&mut self, pid: ProcessId, priority: Priority) {
        if pid == IDLE_PROCESS {
            return;
        }
        let level = initial_level(priority);
        self.queues[level].push_back(pid);
        self.slices[pid as usize] = level_slice(level);
    }

    fn even_turns(&self, priority: Priority) -> u16 {
        u16::from(priority) / u16::from(self.tuning.even_divisor.max(1)) + 1
    }

    fn select_even(&mut self, processes: &[Process], current: ProcessId) -> ProcessId {
        if self.turns_left > 0 && is_eligible(processes, current) {
            self.turns_left -= 1;
            return current;
        }
        match next_cyclic(processes, current) {
            Some(next) => {
                self.turns_left = self.even_turns(processes[next as usize].priority) - 1;
                next
            }
            None => {
                self.turns_left = 0;
                IDLE_PROCESS
            }
        }
    }

    fn select_random(&mut self, processes: &[Process]) -> ProcessId {
        let weight = |process: &Process| u32::from(process.priority) + 1;
        let total: u32 = processes.iter().filter(|p| eligible(p)).map(weight).sum();
        if total == 0 {
            return IDLE_PROCESS;
        }
        let mut ticket = self.rng.gen_range(0..total);
        for process in processes.iter().filter(|p| eligible(p)) {
            if ticket < weight(process) {
                return process.pid;
            }
            ticket -= weight(process);
        }
        IDLE_PROCESS
    }

    fn select_inactive_aging(&mut self, processes: &[Process], current: ProcessId) -> ProcessId {
        for process in processes.iter().filter(|p| eligible(p) && p.pid != current) {
            let credit = u32::from(process.priority) + u32::from(self.tuning.aging_credit);
            let age = &mut self.age[process.pid as usize];
            *age = age.saturating_add(credit);
        }

        let score = |process: &Process| u32::from(process.priority).saturating_add(self.age[process.pid as usize]);
        let mut best: Option<&Process> = None;
        for process in processes.iter().filter(|p| eligible(p)) {
            let better = match best {
                None => true,
                Some(leader) => (score(process), process.priority) > (score(leader), leader.priority),
            };
            if better {
                best = Some(process);
            }
        }

        match best {
            Some(process) => {
                self.age[process.pid as usize] = 0;
                process.pid
            }
            None => IDLE_PROCESS,
        }
    }

    fn select_mlfq(&mut self, processes: &[Process]) -> ProcessId {
        for level in 0..MLFQ_LEVELS {
            let queue = &mut self.queues[level];
            queue.retain(|&pid| processes.get(pid as usize).map_or(false, Process::is_occupied));
            let Some(position) = queue.iter().position(|&pid| is_eligible(processes, pid)) else {
                continue;
            };
            // Blocked entries in front of the chosen one move to the back.
            queue.rotate_left(position);
            let pid = queue[0];

            let slice = &mut self.slices[pid as usize];
            *slice = slice.saturating_sub(1);
            if *slice == 0 {
                queue.pop_front();
                let demoted = (level + 1).min(MLFQ_LEVELS - 1);
                self.queues[demoted].push_back(pid);
                self.slices[pid as usize] = level_slice(demoted);
            }
            return pid;
        }
        IDLE_PROCESS
    }
}

/// Higher priorities start in lower (earlier served) levels.
fn initial_level(priority: Priority) -> usize {
    MLFQ_LEVELS - 1 - (priority as usize >> 6)
}

fn level_slice(level: usize) -> u8 {
    1 << level
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub current_process: ProcessId,
    pub strategy: SchedulingStrategy,
    pub total_switches: u64,
    pub total_ticks: u64,
    pub deferred_ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::{ProcessState, ProcessTable};
    use alloc::vec::Vec;

    /// Table with the idle process plus ready processes of the given
    /// priorities in slots 1, 2, ...
    fn table(priorities: &[Priority]) -> ProcessTable {
        let mut table = ProcessTable::new();
        table.get_mut(IDLE_PROCESS).unwrap().state = ProcessState::Ready;
        for (slot, &priority) in priorities.iter().enumerate() {
            let process = table.get_mut(slot as ProcessId + 1).unwrap();
            process.state = ProcessState::Ready;
            process.priority = priority;
        }
        table
    }

    fn run(strategy: SchedulingStrategy, table: &ProcessTable, start: ProcessId, rounds: usize) -> Vec<ProcessId> {
        let mut info = SchedulingInfo::new(SchedulerTuning::default());
        info.reset(table.as_slice());
        let mut current = start;
        (0..rounds)
            .map(|_| {
                current = strategy.select(table.as_slice(), current, &mut info);
                current
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_through_ready_processes() {
        let table = table(&[10, 10, 10]);
        assert_eq!(
            run(SchedulingStrategy::RoundRobin, &table, 1, 7),
            [2, 3, 1, 2, 3, 1, 2]
        );
    }

    #[test]
    fn round_robin_skips_blocked_and_unused() {
        let mut table = table(&[10, 10, 10, 10]);
        table.get_mut(2).unwrap().state = ProcessState::Blocked;
        table.get_mut(3).unwrap().state = ProcessState::Unused;
        assert_eq!(run(SchedulingStrategy::RoundRobin, &table, 1, 4), [4, 1, 4, 1]);
    }

    #[test]
    fn run_to_completion_sticks_with_current() {
        let table = table(&[10, 10, 10]);
        assert_eq!(run(SchedulingStrategy::RunToCompletion, &table, 1, 5), [1; 5]);
    }

    #[test]
    fn run_to_completion_picks_lowest_after_termination() {
        let mut table = table(&[10, 10, 10]);
        table.get_mut(1).unwrap().state = ProcessState::Unused;
        assert_eq!(run(SchedulingStrategy::RunToCompletion, &table, 1, 3), [2, 2, 2]);
    }

    #[test]
    fn idle_runs_when_nothing_is_ready() {
        let mut table = table(&[10]);
        table.get_mut(1).unwrap().state = ProcessState::Blocked;
        for strategy in SchedulingStrategy::ALL {
            assert_eq!(run(strategy, &table, 1, 1), [IDLE_PROCESS], "{:?}", strategy);
        }
    }

    #[test]
    fn even_grants_turns_proportional_to_priority() {
        // divisor 32: priority 64 earns three turns, priority 0 one.
        let table = table(&[64, 0]);
        assert_eq!(run(SchedulingStrategy::Even, &table, 0, 8), [1, 1, 1, 2, 1, 1, 1, 2]);
    }

    #[test]
    fn random_only_picks_ready_processes() {
        let mut table = table(&[10, 200, 10]);
        table.get_mut(3).unwrap().state = ProcessState::Blocked;
        let picks = run(SchedulingStrategy::Random, &table, 0, 400);
        assert!(picks.iter().all(|&pid| pid == 1 || pid == 2));
        let favoured = picks.iter().filter(|&&pid| pid == 2).count();
        assert!(favoured > 300, "priority 200 picked only {} times", favoured);
    }

    #[test]
    fn inactive_aging_prevents_starvation() {
        let table = table(&[10, 1]);
        let picks = run(SchedulingStrategy::InactiveAging, &table, 0, 12);
        assert_eq!(picks[0], 1);
        assert!(picks.contains(&2));
        assert!(picks.iter().filter(|&&pid| pid == 1).count() > picks.iter().filter(|&&pid| pid == 2).count());
    }

    #[test]
    fn inactive_aging_resets_the_winner() {
        let table = table(&[5, 5]);
        let mut info = SchedulingInfo::new(SchedulerTuning::default());
        info.reset(table.as_slice());
        let first = SchedulingStrategy::InactiveAging.select(table.as_slice(), IDLE_PROCESS, &mut info);
        // Equal score and priority: lowest ProcessID wins.
        assert_eq!(first, 1);
        assert_eq!(info.age(1), 0);
        assert_eq!(info.age(2), 6);
    }

    #[test]
    fn mlfq_demotes_after_slice() {
        // priority 255 starts at level 0 with a single turn.
        let table = table(&[255, 0]);
        let mut info = SchedulingInfo::new(SchedulerTuning::default());
        info.reset(table.as_slice());
        assert_eq!(info.level_of(1), Some(0));
        assert_eq!(info.level_of(2), Some(3));

        let first = SchedulingStrategy::MultiLevelFeedbackQueue.select(table.as_slice(), 0, &mut info);
        assert_eq!(first, 1);
        assert_eq!(info.level_of(1), Some(1));

        // Level 1 grants two turns.
        let picks: Vec<_> = (0..2)
            .map(|_| SchedulingStrategy::MultiLevelFeedbackQueue.select(table.as_slice(), 1, &mut info))
            .collect();
        assert_eq!(picks, [1, 1]);
        assert_eq!(info.level_of(1), Some(2));
    }

    #[test]
    fn mlfq_drops_unused_entries() {
        let mut table = table(&[255, 255]);
        let mut info = SchedulingInfo::new(SchedulerTuning::default());
        info.reset(table.as_slice());
        table.get_mut(1).unwrap().state = ProcessState::Unused;
        let next = SchedulingStrategy::MultiLevelFeedbackQueue.select(table.as_slice(), 1, &mut info);
        assert_eq!(next, 2);
        assert_eq!(info.level_of(1), None);
    }

    #[test]
    fn forget_clears_metadata() {
        let table = table(&[10, 10]);
        let mut info = SchedulingInfo::new(SchedulerTuning::default());
        info.reset(table.as_slice());
        SchedulingStrategy::InactiveAging.select(table.as_slice(), 0, &mut info);
        info.forget(2);
        assert_eq!(info.age(2), 0);
        assert_eq!(info.level_of(2), None);
    }
}
