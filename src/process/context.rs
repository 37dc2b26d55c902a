// Context Switching for SPOS
//
// Every process slot owns a fixed stack region. A switch pushes the live
// register file onto the outgoing process's stack and pops the incoming one;
// the saved stack pointer is all the PCB has to remember.
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use crate::config::{MAX_NUMBER_OF_PROCESSES, STACK_SIZE_PROC};
use crate::process::pcb::{ProcessId, StackChecksum};

/// General purpose registers of the core
pub const GENERAL_REGISTERS: usize = 32;

/// Bytes pushed for the status register plus the general registers
pub const CONTEXT_SIZE: usize = GENERAL_REGISTERS + 1;

/// Bytes of the saved program counter
pub const RETURN_ADDRESS_SIZE: usize = 2;

/// Program counter pushed for a fresh process; resuming there enters the
/// program trampoline (`Kernel::run_current`).
pub const LAUNCH_VECTOR: u16 = 0x0002;

const _: () = assert!(STACK_SIZE_PROC > CONTEXT_SIZE + RETURN_ADDRESS_SIZE);

/// Live register state of the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    pub general: [u8; GENERAL_REGISTERS],
    pub status: u8,
    pub pc: u16,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            general: [0; GENERAL_REGISTERS],
            status: 0,
            pc: 0,
        }
    }
}

/// Stack regions of all process slots. Stacks grow downwards; a stack
/// pointer is an offset into its region and points at the next free byte.
#[derive(Debug, Clone)]
pub struct StackArena {
    bytes: Vec<u8>,
}

impl StackArena {
    pub fn new() -> Self {
        Self {
            bytes: vec![0; MAX_NUMBER_OF_PROCESSES * STACK_SIZE_PROC],
        }
    }

    /// Stack pointer of an empty stack
    pub const fn bottom() -> usize {
        STACK_SIZE_PROC - 1
    }

    fn range(pid: ProcessId) -> Range<usize> {
        let start = pid as usize * STACK_SIZE_PROC;
        start..start + STACK_SIZE_PROC
    }

    pub fn region(&self, pid: ProcessId) -> &[u8] {
        &self.bytes[Self::range(pid)]
    }

    pub(crate) fn region_mut(&mut self, pid: ProcessId) -> &mut [u8] {
        &mut self.bytes[Self::range(pid)]
    }

    fn push(&mut self, pid: ProcessId, sp: &mut usize, value: u8) {
        self.region_mut(pid)[*sp] = value;
        *sp = sp.saturating_sub(1);
    }

    fn pop(&mut self, pid: ProcessId, sp: &mut usize) -> u8 {
        *sp = (*sp + 1).min(Self::bottom());
        self.region(pid)[*sp]
    }

    /// Lay out the initial stack of a fresh process: the launch vector
    /// followed by an all-zero register file. Returns the stack pointer.
    pub fn prepare(&mut self, pid: ProcessId) -> usize {
        self.save(pid, Self::bottom(), &RegisterFile {
            pc: LAUNCH_VECTOR,
            ..RegisterFile::default()
        })
    }

    /// Push a register file and return the new stack pointer.
    pub fn save(&mut self, pid: ProcessId, sp: usize, registers: &RegisterFile) -> usize {
        let mut sp = sp;
        let [low, high] = registers.pc.to_le_bytes();
        self.push(pid, &mut sp, low);
        self.push(pid, &mut sp, high);
        self.push(pid, &mut sp, registers.status);
        for value in registers.general.iter().rev() {
            self.push(pid, &mut sp, *value);
        }
        sp
    }

    /// Pop a register file pushed by `save`. Returns it with the stack
    /// pointer after the pop.
    pub fn restore(&mut self, pid: ProcessId, sp: usize) -> (RegisterFile, usize) {
        let mut sp = sp;
        let mut registers = RegisterFile::default();
        for value in registers.general.iter_mut() {
            *value = self.pop(pid, &mut sp);
        }
        registers.status = self.pop(pid, &mut sp);
        let high = self.pop(pid, &mut sp);
        let low = self.pop(pid, &mut sp);
        registers.pc = u16::from_le_bytes([low, high]);
        (registers, sp)
    }

    /// XOR over the used part of the stack, from the bottom up to `sp`.
    pub fn checksum(&self, pid: ProcessId, sp: usize) -> StackChecksum {
        self.region(pid)[sp + 1..=Self::bottom()]
            .iter()
            .fold(0, |checksum, byte| checksum ^ byte)
    }
}

impl Default for StackArena {
    fn default() -> Self {
        Self::new()
    }
}
