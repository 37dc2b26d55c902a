// System call interface for SPOS programs
//
// A call is a number plus up to four argument words; the result comes back
// as one word with the high bit set on error.
use core::fmt;

use crate::kernel::{Kernel, TickOutcome};
use crate::memory::{HeapId, MemAddr};
use crate::process::{Priority, ProcessId, ProgramId};
use crate::KernelError;

/// Machine word of the call interface
pub type SyscallWord = u32;

/// Set in a returned word when the call failed
pub const ERROR_BIT: SyscallWord = 0x8000_0000;

/// System call numbers
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    Malloc = 0,
    Free = 1,
    Realloc = 2,
    Exec = 3,
    Kill = 4,
    Exit = 5,
    Yield = 6,
    GetPid = 7,
    ShMalloc = 8,
    ShReadOpen = 9,
    ShWriteOpen = 10,
    ShClose = 11,
    ShFree = 12,
    EnterCritical = 13,
    LeaveCritical = 14,
    StackChecksum = 15,
    ReadByte = 16,
    WriteByte = 17,
}

impl TryFrom<SyscallWord> for SyscallNumber {
    type Error = SyscallError;

    fn try_from(number: SyscallWord) -> Result<Self, Self::Error> {
        use SyscallNumber::*;
        const TABLE: [SyscallNumber; 18] = [
            Malloc,
            Free,
            Realloc,
            Exec,
            Kill,
            Exit,
            Yield,
            GetPid,
            ShMalloc,
            ShReadOpen,
            ShWriteOpen,
            ShClose,
            ShFree,
            EnterCritical,
            LeaveCritical,
            StackChecksum,
            ReadByte,
            WriteByte,
        ];
        TABLE
            .get(number as usize)
            .copied()
            .ok_or(SyscallError::InvalidSyscall)
    }
}

/// System call arguments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallArgs {
    pub arg0: SyscallWord,
    pub arg1: SyscallWord,
    pub arg2: SyscallWord,
    pub arg3: SyscallWord,
}

impl SyscallArgs {
    pub const fn new(arg0: SyscallWord, arg1: SyscallWord, arg2: SyscallWord, arg3: SyscallWord) -> Self {
        Self { arg0, arg1, arg2, arg3 }
    }
}

/// System call result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Success(SyscallWord),
    Error(SyscallError),
}

/// System call errors
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall = 1,
    InvalidArgument,
    TableFull,
    NoSuchProcess,
    NoSuchProgram,
    NoSuchHeap,
    ProtectedProcess,
    InvalidFree,
    NotOwner,
    OutOfMemory,
    OutOfBounds,
    WouldBlock,
    NotOpen,
    StackCorruption,
    GuardMisuse,
    Halted,
    AlreadyStarted,
}

impl SyscallError {
    const ALL: [SyscallError; 17] = [
        SyscallError::InvalidSyscall,
        SyscallError::InvalidArgument,
        SyscallError::TableFull,
        SyscallError::NoSuchProcess,
        SyscallError::NoSuchProgram,
        SyscallError::NoSuchHeap,
        SyscallError::ProtectedProcess,
        SyscallError::InvalidFree,
        SyscallError::NotOwner,
        SyscallError::OutOfMemory,
        SyscallError::OutOfBounds,
        SyscallError::WouldBlock,
        SyscallError::NotOpen,
        SyscallError::StackCorruption,
        SyscallError::GuardMisuse,
        SyscallError::Halted,
        SyscallError::AlreadyStarted,
    ];

    pub fn from_code(code: SyscallWord) -> Option<Self> {
        Self::ALL.iter().copied().find(|error| *error as SyscallWord == code)
    }
}

impl From<KernelError> for SyscallError {
    fn from(error: KernelError) -> Self {
        match error {
            KernelError::TableFull(_) => SyscallError::TableFull,
            KernelError::NoSuchProcess => SyscallError::NoSuchProcess,
            KernelError::NoSuchProgram => SyscallError::NoSuchProgram,
            KernelError::NoSuchHeap => SyscallError::NoSuchHeap,
            KernelError::ProtectedProcess => SyscallError::ProtectedProcess,
            KernelError::InvalidFree => SyscallError::InvalidFree,
            KernelError::NotOwner => SyscallError::NotOwner,
            KernelError::OutOfMemory => SyscallError::OutOfMemory,
            KernelError::OutOfBounds => SyscallError::OutOfBounds,
            KernelError::WouldBlock => SyscallError::WouldBlock,
            KernelError::NotOpen => SyscallError::NotOpen,
            KernelError::StackCorruption => SyscallError::StackCorruption,
            KernelError::GuardMisuse => SyscallError::GuardMisuse,
            KernelError::Halted => SyscallError::Halted,
            KernelError::AlreadyStarted => SyscallError::AlreadyStarted,
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyscallError::InvalidSyscall => write!(f, "Invalid syscall number"),
            SyscallError::InvalidArgument => write!(f, "Invalid argument"),
            other => write!(f, "Kernel error {:?}", other),
        }
    }
}

/// Convert syscall result to the returned word
impl From<SyscallResult> for SyscallWord {
    fn from(result: SyscallResult) -> SyscallWord {
        match result {
            SyscallResult::Success(value) => value & !ERROR_BIT,
            SyscallResult::Error(err) => ERROR_BIT | err as SyscallWord,
        }
    }
}

impl SyscallResult {
    /// Decode a returned word. Unknown error codes read as `InvalidSyscall`.
    pub fn decode(word: SyscallWord) -> Self {
        if word & ERROR_BIT == 0 {
            SyscallResult::Success(word)
        } else {
            SyscallResult::Error(SyscallError::from_code(word & !ERROR_BIT).unwrap_or(SyscallError::InvalidSyscall))
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SyscallResult::Error(_))
    }
}

impl<T: Into<SyscallWord>> From<Result<T, KernelError>> for SyscallResult {
    fn from(result: Result<T, KernelError>) -> Self {
        match result {
            Ok(value) => SyscallResult::Success(value.into()),
            Err(error) => SyscallResult::Error(error.into()),
        }
    }
}

/// System call handler function type
pub type SyscallHandler = fn(&mut Kernel, SyscallArgs) -> SyscallResult;

fn narrow<T: TryFrom<SyscallWord>>(word: SyscallWord) -> Result<T, SyscallError> {
    T::try_from(word).map_err(|_| SyscallError::InvalidArgument)
}

fn heap_id(word: SyscallWord) -> HeapId {
    word as HeapId
}

/// Handle a system call issued by the current process
pub fn handle_syscall(kernel: &mut Kernel, syscall_num: SyscallWord, args: SyscallArgs) -> SyscallResult {
    let handler: SyscallHandler = match SyscallNumber::try_from(syscall_num) {
        Ok(SyscallNumber::Malloc) => syscall_malloc,
        Ok(SyscallNumber::Free) => syscall_free,
        Ok(SyscallNumber::Realloc) => syscall_realloc,
        Ok(SyscallNumber::Exec) => syscall_exec,
        Ok(SyscallNumber::Kill) => syscall_kill,
        Ok(SyscallNumber::Exit) => syscall_exit,
        Ok(SyscallNumber::Yield) => syscall_yield,
        Ok(SyscallNumber::GetPid) => syscall_get_pid,
        Ok(SyscallNumber::ShMalloc) => syscall_sh_malloc,
        Ok(SyscallNumber::ShReadOpen) => syscall_sh_read_open,
        Ok(SyscallNumber::ShWriteOpen) => syscall_sh_write_open,
        Ok(SyscallNumber::ShClose) => syscall_sh_close,
        Ok(SyscallNumber::ShFree) => syscall_sh_free,
        Ok(SyscallNumber::EnterCritical) => syscall_enter_critical,
        Ok(SyscallNumber::LeaveCritical) => syscall_leave_critical,
        Ok(SyscallNumber::StackChecksum) => syscall_stack_checksum,
        Ok(SyscallNumber::ReadByte) => syscall_read_byte,
        Ok(SyscallNumber::WriteByte) => syscall_write_byte,
        Err(error) => {
            log::warn!("process {} issued unknown syscall {}", kernel.current_process(), syscall_num);
            return SyscallResult::Error(error);
        }
    };
    let result = handler(kernel, args);
    log::trace!("syscall {} {:?} -> {:?}", syscall_num, args, result);
    result
}

/// Run a handler body whose argument decoding may fail.
fn decoded(body: impl FnOnce() -> Result<SyscallResult, SyscallError>) -> SyscallResult {
    body().unwrap_or_else(SyscallResult::Error)
}

fn unit(result: Result<(), KernelError>) -> SyscallResult {
    result.map(|()| 0 as SyscallWord).into()
}

pub fn syscall_malloc(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let size: u16 = narrow(args.arg1)?;
        Ok(kernel.malloc(heap_id(args.arg0), size).into())
    })
}

pub fn syscall_free(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let addr: MemAddr = narrow(args.arg1)?;
        Ok(unit(kernel.free(heap_id(args.arg0), addr)))
    })
}

pub fn syscall_realloc(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let addr: MemAddr = narrow(args.arg1)?;
        let size: u16 = narrow(args.arg2)?;
        Ok(kernel.realloc(heap_id(args.arg0), addr, size).into())
    })
}

pub fn syscall_exec(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let program: ProgramId = narrow(args.arg0)?;
        let priority: Priority = narrow(args.arg1)?;
        Ok(kernel.exec(program, priority).into())
    })
}

pub fn syscall_kill(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let pid: ProcessId = narrow(args.arg0)?;
        Ok(unit(kernel.kill(pid)))
    })
}

pub fn syscall_exit(kernel: &mut Kernel, _args: SyscallArgs) -> SyscallResult {
    let pid = kernel.current_process();
    unit(kernel.kill(pid))
}

/// Returns the process that runs after the yield.
pub fn syscall_yield(kernel: &mut Kernel, _args: SyscallArgs) -> SyscallResult {
    match kernel.yield_now() {
        TickOutcome::Halted => SyscallResult::Error(SyscallError::Halted),
        _ => SyscallResult::Success(kernel.current_process().into()),
    }
}

pub fn syscall_get_pid(kernel: &mut Kernel, _args: SyscallArgs) -> SyscallResult {
    SyscallResult::Success(kernel.current_process().into())
}

pub fn syscall_sh_malloc(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let size: u16 = narrow(args.arg1)?;
        Ok(kernel.sh_malloc(heap_id(args.arg0), size).into())
    })
}

pub fn syscall_sh_read_open(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let addr: MemAddr = narrow(args.arg1)?;
        Ok(unit(kernel.sh_read_open(heap_id(args.arg0), addr)))
    })
}

pub fn syscall_sh_write_open(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let addr: MemAddr = narrow(args.arg1)?;
        Ok(unit(kernel.sh_write_open(heap_id(args.arg0), addr)))
    })
}

pub fn syscall_sh_close(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let addr: MemAddr = narrow(args.arg1)?;
        Ok(unit(kernel.sh_close(heap_id(args.arg0), addr)))
    })
}

pub fn syscall_sh_free(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let addr: MemAddr = narrow(args.arg1)?;
        Ok(unit(kernel.sh_free(heap_id(args.arg0), addr)))
    })
}

pub fn syscall_enter_critical(kernel: &mut Kernel, _args: SyscallArgs) -> SyscallResult {
    kernel.enter_critical_section();
    SyscallResult::Success(0)
}

pub fn syscall_leave_critical(kernel: &mut Kernel, _args: SyscallArgs) -> SyscallResult {
    kernel.leave_critical_section();
    SyscallResult::Success(0)
}

pub fn syscall_stack_checksum(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let pid: ProcessId = narrow(args.arg0)?;
        Ok(kernel.stack_checksum(pid).into())
    })
}

/// Byte at `addr + offset` of a chunk of the caller.
pub fn syscall_read_byte(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let addr: MemAddr = narrow(args.arg1)?;
        let offset: u16 = narrow(args.arg2)?;
        let mut byte = [0];
        let result = kernel.read_bytes(heap_id(args.arg0), addr, offset, &mut byte);
        Ok(result.map(|()| byte[0]).into())
    })
}

pub fn syscall_write_byte(kernel: &mut Kernel, args: SyscallArgs) -> SyscallResult {
    decoded(|| {
        let addr: MemAddr = narrow(args.arg1)?;
        let offset: u16 = narrow(args.arg2)?;
        let value: u8 = narrow(args.arg3)?;
        Ok(unit(kernel.write_bytes(heap_id(args.arg0), addr, offset, &[value])))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeapConfig, KernelConfig};
    use crate::process::{Program, SchedulingStrategy};
    use alloc::vec;

    fn noop(_: &mut Kernel) {}

    fn kernel() -> Kernel {
        let config = KernelConfig::default()
            .with_scheduling(SchedulingStrategy::RoundRobin)
            .with_heaps(vec![HeapConfig::new("ram", 8, 64)]);
        let mut kernel = Kernel::new(config).unwrap();
        kernel.register_program(Program::new(noop)).unwrap();
        kernel.exec(1, 10).unwrap();
        kernel.start_scheduler().unwrap();
        kernel.tick();
        kernel
    }

    fn call(kernel: &mut Kernel, number: SyscallNumber, args: SyscallArgs) -> SyscallResult {
        // Round trip through the returned word like a program would see it.
        let word: SyscallWord = handle_syscall(kernel, number as SyscallWord, args).into();
        SyscallResult::decode(word)
    }

    #[test]
    fn error_encoding_sets_the_high_bit() {
        let word: SyscallWord = SyscallResult::Error(SyscallError::OutOfMemory).into();
        assert_eq!(word & ERROR_BIT, ERROR_BIT);
        assert_eq!(SyscallResult::decode(word), SyscallResult::Error(SyscallError::OutOfMemory));
        assert_eq!(SyscallResult::decode(42), SyscallResult::Success(42));
    }

    #[test]
    fn unknown_number_is_rejected() {
        let mut kernel = kernel();
        assert_eq!(
            handle_syscall(&mut kernel, 99, SyscallArgs::default()),
            SyscallResult::Error(SyscallError::InvalidSyscall)
        );
    }

    #[test]
    fn memory_calls_act_for_the_caller() {
        let mut kernel = kernel();
        let SyscallResult::Success(addr) = call(&mut kernel, SyscallNumber::Malloc, SyscallArgs::new(0, 8, 0, 0)) else {
            panic!("malloc failed");
        };
        assert_eq!(kernel.heap(0).unwrap().owned_bytes(1), 8);

        assert_eq!(
            call(&mut kernel, SyscallNumber::WriteByte, SyscallArgs::new(0, addr, 3, 0x5A)),
            SyscallResult::Success(0)
        );
        assert_eq!(
            call(&mut kernel, SyscallNumber::ReadByte, SyscallArgs::new(0, addr, 3, 0)),
            SyscallResult::Success(0x5A)
        );
        assert_eq!(
            call(&mut kernel, SyscallNumber::Free, SyscallArgs::new(0, addr, 0, 0)),
            SyscallResult::Success(0)
        );
        assert_eq!(
            call(&mut kernel, SyscallNumber::Free, SyscallArgs::new(0, addr, 0, 0)),
            SyscallResult::Error(SyscallError::InvalidFree)
        );
    }

    #[test]
    fn oversized_arguments_are_invalid() {
        let mut kernel = kernel();
        assert_eq!(
            call(&mut kernel, SyscallNumber::Malloc, SyscallArgs::new(0, 70_000, 0, 0)),
            SyscallResult::Error(SyscallError::InvalidArgument)
        );
        assert_eq!(
            call(&mut kernel, SyscallNumber::Kill, SyscallArgs::new(300, 0, 0, 0)),
            SyscallResult::Error(SyscallError::InvalidArgument)
        );
    }

    #[test]
    fn process_calls() {
        let mut kernel = kernel();
        assert_eq!(call(&mut kernel, SyscallNumber::GetPid, SyscallArgs::default()), SyscallResult::Success(1));
        assert_eq!(
            call(&mut kernel, SyscallNumber::Exec, SyscallArgs::new(1, 20, 0, 0)),
            SyscallResult::Success(2)
        );
        assert_eq!(
            call(&mut kernel, SyscallNumber::Kill, SyscallArgs::new(0, 0, 0, 0)),
            SyscallResult::Error(SyscallError::ProtectedProcess)
        );
        assert_eq!(call(&mut kernel, SyscallNumber::Yield, SyscallArgs::default()), SyscallResult::Success(2));
        assert_eq!(call(&mut kernel, SyscallNumber::Exit, SyscallArgs::default()), SyscallResult::Success(0));
        assert!(kernel.process(2).is_err());
        assert_eq!(kernel.current_process(), 1);
    }

    #[test]
    fn shared_memory_calls() {
        let mut kernel = kernel();
        let SyscallResult::Success(addr) = call(&mut kernel, SyscallNumber::ShMalloc, SyscallArgs::new(0, 4, 0, 0)) else {
            panic!("sh_malloc failed");
        };
        let args = SyscallArgs::new(0, addr, 0, 0);
        assert_eq!(call(&mut kernel, SyscallNumber::ShWriteOpen, args), SyscallResult::Success(0));
        assert_eq!(
            call(&mut kernel, SyscallNumber::ShReadOpen, args),
            SyscallResult::Error(SyscallError::WouldBlock)
        );
        assert_eq!(call(&mut kernel, SyscallNumber::ShClose, args), SyscallResult::Success(0));
        assert_eq!(call(&mut kernel, SyscallNumber::ShFree, args), SyscallResult::Success(0));
    }

    #[test]
    fn critical_section_calls_nest() {
        let mut kernel = kernel();
        call(&mut kernel, SyscallNumber::EnterCritical, SyscallArgs::default());
        call(&mut kernel, SyscallNumber::EnterCritical, SyscallArgs::default());
        assert_eq!(kernel.critical_section().depth(), 2);
        call(&mut kernel, SyscallNumber::LeaveCritical, SyscallArgs::default());
        call(&mut kernel, SyscallNumber::LeaveCritical, SyscallArgs::default());
        assert!(!kernel.critical_section().is_held());
    }
}
