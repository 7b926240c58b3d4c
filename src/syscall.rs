//! Decoding syscall-stops into typed events.
//!
//! On a syscall-enter-stop we read the tracee's registers, determine the
//! invocation ABI from the two opcode bytes behind the instruction pointer,
//! and capture the raw argument registers. On the matching exit-stop we
//! re-read the registers for the return value and, for syscalls with a detail
//! variant, materialize argument-dependent data out of tracee memory.

use std::fmt;

use crate::error::Result;
use crate::ptracer::{self, Pid, Registers};

/// Syscall invocation ABI, observed per syscall entry.
///
/// A 64-bit process can still issue 32-bit syscalls via `int 0x80`, and the
/// two tables do not agree on numbers, so the mode matters per call.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Abi {
    I386,
    X86_64,
}

/// The `syscall` instruction.
const SYSCALL_OPCODE: [u8; 2] = [0x0f, 0x05];

/// The `int 0x80` instruction.
const INT80_OPCODE: [u8; 2] = [0xcd, 0x80];

/// A syscall kind known to the engine, or `Unknown` with the raw number.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Syscall {
    Read,
    Write,
    Open,
    Close,
    Stat,
    Fstat,
    Lstat,
    Poll,
    Lseek,
    Mmap,
    Mprotect,
    Munmap,
    Brk,
    RtSigaction,
    RtSigprocmask,
    RtSigreturn,
    Ioctl,
    Access,
    Pipe,
    Select,
    SchedYield,
    Mremap,
    Madvise,
    Dup,
    Dup2,
    Nanosleep,
    Getpid,
    Clone,
    Fork,
    Vfork,
    Execve,
    Exit,
    Wait4,
    Kill,
    Uname,
    Fcntl,
    Fsync,
    Fdatasync,
    Truncate,
    Ftruncate,
    Getdents,
    Getcwd,
    Chdir,
    Fchdir,
    Rename,
    Mkdir,
    Rmdir,
    Creat,
    Link,
    Unlink,
    Symlink,
    Readlink,
    Chmod,
    Umask,
    Getuid,
    Getppid,
    Time,
    ArchPrctl,
    Gettid,
    Futex,
    SetTidAddress,
    ExitGroup,
    Openat,
    Mkdirat,
    Newfstatat,
    Unlinkat,
    Renameat,
    Faccessat,
    SetRobustList,
    Dup3,
    Pipe2,
    Prlimit64,
    Renameat2,
    Getrandom,
    Execveat,
    Statx,
    Rseq,
    Clone3,
    // i386-only entries
    Waitpid,
    Sigreturn,
    Llseek,
    Mmap2,
    Unknown(u64),
}

// One row per known syscall: kind, name, x86_64 number, i386 number.
//
// The two ABIs do not share numbers, and a handful of entries exist in only
// one table.
const SYSCALL_TABLE: &[(Syscall, &str, Option<u64>, Option<u64>)] = &[
    (Syscall::Read, "read", Some(0), Some(3)),
    (Syscall::Write, "write", Some(1), Some(4)),
    (Syscall::Open, "open", Some(2), Some(5)),
    (Syscall::Close, "close", Some(3), Some(6)),
    (Syscall::Stat, "stat", Some(4), Some(106)),
    (Syscall::Fstat, "fstat", Some(5), Some(108)),
    (Syscall::Lstat, "lstat", Some(6), Some(107)),
    (Syscall::Poll, "poll", Some(7), Some(168)),
    (Syscall::Lseek, "lseek", Some(8), Some(19)),
    (Syscall::Mmap, "mmap", Some(9), Some(90)),
    (Syscall::Mprotect, "mprotect", Some(10), Some(125)),
    (Syscall::Munmap, "munmap", Some(11), Some(91)),
    (Syscall::Brk, "brk", Some(12), Some(45)),
    (Syscall::RtSigaction, "rt_sigaction", Some(13), Some(174)),
    (Syscall::RtSigprocmask, "rt_sigprocmask", Some(14), Some(175)),
    (Syscall::RtSigreturn, "rt_sigreturn", Some(15), Some(173)),
    (Syscall::Ioctl, "ioctl", Some(16), Some(54)),
    (Syscall::Access, "access", Some(21), Some(33)),
    (Syscall::Pipe, "pipe", Some(22), Some(42)),
    (Syscall::Select, "select", Some(23), Some(142)),
    (Syscall::SchedYield, "sched_yield", Some(24), Some(158)),
    (Syscall::Mremap, "mremap", Some(25), Some(163)),
    (Syscall::Madvise, "madvise", Some(28), Some(219)),
    (Syscall::Dup, "dup", Some(32), Some(41)),
    (Syscall::Dup2, "dup2", Some(33), Some(63)),
    (Syscall::Nanosleep, "nanosleep", Some(35), Some(162)),
    (Syscall::Getpid, "getpid", Some(39), Some(20)),
    (Syscall::Clone, "clone", Some(56), Some(120)),
    (Syscall::Fork, "fork", Some(57), Some(2)),
    (Syscall::Vfork, "vfork", Some(58), Some(190)),
    (Syscall::Execve, "execve", Some(59), Some(11)),
    (Syscall::Exit, "exit", Some(60), Some(1)),
    (Syscall::Wait4, "wait4", Some(61), Some(114)),
    (Syscall::Kill, "kill", Some(62), Some(37)),
    (Syscall::Uname, "uname", Some(63), Some(122)),
    (Syscall::Fcntl, "fcntl", Some(72), Some(55)),
    (Syscall::Fsync, "fsync", Some(74), Some(118)),
    (Syscall::Fdatasync, "fdatasync", Some(75), Some(148)),
    (Syscall::Truncate, "truncate", Some(76), Some(92)),
    (Syscall::Ftruncate, "ftruncate", Some(77), Some(93)),
    (Syscall::Getdents, "getdents", Some(78), Some(141)),
    (Syscall::Getcwd, "getcwd", Some(79), Some(183)),
    (Syscall::Chdir, "chdir", Some(80), Some(12)),
    (Syscall::Fchdir, "fchdir", Some(81), Some(133)),
    (Syscall::Rename, "rename", Some(82), Some(38)),
    (Syscall::Mkdir, "mkdir", Some(83), Some(39)),
    (Syscall::Rmdir, "rmdir", Some(84), Some(40)),
    (Syscall::Creat, "creat", Some(85), Some(8)),
    (Syscall::Link, "link", Some(86), Some(9)),
    (Syscall::Unlink, "unlink", Some(87), Some(10)),
    (Syscall::Symlink, "symlink", Some(88), Some(83)),
    (Syscall::Readlink, "readlink", Some(89), Some(85)),
    (Syscall::Chmod, "chmod", Some(90), Some(15)),
    (Syscall::Umask, "umask", Some(95), Some(60)),
    (Syscall::Getuid, "getuid", Some(102), Some(24)),
    (Syscall::Getppid, "getppid", Some(110), Some(64)),
    (Syscall::Time, "time", Some(201), Some(13)),
    (Syscall::ArchPrctl, "arch_prctl", Some(158), Some(384)),
    (Syscall::Gettid, "gettid", Some(186), Some(224)),
    (Syscall::Futex, "futex", Some(202), Some(240)),
    (Syscall::SetTidAddress, "set_tid_address", Some(218), Some(258)),
    (Syscall::ExitGroup, "exit_group", Some(231), Some(252)),
    (Syscall::Openat, "openat", Some(257), Some(295)),
    (Syscall::Mkdirat, "mkdirat", Some(258), Some(296)),
    (Syscall::Newfstatat, "newfstatat", Some(262), Some(300)),
    (Syscall::Unlinkat, "unlinkat", Some(263), Some(301)),
    (Syscall::Renameat, "renameat", Some(264), Some(302)),
    (Syscall::Faccessat, "faccessat", Some(269), Some(307)),
    (Syscall::SetRobustList, "set_robust_list", Some(273), Some(311)),
    (Syscall::Dup3, "dup3", Some(292), Some(330)),
    (Syscall::Pipe2, "pipe2", Some(293), Some(331)),
    (Syscall::Prlimit64, "prlimit64", Some(302), Some(340)),
    (Syscall::Renameat2, "renameat2", Some(316), Some(353)),
    (Syscall::Getrandom, "getrandom", Some(318), Some(355)),
    (Syscall::Execveat, "execveat", Some(322), Some(358)),
    (Syscall::Statx, "statx", Some(332), Some(383)),
    (Syscall::Rseq, "rseq", Some(334), Some(386)),
    (Syscall::Clone3, "clone3", Some(435), Some(435)),
    (Syscall::Waitpid, "waitpid", None, Some(7)),
    (Syscall::Sigreturn, "sigreturn", None, Some(119)),
    (Syscall::Llseek, "_llseek", None, Some(140)),
    (Syscall::Mmap2, "mmap2", None, Some(192)),
];

impl Syscall {
    /// Look up a raw syscall number in the table for `abi`.
    pub fn from_number(abi: Abi, no: u64) -> Self {
        for &(syscall, _, x86_64, i386) in SYSCALL_TABLE {
            let entry = match abi {
                Abi::X86_64 => x86_64,
                Abi::I386 => i386,
            };

            if entry == Some(no) {
                return syscall;
            }
        }

        Syscall::Unknown(no)
    }

    /// The number of this syscall under `abi`, if it exists there.
    pub fn number(&self, abi: Abi) -> Option<u64> {
        if let Syscall::Unknown(no) = self {
            return Some(*no);
        }

        for &(syscall, _, x86_64, i386) in SYSCALL_TABLE {
            if syscall == *self {
                return match abi {
                    Abi::X86_64 => x86_64,
                    Abi::I386 => i386,
                };
            }
        }

        None
    }

    /// The kernel name of this syscall, if known.
    pub fn name(&self) -> Option<&'static str> {
        SYSCALL_TABLE
            .iter()
            .find(|(syscall, ..)| syscall == self)
            .map(|&(_, name, ..)| name)
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => match self {
                Syscall::Unknown(no) => write!(f, "unknown({})", no),
                _ => unreachable!("known syscall missing from table"),
            },
        }
    }
}

/// Raw argument register values, in ABI argument order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyscallArgs(pub [u64; 6]);

impl SyscallArgs {
    pub fn arg(&self, index: usize) -> u64 {
        self.0[index]
    }
}

/// A decoded syscall-enter-stop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyscallEnter {
    pub syscall: Syscall,
    pub abi: Abi,
    pub args: SyscallArgs,
}

/// A decoded syscall-exit-stop, combining the remembered enter-time arguments
/// with the exit-time return value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyscallExit {
    pub enter: SyscallEnter,
    pub retval: i64,
    pub details: Option<SyscallDetails>,
}

/// Argument-dependent data materialized from tracee memory at syscall-exit.
///
/// Variants are additive: a new known syscall gets a new variant here without
/// disturbing existing consumers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyscallDetails {
    /// A successful `read`: `data` holds exactly the returned count of bytes,
    /// copied out of the tracee's buffer.
    Read {
        fd: i32,
        data: Vec<u8>,
        requested: u64,
    },

    /// A successful `write`: `data` holds the bytes actually written.
    Write { fd: i32, data: Vec<u8> },
}

/// Decode a syscall-enter-stop for `pid`.
pub fn decode_enter(pid: Pid) -> Result<SyscallEnter> {
    let regs = ptracer::registers(pid)?;
    decode_enter_regs(pid, &regs)
}

fn decode_enter_regs(pid: Pid, regs: &Registers) -> Result<SyscallEnter> {
    let abi = detect_abi(pid, instruction_pointer(regs))?;
    let syscall = Syscall::from_number(abi, syscall_number(regs));
    let args = syscall_args(regs, abi);

    Ok(SyscallEnter { syscall, abi, args })
}

/// Decode a syscall-exit-stop for `pid`.
///
/// `enter` is the remembered enter-stop decode. It can legitimately be absent
/// when an exec off the thread-group leader moved the PID mid-syscall; the
/// enter is then reconstructed from exit-time registers, whose syscall number
/// register is still valid. The opcode peek is skipped in that case, since an
/// exec has replaced the image under the instruction pointer: the native ABI
/// is assumed instead.
pub fn decode_exit(pid: Pid, enter: Option<SyscallEnter>) -> Result<SyscallExit> {
    let regs = ptracer::registers(pid)?;

    let enter = match enter {
        Some(enter) => enter,
        None => {
            let abi = native_abi();
            let syscall = Syscall::from_number(abi, syscall_number(&regs));
            let args = syscall_args(&regs, abi);

            SyscallEnter { syscall, abi, args }
        }
    };

    let retval = return_value(&regs);
    let details = materialize_details(pid, &enter, retval)?;

    Ok(SyscallExit { enter, retval, details })
}

#[cfg(target_arch = "x86_64")]
fn native_abi() -> Abi {
    Abi::X86_64
}

#[cfg(target_arch = "x86")]
fn native_abi() -> Abi {
    Abi::I386
}

// Copy argument-dependent data out of the stopped tracee. Only successful
// calls are materialized; on an error return the buffers were never filled.
fn materialize_details(
    pid: Pid,
    enter: &SyscallEnter,
    retval: i64,
) -> Result<Option<SyscallDetails>> {
    if retval < 0 {
        return Ok(None);
    }

    let details = match enter.syscall {
        Syscall::Read => {
            let fd = enter.args.arg(0) as i32;
            let requested = enter.args.arg(2);
            let data = ptracer::read_memory(pid, enter.args.arg(1), retval as usize)?;

            Some(SyscallDetails::Read { fd, data, requested })
        }
        Syscall::Write => {
            let fd = enter.args.arg(0) as i32;
            let data = ptracer::read_memory(pid, enter.args.arg(1), retval as usize)?;

            Some(SyscallDetails::Write { fd, data })
        }
        _ => None,
    };

    Ok(details)
}

/// Determine the invocation ABI of the syscall-stop the tracee is in, by
/// peeking the two instruction bytes behind the instruction pointer.
///
/// At both enter- and exit-stops the instruction pointer points just past the
/// entry instruction, so those bytes are `0f 05` (`syscall`) for the 64-bit
/// ABI or `cd 80` (`int 0x80`) for the 32-bit one. Anything else violates the
/// decoder's precondition that the preceding stop was a syscall-stop.
#[cfg(target_arch = "x86_64")]
pub fn detect_abi(pid: Pid, ip: u64) -> Result<Abi> {
    let opcode = ptracer::read_memory(pid, ip - 2, 2)?;

    if opcode == SYSCALL_OPCODE {
        Ok(Abi::X86_64)
    } else if opcode == INT80_OPCODE {
        Ok(Abi::I386)
    } else {
        internal_error!(
            "unrecognized syscall entry opcode {:02x?} at {:#x} in tracee {}",
            opcode,
            ip,
            pid
        )
    }
}

#[cfg(target_arch = "x86")]
pub fn detect_abi(_pid: Pid, _ip: u64) -> Result<Abi> {
    Ok(Abi::I386)
}

#[cfg(target_arch = "x86_64")]
fn instruction_pointer(regs: &Registers) -> u64 {
    regs.rip
}

#[cfg(target_arch = "x86_64")]
fn syscall_number(regs: &Registers) -> u64 {
    regs.orig_rax
}

#[cfg(target_arch = "x86_64")]
fn return_value(regs: &Registers) -> i64 {
    regs.rax as i64
}

#[cfg(target_arch = "x86_64")]
fn syscall_args(regs: &Registers, abi: Abi) -> SyscallArgs {
    match abi {
        Abi::X86_64 => SyscallArgs([regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9]),
        // The compat entry path reads the i386 argument registers out of
        // their 64-bit aliases.
        Abi::I386 => SyscallArgs([
            regs.rbx as u32 as u64,
            regs.rcx as u32 as u64,
            regs.rdx as u32 as u64,
            regs.rsi as u32 as u64,
            regs.rdi as u32 as u64,
            regs.rbp as u32 as u64,
        ]),
    }
}

#[cfg(target_arch = "x86")]
fn instruction_pointer(regs: &Registers) -> u64 {
    regs.eip as u32 as u64
}

#[cfg(target_arch = "x86")]
fn syscall_number(regs: &Registers) -> u64 {
    regs.orig_eax as u32 as u64
}

#[cfg(target_arch = "x86")]
fn return_value(regs: &Registers) -> i64 {
    regs.eax as i64
}

#[cfg(target_arch = "x86")]
fn syscall_args(regs: &Registers, _abi: Abi) -> SyscallArgs {
    SyscallArgs([
        regs.ebx as u32 as u64,
        regs.ecx as u32 as u64,
        regs.edx as u32 as u64,
        regs.esi as u32 as u64,
        regs.edi as u32 as u64,
        regs.ebp as u32 as u64,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_numbers_round_trip() {
        let cases = [
            (Abi::X86_64, 0, Syscall::Read),
            (Abi::X86_64, 1, Syscall::Write),
            (Abi::X86_64, 56, Syscall::Clone),
            (Abi::X86_64, 59, Syscall::Execve),
            (Abi::X86_64, 82, Syscall::Rename),
            (Abi::X86_64, 231, Syscall::ExitGroup),
            (Abi::I386, 3, Syscall::Read),
            (Abi::I386, 4, Syscall::Write),
            (Abi::I386, 11, Syscall::Execve),
            (Abi::I386, 38, Syscall::Rename),
            (Abi::I386, 120, Syscall::Clone),
            (Abi::I386, 252, Syscall::ExitGroup),
        ];

        for &(abi, no, expected) in &cases {
            let decoded = Syscall::from_number(abi, no);
            assert_eq!(decoded, expected);
            assert_eq!(decoded.number(abi), Some(no));
        }
    }

    #[test]
    fn test_tables_disagree_between_abis() {
        // Numbers are not shared across tables: 1 is `write` on x86_64 but
        // `exit` on i386.
        assert_eq!(Syscall::from_number(Abi::X86_64, 1), Syscall::Write);
        assert_eq!(Syscall::from_number(Abi::I386, 1), Syscall::Exit);
    }

    #[test]
    fn test_unknown_number_is_preserved() {
        let syscall = Syscall::from_number(Abi::X86_64, 0xdead);
        assert_eq!(syscall, Syscall::Unknown(0xdead));
        assert_eq!(syscall.number(Abi::X86_64), Some(0xdead));
        assert_eq!(syscall.name(), None);
        assert_eq!(syscall.to_string(), "unknown(57005)");
    }

    #[test]
    fn test_abi_only_entries() {
        assert_eq!(Syscall::Mmap2.number(Abi::X86_64), None);
        assert_eq!(Syscall::Mmap2.number(Abi::I386), Some(192));
        assert_eq!(Syscall::from_number(Abi::I386, 7), Syscall::Waitpid);
    }

    #[test]
    fn test_display_uses_kernel_names() {
        assert_eq!(Syscall::Read.to_string(), "read");
        assert_eq!(Syscall::RtSigaction.to_string(), "rt_sigaction");
        assert_eq!(Syscall::ExitGroup.to_string(), "exit_group");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_argument_register_order() {
        let mut regs: Registers = unsafe { std::mem::zeroed() };
        regs.rdi = 1;
        regs.rsi = 2;
        regs.rdx = 3;
        regs.r10 = 4;
        regs.r8 = 5;
        regs.r9 = 6;

        let args = syscall_args(&regs, Abi::X86_64);
        assert_eq!(args.0, [1, 2, 3, 4, 5, 6]);

        // The i386 compat path uses a different register set.
        regs.rbx = 10;
        regs.rcx = 20;
        regs.rbp = 60;
        let args = syscall_args(&regs, Abi::I386);
        assert_eq!(args.0, [10, 20, 3, 2, 1, 60]);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_return_value_sign() {
        let mut regs: Registers = unsafe { std::mem::zeroed() };
        regs.rax = (-9i64) as u64; // -EBADF
        assert_eq!(return_value(&regs), -9);
    }
}
