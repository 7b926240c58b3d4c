//! Trace the syscalls of a Linux process tree, and act on what you see.
//!
//! Spawning a [`Command`] under a [`Tracer`] yields a lazy stream of typed
//! [`TraceEvent`]s: every syscall the tracee and its descendants enter and
//! exit, plus signal deliveries, group-stops, and process lifecycle changes.
//! The stream is pull-driven and cancellable, and a consumer can act on the
//! tracee mid-run with [`send_signal`] -- for example, killing a program the
//! moment it issues its nth `write`.
//!
//! The `ptrace(2)` interface entails interpreting a series of `wait(2)`
//! statuses, in context: attach options, previously-seen stops, and extra
//! event data queried with further ptrace requests. The [`ptracer`] module
//! hides that bookkeeping behind typed stops, [`syscall`] decodes the
//! per-architecture registers and memory, and [`trace`] drives the whole
//! process tree from a single thread.

#[macro_use]
pub mod error;

pub mod cmd;
pub mod ptracer;
pub mod syscall;
pub mod trace;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use cmd::Command;

#[doc(inline)]
pub use ptracer::{ExitStatus, Options, Pid, Ptracer, Registers, Restart, Signal, Stop};

#[doc(inline)]
pub use syscall::{Abi, Syscall, SyscallArgs, SyscallDetails, SyscallEnter, SyscallExit};

#[doc(inline)]
pub use trace::{
    send_signal, stream_trace, trace_to_exit, LifecycleEvent, SyscallStop, TraceEvent, Tracer,
};
