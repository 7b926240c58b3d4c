//! Attaching to tracees, classifying their stops, and resuming them.
//!
//! The `ptrace(2)` interface entails interpreting a series of `wait(2)`
//! statuses. The context used to interpret a status includes the attach
//! options set on each tracee, previously-seen stops, and in some cases extra
//! event data that must be queried using additional `ptrace` calls. This
//! module hides that bookkeeping: [`Ptracer::wait()`] blocks until any tracked
//! tracee reports a status change and returns a typed [`Stop`].

use std::collections::BTreeMap;
use std::convert::TryFrom;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, info, warn};

use crate::cmd::Command;
use crate::error::{Error, Result, ResultExt};

pub use nix::sys::ptrace::Options;
pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Register state of a tracee.
pub type Registers = libc::user_regs_struct;

/// A _ptrace-stop_: a tracee state in which it is stopped and ready to accept
/// ptrace commands, classified by reading the raw `wait(2)` status in the
/// context of the per-tracee state machine.
///
/// Some stops carry data obtained via additional (internal) requests to
/// `PTRACE_GETEVENTMSG`; requests to `PTRACE_GETSIGINFO` are made to
/// disambiguate group-stops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
    /// Readiness stop of a newly-attached tracee. Consumed internally by the
    /// event stream driver; never surfaced as an event.
    Attach,

    // syscall-stops, disambiguated by the per-tracee state machine
    SyscallEnter,
    SyscallExit,

    // signal-delivery-stop
    SignalDelivery { signal: Signal },

    // group-stop
    Group { signal: Signal },

    // ptrace-event-stops
    Fork { new: Pid },
    Vfork { new: Pid },
    Clone { new: Pid },
    Exec { former: Pid },
    Exiting { status: ExitStatus },

    /// Terminal `wait(2)` status. The tracee has been reaped and removed from
    /// the tracked set; no further stops will be reported for it.
    Exited { status: ExitStatus },
}

/// How a tracee run ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled { signal: Signal, core_dumped: bool },

    /// The tracee disappeared mid-operation and no terminal status could be
    /// observed.
    Vanished,
}

impl ExitStatus {
    /// Process-level exit code, with the shell convention of `128 + signo`
    /// for signal death.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled { signal, .. } => 128 + *signal as i32,
            ExitStatus::Vanished => 255,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    // Parse the pending wait status reported by `PTRACE_GETEVENTMSG` at a
    // `PTRACE_EVENT_EXIT` stop.
    //
    // The bit layout of the word `status` is:
    //
    //   15                         8   7                     0
    //    +-------------------------+---+---------------------+
    //    |        exit_code        | c |       sig_no        |
    //    +-------------------------+---+---------------------+
    //
    // If `status[6:0]` is nonzero, then the tracee is being signaled with
    // `sig_no`, and a set `status[7]` bit flags a core dump. Otherwise, it is
    // a normal exit with exit code `status[15:8]`.
    fn parse_event_status(status: u16) -> Result<Self> {
        let sig_no = status & 0x7f;

        let parsed = if sig_no == 0 {
            // Extract, zero-extend, cast.
            let exit_code = (status >> 8) as u8 as u32 as i32;

            ExitStatus::Exited(exit_code)
        } else {
            let signal = Signal::try_from(sig_no as i32)?;
            let core_dumped = status & (1 << 7) != 0;

            ExitStatus::Signaled { signal, core_dumped }
        };

        Ok(parsed)
    }
}

// Per-tracee state, tracked to disambiguate stops that `wait(2)` reports with
// identical signatures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    // Auto-attached via a fork/vfork/clone event, expecting a SIGSTOP.
    Attaching,

    // Attached, not inside a syscall: the next syscall-stop is an enter.
    Running,

    // After a syscall-enter-stop: the next syscall-stop is an exit.
    Syscalling,
}

/// Trace options applied to every tracee on attach.
///
/// `PTRACE_O_TRACESYSGOOD` sets bit 0x80 in the stop signal of syscall-stops,
/// disambiguating them from `SIGTRAP` signal-delivery-stops. The follow bits
/// auto-attach new children; the exec and exit bits turn those lifecycle
/// transitions into ptrace-event-stops.
pub const TRACE_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT);

/// Restart requests, which resume stopped tracees.
///
/// The engine only ever runs tracees to the next syscall boundary (optionally
/// delivering a pending signal), or acknowledges a group-stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    /// `PTRACE_SYSCALL`, delivering the signal if one is given.
    Syscall(Option<Signal>),

    /// `PTRACE_LISTEN`: acknowledge a group-stop without resuming or
    /// injecting anything.
    Listen,
}

/// Tracker for a set of tracees descended from one spawned child.
///
/// Spawned tracees follow calls to `fork()`, `vfork()`, `clone()`, and
/// `exec()`, tracing all child tasks (both threads and processes).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ptracer {
    // Known tracees, and their state.
    tracees: BTreeMap<i32, State>,
}

impl Ptracer {
    pub fn new() -> Self {
        let tracees = BTreeMap::new();

        Self { tracees }
    }

    /// Spawn `cmd` for tracing.
    ///
    /// The child requests `PTRACE_TRACEME` and stops itself post-fork,
    /// pre-exec. This call consumes that readiness stop, verifying the
    /// reported PID and stop reason, and applies [`TRACE_OPTIONS`] while the
    /// child has not yet done anything observable. The returned tracee is
    /// left stopped, pending its first restart.
    pub fn spawn(&mut self, cmd: Command) -> Result<Pid> {
        let pid = cmd.fork_exec()?;

        let status = wait::waitpid(pid, Some(WaitPidFlag::__WALL))
            .map_err(|source| Error::Wait { source })?;

        match status {
            WaitStatus::Stopped(stopped, Signal::SIGSTOP) if stopped == pid => {}
            other => {
                // Reap a child that stopped (or died) some other way; it is
                // of no use to us.
                let _ = ptrace::kill(pid);
                let _ = wait::waitpid(pid, None);
                internal_error!("expected readiness stop of spawned tracee {}, got {:?}", pid, other);
            }
        }

        self.set_options(pid)?;
        self.set_tracee_state(pid, State::Running);

        info!(pid = pid.as_raw(), "spawned tracee");

        Ok(pid)
    }

    /// Set [`TRACE_OPTIONS`] on a stopped tracee. Idempotent per PID.
    pub fn set_options(&self, pid: Pid) -> Result<()> {
        ptrace::setoptions(pid, TRACE_OPTIONS).died_if_esrch(pid)
    }

    /// Resume the stopped tracee.
    pub fn restart(&mut self, pid: Pid, restart: Restart) -> Result<()> {
        match restart {
            Restart::Syscall(pending) => ptrace::syscall(pid, pending).died_if_esrch(pid),
            Restart::Listen => match listen(pid) {
                // `PTRACE_LISTEN` is only valid for seize-attached tracees,
                // and ours attach via `TRACEME` or fork-follow. Acknowledge
                // the group-stop with a signal-free syscall resume instead.
                Err(Errno::EIO) => ptrace::syscall(pid, None).died_if_esrch(pid),
                res => res.died_if_esrch(pid),
            },
        }
    }

    /// Wait for some tracked tracee to report a status change, and classify
    /// it as a typed [`Stop`].
    ///
    /// Terminal statuses remove the tracee from the tracked set. If there are
    /// no tracees left to wait on, returns `None`.
    pub fn wait(&mut self) -> Result<Option<(Pid, Stop)>> {
        loop {
            if self.tracees.is_empty() {
                debug!("no tracees to wait on");

                return Ok(None);
            }

            // Wait on any child, threads included.
            let status = match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    // Every remaining tracee vanished without reporting a
                    // terminal status.
                    warn!("no children left to wait on, dropping remaining tracees");
                    self.tracees.clear();

                    return Ok(None);
                }
                Err(source) => return Err(Error::Wait { source }),
            };

            if let Some(stop) = self.classify(status)? {
                return Ok(Some(stop));
            }

            // `WaitStatus::Continued` or another non-stop: silently re-wait.
        }
    }

    // Interpret one raw `wait(2)` status. Returns `None` for statuses that
    // are not stops.
    fn classify(&mut self, status: WaitStatus) -> Result<Option<(Pid, Stop)>> {
        let classified = match status {
            WaitStatus::Exited(pid, exit_code) => {
                self.remove_tracee(pid);

                let status = ExitStatus::Exited(exit_code);
                (pid, Stop::Exited { status })
            }
            WaitStatus::Signaled(pid, signal, core_dumped) => {
                self.remove_tracee(pid);

                let status = ExitStatus::Signaled { signal, core_dumped };
                (pid, Stop::Exited { status })
            }
            WaitStatus::PtraceSyscall(pid) => {
                // Syscall-enter-stop and syscall-exit-stop are
                // indistinguishable from each other by the tracer. Only our
                // memory of prior stops tells them apart, and they must
                // alternate strictly.
                let stop = match self.tracee_state_mut(pid) {
                    Some(state @ State::Running) => {
                        *state = State::Syscalling;
                        Stop::SyscallEnter
                    }
                    Some(state @ State::Syscalling) => {
                        *state = State::Running;
                        Stop::SyscallExit
                    }
                    Some(State::Attaching) => {
                        // A tracee in this state is waiting for the SIGSTOP
                        // artifact of its auto-attach.
                        internal_error!("syscall-stop for attaching tracee {}", pid)
                    }
                    None => {
                        internal_error!("syscall-stop for unregistered tracee {}", pid)
                    }
                };

                (pid, stop)
            }
            WaitStatus::PtraceEvent(pid, _signal, code) => {
                let stop = self.classify_event(pid, code)?;
                (pid, stop)
            }
            WaitStatus::Stopped(pid, signal) => {
                if signal == Signal::SIGSTOP {
                    match self.tracee_state(pid) {
                        Some(State::Attaching) => {
                            self.set_tracee_state(pid, State::Running);
                            return Ok(Some((pid, Stop::Attach)));
                        }
                        None => {
                            // An auto-attached child may report its attach
                            // SIGSTOP before we have seen the fork event that
                            // would mark it `Attaching`.
                            self.set_tracee_state(pid, State::Running);
                            return Ok(Some((pid, Stop::Attach)));
                        }
                        _ => {}
                    }
                }

                if self.tracee_state(pid).is_none() {
                    // A stop for a child we have not yet seen the new-child
                    // event for. Track it; the event will still be reported.
                    self.set_tracee_state(pid, State::Running);
                }

                let stop = if is_group_stop(pid, signal)? {
                    Stop::Group { signal }
                } else {
                    Stop::SignalDelivery { signal }
                };

                (pid, stop)
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => return Ok(None),
        };

        Ok(Some(classified))
    }

    fn classify_event(&mut self, pid: Pid, code: i32) -> Result<Stop> {
        let stop = match code {
            libc::PTRACE_EVENT_FORK => {
                let new = self.event_child(pid)?;
                Stop::Fork { new }
            }
            libc::PTRACE_EVENT_VFORK => {
                let new = self.event_child(pid)?;
                Stop::Vfork { new }
            }
            libc::PTRACE_EVENT_CLONE => {
                let new = self.event_child(pid)?;
                Stop::Clone { new }
            }
            libc::PTRACE_EVENT_EXEC => {
                // The tid of the execing thread is now equal to the tgid. If
                // the exec was off the thread-group leader, the old tid is
                // gone, and its state is invalid.
                let evt_data = ptrace::getevent(pid).died_if_esrch(pid)?;
                let former = Pid::from_raw(evt_data as u32 as i32);

                if former != pid {
                    self.remove_tracee(former);
                }

                // We are mid-execve. Force the state so the next syscall-stop
                // is labeled an exit-stop.
                self.set_tracee_state(pid, State::Syscalling);

                Stop::Exec { former }
            }
            libc::PTRACE_EVENT_EXIT => {
                // `PTRACE_GETEVENTMSG` returns the pending wait status as an
                // `unsigned long`; only the low 16-bit word is meaningful.
                let status = ptrace::getevent(pid).died_if_esrch(pid)? as u16;
                let status = ExitStatus::parse_event_status(status)?;

                Stop::Exiting { status }
            }
            _ => {
                // The remaining event codes (seccomp, vfork-done, seize-stop)
                // require option bits or requests this engine never sets.
                internal_error!("unexpected ptrace-event-stop code {} for tracee {}", code, pid)
            }
        };

        Ok(stop)
    }

    // Read the new-child PID carried by a fork/vfork/clone event, and mark it
    // as a tracee pending its attach-stop.
    fn event_child(&mut self, pid: Pid) -> Result<Pid> {
        let evt_data = ptrace::getevent(pid).died_if_esrch(pid)?;
        let new = Pid::from_raw(evt_data as u32 as i32);

        // When restarted, `new` will start as a tracee, but will be delivered
        // a `SIGSTOP`. Mark it so we can recognize that as an attach-stop.
        if !self.tracees.contains_key(&new.as_raw()) {
            info!(pid = new.as_raw(), "following new tracee");
            self.set_tracee_state(new, State::Attaching);
        }

        Ok(new)
    }

    /// Detach from every remaining tracee, letting them run free.
    ///
    /// Detach only succeeds for tracees currently in a ptrace-stop; for the
    /// rest this is best-effort, and the kernel drops the tracing
    /// relationship when the tracer exits anyway.
    pub fn detach_all(&mut self) {
        for pid in self.pids() {
            if let Err(errno) = ptrace::detach(pid, None) {
                debug!(pid = pid.as_raw(), %errno, "detach failed");
            }

            self.remove_tracee(pid);
        }
    }

    /// Drop a tracee from the tracked set, e.g. after it vanished.
    pub fn remove_tracee(&mut self, pid: Pid) {
        if self.tracees.remove(&pid.as_raw()).is_some() {
            info!(pid = pid.as_raw(), "removing tracee");
        }
    }

    /// True once no tracees remain.
    pub fn is_empty(&self) -> bool {
        self.tracees.is_empty()
    }

    /// PIDs of all tracked tracees.
    pub fn pids(&self) -> Vec<Pid> {
        self.tracees.keys().map(|&raw| Pid::from_raw(raw)).collect()
    }

    fn tracee_state(&self, pid: Pid) -> Option<State> {
        self.tracees.get(&pid.as_raw()).copied()
    }

    fn tracee_state_mut(&mut self, pid: Pid) -> Option<&mut State> {
        self.tracees.get_mut(&pid.as_raw())
    }

    fn set_tracee_state(&mut self, pid: Pid, state: State) {
        debug!(pid = pid.as_raw(), ?state, "setting tracee state");

        self.tracees.insert(pid.as_raw(), state);
    }
}

impl Default for Ptracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the general-purpose registers of a stopped tracee.
pub fn registers(pid: Pid) -> Result<Registers> {
    ptrace::getregs(pid).died_if_esrch(pid)
}

const WORD_SIZE: usize = std::mem::size_of::<libc::c_long>();

/// Read `len` bytes from the stopped tracee's memory at `addr`.
///
/// Reads are word-granular `PTRACE_PEEKDATA` requests. A range whose tail
/// word would cross into an unmapped page is completed by re-reading a word
/// that ends exactly at the last requested byte.
pub fn read_memory(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len + WORD_SIZE);

    while data.len() < len {
        let offset = data.len();
        let remaining = len - offset;
        let word_addr = addr + offset as u64;

        match ptrace::read(pid, word_addr as ptrace::AddressType) {
            Ok(word) => data.extend_from_slice(&word.to_ne_bytes()),
            Err(Errno::ESRCH) => {
                return Err(Error::TraceeDied { pid, source: Errno::ESRCH });
            }
            Err(errno) if remaining < WORD_SIZE => {
                // Also covers requests shorter than one word, e.g. the
                // two-byte opcode peek behind the instruction pointer.
                let shifted = match (addr + len as u64).checked_sub(WORD_SIZE as u64) {
                    Some(shifted) => shifted,
                    None => return Err(errno.into()),
                };

                let word = ptrace::read(pid, shifted as ptrace::AddressType).died_if_esrch(pid)?;
                let bytes = word.to_ne_bytes();
                data.extend_from_slice(&bytes[WORD_SIZE - remaining..]);
            }
            Err(errno) => return Err(errno.into()),
        }
    }

    data.truncate(len);
    Ok(data)
}

// `PTRACE_LISTEN` has no nix wrapper; issue the raw request.
fn listen(pid: Pid) -> std::result::Result<(), Errno> {
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_LISTEN,
            libc::pid_t::from(pid.as_raw()),
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
        )
    };

    Errno::result(res).map(drop)
}

// Check if a wait stop with signal delivery is a group-stop.
//
// Assumes attach-stop has already been ruled out.
fn is_group_stop(pid: Pid, sig: Signal) -> Result<bool> {
    use Signal::*;

    match sig {
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
            // Possible group-stop. Check `siginfo` to disambiguate.
            //
            // From the manual:
            //
            //     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
            //     group-stop.  (Other failure codes are possible, such as ESRCH
            //     ("no such process") if a SIGKILL killed the tracee.)
            //
            match ptrace::getsiginfo(pid) {
                Err(Errno::EINVAL) => Ok(true),
                Err(err) => Err(err).died_if_esrch(pid),
                Ok(_) => Ok(false),
            }
        }
        _ => {
            // Definitely not a group-stop.
            //
            // From the manual:
            //
            //     The call can be avoided if the signal is not SIGSTOP, SIGTSTP,
            //     SIGTTIN, or SIGTTOU; only these four signals are stopping signals.
            //     If the tracer sees something else, it can't be a group-stop.
            //
            Ok(false)
        }
    }
}
