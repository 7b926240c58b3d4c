//! The event stream driver and the public tracing facade.
//!
//! [`Tracer::next_event()`] is the body of the driver loop: it resumes the
//! tracee that last stopped with the continuation its stop calls for, blocks
//! until some tracee reports a status change, and yields one typed event.
//! Consumers pull events lazily and may stop early; [`stream_trace`] folds
//! the sequence through a consumer-supplied sink.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;

use nix::{
    errno::Errno,
    sys::{
        signal,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, warn};

use crate::cmd::Command;
use crate::error::{Error, Result};
use crate::ptracer::{ExitStatus, Pid, Ptracer, Restart, Signal, Stop};
use crate::syscall::{self, SyscallEnter, SyscallExit};

/// One element of the trace event stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TraceEvent {
    Syscall(SyscallStop),

    /// A signal is about to be delivered to the tracee; the engine forwards
    /// it unchanged on resume.
    SignalDelivery { signal: Signal },

    /// A stop-signal took effect against the whole thread group. Resumed with
    /// the listen continuation; nothing is injected.
    GroupStop { signal: Signal },

    /// A process lifecycle transition reported as a ptrace-event-stop.
    Lifecycle(LifecycleEvent),

    /// Terminal for this PID: no further event mentions it.
    Exited(ExitStatus),
}

/// A syscall boundary, decoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyscallStop {
    Enter(SyscallEnter),
    Exit(SyscallExit),
}

/// Process lifecycle transitions the engine subscribes to. New-child events
/// carry the new PID, which is tracked from this point on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleEvent {
    Fork { new: Pid },
    Vfork { new: Pid },
    Clone { new: Pid },
    Exec { former: Pid },
    Exiting { status: ExitStatus },
}

/// Inject a signal into a tracee, immediately.
///
/// This is how a consumer kills or interrupts the tracee in response to
/// observed syscalls. Injection into a vanished PID is silently dropped.
pub fn send_signal(pid: Pid, signal: Signal) -> Result<()> {
    match signal::kill(pid, signal) {
        Err(Errno::ESRCH) => Ok(()),
        other => Ok(other?),
    }
}

/// Driver for the event stream of one spawned tracee and its descendants.
///
/// Owns the tracking table exclusively; all bookkeeping is single-threaded,
/// and consumer code runs between blocking waits.
#[derive(Debug)]
pub struct Tracer {
    ptracer: Ptracer,

    /// The tracee we spawned. Its exit fixes the overall status.
    initial: Pid,
    initial_status: Option<ExitStatus>,

    /// Resume command owed to the tracee that last stopped, applied at the
    /// top of the next `next_event()` call.
    pending_restart: Option<(Pid, Restart)>,

    /// Remembered syscall-enter decodes, per PID, consumed at exit.
    enters: BTreeMap<i32, SyscallEnter>,

    finished: bool,
}

impl Tracer {
    /// Spawn `cmd` and prepare the event stream. The tracee is left stopped
    /// until the first call to [`next_event()`](Self::next_event).
    pub fn spawn(cmd: Command) -> Result<Self> {
        let mut ptracer = Ptracer::new();
        let initial = ptracer.spawn(cmd)?;

        Ok(Self {
            ptracer,
            initial,
            initial_status: None,
            pending_restart: Some((initial, Restart::Syscall(None))),
            enters: BTreeMap::new(),
            finished: false,
        })
    }

    /// PID of the initial tracee.
    pub fn pid(&self) -> Pid {
        self.initial
    }

    /// Advance every tracked tracee to its next reportable stop and return
    /// one typed event, or `None` once no tracees remain.
    ///
    /// Syscall-stops and lifecycle events are resumed toward the next syscall
    /// boundary, the only mode that keeps enter/exit stops symmetric. Signal
    /// deliveries are resumed with the signal injected so the tracee observes
    /// it normally. Group-stops are acknowledged with the listen request.
    pub fn next_event(&mut self) -> Result<Option<(Pid, TraceEvent)>> {
        loop {
            if let Some((pid, restart)) = self.pending_restart.take() {
                if let Err(err) = self.ptracer.restart(pid, restart) {
                    self.recover_vanished(pid, err)?;
                    continue;
                }
            }

            let (pid, stop) = match self.ptracer.wait()? {
                Some(stopped) => stopped,
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            };

            let event = match stop {
                Stop::Attach => {
                    // Readiness stop of a newly-attached tracee: apply trace
                    // options while it has not run yet, suppress the SIGSTOP,
                    // and emit nothing.
                    if let Err(err) = self.ptracer.set_options(pid) {
                        self.recover_vanished(pid, err)?;
                        continue;
                    }

                    self.pending_restart = Some((pid, Restart::Syscall(None)));
                    continue;
                }
                Stop::SyscallEnter => match syscall::decode_enter(pid) {
                    Ok(enter) => {
                        self.enters.insert(pid.as_raw(), enter.clone());
                        self.pending_restart = Some((pid, Restart::Syscall(None)));

                        TraceEvent::Syscall(SyscallStop::Enter(enter))
                    }
                    Err(err) => {
                        self.recover_vanished(pid, err)?;
                        continue;
                    }
                },
                Stop::SyscallExit => {
                    let enter = self.enters.remove(&pid.as_raw());

                    match syscall::decode_exit(pid, enter) {
                        Ok(exit) => {
                            self.pending_restart = Some((pid, Restart::Syscall(None)));

                            TraceEvent::Syscall(SyscallStop::Exit(exit))
                        }
                        Err(err) => {
                            self.recover_vanished(pid, err)?;
                            continue;
                        }
                    }
                }
                Stop::SignalDelivery { signal } => {
                    self.pending_restart = Some((pid, Restart::Syscall(Some(signal))));

                    TraceEvent::SignalDelivery { signal }
                }
                Stop::Group { signal } => {
                    self.pending_restart = Some((pid, Restart::Listen));

                    TraceEvent::GroupStop { signal }
                }
                Stop::Fork { new } => {
                    self.pending_restart = Some((pid, Restart::Syscall(None)));

                    TraceEvent::Lifecycle(LifecycleEvent::Fork { new })
                }
                Stop::Vfork { new } => {
                    self.pending_restart = Some((pid, Restart::Syscall(None)));

                    TraceEvent::Lifecycle(LifecycleEvent::Vfork { new })
                }
                Stop::Clone { new } => {
                    self.pending_restart = Some((pid, Restart::Syscall(None)));

                    TraceEvent::Lifecycle(LifecycleEvent::Clone { new })
                }
                Stop::Exec { former } => {
                    // The enter half of this execve may have been recorded
                    // under a former thread id; drop it so the exit decode
                    // reconstructs cleanly.
                    if former != pid {
                        self.enters.remove(&former.as_raw());
                    }

                    self.pending_restart = Some((pid, Restart::Syscall(None)));

                    TraceEvent::Lifecycle(LifecycleEvent::Exec { former })
                }
                Stop::Exiting { status } => {
                    self.pending_restart = Some((pid, Restart::Syscall(None)));

                    TraceEvent::Lifecycle(LifecycleEvent::Exiting { status })
                }
                Stop::Exited { status } => {
                    self.enters.remove(&pid.as_raw());

                    if pid == self.initial {
                        self.initial_status = Some(status);
                    }

                    TraceEvent::Exited(status)
                }
            };

            return Ok(Some((pid, event)));
        }
    }

    /// The initial tracee's exit status, as observed so far.
    pub fn exit_status(&self) -> ExitStatus {
        self.initial_status.unwrap_or(ExitStatus::Vanished)
    }

    /// Stop driving the stream: detach every remaining tracee and reap
    /// whatever has already terminated, so no tracee is left stopped
    /// indefinitely and no zombie is leaked.
    ///
    /// Idempotent; called by `Drop` if the consumer has not done so.
    pub fn finish(&mut self) -> Result<ExitStatus> {
        if !self.finished {
            self.finished = true;
            self.ptracer.detach_all();
        }

        // Always sweep: a tracee that vanished mid-stream may have left a
        // terminal status we never consumed.
        self.reap();

        Ok(self.exit_status())
    }

    // Consume any terminal statuses that are already available, without
    // blocking. Detached tracees still running are no longer our problem;
    // already-dead ones must not linger as zombies.
    fn reap(&mut self) {
        let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;

        loop {
            match wait::waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    debug!(?status, "reaped terminated tracee");

                    if let (Some(pid), Some(status)) = (status.pid(), terminal_status(&status)) {
                        if pid == self.initial && self.initial_status.is_none() {
                            self.initial_status = Some(status);
                        }
                    }
                }
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    warn!(%errno, "reap failed");
                    break;
                }
            }
        }
    }

    // Handle an operation that failed because `pid` vanished: drop the PID
    // from the tracked set and keep going. Anything else is fatal.
    fn recover_vanished(&mut self, pid: Pid, err: Error) -> Result<()> {
        if !err.tracee_died() {
            return Err(err);
        }

        warn!(pid = pid.as_raw(), "tracee vanished mid-operation, dropping");

        self.ptracer.remove_tracee(pid);
        self.enters.remove(&pid.as_raw());

        Ok(())
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

fn terminal_status(status: &WaitStatus) -> Option<ExitStatus> {
    match *status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
        WaitStatus::Signaled(_, signal, core_dumped) => {
            Some(ExitStatus::Signaled { signal, core_dumped })
        }
        _ => None,
    }
}

/// Spawn `cmd`, feed the event stream to `sink`, and return the initial
/// tracee's exit status together with the sink's result.
///
/// The sink is pull-driven: it is handed one event at a time and decides
/// whether to continue or terminate early by returning `Break`. It may call
/// [`send_signal`] at any event. Sink errors propagate after the remaining
/// tracees have been driven to a safe state.
pub fn stream_trace<R, F>(cmd: Command, mut sink: F) -> Result<(ExitStatus, Option<R>)>
where
    F: FnMut(Pid, &TraceEvent) -> Result<ControlFlow<R>>,
{
    let mut tracer = Tracer::spawn(cmd)?;
    let mut sink_result = None;

    loop {
        let (pid, event) = match tracer.next_event() {
            Ok(Some(stopped)) => stopped,
            Ok(None) => break,
            Err(err) => {
                let _ = tracer.finish();
                return Err(err);
            }
        };

        match sink(pid, &event) {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(result)) => {
                sink_result = Some(result);
                break;
            }
            Err(err) => {
                let _ = tracer.finish();
                return Err(err);
            }
        }
    }

    let status = tracer.finish()?;

    Ok((status, sink_result))
}

/// Spawn `cmd`, print a one-line summary of every event to stdout, and
/// return the initial tracee's exit status.
pub fn trace_to_exit(cmd: Command) -> Result<ExitStatus> {
    let (status, _) = stream_trace(cmd, |pid, event| -> Result<ControlFlow<()>> {
        println!("{}: {}", pid, event);

        Ok(ControlFlow::Continue(()))
    })?;

    Ok(status)
}

// One line per event; these summaries are the whole output of the printing
// facade.
impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Syscall(stop) => write!(f, "{}", stop),
            TraceEvent::SignalDelivery { signal } => write!(f, "--- {:?} ---", signal),
            TraceEvent::GroupStop { signal } => write!(f, "--- group stop ({:?}) ---", signal),
            TraceEvent::Lifecycle(event) => write!(f, "{}", event),
            TraceEvent::Exited(status) => write!(f, "+++ {} +++", status),
        }
    }
}

impl fmt::Display for SyscallStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallStop::Enter(enter) => {
                write!(f, "{}(", enter.syscall)?;
                for (i, arg) in enter.args.0.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:#x}", arg)?;
                }
                write!(f, ") ...")
            }
            SyscallStop::Exit(exit) => {
                write!(f, "{}(...) = {}", exit.enter.syscall, exit.retval)
            }
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Fork { new } => write!(f, "fork -> {}", new),
            LifecycleEvent::Vfork { new } => write!(f, "vfork -> {}", new),
            LifecycleEvent::Clone { new } => write!(f, "clone -> {}", new),
            LifecycleEvent::Exec { former } => write!(f, "exec (former {})", former),
            LifecycleEvent::Exiting { status } => write!(f, "exiting ({})", status),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with {}", code),
            ExitStatus::Signaled { signal, core_dumped } => {
                write!(f, "killed by {:?}", signal)?;
                if *core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            }
            ExitStatus::Vanished => write!(f, "vanished"),
        }
    }
}
