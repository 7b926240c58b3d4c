#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use sctrace::{
    stream_trace, Command, ExitStatus, LifecycleEvent, Pid, Syscall, SyscallDetails, SyscallStop,
    TraceEvent,
};

pub type Events = Vec<(Pid, TraceEvent)>;

/// Trace `argv` to completion, collecting every emitted event.
pub fn trace_and_collect(argv: &[&str]) -> anyhow::Result<(ExitStatus, Events)> {
    let cmd = Command::new(argv.to_vec())?;
    let mut events = Events::new();

    let (status, _) = stream_trace(cmd, |pid, event| -> sctrace::Result<ControlFlow<()>> {
        events.push((pid, event.clone()));

        Ok(ControlFlow::Continue(()))
    })?;

    Ok((status, events))
}

/// Syscall kinds of all syscall-enter events, in stream order.
pub fn enter_kinds(events: &Events) -> Vec<Syscall> {
    events
        .iter()
        .filter_map(|(_, event)| match event {
            TraceEvent::Syscall(SyscallStop::Enter(enter)) => Some(enter.syscall),
            _ => None,
        })
        .collect()
}

/// Exit-stop details of all syscall-exit events, with their PIDs.
pub fn exit_details(events: &Events) -> Vec<(Pid, SyscallDetails)> {
    events
        .iter()
        .filter_map(|(pid, event)| match event {
            TraceEvent::Syscall(SyscallStop::Exit(exit)) => {
                exit.details.clone().map(|details| (*pid, details))
            }
            _ => None,
        })
        .collect()
}

/// Check the ordering guarantees of a fully-drained event stream:
///
/// - syscall-enter and syscall-exit alternate strictly per PID, truncated
///   only by the tracee's exit;
/// - a PID only appears after the new-child event that introduced it (the
///   initial tracee is introduced by construction);
/// - nothing mentions a PID after its terminal event.
pub fn assert_well_formed(events: &Events) {
    let mut in_syscall: HashMap<Pid, bool> = HashMap::new();
    let mut dead: HashSet<Pid> = HashSet::new();
    let mut introduced: HashSet<Pid> = HashSet::new();

    if let Some((first, _)) = events.first() {
        introduced.insert(*first);
    }

    for (pid, event) in events {
        assert!(
            !dead.contains(pid),
            "event for terminated tracee {}: {:?}",
            pid,
            event
        );
        assert!(
            introduced.contains(pid),
            "event for unintroduced tracee {}: {:?}",
            pid,
            event
        );

        match event {
            TraceEvent::Syscall(SyscallStop::Enter(_)) => {
                let flag = in_syscall.entry(*pid).or_insert(false);
                assert!(!*flag, "consecutive syscall-enters for {}", pid);
                *flag = true;
            }
            TraceEvent::Syscall(SyscallStop::Exit(_)) => {
                let flag = in_syscall.entry(*pid).or_insert(false);
                assert!(*flag, "syscall-exit without enter for {}", pid);
                *flag = false;
            }
            TraceEvent::Lifecycle(
                LifecycleEvent::Fork { new }
                | LifecycleEvent::Vfork { new }
                | LifecycleEvent::Clone { new },
            ) => {
                introduced.insert(*new);
            }
            TraceEvent::Exited(_) => {
                dead.insert(*pid);
            }
            _ => {}
        }
    }
}
