use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;

use sctrace::ExitStatus;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn test_success_passes_through() -> Result<()> {
    let (status, events) = trace_and_collect(&["true"])?;

    assert_eq!(status, ExitStatus::Exited(0));
    assert!(status.success());
    assert_eq!(status.code(), 0);

    assert_well_formed(&events);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_exit_code_passes_through() -> Result<()> {
    let (status, _) = trace_and_collect(&["sh", "-c", "exit 7"])?;

    assert_eq!(status, ExitStatus::Exited(7));
    assert_eq!(status.code(), 7);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_traced_status_matches_untraced_run() -> Result<()> {
    let traced = trace_and_collect(&["sh", "-c", "exit 3"])?.0;

    let untraced = std::process::Command::new("sh")
        .args(&["-c", "exit 3"])
        .status()?;

    assert_eq!(traced.code(), untraced.code().unwrap());

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_signal_death_maps_to_128_plus_signo() -> Result<()> {
    // The shell segfaults itself; the engine must report the fatal signal
    // and not hang.
    let (status, events) = trace_and_collect(&["sh", "-c", "kill -11 $$"])?;

    match status {
        ExitStatus::Signaled { signal, .. } => {
            assert_eq!(signal, sctrace::Signal::SIGSEGV);
        }
        other => panic!("expected signal death, got {:?}", other),
    }
    assert_eq!(status.code(), 139);

    assert_well_formed(&events);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_descendant_exits_do_not_set_status() -> Result<()> {
    // The inner shell exits 9, but only the initial tracee's exit counts.
    let (status, events) = trace_and_collect(&["sh", "-c", "sh -c 'exit 9'; exit 0"])?;

    assert_eq!(status, ExitStatus::Exited(0));

    assert_well_formed(&events);

    Ok(())
}
