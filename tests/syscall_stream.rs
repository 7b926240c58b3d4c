use anyhow::Result;
use ntest::timeout;

use sctrace::{Syscall, SyscallDetails, TraceEvent};

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn test_single_process_stream() -> Result<()> {
    let (status, events) = trace_and_collect(&["/bin/echo", "hello"])?;

    assert!(status.success());
    assert_well_formed(&events);

    let kinds = enter_kinds(&events);

    // The first syscall the stream can observe is the exec that replaces the
    // stopped child's image.
    assert_eq!(kinds.first(), Some(&Syscall::Execve));

    assert!(kinds.contains(&Syscall::Write), "kinds = {:?}", kinds);
    assert!(kinds.contains(&Syscall::ExitGroup), "kinds = {:?}", kinds);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_write_details_materialized() -> Result<()> {
    let (status, events) = trace_and_collect(&["/bin/echo", "hello"])?;

    assert!(status.success());

    let hello = exit_details(&events)
        .into_iter()
        .any(|(_, details)| match details {
            SyscallDetails::Write { fd, data } => fd == 1 && data == b"hello\n",
            _ => false,
        });

    assert!(hello, "no write of b\"hello\\n\" observed");

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_child_processes_are_followed() -> Result<()> {
    // `echo` is not last in the script, so the shell must fork for it
    // instead of exec-ing in place.
    let (status, events) = trace_and_collect(&["sh", "-c", "/bin/echo hello; true"])?;

    assert!(status.success());
    assert_well_formed(&events);

    let initial = events.first().expect("empty event stream").0;

    let new_child = events.iter().any(|(_, event)| {
        matches!(
            event,
            TraceEvent::Lifecycle(
                sctrace::LifecycleEvent::Fork { .. }
                    | sctrace::LifecycleEvent::Vfork { .. }
                    | sctrace::LifecycleEvent::Clone { .. }
            )
        )
    });
    assert!(new_child, "no new-child event observed");

    // The fork itself shows up as a clone-family syscall in the parent.
    let kinds = enter_kinds(&events);
    let forked = kinds.iter().any(|kind| {
        matches!(
            kind,
            Syscall::Clone | Syscall::Clone3 | Syscall::Fork | Syscall::Vfork
        )
    });
    assert!(forked, "kinds = {:?}", kinds);

    // The child, not the shell, performs the write.
    let child_wrote = exit_details(&events)
        .into_iter()
        .any(|(pid, details)| match details {
            SyscallDetails::Write { data, .. } => pid != initial && data == b"hello\n",
            _ => false,
        });
    assert!(child_wrote, "no child write of b\"hello\\n\" observed");

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_rename_shows_up_in_atomic_writes_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("out");
    let target = target.to_str().unwrap();

    let plain = format!("printf aaa > {}", target);
    let atomic = format!("printf aaa > {t}.tmp && mv {t}.tmp {t}", t = target);

    let (status, plain_events) = trace_and_collect(&["sh", "-c", plain.as_str()])?;
    assert!(status.success());

    let (status, atomic_events) = trace_and_collect(&["sh", "-c", atomic.as_str()])?;
    assert!(status.success());

    let is_rename = |kind: &Syscall| {
        matches!(
            kind,
            Syscall::Rename | Syscall::Renameat | Syscall::Renameat2
        )
    };

    assert!(
        !enter_kinds(&plain_events).iter().any(is_rename),
        "plain write should not rename"
    );
    assert!(
        enter_kinds(&atomic_events).iter().any(is_rename),
        "atomic write must rename into place"
    );

    Ok(())
}
