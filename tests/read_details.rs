use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;

use sctrace::SyscallDetails;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn test_piped_reads_reassemble_input() -> Result<()> {
    let (status, events) =
        trace_and_collect(&["sh", "-c", "echo hello | cat > /dev/null"])?;

    assert!(status.success());
    assert_well_formed(&events);

    // Everything read from fd 0 anywhere in the process tree is the pipe
    // payload `cat` consumed, including its empty end-of-file read.
    let stdin_bytes: Vec<u8> = exit_details(&events)
        .into_iter()
        .filter_map(|(_, details)| match details {
            SyscallDetails::Read { fd: 0, data, .. } => Some(data),
            _ => None,
        })
        .flatten()
        .collect();

    assert_eq!(stdin_bytes, b"hello\n".to_vec());

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_read_detail_length_matches_return_value() -> Result<()> {
    let (status, events) = trace_and_collect(&["sh", "-c", "echo hello | cat > /dev/null"])?;

    assert!(status.success());

    for (_, event) in &events {
        if let sctrace::TraceEvent::Syscall(sctrace::SyscallStop::Exit(exit)) = event {
            if let Some(SyscallDetails::Read { data, .. }) = &exit.details {
                assert_eq!(data.len() as i64, exit.retval);
            }
        }
    }

    Ok(())
}
