//! Spawning a child process that is ready to be traced.

use std::env;
use std::ffi::{CString, NulError};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};

use nix::{
    sys::{
        ptrace,
        signal::{kill, Signal},
    },
    unistd::{fork, getpid, ForkResult, Pid},
};
use tracing::debug;

use crate::error::{Error, Result};

/// Command to spawn as a child process to be traced.
#[derive(Clone, Debug)]
pub struct Command {
    /// Argument vector to pass to `execv()`.
    argv: Vec<CString>,
}

impl Command {
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> std::result::Result<Self, NulError> {
        if argv.is_empty() {
            panic!("Command exe required");
        }

        // Ensure we own NUL-terminated strings for the foreign exec call.
        //
        // We're heap-allocating, so always do this before forking.
        let argv: std::result::Result<Vec<_>, _> = argv
            .into_iter()
            .map(CString::new)
            .collect();
        let argv = argv?;

        Ok(Self { argv })
    }

    /// The name of the executable, as given.
    pub fn exe(&self) -> &CString {
        &self.argv[0]
    }

    /// Fork a child that requests to be traced by its parent, stops itself,
    /// and on resume execs the program named by `self.argv[0]`.
    ///
    /// The self-stop lets the parent set trace options on the stopped child
    /// before it has done anything observable. The parent must reap the
    /// readiness stop with `waitpid()`.
    pub fn fork_exec(self) -> Result<Pid> {
        let exe = resolve_exe(self.exe())?;

        // Heap-allocates, and so must occur pre-fork.
        let argv = NullTerminatedPointerArray::new(&self.argv);

        debug!(?exe, "forking tracee");

        // SAFETY: the child branch only makes async-signal-safe calls, and
        // panics (rather than returning) on failure, since `?` conversions
        // may allocate.
        match unsafe { fork() }.map_err(|source| Error::Spawn { source })? {
            ForkResult::Child => {
                if ptrace::traceme().is_err() {
                    panic!("Unable to request traceme");
                }

                // A bare kill(2), not raise(3): libc raise brackets the signal
                // with sigprocmask calls, which would show up as the first
                // traced syscalls after resume.
                if kill(getpid(), Signal::SIGSTOP).is_err() {
                    panic!("Unable to stop self");
                }

                // Use raw `libc::execv`, because the `nix` wrapper heap-
                // allocates a `Vec` internally, which is not async-signal-safe.
                // The environment is inherited.
                unsafe {
                    libc::execv(exe.as_ptr(), argv.as_ptr());
                }

                panic!("Unable to exec tracee");
            }
            ForkResult::Parent { child } => Ok(child),
        }
    }
}

// Resolve the executable name the caller gave us.
//
// A name that refers to an existing file is used verbatim. Anything else is
// looked up in each entry of `$PATH`, in order.
fn resolve_exe(exe: &CString) -> Result<CString> {
    let name = exe.to_string_lossy().into_owned();

    if Path::new(&name).exists() {
        return Ok(exe.clone());
    }

    if let Some(path) = env::var_os("PATH") {
        for dir in env::split_paths(&path) {
            let candidate: PathBuf = dir.join(&name);
            if candidate.exists() {
                let resolved = CString::new(candidate.into_os_string().into_string().map_err(
                    |_| Error::NotFound { name: name.clone() },
                )?)
                .map_err(|_| Error::NotFound { name: name.clone() })?;

                return Ok(resolved);
            }
        }
    }

    Err(Error::NotFound { name })
}

// View of a slice of `CString` values, as a null-terminated array of pointers
// to `c_char`. For passing args to `execv()`.
struct NullTerminatedPointerArray<'a> {
    // Owned pointer array which must always be NULL-terminated.
    array: Vec<*const libc::c_char>,

    // Borrow of pointed-to `CString` data. Pointers in `array` are valid only
    // while we have this borrow.
    _data: &'a [CString],
}

impl<'a> NullTerminatedPointerArray<'a> {
    pub fn new(data: &'a [CString]) -> Self {
        let mut array: Vec<_> = data
            .iter()
            .map(|s| s.as_ptr())
            .collect();
        array.push(std::ptr::null());

        Self { array, _data: data }
    }
}

impl<'a> std::ops::Deref for NullTerminatedPointerArray<'a> {
    type Target = [*const c_char];

    fn deref(&self) -> &Self::Target {
        &self.array
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_absolute_path_verbatim() {
        let exe = CString::new("/bin/sh").unwrap();
        let resolved = resolve_exe(&exe).unwrap();
        assert_eq!(resolved, exe);
    }

    #[test]
    fn test_resolve_searches_path_for_given_name() {
        let exe = CString::new("true").unwrap();
        let resolved = resolve_exe(&exe).unwrap();

        let resolved = resolved.to_string_lossy().into_owned();
        assert!(resolved.ends_with("/true"), "resolved = {}", resolved);
        assert!(Path::new(&resolved).exists());
    }

    #[test]
    fn test_resolve_missing_exe_is_not_found() {
        let exe = CString::new("definitely-not-a-real-binary-1f2e3d").unwrap();
        let err = resolve_exe(&exe).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    #[should_panic]
    fn test_empty_argv_panics() {
        let argv: Vec<&str> = vec![];
        let _ = Command::new(argv);
    }
}
