//! Platform process primitives
//!
//! Liveness checks and imperative termination for OS processes addressed
//! by numeric PID. The lock manager consumes these through the
//! [`ProcessControl`] trait so tests can substitute fakes instead of
//! touching real processes.

use std::io;

/// Liveness and termination capability for processes addressed by PID
pub trait ProcessControl {
    /// Check whether a process with the given PID currently exists
    fn is_alive(&self, pid: u32) -> bool;

    /// Request immediate termination of the process with the given PID
    ///
    /// This is an imperative kill, not a cooperative shutdown signal; the
    /// target gets no chance to veto it.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// [`ProcessControl`] backed by the operating system
///
/// On Unix, uses kill(2); on Windows, OpenProcess/TerminateProcess.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

#[cfg(unix)]
impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        // kill(pid, 0) returns 0 if the process exists and we have permission to signal it
        // ESRCH (No such process) indicates the process doesn't exist
        // EPERM (Operation not permitted) indicates the process exists but we can't signal it
        unsafe {
            let result = libc::kill(pid as libc::pid_t, 0);
            if result == 0 {
                return true;
            }
            let err = io::Error::last_os_error();
            err.raw_os_error() == Some(libc::EPERM)
        }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        use std::ptr;
        use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
        use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle == INVALID_HANDLE_VALUE || handle == ptr::null_mut() {
                return false;
            }
            CloseHandle(handle);
            true
        }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        use std::ptr;
        use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
        use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle == INVALID_HANDLE_VALUE || handle == ptr::null_mut() {
                return Err(io::Error::last_os_error());
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }
}
