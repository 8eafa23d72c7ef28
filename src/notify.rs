use std::collections::HashSet;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

/// Errors registering or signaling a notification target
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The target process does not exist
    #[error("no process with pid {pid}")]
    NoSuchProcess {
        /// probed pid
        pid: i32,
    },

    /// OS-level error delivering a signal
    #[error("failed to signal process {pid}: {source}")]
    Os {
        /// target pid
        pid: i32,
        /// underlying errno
        source: Errno,
    },
}

/// Set of processes that receive `SIGUSR1` whenever a write command executes.
///
/// The signal is queued with `sigqueue`, carrying the Modbus function code in
/// the integer slot of the signal value, so receivers can tell what kind of
/// write happened without re-reading the whole register bank. Delivery is
/// best-effort: targets that have exited are dropped from the set.
#[derive(Default)]
pub struct Notifier {
    pids: HashSet<Pid>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered processes
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Register a process. The pid is probed with a zero signal first;
    /// a vanished process is a domain error, anything else a system error.
    pub fn add(&mut self, pid: Pid) -> Result<(), NotifyError> {
        match kill(pid, None) {
            Ok(()) => {
                self.pids.insert(pid);
                Ok(())
            }
            Err(Errno::ESRCH) => Err(NotifyError::NoSuchProcess { pid: pid.as_raw() }),
            Err(errno) => Err(NotifyError::Os {
                pid: pid.as_raw(),
                source: errno,
            }),
        }
    }

    /// Send `SIGUSR1` with `function_code` as payload to every registered
    /// process. Vanished targets are collected and removed afterwards with a
    /// warning each; any other delivery error aborts the broadcast.
    pub fn broadcast(&mut self, function_code: u8) -> Result<(), NotifyError> {
        let mut stale = Vec::new();

        for pid in &self.pids {
            let value = libc::sigval {
                sival_ptr: function_code as usize as *mut libc::c_void,
            };
            let ret = unsafe { libc::sigqueue(pid.as_raw(), libc::SIGUSR1, value) };
            if ret != 0 {
                match Errno::last() {
                    Errno::ESRCH => stale.push(*pid),
                    errno => {
                        return Err(NotifyError::Os {
                            pid: pid.as_raw(),
                            source: errno,
                        })
                    }
                }
            }
        }

        for pid in stale {
            self.pids.remove(&pid);
            tracing::warn!("process {pid} no longer exists, removed from the notification list");
        }
        Ok(())
    }
}
