use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::Pid;

/// The signal set that stops the server.
///
/// Deliberately conservative: it includes several signals that should never
/// arrive in normal operation; any of them means stop.
pub fn termination_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGIO, // aka SIGPOLL
        Signal::SIGPIPE,
        Signal::SIGPROF,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGVTALRM,
    ] {
        set.add(signal);
    }
    set
}

/// What a readable termination fd turned out to mean
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermEvent {
    /// stop the server
    Terminate,
    /// `SIGUSR1` from `pid`: a registration request for write notifications
    Register(Pid),
}

/// A file descriptor that becomes readable when the process should stop.
///
/// The production variant routes the blocked termination-signal set through a
/// signalfd; the raw variant lets tests drive termination through a pipe.
pub enum TermFd {
    /// signalfd over the blocked termination set
    Signals(SignalFd),
    /// any readable byte means terminate
    Raw(std::fs::File),
}

impl TermFd {
    /// Block the termination signals for the process and route them to a
    /// signalfd. Must be called before any other thread starts.
    pub fn install() -> Result<Self, Errno> {
        let mask = termination_signals();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC)?;
        Ok(TermFd::Signals(fd))
    }

    /// Use an arbitrary fd (e.g. the read end of a pipe) as termination fd
    pub fn from_fd(fd: OwnedFd) -> Self {
        TermFd::Raw(std::fs::File::from(fd))
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            TermFd::Signals(fd) => fd.as_fd(),
            TermFd::Raw(file) => file.as_fd(),
        }
    }

    /// Consume one readiness event. Only call after the fd polled readable.
    pub fn read_event(&mut self) -> Result<TermEvent, Errno> {
        match self {
            TermFd::Signals(fd) => match fd.read_signal()? {
                Some(info) => {
                    if info.ssi_signo == Signal::SIGUSR1 as u32 {
                        Ok(TermEvent::Register(Pid::from_raw(info.ssi_pid as i32)))
                    } else {
                        Ok(TermEvent::Terminate)
                    }
                }
                // cannot happen on a blocking signalfd that polled readable
                None => Ok(TermEvent::Terminate),
            },
            TermFd::Raw(file) => {
                let mut buf = [0u8; 8];
                let _ = file.read(&mut buf);
                Ok(TermEvent::Terminate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn termination_set_is_conservative() {
        let set = termination_signals();
        for signal in [
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGHUP,
            Signal::SIGIO,
            Signal::SIGPIPE,
            Signal::SIGPROF,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
            Signal::SIGVTALRM,
        ] {
            assert!(set.contains(signal), "{signal} missing");
        }
        assert!(!set.contains(Signal::SIGSEGV));
    }

    #[test]
    fn raw_fd_reads_as_terminate() {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        let mut term = TermFd::from_fd(rx);
        std::fs::File::from(tx).write_all(&[1]).unwrap();
        assert_eq!(term.read_event().unwrap(), TermEvent::Terminate);
    }
}
