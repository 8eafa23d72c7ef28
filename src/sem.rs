use std::ffi::CString;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

use crate::constants::semaphore;

/// Errors creating the named semaphore
#[derive(Debug, Error)]
pub enum SemError {
    /// The semaphore exists and `force` was not given
    #[error("semaphore '{name}' already exists (use --semaphore-force to replace it)")]
    AlreadyExists {
        /// semaphore name
        name: String,
    },

    /// Name cannot be passed to the OS
    #[error("invalid semaphore name '{name}'")]
    InvalidName {
        /// rejected name
        name: String,
    },

    /// OS-level error from the semaphore calls
    #[error("failed to {op} semaphore '{name}': {source}")]
    Os {
        /// operation that failed
        op: &'static str,
        /// semaphore name
        name: String,
        /// underlying errno
        source: Errno,
    },
}

/// POSIX named counting semaphore created with an initial value of 1.
///
/// Owned by this process: closed and unlinked on drop.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    os_name: CString,
    name: String,
    held: bool,
}

// SAFETY: the semaphore handle is only used from the server thread
unsafe impl Send for NamedSemaphore {}

impl NamedSemaphore {
    /// Create the semaphore. With `force`, an existing semaphore of the same
    /// name is unlinked and recreated; without it, an existing name is an
    /// error.
    pub fn create(name: &str, force: bool) -> Result<Self, SemError> {
        let os_name = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{name}")
        };
        let os_name = CString::new(os_name).map_err(|_| SemError::InvalidName {
            name: name.to_string(),
        })?;

        if force {
            let ret = unsafe { libc::sem_unlink(os_name.as_ptr()) };
            if ret != 0 {
                let errno = Errno::last();
                if errno != Errno::ENOENT {
                    return Err(SemError::Os {
                        op: "unlink",
                        name: name.to_string(),
                        source: errno,
                    });
                }
            }
        }

        let sem = unsafe {
            libc::sem_open(
                os_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o660 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let errno = Errno::last();
            return Err(if errno == Errno::EEXIST {
                SemError::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                SemError::Os {
                    op: "create",
                    name: name.to_string(),
                    source: errno,
                }
            });
        }

        Ok(Self {
            sem,
            os_name,
            name: name.to_string(),
            held: false,
        })
    }

    /// The name as given on the command line
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to acquire within `timeout`. `Ok(false)` means the wait timed out
    /// or was interrupted.
    pub fn try_acquire(&mut self, timeout: Duration) -> Result<bool, Errno> {
        let mut deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) };
        if ret != 0 {
            return Err(Errno::last());
        }
        deadline.tv_sec += timeout.as_secs() as libc::time_t;
        deadline.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec += 1;
            deadline.tv_nsec -= 1_000_000_000;
        }

        let ret = unsafe { libc::sem_timedwait(self.sem, &deadline) };
        if ret == 0 {
            self.held = true;
            return Ok(true);
        }
        match Errno::last() {
            Errno::ETIMEDOUT | Errno::EINTR => Ok(false),
            errno => Err(errno),
        }
    }

    /// Release if currently held; a no-op otherwise
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret != 0 {
            tracing::warn!(
                "failed to release semaphore '{}': {}",
                self.name,
                Errno::last()
            );
        }
    }

    /// Whether the semaphore is currently held by this process
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        self.release();
        unsafe {
            libc::sem_close(self.sem);
            libc::sem_unlink(self.os_name.as_ptr());
        }
    }
}

/// Outcome of one guarded acquisition attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// acquired; must be released after the request
    Held,
    /// not acquired within the wait budget; the request proceeds unguarded
    Degraded,
    /// the error counter reached its maximum; the server must shut down
    Exhausted,
}

/// Named semaphore plus the failure-counter policy around it.
///
/// Isolated acquisition failures decay away; sustained failure trips the
/// counter and shuts the server down, because an external holder that died
/// while holding would otherwise silently race the register banks.
pub struct AccessSemaphore {
    sem: NamedSemaphore,
    error_counter: i64,
}

impl AccessSemaphore {
    pub fn new(sem: NamedSemaphore) -> Self {
        Self {
            sem,
            error_counter: 0,
        }
    }

    /// One acquisition attempt with the 100 ms budget
    pub fn acquire(&mut self) -> Acquire {
        match self.sem.try_acquire(semaphore::MAX_WAIT) {
            Ok(true) => {
                self.on_success();
                Acquire::Held
            }
            Ok(false) => self.failed(),
            Err(errno) => {
                tracing::warn!("semaphore '{}' wait failed: {}", self.sem.name(), errno);
                self.failed()
            }
        }
    }

    fn failed(&mut self) -> Acquire {
        tracing::warn!(
            "Failed to acquire semaphore '{}' within 100ms.",
            self.sem.name()
        );
        if self.on_failure() {
            tracing::error!("Repeatedly failed to acquire the semaphore");
            Acquire::Exhausted
        } else {
            Acquire::Degraded
        }
    }

    /// Release if held
    pub fn release(&mut self) {
        self.sem.release();
    }

    pub(crate) fn on_success(&mut self) {
        self.error_counter = (self.error_counter - semaphore::ERROR_DEC).max(0);
    }

    /// Advance the counter; true once the maximum is reached
    pub(crate) fn on_failure(&mut self) -> bool {
        self.error_counter += semaphore::ERROR_INC;
        self.error_counter >= semaphore::ERROR_MAX
    }

    #[cfg(test)]
    pub(crate) fn error_counter(&self) -> i64 {
        self.error_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(tag: &str) -> String {
        format!("shmbus_sem_test_{}_{tag}", std::process::id())
    }

    #[test]
    fn acquires_and_releases() {
        let name = test_name("basic");
        let mut sem = NamedSemaphore::create(&name, false).unwrap();
        assert!(sem.try_acquire(Duration::from_millis(10)).unwrap());
        assert!(sem.is_held());
        sem.release();
        assert!(!sem.is_held());
        // release when not held is a no-op
        sem.release();
    }

    #[test]
    fn second_acquire_times_out() {
        let name = test_name("contend");
        let mut sem = NamedSemaphore::create(&name, false).unwrap();
        assert!(sem.try_acquire(Duration::from_millis(10)).unwrap());
        // value is 0 now; a second wait must time out
        let held = sem.held;
        sem.held = false; // pretend another process holds it
        assert!(!sem.try_acquire(Duration::from_millis(10)).unwrap());
        sem.held = held;
    }

    #[test]
    fn existing_semaphore_is_an_error_without_force() {
        let name = test_name("force");
        let first = NamedSemaphore::create(&name, false).unwrap();
        assert!(matches!(
            NamedSemaphore::create(&name, false),
            Err(SemError::AlreadyExists { .. })
        ));
        let second = NamedSemaphore::create(&name, true).unwrap();
        drop(first);
        drop(second);
    }

    #[test]
    fn error_counter_decays_and_trips() {
        let name = test_name("counter");
        let sem = NamedSemaphore::create(&name, false).unwrap();
        let mut access = AccessSemaphore::new(sem);

        for _ in 0..99 {
            assert!(!access.on_failure());
        }
        assert_eq!(access.error_counter(), 990);
        // the hundredth consecutive failure trips the limit
        assert!(access.on_failure());

        // J failures followed by K successes: max(0, J*INC - K*DEC)
        let name = test_name("decay");
        let sem = NamedSemaphore::create(&name, false).unwrap();
        let mut access = AccessSemaphore::new(sem);
        for _ in 0..5 {
            access.on_failure();
        }
        for _ in 0..7 {
            access.on_success();
        }
        assert_eq!(access.error_counter(), 43);
        for _ in 0..100 {
            access.on_success();
        }
        assert_eq!(access.error_counter(), 0);
    }
}
