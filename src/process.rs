//! Process liveness probing and termination.
//!
//! The registry records the pid of each loop's owning process. Reconciling
//! that record against reality needs a probe that answers "is this pid
//! alive?" without permission to signal the process: signal 0 performs the
//! permission checks but delivers nothing, and a permission-denied result
//! can only come from a live process.

use std::time::{Duration, Instant};

/// Liveness probe over operating-system process ids.
///
/// Implemented by [`SignalProbe`] for real hosts and by scripted fakes in
/// tests, so lifecycle and cleanup logic never shell out in unit tests.
pub trait ProcessInspector: Send + Sync {
    /// Returns true if a process with this pid currently exists.
    ///
    /// Must return a definite answer for any input: pids that never existed
    /// and pids <= 0 are simply not alive.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real inspector using `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl ProcessInspector for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        #[cfg(unix)]
        {
            // SAFETY: signal 0 performs error checking only; no signal is sent.
            let rc = unsafe { libc::kill(pid as i32, 0) };
            if rc == 0 {
                return true;
            }
            // EPERM means the process exists but is owned by someone else.
            std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

/// Sends SIGTERM to a process and waits briefly for it to exit.
///
/// Best effort: returns true if the process is gone by the deadline. The
/// caller marks the session Stopped either way so the registry never wedges
/// on an unreachable process.
pub fn terminate(inspector: &dyn ProcessInspector, pid: u32, wait: Duration) -> bool {
    if !inspector.is_alive(pid) {
        return true;
    }
    #[cfg(unix)]
    {
        // SAFETY: pid is validated non-zero by is_alive above.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if !inspector.is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    !inspector.is_alive(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_alive() {
        let probe = SignalProbe;
        assert!(probe.is_alive(std::process::id()));
    }

    #[test]
    fn test_pid_zero_not_alive() {
        let probe = SignalProbe;
        assert!(!probe.is_alive(0));
    }

    #[test]
    fn test_absurd_pid_not_alive() {
        let probe = SignalProbe;
        // Above any real pid_max; also exercises the i32 overflow guard.
        assert!(!probe.is_alive(u32::MAX));
    }

    #[test]
    fn test_pid_1_alive_despite_permissions() {
        // init/systemd always exists; unprivileged probes get EPERM, which
        // still means alive.
        let probe = SignalProbe;
        assert!(probe.is_alive(1));
    }

    #[test]
    fn test_terminate_dead_pid_is_noop() {
        let probe = SignalProbe;
        assert!(terminate(&probe, u32::MAX - 1, Duration::from_millis(10)));
    }

    #[test]
    fn test_terminate_real_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();
        let probe = SignalProbe;
        assert!(probe.is_alive(pid));
        // Reap concurrently so the terminated child does not linger as a
        // zombie, which the probe would still report as alive.
        let reaper = std::thread::spawn(move || {
            let _ = child.wait();
        });
        assert!(terminate(&probe, pid, Duration::from_secs(2)));
        reaper.join().expect("reaper thread");
    }
}
