//! Collects exit statuses of released workers.
//!
//! Workers leave their slot as soon as the round ends (or is aborted), not
//! when the process is gone. The reaper keeps polling them with
//! `waitpid(WNOHANG)` so none is left a zombie, and escalates aborted
//! workers to SIGKILL once their grace period runs out.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

#[derive(Debug)]
struct Reaping {
    pid: Pid,
    kill_at: Option<Instant>,
}

#[derive(Debug)]
pub struct Reaper {
    pending: Vec<Reaping>,
    kill_grace: Duration,
}

impl Reaper {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            pending: Vec::new(),
            kill_grace,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Track a worker that should exit on its own.
    pub fn adopt(&mut self, pid: Pid) {
        self.pending.push(Reaping { pid, kill_at: None });
        self.poll();
    }

    /// SIGTERM the worker and track it, with SIGKILL after the grace period.
    pub fn terminate(&mut self, pid: Pid) {
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            tracing::debug!(pid = pid.as_raw(), error = %e, "SIGTERM failed");
        }
        self.pending.push(Reaping {
            pid,
            kill_at: Some(Instant::now() + self.kill_grace),
        });
        self.poll();
    }

    /// Collect every worker that has exited and escalate overdue ones.
    pub fn poll(&mut self) {
        let now = Instant::now();
        self.pending.retain_mut(|reaping| {
            if !collect(reaping.pid, Some(WaitPidFlag::WNOHANG)) {
                return false;
            }
            if let Some(kill_at) = reaping.kill_at
                && now >= kill_at
            {
                tracing::warn!(pid = reaping.pid.as_raw(), "Worker ignored SIGTERM, killing");
                let _ = kill(reaping.pid, Signal::SIGKILL);
                reaping.kill_at = None;
            }
            true
        });
    }

    /// Kill and reap everything. Blocks until each worker is gone.
    pub fn shutdown(&mut self) {
        for reaping in self.pending.drain(..) {
            let _ = kill(reaping.pid, Signal::SIGKILL);
            collect(reaping.pid, None);
        }
    }
}

/// Wait for `pid`. Returns true while it is still running.
fn collect(pid: Pid, flags: Option<WaitPidFlag>) -> bool {
    loop {
        return match waitpid(pid, flags) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(WaitStatus::Exited(_, 0)) => {
                tracing::debug!(pid = pid.as_raw(), "Worker exited");
                false
            }
            Ok(WaitStatus::Exited(_, code)) => {
                tracing::warn!(pid = pid.as_raw(), code, "Worker exited with failure");
                false
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                tracing::warn!(pid = pid.as_raw(), ?signal, "Worker killed by signal");
                false
            }
            // Stopped/continued: still ours to collect later.
            Ok(_) => true,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::debug!(pid = pid.as_raw(), error = %e, "waitpid failed");
                false
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_pid_is_dropped() {
        let mut reaper = Reaper::new(Duration::from_millis(10));
        // Not our child: waitpid fails with ECHILD.
        reaper.adopt(Pid::from_raw(i32::MAX - 1));
        assert!(reaper.is_empty());
    }

    #[test]
    fn shutdown_with_nothing_pending() {
        let mut reaper = Reaper::new(Duration::from_millis(10));
        reaper.shutdown();
        assert_eq!(reaper.len(), 0);
    }
}
