//! Worker side: one round per forked child.
//!
//! The child receives the parameter record, runs the [`Extractor`], sends the
//! result and exits. It drives the same [`WorkerSession`] state machine as the
//! tests do, blocking in `poll(2)` between steps.
//!
//! ## Safety contracts
//!
//! The child-setup helpers run between `fork()` and `_exit()`:
//! 1. The parent runs a current-thread runtime, so no other scheduler thread
//!    holds locks the child could need.
//! 2. Every descriptor closed here is owned by the child's copy of the table;
//!    the parent's descriptors are unaffected.
//! 3. Nothing in the child returns into the parent's call stack.

use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;

use crate::bridge::channel::{ChannelIo, ControlChannel, Interest};
use crate::bridge::protocol::{ExtractParams, ResultCode};
use crate::bridge::session::{
    Advance, StepBuffer, StepIo, TransferError, WorkerEvent, WorkerSession,
};

/// Extraction result as produced by the extraction backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Thumbnail(Bytes),
    FileNotFound,
    TimeNotFound,
    Failed(String),
}

impl Extraction {
    fn into_wire(self) -> (ResultCode, Bytes) {
        match self {
            Self::Thumbnail(bytes) => (ResultCode::Ok, bytes),
            Self::FileNotFound => (ResultCode::FileNotFound, Bytes::new()),
            Self::TimeNotFound => (ResultCode::TimeNotFound, Bytes::new()),
            Self::Failed(reason) => {
                tracing::warn!(%reason, "Extraction failed");
                (ResultCode::GENERIC, Bytes::new())
            }
        }
    }
}

/// Decode/scale/encode backend run inside the worker.
///
/// It may block, allocate heavily or crash; a crash takes down only the
/// worker process.
pub trait Extractor: Send + Sync {
    fn extract(&self, params: &ExtractParams) -> Extraction;
}

impl<F> Extractor for F
where
    F: Fn(&ExtractParams) -> Extraction + Send + Sync,
{
    fn extract(&self, params: &ExtractParams) -> Extraction {
        self(params)
    }
}

/// Worker process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Result fully flushed.
    Completed,
    /// Parameters never arrived intact.
    ParamsNotReceived,
    ResultNotSent,
    SetupFailed,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::ParamsNotReceived => 1,
            Self::ResultNotSent => 2,
            Self::SetupFailed => 3,
        }
    }
}

fn drive<C: ChannelIo + ?Sized>(
    session: &mut WorkerSession,
    io: &mut C,
) -> Result<WorkerEvent, TransferError> {
    loop {
        match session.advance(io)? {
            Advance::Done(event) => return Ok(event),
            Advance::Blocked(interest) => io.wait_ready(interest).map_err(|source| {
                TransferError::Io {
                    step: session.step(),
                    source,
                }
            })?,
        }
    }
}

/// Best effort: the channel may already be broken.
fn send_generic_error<C: ChannelIo + ?Sized>(io: &mut C) {
    let mut code = StepBuffer::outgoing(ResultCode::GENERIC.to_wire().to_ne_bytes());
    loop {
        match code.write_to(io) {
            StepIo::WouldBlock => {
                if io.wait_ready(Interest::Write).is_err() {
                    return;
                }
            }
            StepIo::Complete | StepIo::Error(_) => return,
        }
    }
}

/// Run one round: receive parameters, extract, send the result.
pub fn run_worker_round<C: ChannelIo + ?Sized>(io: &mut C, extractor: &dyn Extractor) -> WorkerExit {
    let mut session = WorkerSession::new();

    let params = match drive(&mut session, io) {
        Ok(WorkerEvent::Params(params)) => params,
        Ok(WorkerEvent::Flushed) => return WorkerExit::ParamsNotReceived,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to receive parameters");
            send_generic_error(io);
            return WorkerExit::ParamsNotReceived;
        }
    };

    tracing::debug!(
        filename = %params.filename.display(),
        second = params.second,
        "Extracting thumbnail"
    );

    let extraction = panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(&params)))
        .unwrap_or_else(|_| Extraction::Failed("extractor panicked".to_string()));
    let (code, payload) = extraction.into_wire();

    let flushed = session
        .respond(code, payload)
        .and_then(|()| drive(&mut session, io));
    match flushed {
        Ok(_) => WorkerExit::Completed,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to send result");
            WorkerExit::ResultNotSent
        }
    }
}

/// Close every descriptor except stdio and `keep`.
pub fn close_inherited_fds(keep: RawFd) {
    let open: Vec<RawFd> = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect(),
        Err(_) => {
            let max = nix::unistd::sysconf(nix::unistd::SysconfVar::OPEN_MAX)
                .ok()
                .flatten()
                .unwrap_or(1024)
                .min(65_536) as RawFd;
            (0..max).collect()
        }
    };

    for fd in open.into_iter().filter(|fd| *fd > 2 && *fd != keep) {
        // Safety: see module docs. The read_dir handle is already dropped, so
        // EBADF for its number is expected and ignored.
        unsafe {
            libc::close(fd);
        }
    }
}

/// Put the forked child into a clean state before the round.
///
/// `parent` is the scheduler pid captured before `fork()`.
pub fn prepare_child(keep: RawFd, parent: nix::unistd::Pid) -> io::Result<()> {
    use nix::sys::signal::{SigHandler, Signal, signal};

    close_inherited_fds(keep);

    for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGUSR1] {
        // Safety: SIG_DFL installs no handler code.
        unsafe { signal(sig, SigHandler::SigDfl) }.map_err(io::Error::from)?;
    }

    #[cfg(target_os = "linux")]
    {
        nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(io::Error::from)?;
        // The parent may have died before pdeathsig was armed.
        if nix::unistd::getppid() != parent {
            return Err(io::Error::other("scheduler exited during worker setup"));
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = parent;

    Ok(())
}

/// Child entry point after `fork()`. Never returns into the caller's stack.
pub fn worker_main(
    stream: std::os::unix::net::UnixStream,
    parent: nix::unistd::Pid,
    extractor: &dyn Extractor,
) -> ! {
    use std::os::fd::AsRawFd;

    let exit = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Err(e) = prepare_child(stream.as_raw_fd(), parent) {
            tracing::error!(error = %e, "Worker setup failed");
            return WorkerExit::SetupFailed;
        }
        let mut channel = match ControlChannel::from_stream(stream) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(error = %e, "Worker channel setup failed");
                return WorkerExit::SetupFailed;
            }
        };
        run_worker_round(&mut channel, extractor)
    }))
    .unwrap_or(WorkerExit::SetupFailed);

    // Safety: _exit skips atexit handlers and destructors inherited from the
    // parent, none of which belong to this process.
    unsafe { libc::_exit(exit.code()) }
}
