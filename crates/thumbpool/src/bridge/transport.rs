//! Reactor integration for the scheduler end of a [`ControlChannel`].
//!
//! The session is advanced eagerly. Readiness is awaited only after a step
//! reports would-block, and the descriptor is registered for that step's
//! interest alone. A round writes the request and then reads the reply, so
//! it re-registers at most once. Readiness is cleared only when the guarded
//! attempt actually hit would-block.

use std::io;

use tokio::io::unix::AsyncFd;

use super::channel::{ControlChannel, Interest};
use super::session::{Advance, ExtractOutcome, SchedulerSession, TransferError};

fn reactor_interest(interest: Interest) -> tokio::io::Interest {
    match interest {
        Interest::Read => tokio::io::Interest::READABLE,
        Interest::Write => tokio::io::Interest::WRITABLE,
    }
}

/// A [`ControlChannel`] registered with the tokio reactor.
///
/// Dropping it deregisters the descriptor and closes the stream.
#[derive(Debug)]
pub struct AsyncControlChannel {
    /// `None` only if re-registration failed, which also fails the round.
    inner: Option<AsyncFd<ControlChannel>>,
    interest: Interest,
}

impl AsyncControlChannel {
    /// Register for writing, which is what a round starts with.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(channel: ControlChannel) -> io::Result<Self> {
        let interest = Interest::Write;
        Ok(Self {
            inner: Some(AsyncFd::with_interest(channel, reactor_interest(interest))?),
            interest,
        })
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    fn fd(&mut self) -> io::Result<&mut AsyncFd<ControlChannel>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel deregistered"))
    }

    /// Switch the reactor registration to `interest`.
    fn watch(&mut self, interest: Interest) -> io::Result<()> {
        if self.interest == interest && self.inner.is_some() {
            return Ok(());
        }
        let fd = self
            .inner
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel deregistered"))?;
        let channel = fd.into_inner();
        self.inner = Some(AsyncFd::with_interest(channel, reactor_interest(interest))?);
        self.interest = interest;
        Ok(())
    }

    /// Drive one scheduler round to completion.
    pub async fn run_round(
        &mut self,
        session: &mut SchedulerSession,
    ) -> Result<ExtractOutcome, TransferError> {
        let io_err = |session: &SchedulerSession, source| TransferError::Io {
            step: session.step(),
            source,
        };

        let channel = self.fd().map_err(|e| io_err(session, e))?.get_mut();
        let mut interest = match session.advance(channel)? {
            Advance::Done(outcome) => return Ok(outcome),
            Advance::Blocked(interest) => interest,
        };

        loop {
            self.watch(interest).map_err(|e| io_err(session, e))?;
            let fd = self.fd().map_err(|e| io_err(session, e))?;
            let ready = match interest {
                Interest::Read => fd.readable_mut().await,
                Interest::Write => fd.writable_mut().await,
            };
            let mut guard = ready.map_err(|e| io_err(session, e))?;

            match session.advance(guard.get_inner_mut())? {
                Advance::Done(outcome) => return Ok(outcome),
                Advance::Blocked(next) => {
                    if next == interest {
                        guard.clear_ready();
                    }
                    interest = next;
                }
            }
        }
    }

    /// Discard whatever the worker already wrote.
    pub fn drain(&mut self) -> usize {
        self.inner.as_mut().map_or(0, |fd| fd.get_mut().drain())
    }
}
