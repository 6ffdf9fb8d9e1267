//! Non-blocking byte-stream endpoint between the scheduler and one worker.
//!
//! The channel is stateless across steps: it moves whatever bytes the OS
//! accepts right now and reports would-block. Step cursors live in
//! [`StepBuffer`](super::session::StepBuffer).

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// Readiness a blocked step is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Result of a single non-blocking read or write attempt.
#[derive(Debug)]
pub enum IoOutcome {
    Transferred(usize),
    WouldBlock,
    /// Peer closed the stream (0-byte read or write).
    Closed,
    Failed(io::Error),
}

/// Raw byte transport consumed by the transfer state machine.
///
/// Implemented by [`ControlChannel`] for real sockets and by in-memory fakes
/// in tests.
pub trait ChannelIo {
    fn try_read(&mut self, buf: &mut [u8]) -> IoOutcome;

    fn try_write(&mut self, buf: &[u8]) -> IoOutcome;

    /// Block until the channel is ready for `interest`.
    ///
    /// Only used by blocking drivers (the worker side). The default returns
    /// immediately, which makes the caller retry.
    fn wait_ready(&mut self, _interest: Interest) -> io::Result<()> {
        Ok(())
    }
}

/// One end of a Unix socket pair, in non-blocking mode.
#[derive(Debug)]
pub struct ControlChannel {
    stream: UnixStream,
}

impl ControlChannel {
    /// Take ownership of a stream end and switch it to non-blocking mode.
    pub fn from_stream(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }

    /// Read and discard pending bytes until the stream would block or closes.
    ///
    /// Returns the number of bytes discarded.
    pub fn drain(&mut self) -> usize {
        let mut trash = [0u8; 4096];
        let mut discarded = 0;
        loop {
            match self.try_read(&mut trash) {
                IoOutcome::Transferred(n) => discarded += n,
                IoOutcome::WouldBlock | IoOutcome::Closed | IoOutcome::Failed(_) => break,
            }
        }
        discarded
    }
}

impl ChannelIo for ControlChannel {
    fn try_read(&mut self, buf: &mut [u8]) -> IoOutcome {
        loop {
            return match self.stream.read(buf) {
                Ok(0) if !buf.is_empty() => IoOutcome::Closed,
                Ok(n) => IoOutcome::Transferred(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => IoOutcome::Failed(e),
            };
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> IoOutcome {
        loop {
            return match self.stream.write(buf) {
                Ok(0) if !buf.is_empty() => IoOutcome::Closed,
                Ok(n) => IoOutcome::Transferred(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => IoOutcome::Failed(e),
            };
        }
    }

    fn wait_ready(&mut self, interest: Interest) -> io::Result<()> {
        let flags = match interest {
            Interest::Read => PollFlags::POLLIN,
            Interest::Write => PollFlags::POLLOUT,
        };
        loop {
            let mut fds = [PollFd::new(self.stream.as_fd(), flags)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsFd for ControlChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ControlChannel, ControlChannel) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            ControlChannel::from_stream(a).unwrap(),
            ControlChannel::from_stream(b).unwrap(),
        )
    }

    #[test]
    fn empty_socket_would_block() {
        let (mut a, _b) = pair();
        let mut buf = [0u8; 8];
        assert!(matches!(a.try_read(&mut buf), IoOutcome::WouldBlock));
    }

    #[test]
    fn write_then_read() {
        let (mut a, mut b) = pair();
        assert!(matches!(a.try_write(b"hello"), IoOutcome::Transferred(5)));

        let mut buf = [0u8; 16];
        match b.try_read(&mut buf) {
            IoOutcome::Transferred(n) => assert_eq!(&buf[..n], b"hello"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn peer_drop_reads_as_closed() {
        let (mut a, b) = pair();
        drop(b);
        let mut buf = [0u8; 8];
        assert!(matches!(a.try_read(&mut buf), IoOutcome::Closed));
    }

    #[test]
    fn write_to_dropped_peer_fails() {
        let (mut a, b) = pair();
        drop(b);
        // EPIPE; SIGPIPE is ignored by the Rust runtime.
        assert!(matches!(a.try_write(b"x"), IoOutcome::Failed(_)));
    }

    #[test]
    fn drain_discards_everything_pending() {
        let (mut a, mut b) = pair();
        assert!(matches!(a.try_write(&[7u8; 1000]), IoOutcome::Transferred(1000)));
        assert_eq!(b.drain(), 1000);

        let mut buf = [0u8; 1];
        assert!(matches!(b.try_read(&mut buf), IoOutcome::WouldBlock));
    }

    #[test]
    fn wait_ready_returns_once_data_arrives() {
        let (mut a, mut b) = pair();
        assert!(matches!(a.try_write(b"z"), IoOutcome::Transferred(1)));
        b.wait_ready(Interest::Read).unwrap();
        a.wait_ready(Interest::Write).unwrap();
    }
}
