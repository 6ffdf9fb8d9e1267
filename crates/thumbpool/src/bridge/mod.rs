//! IPC bridge between the scheduler and its worker processes.
//!
//! # Architecture
//!
//! - **protocol**: wire records (parameter header, result codes)
//! - **channel**: non-blocking socket endpoint with try-read/try-write
//! - **session**: resumable step machines for both ends of a round
//! - **transport**: tokio reactor driver for the scheduler end

pub mod channel;
pub mod protocol;
pub mod session;
pub mod transport;
