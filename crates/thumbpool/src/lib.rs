//! thumbpool: fork-per-request worker pool for video thumbnail extraction.
//!
//! A single-threaded scheduler hands each request to a freshly forked worker
//! over a non-blocking socket pair, so a decoder that blocks, leaks or
//! crashes never takes the request-handling process with it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use thumbpool::{Extraction, ExtractParams, ForkSpawner, Scheduler, SchedulerConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let extractor = |_: &ExtractParams| Extraction::FileNotFound;
//! let spawner = Arc::new(ForkSpawner::new(Arc::new(extractor)));
//! let scheduler = Scheduler::spawn(SchedulerConfig::from_env(), spawner);
//!
//! let job = scheduler.submit(ExtractParams::new("/videos/a.mp4", 30))?;
//! let _jpeg = job.wait().await?;
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

pub mod bridge;
pub mod config;
mod error;
mod job;
pub mod logging;
pub mod pool;
pub mod scheduler;
pub mod worker;

pub use bridge::protocol::{EncodeOptions, ExtractParams, ResultCode, TileSpec};
pub use config::SchedulerConfig;
pub use error::{ErrorClass, ExtractError};
pub use job::ThumbnailJob;
pub use pool::{
    CancelOutcome, ForkSpawner, PoolStatus, RequestId, SlotId, SpawnError, SpawnedWorker,
    WorkerSpawner,
};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle};
pub use worker::{Extraction, Extractor, WorkerExit, run_worker_round};
