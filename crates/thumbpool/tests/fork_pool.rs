//! End-to-end tests with real forked workers.
//!
//! Runs without the libtest harness: forking is only sound from a
//! single-threaded process, and libtest runs tests on worker threads.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::wait::{WaitPidFlag, waitpid};
use thumbpool::{
    ExtractError, ExtractParams, Extraction, ForkSpawner, Scheduler, SchedulerConfig,
    SchedulerHandle, SlotId,
};

const IGNORE_TERM: i64 = -3;
const HANG: i64 = -2;
const CRASH: i64 = -1;
const PAST_END: i64 = 999;
const KILL_GRACE: Duration = Duration::from_millis(200);

/// Returns the file's bytes as the "thumbnail".
fn file_echo(params: &ExtractParams) -> Extraction {
    match params.second {
        CRASH => std::process::abort(),
        HANG => loop {
            std::thread::sleep(Duration::from_secs(60));
        },
        IGNORE_TERM => {
            // Safety: the worker is single-threaded and installs no handler.
            let _ = unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) };
            let _ = std::fs::write(params.filename.with_extension("ready"), b"");
            loop {
                std::thread::sleep(Duration::from_secs(60));
            }
        }
        PAST_END => Extraction::TimeNotFound,
        _ => match std::fs::read(&params.filename) {
            Ok(bytes) => Extraction::Thumbnail(Bytes::from(bytes)),
            Err(_) => Extraction::FileNotFound,
        },
    }
}

fn start(pool_size: usize) -> SchedulerHandle {
    let config = SchedulerConfig::new()
        .with_pool_size(pool_size)
        .with_reap_interval(Duration::from_millis(20))
        .with_kill_grace(KILL_GRACE);
    let spawner = Arc::new(ForkSpawner::new(Arc::new(file_echo)));
    Scheduler::spawn(config, spawner)
}

fn fixture(dir: &Path, name: &str, len: usize) -> Result<std::path::PathBuf> {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(&path, data).context("writing fixture")?;
    Ok(path)
}

async fn payload_round_trips(dir: &Path) -> Result<()> {
    let handle = start(2);
    let path = fixture(dir, "clip.mp4", 12_345)?;

    let bytes = handle.submit(ExtractParams::new(&path, 1))?.wait().await?;
    ensure!(bytes.len() == 12_345, "got {} bytes", bytes.len());
    ensure!(bytes == std::fs::read(&path)?, "payload differs from source");

    handle.shutdown().await?;
    Ok(())
}

async fn not_found_results(dir: &Path) -> Result<()> {
    let handle = start(1);
    let path = fixture(dir, "short.mp4", 10)?;

    let missing = handle
        .submit(ExtractParams::new(dir.join("missing.mp4"), 1))?
        .wait()
        .await;
    ensure!(missing == Err(ExtractError::FileNotFound), "{missing:?}");

    let past_end = handle.submit(ExtractParams::new(&path, PAST_END))?.wait().await;
    ensure!(past_end == Err(ExtractError::TimeNotFound), "{past_end:?}");

    handle.shutdown().await?;
    Ok(())
}

async fn crash_is_contained(dir: &Path) -> Result<()> {
    let handle = start(1);
    let path = fixture(dir, "after_crash.mp4", 64)?;

    let crashed = handle.submit(ExtractParams::new(&path, CRASH))?;
    let next = handle.submit(ExtractParams::new(&path, 1))?;

    match crashed.wait().await {
        Err(ExtractError::Transport(_)) => {}
        other => bail!("expected transport error, got {other:?}"),
    }
    let bytes = next.wait().await?;
    ensure!(bytes.len() == 64, "got {} bytes", bytes.len());

    handle.shutdown().await?;
    Ok(())
}

async fn more_requests_than_slots(dir: &Path) -> Result<()> {
    let handle = start(2);
    let paths: Vec<_> = (0..6)
        .map(|i| fixture(dir, &format!("batch-{i}.mp4"), 100 + i))
        .collect::<Result<_>>()?;

    let jobs = paths
        .iter()
        .map(|p| handle.submit(ExtractParams::new(p, 0)))
        .collect::<Result<Vec<_>, _>>()?;
    for (i, job) in jobs.into_iter().enumerate() {
        let bytes = job.wait().await?;
        ensure!(bytes.len() == 100 + i, "job {i}: got {} bytes", bytes.len());
    }

    handle.shutdown().await?;
    Ok(())
}

async fn hung_worker_is_aborted(dir: &Path) -> Result<()> {
    let handle = start(1);
    let path = fixture(dir, "hang.mp4", 8)?;

    let hung = handle.submit(ExtractParams::new(&path, HANG))?;
    let next = handle.submit(ExtractParams::new(&path, 1))?;

    while handle.status().await?.busy_slots == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let aborted = handle.force_abort(SlotId::new(0)).await?;
    ensure!(aborted == Some(hung.id()), "aborted {aborted:?}");

    ensure!(hung.wait().await == Err(ExtractError::Cancelled));
    ensure!(next.wait().await?.len() == 8);

    // SIGTERM takes the sleeping worker down; the reaper collects it.
    for _ in 0..100 {
        if handle.status().await?.pending_reap == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    ensure!(handle.status().await?.pending_reap == 0, "worker not reaped");

    handle.shutdown().await?;
    Ok(())
}

async fn stubborn_worker_is_killed_after_grace(dir: &Path) -> Result<()> {
    let handle = start(1);
    let path = fixture(dir, "stubborn.mp4", 8)?;
    let ready = path.with_extension("ready");

    let stubborn = handle.submit(ExtractParams::new(&path, IGNORE_TERM))?;
    while !ready.exists() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let aborted_at = Instant::now();
    ensure!(handle.force_abort(SlotId::new(0)).await? == Some(stubborn.id()));
    ensure!(stubborn.wait().await == Err(ExtractError::Cancelled));

    // SIGTERM is ignored, so the worker outlives the first half of the grace.
    tokio::time::sleep(KILL_GRACE / 2).await;
    ensure!(handle.status().await?.pending_reap == 1, "worker gone before SIGKILL");

    while handle.status().await?.pending_reap > 0 {
        ensure!(aborted_at.elapsed() < Duration::from_secs(5), "worker never killed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let elapsed = aborted_at.elapsed();
    ensure!(elapsed >= KILL_GRACE, "reaped after {elapsed:?}, before the grace ran out");

    handle.shutdown().await?;
    Ok(())
}

async fn shutdown_leaves_no_children(dir: &Path) -> Result<()> {
    let handle = start(2);
    let path = fixture(dir, "shutdown.mp4", 8)?;
    let _a = handle.submit(ExtractParams::new(&path, HANG))?;
    let _b = handle.submit(ExtractParams::new(&path, HANG))?;

    while handle.status().await?.busy_slots < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.shutdown().await?;

    match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
        Err(Errno::ECHILD) => Ok(()),
        other => bail!("children left after shutdown: {other:?}"),
    }
}

fn main() -> Result<()> {
    thumbpool::logging::init_tracing();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let dir = tempfile::tempdir()?;

    runtime.block_on(async {
        let cases: [(&str, _); 7] = [
            ("payload_round_trips", payload_round_trips(dir.path()).await),
            ("not_found_results", not_found_results(dir.path()).await),
            ("crash_is_contained", crash_is_contained(dir.path()).await),
            ("more_requests_than_slots", more_requests_than_slots(dir.path()).await),
            ("hung_worker_is_aborted", hung_worker_is_aborted(dir.path()).await),
            (
                "stubborn_worker_is_killed_after_grace",
                stubborn_worker_is_killed_after_grace(dir.path()).await,
            ),
            ("shutdown_leaves_no_children", shutdown_leaves_no_children(dir.path()).await),
        ];

        let mut failed = 0;
        for (name, result) in cases {
            match result {
                Ok(()) => println!("test {name} ... ok"),
                Err(e) => {
                    println!("test {name} ... FAILED: {e:#}");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            bail!("{failed} fork_pool test(s) failed");
        }
        Ok(())
    })
}
