//! Pool mode — spawns and supervises workers.
//!
//! Workers are children of this process, so their default topic
//! (`cluster-<parent pid>`) is the same. Each gets `NODE_APP_INSTANCE=i`,
//! which maps to peer index `i + 1`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::worker::shutdown_signal;

/// Arguments for worker `i` of the pool.
fn worker_args(i: u32, host: &str, base_port: u16, config: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let port = u32::from(base_port)
        .checked_add(i)
        .and_then(|p| u16::try_from(p).ok())
        .with_context(|| format!("port for worker {i} exceeds 65535"))?;
    let mut args = vec![
        "worker".to_string(),
        "--listen".to_string(),
        format!("{host}:{port}"),
    ];
    if let Some(config) = config {
        args.push("--config".to_string());
        args.push(config.display().to_string());
    }
    Ok(args)
}

fn spawn_worker(
    exe: &Path,
    i: u32,
    host: &str,
    base_port: u16,
    config: Option<&Path>,
) -> anyhow::Result<Child> {
    let args = worker_args(i, host, base_port, config)?;
    let child = Command::new(exe)
        .args(&args)
        .env("NODE_APP_INSTANCE", i.to_string())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn worker {i}"))?;
    info!(worker = i, pid = ?child.id(), listen = %args[2], "worker spawned");
    Ok(child)
}

/// Run `workers` children until Ctrl-C or until any of them exits.
pub async fn run_pool(
    workers: u32,
    base_port: u16,
    host: String,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    anyhow::ensure!(workers > 0, "pool needs at least one worker");
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    info!(workers, pid = std::process::id(), "pool starting");

    let mut children = Vec::with_capacity(workers as usize);
    for i in 0..workers {
        children.push(spawn_worker(&exe, i, &host, base_port, config.as_deref())?);
    }

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut handles = Vec::with_capacity(children.len());
    for (i, mut child) in children.into_iter().enumerate() {
        let done_tx = done_tx.clone();
        handles.push(tokio::spawn(async move {
            let status = child.wait().await;
            let _ = done_tx.send((i, status));
        }));
    }

    tokio::select! {
        _ = shutdown_signal() => {}
        Some((i, status)) = done_rx.recv() => {
            match status {
                Ok(status) => warn!(worker = i, %status, "worker exited, stopping pool"),
                Err(e) => warn!(worker = i, error = %e, "failed to wait on worker, stopping pool"),
            }
        }
    }

    // Aborting a waiter drops its child, which kills it.
    for handle in handles {
        handle.abort();
    }
    info!("pool stopped");
    Ok(())
}
