//! On-demand memory statistics dumps.
//!
//! Sending SIGUSR2 to the process writes a snapshot of its memory accounting
//! to a timestamped file under the temporary directory, without interrupting
//! the watch.

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{Local, SecondsFormat};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Install the SIGUSR2 handler. Runs for the lifetime of the process.
pub fn spawn_memdump_handler() -> io::Result<()> {
    let mut usr2 = signal(SignalKind::user_defined2())?;
    tokio::spawn(async move {
        while usr2.recv().await.is_some() {
            match dump_memory_stats() {
                Ok(path) => info!(path = %path.display(), "memory stats dumped"),
                Err(e) => warn!(error = %e, "couldn't write memory stats"),
            }
        }
    });
    Ok(())
}

fn dump_memory_stats() -> io::Result<PathBuf> {
    let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
    let path = env::temp_dir().join(format!("kube2lb-memprof-{timestamp}"));

    let mut contents = fs::read_to_string("/proc/self/status")?;
    // smaps_rollup needs a recent kernel; the status snapshot alone is
    // still useful.
    if let Ok(rollup) = fs::read_to_string("/proc/self/smaps_rollup") {
        contents.push('\n');
        contents.push_str(&rollup);
    }
    fs::write(&path, contents)?;
    Ok(path)
}
