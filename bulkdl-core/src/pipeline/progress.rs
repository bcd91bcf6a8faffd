//! Periodic progress reporting.
//!
//! The reporter is its own task: it queries the state store on a fixed
//! cadence and renders one status line. Interactively the line overwrites
//! itself with a carriage return; inside a platform job each tick becomes
//! its own line so the job log keeps the history.

use std::io::Write;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::state::{StateError, StateStore};
use crate::units::MIB;

/// Reporting cadence on an interactive host.
const INTERACTIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Reporting cadence inside a platform job.
const JOB_INTERVAL: Duration = Duration::from_secs(15);

/// Throughput sampling window ceiling.
const MAX_WINDOW: Duration = Duration::from_secs(120);

/// Renders the one-line progress summary for the given sampling window.
///
/// # Errors
///
/// Returns [`StateError`] if the snapshot queries fail.
pub async fn render_line(store: &StateStore, window: Duration) -> Result<String, StateError> {
    let window = window.clamp(Duration::from_secs(1), MAX_WINDOW);
    let snapshot = store.snapshot(window).await?;

    let throughput =
        snapshot.bytes_in_window as f64 / MIB as f64 / window.as_secs_f64();

    Ok(format!(
        "Downloaded {}/{} MiB\t{}/{} parts (~{:.1} MiB/s written to disk, estimated over the last {}s)",
        snapshot.bytes_complete / MIB,
        snapshot.total_bytes / MIB,
        snapshot.parts_complete,
        snapshot.total_parts,
        throughput,
        window.as_secs(),
    ))
}

/// Spawns the reporter task. Send `true` on the watch channel to stop it.
pub(crate) fn spawn(
    store: StateStore,
    inside_job: bool,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = if inside_job {
        JOB_INTERVAL
    } else {
        INTERACTIVE_INTERVAL
    };

    tokio::spawn(async move {
        let started = Instant::now();
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {
                    match render_line(&store, started.elapsed()).await {
                        Ok(line) => emit(&line, inside_job),
                        Err(error) => debug!(%error, "progress query failed"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

/// Writes a progress line to stdout, overwriting in place on a terminal.
pub(crate) fn emit(line: &str, inside_job: bool) {
    if inside_job {
        println!("{line}");
    } else {
        // Pad past the previous line before the carriage return.
        print!("{line:<110}\r");
        let _ = std::io::stdout().flush();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::state::{CompletedPart, PartKind, RegularPart};

    use super::*;

    #[tokio::test]
    async fn line_reports_completed_and_total() {
        let store = StateStore::open_in_memory().await.unwrap();
        store.create_schema().await.unwrap();
        store
            .insert_rows(
                &[
                    RegularPart {
                        file_id: "file-0001".to_string(),
                        project: "project-1".to_string(),
                        name: "a".to_string(),
                        folder: "/d".to_string(),
                        part_id: 1,
                        offset: 0,
                        size: (4 * MIB) as i64,
                        md5: "aa".to_string(),
                        bytes_fetched: 0,
                        done_time_ns: 0,
                    },
                    RegularPart {
                        file_id: "file-0001".to_string(),
                        project: "project-1".to_string(),
                        name: "a".to_string(),
                        folder: "/d".to_string(),
                        part_id: 2,
                        offset: (4 * MIB) as i64,
                        size: (2 * MIB) as i64,
                        md5: "bb".to_string(),
                        bytes_fetched: 0,
                        done_time_ns: 0,
                    },
                ],
                &[],
                &[],
            )
            .await
            .unwrap();
        store
            .mark_complete(&[CompletedPart {
                kind: PartKind::Regular,
                file_id: "file-0001".to_string(),
                part_id: 1,
                size: (4 * MIB) as i64,
                done_time_ns: crate::state::now_ns(),
            }])
            .await
            .unwrap();

        let line = render_line(&store, Duration::from_secs(60)).await.unwrap();
        assert!(line.contains("4/6 MiB"), "{line}");
        assert!(line.contains("1/2 parts"), "{line}");
    }

    #[tokio::test]
    async fn window_is_clamped() {
        let store = StateStore::open_in_memory().await.unwrap();
        store.create_schema().await.unwrap();

        let line = render_line(&store, Duration::from_secs(3600)).await.unwrap();
        assert!(line.contains("last 120s"), "{line}");

        let line = render_line(&store, Duration::ZERO).await.unwrap();
        assert!(line.contains("last 1s"), "{line}");
    }
}
