//! Filesystem watcher: refresh soon after worktrees change on disk.
//!
//! Events are debounced: every relevant event restarts a quiet-period
//! timer and only its expiry triggers a refresh.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::distributor::{trigger_refresh, RefreshTrigger};
use crate::engine::SnapshotEngine;

#[derive(Debug)]
enum WatcherMessage {
    FsEvent(PathBuf),
    QuietPeriodElapsed,
}

/// Restartable one-shot timer.
struct Debouncer {
    delay: Duration,
    tx: mpsc::UnboundedSender<WatcherMessage>,
    pending: Option<JoinHandle<()>>,
}

impl Debouncer {
    fn new(delay: Duration, tx: mpsc::UnboundedSender<WatcherMessage>) -> Self {
        Self {
            delay,
            tx,
            pending: None,
        }
    }

    fn schedule(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }

        let tx = self.tx.clone();
        let delay = self.delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(WatcherMessage::QuietPeriodElapsed);
        }));
    }

    fn fired(&mut self) {
        self.pending = None;
    }
}

/// Git internals that churn on every command without changing anything a
/// row shows.
pub fn is_relevant_path(path: &Path) -> bool {
    if path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".lock"))
    {
        return false;
    }

    let components: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    !components
        .windows(2)
        .any(|pair| pair[0] == ".git" && pair[1] == "objects")
}

fn matches_supported_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

/// Watch `roots` and refresh `engine` after each quiet period. Runs until
/// the process exits; roots that do not exist are skipped.
pub async fn run_watcher(
    engine: Arc<SnapshotEngine>,
    roots: Vec<PathBuf>,
    debounce: Duration,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WatcherMessage>();
    let watcher_tx = tx.clone();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if !matches_supported_event_kind(&event.kind) {
                    return;
                }
                for path in event.paths {
                    let _ = watcher_tx.send(WatcherMessage::FsEvent(path));
                }
            }
            Err(err) => {
                warn!(
                    component = "watcher",
                    event = "watcher.fs_event_error",
                    error = %err,
                    "Filesystem watcher event error"
                );
            }
        },
        notify::Config::default(),
    )?;

    let mut watched = 0usize;
    for root in &roots {
        if !root.exists() {
            info!(
                component = "watcher",
                event = "watcher.root_missing",
                path = %root.display(),
            );
            continue;
        }
        watcher.watch(root, RecursiveMode::Recursive)?;
        watched += 1;
    }

    info!(
        component = "watcher",
        event = "watcher.started",
        roots = watched,
        debounce_ms = debounce.as_millis() as u64,
        "Filesystem watcher started"
    );

    let mut debouncer = Debouncer::new(debounce, tx);
    while let Some(msg) = rx.recv().await {
        match msg {
            WatcherMessage::FsEvent(path) => {
                if is_relevant_path(&path) {
                    debouncer.schedule();
                }
            }
            WatcherMessage::QuietPeriodElapsed => {
                debouncer.fired();
                debug!(component = "watcher", event = "watcher.quiet_period_elapsed");
                let engine = engine.clone();
                tokio::spawn(async move { trigger_refresh(&engine, RefreshTrigger::Watcher).await });
            }
        }
    }

    // Keep the watcher alive for the whole loop.
    drop(watcher);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_object_and_lock_churn_is_ignored() {
        assert!(!is_relevant_path(Path::new("/wt/p1/f1/.git/objects/ab/cdef")));
        assert!(!is_relevant_path(Path::new("/src/p1/.git/index.lock")));
        assert!(!is_relevant_path(Path::new("/src/p1/.git/refs/heads/f1.lock")));

        assert!(is_relevant_path(Path::new("/wt/p1/f1/src/main.rs")));
        assert!(is_relevant_path(Path::new("/src/p1/.git/worktrees/f1/HEAD")));
        assert!(is_relevant_path(Path::new("/wt/p1/f1/objects/model.rs")));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_fires_once_after_quiet_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(Duration::from_millis(250), tx);

        for _ in 0..5 {
            debouncer.schedule();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(rx.try_recv().is_err(), "still inside the quiet period");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            rx.try_recv(),
            Ok(WatcherMessage::QuietPeriodElapsed)
        ));
        assert!(rx.try_recv().is_err(), "exactly one trigger");
    }

    #[tokio::test(start_paused = true)]
    async fn separated_events_fire_separately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(Duration::from_millis(250), tx);

        debouncer.schedule();
        tokio::time::sleep(Duration::from_millis(300)).await;
        debouncer.fired();
        debouncer.schedule();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut fired = 0;
        while rx.try_recv().is_ok() {
            fired += 1;
        }
        assert_eq!(fired, 2);
    }
}
