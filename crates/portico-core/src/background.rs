//! Periodic maintenance across the container tree.

use crate::concurrency::run_bounded;
use crate::container::Container;
use crate::ContainerError;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug)]
pub struct BackgroundFailure {
    pub container: String,
    pub error: ContainerError,
}

#[derive(Debug, Default)]
pub struct BackgroundReport {
    /// Containers whose own background work ran this round.
    pub processed: usize,
    pub failures: Vec<BackgroundFailure>,
}

impl BackgroundReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Walks a subtree level by level, running each node's background work on
/// at most `threads` workers.
///
/// A node is visited before any of its children. Children with a positive
/// delay run their own periodic thread and are not descended into. A failure
/// at one node is logged and reported but does not keep its siblings or its
/// children from running.
#[derive(Debug, Clone, Copy)]
pub struct BackgroundProcessor {
    threads: usize,
}

impl BackgroundProcessor {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn process(&self, root: &Arc<Container>) -> BackgroundReport {
        let mut report = BackgroundReport::default();
        let mut level = vec![root.clone()];

        while !level.is_empty() {
            let outcomes = run_bounded(&level, self.threads, |container| {
                let outcome = container.background_process();
                let children: Vec<Arc<Container>> = container
                    .find_children()
                    .into_iter()
                    .filter(|child| child.background_processor_delay() <= 0)
                    .collect();
                (container.label().to_owned(), outcome, children)
            });

            level = Vec::new();
            for (label, outcome, children) in outcomes {
                match outcome {
                    Ok(true) => report.processed += 1,
                    Ok(false) => {}
                    Err(error) => {
                        warn!("background processing of {label} failed: {error}");
                        report.failures.push(BackgroundFailure {
                            container: label,
                            error,
                        });
                    }
                }
                level.extend(children);
            }
        }

        debug!(
            "background round under {}: {} processed, {} failed",
            root.label(),
            report.processed,
            report.failures.len()
        );
        report
    }

    /// Run [`process`](Self::process) on `container` every `delay` until the
    /// handle is stopped or the container is dropped.
    pub fn spawn(container: Weak<Container>, delay: Duration, threads: usize) -> BackgroundHandle {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let label = container
            .upgrade()
            .map_or_else(|| "detached".to_owned(), |c| c.label().to_owned());
        let processor = Self::new(threads);

        let spawned = thread::Builder::new()
            .name(format!("background-{label}"))
            .spawn(move || loop {
                match stop_rx.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(container) = container.upgrade() else {
                    break;
                };
                processor.process(&container);
            });

        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("failed to spawn background thread for {label}: {e}");
                None
            }
        };
        BackgroundHandle { stop_tx, thread }
    }
}

/// Owner of a periodic background thread. Dropping it signals the thread;
/// [`stop`](Self::stop) also waits for it.
pub struct BackgroundHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            // Joining ourselves would never return.
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("background thread panicked");
            }
        }
    }
}

impl Drop for BackgroundHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
