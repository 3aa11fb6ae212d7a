use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cloneable stop flag for background maintenance loops.
///
/// Loops `select!` on [`ShutdownSignal::cancelled`] next to their tick:
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let signal = shutdown.clone();
/// tokio::spawn(async move {
///     loop {
///         tokio::select! {
///             _ = signal.cancelled() => break,
///             _ = interval.tick() => sweep(),
///         }
///     }
/// });
/// shutdown.trigger();
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Flip the flag. Returns `false` if shutdown was already triggered.
    pub fn trigger(&self) -> bool {
        let first = self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if first {
            info!("shutdown triggered");
        } else {
            debug!("shutdown already triggered");
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called. Returns
    /// immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of `self`, so this only
        // errors if every handle is gone, which also means "stop".
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// BackgroundTasks
// ---------------------------------------------------------------------------

/// Outcome of [`BackgroundTasks::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Tasks that exited on their own after the signal.
    pub finished: Vec<String>,
    /// Tasks aborted because they missed the deadline.
    pub aborted: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

/// Named set of spawned loops sharing one [`ShutdownSignal`].
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    signal: ShutdownSignal,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The signal handed to every tracked task.
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Track an already spawned task.
    pub async fn track(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.handles.lock().await.push((name.into(), handle));
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Trigger the signal, then wait up to `grace` for every task to exit.
    /// Stragglers are aborted.
    pub async fn shutdown(&self, grace: Duration) -> DrainReport {
        self.signal.trigger();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = DrainReport::default();

        for (name, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.finished.push(name),
                Ok(Err(e)) => {
                    warn!(task = %name, error = %e, "background task ended abnormally");
                    report.finished.push(name);
                }
                Err(_) => {
                    warn!(task = %name, "background task missed shutdown deadline, aborting");
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }
        info!(
            finished = report.finished.len(),
            aborted = report.aborted.len(),
            "background tasks drained"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.clone().is_triggered());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        // Already triggered: returns immediately.
        signal.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_tasks_abort_stragglers() {
        let tasks = BackgroundTasks::new();
        let polite = tasks.signal();
        tasks
            .track(
                "polite",
                tokio::spawn(async move { polite.cancelled().await }),
            )
            .await;
        tasks
            .track(
                "stubborn",
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }),
            )
            .await;
        assert_eq!(tasks.len().await, 2);

        let report = tasks.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.finished, vec!["polite".to_string()]);
        assert_eq!(report.aborted, vec!["stubborn".to_string()]);
        assert!(!report.is_clean());
        assert_eq!(tasks.len().await, 0);
    }
}
