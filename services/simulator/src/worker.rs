//! Background task plumbing shared by the workers.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Resolves once shutdown is requested or the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Named background tasks joined together on shutdown.
#[derive(Default)]
pub struct WorkerSet {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// True once every task has returned.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|(_, handle)| handle.is_finished())
    }

    /// Wait for every task, giving each up to `timeout`.
    pub async fn join(self, timeout: Duration) {
        for (name, handle) in self.tasks {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!(worker = name, "Worker stopped"),
                Ok(Err(e)) => warn!(worker = name, error = %e, "Worker task panicked"),
                Err(_) => warn!(worker = name, "Worker did not shut down in time"),
            }
        }
    }
}
