//! File-change event queue.
//!
//! The filing system posts an event after every data or metadata write. A
//! background task drains the queue, coalescing bursts, on behalf of the
//! external bookkeeping consumer (the `.gitattributes` manipulator).
//! Failures here are logged and never surfaced to the BBC.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// One changed host file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub volume: String,
    pub path: PathBuf,
}

/// Posting half, cloned into each session's filing system.
#[derive(Debug, Clone)]
pub struct ChangeSender {
    sender: async_channel::Sender<ChangeEvent>,
}

impl ChangeSender {
    pub fn post(&self, volume: &str, path: &Path) {
        let event = ChangeEvent { volume: volume.to_string(), path: path.to_path_buf() };
        if let Err(err) = self.sender.try_send(event) {
            debug!(%err, "dropping file-change event");
        }
    }
}

/// The draining task.
pub struct ChangeQueue;

impl ChangeQueue {
    /// Spawns the coalescing drain task and returns the posting half.
    pub fn spawn() -> (ChangeSender, JoinHandle<()>) {
        let (sender, receiver) = async_channel::unbounded::<ChangeEvent>();
        let handle = tokio::spawn(run(receiver));
        (ChangeSender { sender }, handle)
    }
}

async fn run(receiver: async_channel::Receiver<ChangeEvent>) {
    while let Ok(first) = receiver.recv().await {
        let mut batch = vec![first];
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = receiver.try_recv() {
            batch.push(event);
        }
        batch.dedup();
        for event in &batch {
            debug!(volume = %event.volume, path = %event.path.display(), "file changed");
        }
    }
}
