//! Background checkpointing
//!
//! One supervised thread commits dirty trees and advances the WAL
//! checkpoint on an interval, or sooner when asked.

use crate::registry::TreeRegistry;
use crate::{Result, RidgeError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

enum Command {
    Checkpoint,
    Shutdown,
}

/// Handle to the checkpointer thread
pub struct Checkpointer {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    pub fn start(registry: Arc<TreeRegistry>, interval: Duration) -> Result<Self> {
        // One queued request is enough, they coalesce
        let (tx, rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("ridgeline-checkpointer".into())
            .spawn(move || checkpoint_loop(rx, registry, interval))?;
        info!("Checkpointer started, interval {:?}", interval);
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Ask for a checkpoint without waiting for it
    pub fn request(&self) {
        match self.tx.try_send(Command::Checkpoint) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => debug!("Checkpointer is gone"),
        }
    }

    /// Stop the thread and wait for it
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // A full queue still wakes the loop, and a dead loop needs no signal
        let _ = self.tx.send(Command::Shutdown);
        handle
            .join()
            .map_err(|_| RidgeError::Internal("checkpointer thread panicked".into()))
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{}", e);
        }
    }
}

fn checkpoint_loop(rx: Receiver<Command>, registry: Arc<TreeRegistry>, interval: Duration) {
    loop {
        match rx.recv_timeout(interval) {
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Command::Checkpoint) | Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = registry.checkpoint() {
                    error!("Background checkpoint failed: {}", e);
                }
            }
        }
    }
    debug!("Checkpointer stopped");
}
