//! Process-wide cancellation signal.
//!
//! Built on channel disconnection: the trigger holds the only sender, and
//! dropping it makes every receiver observably closed. Nothing is ever sent,
//! so observers can both poll (`is_triggered`) and block in a
//! `crossbeam_channel::select!` arm alongside their work queue.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Create a linked trigger/observer pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = bounded::<()>(0);
    (
        ShutdownTrigger {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        Shutdown { rx },
    )
}

/// Fires the cancellation signal. Cloneable; triggering is idempotent.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let sender = self.tx.lock().unwrap().take();
        if sender.is_some() {
            info!("shutdown signal triggered");
        }
        // Dropping the sender disconnects every observer.
    }
}

/// Observer side of the cancellation signal.
#[derive(Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
}

impl Shutdown {
    /// Non-blocking check.
    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver for use in `select!`: it errors out once the signal fires.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}
