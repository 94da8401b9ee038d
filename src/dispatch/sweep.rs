//! Background idle sweep.
//!
//! One task for the whole process, independent of any connection. Every
//! `interval` it asks the dispatcher to flush sessions that went quiet with
//! audio still buffered. It stops when [`IdleSweeper::shutdown`] is called.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::dispatch::dispatcher::Dispatcher;

pub struct IdleSweeper {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl IdleSweeper {
    pub fn spawn(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = interval.as_millis() as u64, "Idle sweep started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let flushed = dispatcher.sweep_idle(Instant::now());
                        if flushed > 0 {
                            debug!(flushed, "Idle sweep tick");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Idle sweep stopped");
        });

        Self { handle, shutdown }
    }

    /// Stop the sweep and wait for the task to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
