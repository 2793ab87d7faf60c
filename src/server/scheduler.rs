use crate::db::Tsdb;
use crossbeam_channel::{bounded, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

/// The lifecycle scheduler: one background thread that, on each tick,
/// flushes active buckets, applies lifecycle transitions, runs pool GC and
/// compacts archived buckets inside the configured window.
pub struct Scheduler {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(db: Arc<Tsdb>) -> Scheduler {
        let (shutdown, ticks) = bounded::<()>(1);
        let interval = db.settings().gc_interval;
        let handle = std::thread::Builder::new()
            .name("tickdb-scheduler".to_string())
            .spawn(move || {
                info!(?interval, "scheduler running");
                loop {
                    match ticks.recv_timeout(interval) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            if let Err(e) = db.run_maintenance() {
                                error!(error = %e, "maintenance pass failed");
                            }
                        }
                        // shutdown signal or a dropped sender both stop the
                        // loop; flush once more on the way out
                        _ => break,
                    }
                }
                if let Err(e) = db.close() {
                    error!(error = %e, "final flush failed");
                }
                info!("scheduler stopped");
            })
            .expect("spawning the scheduler thread");
        Scheduler {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Signal the thread and wait for its final flush.
    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
