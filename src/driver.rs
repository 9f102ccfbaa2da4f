// src/driver.rs — background driver loop
//
// A single long-lived worker alternates between collecting completed active
// tasks and trying to dispatch one scheduled task. It is the sole mutator of
// the queues apart from the producer-facing entry points, which serialize
// against it through the store and scheduler locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::info;

use crate::sched::Scheduler;

pub struct Driver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Driver {
    /// Spawns the driver thread. `sleep_short` follows productive work,
    /// `sleep_long` an idle pass.
    pub fn spawn(scheduler: Arc<Scheduler>, sleep_short: Duration, sleep_long: Duration) -> Driver {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("labsched-driver".into())
            .spawn(move || {
                info!("driver loop started");
                while !stop_flag.load(Ordering::Relaxed) {
                    let nap = if scheduler.update_active() {
                        sleep_short
                    } else if !scheduler.is_paused() && scheduler.execute_one() {
                        sleep_short
                    } else {
                        sleep_long
                    };
                    interruptible_sleep(&stop_flag, nap);
                }
                info!("driver loop stopped");
            })
            .expect("driver thread spawn");

        Driver {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleeps in small slices so a stop request is noticed quickly even during
/// the long idle nap.
fn interruptible_sleep(stop: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::Relaxed) {
        let nap = remaining.min(slice);
        thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
}
