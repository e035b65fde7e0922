//! Single-queue ordered execution mode with a stuck-method monitor.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slog::warn;

use crate::dispatch::RecoveryHook;

const SYNC_QUEUE_CAPACITY: usize = 5000;
const MONITOR_TICK: Duration = Duration::from_secs(1);

type Job = Box<dyn FnOnce() + Send>;

struct RunningJob {
    session: u32,
    method: String,
    started: Instant,
}

/// A bounded FIFO queue draining on a single worker thread, serialising every
/// call into one service. A monitor thread ticks every second and calls the
/// recovery hook if the same session has been "current" for too long.
pub struct SyncWorker {
    sender: crossbeam_channel::Sender<Job>,
    current: Arc<Mutex<Option<RunningJob>>>,
}

impl SyncWorker {
    pub fn new(service_name: String, monitor_interval: Duration, recovery: RecoveryHook, log: slog::Logger) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(SYNC_QUEUE_CAPACITY);
        let current: Arc<Mutex<Option<RunningJob>>> = Arc::new(Mutex::new(None));

        thread::Builder::new()
            .name(format!("cluster-server-sync-{}", service_name))
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .expect("failed to spawn synchronous-mode worker thread");

        let monitor_current = Arc::clone(&current);
        let monitor_service_name = service_name.clone();
        thread::Builder::new()
            .name(format!("cluster-server-monitor-{}", service_name))
            .spawn(move || loop {
                thread::sleep(MONITOR_TICK);
                let stuck = monitor_current
                    .lock()
                    .as_ref()
                    .filter(|job| job.started.elapsed() >= monitor_interval)
                    .map(|job| (job.session, job.method.clone(), job.started.elapsed()));
                if let Some((session, method, elapsed)) = stuck {
                    let message = format!(
                        "[endless loop] service={} method={} session={} elapsed={:.1}s",
                        monitor_service_name,
                        method,
                        session,
                        elapsed.as_secs_f64()
                    );
                    warn!(log, "synchronous worker appears stuck"; "message" => &message);
                    recovery(&message);
                }
            })
            .expect("failed to spawn synchronous-mode monitor thread");

        SyncWorker { sender, current }
    }

    /// Enqueues a unit of work; blocks the caller (backpressure) if the queue
    /// is full.
    pub fn submit(&self, session: u32, method: String, job: impl FnOnce() + Send + 'static) {
        let current = Arc::clone(&self.current);
        let tracked_method = method.clone();
        let wrapped: Job = Box::new(move || {
            *current.lock() = Some(RunningJob { session, method: tracked_method, started: Instant::now() });
            job();
            *current.lock() = None;
        });
        let _ = self.sender.send(wrapped);
    }
}

/// Monitor interval with a 1s floor, default 5s.
pub fn clamp_monitor_interval(interval: Duration) -> Duration {
    interval.max(Duration::from_secs(1))
}

pub fn default_monitor_interval() -> Duration {
    Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn submit_runs_jobs_in_fifo_order() {
        let recovery: RecoveryHook = Arc::new(|_msg: &str| {});
        let worker = SyncWorker::new("svc".into(), default_monitor_interval(), recovery, cluster_core::logging::discard());
        let (tx, rx) = mpsc::channel::<u32>();
        for i in 0..5u32 {
            let tx = tx.clone();
            worker.submit(i, "M".into(), move || {
                tx.send(i).unwrap();
            });
        }
        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn monitor_invokes_recovery_hook_for_a_stuck_job() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let recovery: RecoveryHook = Arc::new(move |_msg: &str| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        let worker = SyncWorker::new("stuck-svc".into(), Duration::from_secs(1), recovery, cluster_core::logging::discard());
        worker.submit(7, "Loop".into(), || {
            thread::sleep(Duration::from_secs(3));
        });
        thread::sleep(Duration::from_millis(2200));
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn clamp_monitor_interval_enforces_one_second_floor() {
        assert_eq!(clamp_monitor_interval(Duration::from_millis(200)), Duration::from_secs(1));
        assert_eq!(clamp_monitor_interval(Duration::from_secs(10)), Duration::from_secs(10));
    }
}
