//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Fixed-delay polling tasks, one per target.
//!
//! The first tick runs immediately and the next one is scheduled only after the previous
//! tick completed, so a slow endpoint never sees overlapping calls from the same task.
//! A tick that panics is logged and the task keeps its schedule.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::attribute::AttributeRef;

/// What a polling task is polling on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PollTarget {
    /// The agent's dedicated heartbeat request.
    Heartbeat,
    /// A linked attribute.
    Attribute(AttributeRef),
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollTarget::Heartbeat => f.write_str("heartbeat"),
            PollTarget::Attribute(attribute) => attribute.fmt(f),
        }
    }
}

/// Returned by a tick to keep or end its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

struct PollingTask {
    interval: Duration,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PollingTask {
    fn stop(self) {
        // An in-flight tick finishes; the loop exits before sleeping again.
        let _ = self.cancel.send(true);
    }
}

/// Owns the polling tasks of one agent.
pub struct PollingScheduler {
    min_interval: Duration,
    tasks: Mutex<HashMap<PollTarget, PollingTask>>,
}

impl PollingScheduler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Requested interval raised to the configured floor.
    pub fn effective_interval(&self, requested: Duration) -> Duration {
        requested.max(self.min_interval)
    }

    /// Start polling `target`, replacing any existing task for it. Must be called from
    /// within a tokio runtime. Returns the effective interval.
    pub fn schedule<F, Fut>(
        &self,
        target: PollTarget,
        requested: Duration,
        mut tick: F,
    ) -> Duration
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send + 'static,
    {
        let interval = self.effective_interval(requested);
        if interval > requested {
            debug!(
                poll_target = %target,
                requested_ms = requested.as_millis() as u64,
                effective_ms = interval.as_millis() as u64,
                "polling interval raised to floor"
            );
        }

        let (cancel, mut cancelled) = watch::channel(false);
        let label = target.to_string();
        let handle = tokio::spawn(async move {
            let mut sequence = 0_u64;
            loop {
                if *cancelled.borrow() {
                    break;
                }
                sequence += 1;
                let control = match AssertUnwindSafe(tick(sequence)).catch_unwind().await {
                    Ok(control) => control,
                    Err(_) => {
                        error!(poll_target = %label, tick = sequence, "polling tick panicked");
                        TickControl::Continue
                    }
                };
                if control == TickControl::Stop {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(poll_target = %label, ticks = sequence, "polling task finished");
        });

        let task = PollingTask {
            interval,
            cancel,
            handle,
        };
        if let Some(previous) = self.tasks.lock().insert(target, task) {
            previous.stop();
        }
        interval
    }

    /// Stop the task for `target`. Unknown or already-cancelled targets are a no-op.
    pub fn cancel(&self, target: &PollTarget) -> bool {
        match self.tasks.lock().remove(target) {
            Some(task) => {
                task.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every task; returns how many were running.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PollingTask> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        let count = drained.len();
        drained.into_iter().for_each(PollingTask::stop);
        count
    }

    /// Whether a live task exists for `target`.
    pub fn is_scheduled(&self, target: &PollTarget) -> bool {
        self.tasks
            .lock()
            .get(target)
            .is_some_and(|task| !task.handle.is_finished())
    }

    pub fn interval_of(&self, target: &PollTarget) -> Option<Duration> {
        self.tasks.lock().get(target).map(|task| task.interval)
    }

    pub fn scheduled_targets(&self) -> Vec<PollTarget> {
        self.tasks.lock().keys().cloned().collect()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("min_interval", &self.min_interval)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, Instant};

    fn attr(name: &str) -> PollTarget {
        PollTarget::Attribute(AttributeRef::new("meter-1", name))
    }

    fn counting(counter: Arc<AtomicU64>) -> impl FnMut(u64) -> futures::future::Ready<TickControl> {
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(TickControl::Continue)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_raised_to_floor() {
        let scheduler = PollingScheduler::new(Duration::from_millis(5_000));
        assert_eq!(
            scheduler.effective_interval(Duration::from_millis(1_000)),
            Duration::from_millis(5_000)
        );
        assert_eq!(
            scheduler.effective_interval(Duration::from_millis(7_000)),
            Duration::from_millis(7_000)
        );

        let counter = Arc::new(AtomicU64::new(0));
        let effective = scheduler.schedule(
            attr("power"),
            Duration::from_millis(1_000),
            counting(counter.clone()),
        );
        assert_eq!(effective, Duration::from_millis(5_000));
        assert_eq!(scheduler.interval_of(&attr("power")), Some(effective));

        sleep(Duration::from_millis(10_500)).await;
        // t=0, t=5000, t=10000
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_use_fixed_delay() {
        let scheduler = PollingScheduler::new(Duration::from_millis(100));
        let starts = Arc::new(Mutex::new(Vec::new()));
        let origin = Instant::now();
        let recorded = starts.clone();
        scheduler.schedule(attr("slow"), Duration::from_millis(1_000), move |_| {
            recorded.lock().push(origin.elapsed());
            async {
                sleep(Duration::from_millis(500)).await;
                TickControl::Continue
            }
        });

        sleep(Duration::from_millis(3_200)).await;
        let starts = starts.lock().clone();
        assert_eq!(
            starts,
            vec![
                Duration::ZERO,
                Duration::from_millis(1_500),
                Duration::from_millis(3_000)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_tick_keeps_schedule() {
        let scheduler = PollingScheduler::new(Duration::from_millis(1_000));
        let counter = Arc::new(AtomicU64::new(0));
        let seen = counter.clone();
        scheduler.schedule(attr("flaky"), Duration::from_millis(1_000), move |sequence| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if sequence == 1 {
                    panic!("boom");
                }
                TickControl::Continue
            }
        });

        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_scheduled(&attr("flaky")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_ticks_and_is_idempotent() {
        let scheduler = PollingScheduler::new(Duration::from_millis(1_000));
        let counter = Arc::new(AtomicU64::new(0));
        scheduler.schedule(attr("power"), Duration::from_millis(1_000), counting(counter.clone()));
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert!(scheduler.cancel(&attr("power")));
        assert!(!scheduler.cancel(&attr("power")));
        assert!(!scheduler.cancel(&attr("unknown")));
        assert!(!scheduler.cancel(&PollTarget::Heartbeat));

        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_scheduled(&attr("power")));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_task() {
        let scheduler = PollingScheduler::new(Duration::from_millis(1_000));
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));
        scheduler.schedule(attr("power"), Duration::from_millis(1_000), counting(first.clone()));
        sleep(Duration::from_millis(10)).await;
        scheduler.schedule(attr("power"), Duration::from_millis(2_000), counting(second.clone()));

        sleep(Duration::from_millis(4_500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.scheduled_targets(), vec![attr("power")]);
        assert_eq!(scheduler.cancel_all(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_control_ends_the_task() {
        let scheduler = PollingScheduler::new(Duration::from_millis(1_000));
        let counter = Arc::new(AtomicU64::new(0));
        let seen = counter.clone();
        scheduler.schedule(PollTarget::Heartbeat, Duration::from_millis(1_000), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(TickControl::Stop)
        });
        sleep(Duration::from_millis(3_000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(&PollTarget::Heartbeat));
    }
}
