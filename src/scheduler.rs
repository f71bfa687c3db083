//! # Scheduler
//! Periodic triggers behind a small interface so the service never talks to
//! wall-clock timers directly.
//!
//! - [`TokioScheduler`]: one `tokio::time::interval` loop per trigger. The
//!   first tick fires immediately, missed ticks are skipped, and a trigger
//!   awaits its own task before ticking again, so it never overlaps itself.
//! - [`ManualScheduler`]: records triggers and runs them on `fire(name)`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Wrap an async closure into a [`TaskFn`].
pub fn task<F, Fut>(f: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as TaskFuture)
}

pub trait Scheduler: Send + Sync {
    fn every(&self, name: &str, period: Duration, task: TaskFn);
    /// Stop all triggers. Safe to call more than once.
    fn shutdown(&self);
}

#[derive(Default)]
pub struct TokioScheduler {
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }
}

impl Scheduler for TokioScheduler {
    fn every(&self, name: &str, period: Duration, task: TaskFn) {
        let label = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tracing::trace!(trigger = %label, "tick");
                task().await;
            }
        });
        tracing::info!(trigger = name, period_s = period.as_secs(), "trigger registered");
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), handle));
    }

    fn shutdown(&self) {
        let drained: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for (name, h) in drained {
            h.abort();
            tracing::debug!(trigger = %name, "trigger stopped");
        }
    }
}

/// Test scheduler: nothing runs until [`ManualScheduler::fire`] is awaited.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<(String, Duration, TaskFn)>>,
    stopped: AtomicBool,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the named trigger once. Returns `false` if it is unknown or the
    /// scheduler has been shut down.
    pub async fn fire(&self, name: &str) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let found = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, t)| t.clone());
        match found {
            Some(t) => {
                t().await;
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(n, _, _)| n.clone())
            .collect()
    }

    pub fn period(&self, name: &str) -> Option<Duration> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, p, _)| *p)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Scheduler for ManualScheduler {
    fn every(&self, name: &str, period: Duration, task: TaskFn) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), period, task));
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
