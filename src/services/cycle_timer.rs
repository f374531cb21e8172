//! Adaptive, execution-locked periodic timers
//!
//! Each timer runs its task on an interval derived from the rolling average
//! of recent execution durations: cycles that run long stretch the interval,
//! capped at a fixed multiple of the base. A boolean execution lock makes
//! ticks skip rather than queue, so a task can never overlap itself. Ticks
//! re-check a live liveness condition and stop the timer once it turns false.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::CycleConfig;

const DURATION_WINDOW: usize = 10;

/// Interval policy for a timer service
#[derive(Debug, Clone)]
pub struct TimerConfig {
    pub base_interval: Duration,
    /// Average duration beyond which the interval scales up
    pub slow_threshold: Duration,
    pub max_scale: f64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            slow_threshold: Duration::from_secs(10),
            max_scale: 3.0,
        }
    }
}

impl TimerConfig {
    pub fn from_cycle(config: &CycleConfig) -> Self {
        Self {
            base_interval: Duration::from_secs(config.base_interval_secs),
            slow_threshold: Duration::from_secs(config.slow_threshold_secs),
            max_scale: config.max_interval_scale,
        }
    }
}

/// Observable state of one timer
#[derive(Debug, Clone)]
pub struct TimerStats {
    pub is_running: bool,
    pub execution_lock: bool,
    pub execution_count: u64,
    pub last_execution: Option<DateTime<Utc>>,
    pub average_duration: Option<Duration>,
    pub current_interval: Duration,
}

struct TimerInstance {
    is_running: AtomicBool,
    execution_lock: AtomicBool,
    execution_count: AtomicU64,
    last_execution: Mutex<Option<DateTime<Utc>>>,
    durations: Mutex<VecDeque<Duration>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerInstance {
    fn new() -> Self {
        Self {
            is_running: AtomicBool::new(true),
            execution_lock: AtomicBool::new(false),
            execution_count: AtomicU64::new(0),
            last_execution: Mutex::new(None),
            durations: Mutex::new(VecDeque::with_capacity(DURATION_WINDOW)),
            handle: Mutex::new(None),
        }
    }

    fn record_duration(&self, duration: Duration) {
        let mut durations = self.durations.lock().expect("timer lock poisoned");
        if durations.len() == DURATION_WINDOW {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    fn average_duration(&self) -> Option<Duration> {
        let durations = self.durations.lock().expect("timer lock poisoned");
        if durations.is_empty() {
            return None;
        }
        let total: Duration = durations.iter().sum();
        Some(total / durations.len() as u32)
    }

    /// Base interval stretched by the rolling average, capped.
    fn next_interval(&self, config: &TimerConfig) -> Duration {
        let Some(avg) = self.average_duration() else {
            return config.base_interval;
        };
        if avg <= config.slow_threshold {
            return config.base_interval;
        }
        let scale = (avg.as_secs_f64() / config.slow_threshold.as_secs_f64()).min(config.max_scale);
        config.base_interval.mul_f64(scale)
    }

    /// Run one execution under the lock; false when the lock was held and
    /// the tick was skipped.
    async fn execute<Fut>(&self, fut: Fut) -> bool
    where
        Fut: Future<Output = crate::error::Result<()>>,
    {
        if self.execution_lock.swap(true, Ordering::SeqCst) {
            debug!("tick skipped, execution already in progress");
            return false;
        }

        let started = Instant::now();
        if let Err(e) = fut.await {
            // Task errors are logged, never propagated into the timer
            error!(error = %e, "timer task failed");
        }
        let elapsed = started.elapsed();

        self.record_duration(elapsed);
        self.execution_count.fetch_add(1, Ordering::SeqCst);
        *self.last_execution.lock().expect("timer lock poisoned") = Some(Utc::now());
        self.execution_lock.store(false, Ordering::SeqCst);
        true
    }
}

/// Registry of named adaptive timers
pub struct CycleTimerService {
    config: TimerConfig,
    timers: DashMap<String, Arc<TimerInstance>>,
}

impl CycleTimerService {
    pub fn new(config: TimerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            timers: DashMap::new(),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(TimerConfig::default())
    }

    /// Start a periodic timer under `id`, stopping any existing timer with
    /// the same id first. The timer only starts when `liveness` is
    /// currently true, and every tick re-reads it fresh, stopping the
    /// timer once it turns false.
    pub fn start<L, F, Fut>(self: &Arc<Self>, id: &str, liveness: L, task: F)
    where
        L: Fn() -> bool + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        self.stop(id);

        if !liveness() {
            debug!(id, "timer not started, liveness condition is false");
            return;
        }

        let instance = Arc::new(TimerInstance::new());
        self.timers.insert(id.to_string(), instance.clone());

        let service = Arc::clone(self);
        let timer_id = id.to_string();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            loop {
                let interval = instance.next_interval(&config);
                tokio::time::sleep(interval).await;

                if !instance.is_running.load(Ordering::SeqCst) {
                    break;
                }
                // Liveness is evaluated fresh on every tick
                if !liveness() {
                    info!(id = %timer_id, "liveness condition false, timer stopping itself");
                    instance.is_running.store(false, Ordering::SeqCst);
                    service.timers.remove(&timer_id);
                    break;
                }

                instance.execute(task()).await;
            }
        });

        if let Some(existing) = self.timers.get(id) {
            *existing.handle.lock().expect("timer lock poisoned") = Some(handle);
        }
        info!(id, interval_ms = self.config.base_interval.as_millis() as u64, "timer started");
    }

    /// Stop a timer and remove its instance.
    pub fn stop(&self, id: &str) {
        if let Some((_, instance)) = self.timers.remove(id) {
            instance.is_running.store(false, Ordering::SeqCst);
            if let Some(handle) = instance.handle.lock().expect("timer lock poisoned").take() {
                handle.abort();
            }
            info!(id, "timer stopped");
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    /// Run a task immediately under the timer's lock discipline, outside
    /// the normal schedule. Returns false when the lock was held.
    pub async fn force_execution<Fut>(&self, id: &str, fut: Fut) -> bool
    where
        Fut: Future<Output = crate::error::Result<()>>,
    {
        let Some(instance) = self.timers.get(id).map(|e| e.value().clone()) else {
            debug!(id, "force_execution ignored, no such timer");
            return false;
        };
        instance.execute(fut).await
    }

    pub fn stats(&self, id: &str) -> Option<TimerStats> {
        self.timers.get(id).map(|entry| {
            let instance = entry.value();
            TimerStats {
                is_running: instance.is_running.load(Ordering::SeqCst),
                execution_lock: instance.execution_lock.load(Ordering::SeqCst),
                execution_count: instance.execution_count.load(Ordering::SeqCst),
                last_execution: *instance.last_execution.lock().expect("timer lock poisoned"),
                average_duration: instance.average_duration(),
                current_interval: instance.next_interval(&self.config),
            }
        })
    }
}
