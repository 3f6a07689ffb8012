//! Start/stop orchestration
//!
//! Every background task in this crate is stopped the same way: a
//! [`ShutdownSignal`] is triggered, the task observes it from inside a
//! `select!`, and the owner joins the task with a bounded timeout, aborting
//! it if the timeout expires. [`Supervisor`] runs a set of [`Service`]s and
//! restarts any that stop unexpectedly.

use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// One-shot, cloneable stop signal
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` only for the call that actually triggered the signal.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once the signal has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Join a task, aborting it if it has not finished within `timeout`.
pub async fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration, name: &str) -> Option<T> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) if e.is_cancelled() => {
            debug!("{} task was cancelled", name);
            None
        }
        Ok(Err(e)) => {
            error!("{} task failed: {}", name, e);
            None
        }
        Err(_) => {
            warn!("{} did not stop within {:?}; aborting", name, timeout);
            abort.abort();
            None
        }
    }
}

/// Join every task in a set within one overall timeout. Returns how many
/// tasks had to be aborted.
pub async fn join_set_with_timeout(tasks: &mut JoinSet<()>, timeout: Duration, name: &str) -> usize {
    let drained = tokio::time::timeout(timeout, async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("{} task failed: {}", name, e);
                }
            }
        }
    })
    .await;

    if drained.is_ok() {
        return 0;
    }
    let remaining = tasks.len();
    warn!("{} {} task(s) did not stop within {:?}; aborting", remaining, name, timeout);
    tasks.shutdown().await;
    remaining
}

/// A component that can be started, stopped and checked for liveness
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Start the service. Starting a running service is a no-op.
    async fn start(&self) -> Result<()>;

    /// Stop the service. Stopping a stopped service is a no-op.
    async fn stop(&self);

    fn is_running(&self) -> bool;
}

struct Watchdog {
    shutdown: ShutdownSignal,
    handle: JoinHandle<()>,
}

/// Starts services in order, stops them in reverse order, and restarts any
/// service found not running while supervised.
pub struct Supervisor {
    services: Vec<Arc<dyn Service>>,
    check_interval: Duration,
    join_timeout: Duration,
    watchdog: Mutex<Option<Watchdog>>,
    started: AtomicBool,
}

impl Supervisor {
    pub fn new(check_interval: Duration, join_timeout: Duration) -> Self {
        Self {
            services: Vec::new(),
            check_interval,
            join_timeout,
            watchdog: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn add(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    pub fn services(&self) -> &[Arc<dyn Service>] {
        &self.services
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Start every service and the watchdog.
    ///
    /// A service that fails to start is left to the watchdog; the first such
    /// error is returned after all services have been attempted.
    pub async fn start_all(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Supervisor already started");
            return Ok(());
        }

        let mut first_error = None;
        for service in &self.services {
            match service.start().await {
                Ok(()) => info!("{} started", service.name()),
                Err(e) => {
                    error!("{} failed to start: {}", service.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(run_watchdog(
            self.services.clone(),
            self.check_interval,
            shutdown.clone(),
        ));
        let previous = self.lock_watchdog().replace(Watchdog { shutdown, handle });
        if let Some(previous) = previous {
            previous.shutdown.trigger();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop the watchdog, then every service in reverse order. Idempotent.
    pub async fn stop_all(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            debug!("Supervisor already stopped");
            return;
        }

        let watchdog = self.lock_watchdog().take();
        if let Some(watchdog) = watchdog {
            watchdog.shutdown.trigger();
            join_with_timeout(watchdog.handle, self.join_timeout, "supervisor watchdog").await;
        }

        for service in self.services.iter().rev() {
            service.stop().await;
            info!("{} stopped", service.name());
        }
    }

    fn lock_watchdog(&self) -> std::sync::MutexGuard<'_, Option<Watchdog>> {
        match self.watchdog.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_watchdog(services: Vec<Arc<dyn Service>>, check_interval: Duration, shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                for service in &services {
                    if shutdown.is_triggered() {
                        break;
                    }
                    if service.is_running() {
                        continue;
                    }
                    warn!("{} is not running; restarting", service.name());
                    if let Err(e) = service.start().await {
                        error!("{} restart failed: {}", service.name(), e);
                    }
                }
            }
        }
    }
    debug!("Supervisor watchdog stopped");
}
