// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciler trait and the per-controller run loop.
//!
//! A controller owns exactly one tokio task. The task runs the reconciler,
//! records the outcome, then parks in a three-way wait:
//!
//! 1. stop signal (terminal, always checked first)
//! 2. update signal (new spec swapped in, run again immediately)
//! 3. timeout (run interval on success, retry delay on failure)
//!
//! A zero run interval means "run once per update": after a successful run
//! the controller idles until the next update or stop.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Base retry delay used when a spec leaves `error_retry_base` at zero.
pub const DEFAULT_ERROR_RETRY_BASE: Duration = Duration::from_secs(1);

/// A unit of reconciliation work driven by a controller.
///
/// `reconcile` is called repeatedly. The token is cancelled when the
/// controller is stopped; long-running implementations should watch it and
/// return early. `stop` runs exactly once, after the last `reconcile` call
/// has returned.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Run one reconciliation pass.
    async fn reconcile(&self, ctx: &CancellationToken) -> anyhow::Result<()>;

    /// Release resources when the controller stops. Defaults to a no-op.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type StopFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type StopFn = Box<dyn Fn() -> StopFuture + Send + Sync>;

/// Reconciler built from closures. See [`reconcile_fn`].
pub struct FnReconciler<F> {
    run: F,
    stop: Option<StopFn>,
}

/// Build a [`Reconciler`] from an async closure.
///
/// ```ignore
/// let spec = ControllerSpec::new(reconcile_fn(|_ctx| async { Ok(()) }))
///     .with_interval(Duration::from_secs(5));
/// ```
pub fn reconcile_fn<F, Fut>(run: F) -> FnReconciler<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnReconciler { run, stop: None }
}

impl<F> FnReconciler<F> {
    /// Attach a stop function that runs once when the controller stops.
    pub fn with_stop<S, SFut>(mut self, stop: S) -> Self
    where
        S: Fn() -> SFut + Send + Sync + 'static,
        SFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stop = Some(Box::new(move || Box::pin(stop())));
        self
    }
}

#[async_trait]
impl<F, Fut> Reconciler for FnReconciler<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn reconcile(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        (self.run)(ctx.clone()).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        match &self.stop {
            Some(stop) => stop().await,
            None => Ok(()),
        }
    }
}

/// Immutable controller configuration. Swapped as a whole on update.
#[derive(Clone)]
pub struct ControllerSpec {
    /// Work to run on every pass.
    pub reconciler: Arc<dyn Reconciler>,
    /// Delay between successful passes. Zero runs once per update.
    pub run_interval: Duration,
    /// Base delay before retrying a failed pass.
    pub error_retry_base: Duration,
    /// Multiply the retry delay by the number of consecutive failures.
    pub retry_backoff: bool,
    /// Do not retry failures early; wait for the regular interval instead.
    pub no_retry: bool,
}

impl ControllerSpec {
    /// Create a spec that runs `reconciler` once, retrying failures with backoff.
    pub fn new(reconciler: impl Reconciler) -> Self {
        Self::from_arc(Arc::new(reconciler))
    }

    /// Create a spec from an already shared reconciler.
    pub fn from_arc(reconciler: Arc<dyn Reconciler>) -> Self {
        Self {
            reconciler,
            run_interval: Duration::ZERO,
            error_retry_base: DEFAULT_ERROR_RETRY_BASE,
            retry_backoff: true,
            no_retry: false,
        }
    }

    /// Set the run interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.run_interval = interval;
        self
    }

    /// Set the base retry delay.
    pub fn with_error_retry_base(mut self, base: Duration) -> Self {
        self.error_retry_base = base;
        self
    }

    /// Enable or disable linear backoff.
    pub fn with_backoff(mut self, backoff: bool) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Disable early retries after a failure.
    pub fn without_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    /// When to run next after a pass, `None` meaning idle until updated.
    fn next_wake(&self, outcome_ok: bool, consecutive_errors: u32) -> Option<Duration> {
        if outcome_ok || self.no_retry {
            return (!self.run_interval.is_zero()).then_some(self.run_interval);
        }
        Some(retry_delay(
            consecutive_errors,
            self.error_retry_base,
            self.retry_backoff,
        ))
    }
}

impl fmt::Debug for ControllerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerSpec")
            .field("run_interval", &self.run_interval)
            .field("error_retry_base", &self.error_retry_base)
            .field("retry_backoff", &self.retry_backoff)
            .field("no_retry", &self.no_retry)
            .finish_non_exhaustive()
    }
}

/// Delay before the next attempt after `consecutive_errors` failures in a row.
///
/// With backoff the delay grows linearly (`n × base`); without it every retry
/// waits `base`. A zero base falls back to [`DEFAULT_ERROR_RETRY_BASE`].
pub fn retry_delay(consecutive_errors: u32, base: Duration, backoff: bool) -> Duration {
    let base = if base.is_zero() {
        DEFAULT_ERROR_RETRY_BASE
    } else {
        base
    };
    if backoff {
        base.saturating_mul(consecutive_errors.max(1))
    } else {
        base
    }
}

/// Mutable run statistics, guarded by the controller's own mutex.
#[derive(Debug, Default, Clone)]
struct ControllerStats {
    success_count: u64,
    failure_count: u64,
    consecutive_errors: u32,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<DateTime<Utc>>,
    last_error_message: Option<String>,
    last_duration: Option<Duration>,
}

/// Point-in-time snapshot of a controller's statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    /// Controller name.
    pub name: String,
    /// Controller kind tag (e.g. `informer`, `cache-sweep`).
    pub kind: String,
    /// Number of successful passes.
    pub success_count: u64,
    /// Number of failed passes.
    pub failure_count: u64,
    /// Failures since the last success.
    pub consecutive_errors: u32,
    /// When the last successful pass finished.
    pub last_success: Option<DateTime<Utc>>,
    /// When the last failed pass finished.
    pub last_error: Option<DateTime<Utc>>,
    /// Message of the last failure.
    pub last_error_message: Option<String>,
    /// Duration of the last pass in milliseconds.
    pub last_duration_ms: Option<u64>,
    /// Whether the controller has fully terminated.
    pub terminated: bool,
}

/// A running controller. Created and owned by the [`Manager`](crate::manager::Manager).
pub(crate) struct Controller {
    name: String,
    kind: String,
    spec_tx: watch::Sender<ControllerSpec>,
    stop: CancellationToken,
    terminated: CancellationToken,
    stats: Arc<Mutex<ControllerStats>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

enum Wake {
    Stop,
    Update,
    Timeout,
}

impl Controller {
    /// Spawn the run loop for a new controller.
    pub(crate) fn spawn(name: String, kind: String, spec: ControllerSpec) -> Arc<Self> {
        let (spec_tx, spec_rx) = watch::channel(spec);
        let stop = CancellationToken::new();
        let terminated = CancellationToken::new();
        let stats = Arc::new(Mutex::new(ControllerStats::default()));

        let handle = tokio::spawn(run_loop(
            name.clone(),
            spec_rx,
            stop.clone(),
            terminated.clone(),
            stats.clone(),
        ));

        Arc::new(Self {
            name,
            kind,
            spec_tx,
            stop,
            terminated,
            stats,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn kind(&self) -> &str {
        &self.kind
    }

    /// Swap in a new spec and wake the loop.
    pub(crate) fn update(&self, spec: ControllerSpec) {
        self.spec_tx.send_replace(spec);
    }

    /// Signal stop without waiting.
    pub(crate) fn signal_stop(&self) {
        self.stop.cancel();
    }

    /// Wait until the loop has run its stop function and terminated.
    pub(crate) async fn wait_terminated(&self) -> crate::error::Result<()> {
        self.terminated.cancelled().await;

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| crate::error::Error::ControllerTask {
                    name: self.name.clone(),
                    details: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub(crate) async fn status(&self) -> ControllerStatus {
        let stats = self.stats.lock().await.clone();
        ControllerStatus {
            name: self.name.clone(),
            kind: self.kind.clone(),
            success_count: stats.success_count,
            failure_count: stats.failure_count,
            consecutive_errors: stats.consecutive_errors,
            last_success: stats.last_success,
            last_error: stats.last_error,
            last_error_message: stats.last_error_message,
            last_duration_ms: stats.last_duration.map(|d| d.as_millis() as u64),
            terminated: self.terminated.is_cancelled(),
        }
    }
}

async fn run_loop(
    name: String,
    mut spec_rx: watch::Receiver<ControllerSpec>,
    stop: CancellationToken,
    terminated: CancellationToken,
    stats: Arc<Mutex<ControllerStats>>,
) {
    let mut spec = spec_rx.borrow_and_update().clone();
    debug!(controller = %name, spec = ?spec, "Controller started");

    loop {
        let started = Instant::now();
        let outcome = run_pass(spec.reconciler.clone(), stop.child_token()).await;
        let elapsed = started.elapsed();

        let next = {
            let mut stats = stats.lock().await;
            stats.last_duration = Some(elapsed);
            match &outcome {
                Ok(()) => {
                    stats.success_count += 1;
                    stats.consecutive_errors = 0;
                    stats.last_success = Some(Utc::now());
                    debug!(
                        controller = %name,
                        duration_ms = elapsed.as_millis() as u64,
                        "Controller pass succeeded"
                    );
                }
                Err(e) => {
                    stats.failure_count += 1;
                    stats.consecutive_errors = stats.consecutive_errors.saturating_add(1);
                    stats.last_error = Some(Utc::now());
                    stats.last_error_message = Some(format!("{:#}", e));
                    warn!(
                        controller = %name,
                        consecutive_errors = stats.consecutive_errors,
                        error = %format!("{:#}", e),
                        "Controller pass failed"
                    );
                }
            }
            spec.next_wake(outcome.is_ok(), stats.consecutive_errors)
        };

        let wake = match next {
            Some(delay) => tokio::select! {
                biased;

                _ = stop.cancelled() => Wake::Stop,
                changed = spec_rx.changed() => {
                    if changed.is_ok() { Wake::Update } else { Wake::Stop }
                }
                _ = tokio::time::sleep(delay) => Wake::Timeout,
            },
            None => tokio::select! {
                biased;

                _ = stop.cancelled() => Wake::Stop,
                changed = spec_rx.changed() => {
                    if changed.is_ok() { Wake::Update } else { Wake::Stop }
                }
            },
        };

        match wake {
            Wake::Stop => break,
            // An update racing with stop must not trigger another pass.
            Wake::Update if stop.is_cancelled() => break,
            Wake::Update => {
                spec = spec_rx.borrow_and_update().clone();
                debug!(controller = %name, spec = ?spec, "Controller spec updated");
            }
            Wake::Timeout => {}
        }
    }

    if let Err(e) = run_stop(spec.reconciler.clone()).await {
        warn!(controller = %name, error = %format!("{:#}", e), "Controller stop function failed");
    }

    terminated.cancel();
    debug!(controller = %name, "Controller terminated");
}

/// Run one pass in its own task so a panicking reconciler is recorded as a
/// failure instead of killing the loop.
async fn run_pass(reconciler: Arc<dyn Reconciler>, ctx: CancellationToken) -> anyhow::Result<()> {
    let task = tokio::spawn(async move { reconciler.reconcile(&ctx).await });
    match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Reconciler task panicked");
            Err(anyhow::anyhow!("reconciler panicked: {}", e))
        }
    }
}

async fn run_stop(reconciler: Arc<dyn Reconciler>) -> anyhow::Result<()> {
    let task = tokio::spawn(async move { reconciler.stop().await });
    match task.await {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("stop function panicked: {}", e)),
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("terminated", &self.terminated.is_cancelled())
            .finish_non_exhaustive()
    }
}
