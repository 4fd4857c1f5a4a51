//! Connection manager
//!
//! Owns the session state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Ready
//!                     |           |
//!                     v           v (service disconnected)
//!                  Failed     Disconnected -> Connecting -> ...
//! ```
//!
//! Setup is attempted up to `max_attempts` times with backoff between
//! attempts. A reconnect after a disconnect always waits first, and keeps
//! spending the same budget unless the lost session stayed Ready for
//! `stable_after`. Once the budget is spent the session stays `Failed` until
//! an explicit re-initialization. Every transition into `Ready` starts one
//! catalog fetch and one restoration pass under a per-session cancellation
//! token, so a disconnect abandons whatever that session still had running.

use observability::BillingMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::catalog::CatalogFetcher;
use crate::error::{BillingError, BillingResult, GatewayError, ResponseCode};
use crate::event::BillingEvent;
use crate::gateway::{CommerceGateway, GatewayListener, GatewayNotification};
use crate::processor::ProcessorHandle;
use crate::restore::RestorationReconciler;
use crate::shutdown::run_until_cancelled;
use crate::types::{PurchaseOrigin, PurchaseRecord, SessionId, SessionState};

/// Default connection attempts per connect cycle
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between connection attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(3000);

/// Default upper bound for exponential backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Default Ready time after which a disconnect starts a fresh budget
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_millis(30_000);

/// Backoff shape between connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay doubles on every retry, up to `max_delay`
    Exponential,
}

/// Bounded reconnection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
    pub max_delay: Duration,
    pub stable_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
            backoff: Backoff::Fixed,
            max_delay: DEFAULT_MAX_DELAY,
            stable_after: DEFAULT_STABLE_AFTER,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given retry (1 = first retry after the initial attempt)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                self.delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }
}

impl From<&config::ConnectionConfig> for ReconnectPolicy {
    fn from(config: &config::ConnectionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: Duration::from_millis(config.retry_delay_ms),
            backoff: match config.backoff {
                config::BackoffConfig::Fixed => Backoff::Fixed,
                config::BackoffConfig::Exponential => Backoff::Exponential,
            },
            max_delay: Duration::from_millis(config.max_delay_ms),
            stable_after: Duration::from_millis(config.stable_after_ms),
        }
    }
}

enum SessionCommand {
    Reinitialize {
        reply: oneshot::Sender<BillingResult<()>>,
    },
}

/// Caller-side view of the session
#[derive(Clone, Debug)]
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Fail with `NotReady` unless the session is `Ready`
    pub fn ensure_ready(&self) -> BillingResult<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            state => Err(BillingError::NotReady(state)),
        }
    }

    /// Leave `Failed` and start a fresh connect cycle
    pub async fn reinitialize(&self) -> BillingResult<()> {
        let state = self.state();
        if state != SessionState::Failed {
            return Err(BillingError::invalid_request(format!(
                "reinitialize is only allowed from the failed state (current: {})",
                state
            )));
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Reinitialize { reply })
            .await
            .map_err(|_| BillingError::ShutDown)?;
        rx.await.map_err(|_| BillingError::ShutDown)?
    }
}

/// Connect attempts spent since the last stable session
#[derive(Debug, Default)]
struct Budget {
    used: u32,
    /// Set after an involuntary disconnect; the next attempt waits first
    reconnecting: bool,
}

enum Establish {
    Ready(mpsc::UnboundedReceiver<GatewayNotification>),
    Exhausted { attempts: u32, last: GatewayError },
    Cancelled,
}

enum Serve {
    Disconnected,
    Stopped,
}

/// Drives the session state machine on its own task
pub struct ConnectionManager {
    gateway: Arc<dyn CommerceGateway>,
    policy: ReconnectPolicy,
    bus: Arc<EventBus>,
    catalog: Arc<CatalogFetcher>,
    restorer: Arc<RestorationReconciler>,
    processor: ProcessorHandle,
    state: watch::Sender<SessionState>,
    metrics: BillingMetrics,
}

impl ConnectionManager {
    pub fn new(
        gateway: Arc<dyn CommerceGateway>,
        policy: ReconnectPolicy,
        bus: Arc<EventBus>,
        catalog: Arc<CatalogFetcher>,
        restorer: Arc<RestorationReconciler>,
        processor: ProcessorHandle,
        metrics: BillingMetrics,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            gateway,
            policy,
            bus,
            catalog,
            restorer,
            processor,
            state,
            metrics,
        }
    }

    /// Start connecting; the driver stops when `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> (SessionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let handle = SessionHandle {
            state: self.state.subscribe(),
            commands: commands_tx,
        };
        let task = tokio::spawn(self.run(commands_rx, shutdown));
        (handle, task)
    }

    async fn run(self, mut commands: mpsc::Receiver<SessionCommand>, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        let mut budget = Budget::default();
        'session: loop {
            let notifications = match self.establish(&mut budget, &shutdown).await {
                Establish::Ready(notifications) => notifications,
                Establish::Cancelled => break 'session,
                Establish::Exhausted { attempts, last } => {
                    self.set_state(SessionState::Failed);
                    error!(attempts, error = %last, "Connection setup failed, giving up");
                    let error = BillingError::Setup(last);
                    self.bus.publish(BillingEvent::error(format!(
                        "{} (after {} attempts)",
                        error, attempts
                    )));

                    if self.await_reinitialize(&mut commands, &shutdown).await {
                        budget = Budget::default();
                        continue 'session;
                    }
                    break 'session;
                }
            };

            let session_id: SessionId = Uuid::new_v4();
            let session = shutdown.child_token();
            let ready_at = Instant::now();
            self.set_state(SessionState::Ready);
            info!(%session_id, "Billing session ready");
            self.start_session_tasks(&mut tasks, session_id, &session);

            let outcome = self
                .serve(notifications, &mut commands, &mut tasks, &shutdown)
                .instrument(info_span!("session", %session_id))
                .await;
            session.cancel();

            match outcome {
                Serve::Disconnected => {
                    Self::drain(&mut tasks).await;
                    self.set_state(SessionState::Disconnected);
                    self.bus
                        .publish(BillingEvent::error(BillingError::Disconnected.to_string()));

                    let uptime = ready_at.elapsed();
                    if uptime >= self.policy.stable_after {
                        budget = Budget::default();
                    }
                    budget.reconnecting = true;
                    warn!(
                        %session_id,
                        uptime_ms = uptime.as_millis() as u64,
                        attempts_used = budget.used,
                        "Service disconnected, reconnecting"
                    );
                }
                Serve::Stopped => break 'session,
            }
        }

        tasks.shutdown().await;
        self.set_state(SessionState::Disconnected);
        debug!("Connection manager stopped");
    }

    /// Connect, spending what is left of the attempt budget
    async fn establish(&self, budget: &mut Budget, shutdown: &CancellationToken) -> Establish {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = if budget.reconnecting {
            GatewayError::disconnected()
        } else {
            GatewayError::unavailable("no connection attempt made")
        };

        while budget.used < max_attempts {
            if budget.used > 0 || budget.reconnecting {
                let delay = self.policy.delay_for(budget.used.max(1));
                debug!(
                    attempt = budget.used + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before reconnect"
                );
                if run_until_cancelled(shutdown, tokio::time::sleep(delay)).await.is_none() {
                    return Establish::Cancelled;
                }
            }
            budget.used += 1;
            let attempt = budget.used;

            self.set_state(SessionState::Connecting);
            self.metrics.record_connect_attempt();

            let (listener, notifications) = GatewayListener::channel();
            match run_until_cancelled(shutdown, self.gateway.connect(listener)).await {
                None => return Establish::Cancelled,
                Some(Ok(())) => {
                    info!(attempt, "Connected to commerce backend");
                    return Establish::Ready(notifications);
                }
                Some(Err(e)) => {
                    warn!(attempt, max_attempts, error = %e, "Connection attempt failed");
                    last = e;
                }
            }
        }

        Establish::Exhausted {
            attempts: budget.used,
            last,
        }
    }

    /// Wait for the tasks of an ended session; they are already cancelled
    async fn drain(tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Session task panicked");
                }
            }
        }
    }

    /// Park in `Failed`; true if a re-init was requested
    async fn await_reinitialize(
        &self,
        commands: &mut mpsc::Receiver<SessionCommand>,
        shutdown: &CancellationToken,
    ) -> bool {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return false,
            command = commands.recv() => command,
        };

        match command {
            Some(SessionCommand::Reinitialize { reply }) => {
                info!("Re-initializing billing session");
                let _ = reply.send(Ok(()));
                true
            }
            None => false,
        }
    }

    fn start_session_tasks(
        &self,
        tasks: &mut JoinSet<()>,
        session_id: SessionId,
        session: &CancellationToken,
    ) {
        let catalog = self.catalog.clone();
        let token = session.clone();
        tasks.spawn(
            async move {
                if run_until_cancelled(&token, catalog.fetch()).await.is_none() {
                    debug!("Catalog fetch cancelled");
                }
            }
            .instrument(info_span!("catalog", %session_id)),
        );

        let restorer = self.restorer.clone();
        let token = session.clone();
        tasks.spawn(
            async move {
                match run_until_cancelled(&token, restorer.restore()).await {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => debug!(error = %e, "Restoration stopped"),
                    None => debug!("Restoration cancelled"),
                }
            }
            .instrument(info_span!("restore", %session_id)),
        );
    }

    async fn serve(
        &self,
        mut notifications: mpsc::UnboundedReceiver<GatewayNotification>,
        commands: &mut mpsc::Receiver<SessionCommand>,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Serve {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Serve::Stopped,
                notification = notifications.recv() => match notification {
                    Some(GatewayNotification::ServiceDisconnected) | None => return Serve::Disconnected,
                    Some(GatewayNotification::PurchasesUpdated { code, message, purchases }) => {
                        if !self.dispatch(code, &message, purchases).await {
                            return Serve::Stopped;
                        }
                    }
                },
                Some(command) = commands.recv() => match command {
                    SessionCommand::Reinitialize { reply } => {
                        let _ = reply.send(Err(BillingError::invalid_request(
                            "reinitialize is only allowed from the failed state (current: ready)",
                        )));
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
            }
        }
    }

    /// Route a purchase update; false once the processor has stopped
    async fn dispatch(
        &self,
        code: ResponseCode,
        message: &str,
        purchases: Option<Vec<PurchaseRecord>>,
    ) -> bool {
        match (code, purchases) {
            (ResponseCode::Ok, Some(purchases)) => {
                debug!(count = purchases.len(), "Purchase update received");
                for record in purchases {
                    if self.processor.submit(record, PurchaseOrigin::Live).await.is_err() {
                        return false;
                    }
                }
            }
            (ResponseCode::Ok, None) => {
                self.bus
                    .publish(BillingEvent::error("purchase update carried no purchases"));
            }
            (ResponseCode::UserCanceled, _) => {
                info!("Purchase canceled by user");
                self.bus.publish(BillingEvent::error("purchase canceled by user"));
            }
            (code, _) => {
                let error = GatewayError::new(code, message);
                self.bus
                    .publish(BillingEvent::error(format!("purchase update failed: {}", error)));
            }
        }
        true
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        self.metrics.set_session_state(state.as_gauge());
        if previous != state {
            debug!(from = %previous, to = %state, "Session state changed");
        }
    }
}
