//! Cluster connection manager
//!
//! Owns one resilient logical connection to the Redis Cluster. The manager
//! is an explicit object constructed once and passed by reference to
//! consumers; it holds the only handle to the underlying cluster client.
//!
//! Lifecycle: `Connecting -> Ready <-> Degraded -> Closed`. Before the first
//! successful connection, failures are retried a bounded number of times and
//! `init` fails fatally when the budget is exhausted. After first success,
//! reconnects are unbounded, run in the background, and never fail callers
//! that already resolved.
//!
//! # Example
//!
//! ```no_run
//! use roomcast_cluster::{ClusterConfig, ClusterManager};
//!
//! # async fn example() -> Result<(), roomcast_cluster::ClusterError> {
//! let config = ClusterConfig::from_env()?;
//! let manager = ClusterManager::new(config);
//! manager.init().await?;
//!
//! manager.set("room:lobby:topic", "welcome").await?;
//! let topic = manager.get("room:lobby:topic").await?;
//! println!("topic: {:?}", topic);
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::health::{HealthTracker, HealthTransition};
use crate::state::{ConnectionState, StateCell};

/// Resilient connection to a Redis Cluster with a typed command surface.
///
/// Cheap to share via [`Arc`]; all methods take `&self`.
pub struct ClusterManager {
    pub(crate) config: Arc<ClusterConfig>,
    pub(crate) state: StateCell,
    pub(crate) conn: RwLock<Option<ClusterConnection>>,
    cancel: CancellationToken,
    started: AtomicBool,
    ever_ready: AtomicBool,
    init_error: StdMutex<Option<ClusterError>>,
    lifecycle: StdMutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Creates a manager in the `Connecting` state without touching the
    /// network. Call [`ClusterManager::init`] to start connecting.
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            state: StateCell::new(ConnectionState::Connecting),
            conn: RwLock::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            ever_ready: AtomicBool::new(false),
            init_error: StdMutex::new(None),
            lifecycle: StdMutex::new(None),
        })
    }

    /// Starts the connection lifecycle in the background without waiting
    /// for readiness. Idempotent; the first call wins.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.state.get().is_terminal() {
            return;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_lifecycle().await;
        });
        *self.lifecycle.lock().expect("lifecycle lock poisoned") = Some(handle);
    }

    /// Starts the connection lifecycle and resolves once the first
    /// connection succeeds.
    ///
    /// Pre-connect failures are retried up to the configured budget with
    /// capped backoff; on exhaustion this returns a fatal
    /// [`ClusterError::Connection`] and the manager stays `Closed`.
    /// Authentication failures are fatal immediately. Calling `init` again
    /// just waits for readiness.
    pub async fn init(self: &Arc<Self>) -> Result<(), ClusterError> {
        self.start();
        self.wait_for_ready().await
    }

    /// Suspends the caller until the first successful connection.
    ///
    /// Fails with [`ClusterError::NotStarted`] if `init` was never called,
    /// and with the recorded fatal error if the manager closed before ever
    /// becoming ready. Returns immediately once the first connection has
    /// happened, even if the connection is currently degraded.
    pub async fn wait_for_ready(&self) -> Result<(), ClusterError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ClusterError::NotStarted);
        }
        if self.ever_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.await_first_connection().await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Watch receiver observing lifecycle transitions
    /// (`Ready`/`Degraded`/`Closed`).
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connection configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Gracefully closes the connection.
    ///
    /// Idempotent: repeat calls are no-ops returning success. Cancels the
    /// lifecycle task, all internal timers, and any suspended waiters.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        self.close().await;
        let handle = self.lifecycle.lock().expect("lifecycle lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        if self.state.set(ConnectionState::Closed).is_some() {
            tracing::info!("cluster connection closed");
        }
        *self.conn.write().await = None;
    }

    /// Waits for the `Connecting -> Ready` edge or a terminal close.
    async fn await_first_connection(&self) -> Result<(), ClusterError> {
        let mut rx = self.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Ready | ConnectionState::Degraded => return Ok(()),
                ConnectionState::Closed => return Err(self.init_failure()),
                ConnectionState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(ClusterError::NotConnected);
            }
        }
    }

    /// Error to surface for callers that waited on a connection that never
    /// became ready.
    fn init_failure(&self) -> ClusterError {
        match &*self.init_error.lock().expect("init error lock poisoned") {
            Some(ClusterError::Auth(msg)) => ClusterError::Auth(msg.clone()),
            Some(other) => ClusterError::Connection(other.to_string()),
            None => ClusterError::NotConnected,
        }
    }

    async fn run_lifecycle(self: Arc<Self>) {
        let conn = match self.establish_first_connection().await {
            Some(conn) => conn,
            None => return,
        };

        *self.conn.write().await = Some(conn);
        self.ever_ready.store(true, Ordering::SeqCst);
        self.state.set(ConnectionState::Ready);
        tracing::info!(
            nodes = %self.config.describe_nodes(),
            "cluster connection established"
        );

        self.supervise().await;
    }

    /// Bounded pre-connect retry loop.
    ///
    /// Returns `None` once the manager is `Closed` (budget exhausted, fatal
    /// error, or shutdown); the cause is recorded for `init` to surface.
    async fn establish_first_connection(&self) -> Option<ClusterConnection> {
        let mut failed = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                self.state.set(ConnectionState::Closed);
                return None;
            }

            match self.try_connect().await {
                Ok(conn) => return Some(conn),
                Err(err) if err.is_fatal() => {
                    tracing::error!(error = %err, "fatal error while connecting to cluster");
                    *self.init_error.lock().expect("init error lock poisoned") = Some(err);
                    self.state.set(ConnectionState::Closed);
                    return None;
                }
                Err(err) => {
                    failed += 1;
                    if !self.config.retry.allows_pre_connect_attempt(failed) {
                        tracing::error!(
                            error = %err,
                            attempts = failed,
                            "pre-connect retry budget exhausted"
                        );
                        *self.init_error.lock().expect("init error lock poisoned") =
                            Some(ClusterError::Connection(format!(
                                "no connection after {} attempts: {}",
                                failed, err
                            )));
                        self.state.set(ConnectionState::Closed);
                        return None;
                    }

                    let delay = self.config.retry.delay(failed - 1);
                    tracing::warn!(
                        error = %err,
                        attempt = failed,
                        delay_ms = delay.as_millis() as u64,
                        "cluster connection attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.state.set(ConnectionState::Closed);
                            return None;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Post-connect supervision: periodic health checks, degraded detection,
    /// unbounded background reconnects.
    async fn supervise(&self) {
        let mut tracker = HealthTracker::new(self.config.health.failure_threshold);
        let mut ticker = tokio::time::interval(self.config.health.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.probe().await {
                Ok(()) => {
                    if tracker.record_success() == Some(HealthTransition::Recovered) {
                        self.state.set(ConnectionState::Ready);
                        tracing::info!("cluster connection recovered");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "cluster health check failed");
                    if tracker.record_failure() == Some(HealthTransition::Degraded) {
                        self.state.set(ConnectionState::Degraded);
                        tracing::error!(
                            threshold = self.config.health.failure_threshold,
                            "cluster connection degraded"
                        );
                        if self.rebuild_connection().await {
                            tracker.record_success();
                            self.state.set(ConnectionState::Ready);
                            tracing::info!("cluster connection recovered");
                            ticker.reset();
                        } else {
                            return;
                        }
                    }
                }
            }

            if self.state.get().is_terminal() {
                return;
            }
        }
    }

    /// Unbounded reconnect loop entered from a degraded window.
    ///
    /// The stale connection stays in place until a replacement is ready, so
    /// commands keep being attempted during the window. Returns `false` when
    /// cancelled or closed by a fatal error.
    async fn rebuild_connection(&self) -> bool {
        let mut attempt = 0u32;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry.delay(attempt)) => {}
            }

            match self.try_connect().await {
                Ok(conn) => {
                    *self.conn.write().await = Some(conn);
                    return true;
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(error = %err, "fatal error while reconnecting to cluster");
                    self.close().await;
                    return false;
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        error = %err,
                        attempt = attempt,
                        "cluster reconnect attempt failed"
                    );
                }
            }
        }
    }

    /// One connection attempt against the configured topology, verified
    /// with a PING round-trip before being handed out.
    async fn try_connect(&self) -> Result<ClusterConnection, ClusterError> {
        let mut builder = ClusterClientBuilder::new(self.config.node_urls());
        if let Some(password) = &self.config.password {
            builder = builder.password(password.clone());
        }
        let client = builder.retries(self.config.max_redirections).build()?;

        let connect_timeout = self.config.connect_timeout();
        let mut conn = tokio::time::timeout(connect_timeout, client.get_async_connection())
            .await
            .map_err(|_| {
                ClusterError::Connection(format!(
                    "timed out connecting to cluster after {:?}",
                    connect_timeout
                ))
            })??;

        let pong: String =
            tokio::time::timeout(connect_timeout, redis::cmd("PING").query_async(&mut conn))
                .await
                .map_err(|_| {
                    ClusterError::Connection("timed out waiting for PING response".to_string())
                })??;
        if pong != "PONG" {
            return Err(ClusterError::Connection(format!(
                "unexpected PING response: {}",
                pong
            )));
        }

        Ok(conn)
    }

    /// Health-check probe against the live connection.
    async fn probe(&self) -> Result<(), ClusterError> {
        let conn = self.conn.read().await.clone();
        let mut conn = conn.ok_or(ClusterError::NotReady)?;

        let limit = self.config.command_timeout();
        let pong: String =
            tokio::time::timeout(limit, redis::cmd("PING").query_async(&mut conn))
                .await
                .map_err(|_| ClusterError::Timeout(limit))??;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(ClusterError::Command(format!(
                "unexpected PING response: {}",
                pong
            )))
        }
    }

    /// Resolves a connection handle for one command, honoring the state
    /// gating rules: fail fast before the first connection (unless offline
    /// queueing suspends the caller), attempt in `Degraded`, refuse after
    /// `Closed`.
    pub(crate) async fn command_connection(&self) -> Result<ClusterConnection, ClusterError> {
        loop {
            match self.state.get() {
                ConnectionState::Ready | ConnectionState::Degraded => {
                    return self
                        .conn
                        .read()
                        .await
                        .clone()
                        .ok_or(ClusterError::NotReady);
                }
                ConnectionState::Closed => return Err(ClusterError::NotConnected),
                ConnectionState::Connecting => {
                    if !self.started.load(Ordering::SeqCst) || !self.config.offline_queue {
                        return Err(ClusterError::NotReady);
                    }
                    // Offline queueing: suspend until the first connection,
                    // then re-check state.
                    self.await_first_connection().await?;
                }
            }
        }
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("nodes", &self.config.describe_nodes())
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    fn unreachable_config() -> ClusterConfig {
        let mut config = ClusterConfig::default_for_test();
        // TCP port 1 refuses connections immediately
        config.nodes = vec![crate::config::ClusterNode::new("127.0.0.1", 1)];
        config.connect_timeout_secs = 1;
        config.retry = RetryPolicy {
            base_delay_ms: 1,
            step_ms: 1,
            max_delay_ms: 5,
            pre_connect_attempts: 3,
        };
        config
    }

    #[tokio::test]
    async fn test_init_exhausts_budget_and_closes() {
        let manager = ClusterManager::new(unreachable_config());
        let result = manager.init().await;

        assert!(matches!(result, Err(ClusterError::Connection(_))));
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_wait_for_ready_before_init() {
        let manager = ClusterManager::new(ClusterConfig::default_for_test());
        let result = manager.wait_for_ready().await;
        assert!(matches!(result, Err(ClusterError::NotStarted)));
    }

    #[tokio::test]
    async fn test_command_before_init_fails_fast() {
        let manager = ClusterManager::new(ClusterConfig::default_for_test());
        let result = manager.get("any-key").await;
        assert!(matches!(result, Err(ClusterError::NotReady)));
    }

    #[tokio::test]
    async fn test_command_before_init_fails_fast_with_offline_queue() {
        let mut config = ClusterConfig::default_for_test();
        config.offline_queue = true;
        let manager = ClusterManager::new(config);
        // Offline queueing only applies once init has been called
        let result = manager.get("any-key").await;
        assert!(matches!(result, Err(ClusterError::NotReady)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = ClusterManager::new(ClusterConfig::default_for_test());
        assert!(manager.shutdown().await.is_ok());
        assert!(manager.shutdown().await.is_ok());
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_during_pre_connect_wakes_waiters() {
        let mut config = unreachable_config();
        // Large budget so the lifecycle is still retrying when we shut down
        config.retry.pre_connect_attempts = 1_000;
        config.retry.base_delay_ms = 50;
        config.retry.step_ms = 0;
        let manager = ClusterManager::new(config);

        let init_manager = Arc::clone(&manager);
        let init = tokio::spawn(async move { init_manager.init().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        manager.shutdown().await.unwrap();

        let result = init.await.unwrap();
        assert!(result.is_err());
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_init_twice_returns_same_failure() {
        let manager = ClusterManager::new(unreachable_config());
        assert!(manager.init().await.is_err());
        // Second init degenerates to wait_for_ready and reports the failure
        assert!(manager.init().await.is_err());
    }
}
