//! Pub/Sub fanout adapter
//!
//! Broadcasts gateway events to every other process sharing the cluster and
//! receives theirs. Built on two dedicated connections from the same
//! topology: a publisher (PUBLISH and ordinary commands) and a subscriber
//! (SUBSCRIBE only). The split is a Redis protocol constraint: once a
//! connection subscribes it can no longer issue other commands.
//!
//! # Example
//!
//! ```no_run
//! use roomcast_cluster::ClusterConfig;
//! use roomcast_fanout::FanoutAdapter;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), roomcast_fanout::FanoutError> {
//! let adapter = FanoutAdapter::start(ClusterConfig::from_env()?);
//! adapter.subscribe(
//!     "room:lobby",
//!     Arc::new(|payload, origin| {
//!         println!("{} bytes from {}", payload.len(), origin);
//!     }),
//! )?;
//! adapter.wait_for_ready().await?;
//! adapter.publish("room:lobby", b"user joined").await?;
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use roomcast_cluster::{ClusterConfig, ClusterManager, ConnectionState};

use crate::envelope::{response_channel, Envelope};
use crate::error::FanoutError;
use crate::subscriber::{self, SubscriberCommand};

/// Handler invoked per incoming broadcast message: `(payload, origin)`.
pub type MessageHandler = Arc<dyn Fn(Bytes, &str) + Send + Sync>;

/// Responder invoked per incoming aggregation request; a `Some` return is
/// published point-to-point to the requester's reply channel.
pub type Responder = Arc<dyn Fn(Bytes, &str) -> Option<Bytes> + Send + Sync>;

/// Per-registration delivery options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Deliver messages this instance published itself (echo suppression
    /// off for this registration)
    pub deliver_self: bool,
}

enum Registration {
    Event {
        handler: MessageHandler,
        deliver_self: bool,
    },
    Responder {
        responder: Responder,
    },
}

struct PendingEntry {
    sender: mpsc::UnboundedSender<Bytes>,
    channel: String,
}

pub(crate) struct Inner {
    instance_id: String,
    pub(crate) config: Arc<ClusterConfig>,
    publisher: Arc<ClusterManager>,
    registry: StdMutex<HashMap<String, Vec<Registration>>>,
    pending: StdMutex<HashMap<String, PendingEntry>>,
    sub_tx: mpsc::UnboundedSender<SubscriberCommand>,
    subscriber_ready: watch::Sender<bool>,
    pub(crate) cancel: CancellationToken,
}

/// Cross-instance event fanout with request/response aggregation.
///
/// Cheap to clone; all clones share the same connections and registrations.
#[derive(Clone)]
pub struct FanoutAdapter {
    inner: Arc<Inner>,
}

impl FanoutAdapter {
    /// Starts an adapter with a generated instance id.
    ///
    /// Both connections come up in the background; use
    /// [`wait_for_ready`](Self::wait_for_ready) to block until the adapter
    /// can publish. Subscriptions registered before readiness are activated
    /// once the subscriber connects.
    pub fn start(config: ClusterConfig) -> Self {
        Self::start_with_instance_id(config, Uuid::new_v4().to_string())
    }

    /// Starts an adapter with an explicit instance id (one per process).
    pub fn start_with_instance_id(config: ClusterConfig, instance_id: String) -> Self {
        let config = Arc::new(config);
        let publisher = ClusterManager::new((*config).clone());
        publisher.start();

        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        let (subscriber_ready, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            instance_id,
            config,
            publisher,
            registry: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            sub_tx,
            subscriber_ready,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(subscriber::run(Arc::clone(&inner), sub_rx));

        Self { inner }
    }

    /// Instance id stamped on everything this adapter publishes.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// The publisher-side command surface (plain cluster commands).
    pub fn commands(&self) -> Arc<ClusterManager> {
        Arc::clone(&self.inner.publisher)
    }

    /// True when both connections are up. The adapter refuses to operate
    /// half-connected: a down subscriber makes the whole adapter not ready.
    pub fn is_ready(&self) -> bool {
        !self.inner.cancel.is_cancelled()
            && self.inner.publisher.state() == ConnectionState::Ready
            && *self.inner.subscriber_ready.borrow()
    }

    /// Suspends until both connections are up.
    pub async fn wait_for_ready(&self) -> Result<(), FanoutError> {
        self.inner.publisher.wait_for_ready().await?;

        let mut rx = self.inner.subscriber_ready.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(FanoutError::NotConnected),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(FanoutError::NotConnected);
                    }
                }
            }
        }
    }

    /// Broadcasts a payload to every instance subscribed to `channel`.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), FanoutError> {
        self.ensure_ready()?;

        let envelope = Envelope::event(self.inner.instance_id.clone(), payload.to_vec());
        let json = envelope.to_json()?;
        let receivers = self.inner.publisher.publish(channel, json.as_bytes()).await?;
        tracing::trace!(
            channel = %channel,
            receivers = receivers,
            "published fanout event"
        );
        Ok(())
    }

    /// Registers a handler for broadcast messages on `channel`.
    ///
    /// Messages this instance published itself are suppressed. Accepted
    /// before the adapter is ready; the subscription activates on connect
    /// and survives subscriber reconnects.
    pub fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<(), FanoutError> {
        self.subscribe_with(channel, handler, SubscribeOptions::default())
    }

    /// [`subscribe`](Self::subscribe) with explicit delivery options
    /// (e.g. opting into self-delivery).
    pub fn subscribe_with(
        &self,
        channel: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Result<(), FanoutError> {
        if self.inner.cancel.is_cancelled() {
            return Err(FanoutError::NotConnected);
        }
        self.inner.register(
            channel,
            Registration::Event {
                handler,
                deliver_self: options.deliver_self,
            },
        );
        Ok(())
    }

    /// Registers a responder for aggregation requests on `channel`.
    ///
    /// The responder's answer, if any, is published point-to-point to the
    /// requester's private reply channel rather than back to the broadcast
    /// channel. An instance never answers its own requests.
    pub fn serve(&self, channel: &str, responder: Responder) -> Result<(), FanoutError> {
        if self.inner.cancel.is_cancelled() {
            return Err(FanoutError::NotConnected);
        }
        self.inner
            .register(channel, Registration::Responder { responder });
        Ok(())
    }

    /// Cluster-wide aggregation query.
    ///
    /// Publishes a request on `channel` and collects responses from remote
    /// instances until `timeout` elapses. Whatever arrived by the deadline
    /// is returned as a valid partial result; a timeout is not an error.
    pub async fn request(
        &self,
        channel: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Bytes>, FanoutError> {
        self.request_with_cancel(channel, payload, timeout, &CancellationToken::new())
            .await
    }

    /// [`request`](Self::request) with explicit early cancellation: when
    /// `cancel` fires before the deadline, collection stops and the
    /// responses gathered so far are returned.
    pub async fn request_with_cancel(
        &self,
        channel: &str,
        payload: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Bytes>, FanoutError> {
        self.ensure_ready()?;

        let correlation_id = Uuid::new_v4().to_string();
        let reply_channel = response_channel(channel, &correlation_id);
        let deadline = tokio::time::Instant::now() + timeout;

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().expect("pending lock poisoned").insert(
            correlation_id.clone(),
            PendingEntry {
                sender: tx,
                channel: reply_channel.clone(),
            },
        );
        // Tears down the pending entry and the temporary subscription
        // exactly once, on every exit path
        let _guard = RequestGuard {
            inner: Arc::clone(&self.inner),
            correlation_id: correlation_id.clone(),
            channel: reply_channel.clone(),
        };

        // Subscribe to the private reply channel before publishing so early
        // responders are not lost
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.inner.sub_tx.send(SubscriberCommand::Subscribe {
            channel: reply_channel.clone(),
            ack: Some(ack_tx),
        });
        let ack_limit = timeout.min(Duration::from_secs(1));
        if tokio::time::timeout(ack_limit, ack_rx).await.is_err() {
            tracing::debug!(
                channel = %reply_channel,
                "reply channel subscription not confirmed in time"
            );
        }

        let envelope = Envelope::request(
            self.inner.instance_id.clone(),
            correlation_id,
            reply_channel,
            payload.to_vec(),
        );
        let json = envelope.to_json()?;
        self.inner.publisher.publish(channel, json.as_bytes()).await?;

        collect_until(rx, deadline, cancel, &self.inner.cancel).await
    }

    /// Shuts the adapter down.
    ///
    /// Idempotent. Cancels the subscriber task and all in-flight requests
    /// (they resolve with `NotConnected` rather than hanging), then closes
    /// the publisher connection.
    pub async fn shutdown(&self) -> Result<(), FanoutError> {
        self.inner.cancel.cancel();
        self.inner.subscriber_ready.send_replace(false);
        self.inner.pending.lock().expect("pending lock poisoned").clear();
        self.inner.publisher.shutdown().await?;
        tracing::info!(instance_id = %self.inner.instance_id, "fanout adapter shut down");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), FanoutError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(FanoutError::NotConnected)
        }
    }
}

/// Collects responses until the deadline, early cancellation, or adapter
/// shutdown. Only shutdown turns the partial result into an error.
async fn collect_until(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    deadline: tokio::time::Instant,
    cancel: &CancellationToken,
    shutdown: &CancellationToken,
) -> Result<Vec<Bytes>, FanoutError> {
    let mut responses = Vec::new();
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            // Drain responses that already arrived before honoring a stop
            biased;
            msg = rx.recv() => match msg {
                Some(payload) => responses.push(payload),
                None => return Ok(responses),
            },
            _ = shutdown.cancelled() => return Err(FanoutError::NotConnected),
            _ = cancel.cancelled() => return Ok(responses),
            _ = &mut sleep => return Ok(responses),
        }
    }
}

/// Removes one request's pending entry and temporary subscription on drop.
struct RequestGuard {
    inner: Arc<Inner>,
    correlation_id: String,
    channel: String,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&self.correlation_id);
        let _ = self.inner.sub_tx.send(SubscriberCommand::Unsubscribe {
            channel: std::mem::take(&mut self.channel),
        });
    }
}

impl Inner {
    fn register(&self, channel: &str, registration: Registration) {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .entry(channel.to_string())
            .or_default()
            .push(registration);
        // Queued while the subscriber is between connections; reconnect
        // re-subscribes the whole registry, so a duplicate is harmless
        let _ = self.sub_tx.send(SubscriberCommand::Subscribe {
            channel: channel.to_string(),
            ack: None,
        });
    }

    pub(crate) fn set_subscriber_ready(&self, ready: bool) {
        self.subscriber_ready.send_replace(ready);
    }

    /// Channels the subscriber connection must be subscribed to: every
    /// registered channel plus the reply channels of in-flight requests.
    pub(crate) fn active_channels(&self) -> Vec<String> {
        let mut channels: BTreeSet<String> = self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        channels.extend(
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .values()
                .map(|entry| entry.channel.clone()),
        );
        channels.into_iter().collect()
    }

    pub(crate) fn is_channel_active(&self, channel: &str) -> bool {
        if self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .contains_key(channel)
        {
            return true;
        }
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .values()
            .any(|entry| entry.channel == channel)
    }

    /// Routes one raw message from the subscriber connection.
    ///
    /// Malformed envelopes are logged and dropped; handler panics are
    /// isolated per message. Nothing here may take the receive loop down.
    pub(crate) async fn dispatch(&self, channel: &str, raw: &[u8]) {
        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    channel = %channel,
                    error = %err,
                    "dropping undecodable message"
                );
                return;
            }
        };

        if envelope.is_request() {
            self.dispatch_request(channel, envelope).await;
        } else if envelope.is_response() {
            self.dispatch_response(channel, envelope);
        } else {
            self.dispatch_event(channel, envelope);
        }
    }

    fn dispatch_event(&self, channel: &str, envelope: Envelope) {
        let local_echo = envelope.origin == self.instance_id;
        let handlers: Vec<(MessageHandler, bool)> = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry
                .get(channel)
                .map(|registrations| {
                    registrations
                        .iter()
                        .filter_map(|registration| match registration {
                            Registration::Event {
                                handler,
                                deliver_self,
                            } => Some((Arc::clone(handler), *deliver_self)),
                            Registration::Responder { .. } => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let payload = Bytes::from(envelope.payload);
        for (handler, deliver_self) in handlers {
            if local_echo && !deliver_self {
                tracing::trace!(channel = %channel, "suppressed local echo");
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| {
                handler(payload.clone(), &envelope.origin)
            }));
            if result.is_err() {
                tracing::error!(
                    channel = %channel,
                    origin = %envelope.origin,
                    "message handler panicked"
                );
            }
        }
    }

    async fn dispatch_request(&self, channel: &str, envelope: Envelope) {
        if envelope.origin == self.instance_id {
            // An instance never answers its own aggregation request; the
            // requester merges local state itself
            return;
        }
        let (correlation_id, reply_to) = match (&envelope.correlation_id, &envelope.reply_to) {
            (Some(correlation_id), Some(reply_to)) => (correlation_id.clone(), reply_to.clone()),
            _ => return,
        };

        let responders: Vec<Responder> = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry
                .get(channel)
                .map(|registrations| {
                    registrations
                        .iter()
                        .filter_map(|registration| match registration {
                            Registration::Responder { responder } => Some(Arc::clone(responder)),
                            Registration::Event { .. } => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let payload = Bytes::from(envelope.payload);
        for responder in responders {
            let result = catch_unwind(AssertUnwindSafe(|| {
                responder(payload.clone(), &envelope.origin)
            }));
            let response = match result {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(_) => {
                    tracing::error!(channel = %channel, "request responder panicked");
                    continue;
                }
            };

            let response_envelope = Envelope::response(
                self.instance_id.clone(),
                correlation_id.clone(),
                response.to_vec(),
            );
            let json = match response_envelope.to_json() {
                Ok(json) => json,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode response envelope");
                    continue;
                }
            };
            if let Err(err) = self.publisher.publish(&reply_to, json.as_bytes()).await {
                tracing::warn!(
                    reply_to = %reply_to,
                    error = %err,
                    "failed to publish aggregation response"
                );
            }
        }
    }

    fn dispatch_response(&self, channel: &str, envelope: Envelope) {
        let correlation_id = match &envelope.correlation_id {
            Some(correlation_id) => correlation_id.clone(),
            None => return,
        };
        let sender = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .get(&correlation_id)
            .map(|entry| entry.sender.clone());

        match sender {
            Some(sender) => {
                let _ = sender.send(Bytes::from(envelope.payload));
            }
            None => {
                // Response landed after its request's deadline
                tracing::debug!(
                    channel = %channel,
                    correlation_id = %correlation_id,
                    "dropping late response"
                );
            }
        }
    }
}
