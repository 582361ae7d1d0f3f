//! Dedicated subscriber connection
//!
//! A subscribed Redis connection can no longer issue ordinary commands, so
//! the adapter runs this loop on its own plain connection to one cluster
//! node (PUBLISH propagates cluster-wide, so any node sees all channels).
//! The loop rotates through the configured nodes on reconnect, re-subscribes
//! every registered channel after a drop, and forwards each message to the
//! adapter's dispatch path.
//!
//! Messages published while the subscriber is reconnecting are lost; pub/sub
//! delivery across a reconnect window is best-effort by contract.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;

use roomcast_cluster::{ClusterError, ClusterNode};

use crate::adapter::Inner;

/// Subscription changes applied to the live connection.
pub(crate) enum SubscriberCommand {
    Subscribe {
        channel: String,
        ack: Option<oneshot::Sender<()>>,
    },
    Unsubscribe {
        channel: String,
    },
}

enum SubscriberExit {
    Cancelled,
    Disconnected,
}

/// Supervision loop: connect, serve until the connection drops, back off,
/// reconnect. Runs until the adapter shuts down.
pub(crate) async fn run(
    inner: Arc<Inner>,
    mut commands: mpsc::UnboundedReceiver<SubscriberCommand>,
) {
    if inner.config.nodes.is_empty() {
        tracing::error!("no cluster nodes configured, subscriber not started");
        return;
    }

    let mut attempt = 0u32;
    let mut node_cursor = 0usize;

    loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        let node = inner.config.nodes[node_cursor % inner.config.nodes.len()].clone();
        node_cursor = node_cursor.wrapping_add(1);

        match connect(&inner, &node).await {
            Ok(pubsub) => {
                attempt = 0;
                let exit = serve(&inner, pubsub, &mut commands).await;
                inner.set_subscriber_ready(false);
                match exit {
                    SubscriberExit::Cancelled => return,
                    SubscriberExit::Disconnected => {
                        tracing::warn!(node = %node, "subscriber connection lost, reconnecting");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(node = %node, error = %err, "subscriber connection failed");
            }
        }

        let delay = inner.config.retry.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect(inner: &Inner, node: &ClusterNode) -> Result<redis::aio::PubSub, ClusterError> {
    let url = match &inner.config.password {
        Some(password) => format!("redis://:{}@{}:{}", password, node.host, node.port),
        None => node.url(),
    };
    let client = redis::Client::open(url)?;

    let connect_timeout = inner.config.connect_timeout();
    let conn = tokio::time::timeout(connect_timeout, client.get_async_connection())
        .await
        .map_err(|_| {
            ClusterError::Connection(format!("timed out connecting subscriber to {}", node))
        })??;

    Ok(conn.into_pubsub())
}

/// Serves one live connection until it drops or the adapter shuts down.
async fn serve(
    inner: &Arc<Inner>,
    mut pubsub: redis::aio::PubSub,
    commands: &mut mpsc::UnboundedReceiver<SubscriberCommand>,
) -> SubscriberExit {
    // Re-subscribe everything registered so far; registrations survive
    // reconnects
    let channels = inner.active_channels();
    for channel in &channels {
        if let Err(err) = pubsub.subscribe(channel).await {
            tracing::warn!(channel = %channel, error = %err, "subscribe failed");
            return SubscriberExit::Disconnected;
        }
    }
    inner.set_subscriber_ready(true);
    tracing::info!(channels = channels.len(), "subscriber connected");

    loop {
        // The message stream mutably borrows the connection, so subscription
        // changes are applied between stream sessions
        let command = {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => return SubscriberExit::Cancelled,
                    command = commands.recv() => match command {
                        Some(command) => break command,
                        None => return SubscriberExit::Cancelled,
                    },
                    msg = stream.next() => match msg {
                        Some(msg) => {
                            let channel = msg.get_channel_name().to_string();
                            match msg.get_payload::<Vec<u8>>() {
                                Ok(raw) => inner.dispatch(&channel, &raw).await,
                                Err(err) => {
                                    tracing::warn!(
                                        channel = %channel,
                                        error = %err,
                                        "unreadable message payload"
                                    );
                                }
                            }
                        }
                        None => return SubscriberExit::Disconnected,
                    },
                }
            }
        };

        match command {
            SubscriberCommand::Subscribe { channel, ack } => {
                if let Err(err) = pubsub.subscribe(&channel).await {
                    tracing::warn!(channel = %channel, error = %err, "subscribe failed");
                    return SubscriberExit::Disconnected;
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            SubscriberCommand::Unsubscribe { channel } => {
                // Keep the subscription if a registration or in-flight
                // request still needs the channel
                if !inner.is_channel_active(&channel) {
                    if let Err(err) = pubsub.unsubscribe(&channel).await {
                        tracing::warn!(channel = %channel, error = %err, "unsubscribe failed");
                        return SubscriberExit::Disconnected;
                    }
                }
            }
        }
    }
}
