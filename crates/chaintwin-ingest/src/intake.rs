//! NATS intake for ingestion events.
//!
//! Producers publish raw event JSON on the configured subject (default
//! `twin.ingest.>`). Each message is fed through the
//! [`IngestionGateway`]; when the producer used request/reply, the outcome
//! is sent back as an [`IngestReply`].
//!
//! On shutdown the intake stops taking messages, lets every event already
//! in flight finish its write and reply, then unsubscribes.

use chaintwin_core::conflict::Discrepancy;
use chaintwin_core::{AcceptedUpdate, IngestError, IngestionGateway};
use chaintwin_types::{ErrorKind, NodeId};
use std::future::Future;

use futures::{Stream, StreamExt as _};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors that stop the intake loop.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    /// NATS connection or subscription failure.
    #[error("nats: {0}")]
    Nats(String),
}

/// Outcome of one event, as sent to request/reply producers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum IngestReply {
    /// The update was written.
    Accepted {
        /// Target node.
        node_id: NodeId,
        /// Node version after the write.
        version: u64,
        /// Present when the update raised a non-blocking discrepancy.
        #[serde(skip_serializing_if = "Option::is_none")]
        discrepancy: Option<Discrepancy>,
        /// Correlation id of the ingest call.
        correlation_id: Uuid,
    },
    /// The update was rejected.
    Rejected {
        /// Failure class.
        kind: ErrorKind,
        /// Human-readable reason.
        error: String,
    },
}

impl From<&Result<AcceptedUpdate, IngestError>> for IngestReply {
    fn from(outcome: &Result<AcceptedUpdate, IngestError>) -> Self {
        match outcome {
            Ok(accepted) => Self::Accepted {
                node_id: accepted.node.node_id.clone(),
                version: accepted.node.version,
                discrepancy: accepted.discrepancy.clone(),
                correlation_id: accepted.correlation_id,
            },
            Err(e) => Self::Rejected {
                kind: e.kind(),
                error: e.to_string(),
            },
        }
    }
}

/// Subscribe to `subject` and feed every message through `gateway`, with at
/// most `max_in_flight` events processed concurrently.
///
/// Runs until the subscription closes or `shutdown` resolves. In-flight
/// events are drained before this returns. Events for the same node still
/// serialize through the store's version check.
///
/// # Errors
///
/// Returns [`IntakeError::Nats`] if the subscription cannot be created.
pub async fn run_intake<S>(
    client: async_nats::Client,
    subject: &str,
    gateway: &IngestionGateway,
    max_in_flight: usize,
    shutdown: S,
) -> Result<(), IntakeError>
where
    S: Future<Output = ()>,
{
    let mut subscriber = client
        .subscribe(subject.to_owned())
        .await
        .map_err(|e| IntakeError::Nats(format!("failed to subscribe to {subject}: {e}")))?;
    info!(subject, max_in_flight, "Ingestion intake subscribed");

    drain_until(&mut subscriber, max_in_flight, shutdown, |msg| {
        handle_message(&client, gateway, msg)
    })
    .await;

    if let Err(e) = subscriber.unsubscribe().await {
        warn!(subject, error = %e, "Failed to unsubscribe ingestion intake");
    }
    info!(subject, "Ingestion intake drained");
    Ok(())
}

/// Run `handle` on each item of `messages`, at most `max_in_flight` at a
/// time, until the stream ends or `shutdown` resolves. Handlers already
/// started always run to completion.
async fn drain_until<St, S, F, Fut>(messages: St, max_in_flight: usize, shutdown: S, handle: F)
where
    St: Stream,
    S: Future<Output = ()>,
    F: FnMut(St::Item) -> Fut,
    Fut: Future<Output = ()>,
{
    messages
        .take_until(shutdown)
        .for_each_concurrent(max_in_flight, handle)
        .await;
}

async fn handle_message(
    client: &async_nats::Client,
    gateway: &IngestionGateway,
    msg: async_nats::Message,
) {
    let outcome = gateway.ingest_bytes(&msg.payload).await;
    let Some(reply_to) = msg.reply else {
        return;
    };
    let reply = IngestReply::from(&outcome);
    match serde_json::to_vec(&reply) {
        Ok(payload) => {
            if let Err(e) = client.publish(reply_to.clone(), payload.into()).await {
                warn!(reply_to = %reply_to, error = %e, "Failed to send ingest reply");
            } else {
                debug!(reply_to = %reply_to, "Sent ingest reply");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize ingest reply"),
    }
}
