//! The ingestion gateway: validate, resolve, and apply metric updates.
//!
//! # Pipeline
//!
//! ```text
//! bytes --decode--> IngestEvent --get_node--> Node --merge--> metrics
//!                                                |                |
//!                                                +<--conflict-----+-- update_node_metrics(version)
//! ```
//!
//! 1. The payload is decoded strictly. A validation failure is rejected
//!    before any store or cache call.
//! 2. The node is read through the cache. An unknown node is rejected.
//! 3. The update is merged with the stored metrics and written back,
//!    conditioned on the version that was read. On a version conflict the
//!    node is re-read from the store (bypassing the cache), re-merged, and
//!    written again, up to `max_concurrency_retries` times.
//! 4. Every store call absorbs transient connectivity faults with bounded
//!    exponential backoff.
//!
//! Each call gets a fresh correlation id carried by every log record of the
//! call. Exactly one [`FailureReport`] is filed per call that saw a fault:
//! `Recovered` if it was accepted anyway, `Surfaced` if it was rejected.

use chaintwin_db::{DbError, NodeRepository};
use chaintwin_types::{ErrorKind, IngestEvent, Node, NodeId, NodeMetrics, RawEvent, ValidationError};
use tracing::Instrument as _;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::conflict::{ConflictResolver, Discrepancy, MergeOutcome, Winner};
use crate::reporter::{ErrorReporter, FailureReport, Resolution};
use crate::retry::{RetryPolicy, Tally};

/// Why an ingestion event was rejected.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The event failed strict decoding.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The event targets a node the twin does not know.
    #[error("node {0} not found")]
    NotFound(NodeId),

    /// Every write attempt lost a version race.
    #[error("node {node_id}: version conflict persisted after {attempts} write attempts")]
    Concurrency {
        /// Target node.
        node_id: NodeId,
        /// Conditional writes attempted.
        attempts: u32,
    },

    /// The store could not serve the request.
    #[error("store unavailable after {attempts} attempts: {source}")]
    Connectivity {
        /// The last store error.
        source: DbError,
        /// Store calls attempted.
        attempts: u32,
    },

    /// The update raised a discrepancy and discrepancies are configured to
    /// block.
    #[error(
        "update to node {node_id} blocked: {} and {} reported within the conflict window",
        .discrepancy.current_source,
        .discrepancy.incoming_source
    )]
    Discrepancy {
        /// Target node.
        node_id: NodeId,
        /// The conflicting pair.
        discrepancy: Box<Discrepancy>,
    },
}

impl IngestError {
    /// Failure class of this rejection.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Discrepancy { .. } => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Concurrency { .. } => ErrorKind::Concurrency,
            Self::Connectivity { .. } => ErrorKind::Connectivity,
        }
    }
}

/// An update that was written to the twin.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedUpdate {
    /// The node as stored after the write.
    pub node: Node,
    /// Version the accepted write was conditioned on.
    pub previous_version: u64,
    /// Which side's metrics were kept.
    pub winner: Winner,
    /// Set when the update raised a discrepancy that did not block it.
    pub discrepancy: Option<Discrepancy>,
    /// Conditional writes attempted, including the successful one.
    pub attempts: u32,
    /// Correlation id of the ingest call.
    pub correlation_id: Uuid,
}

/// Gateway tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Re-merge-and-write rounds after the first version conflict.
    pub max_concurrency_retries: u32,
    /// Reject updates that raise a discrepancy.
    pub block_on_discrepancy: bool,
    /// Backoff for transient store failures.
    pub retry: RetryPolicy,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

impl GatewaySettings {
    /// Settings from the `ingest` configuration section.
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_concurrency_retries: config.max_concurrency_retries,
            block_on_discrepancy: config.block_on_discrepancy,
            retry: RetryPolicy::with_max_attempts(config.max_connectivity_attempts),
        }
    }
}

/// Context for the single report filed at the end of a call.
struct CallContext<'a> {
    correlation_id: Uuid,
    node_id: Option<&'a str>,
    source: Option<&'a str>,
    message_id: Option<&'a str>,
}

/// Validates events and applies them to the [`NodeRepository`].
#[derive(Clone)]
pub struct IngestionGateway {
    repository: NodeRepository,
    resolver: ConflictResolver,
    reporter: ErrorReporter,
    settings: GatewaySettings,
}

impl IngestionGateway {
    /// Assemble a gateway.
    pub const fn new(
        repository: NodeRepository,
        resolver: ConflictResolver,
        reporter: ErrorReporter,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            repository,
            resolver,
            reporter,
            settings,
        }
    }

    /// The repository updates are applied to.
    pub const fn repository(&self) -> &NodeRepository {
        &self.repository
    }

    /// The reporter failures are filed with.
    pub const fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Decode a JSON payload and ingest it.
    ///
    /// # Errors
    ///
    /// See [`IngestionGateway::ingest`]. Undecodable payloads fail with
    /// [`IngestError::Validation`].
    pub async fn ingest_bytes(&self, payload: &[u8]) -> Result<AcceptedUpdate, IngestError> {
        match serde_json::from_slice::<RawEvent>(payload) {
            Ok(raw) => self.ingest_raw(raw).await,
            Err(e) => {
                let ctx = CallContext {
                    correlation_id: Uuid::now_v7(),
                    node_id: None,
                    source: None,
                    message_id: None,
                };
                let err = IngestError::Validation(ValidationError::Malformed(e.to_string()));
                self.surface(&ctx, &err, 0).await;
                Err(err)
            }
        }
    }

    /// Validate an undecoded event and ingest it.
    ///
    /// # Errors
    ///
    /// See [`IngestionGateway::ingest`].
    pub async fn ingest_raw(&self, raw: RawEvent) -> Result<AcceptedUpdate, IngestError> {
        let correlation_id = Uuid::now_v7();
        let node_id = raw.node_id_hint().map(str::to_owned);
        let source = raw.source_hint().map(str::to_owned);
        let message_id = raw.message_id.clone();

        match IngestEvent::try_from(raw) {
            Ok(event) => self.ingest_with(event, correlation_id).await,
            Err(e) => {
                let ctx = CallContext {
                    correlation_id,
                    node_id: node_id.as_deref(),
                    source: source.as_deref(),
                    message_id: message_id.as_deref(),
                };
                let err = IngestError::Validation(e);
                self.surface(&ctx, &err, 0).await;
                Err(err)
            }
        }
    }

    /// Apply a validated event.
    ///
    /// # Errors
    ///
    /// - [`IngestError::NotFound`] if the node is unknown
    /// - [`IngestError::Concurrency`] if every write lost a version race
    /// - [`IngestError::Connectivity`] if the store stayed unreachable
    /// - [`IngestError::Discrepancy`] if blocking on discrepancies is enabled
    ///   and one was raised
    pub async fn ingest(&self, event: IngestEvent) -> Result<AcceptedUpdate, IngestError> {
        self.ingest_with(event, Uuid::now_v7()).await
    }

    async fn ingest_with(
        &self,
        event: IngestEvent,
        correlation_id: Uuid,
    ) -> Result<AcceptedUpdate, IngestError> {
        let span = tracing::info_span!(
            "ingest",
            correlation_id = %correlation_id,
            node_id = %event.node_id,
            source = %event.update.source,
        );

        async {
            let ctx = CallContext {
                correlation_id,
                node_id: Some(event.node_id.as_str()),
                source: Some(event.update.source.as_str()),
                message_id: event.message_id.as_deref(),
            };
            let mut tally = Tally::default();

            match self.apply(&event, correlation_id, &mut tally).await {
                Ok(accepted) => {
                    if tally.had_faults() {
                        self.recovered(&ctx, &tally, accepted.attempts).await;
                    }
                    tracing::debug!(
                        version = accepted.node.version,
                        attempts = accepted.attempts,
                        "Update accepted"
                    );
                    Ok(accepted)
                }
                Err(err) => {
                    self.surface(&ctx, &err, tally.store_calls).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn apply(
        &self,
        event: &IngestEvent,
        correlation_id: Uuid,
        tally: &mut Tally,
    ) -> Result<AcceptedUpdate, IngestError> {
        let node_id = &event.node_id;
        let retry = self.settings.retry;

        let mut node = retry
            .run("node fetch", tally, || self.repository.get_node(node_id))
            .await
            .map_err(|e| store_failure(e, node_id, tally))?
            .ok_or_else(|| IngestError::NotFound(node_id.clone()))?;

        let mut writes: u32 = 0;
        loop {
            let outcome = self.resolver.merge(&node.metrics, &event.update);
            if let Some(d) = &outcome.discrepancy {
                tracing::warn!(
                    current_source = %d.current_source,
                    current_timestamp = %d.current_timestamp,
                    incoming_source = %d.incoming_source,
                    incoming_timestamp = %d.incoming_timestamp,
                    winner = d.winning_source(),
                    "Discrepancy between sources within the conflict window"
                );
                if self.settings.block_on_discrepancy {
                    return Err(IngestError::Discrepancy {
                        node_id: node_id.clone(),
                        discrepancy: Box::new(d.clone()),
                    });
                }
            }

            writes = writes.saturating_add(1);
            let expected = node.version;
            let faults_before = tally.connectivity_faults;
            let written = retry
                .run("node update", tally, || {
                    self.repository
                        .update_node_metrics(node_id, &outcome.metrics, expected)
                })
                .await;
            let retried_write = tally.connectivity_faults > faults_before;

            let accept = |node: Node, outcome: MergeOutcome| AcceptedUpdate {
                node,
                previous_version: expected,
                winner: outcome.winner,
                discrepancy: outcome.discrepancy,
                attempts: writes,
                correlation_id,
            };

            match written {
                Ok(updated) => return Ok(accept(updated, outcome)),
                Err(DbError::VersionConflict { actual, .. }) => {
                    // A failed attempt may have committed before its reply was
                    // lost; the retry then conflicts with our own write.
                    let fresh = if retried_write {
                        Some(self.reread(node_id, tally).await?)
                    } else {
                        None
                    };
                    if let Some(current) = &fresh
                        && is_own_commit(current, expected, &outcome.metrics)
                    {
                        tracing::info!(
                            version = current.version,
                            attempt = writes,
                            "Write committed before a lost acknowledgement"
                        );
                        return Ok(accept(current.clone(), outcome));
                    }

                    tally.version_conflicts = tally.version_conflicts.saturating_add(1);
                    if tally.version_conflicts > self.settings.max_concurrency_retries {
                        return Err(IngestError::Concurrency {
                            node_id: node_id.clone(),
                            attempts: writes,
                        });
                    }
                    tracing::debug!(expected, actual, attempt = writes, "Version conflict, re-reading node");
                    node = match fresh {
                        Some(current) => current,
                        None => self.reread(node_id, tally).await?,
                    };
                }
                Err(e) => return Err(store_failure(e, node_id, tally)),
            }
        }
    }

    async fn reread(&self, node_id: &NodeId, tally: &mut Tally) -> Result<Node, IngestError> {
        self.settings
            .retry
            .run("node fetch", tally, || self.repository.get_node_fresh(node_id))
            .await
            .map_err(|e| store_failure(e, node_id, tally))?
            .ok_or_else(|| IngestError::NotFound(node_id.clone()))
    }

    async fn recovered(&self, ctx: &CallContext<'_>, tally: &Tally, writes: u32) {
        let kind = if tally.connectivity_faults > 0 {
            ErrorKind::Connectivity
        } else {
            ErrorKind::Concurrency
        };
        let message = format!(
            "accepted after {} connectivity fault(s) and {} version conflict(s) in {writes} write attempt(s)",
            tally.connectivity_faults, tally.version_conflicts
        );
        self.file(ctx, kind, message, tally.store_calls, Resolution::Recovered)
            .await;
    }

    async fn surface(&self, ctx: &CallContext<'_>, err: &IngestError, attempts: u32) {
        self.file(ctx, err.kind(), err.to_string(), attempts, Resolution::Surfaced)
            .await;
    }

    async fn file(
        &self,
        ctx: &CallContext<'_>,
        kind: ErrorKind,
        message: String,
        attempts: u32,
        resolution: Resolution,
    ) {
        self.reporter
            .report(FailureReport {
                kind,
                correlation_id: ctx.correlation_id,
                node_id: ctx.node_id.map(str::to_owned),
                source: ctx.source.map(str::to_owned),
                message_id: ctx.message_id.map(str::to_owned),
                message,
                attempts,
                resolution,
            })
            .await;
    }
}

/// Whether `current` is exactly the write attempted at `expected`.
fn is_own_commit(current: &Node, expected: u64, metrics: &NodeMetrics) -> bool {
    expected.checked_add(1) == Some(current.version) && current.metrics == *metrics
}

fn store_failure(err: DbError, node_id: &NodeId, tally: &Tally) -> IngestError {
    match err {
        DbError::NodeNotFound(_) => IngestError::NotFound(node_id.clone()),
        DbError::VersionConflict { .. } => IngestError::Concurrency {
            node_id: node_id.clone(),
            attempts: tally.version_conflicts,
        },
        other => IngestError::Connectivity {
            source: other,
            attempts: tally.store_calls,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn discrepancy_rejections_are_validation_class() {
        let d = Discrepancy {
            current_source: String::from("iot-core"),
            current_timestamp: chrono::Utc::now(),
            incoming_source: String::from("manual-entry"),
            incoming_timestamp: chrono::Utc::now(),
            winner: Winner::Incoming,
        };
        let err = IngestError::Discrepancy {
            node_id: NodeId::new("n1").unwrap(),
            discrepancy: Box::new(d),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("iot-core and manual-entry"));
    }

    #[test]
    fn settings_follow_config() {
        let config = IngestConfig {
            max_connectivity_attempts: 5,
            block_on_discrepancy: true,
            ..IngestConfig::default()
        };
        let settings = GatewaySettings::from_config(&config);
        assert_eq!(settings.retry.max_attempts, 5);
        assert!(settings.block_on_discrepancy);
        assert_eq!(settings.max_concurrency_retries, 3);
    }
}
