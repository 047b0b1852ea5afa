//! Failure classification, logging, and administrator alerts.
//!
//! Every failed or retried ingestion produces exactly one [`FailureReport`],
//! handed to [`ErrorReporter::report`] at the point where the outcome is
//! final: either the fault was recovered by a retry, or it is being
//! surfaced to the caller. The reporter logs the report and forwards an
//! [`Alert`] to the configured [`AlertChannel`].
//!
//! # Severity
//!
//! | Resolution | Kind | Severity | Log level |
//! |------------|------|----------|-----------|
//! | recovered | any | info | `INFO` |
//! | surfaced | validation, concurrency | warning | `WARN` |
//! | surfaced | not found, connectivity | critical | `ERROR` |

use std::sync::Arc;

use chaintwin_types::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Maximum alerts kept by an in-memory channel.
pub const MAX_ALERTS: usize = 500;

/// How a fault was finally resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// A retry succeeded; the event was accepted.
    Recovered,
    /// The event was rejected upstream.
    Surfaced,
}

/// Severity level of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational -- a fault occurred but was absorbed.
    Info,
    /// Warning -- an event was rejected for a reason the sender can fix.
    Warning,
    /// Critical -- data is missing or a store is unreachable.
    Critical,
}

/// Everything known about one failure at the moment it is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Failure class.
    pub kind: ErrorKind,
    /// Id shared by every log record of the originating ingest call.
    pub correlation_id: Uuid,
    /// Target node, when it could be determined.
    pub node_id: Option<String>,
    /// Originating system, when it could be determined.
    pub source: Option<String>,
    /// Transport message id, when supplied.
    pub message_id: Option<String>,
    /// Human-readable detail.
    pub message: String,
    /// Store attempts made before resolution.
    pub attempts: u32,
    /// Whether the fault was absorbed or surfaced.
    pub resolution: Resolution,
}

impl FailureReport {
    /// Severity implied by the kind and resolution.
    pub const fn severity(&self) -> AlertSeverity {
        match (self.resolution, self.kind) {
            (Resolution::Recovered, _) => AlertSeverity::Info,
            (Resolution::Surfaced, ErrorKind::Validation | ErrorKind::Concurrency) => {
                AlertSeverity::Warning
            }
            (Resolution::Surfaced, ErrorKind::NotFound | ErrorKind::Connectivity) => {
                AlertSeverity::Critical
            }
        }
    }
}

/// An administrator alert derived from a [`FailureReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Unique alert identifier.
    pub id: Uuid,
    /// Severity of the alert.
    pub severity: AlertSeverity,
    /// Failure class.
    pub kind: ErrorKind,
    /// Correlation id of the ingest call.
    pub correlation_id: Uuid,
    /// Target node, if known.
    pub node_id: Option<String>,
    /// Originating system, if known.
    pub source: Option<String>,
    /// Transport message id, if known.
    pub message_id: Option<String>,
    /// Human-readable detail.
    pub message: String,
    /// Store attempts made.
    pub attempts: u32,
    /// Whether the fault was absorbed or surfaced.
    pub resolution: Resolution,
    /// When the alert was raised.
    pub created_at: DateTime<Utc>,
}

impl From<&FailureReport> for Alert {
    fn from(report: &FailureReport) -> Self {
        Self {
            id: Uuid::now_v7(),
            severity: report.severity(),
            kind: report.kind,
            correlation_id: report.correlation_id,
            node_id: report.node_id.clone(),
            source: report.source.clone(),
            message_id: report.message_id.clone(),
            message: report.message.clone(),
            attempts: report.attempts,
            resolution: report.resolution,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Alert Store
// ---------------------------------------------------------------------------

/// In-memory alert store, newest first.
#[derive(Debug, Clone, Default)]
pub struct AlertStore {
    alerts: Vec<Alert>,
}

impl AlertStore {
    /// Create a new empty alert store.
    pub const fn new() -> Self {
        Self { alerts: Vec::new() }
    }

    /// Add an alert, dropping the oldest beyond [`MAX_ALERTS`].
    pub fn push(&mut self, alert: Alert) {
        self.alerts.insert(0, alert);
        if self.alerts.len() > MAX_ALERTS {
            self.alerts.truncate(MAX_ALERTS);
        }
    }

    /// All alerts, newest first.
    pub fn all(&self) -> &[Alert] {
        &self.alerts
    }

    /// Number of stored alerts.
    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    /// Whether no alerts are stored.
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Alerts raised for one ingest call.
    pub fn for_correlation(&self, correlation_id: Uuid) -> Vec<&Alert> {
        self.alerts
            .iter()
            .filter(|a| a.correlation_id == correlation_id)
            .collect()
    }

    /// Alerts at or above `severity`.
    pub fn at_least(&self, severity: AlertSeverity) -> Vec<&Alert> {
        self.alerts.iter().filter(|a| a.severity >= severity).collect()
    }
}

/// An [`AlertStore`] shared between the reporter and its readers.
pub type SharedAlertStore = Arc<Mutex<AlertStore>>;

// ---------------------------------------------------------------------------
// Channels and reporter
// ---------------------------------------------------------------------------

/// Where alerts are delivered.
#[derive(Clone)]
pub enum AlertChannel {
    /// No delivery beyond the reporter's own log record.
    LogOnly,
    /// A bounded in-process store.
    InMemory(SharedAlertStore),
    /// JSON published to a NATS subject, fire-and-forget.
    Nats {
        /// Connected NATS client.
        client: async_nats::Client,
        /// Subject to publish on.
        subject: String,
    },
}

impl AlertChannel {
    /// A fresh in-memory channel.
    pub fn in_memory() -> Self {
        Self::InMemory(Arc::new(Mutex::new(AlertStore::new())))
    }

    async fn dispatch(&self, alert: Alert) {
        match self {
            Self::LogOnly => {}
            Self::InMemory(store) => store.lock().await.push(alert),
            Self::Nats { client, subject } => {
                let payload = match serde_json::to_vec(&alert) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(alert_id = %alert.id, error = %e, "Failed to serialize alert");
                        return;
                    }
                };
                let client = client.clone();
                let subject = subject.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.publish(subject, payload.into()).await {
                        tracing::warn!(alert_id = %alert.id, error = %e, "Failed to publish alert");
                    }
                });
            }
        }
    }
}

/// Logs failure reports and forwards them as alerts.
#[derive(Clone)]
pub struct ErrorReporter {
    channel: AlertChannel,
}

impl ErrorReporter {
    /// Create a reporter delivering to `channel`.
    pub const fn new(channel: AlertChannel) -> Self {
        Self { channel }
    }

    /// The in-memory alert store, if that is the active channel.
    pub fn alert_store(&self) -> Option<SharedAlertStore> {
        match &self.channel {
            AlertChannel::InMemory(store) => Some(Arc::clone(store)),
            AlertChannel::LogOnly | AlertChannel::Nats { .. } => None,
        }
    }

    /// Log `report` and deliver the corresponding alert.
    pub async fn report(&self, report: FailureReport) {
        let node_id = report.node_id.as_deref().unwrap_or("-");
        let source = report.source.as_deref().unwrap_or("-");
        let message_id = report.message_id.as_deref().unwrap_or("-");

        match report.severity() {
            AlertSeverity::Info => tracing::info!(
                correlation_id = %report.correlation_id,
                kind = %report.kind,
                node_id,
                source,
                message_id,
                attempts = report.attempts,
                "Recovered from fault: {}",
                report.message
            ),
            AlertSeverity::Warning => tracing::warn!(
                correlation_id = %report.correlation_id,
                kind = %report.kind,
                node_id,
                source,
                message_id,
                attempts = report.attempts,
                "Rejected event: {}",
                report.message
            ),
            AlertSeverity::Critical => tracing::error!(
                correlation_id = %report.correlation_id,
                kind = %report.kind,
                node_id,
                source,
                message_id,
                attempts = report.attempts,
                "Rejected event: {}",
                report.message
            ),
        }

        self.channel.dispatch(Alert::from(&report)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    fn report(kind: ErrorKind, resolution: Resolution) -> FailureReport {
        FailureReport {
            kind,
            correlation_id: Uuid::now_v7(),
            node_id: Some(String::from("n1")),
            source: Some(String::from("iot-core")),
            message_id: None,
            message: String::from("boom"),
            attempts: 1,
            resolution,
        }
    }

    #[test]
    fn severity_follows_kind_and_resolution() {
        assert_eq!(
            report(ErrorKind::Connectivity, Resolution::Recovered).severity(),
            AlertSeverity::Info
        );
        assert_eq!(
            report(ErrorKind::Validation, Resolution::Surfaced).severity(),
            AlertSeverity::Warning
        );
        assert_eq!(
            report(ErrorKind::Concurrency, Resolution::Surfaced).severity(),
            AlertSeverity::Warning
        );
        assert_eq!(
            report(ErrorKind::NotFound, Resolution::Surfaced).severity(),
            AlertSeverity::Critical
        );
        assert_eq!(
            report(ErrorKind::Connectivity, Resolution::Surfaced).severity(),
            AlertSeverity::Critical
        );
    }

    #[tokio::test]
    async fn in_memory_channel_keeps_newest_first() {
        let reporter = ErrorReporter::new(AlertChannel::in_memory());
        let first = report(ErrorKind::Validation, Resolution::Surfaced);
        let second = report(ErrorKind::NotFound, Resolution::Surfaced);
        let second_id = second.correlation_id;

        reporter.report(first).await;
        reporter.report(second).await;

        let store = reporter.alert_store().unwrap();
        let store = store.lock().await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.all().first().unwrap().correlation_id, second_id);
        assert_eq!(store.at_least(AlertSeverity::Critical).len(), 1);
        assert_eq!(store.for_correlation(second_id).len(), 1);
    }

    #[test]
    fn store_is_bounded() {
        let mut store = AlertStore::new();
        let template = report(ErrorKind::Validation, Resolution::Surfaced);
        for _ in 0..(MAX_ALERTS + 10) {
            store.push(Alert::from(&template));
        }
        assert_eq!(store.len(), MAX_ALERTS);
    }

    #[test]
    fn log_only_channel_exposes_no_store() {
        assert!(ErrorReporter::new(AlertChannel::LogOnly).alert_store().is_none());
    }

    #[test]
    fn alert_serializes_with_wire_names() {
        let alert = Alert::from(&report(ErrorKind::NotFound, Resolution::Surfaced));
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "NotFoundError");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["resolution"], "surfaced");
        assert_eq!(json["nodeId"], "n1");
    }
}
