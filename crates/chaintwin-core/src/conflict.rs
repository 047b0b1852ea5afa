//! Conflict resolution between a node's current metrics and an incoming update.
//!
//! The resolver is pure: it reads no clock and performs no I/O, so the same
//! inputs always yield the same [`MergeOutcome`]. Metrics are never merged
//! field by field. One side wins and its whole metrics unit is kept.
//!
//! Two concerns are kept apart:
//!
//! 1. **Which side wins** is decided by the [`ResolutionPolicy`].
//! 2. **Whether to flag a discrepancy** depends only on the two sources and
//!    how close together their timestamps are. Two different systems
//!    reporting within the conflict window usually means one of them is
//!    wrong, whichever policy picks the winner.

use std::time::Duration;

use chaintwin_types::{MetricsUpdate, NodeMetrics};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Default window within which reports from different sources are flagged.
pub const DEFAULT_CONFLICT_WINDOW: Duration = Duration::from_secs(5);

/// How the winning side of a merge is chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy", content = "sources")]
pub enum ResolutionPolicy {
    /// The later observation wins. On equal timestamps the incoming update
    /// wins.
    #[default]
    LatestTimestampWins,
    /// Sources earlier in the list outrank later ones. Unlisted sources rank
    /// below every listed one. Equal rank falls back to
    /// [`ResolutionPolicy::LatestTimestampWins`].
    SourcePriority(Vec<String>),
}

impl ResolutionPolicy {
    /// Build a policy from a configured priority list. An empty list means
    /// latest-timestamp-wins.
    pub fn from_priority(sources: Vec<String>) -> Self {
        if sources.is_empty() {
            Self::LatestTimestampWins
        } else {
            Self::SourcePriority(sources)
        }
    }

    fn rank(sources: &[String], source: &str) -> usize {
        sources
            .iter()
            .position(|s| s == source)
            .unwrap_or(usize::MAX)
    }
}

/// Which side of a merge was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    /// The node's stored metrics.
    Current,
    /// The metrics carried by the update.
    Incoming,
}

/// Two sources reported the same node within the conflict window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    /// Source of the stored metrics.
    pub current_source: String,
    /// Observation time of the stored metrics.
    pub current_timestamp: DateTime<Utc>,
    /// Source of the incoming update.
    pub incoming_source: String,
    /// Observation time of the incoming update.
    pub incoming_timestamp: DateTime<Utc>,
    /// Which side was kept.
    pub winner: Winner,
}

impl Discrepancy {
    /// The source whose metrics were kept.
    pub fn winning_source(&self) -> &str {
        match self.winner {
            Winner::Current => &self.current_source,
            Winner::Incoming => &self.incoming_source,
        }
    }

    /// Absolute distance between the two observations.
    pub fn skew(&self) -> TimeDelta {
        self.incoming_timestamp
            .signed_duration_since(self.current_timestamp)
            .abs()
    }
}

/// Result of [`ConflictResolver::merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The metrics unit to persist.
    pub metrics: NodeMetrics,
    /// Which side supplied `metrics`.
    pub winner: Winner,
    /// Set when the two sides differ in source and fall within the window.
    pub discrepancy: Option<Discrepancy>,
}

impl MergeOutcome {
    /// Whether the merge raised a discrepancy flag.
    pub const fn is_conflict(&self) -> bool {
        self.discrepancy.is_some()
    }
}

/// Merges incoming metric updates into a node's current metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolver {
    policy: ResolutionPolicy,
    window: TimeDelta,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolutionPolicy::default(), DEFAULT_CONFLICT_WINDOW)
    }
}

impl ConflictResolver {
    /// Create a resolver with the given policy and discrepancy window.
    pub fn new(policy: ResolutionPolicy, window: Duration) -> Self {
        Self {
            policy,
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
        }
    }

    /// The active policy.
    pub const fn policy(&self) -> &ResolutionPolicy {
        &self.policy
    }

    /// Decide which metrics survive and whether the pair is suspicious.
    ///
    /// The discrepancy window is inclusive: reports exactly `window` apart
    /// are flagged.
    pub fn merge(&self, current: &NodeMetrics, incoming: &MetricsUpdate) -> MergeOutcome {
        let winner = self.pick_winner(current, incoming);

        let skew = incoming
            .timestamp
            .signed_duration_since(current.last_update_timestamp)
            .abs();
        let discrepancy = (incoming.source != current.last_update_source && skew <= self.window)
            .then(|| Discrepancy {
                current_source: current.last_update_source.clone(),
                current_timestamp: current.last_update_timestamp,
                incoming_source: incoming.source.clone(),
                incoming_timestamp: incoming.timestamp,
                winner,
            });

        let metrics = match winner {
            Winner::Current => current.clone(),
            Winner::Incoming => incoming.to_metrics(),
        };

        MergeOutcome {
            metrics,
            winner,
            discrepancy,
        }
    }

    fn pick_winner(&self, current: &NodeMetrics, incoming: &MetricsUpdate) -> Winner {
        if let ResolutionPolicy::SourcePriority(sources) = &self.policy {
            let current_rank = ResolutionPolicy::rank(sources, &current.last_update_source);
            let incoming_rank = ResolutionPolicy::rank(sources, &incoming.source);
            if incoming_rank < current_rank {
                return Winner::Incoming;
            }
            if current_rank < incoming_rank {
                return Winner::Current;
            }
        }
        if incoming.timestamp >= current.last_update_timestamp {
            Winner::Incoming
        } else {
            Winner::Current
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0().checked_add_signed(TimeDelta::seconds(secs)).unwrap()
    }

    fn current(source: &str, secs: i64) -> NodeMetrics {
        NodeMetrics::new(500, 0.5, at(secs), source)
    }

    fn update(source: &str, secs: i64, inventory: u64) -> MetricsUpdate {
        MetricsUpdate {
            current_inventory: inventory,
            utilization_rate: 0.48,
            timestamp: at(secs),
            source: source.to_owned(),
        }
    }

    #[test]
    fn manual_entry_three_seconds_later_wins_and_is_flagged() {
        let outcome = ConflictResolver::default()
            .merge(&current("iot-core", 0), &update("manual-entry", 3, 480));

        assert_eq!(outcome.winner, Winner::Incoming);
        assert_eq!(outcome.metrics.current_inventory, 480);
        assert_eq!(outcome.metrics.last_update_source, "manual-entry");
        assert_eq!(outcome.metrics.last_update_timestamp, at(3));

        let d = outcome.discrepancy.unwrap();
        assert_eq!(d.current_source, "iot-core");
        assert_eq!(d.incoming_source, "manual-entry");
        assert_eq!(d.winning_source(), "manual-entry");
        assert_eq!(d.skew(), TimeDelta::seconds(3));
    }

    #[test]
    fn older_update_keeps_current_metrics() {
        let outcome = ConflictResolver::default()
            .merge(&current("iot-core", 10), &update("erp", 0, 1));
        assert_eq!(outcome.winner, Winner::Current);
        assert_eq!(outcome.metrics, current("iot-core", 10));
    }

    #[test]
    fn equal_timestamps_favor_incoming() {
        let outcome = ConflictResolver::default()
            .merge(&current("iot-core", 0), &update("erp", 0, 7));
        assert_eq!(outcome.winner, Winner::Incoming);
        assert!(outcome.is_conflict());
    }

    #[test]
    fn window_is_inclusive_and_bounded() {
        let resolver = ConflictResolver::default();
        assert!(resolver.merge(&current("a", 0), &update("b", 5, 1)).is_conflict());
        assert!(!resolver.merge(&current("a", 0), &update("b", 6, 1)).is_conflict());
        assert!(resolver.merge(&current("a", 5), &update("b", 0, 1)).is_conflict());
    }

    #[test]
    fn same_source_is_never_a_discrepancy() {
        let outcome = ConflictResolver::default()
            .merge(&current("iot-core", 0), &update("iot-core", 1, 1));
        assert!(!outcome.is_conflict());
    }

    #[test]
    fn source_priority_overrides_recency() {
        let policy = ResolutionPolicy::from_priority(vec![
            String::from("erp"),
            String::from("iot-core"),
        ]);
        let resolver = ConflictResolver::new(policy, DEFAULT_CONFLICT_WINDOW);

        let outcome = resolver.merge(&current("erp", 0), &update("iot-core", 3, 1));
        assert_eq!(outcome.winner, Winner::Current);
        assert_eq!(outcome.discrepancy.unwrap().winning_source(), "erp");

        // Unlisted sources rank last.
        let outcome = resolver.merge(&current("spreadsheet", 0), &update("iot-core", -60, 1));
        assert_eq!(outcome.winner, Winner::Incoming);

        // Equal rank falls back to recency.
        let outcome = resolver.merge(&current("x", 10), &update("y", 0, 1));
        assert_eq!(outcome.winner, Winner::Current);
    }

    #[test]
    fn empty_priority_list_is_latest_timestamp_wins() {
        assert_eq!(
            ResolutionPolicy::from_priority(Vec::new()),
            ResolutionPolicy::LatestTimestampWins
        );
    }
}
