//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`]. Driver errors from [`fred`]
//! are folded into [`DbError::Connectivity`] together with the operation
//! that failed. Errors from [`sqlx`] are sorted by whether a retry can help:
//! I/O, pool and serialization-failure errors are connectivity faults, rows
//! that cannot be decoded are [`DbError::Decode`], bad settings are
//! [`DbError::Config`] and any other refusal by the server is
//! [`DbError::Rejected`].

use std::future::Future;
use std::time::Duration;

use chaintwin_types::{ErrorKind, NodeId};

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The cache or durable store was unreachable, refused the request, or
    /// did not answer within the configured timeout.
    #[error("connectivity error during {operation}: {message}")]
    Connectivity {
        /// The operation that failed (e.g. `cache get`, `node update`).
        operation: &'static str,
        /// Driver or timeout detail.
        message: String,
    },

    /// An operation was attempted while the cache was disconnected.
    #[error("cache is disconnected")]
    Disconnected,

    /// A conditional write found a different version than expected.
    #[error("version conflict on node {node_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The node being written.
        node_id: NodeId,
        /// Version the writer last read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The node does not exist in the durable store.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// A node with this id is already provisioned.
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),

    /// A value could not be serialized for storage.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be turned back into a node.
    #[error("stored data is unreadable: {0}")]
    Decode(String),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The store refused a statement and will refuse it again on retry.
    #[error("{operation} rejected by the store: {message}")]
    Rejected {
        /// The operation that failed.
        operation: &'static str,
        /// Server detail, including the SQLSTATE when known.
        message: String,
    },
}

impl DbError {
    /// Classify this error into the core failure taxonomy.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity { .. }
            | Self::Disconnected
            | Self::Decode(_)
            | Self::Migration(_)
            | Self::Config(_)
            | Self::Rejected { .. } => ErrorKind::Connectivity,
            Self::VersionConflict { .. } => ErrorKind::Concurrency,
            Self::NodeNotFound(_) => ErrorKind::NotFound,
            Self::DuplicateNode(_) | Self::Serialization(_) => ErrorKind::Validation,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only connectivity failures qualify; unreadable rows and bad
    /// configuration will fail the same way on every attempt.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Disconnected)
    }

    pub(crate) fn postgres(operation: &'static str, source: &sqlx::Error) -> Self {
        let message = source.to_string();
        match source {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connectivity { operation, message },
            sqlx::Error::Database(db) => {
                let code = db.code().map(std::borrow::Cow::into_owned).unwrap_or_default();
                if is_transient_sqlstate(&code) {
                    Self::Connectivity { operation, message }
                } else {
                    Self::Rejected {
                        operation,
                        message: format!("{message} (SQLSTATE {code})"),
                    }
                }
            }
            sqlx::Error::RowNotFound
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => Self::Decode(format!("{operation}: {message}")),
            sqlx::Error::Configuration(_) => Self::Config(format!("{operation}: {message}")),
            _ => Self::Rejected { operation, message },
        }
    }

    pub(crate) fn dragonfly(operation: &'static str, source: &fred::error::Error) -> Self {
        Self::Connectivity {
            operation,
            message: source.to_string(),
        }
    }
}

/// SQLSTATEs after which the same statement may succeed: connection
/// exceptions (class 08), serialization failure, deadlock, too many
/// connections and server shutdown.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || matches!(code, "40001" | "40P01" | "53300" | "57P01" | "57P02" | "57P03")
}

/// Run `fut`, failing with [`DbError::Connectivity`] if it does not finish
/// within `limit`.
pub(crate) async fn bounded<T, F>(
    limit: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, DbError>
where
    F: Future<Output = Result<T, DbError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|elapsed| DbError::Connectivity {
            operation,
            message: format!("timed out after {}ms ({elapsed})", limit.as_millis()),
        })?
}
