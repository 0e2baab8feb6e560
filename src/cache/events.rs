//! Change notifications and cache warnings.
//!
//! Notifications travel over a bounded `mpsc` channel from whatever observes
//! repository writes to the invalidation pipeline. Warnings go the other way:
//! the pipeline broadcasts them to any number of observers.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::domain::content::{NodeId, SourceVersion, TreeKind};

/// What happened to a node in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Published,
    Unpublished,
    Moved,
    Sorted,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Published => "published",
            ChangeKind::Unpublished => "unpublished",
            ChangeKind::Moved => "moved",
            ChangeKind::Sorted => "sorted",
            ChangeKind::Deleted => "deleted",
        }
    }

    /// Whether the change removes the node from the published tree.
    pub fn is_removal(self) -> bool {
        matches!(self, ChangeKind::Unpublished | ChangeKind::Deleted)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub node_id: NodeId,
    pub kind: ChangeKind,
    pub source_version: SourceVersion,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl ChangeNotification {
    pub fn new(node_id: NodeId, kind: ChangeKind, source_version: SourceVersion) -> Self {
        Self {
            node_id,
            kind,
            source_version,
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Sending half of the notification channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tree: TreeKind,
    inner: mpsc::Sender<ChangeNotification>,
}

/// Receiving half of the notification channel, owned by the pipeline.
#[derive(Debug)]
pub struct EventReceiver {
    tree: TreeKind,
    inner: mpsc::Receiver<ChangeNotification>,
}

/// The pipeline is gone; the notification was not delivered.
#[derive(Debug, thiserror::Error)]
#[error("change notification channel for {tree} is closed")]
pub struct ChannelClosed {
    pub tree: TreeKind,
    pub notification: ChangeNotification,
}

/// Creates a bounded notification channel for one tree.
pub fn channel(tree: TreeKind, capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender { tree, inner: tx },
        EventReceiver { tree, inner: rx },
    )
}

impl EventSender {
    /// Queues a notification, waiting for capacity when the channel is full.
    pub async fn send(&self, notification: ChangeNotification) -> Result<(), ChannelClosed> {
        let node_id = notification.node_id;
        let kind = notification.kind;
        let source_version = notification.source_version;

        self.inner
            .send(notification)
            .await
            .map_err(|err| ChannelClosed {
                tree: self.tree,
                notification: err.0,
            })?;

        info!(
            tree = %self.tree,
            node_id = %node_id,
            event_kind = %kind,
            source_version,
            "Change notification enqueued"
        );
        Ok(())
    }

    pub fn tree(&self) -> TreeKind {
        self.tree
    }
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        self.inner.recv().await
    }

    pub fn tree(&self) -> TreeKind {
        self.tree
    }
}

/// A change the cache could not apply.
///
/// The affected node keeps serving its last committed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWarning {
    pub tree: TreeKind,
    pub node_id: Option<NodeId>,
    pub source_version: Option<SourceVersion>,
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningKind {
    RetriesExhausted,
    Unresolvable,
    MissingParent,
    Rejected,
    RepositoryFailure,
}

impl WarningKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WarningKind::RetriesExhausted => "retries_exhausted",
            WarningKind::Unresolvable => "unresolvable",
            WarningKind::MissingParent => "missing_parent",
            WarningKind::Rejected => "rejected",
            WarningKind::RepositoryFailure => "repository_failure",
        }
    }
}

/// Broadcasts [`CacheWarning`]s to every subscriber.
///
/// Reporting never fails: without subscribers the warning is only logged.
#[derive(Debug, Clone)]
pub struct WarningReporter {
    inner: broadcast::Sender<CacheWarning>,
}

impl WarningReporter {
    pub fn new(capacity: usize) -> Self {
        let (inner, _) = broadcast::channel(capacity.max(1));
        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheWarning> {
        self.inner.subscribe()
    }

    pub fn report(&self, warning: CacheWarning) {
        warn!(
            tree = %warning.tree,
            node_id = ?warning.node_id,
            source_version = ?warning.source_version,
            warning = warning.kind.as_str(),
            message = %warning.message,
            "Cache warning"
        );
        let _ = self.inner.send(warning);
    }
}
