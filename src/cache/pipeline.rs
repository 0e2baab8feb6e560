//! Invalidation pipeline.
//!
//! Turns change notifications into commits. Each notification moves through
//! `Received -> Resolved -> Committed`; a commit conflict sends it through
//! `Failed -> Retried` and back to resolution against the new head, and
//! anything that cannot be applied ends in `Reported` with a
//! [`CacheWarning`]. Notifications are applied one at a time per tree.
//!
//! A notification is a duplicate when its version is already reflected in
//! the cache:
//!
//! - it is at or below the version the tree was loaded at;
//! - the cached node is at least as new;
//! - a change at least as new was applied to the node, removals included.
//!
//! The watermark is a low-water mark. It never passes a version that was
//! reported and not applied since, so replaying the change log from it
//! retries that change.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::application::repos::{ContentRepository, RepoError};
use crate::domain::content::{ContentNode, NodeId, SourceVersion, TreeKind};

use super::error::CacheError;
use super::events::{
    CacheWarning, ChangeKind, ChangeNotification, EventReceiver, WarningKind, WarningReporter,
};
use super::generation::{GenId, GenerationStore, TreeChange};
use super::persistence::Persister;
use super::seed::{RepositoryRoots, load_outline};
use super::snapshot::Snapshot;

const METRIC_PIPELINE_TRANSITION_TOTAL: &str = "canopy_pipeline_transition_total";
const METRIC_PIPELINE_OUTCOME_TOTAL: &str = "canopy_pipeline_outcome_total";
const METRIC_PIPELINE_APPLY_MS: &str = "canopy_pipeline_apply_ms";

const DEFAULT_PAGE_SIZE: usize = 500;

/// Lifecycle states of one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Received,
    Resolved,
    Committed,
    Failed,
    Retried,
    Reported,
}

impl ChangeState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeState::Received => "received",
            ChangeState::Resolved => "resolved",
            ChangeState::Committed => "committed",
            ChangeState::Failed => "failed",
            ChangeState::Retried => "retried",
            ChangeState::Reported => "reported",
        }
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What applying one notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new generation was published.
    Committed { generation: GenId },
    /// The version was already applied; nothing changed.
    Duplicate,
    /// Nothing to change (removal of a node the cache does not hold).
    Unchanged,
    /// The change could not be applied and was reported as a warning.
    Reported(WarningKind),
}

impl ApplyOutcome {
    fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Committed { .. } => "committed",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Reported(_) => "reported",
        }
    }
}

enum Resolution {
    Changes(Vec<TreeChange>),
    Nothing,
}

struct Failure {
    kind: WarningKind,
    message: String,
}

impl Failure {
    fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn repository(err: impl fmt::Display) -> Self {
        Self::new(WarningKind::RepositoryFailure, err.to_string())
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    /// Newest version applied per node, removals included.
    applied: HashMap<NodeId, SourceVersion>,
    /// Versions at or below this are reflected in the tree the cache was
    /// loaded from.
    baseline: SourceVersion,
    /// Highest version applied or recognised as a duplicate.
    settled: SourceVersion,
    /// Reported versions not applied since.
    unresolved: BTreeSet<SourceVersion>,
}

impl PipelineState {
    fn watermark(&self) -> SourceVersion {
        match self.unresolved.first() {
            Some(first) => self.settled.min(first.saturating_sub(1)),
            None => self.settled,
        }
    }

    fn already_applied(&self, notification: &ChangeNotification) -> Option<SourceVersion> {
        if notification.source_version <= self.baseline {
            return Some(self.baseline);
        }
        self.applied
            .get(&notification.node_id)
            .copied()
            .filter(|applied| *applied >= notification.source_version)
    }
}

pub struct InvalidationPipeline {
    tree: TreeKind,
    store: Arc<GenerationStore>,
    repository: Arc<dyn ContentRepository>,
    warnings: WarningReporter,
    persister: Option<Persister>,
    max_commit_retries: u32,
    page_size: usize,
    watermark: AtomicU64,
    state: Mutex<PipelineState>,
}

impl InvalidationPipeline {
    pub fn new(
        store: Arc<GenerationStore>,
        repository: Arc<dyn ContentRepository>,
        warnings: WarningReporter,
        max_commit_retries: u32,
    ) -> Self {
        Self {
            tree: store.tree(),
            store,
            repository,
            warnings,
            persister: None,
            max_commit_retries,
            page_size: DEFAULT_PAGE_SIZE,
            watermark: AtomicU64::new(0),
            state: Mutex::new(PipelineState::default()),
        }
    }

    /// Requests a background save after every committed notification.
    pub fn with_persister(mut self, persister: Persister) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Page and batch size used when a republished node brings its branch.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Every change up to this version is applied. Reported changes hold it
    /// back until they are applied.
    pub fn watermark(&self) -> SourceVersion {
        self.watermark.load(Ordering::Acquire)
    }

    /// Marks every change up to `version` as reflected in the tree the cache
    /// was just loaded from. Never moves the watermark back.
    pub async fn rebase(&self, version: SourceVersion) {
        let mut state = self.state.lock().await;
        state.baseline = state.baseline.max(version);
        state.settled = state.settled.max(version);
        state.unresolved.retain(|unresolved| *unresolved > version);
        self.publish_watermark(&state);
    }

    /// Forgets applied versions and the watermark, e.g. before a rebuild
    /// that re-reads the whole tree.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = PipelineState::default();
        self.publish_watermark(&state);
    }

    fn publish_watermark(&self, state: &PipelineState) {
        self.watermark.store(state.watermark(), Ordering::Release);
    }

    fn transition(&self, notification: &ChangeNotification, state: ChangeState) {
        counter!(
            METRIC_PIPELINE_TRANSITION_TOTAL,
            "tree" => self.tree.as_str(),
            "state" => state.as_str()
        )
        .increment(1);
        debug!(
            tree = %self.tree,
            node_id = %notification.node_id,
            event_kind = %notification.kind,
            source_version = notification.source_version,
            state = %state,
            "Change state transition"
        );
    }

    /// Applies one notification, retrying commit conflicts.
    #[instrument(
        skip(self, notification),
        fields(
            tree = %self.tree,
            node_id = %notification.node_id,
            event_kind = %notification.kind,
            source_version = notification.source_version
        )
    )]
    pub async fn apply(&self, notification: ChangeNotification) -> ApplyOutcome {
        let started_at = Instant::now();
        let mut state = self.state.lock().await;
        self.transition(&notification, ChangeState::Received);

        let outcome = match state.already_applied(&notification) {
            Some(applied) => {
                debug!(applied, "Duplicate notification ignored");
                self.settle(&mut state, &notification);
                ApplyOutcome::Duplicate
            }
            None => self.apply_fresh(&mut state, &notification).await,
        };

        counter!(
            METRIC_PIPELINE_OUTCOME_TOTAL,
            "tree" => self.tree.as_str(),
            "outcome" => outcome.label()
        )
        .increment(1);
        histogram!(METRIC_PIPELINE_APPLY_MS, "tree" => self.tree.as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn apply_fresh(
        &self,
        state: &mut PipelineState,
        notification: &ChangeNotification,
    ) -> ApplyOutcome {
        let mut attempt = 0_u32;
        loop {
            let snapshot = self.store.acquire_snapshot();
            let base = snapshot.generation();
            if let Some(cached) = snapshot.get(notification.node_id)
                && cached.source_version() >= notification.source_version
            {
                debug!(
                    cached_version = cached.source_version(),
                    "Notification is not newer than the cached node"
                );
                self.settle(state, notification);
                return ApplyOutcome::Duplicate;
            }

            let resolution = match self.resolve(notification, &snapshot).await {
                Ok(resolution) => resolution,
                Err(failure) => return self.report(state, notification, failure),
            };
            drop(snapshot);
            self.transition(notification, ChangeState::Resolved);

            let changes = match resolution {
                Resolution::Changes(changes) => changes,
                Resolution::Nothing => {
                    self.record_applied(state, notification);
                    return ApplyOutcome::Unchanged;
                }
            };

            match self.store.commit_tree(base, changes) {
                Ok(generation) => {
                    self.transition(notification, ChangeState::Committed);
                    self.record_applied(state, notification);
                    if let Some(persister) = &self.persister {
                        persister.request(self.store.acquire_snapshot(), self.watermark());
                    }
                    return ApplyOutcome::Committed { generation };
                }
                Err(err) if err.is_conflict() => {
                    self.transition(notification, ChangeState::Failed);
                    if attempt >= self.max_commit_retries {
                        return self.report(
                            state,
                            notification,
                            Failure::new(
                                WarningKind::RetriesExhausted,
                                format!("gave up after {attempt} retries: {err}"),
                            ),
                        );
                    }
                    attempt += 1;
                    self.transition(notification, ChangeState::Retried);
                }
                Err(err @ CacheError::MissingParent { .. }) => {
                    self.transition(notification, ChangeState::Failed);
                    return self.report(
                        state,
                        notification,
                        Failure::new(WarningKind::MissingParent, err.to_string()),
                    );
                }
                Err(err) => {
                    self.transition(notification, ChangeState::Failed);
                    return self.report(
                        state,
                        notification,
                        Failure::new(WarningKind::Rejected, err.to_string()),
                    );
                }
            }
        }
    }

    async fn resolve(
        &self,
        notification: &ChangeNotification,
        snapshot: &Snapshot,
    ) -> Result<Resolution, Failure> {
        let id = notification.node_id;
        let cached = snapshot.get(id);
        let placed = snapshot.entry(id).is_some();
        if notification.kind.is_removal() {
            return Ok(if placed || cached.is_some() {
                Resolution::Changes(vec![TreeChange::Node(id, None)])
            } else {
                Resolution::Nothing
            });
        }

        let source = match self.repository.load_node(self.tree, id).await {
            Ok(Some(source)) => source,
            Ok(None) | Err(RepoError::NotFound) => {
                return Err(Failure::new(
                    WarningKind::Unresolvable,
                    format!("node {id} is no longer in the repository"),
                ));
            }
            Err(err) => return Err(Failure::repository(err)),
        };

        let node = ContentNode::from_source(source)
            .map_err(|err| Failure::new(WarningKind::Rejected, err.to_string()))?;
        if notification.kind == ChangeKind::Sorted
            && let Some(cached) = &cached
            && cached.parent_id() != node.parent_id()
        {
            debug!(
                node_id = %id,
                cached_parent = ?cached.parent_id(),
                parent = ?node.parent_id(),
                "Sorted notification also changes the parent"
            );
        }

        let mut changes = vec![TreeChange::Node(id, Some(node))];
        if !placed {
            changes.extend(self.load_branch(id).await?);
        }
        Ok(Resolution::Changes(changes))
    }

    /// Outline and content of everything below `id`, for a node entering the
    /// tree. Descendants whose content cannot be used stay outline-only.
    async fn load_branch(&self, id: NodeId) -> Result<Vec<TreeChange>, Failure> {
        let provider =
            RepositoryRoots::new(Arc::clone(&self.repository), self.tree, self.page_size);
        let outline = load_outline(&provider, Some(id), &CancellationToken::new())
            .await
            .map_err(Failure::repository)?;
        if outline.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<NodeId> = outline.entries().iter().map(|entry| entry.id).collect();
        let mut changes: Vec<TreeChange> = outline
            .entries()
            .iter()
            .copied()
            .map(TreeChange::Outline)
            .collect();
        let mut loaded = 0_usize;
        for batch in ids.chunks(self.page_size) {
            let sources = self
                .repository
                .load_nodes(self.tree, batch)
                .await
                .map_err(Failure::repository)?;
            for source in sources {
                if !source.parent_id.is_some_and(|parent| outline.contains(parent)) {
                    continue;
                }
                let node_id = source.id;
                match ContentNode::from_source(source) {
                    Ok(node) => {
                        loaded += 1;
                        changes.push(TreeChange::Node(node_id, Some(node)));
                    }
                    Err(err) => {
                        warn!(
                            tree = %self.tree,
                            node_id = %node_id,
                            error = %err,
                            "Skipping invalid node"
                        );
                    }
                }
            }
        }

        debug!(
            tree = %self.tree,
            node_id = %id,
            placed = outline.len(),
            loaded,
            "Loaded branch of node entering the tree"
        );
        Ok(changes)
    }

    fn settle(&self, state: &mut PipelineState, notification: &ChangeNotification) {
        state.settled = state.settled.max(notification.source_version);
        state.unresolved.remove(&notification.source_version);
        self.publish_watermark(state);
    }

    fn record_applied(&self, state: &mut PipelineState, notification: &ChangeNotification) {
        let applied = state.applied.entry(notification.node_id).or_default();
        *applied = (*applied).max(notification.source_version);
        self.settle(state, notification);
    }

    fn report(
        &self,
        state: &mut PipelineState,
        notification: &ChangeNotification,
        failure: Failure,
    ) -> ApplyOutcome {
        self.transition(notification, ChangeState::Reported);
        state.unresolved.insert(notification.source_version);
        self.publish_watermark(state);
        self.warnings.report(CacheWarning {
            tree: self.tree,
            node_id: Some(notification.node_id),
            source_version: Some(notification.source_version),
            kind: failure.kind,
            message: failure.message,
        });
        ApplyOutcome::Reported(failure.kind)
    }

    /// Applies every change the repository logged after `since`.
    pub async fn replay(&self, since: SourceVersion) -> Result<usize, CacheError> {
        let changes = self.repository.changes_since(self.tree, since).await?;
        let total = changes.len();
        let mut committed = 0;
        for notification in changes {
            if let ApplyOutcome::Committed { .. } = self.apply(notification).await {
                committed += 1;
            }
        }
        info!(
            tree = %self.tree,
            since,
            total,
            committed,
            watermark = self.watermark(),
            "Replayed change log"
        );
        Ok(committed)
    }

    /// Consumes notifications until the channel closes or `cancel` fires.
    /// Returns the number of notifications processed.
    pub async fn run(&self, mut receiver: EventReceiver, cancel: CancellationToken) -> usize {
        let mut processed = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                next = receiver.recv() => next,
            };
            let Some(notification) = next else {
                break;
            };
            self.apply(notification).await;
            processed += 1;
        }
        info!(tree = %self.tree, processed, "Invalidation pipeline stopped");
        processed
    }
}
