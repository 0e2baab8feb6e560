use thiserror::Error;

use crate::application::repos::RepoError;
use crate::domain::content::NodeId;
use crate::domain::error::DomainError;

use super::generation::GenId;

/// Failures of the commit and navigation paths.
///
/// Read paths never surface these; a snapshot either has a value or it does
/// not.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("commit based on generation {base} but head is {head}")]
    ConcurrentCommitConflict { base: GenId, head: GenId },
    #[error("node {id} references parent {parent} which is not in the generation")]
    MissingParent { id: NodeId, parent: NodeId },
    #[error("moving node {id} under {parent} would make it its own ancestor")]
    CyclicMove { id: NodeId, parent: NodeId },
    #[error("node {id} is not present in generation {generation}")]
    NodeNotFound { id: NodeId, generation: GenId },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepoError),
    #[error("operation cancelled")]
    Cancelled,
}

impl CacheError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrentCommitConflict { .. })
    }
}
