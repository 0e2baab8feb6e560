//! Cache configuration.
//!
//! Controls seeding, persistence and the invalidation pipeline via the
//! `[cache]` table of `canopy.toml`.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::Deserialize;

use crate::domain::content::TreeKind;

const DEFAULT_SEED_COUNT_DOCUMENTS: usize = 100;
const DEFAULT_SEED_COUNT_MEDIA: usize = 100;
const DEFAULT_MAX_COMMIT_RETRIES: u32 = 3;
const DEFAULT_LOCAL_DIR: &str = "data/cache";
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_KIT_BATCH_SIZE: usize = 256;
const DEFAULT_CHILDREN_PAGE_SIZE: usize = 500;
const DEFAULT_WARNING_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of documents loaded eagerly on rebuild.
    pub seed_count_documents: usize,
    /// Number of media items loaded eagerly on rebuild.
    pub seed_count_media: usize,
    /// Save committed generations to `local_dir` and load them on start.
    pub persistence_enabled: bool,
    /// Rebase attempts after a commit conflict before giving up.
    pub max_commit_retries: u32,
    pub local_dir: PathBuf,
    pub event_channel_capacity: usize,
    /// Nodes fetched from the repository per batch during rebuild.
    pub kit_batch_size: usize,
    /// Child ids requested per page while seeding from the repository.
    pub children_page_size: usize,
    pub warning_channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            seed_count_documents: DEFAULT_SEED_COUNT_DOCUMENTS,
            seed_count_media: DEFAULT_SEED_COUNT_MEDIA,
            persistence_enabled: true,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            local_dir: PathBuf::from(DEFAULT_LOCAL_DIR),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            kit_batch_size: DEFAULT_KIT_BATCH_SIZE,
            children_page_size: DEFAULT_CHILDREN_PAGE_SIZE,
            warning_channel_capacity: DEFAULT_WARNING_CHANNEL_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            seed_count_documents: settings.seed_count_documents,
            seed_count_media: settings.seed_count_media,
            persistence_enabled: settings.persistence_enabled,
            max_commit_retries: settings.max_commit_retries,
            local_dir: settings.local_dir.clone(),
            event_channel_capacity: settings.event_channel_capacity.get(),
            kit_batch_size: settings.kit_batch_size.get(),
            children_page_size: settings.children_page_size.get(),
            warning_channel_capacity: settings.warning_channel_capacity.get(),
        }
    }
}

impl CacheConfig {
    pub fn seed_count(&self, tree: TreeKind) -> usize {
        match tree {
            TreeKind::Document => self.seed_count_documents,
            TreeKind::Media => self.seed_count_media,
        }
    }

    /// Local file holding the persisted generation of `tree`.
    pub fn local_file(&self, tree: TreeKind) -> PathBuf {
        self.local_dir.join(format!("{}.canopy", tree.as_str()))
    }

    /// Returns the kit batch size as NonZeroUsize, clamping to 1 if zero.
    pub fn kit_batch_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.kit_batch_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the children page size as NonZeroUsize, clamping to 1 if zero.
    pub fn children_page_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.children_page_size).unwrap_or(NonZeroUsize::MIN)
    }
}
