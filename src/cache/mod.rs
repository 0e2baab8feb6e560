//! Canopy published cache.
//!
//! Each content tree (documents and media) is held as a chain of immutable
//! generations:
//!
//! - **Readers** pin a generation through a [`Snapshot`] and see one
//!   consistent tree for as long as they hold it.
//! - **The writer** stages a batch of node changes, plans navigation updates
//!   and publishes them as the next generation in one step.
//! - **Collection** trims versions no pinned snapshot can observe.
//!
//! Change notifications flow through the [`InvalidationPipeline`], which
//! re-reads nodes from the [`ContentRepository`](crate::application::repos::ContentRepository)
//! and commits them. Committed generations are saved to a local file and
//! loaded on the next start.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! seed_count_documents = 100
//! seed_count_media = 100
//! persistence_enabled = true
//! local_dir = "data/cache"
//! # ... see config.rs for all options
//! ```

mod config;
mod error;
mod events;
mod generation;
pub(crate) mod lock;
pub mod navigation;
mod partition;
pub mod persistence;
mod pipeline;
mod planner;
pub mod seed;
mod service;
mod snapshot;
mod versioned;

pub use config::CacheConfig;
pub use error::CacheError;
pub use events::{
    CacheWarning, ChangeKind, ChangeNotification, ChannelClosed, EventReceiver, EventSender,
    WarningKind, WarningReporter, channel,
};
pub use generation::{GcReport, GenId, GenerationStore, NodeChange, TreeChange};
pub use navigation::{Children, NavigationEntry, OutlineEntry};
pub use partition::{Partition, PartitionStatus, StartSource};
pub use persistence::{LocalPersistence, PersistError, Persister};
pub use pipeline::{ApplyOutcome, ChangeState, InvalidationPipeline};
pub use seed::{RootProvider, SeedKey, TreeOutline, load_outline, seed_keys};
pub use service::PublishedCache;
pub use snapshot::Snapshot;
