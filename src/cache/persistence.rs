//! Local persistence of one committed generation per tree.
//!
//! The file is a fixed little-endian header followed by one record per placed
//! node in breadth-first order, so a loader always sees parents before
//! children. Nodes whose content was never loaded are written with an empty
//! payload and come back as outline entries.
//!
//! ```text
//! magic "CNPY" | schema u32 | generation u64 | watermark u64 | record_count u64 | sha256 [u8; 32]
//! record: node_id u64 | has_parent u8 | parent_id u64 | sort_order i32 | payload_len u32 | payload
//! ```
//!
//! The checksum covers the record section. Payloads are JSON encoded
//! [`ContentNodeSource`] values and are validated again on load. Anything
//! unexpected makes [`LocalPersistence::load`] return `None`; a partially
//! decoded file is never handed out.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::content::{ContentNode, ContentNodeSource, NodeId, SourceVersion, TreeKind};
use crate::domain::error::DomainError;

use super::generation::GenId;
use super::navigation::OutlineEntry;
use super::snapshot::Snapshot;

pub const MAGIC: [u8; 4] = *b"CNPY";
pub const SCHEMA_VERSION: u32 = 2;
pub const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 32;

const METRIC_PERSIST_SAVE_MS: &str = "canopy_persist_save_ms";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("cache file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache file is truncated")]
    Truncated,
    #[error("cache file has bad magic {found:?}")]
    BadMagic { found: [u8; 4] },
    #[error("cache file schema {found} does not match supported schema {expected}")]
    SchemaMismatch { found: u32, expected: u32 },
    #[error("cache file checksum mismatch")]
    ChecksumMismatch,
    #[error("cache file has {extra} trailing bytes")]
    TrailingBytes { extra: usize },
    #[error("record {index} payload could not be decoded: {source}")]
    Payload {
        index: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("record {index} is inconsistent with its payload")]
    RecordMismatch { index: u64 },
    #[error("record {index} holds an invalid node: {source}")]
    InvalidNode {
        index: u64,
        #[source]
        source: DomainError,
    },
    #[error("record {index} payload exceeds the record size limit")]
    PayloadTooLarge { index: u64 },
    #[error("persistence task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A generation read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedGeneration {
    pub generation: GenId,
    pub watermark: SourceVersion,
    pub nodes: Vec<ContentNode>,
    /// Placed nodes saved without content.
    pub outline: Vec<OutlineEntry>,
}

impl LoadedGeneration {
    pub fn record_count(&self) -> usize {
        self.nodes.len() + self.outline.len()
    }
}

/// A placed node and its content, if loaded.
pub type PlacedNode = (OutlineEntry, Option<Arc<ContentNode>>);

/// Header fields of a cache file, as reported by `canopy inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub schema_version: u32,
    pub generation: GenId,
    pub watermark: SourceVersion,
    pub record_count: u64,
    pub checksum: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub generation: GenId,
    pub records: usize,
    pub bytes: usize,
}

/// Encodes `placed` (parents first) into the on-disk layout.
pub fn encode(
    placed: &[PlacedNode],
    generation: GenId,
    watermark: SourceVersion,
) -> Result<Vec<u8>, PersistError> {
    let mut records = Vec::with_capacity(placed.len() * 128);
    for (index, (entry, node)) in placed.iter().enumerate() {
        let payload = match node {
            Some(node) => serde_json::to_vec(&node.to_source()).map_err(|source| {
                PersistError::Payload {
                    index: index as u64,
                    source,
                }
            })?,
            None => Vec::new(),
        };
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            PersistError::PayloadTooLarge {
                index: index as u64,
            }
        })?;

        records.extend_from_slice(&entry.id.0.to_le_bytes());
        match entry.parent_id {
            Some(parent) => {
                records.push(1);
                records.extend_from_slice(&parent.0.to_le_bytes());
            }
            None => {
                records.push(0);
                records.extend_from_slice(&0_u64.to_le_bytes());
            }
        }
        records.extend_from_slice(&entry.sort_order.to_le_bytes());
        records.extend_from_slice(&payload_len.to_le_bytes());
        records.extend_from_slice(&payload);
    }

    let checksum = Sha256::digest(&records);
    let mut out = Vec::with_capacity(HEADER_LEN + records.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    out.extend_from_slice(&generation.to_le_bytes());
    out.extend_from_slice(&watermark.to_le_bytes());
    out.extend_from_slice(&(placed.len() as u64).to_le_bytes());
    out.extend_from_slice(checksum.as_slice());
    out.extend_from_slice(&records);
    Ok(out)
}

struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], PersistError> {
        if self.bytes.len() < len {
            return Err(PersistError::Truncated);
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PersistError> {
        let mut out = [0_u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, PersistError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, PersistError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, PersistError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, PersistError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

/// Reads and validates the header without touching the records.
pub fn decode_header(bytes: &[u8]) -> Result<FileHeader, PersistError> {
    let mut cursor = Cursor { bytes };
    let found: [u8; 4] = cursor.array()?;
    if found != MAGIC {
        return Err(PersistError::BadMagic { found });
    }
    let schema_version = cursor.u32()?;
    if schema_version != SCHEMA_VERSION {
        return Err(PersistError::SchemaMismatch {
            found: schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(FileHeader {
        schema_version,
        generation: cursor.u64()?,
        watermark: cursor.u64()?,
        record_count: cursor.u64()?,
        checksum: cursor.array()?,
    })
}

pub fn decode(bytes: &[u8]) -> Result<LoadedGeneration, PersistError> {
    let header = decode_header(bytes)?;
    let records = bytes.get(HEADER_LEN..).ok_or(PersistError::Truncated)?;
    if Sha256::digest(records).as_slice() != header.checksum.as_slice() {
        return Err(PersistError::ChecksumMismatch);
    }

    let mut cursor = Cursor { bytes: records };
    let mut nodes = Vec::new();
    let mut outline = Vec::new();
    for index in 0..header.record_count {
        let id = NodeId(cursor.u64()?);
        let has_parent = cursor.u8()?;
        let parent = cursor.u64()?;
        let sort_order = cursor.i32()?;
        let payload_len = cursor.u32()? as usize;
        let payload = cursor.take(payload_len)?;

        let parent_id = (has_parent != 0).then_some(NodeId(parent));
        if payload.is_empty() {
            outline.push(OutlineEntry {
                id,
                parent_id,
                sort_order,
            });
            continue;
        }

        let source: ContentNodeSource = serde_json::from_slice(payload)
            .map_err(|source| PersistError::Payload { index, source })?;
        let node = ContentNode::from_source(source)
            .map_err(|source| PersistError::InvalidNode { index, source })?;

        if node.id() != id || node.parent_id() != parent_id || node.sort_order() != sort_order {
            return Err(PersistError::RecordMismatch { index });
        }
        nodes.push(node);
    }
    if !cursor.bytes.is_empty() {
        return Err(PersistError::TrailingBytes {
            extra: cursor.bytes.len(),
        });
    }

    Ok(LoadedGeneration {
        generation: header.generation,
        watermark: header.watermark,
        nodes,
        outline,
    })
}

/// Reads and fully validates a cache file.
pub fn read_file(path: &Path) -> Result<LoadedGeneration, PersistError> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| PersistError::Io(err.error))?;
    Ok(())
}

/// The cache file of one tree.
#[derive(Debug, Clone)]
pub struct LocalPersistence {
    tree: TreeKind,
    path: PathBuf,
}

impl LocalPersistence {
    pub fn new(tree: TreeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            tree,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the snapshot's generation and `watermark` to disk.
    ///
    /// Encoding and I/O run on the blocking pool; the file is replaced by an
    /// atomic rename, so readers never observe a half-written file.
    pub async fn save(
        &self,
        snapshot: &Snapshot,
        watermark: SourceVersion,
    ) -> Result<SaveReport, PersistError> {
        let started_at = Instant::now();
        let snapshot = snapshot.clone();
        let path = self.path.clone();

        let report = tokio::task::spawn_blocking(move || {
            let placed: Vec<PlacedNode> = snapshot.iter_outline().collect();
            let bytes = encode(&placed, snapshot.generation(), watermark)?;
            write_atomically(&path, &bytes)?;
            Ok::<_, PersistError>(SaveReport {
                generation: snapshot.generation(),
                records: placed.len(),
                bytes: bytes.len(),
            })
        })
        .await??;

        histogram!(METRIC_PERSIST_SAVE_MS, "tree" => self.tree.as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        info!(
            tree = %self.tree,
            generation = report.generation,
            records = report.records,
            bytes = report.bytes,
            watermark,
            path = %self.path.display(),
            "Saved local cache file"
        );
        Ok(report)
    }

    /// Loads the persisted generation, or `None` when there is no usable
    /// file. The reason for rejecting a file is logged.
    pub async fn load(&self) -> Option<LoadedGeneration> {
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || read_file(&path)).await;

        match result {
            Ok(Ok(loaded)) => {
                info!(
                    tree = %self.tree,
                    generation = loaded.generation,
                    watermark = loaded.watermark,
                    records = loaded.record_count(),
                    outline_only = loaded.outline.len(),
                    "Loaded local cache file"
                );
                Some(loaded)
            }
            Ok(Err(PersistError::Io(err))) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(tree = %self.tree, path = %self.path.display(), "No local cache file");
                None
            }
            Ok(Err(err)) => {
                warn!(
                    tree = %self.tree,
                    path = %self.path.display(),
                    reason = %err,
                    "Rejected local cache file"
                );
                None
            }
            Err(err) => {
                warn!(tree = %self.tree, error = %err, "Local cache load task failed");
                None
            }
        }
    }

    /// Removes the cache file. A missing file is not an error.
    pub async fn discard(&self) -> Result<(), PersistError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(
                    tree = %self.tree,
                    path = %self.path.display(),
                    "Discarded local cache file"
                );
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

struct PersistRequest {
    snapshot: Snapshot,
    watermark: SourceVersion,
}

/// Writes committed generations in the background.
///
/// Requests coalesce: while a save is running only the newest request is
/// kept, so a burst of commits produces at most one extra write.
#[derive(Clone)]
pub struct Persister {
    slot: Arc<watch::Sender<Option<PersistRequest>>>,
}

impl Persister {
    pub fn spawn(
        persistence: Arc<LocalPersistence>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = watch::channel(None);
        let slot = Arc::new(tx);
        let handle = tokio::spawn(run_persister(
            persistence,
            Arc::clone(&slot),
            rx,
            cancel,
        ));
        (Self { slot }, handle)
    }

    pub fn request(&self, snapshot: Snapshot, watermark: SourceVersion) {
        debug!(
            tree = %snapshot.tree(),
            generation = snapshot.generation(),
            watermark,
            "Local cache save requested"
        );
        self.slot.send_replace(Some(PersistRequest {
            snapshot,
            watermark,
        }));
    }
}

fn take_pending(slot: &watch::Sender<Option<PersistRequest>>) -> Option<PersistRequest> {
    let mut pending = None;
    slot.send_if_modified(|current| {
        pending = current.take();
        false
    });
    pending
}

async fn run_persister(
    persistence: Arc<LocalPersistence>,
    slot: Arc<watch::Sender<Option<PersistRequest>>>,
    mut rx: watch::Receiver<Option<PersistRequest>>,
    cancel: CancellationToken,
) {
    loop {
        let stopping = tokio::select! {
            _ = cancel.cancelled() => true,
            changed = rx.changed() => changed.is_err(),
        };

        if let Some(request) = take_pending(&slot)
            && let Err(err) = persistence.save(&request.snapshot, request.watermark).await
        {
            warn!(
                path = %persistence.path().display(),
                error = %err,
                "Background save of local cache file failed"
            );
        }

        if stopping {
            debug!(path = %persistence.path().display(), "Persister stopped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::generation::{GenerationStore, TreeChange};
    use crate::domain::content::test_support::node;

    fn snapshot() -> Snapshot {
        let store = Arc::new(GenerationStore::new(TreeKind::Document));
        store
            .commit(
                0,
                vec![
                    (NodeId(1), Some(node(1, None, 0))),
                    (NodeId(2), Some(node(2, Some(1), 1))),
                    (NodeId(3), Some(node(3, Some(1), 0))),
                ],
            )
            .expect("seed");
        store.acquire_snapshot()
    }

    fn encoded() -> Vec<u8> {
        let snapshot = snapshot();
        let placed: Vec<_> = snapshot.iter_outline().collect();
        encode(&placed, snapshot.generation(), 17).expect("encode")
    }

    #[test]
    fn decoded_file_preserves_breadth_first_order() {
        let loaded = decode(&encoded()).expect("decode");

        assert_eq!(loaded.generation, 1);
        assert_eq!(loaded.watermark, 17);
        let ids: Vec<u64> = loaded.nodes.iter().map(|n| n.id().0).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn outline_only_records_round_trip_without_payload() {
        let snapshot = snapshot();
        let store = Arc::clone(snapshot.store());
        store
            .commit_tree(
                snapshot.generation(),
                vec![TreeChange::Outline(OutlineEntry {
                    id: NodeId(4),
                    parent_id: Some(NodeId(3)),
                    sort_order: 0,
                })],
            )
            .expect("outline");
        let head = store.acquire_snapshot();
        let placed: Vec<_> = head.iter_outline().collect();

        let loaded = decode(&encode(&placed, head.generation(), 3).expect("encode"))
            .expect("decode");

        assert_eq!(loaded.nodes.len(), 3);
        assert_eq!(
            loaded.outline,
            vec![OutlineEntry {
                id: NodeId(4),
                parent_id: Some(NodeId(3)),
                sort_order: 0,
            }]
        );
        assert_eq!(loaded.record_count(), 4);
    }

    #[test]
    fn flipped_schema_byte_is_rejected() {
        let mut bytes = encoded();
        bytes[4] ^= 0xFF;

        assert!(matches!(
            decode(&bytes),
            Err(PersistError::SchemaMismatch { expected: 2, .. })
        ));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let bytes = encoded();
        assert!(matches!(
            decode(&bytes[..HEADER_LEN - 3]),
            Err(PersistError::Truncated)
        ));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(PersistError::ChecksumMismatch)
        ));
    }

    #[test]
    fn corrupted_record_fails_checksum() {
        let mut bytes = encoded();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x01;
        assert!(matches!(decode(&bytes), Err(PersistError::ChecksumMismatch)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encoded();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(PersistError::BadMagic { .. })));
    }

    #[tokio::test]
    async fn save_then_load_through_the_filesystem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence =
            LocalPersistence::new(TreeKind::Document, dir.path().join("doc.canopy"));

        let report = persistence.save(&snapshot(), 9).await.expect("save");
        let loaded = persistence.load().await.expect("loaded");

        assert_eq!(report.records, 3);
        assert_eq!(loaded.watermark, 9);
        assert_eq!(loaded.nodes.len(), 3);

        persistence.discard().await.expect("discard");
        assert!(persistence.load().await.is_none());
        persistence.discard().await.expect("discard twice");
    }

    #[tokio::test]
    async fn persister_flushes_pending_request_on_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence = Arc::new(LocalPersistence::new(
            TreeKind::Media,
            dir.path().join("nested").join("media.canopy"),
        ));
        let cancel = CancellationToken::new();
        let (persister, handle) = Persister::spawn(Arc::clone(&persistence), cancel.clone());

        persister.request(snapshot(), 4);
        cancel.cancel();
        handle.await.expect("persister task");

        let loaded = read_file(persistence.path()).expect("file written");
        assert_eq!(loaded.watermark, 4);
    }
}
