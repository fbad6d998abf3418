//! Storage engine: the composition root.
//!
//! Ties the file tree, the content-addressed blob catalog, and the chunk
//! assembler together. Catalog transactions are opened only after transport
//! work has finished, so no lock is held across a network round-trip.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::db::Database;
use crate::file::{
    find_in, guess_mime, insert_file_in, join_path, mkdirp_in, normalize_path, resolve_dir_in,
    validate_name, DirRef, FileTree, Listing, Node, PurgeReport,
};
use crate::storage::cas::{self, BlobDescriptor, BlobStore, Registration};
use crate::storage::{
    collect_bytes, BlobAssembler, ChunkPlan, ChunkPlanner, ChunkStream, UploadedBlob,
};
use crate::transport::ChannelTransport;
use crate::{DriveError, Result};

/// Where a new file is placed.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Directory path the file is created in.
    pub parent_path: String,
    /// File name.
    pub name: String,
    /// MIME type; guessed from the name when None.
    pub mime_type: Option<String>,
    /// Create missing parent directories instead of failing with `ParentNotFound`.
    pub create_parents: bool,
}

impl UploadRequest {
    /// Create a new UploadRequest.
    pub fn new(parent_path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            parent_path: parent_path.into(),
            name: name.into(),
            mime_type: None,
            create_parents: false,
        }
    }

    /// Set the MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Create missing parent directories.
    pub fn with_create_parents(mut self, create_parents: bool) -> Self {
        self.create_parents = create_parents;
        self
    }
}

/// How the bytes of an uploaded file were obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "via", rename_all = "lowercase")]
pub enum UploadVia {
    /// Sent through the transport on the given tier.
    Transport {
        /// Tier name.
        tier: String,
    },
    /// Identical content was already stored; the blob is shared.
    Deduplicated,
    /// The same content already lives at the destination path.
    Existing,
}

/// Result of an upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    /// The file node.
    pub node: Node,
    /// How the bytes were obtained.
    #[serde(flatten)]
    pub via: UploadVia,
}

/// A download in progress.
pub struct Download {
    /// The file being downloaded.
    pub node: Node,
    /// SHA-256 of the whole file.
    pub checksum: String,
    /// Total number of chunks in the blob.
    pub chunk_count: u32,
    /// Index of the first chunk in `stream`.
    pub start: u32,
    stream: ChunkStream,
}

impl Download {
    /// The chunk stream, ordered by sequence index.
    pub fn into_stream(self) -> ChunkStream {
        self.stream
    }

    /// Read the remaining chunks into one buffer.
    pub async fn read_all(self) -> Result<Vec<u8>> {
        collect_bytes(self.stream).await
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("node", &self.node.id)
            .field("checksum", &self.checksum)
            .field("chunk_count", &self.chunk_count)
            .field("start", &self.start)
            .finish()
    }
}

/// Outcome of a reclamation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Blob rows removed from the catalog.
    pub blobs_removed: u64,
    /// Remote messages handed to the transport for deletion.
    pub messages_released: u64,
}

/// File storage backed by a channel transport.
#[derive(Clone)]
pub struct StorageEngine {
    db: Database,
    planner: ChunkPlanner,
    assembler: BlobAssembler,
}

impl StorageEngine {
    /// Create an engine from its parts.
    pub fn new(db: Database, planner: ChunkPlanner, assembler: BlobAssembler) -> Self {
        Self {
            db,
            planner,
            assembler,
        }
    }

    /// Create an engine from the storage configuration.
    pub fn from_config(
        config: &StorageConfig,
        db: Database,
        transport: Arc<dyn ChannelTransport>,
    ) -> Result<Self> {
        Ok(Self::new(
            db,
            ChunkPlanner::from_config(config)?,
            BlobAssembler::from_config(transport, config),
        ))
    }

    /// The catalog.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The chunk planner.
    pub fn planner(&self) -> &ChunkPlanner {
        &self.planner
    }

    /// The file tree of one owner.
    pub fn tree(&self, owner_id: i64) -> FileTree<'_> {
        FileTree::new(self.db.pool(), owner_id)
    }

    fn blobs(&self) -> BlobStore<'_> {
        BlobStore::new(self.db.pool())
    }

    /// Upload a stream of exactly `declared_size` bytes.
    ///
    /// Chunks are sent while the checksum is computed, then deduplicated:
    /// if identical content was already stored, the chunks just sent are
    /// deleted and the existing blob is shared. The stream is read once and
    /// never buffered beyond the upload window.
    pub async fn upload<R>(
        &self,
        owner_id: i64,
        request: &UploadRequest,
        reader: R,
        declared_size: u64,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let parent_path = normalize_path(&request.parent_path)?;
        validate_name(&request.name)?;
        let plan = self.planner.plan(declared_size)?;

        if let Some(existing) = self.precheck(owner_id, &parent_path, request).await? {
            return Err(DriveError::NameConflict(existing.path));
        }

        let uploaded = self.assembler.upload(reader, &plan).await?;
        self.commit_upload(owner_id, &parent_path, request, uploaded, &plan)
            .await
    }

    /// Upload an in-memory buffer.
    ///
    /// The checksum is computed first, so identical content already in the
    /// catalog is linked without touching the transport. Re-uploading the
    /// same content to the same path returns the existing node.
    pub async fn upload_bytes(
        &self,
        owner_id: i64,
        request: &UploadRequest,
        data: &[u8],
    ) -> Result<UploadOutcome> {
        let parent_path = normalize_path(&request.parent_path)?;
        validate_name(&request.name)?;
        let plan = self.planner.plan(data.len() as u64)?;
        let checksum = cas::checksum(data);

        if let Some(existing) = self.precheck(owner_id, &parent_path, request).await? {
            let same_content = match existing.blob_id {
                Some(blob_id) => self
                    .blobs()
                    .get_by_id(blob_id)
                    .await?
                    .is_some_and(|b| b.checksum == checksum),
                None => false,
            };
            if same_content {
                debug!("{} already holds {}", existing.path, checksum);
                return Ok(UploadOutcome {
                    node: existing,
                    via: UploadVia::Existing,
                });
            }
            return Err(DriveError::NameConflict(existing.path));
        }

        if let Some(blob) = self.blobs().lookup(&checksum).await? {
            if let Some(node) = self
                .link_existing(owner_id, &parent_path, request, &blob)
                .await?
            {
                info!(
                    "Uploaded {} ({} bytes, deduplicated {})",
                    node.path, node.size_bytes, checksum
                );
                return Ok(UploadOutcome {
                    node,
                    via: UploadVia::Deduplicated,
                });
            }
            debug!("Blob {} was reclaimed before it could be linked", checksum);
        }

        let uploaded = self.assembler.upload(data, &plan).await?;
        self.commit_upload(owner_id, &parent_path, request, uploaded, &plan)
            .await
    }

    /// Live node at the destination, after checking the parent exists.
    async fn precheck(
        &self,
        owner_id: i64,
        parent_path: &str,
        request: &UploadRequest,
    ) -> Result<Option<Node>> {
        let mut conn = self.db.pool().acquire().await?;
        if !request.create_parents {
            resolve_dir_in(&mut conn, owner_id, parent_path).await?;
        }
        find_in(&mut conn, owner_id, &join_path(parent_path, &request.name)).await
    }

    async fn destination_in(
        &self,
        conn: &mut sqlx::SqliteConnection,
        owner_id: i64,
        parent_path: &str,
        request: &UploadRequest,
    ) -> Result<DirRef> {
        if request.create_parents {
            mkdirp_in(conn, owner_id, parent_path).await
        } else {
            resolve_dir_in(conn, owner_id, parent_path).await
        }
    }

    fn mime_for(request: &UploadRequest) -> String {
        request
            .mime_type
            .clone()
            .unwrap_or_else(|| guess_mime(&request.name))
    }

    /// Link an already-stored blob to a new node. Returns None if the blob
    /// was reclaimed in the meantime.
    async fn link_existing(
        &self,
        owner_id: i64,
        parent_path: &str,
        request: &UploadRequest,
        blob: &BlobDescriptor,
    ) -> Result<Option<Node>> {
        let mut tx = self.db.begin_write().await?;
        if !cas::acquire_in(&mut tx, blob.id).await? {
            return Ok(None);
        }
        let parent = self
            .destination_in(&mut tx, owner_id, parent_path, request)
            .await?;
        let node = insert_file_in(
            &mut tx,
            owner_id,
            &parent,
            &request.name,
            blob,
            &Self::mime_for(request),
        )
        .await?;
        tx.commit().await?;
        Ok(Some(node))
    }

    /// Register uploaded chunks and create the node in one transaction.
    ///
    /// Whatever happens, chunks that end up unreferenced are deleted from the
    /// transport.
    async fn commit_upload(
        &self,
        owner_id: i64,
        parent_path: &str,
        request: &UploadRequest,
        uploaded: UploadedBlob,
        plan: &ChunkPlan,
    ) -> Result<UploadOutcome> {
        match self
            .register_and_link(owner_id, parent_path, request, &uploaded)
            .await
        {
            Ok((node, Registration::Created(_))) => {
                info!(
                    "Uploaded {} ({} bytes in {} chunks on {})",
                    node.path,
                    node.size_bytes,
                    uploaded.chunks.len(),
                    plan.tier().name
                );
                Ok(UploadOutcome {
                    node,
                    via: UploadVia::Transport {
                        tier: plan.tier().name.clone(),
                    },
                })
            }
            Ok((node, Registration::Existing(winner))) => {
                debug!(
                    "Blob {} already registered as {}, discarding {} sent chunks",
                    uploaded.checksum,
                    winner.id,
                    uploaded.chunks.len()
                );
                self.assembler.discard(&uploaded.remote_ids()).await;
                info!(
                    "Uploaded {} ({} bytes, deduplicated {})",
                    node.path, node.size_bytes, uploaded.checksum
                );
                Ok(UploadOutcome {
                    node,
                    via: UploadVia::Deduplicated,
                })
            }
            Err(e) => {
                warn!(
                    "Upload of {} failed after transfer ({}), discarding chunks",
                    request.name, e
                );
                self.assembler.discard(&uploaded.remote_ids()).await;
                Err(e)
            }
        }
    }

    async fn register_and_link(
        &self,
        owner_id: i64,
        parent_path: &str,
        request: &UploadRequest,
        uploaded: &UploadedBlob,
    ) -> Result<(Node, Registration)> {
        let mut tx = self.db.begin_write().await?;
        let registration =
            cas::register_in(&mut tx, &uploaded.checksum, uploaded.size, &uploaded.chunks).await?;
        let blob = registration.descriptor().clone();
        if !cas::acquire_in(&mut tx, blob.id).await? {
            return Err(DriveError::NotFound(format!("blob {}", blob.checksum)));
        }
        let parent = self
            .destination_in(&mut tx, owner_id, parent_path, request)
            .await?;
        let node = insert_file_in(
            &mut tx,
            owner_id,
            &parent,
            &request.name,
            &blob,
            &Self::mime_for(request),
        )
        .await?;
        tx.commit().await?;
        Ok((node, registration))
    }

    /// Start downloading a live file from its first chunk.
    pub async fn download(&self, owner_id: i64, node_id: &str) -> Result<Download> {
        self.download_from(owner_id, node_id, 0).await
    }

    /// Start downloading a live file from chunk `start`.
    ///
    /// Used to resume after a failure reported with a chunk index.
    pub async fn download_from(
        &self,
        owner_id: i64,
        node_id: &str,
        start: u32,
    ) -> Result<Download> {
        let node = self.tree(owner_id).get_live(node_id).await?;
        let blob_id = node
            .blob_id
            .ok_or_else(|| DriveError::Validation(format!("{} is a directory", node.path)))?;
        let blob = self
            .blobs()
            .get_by_id(blob_id)
            .await?
            .ok_or_else(|| DriveError::NotFound(format!("blob of {}", node.path)))?;

        let chunk_count = blob.chunks.len() as u32;
        if start > chunk_count {
            return Err(DriveError::Validation(format!(
                "start chunk {start} is past the last chunk of {}",
                node.path
            )));
        }

        debug!(
            "Downloading {} from chunk {}/{}",
            node.path, start, chunk_count
        );
        let stream = self.assembler.download(blob.chunks, start);
        Ok(Download {
            node,
            checksum: blob.checksum,
            chunk_count,
            start,
            stream,
        })
    }

    /// Resolve a path to a live node.
    pub async fn resolve(&self, owner_id: i64, path: &str) -> Result<Node> {
        self.tree(owner_id).resolve(path).await
    }

    /// List the live entries of a directory.
    pub async fn list(&self, owner_id: i64, path: &str) -> Result<Listing> {
        self.tree(owner_id).list(path).await
    }

    /// Create a directory; its parent must exist.
    pub async fn mkdir(&self, owner_id: i64, path: &str) -> Result<Node> {
        self.tree(owner_id).mkdir(path).await
    }

    /// Create a directory and any missing ancestors.
    pub async fn mkdirp(&self, owner_id: i64, path: &str) -> Result<Option<Node>> {
        self.tree(owner_id).mkdirp(path).await
    }

    /// Move and/or rename a live node.
    pub async fn move_node(
        &self,
        owner_id: i64,
        node_id: &str,
        new_parent: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<Node> {
        self.tree(owner_id)
            .move_node(node_id, new_parent, new_name)
            .await
    }

    /// Rename a live node in place.
    pub async fn rename(&self, owner_id: i64, node_id: &str, new_name: &str) -> Result<Node> {
        self.move_node(owner_id, node_id, None, Some(new_name)).await
    }

    /// Move a live node to the recycle bin.
    pub async fn soft_delete(&self, owner_id: i64, node_id: &str) -> Result<u64> {
        self.tree(owner_id).soft_delete(node_id).await
    }

    /// Restore a node from the recycle bin.
    pub async fn restore(&self, owner_id: i64, node_id: &str) -> Result<Node> {
        self.tree(owner_id).restore(node_id).await
    }

    /// Permanently remove a node from the recycle bin.
    pub async fn purge(&self, owner_id: i64, node_id: &str) -> Result<PurgeReport> {
        self.tree(owner_id).purge(node_id).await
    }

    /// Deletion roots in the recycle bin, newest first.
    pub async fn list_trash(&self, owner_id: i64) -> Result<Vec<Node>> {
        self.tree(owner_id).list_trash().await
    }

    /// Purge the whole recycle bin of one owner.
    pub async fn empty_trash(&self, owner_id: i64) -> Result<PurgeReport> {
        self.tree(owner_id).empty_trash().await
    }

    /// Remove up to `limit` unreferenced blobs and release their messages.
    ///
    /// Catalog rows go first; a blob re-acquired by a concurrent upload is
    /// skipped. Remote deletion is best-effort.
    pub async fn reclaim_orphans(&self, limit: i64) -> Result<ReclaimReport> {
        let store = self.blobs();
        let mut report = ReclaimReport::default();

        for blob in store.list_orphaned(limit).await? {
            if !store.forget_orphan(blob.id).await? {
                debug!("Blob {} was re-acquired, keeping it", blob.checksum);
                continue;
            }
            let ids: Vec<_> = blob.chunks.iter().map(|c| c.remote_id.clone()).collect();
            self.assembler.discard(&ids).await;
            report.blobs_removed += 1;
            report.messages_released += ids.len() as u64;
        }

        if report.blobs_removed > 0 {
            info!(
                "Reclaimed {} blobs ({} messages)",
                report.blobs_removed, report.messages_released
            );
        }
        Ok(report)
    }
}
