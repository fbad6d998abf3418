//! The logical file tree.
//!
//! Every node stores its full materialized path. Live paths are unique per
//! owner (live siblings never share a name, and a deleted directory never has
//! live descendants), so lookups go straight to the `(owner_id, path)` index.
//! Moves rewrite the whole subtree inside one transaction.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::node::{
    join_path, normalize_path, path_segments, split_path, validate_name, Listing, Node, NodeKind,
    NODE_COLUMNS, ROOT_PATH,
};
use crate::db::{begin_write, is_unique_violation};
use crate::storage::cas::{self, BlobDescriptor};
use crate::{DriveError, Result};

/// Subtree rooted at `?1`, including the root.
const SUBTREE_CTE: &str = "WITH RECURSIVE sub(id) AS (
         SELECT ?1
         UNION ALL
         SELECT n.id FROM nodes n JOIN sub ON n.parent_id = sub.id
     )";

/// A directory that new nodes can be placed in (the root included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirRef {
    pub id: Option<String>,
    pub path: String,
    pub depth: i64,
}

impl DirRef {
    fn root() -> Self {
        Self {
            id: None,
            path: ROOT_PATH.to_string(),
            depth: 0,
        }
    }

    fn from_node(node: &Node) -> Self {
        Self {
            id: Some(node.id.clone()),
            path: node.path.clone(),
            depth: node.depth,
        }
    }
}

/// Outcome of purging one or more nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Node rows removed.
    pub nodes_removed: u64,
    /// Blobs whose reference count dropped to zero.
    pub orphaned_blobs: Vec<i64>,
}

impl PurgeReport {
    fn merge(&mut self, other: PurgeReport) {
        self.nodes_removed += other.nodes_removed;
        for id in other.orphaned_blobs {
            if !self.orphaned_blobs.contains(&id) {
                self.orphaned_blobs.push(id);
            }
        }
    }
}

/// Fetch a node of `owner` by ID in any state.
pub(crate) async fn get_in(
    conn: &mut SqliteConnection,
    owner: i64,
    id: &str,
) -> Result<Option<Node>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE owner_id = ? AND id = ?");
    let node = sqlx::query_as::<_, Node>(&sql)
        .bind(owner)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(node)
}

async fn get_live_in(conn: &mut SqliteConnection, owner: i64, id: &str) -> Result<Node> {
    match get_in(conn, owner, id).await? {
        Some(node) if !node.is_deleted() => Ok(node),
        _ => Err(DriveError::NotFound(format!("node {id}"))),
    }
}

/// Find the live node at a normalized path.
pub(crate) async fn find_in(
    conn: &mut SqliteConnection,
    owner: i64,
    path: &str,
) -> Result<Option<Node>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE owner_id = ? AND path = ? AND deleted_at IS NULL"
    );
    let node = sqlx::query_as::<_, Node>(&sql)
        .bind(owner)
        .bind(path)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(node)
}

async fn find_child_in(
    conn: &mut SqliteConnection,
    owner: i64,
    parent_id: Option<&str>,
    name: &str,
) -> Result<Option<Node>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes
         WHERE owner_id = ? AND parent_id IS ? AND name = ? AND deleted_at IS NULL"
    );
    let node = sqlx::query_as::<_, Node>(&sql)
        .bind(owner)
        .bind(parent_id)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(node)
}

/// Resolve a normalized path to a live directory, or fail with `ParentNotFound`.
pub(crate) async fn resolve_dir_in(
    conn: &mut SqliteConnection,
    owner: i64,
    path: &str,
) -> Result<DirRef> {
    if path == ROOT_PATH {
        return Ok(DirRef::root());
    }
    match find_in(conn, owner, path).await? {
        Some(node) if node.is_dir() => Ok(DirRef::from_node(&node)),
        _ => Err(DriveError::ParentNotFound(path.to_string())),
    }
}

/// Create every missing directory along a normalized path.
///
/// Concurrent callers creating the same directory converge on one row. A
/// file occupying one of the segments is a `NameConflict`.
pub(crate) async fn mkdirp_in(
    conn: &mut SqliteConnection,
    owner: i64,
    path: &str,
) -> Result<DirRef> {
    let mut dir = DirRef::root();
    for segment in path_segments(path) {
        let child_path = join_path(&dir.path, segment);
        sqlx::query(
            "INSERT INTO nodes (id, owner_id, parent_id, name, kind, path, depth)
             VALUES (?, ?, ?, ?, 'directory', ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner)
        .bind(dir.id.as_deref())
        .bind(segment)
        .bind(&child_path)
        .bind(dir.depth + 1)
        .execute(&mut *conn)
        .await?;

        match find_child_in(conn, owner, dir.id.as_deref(), segment).await? {
            Some(node) if node.is_dir() => dir = DirRef::from_node(&node),
            _ => return Err(DriveError::NameConflict(child_path)),
        }
    }
    Ok(dir)
}

async fn insert_node_in(
    conn: &mut SqliteConnection,
    owner: i64,
    parent: &DirRef,
    name: &str,
    kind: NodeKind,
    blob: Option<&BlobDescriptor>,
    mime_type: Option<&str>,
) -> Result<Node> {
    let id = Uuid::new_v4().to_string();
    let path = join_path(&parent.path, name);

    sqlx::query(
        "INSERT INTO nodes (id, owner_id, parent_id, name, kind, path, depth, size_bytes, mime_type, blob_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(owner)
    .bind(parent.id.as_deref())
    .bind(name)
    .bind(kind.as_str())
    .bind(&path)
    .bind(parent.depth + 1)
    .bind(blob.map(|b| b.size as i64).unwrap_or(0))
    .bind(mime_type)
    .bind(blob.map(|b| b.id))
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            DriveError::NameConflict(path.clone())
        } else {
            DriveError::Database(e.to_string())
        }
    })?;

    get_in(conn, owner, &id)
        .await?
        .ok_or_else(|| DriveError::NotFound(format!("node {id}")))
}

/// Insert a file node referencing `blob`. The caller has already taken the
/// blob reference in the same transaction.
pub(crate) async fn insert_file_in(
    conn: &mut SqliteConnection,
    owner: i64,
    parent: &DirRef,
    name: &str,
    blob: &BlobDescriptor,
    mime_type: &str,
) -> Result<Node> {
    insert_node_in(conn, owner, parent, name, NodeKind::File, Some(blob), Some(mime_type)).await
}

async fn purge_in(conn: &mut SqliteConnection, owner: i64, node: &Node) -> Result<PurgeReport> {
    let blob_refs: Vec<(i64, i64)> = sqlx::query_as(&format!(
        "{SUBTREE_CTE}
         SELECT blob_id, COUNT(*) FROM nodes
         WHERE id IN (SELECT id FROM sub) AND blob_id IS NOT NULL
         GROUP BY blob_id"
    ))
    .bind(&node.id)
    .fetch_all(&mut *conn)
    .await?;

    let deleted = sqlx::query(&format!(
        "{SUBTREE_CTE}
         DELETE FROM nodes WHERE owner_id = ?2 AND id IN (SELECT id FROM sub)"
    ))
    .bind(&node.id)
    .bind(owner)
    .execute(&mut *conn)
    .await?;

    let mut orphaned_blobs = Vec::new();
    for (blob_id, count) in blob_refs {
        cas::release_in(conn, blob_id, count).await?;
        let remaining: i64 = sqlx::query_scalar("SELECT ref_count FROM blobs WHERE id = ?")
            .bind(blob_id)
            .fetch_one(&mut *conn)
            .await?;
        if remaining == 0 {
            orphaned_blobs.push(blob_id);
        }
    }

    Ok(PurgeReport {
        nodes_removed: deleted.rows_affected(),
        orphaned_blobs,
    })
}

/// One owner's view of the file tree.
pub struct FileTree<'a> {
    pool: &'a SqlitePool,
    owner_id: i64,
}

impl<'a> FileTree<'a> {
    /// Create a tree scoped to `owner_id`.
    pub fn new(pool: &'a SqlitePool, owner_id: i64) -> Self {
        Self { pool, owner_id }
    }

    /// Owner this tree is scoped to.
    pub fn owner_id(&self) -> i64 {
        self.owner_id
    }

    /// Get a node by ID, live or deleted.
    pub async fn get(&self, id: &str) -> Result<Option<Node>> {
        let mut conn = self.pool.acquire().await?;
        get_in(&mut conn, self.owner_id, id).await
    }

    /// Get a live node by ID.
    pub async fn get_live(&self, id: &str) -> Result<Node> {
        let mut conn = self.pool.acquire().await?;
        get_live_in(&mut conn, self.owner_id, id).await
    }

    /// Find the live node at `path`. The root has no node.
    pub async fn find(&self, path: &str) -> Result<Option<Node>> {
        let path = normalize_path(path)?;
        let mut conn = self.pool.acquire().await?;
        find_in(&mut conn, self.owner_id, &path).await
    }

    /// Resolve `path` to a live node, failing with `NotFound`.
    pub async fn resolve(&self, path: &str) -> Result<Node> {
        let normalized = normalize_path(path)?;
        self.find(&normalized)
            .await?
            .ok_or(DriveError::NotFound(normalized))
    }

    /// Create a file node under `parent_path` referencing `blob`.
    ///
    /// Takes one reference on the blob in the same transaction.
    pub async fn create_file(
        &self,
        parent_path: &str,
        name: &str,
        blob: &BlobDescriptor,
        mime_type: &str,
    ) -> Result<Node> {
        let parent_path = normalize_path(parent_path)?;
        validate_name(name)?;

        let mut tx = begin_write(self.pool).await?;
        let parent = resolve_dir_in(&mut tx, self.owner_id, &parent_path).await?;
        if !cas::acquire_in(&mut tx, blob.id).await? {
            return Err(DriveError::NotFound(format!("blob {}", blob.checksum)));
        }
        let node = insert_file_in(&mut tx, self.owner_id, &parent, name, blob, mime_type).await?;
        tx.commit().await?;

        debug!("Created file {} ({} bytes)", node.path, node.size_bytes);
        Ok(node)
    }

    /// Create a single directory; its parent must exist.
    pub async fn mkdir(&self, path: &str) -> Result<Node> {
        let path = normalize_path(path)?;
        let (parent_path, name) =
            split_path(&path).ok_or_else(|| DriveError::NameConflict(ROOT_PATH.to_string()))?;

        let mut tx = begin_write(self.pool).await?;
        let parent = resolve_dir_in(&mut tx, self.owner_id, parent_path).await?;
        let node = insert_node_in(
            &mut tx,
            self.owner_id,
            &parent,
            name,
            NodeKind::Directory,
            None,
            None,
        )
        .await?;
        tx.commit().await?;

        debug!("Created directory {}", node.path);
        Ok(node)
    }

    /// Create `path` and any missing ancestors; existing directories are reused.
    ///
    /// Returns None for the root.
    pub async fn mkdirp(&self, path: &str) -> Result<Option<Node>> {
        let path = normalize_path(path)?;
        let mut tx = begin_write(self.pool).await?;
        let dir = mkdirp_in(&mut tx, self.owner_id, &path).await?;
        let node = match dir.id {
            Some(id) => get_in(&mut tx, self.owner_id, &id).await?,
            None => None,
        };
        tx.commit().await?;
        Ok(node)
    }

    /// Move and/or rename a live node.
    ///
    /// `new_parent` is a directory path (None keeps the current parent) and
    /// `new_name` replaces the name (None keeps it). Descendant paths are
    /// rewritten in the same transaction, so readers see either the old
    /// subtree or the new one.
    pub async fn move_node(
        &self,
        id: &str,
        new_parent: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<Node> {
        if let Some(name) = new_name {
            validate_name(name)?;
        }
        let new_parent = new_parent.map(normalize_path).transpose()?;

        let mut tx = begin_write(self.pool).await?;
        let node = get_live_in(&mut tx, self.owner_id, id).await?;

        let dest = match &new_parent {
            Some(path) => resolve_dir_in(&mut tx, self.owner_id, path).await?,
            None => {
                let parent_path = split_path(&node.path).map(|(p, _)| p).unwrap_or(ROOT_PATH);
                DirRef {
                    id: node.parent_id.clone(),
                    path: parent_path.to_string(),
                    depth: node.depth - 1,
                }
            }
        };

        if node.is_dir()
            && (dest.path == node.path || dest.path.starts_with(&format!("{}/", node.path)))
        {
            return Err(DriveError::CycleDetected {
                node: node.path.clone(),
                destination: dest.path,
            });
        }

        let name = new_name.unwrap_or(node.name.as_str());
        let new_path = join_path(&dest.path, name);
        if new_path == node.path {
            return Ok(node);
        }

        sqlx::query(
            "UPDATE nodes SET parent_id = ?, name = ?, updated_at = datetime('now')
             WHERE owner_id = ? AND id = ?",
        )
        .bind(dest.id.as_deref())
        .bind(name)
        .bind(self.owner_id)
        .bind(&node.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DriveError::NameConflict(new_path.clone())
            } else {
                DriveError::Database(e.to_string())
            }
        })?;

        // substr() counts characters, so the old prefix length must too
        let old_len = node.path.chars().count() as i64;
        let depth_delta = dest.depth + 1 - node.depth;
        let rewritten = sqlx::query(&format!(
            "{SUBTREE_CTE}
             UPDATE nodes SET path = ?2 || substr(path, ?3), depth = depth + ?4
             WHERE id IN (SELECT id FROM sub)"
        ))
        .bind(&node.id)
        .bind(&new_path)
        .bind(old_len + 1)
        .bind(depth_delta)
        .execute(&mut *tx)
        .await?;

        let moved = get_live_in(&mut tx, self.owner_id, &node.id).await?;
        tx.commit().await?;

        info!(
            "Moved {} to {} ({} nodes rewritten)",
            node.path,
            moved.path,
            rewritten.rows_affected()
        );
        Ok(moved)
    }

    /// Move a live node (and, for directories, its live descendants) to the
    /// recycle bin. Reference counts are unchanged.
    ///
    /// Returns the number of nodes hidden.
    pub async fn soft_delete(&self, id: &str) -> Result<u64> {
        let mut tx = begin_write(self.pool).await?;
        let node = get_live_in(&mut tx, self.owner_id, id).await?;

        let result = sqlx::query(
            "WITH RECURSIVE sub(id) AS (
                 SELECT ?1
                 UNION ALL
                 SELECT n.id FROM nodes n JOIN sub ON n.parent_id = sub.id
                 WHERE n.deleted_at IS NULL
             )
             UPDATE nodes SET deleted_at = datetime('now'), delete_batch = ?1
             WHERE id IN (SELECT id FROM sub)",
        )
        .bind(&node.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("Deleted {} ({} nodes)", node.path, result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Bring a soft-deleted node back, together with everything its deletion hid.
    ///
    /// Fails with `RestoreConflict` if the original parent is no longer a live
    /// directory or a live sibling now holds the name.
    pub async fn restore(&self, id: &str) -> Result<Node> {
        let mut tx = begin_write(self.pool).await?;
        let node = get_in(&mut tx, self.owner_id, id)
            .await?
            .ok_or_else(|| DriveError::NotFound(format!("node {id}")))?;
        if !node.is_deleted() {
            return Err(DriveError::NotDeleted(node.path));
        }

        if let Some(parent_id) = &node.parent_id {
            match get_in(&mut tx, self.owner_id, parent_id).await? {
                Some(parent) if !parent.is_deleted() => {}
                _ => return Err(DriveError::RestoreConflict(node.path)),
            }
        }

        let batch = node.delete_batch.clone().unwrap_or_else(|| node.id.clone());
        let restored = sqlx::query(
            "UPDATE nodes SET deleted_at = NULL, delete_batch = NULL, updated_at = datetime('now')
             WHERE owner_id = ? AND delete_batch = ?",
        )
        .bind(self.owner_id)
        .bind(&batch)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DriveError::RestoreConflict(node.path.clone())
            } else {
                DriveError::Database(e.to_string())
            }
        })?;

        let node = get_live_in(&mut tx, self.owner_id, &node.id).await?;
        tx.commit().await?;

        info!("Restored {} ({} nodes)", node.path, restored.rows_affected());
        Ok(node)
    }

    /// Permanently remove a soft-deleted node and its subtree, releasing
    /// one blob reference per removed file.
    pub async fn purge(&self, id: &str) -> Result<PurgeReport> {
        let mut tx = begin_write(self.pool).await?;
        let node = get_in(&mut tx, self.owner_id, id)
            .await?
            .ok_or_else(|| DriveError::NotFound(format!("node {id}")))?;
        if !node.is_deleted() {
            return Err(DriveError::NotDeleted(node.path));
        }

        let report = purge_in(&mut tx, self.owner_id, &node).await?;
        tx.commit().await?;

        info!(
            "Purged {} ({} nodes, {} blobs orphaned)",
            node.path,
            report.nodes_removed,
            report.orphaned_blobs.len()
        );
        Ok(report)
    }

    /// List the live entries of a directory.
    pub async fn list(&self, path: &str) -> Result<Listing> {
        let path = normalize_path(path)?;
        let mut conn = self.pool.acquire().await?;

        let dir = if path == ROOT_PATH {
            DirRef::root()
        } else {
            match find_in(&mut conn, self.owner_id, &path).await? {
                Some(node) if node.is_dir() => DirRef::from_node(&node),
                Some(_) => {
                    return Err(DriveError::Validation(format!("{path} is not a directory")))
                }
                None => return Err(DriveError::NotFound(path)),
            }
        };

        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE owner_id = ? AND parent_id IS ? AND deleted_at IS NULL
             ORDER BY name"
        );
        let children = sqlx::query_as::<_, Node>(&sql)
            .bind(self.owner_id)
            .bind(dir.id.as_deref())
            .fetch_all(&mut *conn)
            .await?;

        Ok(Listing::new(path, children))
    }

    /// Nodes the caller deleted (not those hidden along with them), newest first.
    pub async fn list_trash(&self) -> Result<Vec<Node>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE owner_id = ? AND deleted_at IS NOT NULL AND delete_batch = id
             ORDER BY deleted_at DESC, rowid DESC"
        );
        let nodes = sqlx::query_as::<_, Node>(&sql)
            .bind(self.owner_id)
            .fetch_all(self.pool)
            .await?;
        Ok(nodes)
    }

    /// Purge everything in the recycle bin.
    pub async fn empty_trash(&self) -> Result<PurgeReport> {
        let roots = self.list_trash().await?;
        let mut report = PurgeReport::default();

        let mut tx = begin_write(self.pool).await?;
        for root in roots {
            // Already removed along with an enclosing deleted directory
            let Some(node) = get_in(&mut tx, self.owner_id, &root.id).await? else {
                continue;
            };
            report.merge(purge_in(&mut tx, self.owner_id, &node).await?);
        }
        tx.commit().await?;

        info!(
            "Emptied trash for owner {} ({} nodes)",
            self.owner_id, report.nodes_removed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cas::{BlobStore, ChunkReference};
    use crate::transport::RemoteMessageId;
    use crate::Database;

    async fn setup_db() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    async fn blob(db: &Database, checksum: &str, size: u64) -> BlobDescriptor {
        let chunks = vec![ChunkReference {
            seq: 0,
            remote_id: RemoteMessageId::new(format!("msg-{checksum}")),
            length: size,
            tier: "bot".to_string(),
        }];
        BlobStore::new(db.pool())
            .register(checksum, size, &chunks)
            .await
            .unwrap()
            .into_descriptor()
    }

    async fn ref_count(db: &Database, blob_id: i64) -> i64 {
        BlobStore::new(db.pool())
            .get_by_id(blob_id)
            .await
            .unwrap()
            .unwrap()
            .ref_count
    }

    #[tokio::test]
    async fn test_mkdir_and_resolve() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);

        let docs = tree.mkdir("/docs").await.unwrap();
        assert_eq!(docs.path, "/docs");
        assert_eq!(docs.depth, 1);
        assert!(docs.parent_id.is_none());

        let y2024 = tree.mkdir("docs/2024/").await.unwrap();
        assert_eq!(y2024.path, "/docs/2024");
        assert_eq!(y2024.depth, 2);
        assert_eq!(y2024.parent_id.as_deref(), Some(docs.id.as_str()));

        assert_eq!(tree.resolve("/docs/2024").await.unwrap().id, y2024.id);
        assert!(matches!(
            tree.resolve("/docs/missing").await,
            Err(DriveError::NotFound(_))
        ));
        assert!(tree.find("/").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mkdir_requires_parent_and_unique_name() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);

        assert!(matches!(
            tree.mkdir("/a/b").await,
            Err(DriveError::ParentNotFound(p)) if p == "/a"
        ));
        tree.mkdir("/a").await.unwrap();
        assert!(matches!(
            tree.mkdir("/a").await,
            Err(DriveError::NameConflict(p)) if p == "/a"
        ));
    }

    #[tokio::test]
    async fn test_owners_are_isolated() {
        let db = setup_db().await;
        FileTree::new(db.pool(), 1).mkdir("/shared").await.unwrap();

        let other = FileTree::new(db.pool(), 2);
        assert!(other.find("/shared").await.unwrap().is_none());
        other.mkdir("/shared").await.unwrap();
    }

    #[tokio::test]
    async fn test_mkdirp_is_idempotent() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);

        let first = tree.mkdirp("/a/b/c").await.unwrap().unwrap();
        let second = tree.mkdirp("/a/b/c").await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.depth, 3);
        assert!(tree.mkdirp("/").await.unwrap().is_none());

        let b = tree.resolve("/a/b").await.unwrap();
        assert_eq!(first.parent_id.as_deref(), Some(b.id.as_str()));
    }

    #[tokio::test]
    async fn test_mkdirp_through_file_conflicts() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        let b = blob(&db, "f1", 3).await;
        tree.create_file("/", "x", &b, "text/plain").await.unwrap();

        assert!(matches!(
            tree.mkdirp("/x/y").await,
            Err(DriveError::NameConflict(p)) if p == "/x"
        ));
    }

    #[tokio::test]
    async fn test_create_file_takes_reference() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        let b = blob(&db, "f1", 42).await;
        tree.mkdir("/docs").await.unwrap();

        let node = tree
            .create_file("/docs", "a.txt", &b, "text/plain")
            .await
            .unwrap();
        assert!(node.is_file());
        assert_eq!(node.path, "/docs/a.txt");
        assert_eq!(node.size(), 42);
        assert_eq!(node.blob_id, Some(b.id));
        assert_eq!(node.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(ref_count(&db, b.id).await, 1);
    }

    #[tokio::test]
    async fn test_create_file_conflict_leaves_count() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        let b = blob(&db, "f1", 1).await;

        tree.create_file("/", "a.txt", &b, "text/plain").await.unwrap();
        let err = tree
            .create_file("/", "a.txt", &b, "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::NameConflict(p) if p == "/a.txt"));
        assert_eq!(ref_count(&db, b.id).await, 1);

        let err = tree
            .create_file("/nowhere", "a.txt", &b, "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::ParentNotFound(_)));
    }

    #[tokio::test]
    async fn test_rename_directory_rewrites_descendants() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        let b = blob(&db, "f1", 5).await;

        let a = tree.mkdirp("/a/x/deep").await.unwrap();
        assert!(a.is_some());
        tree.create_file("/a/x", "f.txt", &b, "text/plain").await.unwrap();
        let a = tree.resolve("/a").await.unwrap();

        let moved = tree.move_node(&a.id, None, Some("b")).await.unwrap();
        assert_eq!(moved.path, "/b");
        assert_eq!(moved.name, "b");

        assert!(tree.find("/a/x").await.unwrap().is_none());
        assert_eq!(tree.resolve("/b/x").await.unwrap().depth, 2);
        assert_eq!(tree.resolve("/b/x/deep").await.unwrap().depth, 3);
        assert!(tree.resolve("/b/x/f.txt").await.unwrap().is_file());
    }

    #[tokio::test]
    async fn test_move_into_other_directory_updates_depth() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);

        tree.mkdirp("/src/lib").await.unwrap();
        tree.mkdirp("/dst/inner").await.unwrap();
        let src = tree.resolve("/src").await.unwrap();

        let moved = tree.move_node(&src.id, Some("/dst/inner"), None).await.unwrap();
        assert_eq!(moved.path, "/dst/inner/src");
        assert_eq!(moved.depth, 3);
        assert_eq!(tree.resolve("/dst/inner/src/lib").await.unwrap().depth, 4);

        let back = tree.move_node(&src.id, Some("/"), None).await.unwrap();
        assert_eq!(back.path, "/src");
        assert_eq!(tree.resolve("/src/lib").await.unwrap().depth, 2);
    }

    #[tokio::test]
    async fn test_move_into_own_subtree_is_cycle() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        tree.mkdirp("/a/b").await.unwrap();
        let a = tree.resolve("/a").await.unwrap();

        let err = tree.move_node(&a.id, Some("/a/b"), None).await.unwrap_err();
        assert!(matches!(err, DriveError::CycleDetected { .. }));
        let err = tree.move_node(&a.id, Some("/a"), None).await.unwrap_err();
        assert!(matches!(err, DriveError::CycleDetected { .. }));

        // A sibling sharing the prefix is not inside the subtree
        tree.mkdir("/ab").await.unwrap();
        let moved = tree.move_node(&a.id, Some("/ab"), None).await.unwrap();
        assert_eq!(moved.path, "/ab/a");
    }

    #[tokio::test]
    async fn test_move_name_conflict_leaves_tree_unchanged() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        tree.mkdirp("/a/child").await.unwrap();
        tree.mkdir("/b").await.unwrap();
        let a = tree.resolve("/a").await.unwrap();

        let err = tree.move_node(&a.id, None, Some("b")).await.unwrap_err();
        assert!(matches!(err, DriveError::NameConflict(p) if p == "/b"));
        assert_eq!(tree.resolve("/a/child").await.unwrap().path, "/a/child");
    }

    #[tokio::test]
    async fn test_soft_delete_hides_subtree() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        let b = blob(&db, "f1", 7).await;
        tree.mkdirp("/a/b").await.unwrap();
        tree.create_file("/a/b", "f.txt", &b, "text/plain").await.unwrap();
        let a = tree.resolve("/a").await.unwrap();

        assert_eq!(tree.soft_delete(&a.id).await.unwrap(), 3);
        assert!(tree.list("/").await.unwrap().is_empty());
        assert!(tree.find("/a/b/f.txt").await.unwrap().is_none());
        assert_eq!(ref_count(&db, b.id).await, 1);

        let trash = tree.list_trash().await.unwrap();
        assert_eq!(trash.len(), 1);
        assert_eq!(trash[0].id, a.id);
    }

    #[tokio::test]
    async fn test_restore_brings_back_batch_only() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        tree.mkdirp("/a/keep").await.unwrap();
        tree.mkdir("/a/gone").await.unwrap();
        let gone = tree.resolve("/a/gone").await.unwrap();
        let a = tree.resolve("/a").await.unwrap();

        tree.soft_delete(&gone.id).await.unwrap();
        tree.soft_delete(&a.id).await.unwrap();

        let restored = tree.restore(&a.id).await.unwrap();
        assert_eq!(restored.path, "/a");
        assert!(tree.find("/a/keep").await.unwrap().is_some());
        assert!(tree.find("/a/gone").await.unwrap().is_none());

        tree.restore(&gone.id).await.unwrap();
        assert!(tree.find("/a/gone").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_restore_conflicts() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        let a = tree.mkdir("/a").await.unwrap();
        let child = tree.mkdir("/a/child").await.unwrap();

        tree.soft_delete(&a.id).await.unwrap();
        // Hidden with its parent, which is still deleted
        assert!(matches!(
            tree.restore(&child.id).await,
            Err(DriveError::RestoreConflict(_))
        ));

        tree.mkdir("/a").await.unwrap();
        assert!(matches!(
            tree.restore(&a.id).await,
            Err(DriveError::RestoreConflict(p)) if p == "/a"
        ));

        let live = tree.resolve("/a").await.unwrap();
        assert!(matches!(
            tree.restore(&live.id).await,
            Err(DriveError::NotDeleted(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_releases_references() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        let shared = blob(&db, "f1", 3).await;
        let solo = blob(&db, "f2", 4).await;

        tree.mkdir("/d").await.unwrap();
        tree.create_file("/d", "one", &shared, "text/plain").await.unwrap();
        tree.create_file("/d", "two", &shared, "text/plain").await.unwrap();
        tree.create_file("/d", "three", &solo, "text/plain").await.unwrap();
        tree.create_file("/", "outside", &shared, "text/plain").await.unwrap();
        assert_eq!(ref_count(&db, shared.id).await, 3);

        let d = tree.resolve("/d").await.unwrap();
        assert!(matches!(tree.purge(&d.id).await, Err(DriveError::NotDeleted(_))));

        tree.soft_delete(&d.id).await.unwrap();
        let report = tree.purge(&d.id).await.unwrap();
        assert_eq!(report.nodes_removed, 4);
        assert_eq!(report.orphaned_blobs, vec![solo.id]);

        assert_eq!(ref_count(&db, shared.id).await, 1);
        assert_eq!(ref_count(&db, solo.id).await, 0);
        assert!(tree.get(&d.id).await.unwrap().is_none());
        assert!(tree.resolve("/outside").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_orders_directories_first() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        let b = blob(&db, "f1", 10).await;

        tree.create_file("/", "b.txt", &b, "text/plain").await.unwrap();
        tree.create_file("/", "a.txt", &b, "text/plain").await.unwrap();
        tree.mkdir("/zeta").await.unwrap();
        tree.mkdir("/alpha").await.unwrap();

        let listing = tree.list("/").await.unwrap();
        let names: Vec<&str> = listing.entries().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta", "a.txt", "b.txt"]);
        assert_eq!(listing.total_files, 2);
        assert_eq!(listing.total_size, 20);

        assert!(matches!(tree.list("/nope").await, Err(DriveError::NotFound(_))));
        assert!(matches!(
            tree.list("/a.txt").await,
            Err(DriveError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_trash() {
        let db = setup_db().await;
        let tree = FileTree::new(db.pool(), 1);
        let b = blob(&db, "f1", 2).await;

        let dir = tree.mkdir("/dir").await.unwrap();
        let inner = tree.create_file("/dir", "inner", &b, "text/plain").await.unwrap();
        let top = tree.create_file("/", "top", &b, "text/plain").await.unwrap();

        tree.soft_delete(&inner.id).await.unwrap();
        tree.soft_delete(&dir.id).await.unwrap();
        tree.soft_delete(&top.id).await.unwrap();
        assert_eq!(tree.list_trash().await.unwrap().len(), 3);

        let report = tree.empty_trash().await.unwrap();
        assert_eq!(report.nodes_removed, 3);
        assert_eq!(report.orphaned_blobs, vec![b.id]);
        assert!(tree.list_trash().await.unwrap().is_empty());
        assert_eq!(ref_count(&db, b.id).await, 0);
    }
}
