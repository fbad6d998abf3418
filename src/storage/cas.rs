//! Content-addressed blob catalog.
//!
//! A blob is identified by the SHA-256 of its bytes. Registration is an atomic
//! insert-or-fetch on the `checksum` UNIQUE column, so concurrent uploads of
//! the same content (even from separate processes) converge on one row.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::begin_write;
use crate::transport::RemoteMessageId;
use crate::{DriveError, Result};

/// Incremental SHA-256 over an upload stream.
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    hasher: Sha256,
    bytes: u64,
}

impl ContentHasher {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next slice of the stream.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the lowercase hex digest.
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Checksum of an in-memory buffer.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// One transport message holding a slice of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkReference {
    /// 0-based reassembly position.
    pub seq: u32,
    /// Transport message identifier.
    #[serde(serialize_with = "serialize_remote_id")]
    pub remote_id: RemoteMessageId,
    /// Payload length in bytes.
    pub length: u64,
    /// Tier the message was sent on.
    pub tier: String,
}

fn serialize_remote_id<S: serde::Serializer>(
    id: &RemoteMessageId,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(id.as_str())
}

/// Content-addressed record of a stored file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobDescriptor {
    /// Catalog row ID.
    pub id: i64,
    /// SHA-256 of the full content, lowercase hex.
    pub checksum: String,
    /// Total size in bytes.
    pub size: u64,
    /// Number of non-purged nodes referencing this blob.
    pub ref_count: i64,
    /// Chunks in sequence order.
    pub chunks: Vec<ChunkReference>,
}

/// Outcome of [`BlobStore::register`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// This call inserted the blob; its chunks are now catalogued.
    Created(BlobDescriptor),
    /// The checksum was already registered; the caller's chunks were not used.
    Existing(BlobDescriptor),
}

impl Registration {
    /// The registered descriptor, whichever side won.
    pub fn descriptor(&self) -> &BlobDescriptor {
        match self {
            Registration::Created(d) | Registration::Existing(d) => d,
        }
    }

    /// Consume into the descriptor.
    pub fn into_descriptor(self) -> BlobDescriptor {
        match self {
            Registration::Created(d) | Registration::Existing(d) => d,
        }
    }

    /// Whether this call created the blob.
    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

#[derive(sqlx::FromRow)]
struct BlobRow {
    id: i64,
    checksum: String,
    size_bytes: i64,
    ref_count: i64,
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    seq: i64,
    remote_id: String,
    length: i64,
    tier: String,
}

impl From<ChunkRow> for ChunkReference {
    fn from(row: ChunkRow) -> Self {
        Self {
            seq: row.seq as u32,
            remote_id: RemoteMessageId::new(row.remote_id),
            length: row.length as u64,
            tier: row.tier,
        }
    }
}

/// Check that `chunks` is a contiguous 0-based sequence covering `size` bytes.
pub(crate) fn validate_chunks(size: u64, chunks: &[ChunkReference]) -> Result<()> {
    if chunks.is_empty() {
        return Err(DriveError::Validation("blob has no chunks".to_string()));
    }
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.seq as usize != i {
            return Err(DriveError::Validation(format!(
                "chunk sequence broken at position {i} (found {})",
                chunk.seq
            )));
        }
    }
    let total: u64 = chunks.iter().map(|c| c.length).sum();
    if total != size {
        return Err(DriveError::Validation(format!(
            "chunk lengths sum to {total}, blob size is {size}"
        )));
    }
    Ok(())
}

async fn load_chunks(conn: &mut SqliteConnection, blob_id: i64) -> Result<Vec<ChunkReference>> {
    let rows = sqlx::query_as::<_, ChunkRow>(
        "SELECT seq, remote_id, length, tier FROM chunks WHERE blob_id = ? ORDER BY seq",
    )
    .bind(blob_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(ChunkReference::from).collect())
}

async fn hydrate(conn: &mut SqliteConnection, row: BlobRow) -> Result<BlobDescriptor> {
    let chunks = load_chunks(conn, row.id).await?;
    Ok(BlobDescriptor {
        id: row.id,
        checksum: row.checksum,
        size: row.size_bytes as u64,
        ref_count: row.ref_count,
        chunks,
    })
}

/// Fetch a blob by checksum on an open connection or transaction.
pub(crate) async fn lookup_in(
    conn: &mut SqliteConnection,
    checksum: &str,
) -> Result<Option<BlobDescriptor>> {
    let row = sqlx::query_as::<_, BlobRow>(
        "SELECT id, checksum, size_bytes, ref_count FROM blobs WHERE checksum = ?",
    )
    .bind(checksum)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(Some(hydrate(conn, row).await?)),
        None => Ok(None),
    }
}

/// Fetch a blob by row ID on an open connection or transaction.
pub(crate) async fn get_in(conn: &mut SqliteConnection, id: i64) -> Result<Option<BlobDescriptor>> {
    let row = sqlx::query_as::<_, BlobRow>(
        "SELECT id, checksum, size_bytes, ref_count FROM blobs WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(Some(hydrate(conn, row).await?)),
        None => Ok(None),
    }
}

/// Insert the blob if its checksum is absent, else return the existing one.
///
/// Reference counts are not touched; callers pair this with [`acquire_in`]
/// inside the same transaction as the node insert.
pub(crate) async fn register_in(
    conn: &mut SqliteConnection,
    checksum: &str,
    size: u64,
    chunks: &[ChunkReference],
) -> Result<Registration> {
    validate_chunks(size, chunks)?;

    let inserted = sqlx::query(
        "INSERT INTO blobs (checksum, size_bytes, chunk_count) VALUES (?, ?, ?)
         ON CONFLICT(checksum) DO NOTHING",
    )
    .bind(checksum)
    .bind(size as i64)
    .bind(chunks.len() as i64)
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 0 {
        let existing = lookup_in(conn, checksum)
            .await?
            .ok_or_else(|| DriveError::NotFound(format!("blob {checksum}")))?;
        return Ok(Registration::Existing(existing));
    }

    let blob_id = inserted.last_insert_rowid();
    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (blob_id, seq, remote_id, length, tier) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(blob_id)
        .bind(i64::from(chunk.seq))
        .bind(chunk.remote_id.as_str())
        .bind(chunk.length as i64)
        .bind(&chunk.tier)
        .execute(&mut *conn)
        .await?;
    }

    let created = get_in(conn, blob_id)
        .await?
        .ok_or_else(|| DriveError::NotFound(format!("blob {checksum}")))?;
    Ok(Registration::Created(created))
}

/// Add one reference. Returns false if the blob row no longer exists.
pub(crate) async fn acquire_in(conn: &mut SqliteConnection, blob_id: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE blobs SET ref_count = ref_count + 1 WHERE id = ?")
        .bind(blob_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Drop `count` references; the count never goes below zero.
pub(crate) async fn release_in(
    conn: &mut SqliteConnection,
    blob_id: i64,
    count: i64,
) -> Result<()> {
    sqlx::query("UPDATE blobs SET ref_count = MAX(ref_count - ?, 0) WHERE id = ?")
        .bind(count)
        .bind(blob_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Repository for content-addressed blobs.
pub struct BlobStore<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BlobStore<'a> {
    /// Create a new BlobStore with the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Find the blob registered under `checksum`.
    pub async fn lookup(&self, checksum: &str) -> Result<Option<BlobDescriptor>> {
        let mut conn = self.pool.acquire().await?;
        lookup_in(&mut conn, checksum).await
    }

    /// Get a blob by catalog ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<BlobDescriptor>> {
        let mut conn = self.pool.acquire().await?;
        get_in(&mut conn, id).await
    }

    /// Atomically register a blob unless its checksum is already known.
    ///
    /// The blob starts with no references and counts as an orphan until a
    /// node takes one, so reclamation may remove it at any time. Uploads
    /// call [`register_in`] and [`acquire_in`] in the node's transaction.
    pub(crate) async fn register(
        &self,
        checksum: &str,
        size: u64,
        chunks: &[ChunkReference],
    ) -> Result<Registration> {
        let mut tx = begin_write(self.pool).await?;
        let registration = register_in(&mut tx, checksum, size, chunks).await?;
        tx.commit().await?;
        Ok(registration)
    }

    /// Blobs with no remaining references, oldest first.
    pub async fn list_orphaned(&self, limit: i64) -> Result<Vec<BlobDescriptor>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, BlobRow>(
            "SELECT id, checksum, size_bytes, ref_count FROM blobs
             WHERE ref_count = 0 ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        let mut blobs = Vec::with_capacity(rows.len());
        for row in rows {
            blobs.push(hydrate(&mut conn, row).await?);
        }
        Ok(blobs)
    }

    /// Delete a blob row (and its chunk rows) if it is still unreferenced.
    ///
    /// Returns false when a concurrent upload re-acquired the blob first.
    pub async fn forget_orphan(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM blobs WHERE id = ? AND ref_count = 0
             AND NOT EXISTS (SELECT 1 FROM nodes WHERE blob_id = blobs.id)",
        )
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count registered blobs.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blobs")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }
}
