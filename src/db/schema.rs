//! Catalog schema and migrations for chandrive.
//!
//! Migrations are applied sequentially when the catalog is first opened or
//! upgraded; `schema_version` records which ones have run.

/// Catalog migrations.
///
/// Each migration is a SQL script executed in order inside its own
/// transaction.
pub const MIGRATIONS: &[&str] = &[
    // v1: Content-addressed blobs and their chunk lists
    r#"
CREATE TABLE blobs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum     TEXT NOT NULL UNIQUE,       -- SHA-256, lowercase hex
    size_bytes   INTEGER NOT NULL,
    chunk_count  INTEGER NOT NULL,
    ref_count    INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0),
    created_at   TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_blobs_ref_count ON blobs(ref_count);

CREATE TABLE chunks (
    blob_id    INTEGER NOT NULL REFERENCES blobs(id) ON DELETE CASCADE,
    seq        INTEGER NOT NULL,             -- 0-based reassembly order
    remote_id  TEXT NOT NULL,                -- transport message identifier
    length     INTEGER NOT NULL,
    tier       TEXT NOT NULL,
    PRIMARY KEY (blob_id, seq)
);
"#,
    // v2: Filesystem tree
    r#"
CREATE TABLE nodes (
    id            TEXT PRIMARY KEY,          -- UUID v4
    owner_id      INTEGER NOT NULL,
    parent_id     TEXT REFERENCES nodes(id), -- NULL for top-level entries
    name          TEXT NOT NULL,
    kind          TEXT NOT NULL CHECK (kind IN ('directory', 'file')),
    path          TEXT NOT NULL,             -- materialized path
    depth         INTEGER NOT NULL,
    size_bytes    INTEGER NOT NULL DEFAULT 0,
    mime_type     TEXT,
    blob_id       INTEGER REFERENCES blobs(id),
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at    TEXT NOT NULL DEFAULT (datetime('now')),
    deleted_at    TEXT,
    delete_batch  TEXT,                      -- id of the node whose deletion hid this one
    CHECK ((kind = 'file') = (blob_id IS NOT NULL))
);

-- No two live siblings may share a name
CREATE UNIQUE INDEX idx_nodes_live_sibling
    ON nodes(owner_id, IFNULL(parent_id, ''), name)
    WHERE deleted_at IS NULL;

CREATE INDEX idx_nodes_owner_path ON nodes(owner_id, path);
CREATE INDEX idx_nodes_parent_id ON nodes(parent_id);
CREATE INDEX idx_nodes_blob_id ON nodes(blob_id);
CREATE INDEX idx_nodes_delete_batch ON nodes(delete_batch);
"#,
];
