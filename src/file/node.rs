//! Node types and path helpers for the logical file tree.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::{DriveError, Result};

/// Path of the implicit per-owner root directory.
pub const ROOT_PATH: &str = "/";

/// Maximum length for a node name (in characters).
pub const MAX_NAME_LENGTH: usize = 255;

/// Columns selected for every [`Node`] query.
pub(crate) const NODE_COLUMNS: &str = "id, owner_id, parent_id, name, kind, path, depth, \
     size_bytes, mime_type, blob_id, created_at, updated_at, deleted_at, delete_batch";

/// Node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A directory; may have children.
    Directory,
    /// A file; always references a blob.
    File,
}

impl NodeKind {
    /// Get the kind as stored in the catalog.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Directory => "directory",
            NodeKind::File => "file",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "directory" => Ok(NodeKind::Directory),
            "file" => Ok(NodeKind::File),
            _ => Err(format!("unknown node kind: {s}")),
        }
    }
}

impl TryFrom<String> for NodeKind {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// A filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Node {
    /// Unique node ID (UUID v4).
    pub id: String,
    /// Owning user.
    pub owner_id: i64,
    /// Parent directory ID (None for top-level entries).
    pub parent_id: Option<String>,
    /// Name, unique among live siblings.
    pub name: String,
    /// Directory or file.
    #[sqlx(try_from = "String")]
    pub kind: NodeKind,
    /// Materialized full path.
    pub path: String,
    /// Number of path segments (top-level entries are 1).
    pub depth: i64,
    /// Size in bytes (0 for directories).
    pub size_bytes: i64,
    /// MIME type (files only).
    pub mime_type: Option<String>,
    /// Referenced blob (files only).
    pub blob_id: Option<i64>,
    /// When the node was created.
    pub created_at: String,
    /// When the node was last renamed, moved, or restored.
    pub updated_at: String,
    /// When the node was soft-deleted.
    pub deleted_at: Option<String>,
    /// ID of the node whose deletion hid this one.
    pub delete_batch: Option<String>,
}

impl Node {
    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Check if this is a file.
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Check if the node is in the recycle bin.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size_bytes.max(0) as u64
    }

    /// Get the created_at as DateTime<Utc>.
    pub fn created_at_datetime(&self) -> DateTime<Utc> {
        parse_timestamp(&self.created_at).unwrap_or_else(Utc::now)
    }

    /// Get the deleted_at as DateTime<Utc>.
    pub fn deleted_at_datetime(&self) -> Option<DateTime<Utc>> {
        self.deleted_at.as_deref().and_then(parse_timestamp)
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Live contents of one directory.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    /// Normalized path of the listed directory.
    pub path: String,
    /// Subdirectories, ordered by name.
    pub directories: Vec<Node>,
    /// Files, ordered by name.
    pub files: Vec<Node>,
    /// Number of files.
    pub total_files: usize,
    /// Sum of file sizes in bytes.
    pub total_size: u64,
}

impl Listing {
    pub(crate) fn new(path: String, children: Vec<Node>) -> Self {
        let (directories, files): (Vec<Node>, Vec<Node>) =
            children.into_iter().partition(Node::is_dir);
        let total_size = files.iter().map(Node::size).sum();
        Self {
            path,
            total_files: files.len(),
            total_size,
            directories,
            files,
        }
    }

    /// Check if the directory has no live entries.
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.files.is_empty()
    }

    /// Iterate directories first, then files.
    pub fn entries(&self) -> impl Iterator<Item = &Node> {
        self.directories.iter().chain(self.files.iter())
    }
}

/// Validate a single node name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DriveError::Validation("name cannot be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(DriveError::Validation(format!("invalid name: {name}")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(DriveError::Validation(format!(
            "name contains a forbidden character: {name}"
        )));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(DriveError::Validation(format!(
            "name exceeds {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Normalize a user-supplied path.
///
/// Surrounding whitespace is trimmed, the result always starts with `/`, and
/// empty segments (repeated or trailing slashes) are dropped. Every remaining
/// segment must be a valid name.
pub fn normalize_path(path: &str) -> Result<String> {
    let segments: Vec<&str> = path.trim().split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Ok(ROOT_PATH.to_string());
    }
    for segment in &segments {
        validate_name(segment)?;
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Segments of a normalized path (empty for the root).
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Join a normalized directory path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == ROOT_PATH {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Split a normalized path into its parent path and final name.
///
/// Returns None for the root.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { ROOT_PATH } else { &path[..idx] };
    Some((parent, name))
}

/// Guess a MIME type from a file name.
pub fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Format a byte count for display.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
