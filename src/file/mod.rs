//! Logical file tree for chandrive.
//!
//! This module provides the per-owner directory hierarchy:
//! - Materialized paths with transactional subtree moves
//! - Soft delete, restore, and purge (recycle bin)
//! - Live-sibling name uniqueness

mod node;
mod tree;

pub use node::{
    format_size, guess_mime, join_path, normalize_path, path_segments, split_path, validate_name,
    Listing, Node, NodeKind, MAX_NAME_LENGTH, ROOT_PATH,
};
pub use tree::{FileTree, PurgeReport};

pub(crate) use tree::{find_in, insert_file_in, mkdirp_in, resolve_dir_in, DirRef};
