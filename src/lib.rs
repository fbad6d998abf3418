//! chandrive - a channel drive
//!
//! Hierarchical file storage whose bytes live as messages in a chat channel.
//! Files are split into transport-sized chunks, deduplicated by content
//! checksum, and organised in a per-owner tree with a recycle bin.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod file;
pub mod logging;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use db::Database;
pub use engine::{Download, ReclaimReport, StorageEngine, UploadOutcome, UploadRequest, UploadVia};
pub use error::{DriveError, Result};
pub use file::{format_size, FileTree, Listing, Node, NodeKind, PurgeReport};
pub use storage::{
    BlobAssembler, BlobDescriptor, BlobStore, ChunkPlan, ChunkPlanner, ChunkReference,
    ChunkStream, RetryPolicy,
};
pub use transport::{ChannelTransport, MemoryTransport, RemoteMessageId, TransportError};
