//! Physical blob storage: planning, content addressing, and chunk transfer.

pub mod assembler;
pub mod cas;
pub mod planner;

pub use assembler::{collect_bytes, BlobAssembler, ChunkStream, RetryPolicy, UploadedBlob};
pub use cas::{checksum, BlobDescriptor, BlobStore, ChunkReference, ContentHasher, Registration};
pub use planner::{ChunkPlan, ChunkPlanner, Tier, TierTable};
