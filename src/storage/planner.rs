//! Chunk planning.
//!
//! Given a declared size and the transport's tier table, decide which tier
//! carries the upload and how it is cut into messages. Planning happens before
//! any transport call so unsupported sizes fail without a partial upload.

use crate::config::{StorageConfig, TierConfig};
use crate::{DriveError, Result};

/// A transport tier and its single-message ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    /// Tier name passed to the transport.
    pub name: String,
    /// Largest single message, in bytes.
    pub ceiling: u64,
}

impl Tier {
    /// Create a tier.
    pub fn new(name: impl Into<String>, ceiling: u64) -> Self {
        Self {
            name: name.into(),
            ceiling,
        }
    }
}

/// Tier capability table, ordered from smallest to largest ceiling.
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: Vec<Tier>,
}

impl TierTable {
    /// Build a table; tiers may be given in any order.
    pub fn new(mut tiers: Vec<Tier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(DriveError::Config("tier table is empty".to_string()));
        }
        if let Some(tier) = tiers.iter().find(|t| t.ceiling == 0) {
            return Err(DriveError::Config(format!(
                "tier {} has a zero ceiling",
                tier.name
            )));
        }
        tiers.sort_by_key(|t| t.ceiling);
        Ok(Self { tiers })
    }

    /// Build a table from configuration entries.
    pub fn from_config(tiers: &[TierConfig]) -> Result<Self> {
        Self::new(
            tiers
                .iter()
                .map(|t| Tier::new(t.name.clone(), t.ceiling_bytes))
                .collect(),
        )
    }

    /// Cheapest tier whose ceiling holds `size` in one message.
    pub fn smallest_fitting(&self, size: u64) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.ceiling >= size)
    }

    /// Tier with the largest ceiling.
    pub fn largest(&self) -> &Tier {
        // new() rejects empty tables
        &self.tiers[self.tiers.len() - 1]
    }

    /// Look up a tier by name.
    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// Tiers in ascending ceiling order.
    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter()
    }
}

/// How one upload is split into transport messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    tier: Tier,
    total_size: u64,
    chunk_count: u32,
}

impl ChunkPlan {
    /// Tier every chunk is sent on.
    pub fn tier(&self) -> &Tier {
        &self.tier
    }

    /// Declared size of the whole upload.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of chunks (at least 1; an empty file is one empty chunk).
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Length of chunk `index`. Every chunk but the last is a full ceiling;
    /// the last carries the remainder, which is never 0 unless the file is empty.
    pub fn chunk_len(&self, index: u32) -> u64 {
        debug_assert!(index < self.chunk_count);
        if index + 1 < self.chunk_count {
            self.tier.ceiling
        } else {
            self.total_size - self.tier.ceiling * u64::from(self.chunk_count - 1)
        }
    }

    /// Chunk lengths in sequence order.
    pub fn chunk_lengths(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.chunk_count).map(move |i| self.chunk_len(i))
    }
}

/// Chooses tiers and chunk boundaries.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    tiers: TierTable,
    max_chunks: u32,
}

impl ChunkPlanner {
    /// Create a planner.
    pub fn new(tiers: TierTable, max_chunks: u32) -> Self {
        Self {
            tiers,
            max_chunks: max_chunks.max(1),
        }
    }

    /// Create a planner from the storage configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Ok(Self::new(
            TierTable::from_config(&config.tiers)?,
            config.max_chunks_per_blob,
        ))
    }

    /// The tier table in use.
    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Largest upload this planner accepts.
    pub fn capacity(&self) -> u64 {
        self.tiers
            .largest()
            .ceiling
            .saturating_mul(u64::from(self.max_chunks))
    }

    /// Plan an upload of `size` bytes.
    pub fn plan(&self, size: u64) -> Result<ChunkPlan> {
        if let Some(tier) = self.tiers.smallest_fitting(size) {
            return Ok(ChunkPlan {
                tier: tier.clone(),
                total_size: size,
                chunk_count: 1,
            });
        }

        let tier = self.tiers.largest();
        let count = size / tier.ceiling + u64::from(size % tier.ceiling != 0);
        if count > u64::from(self.max_chunks) {
            return Err(DriveError::SizeUnsupported {
                declared: size,
                capacity: self.capacity(),
            });
        }

        Ok(ChunkPlan {
            tier: tier.clone(),
            total_size: size,
            chunk_count: count as u32,
        })
    }
}
