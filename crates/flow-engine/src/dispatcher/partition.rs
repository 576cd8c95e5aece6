//! Schedule partitions: the sharding key that spreads polling across workers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Number of schedule partitions.
pub const SCHEDULE_PARTITIONS: u32 = 256;

/// Stable partition of a flow id.
pub fn schedule_partition(id: &Uuid) -> i32 {
    let digest = Sha256::digest(id.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix % SCHEDULE_PARTITIONS) as i32
}

/// Partitions a worker polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionAssignment {
    /// Every partition.
    #[default]
    All,
    /// Partitions `p` with `p % count == index`.
    Static { index: u32, count: u32 },
}

impl PartitionAssignment {
    /// Build a static assignment for replica `index` of `count`.
    ///
    /// A single replica owns everything.
    pub fn for_replica(index: u32, count: u32) -> Self {
        if count <= 1 {
            Self::All
        } else {
            Self::Static { index, count }
        }
    }

    pub fn owns(&self, partition: i32) -> bool {
        match *self {
            Self::All => true,
            Self::Static { index, count } => {
                count > 0 && partition >= 0 && (partition as u32) % count == index
            }
        }
    }

    /// Owned partitions, or `None` for all of them.
    pub fn partitions(&self) -> Option<Vec<i32>> {
        match self {
            Self::All => None,
            Self::Static { .. } => Some(
                (0..SCHEDULE_PARTITIONS as i32)
                    .filter(|p| self.owns(*p))
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Display for PartitionAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Static { index, count } => write!(f, "{}/{}", index, count),
        }
    }
}
