use crate::error::{MergeError, Result};

pub type Rank = u32;

/// One process's view of the spanning tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    rank: Rank,
    size: u32,
    parent: Option<Rank>,
    children: Vec<Rank>,
}

impl Topology {
    /// Build a topology from explicit parent and children.
    ///
    /// Only rank 0 may be parentless, and no rank may name itself.
    pub fn new(rank: Rank, size: u32, parent: Option<Rank>, children: Vec<Rank>) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(MergeError::InvalidTopology(format!(
                "rank {rank} outside group of {size}"
            )));
        }
        if parent.is_none() != (rank == 0) {
            return Err(MergeError::InvalidTopology(format!(
                "rank {rank} {} a parent",
                if rank == 0 { "must not have" } else { "needs" }
            )));
        }
        if let Some(p) = parent {
            if p >= size || p == rank {
                return Err(MergeError::InvalidTopology(format!(
                    "rank {rank} has invalid parent {p}"
                )));
            }
        }
        if let Some(&c) = children.iter().find(|&&c| c >= size || c == rank || Some(c) == parent) {
            return Err(MergeError::InvalidTopology(format!(
                "rank {rank} has invalid child {c}"
            )));
        }
        Ok(Self {
            rank,
            size,
            parent,
            children,
        })
    }

    /// Heap-ordered k-ary tree: parent of `r` is `(r - 1) / k`.
    pub fn k_ary(rank: Rank, size: u32, fanout: u32) -> Result<Self> {
        if fanout == 0 {
            return Err(MergeError::InvalidTopology("fan-out must be positive".into()));
        }
        let parent = (rank > 0).then(|| (rank - 1) / fanout);
        let first = rank as u64 * fanout as u64 + 1;
        let children = (first..first + fanout as u64)
            .take_while(|&c| c < size as u64)
            .map(|c| c as Rank)
            .collect();
        Self::new(rank, size, parent, children)
    }

    /// Topologies for every rank of a k-ary group
    pub fn k_ary_group(size: u32, fanout: u32) -> Result<Vec<Self>> {
        (0..size).map(|rank| Self::k_ary(rank, size, fanout)).collect()
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn parent(&self) -> Option<Rank> {
        self.parent
    }

    pub fn children(&self) -> &[Rank] {
        &self.children
    }

    pub fn fanout(&self) -> usize {
        self.children.len()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Single-member groups bypass the merge protocol entirely
    pub fn is_solo(&self) -> bool {
        self.size == 1
    }
}
