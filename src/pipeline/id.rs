//! Identity types for the DAG.
//!
//! All IDs are newtypes over `u32` that serve as direct array indices
//! into their respective storage vectors in `ProcessingDag`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into `ProcessingDag::nodes`. Also the worker's slot in the control block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Index into `ProcessingDag::queues`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(pub u32);

impl QueueId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueId({})", self.0)
    }
}

/// Index into `ProcessingDag::edges`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

impl EdgeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EdgeId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_index_their_storage() {
        assert_eq!(NodeId(42).index(), 42);
        assert_eq!(QueueId(3).index(), 3);
        assert_eq!(EdgeId(5).index(), 5);
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(format!("{}", NodeId(7)), "NodeId(7)");
        assert_eq!(format!("{:?}", QueueId(1)), "QueueId(1)");
    }
}
