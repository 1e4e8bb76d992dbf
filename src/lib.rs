pub mod coarsening;
pub mod community;
pub mod context;
pub mod delta;
pub mod error;
pub mod graph;
pub mod hypergraph;
pub mod incident_nets;
pub mod initial_partitioning;
pub mod io;
pub mod metrics;
pub mod partitioned;
pub mod partitioner;
pub mod refinement;

pub use error::Error;

/// Id of a hypergraph vertex.
pub type NodeId = u32;
/// Id of a hyperedge.
pub type EdgeId = u32;
/// Integer weight of vertices, hyperedges and blocks.
pub type Weight = i64;
/// Block id of a k-way partition. `INVALID_BLOCK` marks an unassigned vertex.
pub type BlockId = i32;
/// Objective delta of a vertex move.
pub type Gain = i64;

pub const INVALID_BLOCK: BlockId = -1;
pub const INVALID_NODE: NodeId = u32::MAX;
pub const INVALID_EDGE: EdgeId = u32::MAX;

// The `Partition` trait allows for partitioning data.
// Partitioning algorithms implement this trait.
// The generic argument `M` defines the input of the algorithms (e.g. a
// hypergraph together with a configuration).
// The input partition must be of the correct size and its contents may or may
// not be used by the algorithms.
pub trait Partition<M> {
    // Diagnostic data returned for a specific run of the algorithm.
    type Metadata;

    // Error details, should the algorithm fail to run.
    type Error;

    // Partition the given data and output the block ID of each element in
    // `part_ids`.
    //
    // Block IDs must be contiguous and start from zero, meaning the number of
    // blocks is one plus the maximum of `part_ids`.  If a lower ID does not
    // appear in the array, the block is assumed to be empty.
    fn partition(&mut self, part_ids: &mut [BlockId], data: M)
                 -> Result<Self::Metadata, Self::Error>;
}
