//! Pipeline topology: world size, rank and virtual chunk layout.
//!
//! Schedulers never discover the topology themselves; they query a
//! [`Topology`] implementation the caller provides. The virtual chunk a
//! question refers to is always passed explicitly.

use crate::error::{Error, Result};

/// Boundary flags of one (rank, chunk) position in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StagePosition {
    /// Nothing upstream: inputs come from the data loader.
    pub is_first: bool,
    /// Nothing downstream: forward produces the loss.
    pub is_last: bool,
}

impl StagePosition {
    /// Position that ignores both boundaries, used for ring exchanges.
    pub const INTERIOR: Self = Self {
        is_first: false,
        is_last: false,
    };
}

/// Process layout of the pipeline-parallel group.
pub trait Topology {
    /// Number of ranks in the pipeline.
    fn world_size(&self) -> usize;

    /// This process's rank in `[0, world_size)`.
    fn rank(&self) -> usize;

    /// Virtual chunks per rank. 1 unless interleaving.
    fn num_model_chunks(&self) -> usize {
        1
    }

    /// Whether `(rank, chunk)` is the first stage of the pipeline.
    ///
    /// With `chunk = None` only the physical rank is considered.
    fn is_first_stage(&self, chunk: Option<usize>) -> bool {
        self.rank() == 0 && matches!(chunk, None | Some(0))
    }

    /// Whether `(rank, chunk)` is the last stage of the pipeline.
    ///
    /// With `chunk = None` only the physical rank is considered.
    fn is_last_stage(&self, chunk: Option<usize>) -> bool {
        let last_chunk = self.num_model_chunks().saturating_sub(1);
        self.rank() + 1 == self.world_size() && chunk.map_or(true, |c| c == last_chunk)
    }

    /// Boundary flags for `chunk`.
    fn position(&self, chunk: Option<usize>) -> StagePosition {
        StagePosition {
            is_first: self.is_first_stage(chunk),
            is_last: self.is_last_stage(chunk),
        }
    }
}

/// Check a (world size, rank, chunk count) triple.
pub(crate) fn validate_layout(
    world_size: usize,
    rank: usize,
    num_model_chunks: usize,
) -> Result<()> {
    if world_size == 0 {
        return Err(Error::InvalidArgument {
            arg: "world_size",
            reason: "pipeline world size must be > 0".to_string(),
        });
    }
    if rank >= world_size {
        return Err(Error::InvalidArgument {
            arg: "rank",
            reason: format!("rank {rank} outside [0, {world_size})"),
        });
    }
    if num_model_chunks == 0 {
        return Err(Error::InvalidArgument {
            arg: "num_model_chunks",
            reason: "num_model_chunks must be > 0".to_string(),
        });
    }
    Ok(())
}

/// Validated, plain-value [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTopology {
    world_size: usize,
    rank: usize,
    num_model_chunks: usize,
}

impl PipelineTopology {
    pub fn new(world_size: usize, rank: usize, num_model_chunks: usize) -> Result<Self> {
        validate_layout(world_size, rank, num_model_chunks)?;
        Ok(Self {
            world_size,
            rank,
            num_model_chunks,
        })
    }

    /// Single-chunk topology.
    pub fn flat(world_size: usize, rank: usize) -> Result<Self> {
        Self::new(world_size, rank, 1)
    }
}

impl Topology for PipelineTopology {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn num_model_chunks(&self) -> usize {
        self.num_model_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_boundaries() {
        let first = PipelineTopology::flat(4, 0).unwrap();
        let mid = PipelineTopology::flat(4, 2).unwrap();
        let last = PipelineTopology::flat(4, 3).unwrap();
        assert!(first.is_first_stage(None));
        assert!(!first.is_last_stage(None));
        assert_eq!(mid.position(None), StagePosition::INTERIOR);
        assert!(last.is_last_stage(None));
        assert!(!last.is_first_stage(None));
    }

    #[test]
    fn test_virtual_boundaries() {
        let first = PipelineTopology::new(2, 0, 3).unwrap();
        assert!(first.is_first_stage(Some(0)));
        assert!(!first.is_first_stage(Some(1)));
        assert!(first.is_first_stage(None));

        let last = PipelineTopology::new(2, 1, 3).unwrap();
        assert!(last.is_last_stage(Some(2)));
        assert!(!last.is_last_stage(Some(0)));
        assert!(last.is_last_stage(None));
    }

    #[test]
    fn test_single_rank_is_both_ends() {
        let only = PipelineTopology::flat(1, 0).unwrap();
        let pos = only.position(Some(0));
        assert!(pos.is_first && pos.is_last);
    }

    #[test]
    fn test_rejects_bad_layout() {
        assert!(PipelineTopology::new(0, 0, 1).is_err());
        assert!(PipelineTopology::new(2, 2, 1).is_err());
        assert!(PipelineTopology::new(2, 0, 0).is_err());
    }
}
