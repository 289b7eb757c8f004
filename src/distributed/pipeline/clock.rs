//! Warm-up / steady-state / cool-down planning for pipeline schedules.
//!
//! [`SchedulePlan`] holds the per-phase step counts a rank runs for one call
//! of a scheduler. The `plan_*` functions compute it from the pipeline
//! topology and micro-batch count; plans are recomputed on every call since
//! the micro-batch count may change between training steps.
//!
//! [`PipelineClock`] expands a plan into the ordered [`PipelineAction`]s a
//! rank executes, which is handy for reasoning about (and testing) the
//! forward/backward interleaving without running any communication.

use super::topology::validate_layout;
use crate::error::{Error, Result};

/// An action a pipeline stage performs at a given clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineAction {
    /// Forward pass on virtual chunk `chunk`.
    Forward { chunk: usize },
    /// Backward pass on virtual chunk `chunk`.
    Backward { chunk: usize },
}

/// Per-rank step counts for one scheduler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePlan {
    /// Micro-batches per chunk for this call.
    pub num_microbatches: usize,
    /// Virtual chunks per rank (1 for non-interleaved schedules).
    pub num_model_chunks: usize,
    /// Forward steps issued by this call (`num_warmup + num_steady`).
    pub total_steps: usize,
    /// Forward-only steps before the first backward.
    pub num_warmup: usize,
    /// One-forward-one-backward steps.
    pub num_steady: usize,
    /// Backward-only steps after the last forward.
    pub num_cooldown: usize,
    /// Interleaved degenerate case where `num_microbatches == world_size`
    /// puts every forward step in warm-up.
    pub all_warmup: bool,
}

impl SchedulePlan {
    /// Number of backward steps this call performs.
    pub fn num_backward(&self) -> usize {
        self.num_steady + self.num_cooldown
    }
}

/// Plan of one call of the non-flushing scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoFlushPlan {
    /// Step counts for this call.
    pub plan: SchedulePlan,
    /// Warm-up depth of the first call; also the number of micro-batches
    /// left in flight between calls.
    pub base_warmup: usize,
    /// Steady iterations before forwards switch to the newer weights.
    pub version_switch: usize,
}

/// Maps a schedule step index to the virtual chunk it runs on.
///
/// Steps are grouped into windows of `world_size * num_model_chunks`; inside
/// a window each consecutive run of `world_size` steps uses one chunk.
/// Backward steps walk the chunks in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMap {
    world_size: usize,
    num_model_chunks: usize,
}

impl ChunkMap {
    pub fn new(world_size: usize, num_model_chunks: usize) -> Self {
        Self {
            world_size: world_size.max(1),
            num_model_chunks: num_model_chunks.max(1),
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.num_model_chunks
    }

    /// Steps in one round-robin window.
    pub fn window(&self) -> usize {
        self.world_size * self.num_model_chunks
    }

    /// Chunk for step `step`, reversed when `forward` is false.
    pub fn chunk_of(&self, step: usize, forward: bool) -> usize {
        let i = (step % self.window()) / self.world_size;
        if forward {
            i
        } else {
            self.num_model_chunks - 1 - i
        }
    }

    /// Chunk for `step - back`, wrapping around the window instead of
    /// underflowing.
    pub fn chunk_before(&self, step: usize, back: usize, forward: bool) -> usize {
        let window = self.window();
        let back = back % window;
        self.chunk_of(step + window - back, forward)
    }
}

pub(crate) fn validate_pipeline(
    world_size: usize,
    rank: usize,
    num_microbatches: usize,
    num_model_chunks: usize,
) -> Result<()> {
    validate_layout(world_size, rank, num_model_chunks)?;
    if num_microbatches == 0 {
        return Err(Error::InvalidArgument {
            arg: "num_microbatches",
            reason: "num_microbatches must be > 0".to_string(),
        });
    }
    Ok(())
}

/// Plan the standard single-chunk 1F1B schedule.
///
/// Stage `rank` needs `world_size - rank - 1` extra forwards before its first
/// backward can start; the last stage enters steady state immediately. A
/// single micro-batch always runs as one warm-up forward followed by one
/// cool-down backward. `gpipe` runs every forward in warm-up.
pub fn plan_1f1b(
    world_size: usize,
    rank: usize,
    num_microbatches: usize,
    forward_only: bool,
    gpipe: bool,
) -> Result<SchedulePlan> {
    validate_pipeline(world_size, rank, num_microbatches, 1)?;

    let mut num_warmup = (world_size - rank - 1).min(num_microbatches);
    if num_microbatches == 1 {
        num_warmup = 1;
    }
    if gpipe {
        num_warmup = num_microbatches;
    }
    let num_steady = num_microbatches - num_warmup;
    let num_cooldown = if forward_only { 0 } else { num_warmup };

    Ok(SchedulePlan {
        num_microbatches,
        num_model_chunks: 1,
        total_steps: num_microbatches,
        num_warmup,
        num_steady,
        num_cooldown,
        all_warmup: false,
    })
}

/// Plan the interleaved 1F1B schedule with `num_model_chunks` chunks per rank.
///
/// Every chunk runs every micro-batch, so the rank performs
/// `num_microbatches * num_model_chunks` forward steps. With more than one
/// chunk the micro-batch count must be a multiple of `world_size`, otherwise
/// the round-robin chunk assignment pairs activations from different chunks.
pub fn plan_interleaved(
    world_size: usize,
    rank: usize,
    num_microbatches: usize,
    num_model_chunks: usize,
    forward_only: bool,
) -> Result<SchedulePlan> {
    validate_pipeline(world_size, rank, num_microbatches, num_model_chunks)?;
    if num_model_chunks > 1 && num_microbatches % world_size != 0 {
        return Err(Error::InvalidArgument {
            arg: "num_microbatches",
            reason: format!(
                "{num_microbatches} micro-batches not divisible by pipeline size {world_size} \
                 with {num_model_chunks} model chunks"
            ),
        });
    }

    let total_steps = num_microbatches * num_model_chunks;
    let mut all_warmup = false;
    let num_warmup = if forward_only {
        total_steps
    } else if num_microbatches == world_size {
        all_warmup = true;
        total_steps
    } else {
        let warmup = (world_size - rank - 1) * 2 + (num_model_chunks - 1) * world_size;
        warmup.min(total_steps)
    };
    let num_steady = total_steps - num_warmup;
    let num_cooldown = if forward_only { 0 } else { num_warmup };

    Ok(SchedulePlan {
        num_microbatches,
        num_model_chunks,
        total_steps,
        num_warmup,
        num_steady,
        num_cooldown,
        all_warmup,
    })
}

/// Plan one call of the non-flushing 1F1B schedule.
///
/// Warm-up only runs on the first call and cool-down only on the last one;
/// calls in between are pure steady state, leaving `base_warmup`
/// micro-batches in flight for the next call to finish.
pub fn plan_no_flush(
    world_size: usize,
    rank: usize,
    num_microbatches: usize,
    first_iteration: bool,
    last_iteration: bool,
) -> Result<NoFlushPlan> {
    validate_pipeline(world_size, rank, num_microbatches, 1)?;
    if !(first_iteration && last_iteration) && num_microbatches < world_size {
        return Err(Error::InvalidArgument {
            arg: "num_microbatches",
            reason: format!(
                "non-flushing schedule spanning several calls needs at least {world_size} \
                 micro-batches per call, got {num_microbatches}"
            ),
        });
    }

    let base_warmup = (world_size - rank - 1).min(num_microbatches);
    let num_steady = if last_iteration {
        num_microbatches - base_warmup
    } else {
        num_microbatches
    };
    let num_warmup = if first_iteration { base_warmup } else { 0 };
    let num_cooldown = if last_iteration { base_warmup } else { 0 };

    Ok(NoFlushPlan {
        plan: SchedulePlan {
            num_microbatches,
            num_model_chunks: 1,
            total_steps: num_warmup + num_steady,
            num_warmup,
            num_steady,
            num_cooldown,
            all_warmup: false,
        },
        base_warmup,
        version_switch: num_microbatches - base_warmup,
    })
}

/// Computes the action order for a single pipeline rank.
pub struct PipelineClock {
    world_size: usize,
    rank: usize,
    num_microbatches: usize,
}

impl PipelineClock {
    pub fn new(world_size: usize, rank: usize, num_microbatches: usize) -> Self {
        Self {
            world_size,
            rank,
            num_microbatches,
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_microbatches(&self) -> usize {
        self.num_microbatches
    }

    /// Standard 1F1B order.
    ///
    /// ```text
    /// rank 0 of 4, 6 micro-batches:  F F F F B F B F B B B B
    /// rank 3 of 4, 6 micro-batches:  F B F B F B F B F B F B
    /// ```
    pub fn schedule_1f1b(&self, forward_only: bool) -> Result<Vec<PipelineAction>> {
        let plan = plan_1f1b(
            self.world_size,
            self.rank,
            self.num_microbatches,
            forward_only,
            false,
        )?;
        let chunks = ChunkMap::new(self.world_size, 1);
        Ok(expand(&plan, &chunks, forward_only))
    }

    /// Interleaved 1F1B order over `num_model_chunks` virtual chunks.
    ///
    /// A single chunk reduces to [`schedule_1f1b`](Self::schedule_1f1b).
    pub fn schedule_interleaved(
        &self,
        num_model_chunks: usize,
        forward_only: bool,
    ) -> Result<Vec<PipelineAction>> {
        if num_model_chunks == 1 {
            return self.schedule_1f1b(forward_only);
        }
        let plan = plan_interleaved(
            self.world_size,
            self.rank,
            self.num_microbatches,
            num_model_chunks,
            forward_only,
        )?;
        let chunks = ChunkMap::new(self.world_size, num_model_chunks);
        Ok(expand(&plan, &chunks, forward_only))
    }
}

fn expand(plan: &SchedulePlan, chunks: &ChunkMap, forward_only: bool) -> Vec<PipelineAction> {
    let mut actions = Vec::with_capacity(plan.total_steps + plan.num_backward());

    for k in 0..plan.num_warmup {
        actions.push(PipelineAction::Forward {
            chunk: chunks.chunk_of(k, true),
        });
    }
    for k in 0..plan.num_steady {
        actions.push(PipelineAction::Forward {
            chunk: chunks.chunk_of(k + plan.num_warmup, true),
        });
        if !forward_only {
            actions.push(PipelineAction::Backward {
                chunk: chunks.chunk_of(k, false),
            });
        }
    }
    for k in plan.num_steady..plan.num_steady + plan.num_cooldown {
        actions.push(PipelineAction::Backward {
            chunk: chunks.chunk_of(k, false),
        });
    }

    actions
}
