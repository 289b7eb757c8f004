//! Interleaved 1F1B pipeline schedule for training.
//!
//! Each rank owns multiple virtual stages (non-contiguous layer chunks).
//! Reduces the pipeline bubble ratio from `(S-1)/M` to `(S-1)/(M*V)`
//! where V is the number of virtual stages per rank.
//!
//! Chunk `c` of rank `r` is logical stage `c * world_size + r`, so the
//! activation leaving the last rank on chunk `c` wraps around to rank 0,
//! chunk `c + 1`. Forward steps visit chunks in runs of `world_size`
//! micro-batches; backward steps visit them in reverse.

use super::clock::{plan_interleaved, ChunkMap, SchedulePlan};
use super::phase::SchedulePhase;
use super::queue::QueueSet;
use super::schedule_1f1b::Schedule1F1B;
use super::stage::StageCompute;
use super::step::{backward_step, forward_step, PipelineContext, PipelineOutput};
use super::topology::Topology;
use crate::error::{Error, Result};

/// Interleaved 1F1B pipeline schedule.
///
/// The number of chunks comes from [`Topology::num_model_chunks`]. With a
/// single chunk the run is exactly [`Schedule1F1B`]'s.
#[derive(Debug, Clone)]
pub struct ScheduleInterleaved1F1B {
    num_microbatches: usize,
    forward_only: bool,
    stall_barriers: bool,
}

impl ScheduleInterleaved1F1B {
    pub fn new(num_microbatches: usize) -> Result<Self> {
        if num_microbatches == 0 {
            return Err(Error::InvalidArgument {
                arg: "num_microbatches",
                reason: "num_microbatches must be > 0".to_string(),
            });
        }
        Ok(Self {
            num_microbatches,
            forward_only: false,
            stall_barriers: true,
        })
    }

    pub fn with_forward_only(mut self, forward_only: bool) -> Self {
        self.forward_only = forward_only;
        self
    }

    /// Stall barriers of the single-chunk run. With several chunks no rank
    /// issues one: rank 0's warm-up waits on steady-phase activations that
    /// wrap around from the last rank, so no point before the steady phase
    /// is reached by every rank without a peer's later send.
    pub fn with_stall_barriers(mut self, stall_barriers: bool) -> Self {
        self.stall_barriers = stall_barriers;
        self
    }

    pub fn num_microbatches(&self) -> usize {
        self.num_microbatches
    }

    pub fn plan(&self, topology: &dyn Topology) -> Result<SchedulePlan> {
        plan_interleaved(
            topology.world_size(),
            topology.rank(),
            self.num_microbatches,
            topology.num_model_chunks(),
            self.forward_only,
        )
    }

    /// Run one optimizer step worth of micro-batches on every chunk.
    pub fn run<S: StageCompute>(
        &self,
        ctx: &mut PipelineContext<'_, S>,
    ) -> Result<PipelineOutput<S::Metrics>> {
        let topology = ctx.topology;
        let num_chunks = topology.num_model_chunks();
        if num_chunks == 1 {
            return Schedule1F1B::new(self.num_microbatches)?
                .with_forward_only(self.forward_only)
                .with_stall_barriers(self.stall_barriers)
                .run(ctx);
        }

        let plan = self.plan(topology)?;
        let world_size = topology.world_size();
        let chunks = ChunkMap::new(world_size, num_chunks);
        let first_rank = topology.is_first_stage(None);
        let last_rank = topology.is_last_stage(None);
        let last_chunk = num_chunks - 1;
        let total = plan.total_steps;
        let m = self.num_microbatches;

        tracing::debug!(
            rank = topology.rank(),
            world_size,
            num_chunks,
            num_microbatches = m,
            num_warmup = plan.num_warmup,
            num_steady = plan.num_steady,
            all_warmup = plan.all_warmup,
            forward_only = self.forward_only,
            "running interleaved 1F1B schedule"
        );

        let mut queues = QueueSet::new(num_chunks);
        let mut out = PipelineOutput::new();

        let first_input = ctx.comm().recv_forward(topology.position(Some(0)), true)?;
        queues.chunk_mut(0)?.push_input(first_input);

        for step in plan.phases() {
            match step.phase {
                SchedulePhase::Warmup => {
                    let k = step.index;
                    let chunk = chunks.chunk_of(k, true);
                    let output = forward_chunk(ctx, &mut queues, chunk, m, &mut out)?;
                    let output = (!topology.is_last_stage(Some(chunk))).then_some(output);

                    let next_chunk = chunks.chunk_of(k + 1, true);
                    let recv_prev = warmup_recv_prev(first_rank, next_chunk, k, total);

                    if step.is_last && !self.forward_only && !plan.all_warmup {
                        let received = ctx.comm().send_forward_backward_recv_forward_backward(
                            output,
                            None,
                            recv_prev,
                            !last_rank,
                        )?;
                        queues
                            .chunk_mut(last_chunk)?
                            .push_output_grad(received.from_next);
                        queues.chunk_mut(next_chunk)?.push_input(received.from_prev);
                    } else {
                        let input = ctx.comm().send_forward_recv_forward(output, recv_prev)?;
                        queues.chunk_mut(next_chunk)?.push_input(input);
                    }
                }
                SchedulePhase::Steady => {
                    let backward_k = step.index;
                    let forward_k = backward_k + plan.num_warmup;

                    let forward_chunk_id = chunks.chunk_of(forward_k, true);
                    let output = forward_chunk(ctx, &mut queues, forward_chunk_id, m, &mut out)?;
                    let backward_chunk_id = chunks.chunk_of(backward_k, false);
                    let input_grad = backward_chunk(ctx, &mut queues, backward_chunk_id, &mut out)?;

                    let output =
                        (!topology.is_last_stage(Some(forward_chunk_id))).then_some(output);
                    let input_grad = if topology.is_first_stage(Some(backward_chunk_id)) {
                        None
                    } else {
                        input_grad
                    };

                    let next_forward = if step.is_last {
                        None
                    } else {
                        steady_next_forward_chunk(&chunks, first_rank, forward_k, world_size)
                    };
                    let next_backward =
                        steady_next_backward_chunk(&chunks, last_rank, backward_k, world_size);

                    let received = ctx.comm().send_forward_backward_recv_forward_backward(
                        output,
                        input_grad,
                        next_forward.is_some(),
                        next_backward.is_some(),
                    )?;
                    if let Some(chunk) = next_forward {
                        queues.chunk_mut(chunk)?.push_input(received.from_prev);
                    }
                    if let Some(chunk) = next_backward {
                        queues.chunk_mut(chunk)?.push_output_grad(received.from_next);
                    }
                }
                SchedulePhase::Cooldown => {
                    if step.index == 0 && plan.all_warmup {
                        let grad = ctx
                            .comm()
                            .recv_backward(topology.position(Some(last_chunk)), true)?;
                        queues.chunk_mut(last_chunk)?.push_output_grad(grad);
                    }
                    let k = plan.num_steady + step.index;
                    let chunk = chunks.chunk_of(k, false);
                    let input_grad = backward_chunk(ctx, &mut queues, chunk, &mut out)?;
                    let input_grad = if topology.is_first_stage(Some(chunk)) {
                        None
                    } else {
                        input_grad
                    };

                    let next_chunk = chunks.chunk_of(k + 1, false);
                    let recv_next = cooldown_recv_next(last_rank, next_chunk, last_chunk, k, total);
                    let grad = ctx.comm().send_backward_recv_backward(input_grad, recv_next)?;
                    queues.chunk_mut(next_chunk)?.push_output_grad(grad);
                }
                SchedulePhase::Done => break,
            }
        }

        tracing::info!(
            rank = topology.rank(),
            forwards = out.num_forward,
            backwards = out.num_backward,
            losses = out.losses.len(),
            "interleaved 1F1B schedule finished"
        );
        Ok(out)
    }
}

/// Forward the next micro-batch of `chunk` and keep its output for backward.
fn forward_chunk<S: StageCompute>(
    ctx: &mut PipelineContext<'_, S>,
    queues: &mut QueueSet<S::Slot>,
    chunk: usize,
    num_microbatches: usize,
    out: &mut PipelineOutput<S::Metrics>,
) -> Result<S::Slot> {
    let is_first = ctx.topology.is_first_stage(Some(chunk));
    let queue = queues.chunk_mut(chunk)?;
    // first virtual stage: no activation arrives, the stage reads its own data
    if is_first && queue.num_inputs() == queue.num_outputs() {
        queue.push_input(None);
    }
    let input = queue.latest_input()?.clone();

    let output = forward_step(ctx, chunk, input, num_microbatches, out)?;
    queues.chunk_mut(chunk)?.push_output(output.clone());
    Ok(output)
}

/// Backward the oldest pending micro-batch of `chunk`.
fn backward_chunk<S: StageCompute>(
    ctx: &mut PipelineContext<'_, S>,
    queues: &mut QueueSet<S::Slot>,
    chunk: usize,
    out: &mut PipelineOutput<S::Metrics>,
) -> Result<Option<S::Slot>> {
    let is_last = ctx.topology.is_last_stage(Some(chunk));
    let queue = queues.chunk_mut(chunk)?;
    // last virtual stage: backward starts from the loss
    if is_last && queue.num_output_grads() == 0 {
        queue.push_output_grad(None);
    }
    let pending = queue.pop_backward()?;
    backward_step(ctx, chunk, pending, out)
}

/// Whether warm-up step `k` receives the input of step `k + 1`.
///
/// Rank 0 produces chunk 0's inputs itself, and nothing follows the final
/// step.
fn warmup_recv_prev(first_rank: bool, next_chunk: usize, k: usize, total: usize) -> bool {
    !(first_rank && next_chunk == 0) && k + 1 != total
}

/// Chunk that receives the activation arriving after steady forward step
/// `forward_k`, or `None` if nothing arrives.
///
/// Rank 0 trails the last rank by `world_size - 1` steps: what it receives
/// now is the output of the last rank's chunk at that earlier step, which
/// feeds rank 0's next chunk. Output of the last chunk leaves the pipeline.
fn steady_next_forward_chunk(
    chunks: &ChunkMap,
    first_rank: bool,
    forward_k: usize,
    world_size: usize,
) -> Option<usize> {
    if first_rank {
        let base = chunks.chunk_before(forward_k, world_size - 1, true);
        (base + 1 < chunks.num_chunks()).then_some(base + 1)
    } else {
        Some(chunks.chunk_of(forward_k + 1, true))
    }
}

/// Chunk that receives the gradient arriving after steady backward step
/// `backward_k`, or `None` if nothing arrives.
fn steady_next_backward_chunk(
    chunks: &ChunkMap,
    last_rank: bool,
    backward_k: usize,
    world_size: usize,
) -> Option<usize> {
    if last_rank {
        let base = chunks.chunk_before(backward_k, world_size - 1, false);
        base.checked_sub(1)
    } else {
        Some(chunks.chunk_of(backward_k + 1, false))
    }
}

/// Whether cool-down step `k` receives the gradient of step `k + 1`.
fn cooldown_recv_next(
    last_rank: bool,
    next_chunk: usize,
    last_chunk: usize,
    k: usize,
    total: usize,
) -> bool {
    !(last_rank && next_chunk == last_chunk) && k + 1 != total
}
