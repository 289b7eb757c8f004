//! 1F1B (one-forward-one-backward) pipeline schedule for training.
//!
//! The standard schedule used by Megatron-LM and DeepSpeed. Minimizes peak
//! memory by limiting the number of in-flight micro-batches per stage.
//!
//! ```text
//! warm-up   recv_forward → forward → send_forward          (world - rank - 1)×
//! steady    forward → send_forward_recv_backward
//!           → backward → send_backward_recv_forward         remaining×
//! cool-down recv_backward → backward → send_backward        warm-up×
//! ```

use super::clock::{plan_1f1b, SchedulePlan};
use super::phase::SchedulePhase;
use super::queue::{ChunkQueues, PendingBackward};
use super::stage::StageCompute;
use super::step::{backward_step, forward_step, pipeline_stall, PipelineContext, PipelineOutput};
use super::topology::Topology;
use crate::error::{Error, Result};

/// 1F1B pipeline schedule.
///
/// Also runs GPipe (every forward before any backward) via
/// [`with_gpipe`](Self::with_gpipe).
#[derive(Debug, Clone)]
pub struct Schedule1F1B {
    num_microbatches: usize,
    forward_only: bool,
    gpipe: bool,
    stall_barriers: bool,
}

impl Schedule1F1B {
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
            gpipe: false,
            stall_barriers: true,
        })
    }

    pub fn with_forward_only(mut self, forward_only: bool) -> Self {
        self.forward_only = forward_only;
        self
    }

    pub fn with_gpipe(mut self, gpipe: bool) -> Self {
        self.gpipe = gpipe;
        self
    }

    pub fn with_stall_barriers(mut self, stall_barriers: bool) -> Self {
        self.stall_barriers = stall_barriers;
        self
    }

    pub fn num_microbatches(&self) -> usize {
        self.num_microbatches
    }

    /// Plan of this schedule on `topology`.
    pub fn plan(&self, topology: &dyn Topology) -> Result<SchedulePlan> {
        plan_1f1b(
            topology.world_size(),
            topology.rank(),
            self.num_microbatches,
            self.forward_only,
            self.gpipe,
        )
    }

    /// Run one optimizer step worth of micro-batches.
    pub fn run<S: StageCompute>(
        &self,
        ctx: &mut PipelineContext<'_, S>,
    ) -> Result<PipelineOutput<S::Metrics>> {
        let topology = ctx.topology;
        if topology.num_model_chunks() != 1 {
            return Err(Error::InvalidArgument {
                arg: "num_model_chunks",
                reason: format!(
                    "1F1B schedule runs a single model chunk, topology has {}",
                    topology.num_model_chunks()
                ),
            });
        }
        let plan = self.plan(topology)?;
        let pos = topology.position(Some(0));
        let m = self.num_microbatches;
        let stall_after_warmup = self.stall_barriers && !self.gpipe && m > 1;
        let stall_without_warmup = self.stall_barriers && !self.gpipe && plan.num_warmup == 0;

        tracing::debug!(
            rank = topology.rank(),
            world_size = topology.world_size(),
            num_microbatches = m,
            num_warmup = plan.num_warmup,
            num_steady = plan.num_steady,
            forward_only = self.forward_only,
            gpipe = self.gpipe,
            "running 1F1B schedule"
        );

        let mut queue = ChunkQueues::new();
        let mut out = PipelineOutput::new();
        let mut next_input = None;

        for step in plan.phases() {
            match step.phase {
                SchedulePhase::Warmup => {
                    let input = ctx.comm().recv_forward(pos, false)?;
                    if self.forward_only {
                        let output = forward_step(ctx, 0, input, m, &mut out)?;
                        ctx.comm().send_forward(Some(output), pos)?;
                    } else {
                        let output = forward_step(ctx, 0, input.clone(), m, &mut out)?;
                        ctx.comm().send_forward(Some(output.clone()), pos)?;
                        queue.push_input(input);
                        queue.push_output(output);
                    }
                    // after the send: downstream warm-up may still be waiting on it
                    if step.is_last && stall_after_warmup {
                        pipeline_stall(ctx)?;
                    }
                }
                SchedulePhase::Steady => {
                    if step.index == 0 {
                        if stall_without_warmup {
                            pipeline_stall(ctx)?;
                        }
                        next_input = ctx.comm().recv_forward(pos, false)?;
                    }
                    let input = next_input.take();

                    if self.forward_only {
                        let output = forward_step(ctx, 0, input, m, &mut out)?;
                        ctx.comm().send_forward(Some(output), pos)?;
                        if !step.is_last {
                            next_input = ctx.comm().recv_forward(pos, false)?;
                        }
                        continue;
                    }

                    let output = forward_step(ctx, 0, input.clone(), m, &mut out)?;
                    let output_grad = ctx
                        .comm()
                        .send_forward_recv_backward(Some(output.clone()), pos)?;
                    queue.push_input(input);
                    queue.push_output(output);
                    queue.push_output_grad(output_grad);

                    let pending = queue.pop_backward()?;
                    let input_grad = backward_step(ctx, 0, pending, &mut out)?;
                    if step.is_last {
                        ctx.comm().send_backward(input_grad, pos)?;
                    } else {
                        next_input = ctx.comm().send_backward_recv_forward(input_grad, pos)?;
                    }
                }
                SchedulePhase::Cooldown => {
                    let (input, output) = queue.pop_activation()?;
                    let output_grad = ctx.comm().recv_backward(pos, false)?;
                    let pending = PendingBackward {
                        input,
                        output,
                        output_grad,
                    };
                    let input_grad = backward_step(ctx, 0, pending, &mut out)?;
                    ctx.comm().send_backward(input_grad, pos)?;
                }
                SchedulePhase::Done => break,
            }
        }

        tracing::info!(
            rank = topology.rank(),
            forwards = out.num_forward,
            backwards = out.num_backward,
            losses = out.losses.len(),
            "1F1B schedule finished"
        );
        Ok(out)
    }
}
