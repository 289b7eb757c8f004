//! Non-flushing 1F1B schedule (PipeDream-2BW style).
//!
//! Consecutive optimizer steps run back to back without draining the
//! pipeline in between. The in-flight micro-batches of one call are
//! finished by the next, so their backward passes run against weights one
//! update older than the current ones. The optimizer keeps both versions and
//! the schedule switches between them around every forward and backward.
//!
//! ```text
//! call 1 (first)    warm-up   steady …………………………………   ┐ base_warmup micro-batches
//! call 2            steady …………………………………………………   ┤ carried in NoFlushState
//! call n (last)     steady ……………………………   cool-down    ┘ drained
//! ```

use super::clock::{plan_no_flush, NoFlushPlan};
use super::phase::SchedulePhase;
use super::queue::{ChunkQueues, PendingBackward};
use super::stage::StageCompute;
use super::step::{backward_step, forward_step, pipeline_stall, PipelineContext, PipelineOutput};
use super::topology::Topology;
use crate::error::{Error, Result};

/// Micro-batches carried from one non-flushing call to the next.
///
/// Owned by the caller and passed to every [`ScheduleNoFlush::run`] of a
/// training run.
#[derive(Debug, Clone)]
pub struct NoFlushState<T> {
    queue: ChunkQueues<T>,
}

impl<T> Default for NoFlushState<T> {
    fn default() -> Self {
        Self {
            queue: ChunkQueues::new(),
        }
    }
}

impl<T> NoFlushState<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing in flight: no pending inputs or outputs.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    /// Forwarded micro-batches still waiting for their backward.
    pub fn in_flight(&self) -> usize {
        self.queue.num_outputs()
    }

    /// Received inputs not yet consumed by a backward, including the one the
    /// next call's first forward reads.
    pub fn pending_inputs(&self) -> usize {
        self.queue.num_inputs()
    }
}

/// Non-flushing 1F1B schedule.
#[derive(Debug, Clone)]
pub struct ScheduleNoFlush {
    num_microbatches: usize,
    stall_barriers: bool,
}

impl ScheduleNoFlush {
    pub fn new(num_microbatches: usize) -> Result<Self> {
        if num_microbatches == 0 {
            return Err(Error::InvalidArgument {
                arg: "num_microbatches",
                reason: "num_microbatches must be > 0".to_string(),
            });
        }
        Ok(Self {
            num_microbatches,
            stall_barriers: true,
        })
    }

    pub fn with_stall_barriers(mut self, stall_barriers: bool) -> Self {
        self.stall_barriers = stall_barriers;
        self
    }

    pub fn num_microbatches(&self) -> usize {
        self.num_microbatches
    }

    pub fn plan(
        &self,
        topology: &dyn Topology,
        first_iteration: bool,
        last_iteration: bool,
    ) -> Result<NoFlushPlan> {
        plan_no_flush(
            topology.world_size(),
            topology.rank(),
            self.num_microbatches,
            first_iteration,
            last_iteration,
        )
    }

    /// Run one optimizer step.
    ///
    /// `first_iteration` starts the pipeline (warm-up) and needs a drained
    /// `state`; `last_iteration` drains it (cool-down). A single call with
    /// both set behaves like a flushing 1F1B step.
    pub fn run<S: StageCompute>(
        &self,
        ctx: &mut PipelineContext<'_, S>,
        state: &mut NoFlushState<S::Slot>,
        first_iteration: bool,
        last_iteration: bool,
    ) -> Result<PipelineOutput<S::Metrics>> {
        let topology = ctx.topology;
        if topology.num_model_chunks() != 1 {
            return Err(Error::InvalidArgument {
                arg: "num_model_chunks",
                reason: format!(
                    "non-flushing schedule runs a single model chunk, topology has {}",
                    topology.num_model_chunks()
                ),
            });
        }
        let NoFlushPlan {
            plan,
            base_warmup,
            version_switch,
        } = self.plan(topology, first_iteration, last_iteration)?;

        if first_iteration && !state.is_drained() {
            return Err(Error::SchedulerError {
                reason: format!(
                    "first non-flushing call needs a drained pipeline, {} micro-batches in flight",
                    state.in_flight()
                ),
            });
        }
        if !first_iteration && state.in_flight() != base_warmup {
            return Err(Error::SchedulerError {
                reason: format!(
                    "expected {base_warmup} micro-batches carried from the previous call, found {}",
                    state.in_flight()
                ),
            });
        }

        tracing::debug!(
            rank = topology.rank(),
            num_microbatches = self.num_microbatches,
            num_warmup = plan.num_warmup,
            num_steady = plan.num_steady,
            num_cooldown = plan.num_cooldown,
            first_iteration,
            last_iteration,
            "running non-flushing 1F1B schedule"
        );

        let pos = topology.position(Some(0));
        let m = self.num_microbatches;
        let queue = &mut state.queue;
        let mut out = PipelineOutput::new();

        for step in plan.phases() {
            match step.phase {
                SchedulePhase::Warmup => {
                    let input = ctx.comm().recv_forward(pos, false)?;
                    ctx.optimizer.swap_to_older_version()?;
                    let output = forward_step(ctx, 0, input.clone(), m, &mut out)?;
                    ctx.comm().send_forward(Some(output.clone()), pos)?;
                    queue.push_input(input);
                    queue.push_output(output);
                    // after the send: downstream warm-up may still be waiting on it
                    if step.is_last && self.stall_barriers {
                        pipeline_stall(ctx)?;
                    }
                }
                SchedulePhase::Steady => {
                    if step.index == 0 && first_iteration {
                        if plan.num_warmup == 0 && self.stall_barriers {
                            pipeline_stall(ctx)?;
                        }
                        let input = ctx.comm().recv_forward(pos, false)?;
                        queue.push_input(input);
                    }

                    let input = queue.latest_input()?.clone();
                    if step.index < version_switch {
                        ctx.optimizer.swap_to_older_version()?;
                    } else {
                        ctx.optimizer.swap_to_newer_version()?;
                    }
                    let output = forward_step(ctx, 0, input, m, &mut out)?;
                    let output_grad = ctx
                        .comm()
                        .send_forward_recv_backward(Some(output.clone()), pos)?;
                    queue.push_output(output);
                    queue.push_output_grad(output_grad);

                    let pending = queue.pop_backward()?;
                    ctx.optimizer.swap_to_older_version()?;
                    let input_grad = backward_step(ctx, 0, pending, &mut out)?;

                    if step.is_last && last_iteration {
                        ctx.comm().send_backward(input_grad, pos)?;
                    } else {
                        let input = ctx.comm().send_backward_recv_forward(input_grad, pos)?;
                        queue.push_input(input);
                    }
                }
                SchedulePhase::Cooldown => {
                    let (input, output) = queue.pop_activation()?;
                    let output_grad = ctx.comm().recv_backward(pos, false)?;
                    ctx.optimizer.swap_to_older_version()?;
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
            in_flight = state.in_flight(),
            "non-flushing 1F1B call finished"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::pipeline::telemetry::{timer, Telemetry};
    use crate::distributed::pipeline::topology::PipelineTopology;
    use crate::testing::{
        RecordingOptimizer, ScriptedChannel, TelemetryLog, TraceStage, WeightVersion,
    };

    struct Harness {
        topo: PipelineTopology,
        stage: TraceStage,
        optimizer: RecordingOptimizer,
        channel: ScriptedChannel,
        state: NoFlushState<crate::testing::Packet>,
    }

    impl Harness {
        fn new(world_size: usize, rank: usize) -> Self {
            let topo = PipelineTopology::flat(world_size, rank).unwrap();
            let optimizer = RecordingOptimizer::new();
            let stage = TraceStage::unchecked(&topo).with_version(optimizer.version_handle());
            Self {
                topo,
                stage,
                optimizer,
                channel: ScriptedChannel::new(rank),
                state: NoFlushState::new(),
            }
        }

        fn call(
            &mut self,
            schedule: &ScheduleNoFlush,
            first: bool,
            last: bool,
        ) -> Result<PipelineOutput<usize>> {
            let mut log = TelemetryLog::new();
            self.call_logged(schedule, first, last, &mut log)
        }

        fn call_logged(
            &mut self,
            schedule: &ScheduleNoFlush,
            first: bool,
            last: bool,
            telemetry: &mut dyn Telemetry,
        ) -> Result<PipelineOutput<usize>> {
            let mut ctx = PipelineContext::new(
                &mut self.stage,
                &mut self.optimizer,
                &mut self.channel,
                &self.topo,
                telemetry,
            );
            schedule.run(&mut ctx, &mut self.state, first, last)
        }
    }

    #[test]
    fn test_single_call_drains() {
        let schedule = ScheduleNoFlush::new(3).unwrap();
        for rank in 0..4 {
            let mut h = Harness::new(4, rank);
            let out = h.call(&schedule, true, true).unwrap();
            assert_eq!(out.num_forward, 3);
            assert_eq!(out.num_backward, 3);
            assert!(h.state.is_drained(), "rank {rank}");
        }
    }

    #[test]
    fn test_state_carried_between_calls() {
        let schedule = ScheduleNoFlush::new(6).unwrap();
        let mut h = Harness::new(4, 1);

        let first = h.call(&schedule, true, false).unwrap();
        assert_eq!(first.num_forward, 8);
        assert_eq!(first.num_backward, 6);
        assert_eq!(h.state.in_flight(), 2);
        assert_eq!(h.state.pending_inputs(), 3);

        let middle = h.call(&schedule, false, false).unwrap();
        assert_eq!(middle.num_forward, 6);
        assert_eq!(middle.num_backward, 6);
        assert_eq!(h.state.in_flight(), 2);

        let last = h.call(&schedule, false, true).unwrap();
        assert_eq!(last.num_forward, 4);
        assert_eq!(last.num_backward, 6);
        assert!(h.state.is_drained());
    }

    #[test]
    fn test_version_switching() {
        let schedule = ScheduleNoFlush::new(5).unwrap();
        let mut h = Harness::new(3, 0);
        h.call(&schedule, true, false).unwrap();
        h.stage.clear_events();
        h.call(&schedule, false, false).unwrap();

        // base warm-up on rank 0 of 3 is 2: three forwards on the older
        // weights, then two on the newer ones
        let forward_versions: Vec<_> = h
            .stage
            .events()
            .iter()
            .filter(|e| e.is_forward())
            .map(|e| e.version)
            .collect();
        let older = Some(WeightVersion::Older);
        let newer = Some(WeightVersion::Newer);
        assert_eq!(forward_versions, vec![older, older, older, newer, newer]);
        assert!(h
            .stage
            .events()
            .iter()
            .filter(|e| !e.is_forward())
            .all(|e| e.version == older));
    }

    #[test]
    fn test_first_call_needs_drained_state() {
        let schedule = ScheduleNoFlush::new(4).unwrap();
        let mut h = Harness::new(2, 0);
        h.call(&schedule, true, false).unwrap();
        assert!(matches!(
            h.call(&schedule, true, false),
            Err(Error::SchedulerError { .. })
        ));
    }

    #[test]
    fn test_continuation_needs_carried_state() {
        let schedule = ScheduleNoFlush::new(4).unwrap();
        let mut h = Harness::new(2, 0);
        assert!(matches!(
            h.call(&schedule, false, true),
            Err(Error::SchedulerError { .. })
        ));
    }

    #[test]
    fn test_rejects_too_few_microbatches_across_calls() {
        let schedule = ScheduleNoFlush::new(2).unwrap();
        let mut h = Harness::new(4, 0);
        assert!(matches!(
            h.call(&schedule, true, false),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_stall_barrier_follows_last_warmup_send() {
        // fewer micro-batches than ranks in a single call: warm-up is 1, 1, 1, 0
        // for m = 1 and 2, 2, 1, 0 for m = 2
        for m in [1, 2] {
            let schedule = ScheduleNoFlush::new(m).unwrap();
            for rank in 0..4 {
                let mut h = Harness::new(4, rank);
                let base_warmup = schedule.plan(&h.topo, true, true).unwrap().base_warmup;
                let mut log = TelemetryLog::new();
                let out = h.call_logged(&schedule, true, true, &mut log).unwrap();
                assert_eq!(out.num_backward, m);
                assert_eq!(log.num_barriers(), 1, "m={m} rank {rank}");
                assert_eq!(
                    log.count_before_barrier(timer::FORWARD_SEND),
                    Some(base_warmup),
                    "m={m} rank {rank}"
                );
            }
        }
    }

    #[test]
    fn test_stall_barrier_only_on_first_call() {
        let schedule = ScheduleNoFlush::new(4).unwrap();
        let mut h = Harness::new(2, 0);
        let mut log = TelemetryLog::new();
        h.call_logged(&schedule, true, false, &mut log).unwrap();
        h.call_logged(&schedule, false, false, &mut log).unwrap();
        h.call_logged(&schedule, false, true, &mut log).unwrap();
        assert_eq!(log.num_barriers(), 1);
    }
}
