//! Per-micro-batch forward/backward steps shared by all schedules.

use crate::error::{Error, Result};

use super::comm::{P2pChannel, StageComm};
use super::queue::PendingBackward;
use super::stage::{PipelineOptimizer, StageCompute, StageOutput};
use super::telemetry::{timer, Telemetry};
use super::topology::Topology;

/// Collaborators a schedule run drives.
pub struct PipelineContext<'a, S: StageCompute> {
    pub stage: &'a mut S,
    pub optimizer: &'a mut dyn PipelineOptimizer<S::Slot>,
    pub channel: &'a mut dyn P2pChannel<S::Slot>,
    pub topology: &'a dyn Topology,
    pub telemetry: &'a mut dyn Telemetry,
}

impl<'a, S: StageCompute> PipelineContext<'a, S> {
    pub fn new(
        stage: &'a mut S,
        optimizer: &'a mut dyn PipelineOptimizer<S::Slot>,
        channel: &'a mut dyn P2pChannel<S::Slot>,
        topology: &'a dyn Topology,
        telemetry: &'a mut dyn Telemetry,
    ) -> Self {
        Self {
            stage,
            optimizer,
            channel,
            topology,
            telemetry,
        }
    }

    /// Named p2p operations over this context's channel.
    pub fn comm(&mut self) -> StageComm<'_, S::Slot> {
        StageComm::new(&mut *self.channel, &mut *self.telemetry)
    }
}

/// Result of one schedule call.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput<M> {
    /// Per-micro-batch metrics in forward order. Empty except on the last
    /// stage.
    pub losses: Vec<M>,
    /// Forward steps executed.
    pub num_forward: usize,
    /// Backward steps executed.
    pub num_backward: usize,
}

impl<M> Default for PipelineOutput<M> {
    fn default() -> Self {
        Self {
            losses: Vec::new(),
            num_forward: 0,
            num_backward: 0,
        }
    }
}

impl<M> PipelineOutput<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Run forward on `chunk`.
///
/// On the last virtual stage the loss is averaged over `num_microbatches`,
/// its metrics are appended to `out.losses`, and the averaged loss is
/// returned in place of an activation.
pub(crate) fn forward_step<S: StageCompute>(
    ctx: &mut PipelineContext<'_, S>,
    chunk: usize,
    input: Option<S::Slot>,
    num_microbatches: usize,
    out: &mut PipelineOutput<S::Metrics>,
) -> Result<S::Slot> {
    let is_last = ctx.topology.is_last_stage(Some(chunk));

    ctx.telemetry.start(timer::FORWARD_COMPUTE);
    let produced = ctx.stage.forward(chunk, input);
    ctx.telemetry.stop(timer::FORWARD_COMPUTE);
    out.num_forward += 1;

    match (produced?, is_last) {
        (StageOutput::Activation(activation), false) => Ok(activation),
        (StageOutput::Loss { loss, metrics }, true) => {
            let loss = ctx.stage.average_loss(loss, num_microbatches)?;
            out.losses.push(metrics);
            Ok(loss)
        }
        (StageOutput::Activation(_), true) => Err(Error::SchedulerError {
            reason: format!("chunk {chunk} is the last stage but forward returned an activation"),
        }),
        (StageOutput::Loss { .. }, false) => Err(Error::SchedulerError {
            reason: format!("chunk {chunk} returned a loss but is not the last stage"),
        }),
    }
}

/// Run backward on `chunk` for the oldest pending micro-batch.
///
/// Without a downstream gradient the output is the loss, which goes through
/// the optimizer's loss scaling first.
pub(crate) fn backward_step<S: StageCompute>(
    ctx: &mut PipelineContext<'_, S>,
    chunk: usize,
    pending: PendingBackward<S::Slot>,
    out: &mut PipelineOutput<S::Metrics>,
) -> Result<Option<S::Slot>> {
    let PendingBackward {
        input,
        output,
        output_grad,
    } = pending;

    ctx.telemetry.start(timer::BACKWARD_COMPUTE);
    let output = if output_grad.is_some() {
        Ok(output)
    } else {
        ctx.optimizer.scale_loss(output)
    };
    let input_grad =
        output.and_then(|output| ctx.stage.backward(chunk, input, output, output_grad));
    ctx.telemetry.stop(timer::BACKWARD_COMPUTE);
    out.num_backward += 1;
    input_grad
}

/// Rendezvous with every pipeline rank so the time spent waiting shows up
/// as pipeline stall.
pub(crate) fn pipeline_stall<S: StageCompute>(ctx: &mut PipelineContext<'_, S>) -> Result<()> {
    tracing::trace!(rank = ctx.topology.rank(), "forward pipeline stall barrier");
    ctx.telemetry.start(timer::FORWARD_PIPELINE_STALL);
    let waited = ctx.telemetry.barrier();
    ctx.telemetry.stop(timer::FORWARD_PIPELINE_STALL);
    waited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::pipeline::stage::NoLossScaling;
    use crate::distributed::pipeline::telemetry::{NoopTelemetry, Timers};
    use crate::distributed::pipeline::topology::PipelineTopology;
    use crate::testing::{Packet, RecordingOptimizer, ScriptedChannel, TraceStage};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_forward_on_last_stage_averages_loss() {
        let topo = PipelineTopology::flat(2, 1).unwrap();
        let mut stage = TraceStage::unchecked(&topo);
        let mut opt = NoLossScaling;
        let mut channel = ScriptedChannel::new(1);
        let mut telemetry = NoopTelemetry;
        let mut ctx =
            PipelineContext::new(&mut stage, &mut opt, &mut channel, &topo, &mut telemetry);
        let mut out = PipelineOutput::new();

        let loss = forward_step(&mut ctx, 0, Some(Packet::act(0, 0, 0)), 4, &mut out).unwrap();
        assert_eq!(loss, Packet::Loss(0.25));
        assert_eq!(out.losses.len(), 1);
        assert_eq!(out.num_forward, 1);
    }

    #[test]
    fn test_forward_rejects_misplaced_loss() {
        let topo = PipelineTopology::flat(2, 0).unwrap();
        // stage believes it is the last rank, topology does not
        let mut stage = TraceStage::unchecked(&PipelineTopology::flat(2, 1).unwrap());
        let mut opt = NoLossScaling;
        let mut channel = ScriptedChannel::new(0);
        let mut telemetry = NoopTelemetry;
        let mut ctx =
            PipelineContext::new(&mut stage, &mut opt, &mut channel, &topo, &mut telemetry);
        let mut out = PipelineOutput::new();

        let err = forward_step(&mut ctx, 0, None, 1, &mut out).unwrap_err();
        assert!(matches!(err, Error::SchedulerError { .. }));
    }

    #[test]
    fn test_backward_scales_loss_only_without_grad() {
        let topo = PipelineTopology::flat(2, 1).unwrap();
        let mut stage = TraceStage::unchecked(&topo);
        let mut opt = RecordingOptimizer::new();
        let mut channel = ScriptedChannel::new(1);
        let mut timers = Timers::new();
        let mut out = PipelineOutput::new();
        {
            let mut ctx =
                PipelineContext::new(&mut stage, &mut opt, &mut channel, &topo, &mut timers);
            let pending = PendingBackward {
                input: Some(Packet::act(0, 0, 0)),
                output: Packet::Loss(1.0),
                output_grad: None,
            };
            let grad = backward_step(&mut ctx, 0, pending, &mut out).unwrap();
            assert_eq!(grad, Some(Packet::grad(1, 0, 0)));
        }
        assert_eq!(opt.num_scaled(), 1);
        assert_eq!(out.num_backward, 1);
        assert_eq!(timers.get(timer::BACKWARD_COMPUTE).map(|s| s.count), Some(1));
    }

    #[test]
    fn test_stall_records_timer() {
        let topo = PipelineTopology::flat(1, 0).unwrap();
        let mut stage = TraceStage::unchecked(&topo);
        let mut opt = NoLossScaling;
        let mut channel = ScriptedChannel::new(0);
        let mut timers = Timers::new();
        {
            let mut ctx =
                PipelineContext::new(&mut stage, &mut opt, &mut channel, &topo, &mut timers);
            pipeline_stall(&mut ctx).unwrap();
        }
        assert!(timers.get(timer::FORWARD_PIPELINE_STALL).is_some());
    }

    #[derive(Debug, Clone, Default)]
    struct CallLog(Rc<RefCell<Vec<String>>>);

    impl CallLog {
        fn push(&self, entry: String) {
            self.0.borrow_mut().push(entry);
        }
    }

    impl Telemetry for CallLog {
        fn start(&mut self, name: &str) {
            self.push(format!("start {name}"));
        }

        fn stop(&mut self, name: &str) {
            self.push(format!("stop {name}"));
        }
    }

    impl PipelineOptimizer<Packet> for CallLog {
        fn scale_loss(&mut self, loss: Packet) -> Result<Packet> {
            self.push("scale_loss".to_string());
            Ok(loss)
        }
    }

    #[test]
    fn test_loss_scaling_counts_as_backward_compute() {
        let topo = PipelineTopology::flat(2, 1).unwrap();
        let mut stage = TraceStage::unchecked(&topo);
        let log = CallLog::default();
        let mut opt = log.clone();
        let mut telemetry = log.clone();
        let mut channel = ScriptedChannel::new(1);
        let mut out = PipelineOutput::<usize>::new();
        {
            let mut ctx =
                PipelineContext::new(&mut stage, &mut opt, &mut channel, &topo, &mut telemetry);
            let pending = PendingBackward {
                input: Some(Packet::act(0, 0, 0)),
                output: Packet::Loss(1.0),
                output_grad: None,
            };
            backward_step(&mut ctx, 0, pending, &mut out).unwrap();
        }
        assert_eq!(
            *log.0.borrow(),
            vec![
                format!("start {}", timer::BACKWARD_COMPUTE),
                "scale_loss".to_string(),
                format!("stop {}", timer::BACKWARD_COMPUTE),
            ]
        );
    }
}
