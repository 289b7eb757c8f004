//! Pipeline-parallel training schedules.
//!
//! - [`Schedule1F1B`]: one-forward-one-backward over a single model chunk
//!   (GPipe as a flag).
//! - [`ScheduleInterleaved1F1B`]: 1F1B over several virtual chunks per rank.
//! - [`ScheduleNoFlush`]: 1F1B that keeps the pipeline full across
//!   optimizer steps, with the in-flight micro-batches in [`NoFlushState`].
//!
//! A schedule only orders work. Compute, loss scaling, transport and timing
//! come from the collaborators bundled in a [`PipelineContext`].

pub mod clock;
pub mod comm;
pub mod local;
pub mod phase;
pub mod queue;
pub mod schedule;
pub mod schedule_1f1b;
pub mod schedule_interleaved;
pub mod schedule_no_flush;
pub mod stage;
pub mod step;
pub mod telemetry;
pub mod topology;

pub use clock::{
    plan_1f1b, plan_interleaved, plan_no_flush, ChunkMap, NoFlushPlan, PipelineAction,
    PipelineClock, SchedulePlan,
};
pub use comm::{Exchange, P2pChannel, Received, StageComm};
pub use local::{ChannelStats, LocalEndpoint, LocalRing};
pub use phase::{PhaseMachine, PhaseStep, SchedulePhase};
pub use queue::{ChunkQueues, PendingBackward, QueueSet};
pub use schedule::PipelineSchedule;
pub use schedule_1f1b::Schedule1F1B;
pub use schedule_interleaved::ScheduleInterleaved1F1B;
pub use schedule_no_flush::{NoFlushState, ScheduleNoFlush};
pub use stage::{NoLossScaling, PipelineOptimizer, StageCompute, StageOutput, StaticLossScale};
pub use step::{PipelineContext, PipelineOutput};
pub use telemetry::{timer, NoopTelemetry, StallBarrier, Telemetry, TimerStats, Timers};
pub use topology::{PipelineTopology, StagePosition, Topology};
