pub mod pipeline;

pub use pipeline::{
    NoFlushState, PipelineContext, PipelineOutput, PipelineSchedule, PipelineTopology,
    Schedule1F1B, ScheduleInterleaved1F1B, ScheduleNoFlush, Topology,
};
