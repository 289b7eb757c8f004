//! # pipesched
//!
//! **Pipeline-parallel training schedules: 1F1B, interleaved 1F1B and
//! non-flushing 1F1B.**
//!
//! A model is split into stages placed on the ranks of a pipeline. Every rank
//! runs the same schedule against its own stage; the schedule decides when to
//! run forward and backward for each micro-batch and which neighbour to
//! exchange activations and gradients with.
//!
//! ```text
//!            micro-batches ──►
//! rank 0   F0 F1 F2 F3 B0 F4 B1 F5 B2 B3 B4 B5
//! rank 1      F0 F1 F2 B0 F3 B1 F4 B2 F5 B3 B4 B5
//! rank 2         F0 F1 B0 F2 B1 F3 B2 F4 B3 F5 B4 B5
//! rank 3            F0 B0 F1 B1 F2 B2 F3 B3 F4 B4 F5 B5
//!          └warm-up┘└──────── steady 1F1B ─────┘└cool-down┘
//! ```
//!
//! ## Design
//!
//! - **Collaborator traits**: stage compute, optimizer hooks, transport,
//!   topology and telemetry are traits, so schedules run unchanged against
//!   real tensors or the in-process [`LocalRing`](distributed::pipeline::LocalRing).
//! - **Explicit chunk**: virtual chunk selection is an argument everywhere,
//!   never hidden mutable state.
//! - **Phase machine**: every schedule walks warm-up → steady → cool-down
//!   from a [`SchedulePlan`](distributed::pipeline::SchedulePlan) computed per
//!   call.

pub mod config;
pub mod distributed;
pub mod error;
pub mod testing;

pub use config::{ScheduleConfig, ScheduleKind};
pub use distributed::pipeline::{
    LocalRing, NoFlushState, PipelineContext, PipelineOptimizer, PipelineOutput,
    PipelineSchedule, PipelineTopology, Schedule1F1B, ScheduleInterleaved1F1B, ScheduleNoFlush,
    StageCompute, StageOutput, Topology,
};
pub use error::{Error, Result};
