//! Schedule selection from a [`ScheduleConfig`].

use crate::config::{ScheduleConfig, ScheduleKind};
use crate::error::{Error, Result};

use super::schedule_1f1b::Schedule1F1B;
use super::schedule_interleaved::ScheduleInterleaved1F1B;
use super::schedule_no_flush::{NoFlushState, ScheduleNoFlush};
use super::stage::StageCompute;
use super::step::{PipelineContext, PipelineOutput};

/// Any of the pipeline schedules, built from configuration.
#[derive(Debug, Clone)]
pub enum PipelineSchedule {
    OneFOneB(Schedule1F1B),
    Interleaved(ScheduleInterleaved1F1B),
    NoFlush(ScheduleNoFlush),
}

impl PipelineSchedule {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        config.validate()?;
        let m = config.num_microbatches;
        let schedule = match config.kind {
            ScheduleKind::OneFOneB | ScheduleKind::Gpipe => Self::OneFOneB(
                Schedule1F1B::new(m)?
                    .with_forward_only(config.forward_only)
                    .with_gpipe(config.kind == ScheduleKind::Gpipe)
                    .with_stall_barriers(config.stall_barrier),
            ),
            ScheduleKind::Interleaved => Self::Interleaved(
                ScheduleInterleaved1F1B::new(m)?
                    .with_forward_only(config.forward_only)
                    .with_stall_barriers(config.stall_barrier),
            ),
            ScheduleKind::NoFlush => {
                Self::NoFlush(ScheduleNoFlush::new(m)?.with_stall_barriers(config.stall_barrier))
            }
        };
        Ok(schedule)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::OneFOneB(_) => "1f1b",
            Self::Interleaved(_) => "interleaved",
            Self::NoFlush(_) => "no_flush",
        }
    }

    /// Run a flushing schedule for one optimizer step.
    ///
    /// The non-flushing schedule carries state between calls and must go
    /// through [`run_no_flush`](Self::run_no_flush).
    pub fn run<S: StageCompute>(
        &self,
        ctx: &mut PipelineContext<'_, S>,
    ) -> Result<PipelineOutput<S::Metrics>> {
        match self {
            Self::OneFOneB(schedule) => schedule.run(ctx),
            Self::Interleaved(schedule) => schedule.run(ctx),
            Self::NoFlush(_) => Err(Error::InvalidArgument {
                arg: "state",
                reason: "non-flushing schedule needs a NoFlushState, use run_no_flush".to_string(),
            }),
        }
    }

    /// Run one call of the non-flushing schedule. Flushing schedules ignore
    /// `state` and the iteration flags.
    pub fn run_no_flush<S: StageCompute>(
        &self,
        ctx: &mut PipelineContext<'_, S>,
        state: &mut NoFlushState<S::Slot>,
        first_iteration: bool,
        last_iteration: bool,
    ) -> Result<PipelineOutput<S::Metrics>> {
        match self {
            Self::NoFlush(schedule) => schedule.run(ctx, state, first_iteration, last_iteration),
            _ => self.run(ctx),
        }
    }
}
