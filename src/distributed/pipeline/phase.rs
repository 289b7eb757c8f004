//! Phase state machine driving every scheduler loop.

use super::clock::SchedulePlan;

/// Phase of a schedule run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulePhase {
    Warmup,
    Steady,
    Cooldown,
    Done,
}

/// One step of a schedule run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStep {
    pub phase: SchedulePhase,
    /// Index within the phase.
    pub index: usize,
    /// Last step of this phase.
    pub is_last: bool,
}

/// Iterates the steps of a [`SchedulePlan`] phase by phase.
///
/// Empty phases are skipped; `Done` is never yielded, it is the state the
/// machine rests in once exhausted.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: SchedulePhase,
    index: usize,
    num_warmup: usize,
    num_steady: usize,
    num_cooldown: usize,
}

impl PhaseMachine {
    pub fn new(plan: &SchedulePlan) -> Self {
        let mut machine = Self {
            phase: SchedulePhase::Warmup,
            index: 0,
            num_warmup: plan.num_warmup,
            num_steady: plan.num_steady,
            num_cooldown: plan.num_cooldown,
        };
        machine.skip_empty();
        machine
    }

    /// Phase of the next step to be yielded.
    pub fn phase(&self) -> SchedulePhase {
        self.phase
    }

    fn len_of(&self, phase: SchedulePhase) -> usize {
        match phase {
            SchedulePhase::Warmup => self.num_warmup,
            SchedulePhase::Steady => self.num_steady,
            SchedulePhase::Cooldown => self.num_cooldown,
            SchedulePhase::Done => usize::MAX,
        }
    }

    fn skip_empty(&mut self) {
        while self.index >= self.len_of(self.phase) {
            self.phase = match self.phase {
                SchedulePhase::Warmup => SchedulePhase::Steady,
                SchedulePhase::Steady => SchedulePhase::Cooldown,
                SchedulePhase::Cooldown | SchedulePhase::Done => SchedulePhase::Done,
            };
            self.index = 0;
        }
    }
}

impl Iterator for PhaseMachine {
    type Item = PhaseStep;

    fn next(&mut self) -> Option<PhaseStep> {
        if self.phase == SchedulePhase::Done {
            return None;
        }
        let len = self.len_of(self.phase);
        let step = PhaseStep {
            phase: self.phase,
            index: self.index,
            is_last: self.index + 1 == len,
        };
        self.index += 1;
        self.skip_empty();
        Some(step)
    }
}

impl SchedulePlan {
    /// Step iterator over this plan.
    pub fn phases(&self) -> PhaseMachine {
        PhaseMachine::new(self)
    }
}
