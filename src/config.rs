//! Schedule configuration

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which pipeline schedule to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Single-chunk one-forward-one-backward.
    #[default]
    #[serde(rename = "1f1b")]
    OneFOneB,
    /// 1F1B over several virtual chunks per rank.
    Interleaved,
    /// Continuous 1F1B without a flush between optimizer steps.
    NoFlush,
    /// All forwards, then all backwards.
    Gpipe,
}

/// Schedule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub kind: ScheduleKind,
    /// Micro-batches per optimizer step (per chunk when interleaving).
    pub num_microbatches: usize,
    /// Virtual chunks per rank. Only the interleaved schedule accepts > 1.
    pub num_model_chunks: usize,
    /// Skip every backward pass (evaluation).
    pub forward_only: bool,
    /// Rendezvous all ranks once per step, around the end of warm-up, so the
    /// stall timer measures pipeline bubble. Single-chunk schedules only;
    /// every rank of a pipeline must use the same value.
    pub stall_barrier: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            kind: ScheduleKind::OneFOneB,
            num_microbatches: 1,
            num_model_chunks: 1,
            forward_only: false,
            stall_barrier: true,
        }
    }
}

impl ScheduleConfig {
    pub fn with_kind(mut self, kind: ScheduleKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_num_microbatches(mut self, num_microbatches: usize) -> Self {
        self.num_microbatches = num_microbatches;
        self
    }

    pub fn with_num_model_chunks(mut self, num_model_chunks: usize) -> Self {
        self.num_model_chunks = num_model_chunks;
        self
    }

    pub fn with_forward_only(mut self, forward_only: bool) -> Self {
        self.forward_only = forward_only;
        self
    }

    pub fn with_stall_barrier(mut self, stall_barrier: bool) -> Self {
        self.stall_barrier = stall_barrier;
        self
    }

    /// Check the settings that do not depend on the pipeline topology.
    pub fn validate(&self) -> Result<()> {
        if self.num_microbatches == 0 {
            return Err(Error::InvalidArgument {
                arg: "num_microbatches",
                reason: "num_microbatches must be > 0".to_string(),
            });
        }
        if self.num_model_chunks == 0 {
            return Err(Error::InvalidArgument {
                arg: "num_model_chunks",
                reason: "num_model_chunks must be > 0".to_string(),
            });
        }
        if self.num_model_chunks > 1 && self.kind != ScheduleKind::Interleaved {
            return Err(Error::InvalidArgument {
                arg: "num_model_chunks",
                reason: format!(
                    "{:?} schedule runs a single model chunk, got {}",
                    self.kind, self.num_model_chunks
                ),
            });
        }
        if self.forward_only && self.kind == ScheduleKind::NoFlush {
            return Err(Error::InvalidArgument {
                arg: "forward_only",
                reason: "the non-flushing schedule always trains".to_string(),
            });
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    ///
    /// ```toml
    /// kind = "interleaved"
    /// num_microbatches = 8
    /// num_model_chunks = 2
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s).map_err(|e| Error::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}
