//! Stage compute and optimizer hooks a scheduler drives.
//!
//! - [`StageCompute`]: forward/backward for one virtual chunk of this rank.
//! - [`PipelineOptimizer`]: loss scaling and weight-version switching.
//! - [`NoLossScaling`] / [`StaticLossScale`]: ready-made optimizers for the
//!   common cases.
//!
//! The slot type is opaque to the scheduler. It only moves slots between
//! queues, the channel and these hooks, and clones an output once when it
//! must both keep it for backward and send it downstream.

use crate::error::Result;

/// What one forward step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput<T, M> {
    /// Activation for the next stage. Any stage but the last.
    Activation(T),
    /// Loss of the micro-batch. Only the last virtual stage.
    Loss {
        /// Un-averaged loss.
        loss: T,
        /// Reduced per-micro-batch metrics reported back to the caller.
        metrics: M,
    },
}

/// Forward/backward compute of this rank's model chunks.
pub trait StageCompute {
    /// Activation / gradient handle.
    type Slot: Clone;
    /// Per-micro-batch metrics returned with the loss.
    type Metrics;

    /// Forward pass of one micro-batch on `chunk`.
    ///
    /// `input` is `None` on the first virtual stage, where the stage pulls its
    /// own data.
    fn forward(
        &mut self,
        chunk: usize,
        input: Option<Self::Slot>,
    ) -> Result<StageOutput<Self::Slot, Self::Metrics>>;

    /// Divide `loss` by the number of micro-batches so gradients accumulate
    /// to a batch mean.
    fn average_loss(&mut self, loss: Self::Slot, num_microbatches: usize) -> Result<Self::Slot>;

    /// Backward pass of one micro-batch on `chunk`.
    ///
    /// `output_grad` is `None` when `output` is the (scaled) loss. Returns the
    /// gradient with respect to `input`, or `None` when there is no input to
    /// differentiate (first virtual stage).
    fn backward(
        &mut self,
        chunk: usize,
        input: Option<Self::Slot>,
        output: Self::Slot,
        output_grad: Option<Self::Slot>,
    ) -> Result<Option<Self::Slot>>;
}

/// Optimizer hooks used while scheduling.
pub trait PipelineOptimizer<T> {
    /// Scale the loss before backward. Called only when backward starts from
    /// the loss itself.
    fn scale_loss(&mut self, loss: T) -> Result<T>;

    /// Make the weights of the previous update current.
    ///
    /// Used by the non-flushing schedule, which keeps two weight versions.
    fn swap_to_older_version(&mut self) -> Result<()> {
        Ok(())
    }

    /// Make the weights of the latest update current.
    fn swap_to_newer_version(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Leaves the loss untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLossScaling;

impl<T> PipelineOptimizer<T> for NoLossScaling {
    fn scale_loss(&mut self, loss: T) -> Result<T> {
        Ok(loss)
    }
}

/// Multiplies the loss by a constant factor.
#[derive(Debug, Clone, Copy)]
pub struct StaticLossScale {
    scale: f64,
}

impl StaticLossScale {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Default for StaticLossScale {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl<T> PipelineOptimizer<T> for StaticLossScale
where
    T: std::ops::Mul<f64, Output = T>,
{
    fn scale_loss(&mut self, loss: T) -> Result<T> {
        Ok(loss * self.scale)
    }
}
