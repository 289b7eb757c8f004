//! Per-chunk FIFO bookkeeping of in-flight micro-batches.
//!
//! Each virtual chunk keeps three queues:
//!
//! ```text
//! inputs        Option<T>   received activation (None on the first stage)
//! outputs       T           what forward produced
//! output_grads  Option<T>   gradient from downstream (None on the last stage)
//! ```
//!
//! Backward on chunk `c` always consumes the oldest entry of each queue of
//! `c`, which pairs it with the forward that ran first.

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Activations and gradients of one chunk awaiting backward.
#[derive(Debug, Clone)]
pub struct ChunkQueues<T> {
    inputs: VecDeque<Option<T>>,
    outputs: VecDeque<T>,
    output_grads: VecDeque<Option<T>>,
}

impl<T> Default for ChunkQueues<T> {
    fn default() -> Self {
        Self {
            inputs: VecDeque::new(),
            outputs: VecDeque::new(),
            output_grads: VecDeque::new(),
        }
    }
}

/// Entries popped for one backward step.
#[derive(Debug)]
pub struct PendingBackward<T> {
    pub input: Option<T>,
    pub output: T,
    pub output_grad: Option<T>,
}

fn empty(queue: &str) -> Error {
    Error::SchedulerError {
        reason: format!("{queue} queue empty when a backward step needed it"),
    }
}

impl<T> ChunkQueues<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_input(&mut self, input: Option<T>) {
        self.inputs.push_back(input);
    }

    pub fn push_output(&mut self, output: T) {
        self.outputs.push_back(output);
    }

    pub fn push_output_grad(&mut self, grad: Option<T>) {
        self.output_grads.push_back(grad);
    }

    /// Most recently received input, the one the next forward consumes.
    pub fn latest_input(&self) -> Result<&Option<T>> {
        self.inputs.back().ok_or_else(|| Error::SchedulerError {
            reason: "no input queued for forward step".to_string(),
        })
    }

    /// Oldest (input, output) pair.
    pub fn pop_activation(&mut self) -> Result<(Option<T>, T)> {
        let input = self.inputs.pop_front().ok_or_else(|| empty("input"))?;
        let output = self.outputs.pop_front().ok_or_else(|| empty("output"))?;
        Ok((input, output))
    }

    pub fn pop_output_grad(&mut self) -> Result<Option<T>> {
        self.output_grads
            .pop_front()
            .ok_or_else(|| empty("output gradient"))
    }

    /// Oldest (input, output, output_grad) triple.
    pub fn pop_backward(&mut self) -> Result<PendingBackward<T>> {
        let (input, output) = self.pop_activation()?;
        let output_grad = self.pop_output_grad()?;
        Ok(PendingBackward {
            input,
            output,
            output_grad,
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn num_output_grads(&self) -> usize {
        self.output_grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty() && self.output_grads.is_empty()
    }
}

/// One [`ChunkQueues`] per virtual chunk.
#[derive(Debug, Clone)]
pub struct QueueSet<T> {
    chunks: Vec<ChunkQueues<T>>,
}

impl<T> QueueSet<T> {
    pub fn new(num_model_chunks: usize) -> Self {
        Self {
            chunks: (0..num_model_chunks).map(|_| ChunkQueues::new()).collect(),
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk(&self, chunk: usize) -> Result<&ChunkQueues<T>> {
        let len = self.chunks.len();
        self.chunks.get(chunk).ok_or_else(|| Error::SchedulerError {
            reason: format!("chunk {chunk} out of range ({len} chunks)"),
        })
    }

    pub fn chunk_mut(&mut self, chunk: usize) -> Result<&mut ChunkQueues<T>> {
        let len = self.chunks.len();
        self.chunks
            .get_mut(chunk)
            .ok_or_else(|| Error::SchedulerError {
                reason: format!("chunk {chunk} out of range ({len} chunks)"),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(ChunkQueues::is_empty)
    }
}
