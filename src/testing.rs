//! Test doubles for driving schedules without a model or a network.
//!
//! [`TraceStage`] tags every activation and gradient it produces with its
//! origin (rank, chunk, per-chunk sequence number). In checked mode it also
//! verifies that every input and gradient it receives came from the right
//! neighbour in the right order, which turns any pairing or routing mistake
//! in a schedule into an error.

use std::cell::Cell;
use std::ops::Mul;
use std::rc::Rc;

use crate::distributed::pipeline::{
    Exchange, P2pChannel, PipelineOptimizer, Received, StageCompute, StageOutput, Telemetry,
    Topology,
};
use crate::error::{Error, Result};

/// Slot type of [`TraceStage`].
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Forward output of `seq`-th micro-batch of `chunk` on `rank`.
    Act { rank: usize, chunk: usize, seq: usize },
    /// Input gradient produced by `rank`'s backward of that micro-batch.
    Grad { rank: usize, chunk: usize, seq: usize },
    Loss(f64),
}

impl Packet {
    pub fn act(rank: usize, chunk: usize, seq: usize) -> Self {
        Self::Act { rank, chunk, seq }
    }

    pub fn grad(rank: usize, chunk: usize, seq: usize) -> Self {
        Self::Grad { rank, chunk, seq }
    }
}

impl Mul<f64> for Packet {
    type Output = Packet;

    fn mul(self, rhs: f64) -> Packet {
        match self {
            Packet::Loss(v) => Packet::Loss(v * rhs),
            other => other,
        }
    }
}

/// Weight version an optimizer currently exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightVersion {
    Older,
    Newer,
}

/// One forward or backward pass observed by [`TraceStage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageEvent {
    pub forward: bool,
    pub chunk: usize,
    pub seq: usize,
    /// Weights in use, when the stage tracks them.
    pub version: Option<WeightVersion>,
}

impl StageEvent {
    pub fn forward(chunk: usize, seq: usize) -> Self {
        Self {
            forward: true,
            chunk,
            seq,
            version: None,
        }
    }

    pub fn backward(chunk: usize, seq: usize) -> Self {
        Self {
            forward: false,
            chunk,
            seq,
            version: None,
        }
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }
}

/// [`StageCompute`] that records and checks the flow of micro-batches.
#[derive(Debug)]
pub struct TraceStage {
    rank: usize,
    world_size: usize,
    num_chunks: usize,
    checked: bool,
    forwards: Vec<usize>,
    backwards: Vec<usize>,
    events: Vec<StageEvent>,
    version: Option<Rc<Cell<WeightVersion>>>,
}

impl TraceStage {
    /// Stage that rejects misrouted or reordered inputs and gradients.
    pub fn new(topology: &dyn Topology) -> Self {
        let num_chunks = topology.num_model_chunks();
        Self {
            rank: topology.rank(),
            world_size: topology.world_size(),
            num_chunks,
            checked: true,
            forwards: vec![0; num_chunks],
            backwards: vec![0; num_chunks],
            events: Vec::new(),
            version: None,
        }
    }

    /// Stage that accepts anything, for fabricated channels.
    pub fn unchecked(topology: &dyn Topology) -> Self {
        Self {
            checked: false,
            ..Self::new(topology)
        }
    }

    /// Record the weight version shared with an optimizer.
    pub fn with_version(mut self, version: Rc<Cell<WeightVersion>>) -> Self {
        self.version = Some(version);
        self
    }

    pub fn events(&self) -> &[StageEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn num_forward(&self, chunk: usize) -> usize {
        self.forwards.get(chunk).copied().unwrap_or(0)
    }

    pub fn num_backward(&self, chunk: usize) -> usize {
        self.backwards.get(chunk).copied().unwrap_or(0)
    }

    fn is_first(&self, chunk: usize) -> bool {
        self.rank == 0 && chunk == 0
    }

    fn is_last(&self, chunk: usize) -> bool {
        self.rank + 1 == self.world_size && chunk + 1 == self.num_chunks
    }

    /// Where activations for `chunk` come from.
    fn upstream(&self, chunk: usize) -> (usize, usize) {
        if self.rank > 0 {
            (self.rank - 1, chunk)
        } else {
            (self.world_size - 1, chunk.wrapping_sub(1))
        }
    }

    /// Where gradients for `chunk` come from.
    fn downstream(&self, chunk: usize) -> (usize, usize) {
        if self.rank + 1 < self.world_size {
            (self.rank + 1, chunk)
        } else {
            (0, chunk + 1)
        }
    }

    fn check_chunk(&self, chunk: usize) -> Result<()> {
        if chunk >= self.num_chunks {
            return Err(Error::TrainingError {
                reason: format!("chunk {chunk} out of range ({} chunks)", self.num_chunks),
            });
        }
        Ok(())
    }

    fn mismatch(
        &self,
        what: &str,
        chunk: usize,
        expected: Option<Packet>,
        got: &Option<Packet>,
    ) -> Error {
        Error::TrainingError {
            reason: format!(
                "rank {} chunk {chunk}: {what} expected {expected:?}, got {got:?}",
                self.rank
            ),
        }
    }

    fn record(&mut self, forward: bool, chunk: usize, seq: usize) {
        self.events.push(StageEvent {
            forward,
            chunk,
            seq,
            version: self.version.as_ref().map(|v| v.get()),
        });
    }
}

impl StageCompute for TraceStage {
    type Slot = Packet;
    type Metrics = usize;

    fn forward(
        &mut self,
        chunk: usize,
        input: Option<Packet>,
    ) -> Result<StageOutput<Packet, usize>> {
        self.check_chunk(chunk)?;
        let seq = self.forwards[chunk];

        if self.checked {
            let expected = if self.is_first(chunk) {
                None
            } else {
                let (rank, up_chunk) = self.upstream(chunk);
                Some(Packet::act(rank, up_chunk, seq))
            };
            if input != expected {
                return Err(self.mismatch("input", chunk, expected, &input));
            }
        }

        self.forwards[chunk] += 1;
        self.record(true, chunk, seq);

        if self.is_last(chunk) {
            Ok(StageOutput::Loss {
                loss: Packet::Loss(1.0),
                metrics: seq,
            })
        } else {
            Ok(StageOutput::Activation(Packet::act(self.rank, chunk, seq)))
        }
    }

    fn average_loss(&mut self, loss: Packet, num_microbatches: usize) -> Result<Packet> {
        match loss {
            Packet::Loss(v) => Ok(Packet::Loss(v / num_microbatches as f64)),
            other => Err(Error::TrainingError {
                reason: format!("average_loss on non-loss {other:?}"),
            }),
        }
    }

    fn backward(
        &mut self,
        chunk: usize,
        input: Option<Packet>,
        output: Packet,
        output_grad: Option<Packet>,
    ) -> Result<Option<Packet>> {
        self.check_chunk(chunk)?;
        let expected_seq = self.backwards[chunk];
        let seq = match output {
            Packet::Act { seq, .. } => seq,
            _ => expected_seq,
        };

        if self.checked {
            let expected_output = if self.is_last(chunk) {
                None
            } else {
                Some(Packet::act(self.rank, chunk, expected_seq))
            };
            let got_output = match &output {
                Packet::Loss(_) => None,
                other => Some(other.clone()),
            };
            if got_output != expected_output {
                return Err(self.mismatch("output", chunk, expected_output, &got_output));
            }

            let expected_grad = if self.is_last(chunk) {
                None
            } else {
                let (rank, down_chunk) = self.downstream(chunk);
                Some(Packet::grad(rank, down_chunk, expected_seq))
            };
            if output_grad != expected_grad {
                return Err(self.mismatch("output gradient", chunk, expected_grad, &output_grad));
            }

            let expected_input = if self.is_first(chunk) {
                None
            } else {
                let (rank, up_chunk) = self.upstream(chunk);
                Some(Packet::act(rank, up_chunk, expected_seq))
            };
            if input != expected_input {
                return Err(self.mismatch("saved input", chunk, expected_input, &input));
            }
        }

        self.backwards[chunk] += 1;
        self.record(false, chunk, seq);

        if self.is_first(chunk) {
            Ok(None)
        } else {
            Ok(Some(Packet::grad(self.rank, chunk, seq)))
        }
    }
}

/// Flags of one recorded exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeRecord {
    pub send_next: bool,
    pub send_prev: bool,
    pub recv_prev: bool,
    pub recv_next: bool,
    pub ring_exchange: bool,
}

/// [`P2pChannel`] that records every exchange and answers each receive with
/// a fabricated packet. Pair it with [`TraceStage::unchecked`].
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    rank: usize,
    exchanges: Vec<ExchangeRecord>,
}

impl ScriptedChannel {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            exchanges: Vec::new(),
        }
    }

    pub fn exchanges(&self) -> &[ExchangeRecord] {
        &self.exchanges
    }

    fn count(&self, f: impl Fn(&ExchangeRecord) -> bool) -> usize {
        self.exchanges.iter().filter(|e| f(e)).count()
    }

    pub fn num_sends_next(&self) -> usize {
        self.count(|e| e.send_next)
    }

    pub fn num_sends_prev(&self) -> usize {
        self.count(|e| e.send_prev)
    }

    pub fn num_recvs_prev(&self) -> usize {
        self.count(|e| e.recv_prev)
    }

    pub fn num_recvs_next(&self) -> usize {
        self.count(|e| e.recv_next)
    }
}

impl P2pChannel<Packet> for ScriptedChannel {
    fn communicate(&mut self, exchange: Exchange<Packet>) -> Result<Received<Packet>> {
        let seq = self.exchanges.len();
        self.exchanges.push(ExchangeRecord {
            send_next: exchange.send_next.is_some(),
            send_prev: exchange.send_prev.is_some(),
            recv_prev: exchange.recv_prev,
            recv_next: exchange.recv_next,
            ring_exchange: exchange.ring_exchange,
        });
        Ok(Received {
            from_prev: exchange
                .recv_prev
                .then(|| Packet::act(self.rank, 0, seq)),
            from_next: exchange
                .recv_next
                .then(|| Packet::grad(self.rank, 0, seq)),
        })
    }
}

/// [`PipelineOptimizer`] that records loss scaling and version swaps.
#[derive(Debug)]
pub struct RecordingOptimizer {
    version: Rc<Cell<WeightVersion>>,
    swaps: Vec<WeightVersion>,
    scaled: usize,
}

impl Default for RecordingOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingOptimizer {
    pub fn new() -> Self {
        Self {
            version: Rc::new(Cell::new(WeightVersion::Newer)),
            swaps: Vec::new(),
            scaled: 0,
        }
    }

    /// Current version, shared with [`TraceStage::with_version`].
    pub fn version_handle(&self) -> Rc<Cell<WeightVersion>> {
        Rc::clone(&self.version)
    }

    pub fn swaps(&self) -> &[WeightVersion] {
        &self.swaps
    }

    pub fn num_scaled(&self) -> usize {
        self.scaled
    }

    fn swap(&mut self, version: WeightVersion) {
        self.version.set(version);
        self.swaps.push(version);
    }
}

impl PipelineOptimizer<Packet> for RecordingOptimizer {
    fn scale_loss(&mut self, loss: Packet) -> Result<Packet> {
        self.scaled += 1;
        Ok(loss)
    }

    fn swap_to_older_version(&mut self) -> Result<()> {
        self.swap(WeightVersion::Older);
        Ok(())
    }

    fn swap_to_newer_version(&mut self) -> Result<()> {
        self.swap(WeightVersion::Newer);
        Ok(())
    }
}

/// [`Telemetry`] that logs timer starts and barriers in call order.
#[derive(Debug, Default)]
pub struct TelemetryLog {
    entries: Vec<String>,
}

impl TelemetryLog {
    /// Entry recorded for every barrier.
    pub const BARRIER: &'static str = "barrier";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Number of barriers seen so far.
    pub fn num_barriers(&self) -> usize {
        self.entries.iter().filter(|e| *e == Self::BARRIER).count()
    }

    /// How often timer `name` started before the first barrier, or `None`
    /// when no barrier was issued.
    pub fn count_before_barrier(&self, name: &str) -> Option<usize> {
        let barrier = self.entries.iter().position(|e| e == Self::BARRIER)?;
        Some(self.entries[..barrier].iter().filter(|e| *e == name).count())
    }
}

impl Telemetry for TelemetryLog {
    fn start(&mut self, name: &str) {
        self.entries.push(name.to_string());
    }

    fn barrier(&mut self) -> Result<()> {
        self.entries.push(Self::BARRIER.to_string());
        Ok(())
    }
}
