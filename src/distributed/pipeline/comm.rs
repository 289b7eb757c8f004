//! Point-to-point exchange between neighbouring pipeline stages.
//!
//! A transport implements one primitive, [`P2pChannel::communicate`], which
//! performs any combination of the four directed transfers of a stage:
//!
//! ```text
//!            recv_prev ──►  ┌───────┐  ──► send_next
//!   rank-1                  │ rank  │                  rank+1
//!            send_prev ◄──  └───────┘  ◄── recv_next
//! ```
//!
//! All sends and receives of one exchange are issued together, so two
//! neighbours sending to each other in the same exchange do not deadlock.
//!
//! [`StageComm`] layers the named operations of the schedules on top of it.
//! Those apply the pipeline boundary rules: nothing is received from before
//! the first stage or after the last one, and nothing is sent there.

use crate::error::{Error, Result};

use super::telemetry::{timer, Telemetry};
use super::topology::StagePosition;

/// One combined send/receive request.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange<T> {
    /// Activation for the next rank.
    pub send_next: Option<T>,
    /// Gradient for the previous rank.
    pub send_prev: Option<T>,
    /// Receive an activation from the previous rank.
    pub recv_prev: bool,
    /// Receive a gradient from the next rank.
    pub recv_next: bool,
    /// Neighbours wrap around (rank 0's previous is the last rank).
    pub ring_exchange: bool,
}

impl<T> Default for Exchange<T> {
    fn default() -> Self {
        Self {
            send_next: None,
            send_prev: None,
            recv_prev: false,
            recv_next: false,
            ring_exchange: false,
        }
    }
}

impl<T> Exchange<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_next(mut self, value: Option<T>) -> Self {
        self.send_next = value;
        self
    }

    pub fn send_prev(mut self, value: Option<T>) -> Self {
        self.send_prev = value;
        self
    }

    pub fn recv_prev(mut self, recv: bool) -> Self {
        self.recv_prev = recv;
        self
    }

    pub fn recv_next(mut self, recv: bool) -> Self {
        self.recv_next = recv;
        self
    }

    pub fn ring(mut self, ring_exchange: bool) -> Self {
        self.ring_exchange = ring_exchange;
        self
    }

    /// Nothing to send and nothing to receive.
    pub fn is_empty(&self) -> bool {
        self.send_next.is_none() && self.send_prev.is_none() && !self.recv_prev && !self.recv_next
    }
}

/// What an exchange received.
#[derive(Debug, Clone, PartialEq)]
pub struct Received<T> {
    /// Activation from the previous rank, if requested.
    pub from_prev: Option<T>,
    /// Gradient from the next rank, if requested.
    pub from_next: Option<T>,
}

impl<T> Default for Received<T> {
    fn default() -> Self {
        Self {
            from_prev: None,
            from_next: None,
        }
    }
}

/// Blocking transport between adjacent pipeline ranks.
pub trait P2pChannel<T> {
    /// Perform every send and receive of `exchange` as one batch and block
    /// until all of them complete.
    fn communicate(&mut self, exchange: Exchange<T>) -> Result<Received<T>>;
}

/// Named directional operations over a [`P2pChannel`].
///
/// Every operation records its time under the matching [`timer`] name.
pub struct StageComm<'a, T> {
    channel: &'a mut dyn P2pChannel<T>,
    telemetry: &'a mut dyn Telemetry,
}

fn missing(what: &str) -> Error {
    Error::SchedulerError {
        reason: format!("channel returned no {what} for a requested receive"),
    }
}

impl<'a, T> StageComm<'a, T> {
    pub fn new(channel: &'a mut dyn P2pChannel<T>, telemetry: &'a mut dyn Telemetry) -> Self {
        Self { channel, telemetry }
    }

    fn timed(&mut self, name: &str, exchange: Exchange<T>) -> Result<Received<T>> {
        tracing::trace!(
            op = name,
            send_next = exchange.send_next.is_some(),
            send_prev = exchange.send_prev.is_some(),
            recv_prev = exchange.recv_prev,
            recv_next = exchange.recv_next,
            ring = exchange.ring_exchange,
            "p2p exchange"
        );
        self.telemetry.start(name);
        let received = self.channel.communicate(exchange);
        self.telemetry.stop(name);
        received
    }

    /// Receive the input activation. `None` on the first stage.
    pub fn recv_forward(&mut self, pos: StagePosition, ring: bool) -> Result<Option<T>> {
        if pos.is_first {
            return Ok(None);
        }
        let received = self.timed(
            timer::FORWARD_RECV,
            Exchange::new().recv_prev(true).ring(ring),
        )?;
        received
            .from_prev
            .map(Some)
            .ok_or_else(|| missing("activation"))
    }

    /// Receive the output gradient. `None` on the last stage.
    pub fn recv_backward(&mut self, pos: StagePosition, ring: bool) -> Result<Option<T>> {
        if pos.is_last {
            return Ok(None);
        }
        let received = self.timed(
            timer::BACKWARD_RECV,
            Exchange::new().recv_next(true).ring(ring),
        )?;
        received
            .from_next
            .map(Some)
            .ok_or_else(|| missing("gradient"))
    }

    /// Send an activation downstream. No-op on the last stage.
    pub fn send_forward(&mut self, output: Option<T>, pos: StagePosition) -> Result<()> {
        if pos.is_last || output.is_none() {
            return Ok(());
        }
        self.timed(timer::FORWARD_SEND, Exchange::new().send_next(output))?;
        Ok(())
    }

    /// Send a gradient upstream. No-op on the first stage.
    pub fn send_backward(&mut self, input_grad: Option<T>, pos: StagePosition) -> Result<()> {
        if pos.is_first || input_grad.is_none() {
            return Ok(());
        }
        self.timed(timer::BACKWARD_SEND, Exchange::new().send_prev(input_grad))?;
        Ok(())
    }

    /// Send an activation downstream and receive its gradient slot in return.
    /// `None` on the last stage.
    pub fn send_forward_recv_backward(
        &mut self,
        output: Option<T>,
        pos: StagePosition,
    ) -> Result<Option<T>> {
        if pos.is_last {
            return Ok(None);
        }
        let received = self.timed(
            timer::FORWARD_SEND_BACKWARD_RECV,
            Exchange::new().send_next(output).recv_next(true),
        )?;
        received
            .from_next
            .map(Some)
            .ok_or_else(|| missing("gradient"))
    }

    /// Send a gradient upstream and receive the next input activation.
    /// `None` on the first stage.
    pub fn send_backward_recv_forward(
        &mut self,
        input_grad: Option<T>,
        pos: StagePosition,
    ) -> Result<Option<T>> {
        if pos.is_first {
            return Ok(None);
        }
        let received = self.timed(
            timer::BACKWARD_SEND_FORWARD_RECV,
            Exchange::new().send_prev(input_grad).recv_prev(true),
        )?;
        received
            .from_prev
            .map(Some)
            .ok_or_else(|| missing("activation"))
    }

    /// Send an activation and optionally receive one. The caller decides
    /// boundaries (interleaved schedules pass `None` / `false` there).
    pub fn send_forward_recv_forward(
        &mut self,
        output: Option<T>,
        recv_prev: bool,
    ) -> Result<Option<T>> {
        let received = self.timed(
            timer::FORWARD_SEND_FORWARD_RECV,
            Exchange::new().send_next(output).recv_prev(recv_prev),
        )?;
        Ok(received.from_prev)
    }

    /// Send a gradient and optionally receive one.
    pub fn send_backward_recv_backward(
        &mut self,
        input_grad: Option<T>,
        recv_next: bool,
    ) -> Result<Option<T>> {
        let received = self.timed(
            timer::BACKWARD_SEND_BACKWARD_RECV,
            Exchange::new().send_prev(input_grad).recv_next(recv_next),
        )?;
        Ok(received.from_next)
    }

    /// The full four-way exchange of an interleaved steady-state step.
    pub fn send_forward_backward_recv_forward_backward(
        &mut self,
        output: Option<T>,
        input_grad: Option<T>,
        recv_prev: bool,
        recv_next: bool,
    ) -> Result<Received<T>> {
        self.timed(
            timer::FORWARD_BACKWARD_SEND_FORWARD_BACKWARD_RECV,
            Exchange::new()
                .send_next(output)
                .send_prev(input_grad)
                .recv_prev(recv_prev)
                .recv_next(recv_next),
        )
    }
}
