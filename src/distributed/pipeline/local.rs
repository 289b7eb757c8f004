//! In-process pipeline transport for running every rank as a thread.
//!
//! [`LocalRing::endpoints`] wires `world_size` endpoints into a ring with one
//! unbounded FIFO per directed edge. Sends never block and receives block, so
//! a combined exchange (all sends first, then all receives) behaves like a
//! batched isend/irecv: two neighbours sending to each other in the same
//! exchange cannot deadlock.
//!
//! ```text
//!   ┌──────────── activations ────────────┐
//!   ▼                                     │
//! rank 0 ──► rank 1 ──► … ──► rank n-1 ───┘
//!   │  ◄──     ◄──      ◄──      ▲
//!   └──────────── gradients ─────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

use crate::error::{Error, Result};

use super::comm::{Exchange, P2pChannel, Received};
use super::telemetry::StallBarrier;

/// Transfer counters of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent_next: usize,
    pub sent_prev: usize,
    pub received_prev: usize,
    pub received_next: usize,
}

/// One rank's end of a [`LocalRing`].
#[derive(Debug)]
pub struct LocalEndpoint<T> {
    rank: usize,
    world_size: usize,
    to_next: Sender<T>,
    to_prev: Sender<T>,
    from_prev: Receiver<T>,
    from_next: Receiver<T>,
    barrier: Arc<StallBarrier>,
    recv_timeout: Option<Duration>,
    stats: ChannelStats,
}

/// Builds connected [`LocalEndpoint`]s.
pub struct LocalRing;

impl LocalRing {
    /// One endpoint per rank, indexed by rank.
    pub fn endpoints<T>(world_size: usize) -> Result<Vec<LocalEndpoint<T>>> {
        if world_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "world_size",
                reason: "pipeline world size must be > 0".to_string(),
            });
        }
        // forward[r] delivers to rank r from its predecessor,
        // backward[r] delivers to rank r from its successor
        let (forward_tx, forward_rx): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| flume::unbounded()).unzip();
        let (backward_tx, backward_rx): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| flume::unbounded()).unzip();
        let barrier = Arc::new(StallBarrier::new(world_size));

        let endpoints = (0..world_size)
            .map(|rank| {
                let next = (rank + 1) % world_size;
                let prev = (rank + world_size - 1) % world_size;
                LocalEndpoint {
                    rank,
                    world_size,
                    to_next: forward_tx[next].clone(),
                    to_prev: backward_tx[prev].clone(),
                    from_prev: forward_rx[rank].clone(),
                    from_next: backward_rx[rank].clone(),
                    barrier: Arc::clone(&barrier),
                    recv_timeout: None,
                    stats: ChannelStats::default(),
                }
            })
            .collect();
        Ok(endpoints)
    }
}

impl<T> LocalEndpoint<T> {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Barrier shared by every endpoint of the ring, for
    /// [`Timers::with_barrier`](super::telemetry::Timers::with_barrier).
    pub fn barrier(&self) -> Arc<StallBarrier> {
        Arc::clone(&self.barrier)
    }

    /// Fail a receive that waits longer than `timeout` instead of blocking
    /// forever.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    fn recv(&self, from: &Receiver<T>, direction: &str) -> Result<T> {
        let received = match self.recv_timeout {
            Some(timeout) => from.recv_timeout(timeout),
            None => from.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        received.map_err(|e| {
            let reason = match e {
                RecvTimeoutError::Timeout => {
                    format!("rank {}: timed out receiving from {direction}", self.rank)
                }
                RecvTimeoutError::Disconnected => {
                    format!("rank {}: {direction} peer disconnected", self.rank)
                }
            };
            tracing::error!(rank = self.rank, direction, "{reason}");
            Error::DistributedError { reason }
        })
    }
}

impl<T> P2pChannel<T> for LocalEndpoint<T> {
    fn communicate(&mut self, exchange: Exchange<T>) -> Result<Received<T>> {
        let Exchange {
            send_next,
            send_prev,
            recv_prev,
            recv_next,
            ring_exchange: _,
        } = exchange;

        if let Some(value) = send_next {
            self.to_next
                .send(value)
                .map_err(|_| Error::DistributedError {
                    reason: format!("rank {}: next peer disconnected", self.rank),
                })?;
            self.stats.sent_next += 1;
        }
        if let Some(value) = send_prev {
            self.to_prev
                .send(value)
                .map_err(|_| Error::DistributedError {
                    reason: format!("rank {}: previous peer disconnected", self.rank),
                })?;
            self.stats.sent_prev += 1;
        }

        let mut received = Received::default();
        if recv_prev {
            received.from_prev = Some(self.recv(&self.from_prev, "previous")?);
            self.stats.received_prev += 1;
        }
        if recv_next {
            received.from_next = Some(self.recv(&self.from_next, "next")?);
            self.stats.received_next += 1;
        }
        Ok(received)
    }
}
