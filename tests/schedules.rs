//! Multi-rank schedule runs over the in-process ring.
//!
//! Every rank runs in its own thread with a checked `TraceStage`, which fails
//! the run if an activation or gradient arrives from the wrong neighbour or
//! out of order. A receive or stall barrier that waits too long fails
//! instead of hanging.

use std::time::Duration;

use pipesched::distributed::pipeline::{
    timer, ChannelStats, LocalEndpoint, NoLossScaling, Timers,
};
use pipesched::testing::{Packet, RecordingOptimizer, TraceStage, WeightVersion};
use pipesched::{
    LocalRing, NoFlushState, PipelineContext, PipelineOutput, PipelineSchedule, PipelineTopology,
    Schedule1F1B, ScheduleConfig, ScheduleInterleaved1F1B, ScheduleNoFlush,
};
use tracing_subscriber::EnvFilter;

const TIMEOUT: Duration = Duration::from_secs(10);

/// `RUST_LOG=pipesched=trace cargo test` shows every exchange.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn ring_timers(ep: &LocalEndpoint<Packet>) -> Timers {
    Timers::new()
        .with_barrier(ep.barrier())
        .with_barrier_timeout(TIMEOUT)
}

struct RankResult {
    rank: usize,
    out: PipelineOutput<usize>,
    forwards: Vec<usize>,
    backwards: Vec<usize>,
    stats: ChannelStats,
    stalls: usize,
}

fn run_ring<R, F>(world_size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(LocalEndpoint<Packet>) -> R + Sync,
{
    init_tracing();
    let endpoints = LocalRing::endpoints::<Packet>(world_size).unwrap();
    std::thread::scope(|s| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                let f = &f;
                s.spawn(move || f(ep.with_recv_timeout(TIMEOUT)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Run a flushing schedule once on every rank.
fn run_flushing(
    world_size: usize,
    num_chunks: usize,
    schedule: &PipelineSchedule,
) -> Vec<RankResult> {
    run_ring(world_size, |mut ep| {
        let rank = ep.rank();
        let topo = PipelineTopology::new(world_size, rank, num_chunks).unwrap();
        let mut stage = TraceStage::new(&topo);
        let mut opt = NoLossScaling;
        let mut timers = ring_timers(&ep);
        let out = {
            let mut ctx = PipelineContext::new(&mut stage, &mut opt, &mut ep, &topo, &mut timers);
            schedule.run(&mut ctx).unwrap()
        };
        RankResult {
            rank,
            out,
            forwards: (0..num_chunks).map(|c| stage.num_forward(c)).collect(),
            backwards: (0..num_chunks).map(|c| stage.num_backward(c)).collect(),
            stats: ep.stats(),
            stalls: timers
                .get(timer::FORWARD_PIPELINE_STALL)
                .map_or(0, |s| s.count),
        }
    })
}

#[test]
fn test_1f1b_ring() {
    for world_size in 1..=4 {
        for m in [1, 2, 3, 5, 8] {
            let schedule = PipelineSchedule::OneFOneB(Schedule1F1B::new(m).unwrap());
            for r in run_flushing(world_size, 1, &schedule) {
                let ctx = format!("world={world_size} m={m} rank={}", r.rank);
                assert_eq!(r.out.num_forward, m, "{ctx}");
                assert_eq!(r.out.num_backward, m, "{ctx}");
                assert_eq!(r.forwards, vec![m], "{ctx}");
                assert_eq!(r.backwards, vec![m], "{ctx}");

                let is_last = r.rank + 1 == world_size;
                let expected_losses: Vec<usize> = if is_last { (0..m).collect() } else { vec![] };
                assert_eq!(r.out.losses, expected_losses, "{ctx}");

                let downstream = if is_last { 0 } else { m };
                let upstream = if r.rank == 0 { 0 } else { m };
                assert_eq!(r.stats.sent_next, downstream, "{ctx}");
                assert_eq!(r.stats.received_next, downstream, "{ctx}");
                assert_eq!(r.stats.sent_prev, upstream, "{ctx}");
                assert_eq!(r.stats.received_prev, upstream, "{ctx}");

                // one barrier per rank, none when a single micro-batch forces
                // every rank into warm-up
                assert_eq!(r.stalls, usize::from(m > 1), "{ctx}");
            }
        }
    }
}

#[test]
fn test_1f1b_ring_with_fewer_microbatches_than_stages() {
    // warm-up is capped by the micro-batch count, so neighbouring ranks can
    // warm up equally long and the stall barrier must not cut a warm-up short
    for world_size in 3..=6 {
        for m in 1..world_size {
            for forward_only in [false, true] {
                let schedule = PipelineSchedule::OneFOneB(
                    Schedule1F1B::new(m).unwrap().with_forward_only(forward_only),
                );
                for r in run_flushing(world_size, 1, &schedule) {
                    let ctx = format!("world={world_size} m={m} rank={}", r.rank);
                    assert_eq!(r.out.num_forward, m, "{ctx}");
                    let backwards = if forward_only { 0 } else { m };
                    assert_eq!(r.out.num_backward, backwards, "{ctx}");
                    assert_eq!(r.stalls, usize::from(m > 1), "{ctx}");
                }
            }
        }
    }
}

#[test]
fn test_1f1b_middle_rank_transfer_counts() {
    let schedule = PipelineSchedule::OneFOneB(Schedule1F1B::new(8).unwrap());
    let results = run_flushing(4, 1, &schedule);
    let rank1 = &results[1];
    assert_eq!(rank1.stats.sent_next, 8);
    assert_eq!(rank1.stats.sent_prev, 8);
    assert_eq!(rank1.out.num_forward, 8);
    assert_eq!(rank1.out.num_backward, 8);
}

#[test]
fn test_1f1b_forward_only_ring() {
    let schedule =
        PipelineSchedule::OneFOneB(Schedule1F1B::new(5).unwrap().with_forward_only(true));
    for r in run_flushing(3, 1, &schedule) {
        assert_eq!(r.out.num_forward, 5);
        assert_eq!(r.out.num_backward, 0);
        assert_eq!(r.stats.sent_prev, 0);
        assert_eq!(r.stats.received_next, 0);
    }
}

#[test]
fn test_gpipe_ring() {
    let schedule = PipelineSchedule::OneFOneB(Schedule1F1B::new(4).unwrap().with_gpipe(true));
    for r in run_flushing(3, 1, &schedule) {
        assert_eq!(r.out.num_forward, 4);
        assert_eq!(r.out.num_backward, 4);
        assert_eq!(r.stalls, 0);
    }
}

#[test]
fn test_interleaved_ring() {
    for world_size in 1..=4 {
        for num_chunks in 2..=3 {
            for m in [world_size, 2 * world_size, 3 * world_size] {
                let schedule =
                    PipelineSchedule::Interleaved(ScheduleInterleaved1F1B::new(m).unwrap());
                for r in run_flushing(world_size, num_chunks, &schedule) {
                    let ctx = format!(
                        "world={world_size} chunks={num_chunks} m={m} rank={}",
                        r.rank
                    );
                    assert_eq!(r.out.num_forward, m * num_chunks, "{ctx}");
                    assert_eq!(r.out.num_backward, m * num_chunks, "{ctx}");
                    assert_eq!(r.forwards, vec![m; num_chunks], "{ctx}");
                    assert_eq!(r.backwards, vec![m; num_chunks], "{ctx}");
                    let expected_losses = if r.rank + 1 == world_size { m } else { 0 };
                    assert_eq!(r.out.losses.len(), expected_losses, "{ctx}");
                    // stall barriers only apply without interleaving
                    assert_eq!(r.stalls, 0, "{ctx}");
                }
            }
        }
    }
}

#[test]
fn test_interleaved_forward_only_ring() {
    let schedule = PipelineSchedule::Interleaved(
        ScheduleInterleaved1F1B::new(4)
            .unwrap()
            .with_forward_only(true),
    );
    for r in run_flushing(2, 3, &schedule) {
        assert_eq!(r.out.num_forward, 12);
        assert_eq!(r.out.num_backward, 0);
        assert_eq!(r.stats.sent_prev, 0);
    }
}

#[test]
fn test_interleaved_single_chunk_ring() {
    let schedule = PipelineSchedule::Interleaved(ScheduleInterleaved1F1B::new(5).unwrap());
    for r in run_flushing(3, 1, &schedule) {
        assert_eq!(r.out.num_forward, 5);
        assert_eq!(r.out.num_backward, 5);
        assert_eq!(r.stalls, 1);
    }
}

struct NoFlushRank {
    rank: usize,
    calls: Vec<PipelineOutput<usize>>,
    in_flight_between_calls: Vec<usize>,
    drained: bool,
    middle_call_forward_versions: Vec<WeightVersion>,
}

fn run_no_flush(world_size: usize, m: usize, num_calls: usize) -> Vec<NoFlushRank> {
    let schedule = ScheduleNoFlush::new(m).unwrap();
    run_ring(world_size, |mut ep| {
        let rank = ep.rank();
        let topo = PipelineTopology::flat(world_size, rank).unwrap();
        let mut opt = RecordingOptimizer::new();
        let mut stage = TraceStage::new(&topo).with_version(opt.version_handle());
        let mut timers = ring_timers(&ep);
        let mut state: NoFlushState<Packet> = NoFlushState::new();

        let mut calls = Vec::new();
        let mut in_flight_between_calls = Vec::new();
        let mut middle_call_forward_versions = Vec::new();
        for call in 0..num_calls {
            let first = call == 0;
            let last = call + 1 == num_calls;
            stage.clear_events();
            let out = {
                let mut ctx =
                    PipelineContext::new(&mut stage, &mut opt, &mut ep, &topo, &mut timers);
                schedule.run(&mut ctx, &mut state, first, last).unwrap()
            };
            if !first && !last && middle_call_forward_versions.is_empty() {
                middle_call_forward_versions = stage
                    .events()
                    .iter()
                    .filter(|e| e.is_forward())
                    .filter_map(|e| e.version)
                    .collect();
            }
            if !last {
                in_flight_between_calls.push(state.in_flight());
            }
            calls.push(out);
        }

        NoFlushRank {
            rank,
            calls,
            in_flight_between_calls,
            drained: state.is_drained(),
            middle_call_forward_versions,
        }
    })
}

#[test]
fn test_no_flush_ring_across_calls() {
    let world_size = 4;
    let m = 6;
    for r in run_no_flush(world_size, m, 3) {
        let base_warmup = world_size - r.rank - 1;
        let forwards: usize = r.calls.iter().map(|c| c.num_forward).sum();
        let backwards: usize = r.calls.iter().map(|c| c.num_backward).sum();
        assert_eq!(forwards, 3 * m, "rank {}", r.rank);
        assert_eq!(backwards, 3 * m, "rank {}", r.rank);
        assert_eq!(r.in_flight_between_calls, vec![base_warmup; 2]);
        assert!(r.drained, "rank {}", r.rank);

        let losses: usize = r.calls.iter().map(|c| c.losses.len()).sum();
        let expected_losses = if r.rank + 1 == world_size { 3 * m } else { 0 };
        assert_eq!(losses, expected_losses);

        let mut expected_versions = vec![WeightVersion::Older; m - base_warmup];
        expected_versions.extend(vec![WeightVersion::Newer; base_warmup]);
        assert_eq!(r.middle_call_forward_versions, expected_versions, "rank {}", r.rank);
    }
}

#[test]
fn test_no_flush_single_call_with_few_microbatches() {
    for m in 1..4 {
        for r in run_no_flush(4, m, 1) {
            assert_eq!(r.calls[0].num_forward, m, "m={m} rank {}", r.rank);
            assert_eq!(r.calls[0].num_backward, m, "m={m} rank {}", r.rank);
            assert!(r.drained);
        }
    }
}

#[test]
fn test_schedule_from_toml_config() {
    let config = ScheduleConfig::from_toml_str(
        r#"
        kind = "interleaved"
        num_microbatches = 4
        num_model_chunks = 2
        "#,
    )
    .unwrap();
    let schedule = PipelineSchedule::from_config(&config).unwrap();
    for r in run_flushing(2, config.num_model_chunks, &schedule) {
        assert_eq!(r.out.num_forward, 8);
        assert_eq!(r.out.num_backward, 8);
        assert_eq!(r.stalls, 0);
    }
}
