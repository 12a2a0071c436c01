//! Whole driver runs on two loopback ranks.

use dftr_training::{
    CancellationFlag, Capabilities, CheckpointManager, Collaborators, ConfigResolver, DistributedContext,
    GroupTimeouts, MetricEvent, MetricsSink, ModeFlags, NullMetricsSink, ObjectClass, Overrides, RunConfig,
    RunSummary, TcpProcessGroup, TrainLoopDriver, TrainingError, TrainingResult,
};
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const SEED: u64 = 9;

fn timeouts() -> GroupTimeouts {
    GroupTimeouts { init: Duration::from_secs(10), op: Duration::from_secs(10) }
}

fn resolve(root: &Path, modes: ModeFlags) -> RunConfig {
    let overrides = Overrides { epochs: Some(1), mini_batch_size: Some(2), modes, ..Default::default() };
    ConfigResolver::new(root.to_path_buf(), Capabilities::all()).resolve("ape", &overrides).unwrap()
}

fn drive(
    config: &RunConfig,
    dist: &mut DistributedContext,
    sink: &mut dyn MetricsSink,
    cancel: CancellationFlag,
) -> TrainingResult<RunSummary> {
    let collaborators = Collaborators::reference(ObjectClass::Ape, SEED, 2);
    TrainLoopDriver::new(config, collaborators, dist, sink, cancel).and_then(|mut driver| driver.run())
}

/// Runs `config` as rank 0 and rank 1 of one group; rank 1 gets `peer_sink` and `peer_cancel`.
fn run_two_ranks(
    config: &RunConfig,
    mut peer_sink: Box<dyn MetricsSink>,
    peer_cancel: CancellationFlag,
) -> (TrainingResult<RunSummary>, TrainingResult<RunSummary>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let peer_config = config.clone();
    let peer = std::thread::spawn(move || {
        let group = TcpProcessGroup::join(addr, 1, 2, "ape", timeouts()).unwrap();
        let mut dist = DistributedContext::with_group(Box::new(group), 1);
        let result = drive(&peer_config, &mut dist, peer_sink.as_mut(), peer_cancel);
        dist.teardown();
        result
    });

    let group = TcpProcessGroup::host(listener, 2, "ape", timeouts()).unwrap();
    let mut dist = DistributedContext::with_group(Box::new(group), 0);
    let rank0 = drive(config, &mut dist, &mut NullMetricsSink, CancellationFlag::new());
    dist.teardown();
    (rank0, peer.join().unwrap())
}

/// Raises the cancel flag once `after` training steps have been recorded.
struct CancelAfterSteps {
    after: usize,
    seen: usize,
    cancel: CancellationFlag,
}

impl MetricsSink for CancelAfterSteps {
    fn record(&mut self, event: MetricEvent) {
        if matches!(&event, MetricEvent::Scalar { tag, .. } if tag == "train/loss") {
            self.seen += 1;
            if self.seen == self.after {
                self.cancel.cancel();
            }
        }
    }
}

#[test]
fn test_cancel_on_peer_stops_both_ranks_and_rank0_flushes() {
    let temp = TempDir::new().unwrap();
    let config = resolve(temp.path(), ModeFlags::default());
    let peer_cancel = CancellationFlag::new();
    let sink = CancelAfterSteps { after: 3, seen: 0, cancel: peer_cancel.clone() };

    let (rank0, rank1) = run_two_ranks(&config, Box::new(sink), peer_cancel);

    let rank0_step = match rank0 {
        Err(TrainingError::Interrupted { epoch: 0, step }) => step,
        other => panic!("rank 0 returned {other:?}"),
    };
    let rank1_step = match rank1 {
        Err(TrainingError::Interrupted { epoch: 0, step }) => step,
        other => panic!("rank 1 returned {other:?}"),
    };
    assert_eq!(rank0_step, rank1_step);

    let flushed = CheckpointManager::new(config.layout.clone(), ObjectClass::Ape, false)
        .load(&config.layout.checkpoint_path("interrupted"))
        .unwrap();
    assert_eq!(flushed.batches_done, 3);
    assert_eq!(flushed.global_step, rank0_step);
}

#[test]
fn test_pose_metrics_over_two_ranks_match_single_process() {
    let temp = TempDir::new().unwrap();
    let config = resolve(temp.path(), ModeFlags { test_pose: true, ..Default::default() });

    let mut single = DistributedContext::single(0);
    let expected = drive(&config, &mut single, &mut NullMetricsSink, CancellationFlag::new()).unwrap().pose.unwrap();

    let (rank0, rank1) = run_two_ranks(&config, Box::new(NullMetricsSink), CancellationFlag::new());
    let rank0 = rank0.unwrap().pose.unwrap();
    let rank1 = rank1.unwrap().pose.unwrap();

    for merged in [&rank0.overall, &rank1.overall] {
        assert_eq!(merged.instances, expected.overall.instances);
        assert_eq!(merged.scored, expected.overall.scored);
        assert_eq!(merged.correct, expected.overall.correct);
        assert_eq!(merged.add_errors, expected.overall.add_errors);
        assert!((merged.accuracy - expected.overall.accuracy).abs() < 1e-9);
        assert!((merged.mean_add - expected.overall.mean_add).abs() < 1e-6);
    }
    assert!(rank0.batches < expected.batches);
}
