//! Committee behaviour under ledger rejections, partitions and crashes.

use quorumstate_simulation::{NodeIndex, SimulationConfig, SimulationRunner};
use quorumstate_test_helpers::fixtures::{self, CounterVm};
use quorumstate_types::{InclusionState, Request, RequestId, StateIndex};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn start(seed: u64) -> SimulationRunner {
    let mut runner =
        SimulationRunner::new(SimulationConfig::default(), Arc::new(CounterVm), seed).unwrap();
    runner.start();
    runner
}

fn requests(tags: std::ops::Range<u64>) -> Vec<Arc<Request>> {
    tags.map(|tag| fixtures::make_request(tag, tag)).collect()
}

fn submit_all(runner: &mut SimulationRunner, requests: &[Arc<Request>]) {
    for request in requests {
        runner.submit_to_all(request);
    }
}

/// Step until `done` holds or `timeout` of simulated time passes.
fn run_until(
    runner: &mut SimulationRunner,
    timeout: Duration,
    done: impl Fn(&SimulationRunner) -> bool,
) -> bool {
    let deadline = runner.now() + timeout;
    while !done(runner) {
        if runner.now() >= deadline {
            return false;
        }
        runner.run_for(Duration::from_millis(100));
    }
    true
}

fn counter(runner: &SimulationRunner, node: NodeIndex) -> u64 {
    CounterVm::counter(runner.node(node).unwrap().solid_state(), "counter")
}

fn assert_no_duplicates(runner: &SimulationRunner, node: NodeIndex) {
    let processed = runner.processed(node);
    let unique: BTreeSet<RequestId> = processed.iter().copied().collect();
    assert_eq!(unique.len(), processed.len(), "node {node} processed a request twice");
}

#[test]
#[traced_test]
fn test_committee_consumes_every_request_once() {
    let mut runner = start(1);
    let batch = requests(0..5);
    submit_all(&mut runner, &batch);

    assert!(run_until(&mut runner, Duration::from_secs(60), |r| {
        (0..4).all(|n| r.processed(n).len() == 5)
    }));

    for node in 0..4 {
        assert_no_duplicates(&runner, node);
        assert_eq!(counter(&runner, node), 5);
        assert!(runner.fatal(node).is_none());
        assert!(runner.node(node).unwrap().state_manager().is_synced());
        assert_eq!(runner.node(node).unwrap().status().mempool_size, 0);
    }
    let anchored = runner.ledger().anchored();
    assert_eq!(runner.node(0).unwrap().solid_state().hash(), anchored.state_hash);
}

#[test]
fn test_anchored_indices_are_consecutive() {
    let mut runner = start(2);
    for tag in 0..4u64 {
        runner.submit_to_all(&fixtures::make_request(tag, tag));
        let target = StateIndex(tag as u32 + 1);
        let deadline = runner.now() + Duration::from_secs(30);
        assert!(runner.run_until_index(target, deadline));
    }

    let history = runner.anchored_history();
    assert!(history.len() >= 5);
    for pair in history.windows(2) {
        assert_eq!(pair[1].index, pair[0].index.next());
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }
    assert_eq!(runner.ledger().stats().conflicting, 0);
}

fn assert_abort_is_clean(verdict: InclusionState, seed: u64) {
    let mut runner = start(seed);
    runner.ledger_mut().force_next_verdict(verdict);
    let request = fixtures::make_request(1, 1);
    runner.submit_to_all(&request);

    // The first transaction is turned down; nothing may be consumed by it.
    assert!(run_until(&mut runner, Duration::from_secs(30), |r| {
        r.ledger().stats().posted >= 1
    }));
    assert_eq!(runner.ledger().stats().posted, 1);
    assert_eq!(runner.ledger().stats().included, 0);
    assert_eq!(runner.ledger().anchored().index, StateIndex(0));
    for node in 0..4 {
        assert_eq!(runner.state_index(node), Some(StateIndex(0)));
        assert!(runner.processed(node).is_empty());
        assert_eq!(runner.node(node).unwrap().status().mempool_size, 1);
    }

    // A later round includes the same request exactly once.
    let deadline = runner.now() + Duration::from_secs(60);
    assert!(runner.run_until_index(StateIndex(1), deadline));
    assert!(run_until(&mut runner, Duration::from_secs(5), |r| {
        (0..4).all(|n| r.processed(n) == [request.id])
    }));
    for node in 0..4 {
        assert_eq!(counter(&runner, node), 1);
    }
}

#[test]
#[traced_test]
fn test_rejected_transaction_keeps_requests() {
    assert_abort_is_clean(InclusionState::Rejected, 3);
}

#[test]
fn test_conflicting_transaction_keeps_requests() {
    assert_abort_is_clean(InclusionState::Conflicting, 4);
}

#[test]
fn test_split_committee_makes_no_progress_until_healed() {
    let mut runner = start(5);
    runner.network_mut().partition_groups(&[0, 1], &[2, 3]);
    submit_all(&mut runner, &requests(0..3));

    runner.run_for(Duration::from_secs(20));
    assert_eq!(runner.ledger().stats().posted, 0);
    for node in 0..4 {
        assert_eq!(runner.state_index(node), Some(StateIndex(0)));
    }
    assert!(runner.stats().messages_dropped_partition > 0);

    runner.network_mut().heal_all();
    let deadline = runner.now() + Duration::from_secs(60);
    assert!(runner.run_until_index(StateIndex(1), deadline));
}

#[test]
#[traced_test]
fn test_isolated_member_syncs_after_heal() {
    let mut runner = start(6);
    runner.network_mut().isolate_node(3);

    for tag in 0..3u64 {
        runner.submit_to_all(&fixtures::make_request(tag, tag));
        let target = StateIndex(tag as u32 + 1);
        assert!(run_until(&mut runner, Duration::from_secs(60), |r| {
            (0..3).all(|n| r.state_index(n).is_some_and(|i| i >= target))
        }));
    }
    assert_eq!(runner.state_index(3), Some(StateIndex(0)));
    assert!(!runner.node(3).unwrap().state_manager().is_synced());

    runner.network_mut().heal_all();
    let anchored = runner.ledger().anchored().index;
    let deadline = runner.now() + Duration::from_secs(60);
    assert!(runner.run_until_index(anchored, deadline));
    assert_eq!(counter(&runner, 3), counter(&runner, 0));
    assert_eq!(
        runner.node(3).unwrap().solid_state().hash(),
        runner.node(0).unwrap().solid_state().hash()
    );
    assert_no_duplicates(&runner, 3);
}

#[test]
#[traced_test]
fn test_restarted_member_never_consumes_twice() {
    let mut runner = start(7);
    submit_all(&mut runner, &requests(0..2));
    let deadline = runner.now() + Duration::from_secs(30);
    assert!(runner.run_until_index(StateIndex(1), deadline));

    runner.crash_node(1);
    let before = runner.ledger().anchored().index;
    runner.submit_to_all(&fixtures::make_request(10, 10));
    let target = before.next();
    let deadline = runner.now() + Duration::from_secs(60);
    assert!(runner.run_until_index(target, deadline));
    assert!(runner.state_index(1) < Some(target));

    runner.restart_node(1);
    let anchored = runner.ledger().anchored().index;
    let deadline = runner.now() + Duration::from_secs(60);
    assert!(runner.run_until_index(anchored, deadline));
    assert!(run_until(&mut runner, Duration::from_secs(60), |r| {
        (0..4).all(|n| counter(r, n) == 3)
    }));

    for node in 0..4 {
        assert_no_duplicates(&runner, node);
        assert!(runner.fatal(node).is_none());
    }
}
