//! Single-process committee running on real threads.

use quorumstate_production::{KeyValueVm, LocalDevnet, NodeConfig};
use quorumstate_types::StateIndex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const FAST: &str = r#"
[runner]
vm_threads = 2
status_interval_ms = 20

[devnet]
nodes = 4
threshold = 3
seed = 11
request_interval_ms = 0

[state_manager]
housekeeping_interval_ms = 50
block_request_timeout_ms = 200
pingpong_interval_ms = 200

[consensus]
tick_interval_ms = 50
leader_timeout_ms = 1000
rebroadcast_interval_ms = 200
announce_interval_ms = 200
"#;

fn start(seed: u64) -> LocalDevnet {
    let mut config = NodeConfig::from_toml_str(FAST).unwrap();
    config.devnet.seed = seed;
    LocalDevnet::start(
        &config,
        Arc::new(KeyValueVm),
        tokio::runtime::Handle::current(),
    )
    .unwrap()
}

/// Poll until every listed node reports at least `index`.
async fn wait_for_index(devnet: &LocalDevnet, nodes: &[usize], index: u32) -> bool {
    for _ in 0..600 {
        let reached = nodes.iter().all(|&node| {
            devnet
                .status(node)
                .is_some_and(|status| status.sync.state_index >= index)
        });
        if reached {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_committee_processes_requests() {
    let devnet = start(11);
    let mut processed = devnet.subscribe_processed(0).unwrap();

    let requests: Vec<_> = (1..=5)
        .map(|seq| KeyValueVm::set_request(seq, seq, &format!("k{seq}"), vec![seq as u8]))
        .collect();
    for request in &requests {
        assert_eq!(devnet.submit(request), 4);
    }

    let expected: HashSet<_> = requests.iter().map(|r| r.id).collect();
    let mut seen = HashSet::new();
    let collected = tokio::time::timeout(Duration::from_secs(30), async {
        while seen.len() < expected.len() {
            if let Ok(id) = processed.recv().await {
                seen.insert(id);
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "only {} requests processed", seen.len());
    assert_eq!(seen, expected);

    assert!(wait_for_index(&devnet, &[0, 1, 2, 3], 1).await);
    let anchored = devnet.ledger().anchored_output(&devnet.chain_id()).unwrap();
    assert!(anchored.index >= StateIndex(1));
    for node in 0..4 {
        assert!(devnet.status(node).unwrap().fatal.is_none());
    }

    let stopping = Arc::new(devnet);
    let handle = Arc::clone(&stopping);
    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .unwrap();
    assert!(stopping.status(0).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restarted_node_catches_up() {
    let devnet = Arc::new(start(12));

    let stopper = Arc::clone(&devnet);
    tokio::task::spawn_blocking(move || stopper.stop_node(3))
        .await
        .unwrap()
        .unwrap();
    assert!(devnet.status(3).is_none());

    for seq in 1..=3 {
        devnet.submit(&KeyValueVm::set_request(seq, seq, "k", vec![seq as u8]));
    }
    assert!(wait_for_index(&devnet, &[0, 1, 2], 1).await);

    devnet.restart_node(3).unwrap();
    let target = devnet
        .ledger()
        .anchored_output(&devnet.chain_id())
        .unwrap()
        .index
        .0;
    assert!(wait_for_index(&devnet, &[3], target).await);
    assert!(devnet.status(3).unwrap().fatal.is_none());

    let handle = Arc::clone(&devnet);
    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .unwrap();
}
