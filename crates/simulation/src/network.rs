//! Simulated network with deterministic latency, packet loss, and partitions.

use crate::NodeIndex;
use parking_lot::RwLock;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base one-way latency between committee members.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this probability.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Connectivity shared between the network and every simulated committee,
/// so peer liveness reflects partitions and crashed nodes.
#[derive(Debug, Default)]
pub struct Links {
    /// If (a, b) is present, messages from a to b are dropped.
    partitions: RwLock<BTreeSet<(NodeIndex, NodeIndex)>>,
    down: RwLock<BTreeSet<NodeIndex>>,
}

impl Links {
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.partitions.read().contains(&(from, to))
    }

    pub fn is_down(&self, node: NodeIndex) -> bool {
        self.down.read().contains(&node)
    }

    /// Whether `from` can currently reach `to`.
    pub fn is_reachable(&self, from: NodeIndex, to: NodeIndex) -> bool {
        from == to || (!self.is_down(to) && !self.is_partitioned(from, to))
    }
}

/// Simulated network for deterministic message delivery.
///
/// Supports:
/// - Configurable latency with jitter
/// - Packet loss (probabilistic message drops)
/// - Network partitions (blocking communication between node pairs)
/// - Crashed nodes (neither send nor receive)
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    nodes: NodeIndex,
    links: Arc<Links>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig, nodes: NodeIndex) -> Self {
        Self {
            config,
            nodes,
            links: Arc::new(Links::default()),
        }
    }

    pub fn links(&self) -> &Arc<Links> {
        &self.links
    }

    // ─── Partition Management ───

    /// Check if two nodes are partitioned (message from `from` to `to` would be dropped).
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.links.is_partitioned(from, to)
    }

    /// Create a unidirectional partition: messages from `from` to `to` are dropped.
    pub fn partition_unidirectional(&mut self, from: NodeIndex, to: NodeIndex) {
        self.links.partitions.write().insert((from, to));
    }

    /// Create a bidirectional partition between two nodes.
    pub fn partition_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        let mut partitions = self.links.partitions.write();
        partitions.insert((a, b));
        partitions.insert((b, a));
    }

    /// All messages between group_a and group_b are dropped (both directions).
    pub fn partition_groups(&mut self, group_a: &[NodeIndex], group_b: &[NodeIndex]) {
        let mut partitions = self.links.partitions.write();
        for &a in group_a {
            for &b in group_b {
                partitions.insert((a, b));
                partitions.insert((b, a));
            }
        }
    }

    /// Isolate a node from all other nodes in the network.
    pub fn isolate_node(&mut self, node: NodeIndex) {
        let others: Vec<NodeIndex> = self.all_nodes().into_iter().filter(|&n| n != node).collect();
        self.partition_groups(&[node], &others);
    }

    pub fn heal_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        let mut partitions = self.links.partitions.write();
        partitions.remove(&(a, b));
        partitions.remove(&(b, a));
    }

    /// Restore full connectivity. Crashed nodes stay down.
    pub fn heal_all(&mut self) {
        self.links.partitions.write().clear();
    }

    pub fn partition_count(&self) -> usize {
        self.links.partitions.read().len()
    }

    // ─── Node Liveness ───

    pub(crate) fn set_down(&mut self, node: NodeIndex, down: bool) {
        let mut set = self.links.down.write();
        if down {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    pub fn is_down(&self, node: NodeIndex) -> bool {
        self.links.is_down(node)
    }

    // ─── Packet Loss ───

    /// Check if a packet should be dropped based on the configured loss rate.
    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    /// Set the packet loss rate (0.0 - 1.0).
    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn packet_loss_rate(&self) -> f64 {
        self.config.packet_loss_rate
    }

    // ─── Message Delivery Decision ───

    /// `None` if the message is dropped, otherwise its sampled latency.
    pub fn should_deliver(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        rng: &mut ChaCha8Rng,
    ) -> Option<Duration> {
        // Partitions and crashes are checked first and consume no randomness.
        if !self.links.is_reachable(from, to) || self.links.is_down(from) {
            return None;
        }
        if self.should_drop_packet(rng) {
            return None;
        }
        Some(self.sample_latency(rng))
    }

    /// Sample a one-way latency.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.001))
    }

    pub fn all_nodes(&self) -> Vec<NodeIndex> {
        (0..self.nodes).collect()
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes as usize
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_partitions_and_heal() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default(), 4);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        network.partition_groups(&[0, 1], &[2, 3]);
        assert_eq!(network.partition_count(), 8);
        assert!(network.should_deliver(0, 2, &mut rng).is_none());
        assert!(network.should_deliver(0, 1, &mut rng).is_some());

        network.heal_bidirectional(1, 3);
        assert!(network.should_deliver(3, 1, &mut rng).is_some());

        network.isolate_node(0);
        assert!(network.should_deliver(1, 0, &mut rng).is_none());
        network.heal_all();
        assert_eq!(network.partition_count(), 0);
        assert!(network.should_deliver(1, 0, &mut rng).is_some());
    }

    #[test]
    fn test_down_node_neither_sends_nor_receives() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default(), 3);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        network.set_down(2, true);
        assert!(network.should_deliver(0, 2, &mut rng).is_none());
        assert!(network.should_deliver(2, 0, &mut rng).is_none());
        assert!(!network.links().is_reachable(0, 2));
        network.set_down(2, false);
        assert!(network.should_deliver(2, 0, &mut rng).is_some());
    }

    #[test]
    fn test_latency_is_seed_deterministic_and_bounded() {
        let network = SimulatedNetwork::new(NetworkConfig::default(), 2);
        let sample = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..16)
                .map(|_| network.sample_latency(&mut rng))
                .collect::<Vec<_>>()
        };
        assert_eq!(sample(7), sample(7));
        for latency in sample(8) {
            assert!(latency >= Duration::from_millis(45) && latency <= Duration::from_millis(55));
        }
    }

    #[test]
    fn test_full_loss_drops_everything() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default(), 2);
        network.set_packet_loss_rate(1.5);
        assert_eq!(network.packet_loss_rate(), 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert!((0..32).all(|_| network.should_deliver(0, 1, &mut rng).is_none()));
    }
}
