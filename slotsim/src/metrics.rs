//! Metrics collection for simulation analysis.

use hashbrown::HashMap;
use slotmesh::{Instant, NodeId};

/// Schedule state of every node at a point in time.
#[derive(Debug, Clone)]
pub struct ScheduleSnapshot {
    pub time: Instant,
    /// Installed slotframes per node.
    pub slotframes: HashMap<NodeId, usize>,
    /// Installed links per node.
    pub links: HashMap<NodeId, usize>,
    /// Packets waiting in the neighbor queues per node.
    pub queued: HashMap<NodeId, usize>,
    /// Whether each node runs its slot engine.
    pub associated: HashMap<NodeId, bool>,
}

impl ScheduleSnapshot {
    pub fn new(time: Instant) -> Self {
        Self {
            time,
            slotframes: HashMap::new(),
            links: HashMap::new(),
            queued: HashMap::new(),
            associated: HashMap::new(),
        }
    }

    pub fn record_node(
        &mut self,
        node: NodeId,
        slotframes: usize,
        links: usize,
        queued: usize,
        associated: bool,
    ) {
        self.slotframes.insert(node, slotframes);
        self.links.insert(node, links);
        self.queued.insert(node, queued);
        self.associated.insert(node, associated);
    }

    pub fn all_associated(&self) -> bool {
        self.associated.values().all(|&a| a)
    }

    pub fn total_queued(&self) -> usize {
        self.queued.values().sum()
    }
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Slots executed, summed over nodes.
    pub slots_run: u64,
    /// Frames put on the air, ACKs included.
    pub frames_sent: u64,
    /// Frames that did not reach a listener because of link loss.
    pub frames_lost: u64,
    /// Listener-slots in which two or more frames overlapped.
    pub collisions: u64,
    /// ACKs lost on the way back.
    pub acks_lost: u64,
    /// Packets generated by the application.
    pub generated: u64,
    /// Generated packets refused by a full queue.
    pub enqueue_failures: u64,
    /// Packets that reached the coordinator.
    pub delivered_to_root: u64,
    /// The same, per originating node.
    pub delivered_by_origin: HashMap<NodeId, u64>,
    /// Time of every packet that reached the coordinator, minus its
    /// generation time, in milliseconds.
    pub latencies_ms: Vec<u64>,
    /// Dedicated allocations installed or changed.
    pub allocation_changes: u64,
    /// Own reception slotframe resizes.
    pub resizes: u64,
    pub snapshots: Vec<ScheduleSnapshot>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: ScheduleSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<&ScheduleSnapshot> {
        self.snapshots.last()
    }

    /// Fraction of generated packets that reached the coordinator.
    pub fn delivery_ratio(&self) -> f64 {
        if self.generated == 0 {
            return 0.0;
        }
        self.delivered_to_root as f64 / self.generated as f64
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        Some(self.latencies_ms.iter().sum::<u64>() as f64 / self.latencies_ms.len() as f64)
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub end_time: Instant,
    pub metrics: SimMetrics,
    /// Whether simulation ended due to event queue exhaustion (vs time limit).
    pub queue_exhausted: bool,
}

impl SimulationResult {
    pub fn delivery_ratio(&self) -> f64 {
        self.metrics.delivery_ratio()
    }

    /// Every node ran its slot engine at the last snapshot.
    pub fn all_associated(&self) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.all_associated())
    }
}
