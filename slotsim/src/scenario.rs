//! Scenario builder for setting up and running simulations.

use slotmesh::{Duration, Instant, NodeId, SchedulingPolicy};

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::sim::Simulator;
use crate::topology::Topology;

/// Type of topology to generate.
#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    Chain,
    /// First node is the hub.
    Star,
    Custom(Topology),
}

/// Builder for simulation scenarios.
///
/// Nodes get ids `1..=num_nodes`; node 1 is the coordinator. The routing
/// tree is the shortest-hop tree of the topology, and nodes join one after
/// the other, parents before children.
pub struct ScenarioBuilder {
    num_nodes: u16,
    seed: u64,
    policy: SchedulingPolicy,
    topology_type: Option<TopologyType>,
    loss_rate: f64,
    /// Gap between consecutive joins.
    join_spacing: Duration,
    traffic_period: Option<Duration>,
    actions: Vec<(Instant, ScenarioAction)>,
    snapshot_interval: Option<Duration>,
}

impl ScenarioBuilder {
    /// Note: a topology must be chosen before calling `build()`.
    pub fn new(num_nodes: u16) -> Self {
        Self {
            num_nodes,
            seed: 42,
            policy: SchedulingPolicy::StaticHashSlots,
            topology_type: None,
            loss_rate: 0.0,
            join_spacing: Duration::from_millis(700),
            traffic_period: None,
            actions: Vec::new(),
            snapshot_interval: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = Some(TopologyType::Custom(topo));
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = Some(TopologyType::FullyConnected);
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = Some(TopologyType::Chain);
        self
    }

    pub fn star_topology(mut self) -> Self {
        self.topology_type = Some(TopologyType::Star);
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_join_spacing(mut self, spacing: Duration) -> Self {
        self.join_spacing = spacing;
        self
    }

    /// Every non-coordinator node sends a packet towards the coordinator
    /// roughly every `period`.
    pub fn with_uplink_traffic(mut self, period: Duration) -> Self {
        self.traffic_period = Some(period);
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Cut the link between `a` and `b` at `time`.
    pub fn disable_link_at(mut self, time: Instant, a: NodeId, b: NodeId) -> Self {
        self.actions
            .push((time, ScenarioAction::DisableLink { from: a, to: b }));
        self
    }

    /// Restore the link between `a` and `b` at `time`.
    pub fn enable_link_at(mut self, time: Instant, a: NodeId, b: NodeId) -> Self {
        self.actions
            .push((time, ScenarioAction::EnableLink { from: a, to: b }));
        self
    }

    pub fn snapshot_at(mut self, time: Instant) -> Self {
        self.actions.push((time, ScenarioAction::TakeSnapshot));
        self
    }

    /// Build the simulator. Returns it with the ids of the nodes in join
    /// order; nodes the coordinator cannot reach are left out.
    ///
    /// # Panics
    ///
    /// If no topology was chosen.
    pub fn build(self) -> (Simulator, Vec<NodeId>) {
        let ids: Vec<NodeId> = (1..=self.num_nodes).collect();
        let mut topo = match self.topology_type {
            Some(TopologyType::FullyConnected) => Topology::fully_connected(&ids),
            Some(TopologyType::Chain) => Topology::chain(&ids),
            Some(TopologyType::Star) => Topology::star(&ids),
            Some(TopologyType::Custom(t)) => t,
            None => panic!(
                "Topology must be explicitly specified. \
                Use .fully_connected(), .chain_topology(), .star_topology() or .topology()"
            ),
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }

        let Some(&root) = ids.first() else {
            return (Simulator::new(self.seed, self.policy), Vec::new());
        };
        let parents = topo.routing_tree(root);

        let depth = |mut id: NodeId| {
            let mut hops = 0;
            while let Some(&parent) = parents.get(&id) {
                id = parent;
                hops += 1;
            }
            hops
        };
        let mut order: Vec<NodeId> = ids
            .iter()
            .copied()
            .filter(|id| *id == root || parents.contains_key(id))
            .collect();
        order.sort_by_key(|&id| (depth(id), id));
        for id in &ids {
            if !order.contains(id) {
                log::warn!("node {} cannot reach the coordinator, left out", id);
            }
        }

        let mut sim = Simulator::new(self.seed, self.policy).with_topology(topo);
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }
        if let Some(period) = self.traffic_period {
            sim = sim.with_uplink_traffic(period);
        }
        for (i, &id) in order.iter().enumerate() {
            sim.add_node(id, parents.get(&id).copied());
            sim.join_at(id, Instant::ZERO + self.join_spacing * i as u64);
        }
        for (time, action) in self.actions {
            sim.schedule_action(time, action);
        }
        (sim, order)
    }

    /// Build and run the simulation for the specified duration.
    pub fn run_for(self, duration: Duration) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_for(duration)
    }

    pub fn run_until(self, time: Instant) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_until(time)
    }
}

/// A coordinator with `children` nodes around it sending uplink traffic.
pub fn star_scenario(children: u16, policy: SchedulingPolicy) -> ScenarioBuilder {
    ScenarioBuilder::new(children + 1)
        .star_topology()
        .with_policy(policy)
        .with_uplink_traffic(Duration::from_secs(10))
}
