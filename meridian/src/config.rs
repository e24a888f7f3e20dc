//! # Summary
//!
//! This module defines the static, machine-local configuration: the shape of
//! the machine grid, per-machine addresses and ports, Paxos memberships,
//! batching and lock-manager knobs, and the key partitioning function. A
//! config is loaded once at startup (JSON) and shared read-only.

use serde_derive::{Deserialize, Serialize};

use crate::message::{self, Channel, MachineId};
use crate::transaction::{PartitionId, RegionId};

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockManagerMode {
    Old,
    Rma,
    Ddr,
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    KeyValue,
    Movr,
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetadataInitializerType {
    Simple,
    Movr,
}

/// Static membership of one Paxos group, as raw machine ids.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, Default)]
pub struct PaxosGroup {
    pub acceptors: Vec<u32>,
    pub learners: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Config {
    /// Transport protocol; only "tcp" is implemented.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Host of each machine, indexed by machine id.
    pub addresses: Vec<String>,

    pub num_regions: u32,
    pub num_replicas: u32,
    pub num_partitions: u32,

    /// Ports shared by channels without a dedicated one. The last entry
    /// serves all channels at or above `MAX_CHANNEL`.
    #[serde(default = "default_broker_ports")]
    pub broker_ports: Vec<u16>,
    #[serde(default = "default_forwarder_port")]
    pub forwarder_port: u16,
    #[serde(default = "default_sequencer_port")]
    pub sequencer_port: u16,
    #[serde(default = "default_clock_synchronizer_port")]
    pub clock_synchronizer_port: u16,
    #[serde(default = "default_client_port")]
    pub client_port: u16,

    /// Offset added per machine index to every port, for co-located
    /// deployments (tests, single-host clusters). Zero when every machine
    /// has its own host.
    #[serde(default)]
    pub port_stride: u16,

    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    #[serde(default = "default_clock_interval_ms")]
    pub clock_interval_ms: u64,

    #[serde(default = "default_lock_manager")]
    pub lock_manager: LockManagerMode,

    #[serde(default = "default_execution")]
    pub execution: ExecutionType,

    #[serde(default = "default_metadata_initializer")]
    pub metadata_initializer: MetadataInitializerType,

    /// Number of leading key bytes hashed to pick a partition.
    #[serde(default = "default_partition_key_bytes")]
    pub partition_key_bytes: usize,

    /// For each machine, peer machine ids ranked nearest first. Used to
    /// order batch replication fan-out. Empty means id order.
    #[serde(default)]
    pub distance_ranking: Vec<Vec<u32>>,

    /// Workload-specific mastership hints applied before any traffic:
    /// key (utf-8) to master region.
    #[serde(default)]
    pub metadata_overrides: Vec<(String, RegionId)>,

    /// Overrides for the sequencer-log and remaster groups; derived from
    /// the grid when absent.
    #[serde(default)]
    pub log_group: Option<PaxosGroup>,
    #[serde(default)]
    pub remaster_group: Option<PaxosGroup>,
}

fn default_protocol() -> String { "tcp".to_string() }
fn default_broker_ports() -> Vec<u16> { vec![2100] }
fn default_forwarder_port() -> u16 { 2101 }
fn default_sequencer_port() -> u16 { 2102 }
fn default_clock_synchronizer_port() -> u16 { 2103 }
fn default_client_port() -> u16 { 2021 }
fn default_batch_interval_ms() -> u64 { 5 }
fn default_clock_interval_ms() -> u64 { 1000 }
fn default_lock_manager() -> LockManagerMode { LockManagerMode::Old }
fn default_execution() -> ExecutionType { ExecutionType::KeyValue }
fn default_metadata_initializer() -> MetadataInitializerType { MetadataInitializerType::Simple }
fn default_partition_key_bytes() -> usize { 8 }

/// Resolved membership of one Paxos group.
#[derive(Clone, Debug)]
pub struct PaxosMembers {
    pub acceptors: Vec<MachineId>,
    pub learners: Vec<MachineId>,
}

impl PaxosMembers {
    /// The initially elected leader. It never changes.
    pub fn leader(&self) -> MachineId {
        self.acceptors[0]
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn num_machines(&self) -> u32 {
        self.num_regions * self.num_replicas * self.num_partitions
    }

    pub fn machine_id(&self, region: RegionId, replica: u32, partition: PartitionId) -> MachineId {
        MachineId((region * self.num_replicas + replica) * self.num_partitions + partition)
    }

    pub fn region_of(&self, id: MachineId) -> RegionId {
        id.0 / (self.num_replicas * self.num_partitions)
    }

    pub fn replica_of(&self, id: MachineId) -> u32 {
        (id.0 / self.num_partitions) % self.num_replicas
    }

    pub fn partition_of(&self, id: MachineId) -> PartitionId {
        id.0 % self.num_partitions
    }

    pub fn all_machines(&self) -> impl Iterator<Item = MachineId> {
        (0..self.num_machines()).map(MachineId)
    }

    /// Peers of `from`, nearest first per the distance ranking when one is
    /// configured.
    pub fn machines_by_distance(&self, from: MachineId) -> Vec<MachineId> {
        match self.distance_ranking.get(from.0 as usize) {
        | Some(ranked) if !ranked.is_empty() => ranked.iter().map(|id| MachineId(*id)).collect(),
        | _ => self.all_machines().filter(|id| *id != from).collect(),
        }
    }

    /// Stable partition assignment from the leading key bytes.
    pub fn partition_of_key(&self, key: &[u8]) -> PartitionId {
        let prefix = &key[..key.len().min(self.partition_key_bytes)];
        (fnv1a(prefix) % self.num_partitions as u64) as PartitionId
    }

    /// Port serving a channel, before the per-machine stride.
    pub fn base_port(&self, channel: Channel) -> u16 {
        if channel >= message::MAX_CHANNEL {
            return *self.broker_ports.last().expect("[CONFIG ERROR]: no broker ports");
        }
        match channel {
        | message::FORWARDER => self.forwarder_port,
        | message::SEQUENCER => self.sequencer_port,
        | message::CLOCK_SYNCHRONIZER => self.clock_synchronizer_port,
        | _ => self.broker_ports[0],
        }
    }

    /// Actual port of `channel` on machine `id`.
    pub fn port(&self, id: MachineId, channel: Channel) -> u16 {
        self.base_port(channel) + id.0 as u16 * self.port_stride
    }

    /// All ports machine `id` must listen on for envelope traffic.
    pub fn listen_ports(&self, id: MachineId) -> Vec<u16> {
        let stride = id.0 as u16 * self.port_stride;
        let mut ports: Vec<u16> = self.broker_ports.iter().map(|p| p + stride).collect();
        ports.push(self.forwarder_port + stride);
        ports.push(self.sequencer_port + stride);
        ports.push(self.clock_synchronizer_port + stride);
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub fn client_port_of(&self, id: MachineId) -> u16 {
        self.client_port + id.0 as u16 * self.port_stride
    }

    pub fn address_of(&self, id: MachineId) -> &str {
        &self.addresses[id.0 as usize]
    }

    /// Sequencer-log group: by default one acceptor per region (replica 0,
    /// partition 0), every machine a learner.
    pub fn log_members(&self) -> PaxosMembers {
        self.resolve_group(&self.log_group)
    }

    /// Remaster group: same default membership as the log group, entirely
    /// independent slot space.
    pub fn remaster_members(&self) -> PaxosMembers {
        self.resolve_group(&self.remaster_group)
    }

    fn resolve_group(&self, group: &Option<PaxosGroup>) -> PaxosMembers {
        match group {
        | Some(group) => PaxosMembers {
            acceptors: group.acceptors.iter().map(|id| MachineId(*id)).collect(),
            learners: group.learners.iter().map(|id| MachineId(*id)).collect(),
        },
        | None => PaxosMembers {
            acceptors: (0..self.num_regions).map(|r| self.machine_id(r, 0, 0)).collect(),
            learners: self.all_machines().collect(),
        },
        }
    }

    /// The machine coordinating multi-home ordering: the log group's
    /// elected leader.
    pub fn mh_orderer(&self) -> MachineId {
        self.log_members().leader()
    }

    /// The machine sequencing a region: one voice per region so batch
    /// sequence numbers stay contiguous.
    pub fn sequencer_for(&self, region: RegionId) -> MachineId {
        self.machine_id(region, 0, 0)
    }

    /// A minimal single-host config for `machines` laid out as one region,
    /// one replica. Tests grow it from here.
    pub fn localhost(num_regions: u32, num_replicas: u32, num_partitions: u32, base_port: u16) -> Self {
        let machines = num_regions * num_replicas * num_partitions;
        Config {
            protocol: default_protocol(),
            addresses: (0..machines).map(|_| "127.0.0.1".to_string()).collect(),
            num_regions,
            num_replicas,
            num_partitions,
            broker_ports: vec![base_port],
            forwarder_port: base_port + 1,
            sequencer_port: base_port + 2,
            clock_synchronizer_port: base_port + 3,
            client_port: base_port + 4,
            port_stride: 8,
            batch_interval_ms: default_batch_interval_ms(),
            clock_interval_ms: default_clock_interval_ms(),
            lock_manager: default_lock_manager(),
            execution: default_execution(),
            metadata_initializer: default_metadata_initializer(),
            partition_key_bytes: default_partition_key_bytes(),
            distance_ranking: Vec::new(),
            metadata_overrides: Vec::new(),
            log_group: None,
            remaster_group: None,
        }
    }
}

pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_bijection() {
        let config = Config::localhost(3, 2, 4, 20000);
        for region in 0..3 {
            for replica in 0..2 {
                for partition in 0..4 {
                    let id = config.machine_id(region, replica, partition);
                    assert_eq!(config.region_of(id), region);
                    assert_eq!(config.replica_of(id), replica);
                    assert_eq!(config.partition_of(id), partition);
                }
            }
        }
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        let config = Config::localhost(1, 1, 4, 20000);
        let p1 = config.partition_of_key(b"some-key");
        let p2 = config.partition_of_key(b"some-key");
        assert_eq!(p1, p2);
        assert!(p1 < 4);
    }

    #[test]
    fn dedicated_ports_differ_from_broker_ports() {
        let config = Config::localhost(1, 1, 1, 20000);
        let id = MachineId(0);
        assert_ne!(config.port(id, crate::message::FORWARDER), config.port(id, crate::message::SCHEDULER));
        assert_eq!(
            config.port(id, crate::message::MAX_CHANNEL + 5),
            *config.broker_ports.last().unwrap(),
        );
    }

    #[test]
    fn default_log_group_spans_regions() {
        let config = Config::localhost(3, 2, 2, 20000);
        let members = config.log_members();
        assert_eq!(members.acceptors.len(), 3);
        assert_eq!(members.learners.len(), 12);
        assert_eq!(members.leader(), config.machine_id(0, 0, 0));
    }

    #[test]
    fn config_parses_from_json() {
        let json = r#"{
            "addresses": ["127.0.0.1", "127.0.0.1"],
            "num_regions": 2,
            "num_replicas": 1,
            "num_partitions": 1,
            "lock_manager": "ddr",
            "execution": "key_value"
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.num_machines(), 2);
        assert_eq!(config.lock_manager, LockManagerMode::Ddr);
        assert_eq!(config.batch_interval_ms, 5);
    }
}
