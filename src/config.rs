/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator, split into the node-local identity options and the
//! group-wide multicast parameters. Parsing a config file into these structs is the operator
//! front-end's job, not this library's.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{Endpoints, NodeId, SendAlgorithm};

/// Identity and bootstrap options of the local node. These never travel over the wire.
#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub local_id: NodeId,
    pub local_ip: String,
    /// Address of the group leader to contact on startup. A node whose own GMS endpoint equals
    /// this one starts as the leader.
    pub leader_ip: String,
    pub leader_gms_port: u16,
    pub gms_port: u16,
    pub rpc_port: u16,
    pub sst_port: u16,
    pub bulk_port: u16,
    /// Directory holding the saved `view` file and the `ragged_trim_*` files. A `view` file found
    /// here at startup forces total-restart mode.
    pub storage_dir: std::path::PathBuf,
}

impl NodeOptions {
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            ip: self.local_ip.clone(),
            gms_port: self.gms_port,
            rpc_port: self.rpc_port,
            sst_port: self.sst_port,
            bulk_port: self.bulk_port,
        }
    }

    /// Whether this node is the configured group leader.
    pub fn is_group_leader(&self) -> bool {
        self.local_ip == self.leader_ip && self.gms_port == self.leader_gms_port
    }
}

/// Low-level parameters of the multicast pipeline. The leader serializes these to every joining
/// node along with the initial view, so all members run with identical values.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GroupParams {
    /// Upper bound on any message payload.
    pub max_payload_size: u64,
    /// Threshold below which the shared-slot ring is used instead of the bulk transport.
    pub max_smc_payload_size: u64,
    /// Bulk transport block granularity.
    pub block_size: u64,
    /// Flow-control depth per subgroup: a sender may run at most this many messages ahead of the
    /// slowest shard member.
    pub window_size: u32,
    /// Stability-frontier tick, and the time a sender may wait on an unstable message before the
    /// situation is treated as a liveness signal.
    pub timeout_ms: u32,
    /// Topology for the bulk transport.
    pub send_algorithm: SendAlgorithm,
}

impl Default for GroupParams {
    fn default() -> Self {
        Self {
            max_payload_size: 10240,
            max_smc_payload_size: 1024,
            block_size: 1024,
            window_size: 3,
            timeout_ms: 1000,
            send_algorithm: SendAlgorithm::BinomialSend,
        }
    }
}
