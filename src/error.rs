/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The error taxonomy of the group. Local failures (a failed multicast buffer, a stalled timer)
//! are retried internally and never surface here; protocol-level violations are fatal because
//! they indicate corruption of the shared status table.

use thiserror::Error;

use crate::types::basic::NodeId;

#[derive(Debug, Error)]
pub enum GroupError {
    /// The local node is no longer in the majority and must shut down.
    #[error("potential partitioning event: this node is no longer in the majority and must shut down")]
    PartitionAbort,

    /// The leader's TCP connection died while this node was joining. The caller may retry at the
    /// new leader.
    #[error("leader crashed during join: {0}")]
    LeaderCrashDuringJoin(&'static str),

    /// The leader refused the join because the node id is already a member.
    #[error("leader rejected join, id {0} already in use")]
    IdInUse(NodeId),

    /// A remote member proposed removing this node; it must terminate.
    #[error("another node reported that node {0} failed; terminating")]
    RemovedFromView(NodeId),

    /// The pending-changes list is at capacity; the join is refused until changes commit.
    #[error("too many pending changes to allow a join right now")]
    TooManyPendingChanges,

    /// The membership function could not allocate shards for every subgroup. Non-fatal; retried
    /// on the next membership change.
    #[error("view is not adequately provisioned")]
    InadequatelyProvisioned,

    /// A counter or cut invariant was violated on the shared status table.
    #[error("protocol invariant violated: {0}")]
    InvariantViolation(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
