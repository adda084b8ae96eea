/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Membership snapshots. A [`View`] is an immutable record of who is in the group, which nodes
//! within it form each subgroup's shards, and which members have failed since the view was
//! installed. Views are created by the view manager, read by every component, and never mutated
//! after publication.

pub mod sub_view;

pub mod subgroup_info;

pub use sub_view::SubView;
pub use subgroup_info::{ShardLayout, SubgroupInfo, SubgroupSettings, SubgroupType};

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::types::basic::{Endpoints, NodeId, ShardNum, SubgroupId, ViewId};

/// An immutable membership snapshot, identified by its `vid`. The sequence of vids installed at
/// any surviving member is prefix-closed, strictly increasing, and gap-free.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct View {
    pub vid: ViewId,
    /// Members in rank order. New joiners go at the end.
    pub members: Vec<NodeId>,
    /// Parallel to `members`.
    pub member_endpoints: Vec<Endpoints>,
    /// Parallel to `members`: members that failed *after* this view was installed. A view is
    /// never installed containing an already-failed member.
    pub failed: Vec<bool>,
    pub num_failed: u32,
    /// Members that joined relative to the previous view.
    pub joined: Vec<NodeId>,
    /// Members that departed relative to the previous view.
    pub departed: Vec<NodeId>,
    /// Rank of the local node. Derived locally after construction or receipt, never trusted off
    /// the wire.
    #[borsh(skip)]
    pub my_rank: Option<usize>,
    /// High-water mark used by membership functions that allocate members to shards in rank
    /// order.
    pub next_unassigned_rank: i32,
    /// `subgroup_shard_views[subgroup_id][shard_num]` = that shard's membership. Filled in by
    /// provisioning.
    pub subgroup_shard_views: Vec<Vec<SubView>>,
    /// `subgroup_ids_by_type_id[type_id][subgroup_index]` = the subgroup id assigned to that
    /// (type, index) pair in this view.
    pub subgroup_ids_by_type_id: Vec<Vec<SubgroupId>>,
    /// The shard number of every subgroup the local node belongs to.
    pub my_subgroups: BTreeMap<SubgroupId, ShardNum>,
    /// True iff the membership function allocated a non-empty shard list to every subgroup.
    pub is_adequately_provisioned: bool,
}

impl View {
    /// The trivial first view: one member, no subgroups provisioned yet.
    pub fn singleton(my_id: NodeId, endpoints: Endpoints) -> View {
        View::new(0, vec![my_id], vec![endpoints], vec![false], vec![], vec![], 0)
    }

    pub fn new(
        vid: ViewId,
        members: Vec<NodeId>,
        member_endpoints: Vec<Endpoints>,
        failed: Vec<bool>,
        joined: Vec<NodeId>,
        departed: Vec<NodeId>,
        next_unassigned_rank: i32,
    ) -> View {
        let num_failed = failed.iter().filter(|f| **f).count() as u32;
        View {
            vid,
            members,
            member_endpoints,
            failed,
            num_failed,
            joined,
            departed,
            my_rank: None,
            next_unassigned_rank,
            subgroup_shard_views: Vec::new(),
            subgroup_ids_by_type_id: Vec::new(),
            my_subgroups: BTreeMap::new(),
            is_adequately_provisioned: false,
        }
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == node)
    }

    /// Set `my_rank` for the given local id. Called after a view is received or constructed.
    pub fn localize(&mut self, my_id: NodeId) {
        self.my_rank = self.rank_of(my_id);
    }

    /// The current leader: the lowest-ranked member that has not failed.
    pub fn rank_of_leader(&self) -> usize {
        self.failed.iter().position(|f| !*f).unwrap_or(0)
    }

    pub fn i_am_leader(&self) -> bool {
        self.my_rank == Some(self.rank_of_leader())
    }

    /// The lowest-ranked non-failed member of the given shard, or `None` if the whole shard has
    /// failed.
    pub fn subview_rank_of_shard_leader(
        &self,
        subgroup_id: SubgroupId,
        shard_num: ShardNum,
    ) -> Option<usize> {
        let shard = &self.subgroup_shard_views[subgroup_id as usize][shard_num as usize];
        shard.members.iter().position(|member| {
            self.rank_of(*member)
                .map(|rank| !self.failed[rank])
                .unwrap_or(false)
        })
    }

    /// Mark a member failed. Only the view manager calls this, under its view lock; all other
    /// holders treat the view as immutable.
    pub(crate) fn mark_failed(&mut self, rank: usize) {
        if !self.failed[rank] {
            self.failed[rank] = true;
            self.num_failed += 1;
        }
    }

    /// One-line summary for protocol logs.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "View {} members [", self.vid);
        for (rank, member) in self.members.iter().enumerate() {
            let mark = if self.failed[rank] { "!" } else { "" };
            let sep = if rank == 0 { "" } else { " " };
            let _ = write!(out, "{}{}{}", sep, member, mark);
        }
        let _ = write!(
            out,
            "] joined {:?} departed {:?} subgroups {}",
            self.joined.iter().map(|n| n.int()).collect::<Vec<_>>(),
            self.departed.iter().map(|n| n.int()).collect::<Vec<_>>(),
            self.subgroup_shard_views.len()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::DeliveryMode;

    fn endpoints(n: u32) -> Endpoints {
        Endpoints {
            ip: "127.0.0.1".to_string(),
            gms_port: 23580 + n as u16,
            rpc_port: 28366,
            sst_port: 37683,
            bulk_port: 31675,
        }
    }

    fn three_member_view() -> View {
        let members: Vec<NodeId> = (0..3).map(NodeId::new).collect();
        let eps = (0..3).map(endpoints).collect();
        View::new(1, members, eps, vec![false; 3], vec![], vec![], 0)
    }

    #[test]
    fn leader_is_lowest_ranked_non_failed_member() {
        let mut view = three_member_view();
        assert_eq!(view.rank_of_leader(), 0);
        view.mark_failed(0);
        assert_eq!(view.rank_of_leader(), 1);
        assert_eq!(view.num_failed, 1);
    }

    #[test]
    fn shard_leader_skips_failed_members() {
        let mut view = three_member_view();
        view.subgroup_shard_views = vec![vec![SubView::new(
            DeliveryMode::Ordered,
            vec![NodeId::new(1), NodeId::new(2)],
        )]];
        assert_eq!(view.subview_rank_of_shard_leader(0, 0), Some(0));
        view.mark_failed(1);
        assert_eq!(view.subview_rank_of_shard_leader(0, 0), Some(1));
        view.mark_failed(2);
        assert_eq!(view.subview_rank_of_shard_leader(0, 0), None);
    }
}
