/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The user-supplied membership function and the per-subgroup settings the multicast engine is
//! configured with.
//!
//! Subgroup types are enumerated once at group construction and referred to by numeric id (their
//! index in that order) from then on. On every proposed membership change the view manager
//! re-runs the membership function over the new member list; if it cannot allocate a non-empty
//! shard list for some subgroup, the proposed view is marked not adequately provisioned and view
//! transitions stall until further joins or leaves change that verdict.

use std::collections::BTreeMap;

use crate::error::GroupError;
use crate::types::basic::{DeliveryMode, NodeId, ShardNum, SubgroupId, SubgroupTypeId};

use super::sub_view::SubView;
use super::View;

/// One entry in the ordered list of subgroup types the group was constructed with. Stateless
/// ("raw") types have no replicated object and therefore no shard leaders to pull state from.
#[derive(Clone, Debug)]
pub struct SubgroupType {
    pub name: String,
    pub stateful: bool,
}

impl SubgroupType {
    pub fn stateful(name: impl Into<String>) -> SubgroupType {
        SubgroupType {
            name: name.into(),
            stateful: true,
        }
    }

    pub fn raw(name: impl Into<String>) -> SubgroupType {
        SubgroupType {
            name: name.into(),
            stateful: false,
        }
    }
}

/// What the membership function produces for one subgroup type:
/// `layout[subgroup_index][shard_num]` = that shard's [`SubView`].
pub type ShardLayout = Vec<Vec<SubView>>;

/// The user-supplied sharding policy. The function must be pure: called with the same views it
/// must produce the same layout. Signalling inadequacy is done by returning
/// [`GroupError::InadequatelyProvisioned`].
pub struct SubgroupInfo {
    pub membership_function:
        Box<dyn Fn(SubgroupTypeId, Option<&View>, &View) -> Result<ShardLayout, GroupError> + Send + Sync>,
}

impl SubgroupInfo {
    pub fn new(
        membership_function: impl Fn(SubgroupTypeId, Option<&View>, &View) -> Result<ShardLayout, GroupError>
            + Send
            + Sync
            + 'static,
    ) -> SubgroupInfo {
        SubgroupInfo {
            membership_function: Box::new(membership_function),
        }
    }
}

/// The local node's settings for one subgroup it belongs to, extracted from the [`SubView`] but
/// tailored to what the multicast engine needs.
#[derive(Clone, Debug)]
pub struct SubgroupSettings {
    /// Which shard of the subgroup the local node is in.
    pub shard_num: ShardNum,
    /// The local node's rank within that shard.
    pub shard_rank: usize,
    /// The members of the shard.
    pub members: Vec<NodeId>,
    /// Parallel to `members`.
    pub senders: Vec<bool>,
    /// The local node's rank among the shard's senders, or `None` if it does not send.
    pub sender_rank: Option<usize>,
    /// The start column of this subgroup's per-sender receive counters in the SST.
    pub num_received_offset: usize,
    pub mode: DeliveryMode,
}

impl SubgroupSettings {
    pub fn num_senders(&self) -> usize {
        self.senders.iter().filter(|s| **s).count()
    }

    /// `shard_ranks_by_sender_rank[sender_rank]` = the sender's rank within the shard.
    pub fn shard_ranks_by_sender_rank(&self) -> Vec<usize> {
        self.senders
            .iter()
            .enumerate()
            .filter(|(_, is_sender)| **is_sender)
            .map(|(shard_rank, _)| shard_rank)
            .collect()
    }
}

/// Run the membership function for every subgroup type over `curr_view`, assign subgroup ids in
/// type order, fill in the view's shard layout and the local node's [`SubgroupSettings`], and
/// return the total width of the per-sender receive-counter columns.
///
/// If the membership function signals inadequacy, the view is marked not adequately provisioned,
/// everything allocated so far is rolled back, and `Ok(0)` is returned: inadequacy is a stall,
/// not an error. Invalid shard configurations are errors.
pub fn make_subgroup_maps(
    subgroup_info: &SubgroupInfo,
    type_order: &[SubgroupType],
    prev_view: Option<&View>,
    curr_view: &mut View,
    subgroup_settings: &mut BTreeMap<SubgroupId, SubgroupSettings>,
) -> Result<usize, GroupError> {
    let my_id = curr_view.members[curr_view.my_rank.expect("view must be localized before provisioning")];
    let initial_next_unassigned_rank = curr_view.next_unassigned_rank;
    curr_view.subgroup_shard_views.clear();
    curr_view.subgroup_ids_by_type_id.clear();
    curr_view.my_subgroups.clear();
    subgroup_settings.clear();
    let mut num_received_offset = 0;

    for (type_id, _) in type_order.iter().enumerate() {
        let layout = match (subgroup_info.membership_function)(
            type_id as SubgroupTypeId,
            prev_view,
            curr_view,
        ) {
            Ok(layout) => layout,
            Err(GroupError::InadequatelyProvisioned) => {
                // Roll back everything done by previous allocation functions.
                curr_view.is_adequately_provisioned = false;
                curr_view.next_unassigned_rank = initial_next_unassigned_rank;
                curr_view.subgroup_shard_views.clear();
                curr_view.subgroup_ids_by_type_id.clear();
                curr_view.my_subgroups.clear();
                subgroup_settings.clear();
                return Ok(0);
            }
            Err(other) => return Err(other),
        };

        let mut subgroup_ids = Vec::with_capacity(layout.len());
        for mut shards in layout {
            let subgroup_id = curr_view.subgroup_shard_views.len() as SubgroupId;
            subgroup_ids.push(subgroup_id);
            let mut max_shard_senders = 0;
            for (shard_num, shard_view) in shards.iter_mut().enumerate() {
                shard_view.validate()?;
                let shard_size = shard_view.members.len();
                if shard_view.num_senders() > max_shard_senders {
                    max_shard_senders = shard_size;
                }
                shard_view.my_rank = shard_view.rank_of(my_id);
                if let Some(shard_rank) = shard_view.my_rank {
                    curr_view.my_subgroups.insert(subgroup_id, shard_num as ShardNum);
                    subgroup_settings.insert(
                        subgroup_id,
                        SubgroupSettings {
                            shard_num: shard_num as ShardNum,
                            shard_rank,
                            members: shard_view.members.clone(),
                            senders: shard_view.is_sender.clone(),
                            sender_rank: shard_view.sender_rank_of(shard_rank),
                            num_received_offset,
                            mode: shard_view.mode,
                        },
                    );
                }
                if let Some(prev_view) = prev_view {
                    // Diff against the same (type, index) shard of the previous view.
                    let subgroup_index = subgroup_ids.len() - 1;
                    if let Some(prev_subgroup_id) = prev_view
                        .subgroup_ids_by_type_id
                        .get(type_id)
                        .and_then(|ids| ids.get(subgroup_index))
                    {
                        if let Some(prev_shard) = prev_view
                            .subgroup_shard_views
                            .get(*prev_subgroup_id as usize)
                            .and_then(|shards| shards.get(shard_num))
                        {
                            shard_view.joined = shard_view
                                .members
                                .iter()
                                .filter(|m| !prev_shard.members.contains(m))
                                .cloned()
                                .collect();
                            shard_view.departed = prev_shard
                                .members
                                .iter()
                                .filter(|m| !shard_view.members.contains(m))
                                .cloned()
                                .collect();
                        }
                    }
                }
            }
            curr_view.subgroup_shard_views.push(shards);
            num_received_offset += max_shard_senders;
        }
        curr_view.subgroup_ids_by_type_id.push(subgroup_ids);
    }

    curr_view.is_adequately_provisioned = true;
    Ok(num_received_offset)
}

/// Derive the local [`SubgroupSettings`] from a view whose shard layout was computed elsewhere
/// (the leader serialized it to us). Returns the receive-counter column width.
pub fn derive_subgroup_settings(
    curr_view: &mut View,
    subgroup_settings: &mut BTreeMap<SubgroupId, SubgroupSettings>,
) -> Result<usize, GroupError> {
    let my_id = curr_view.members[curr_view.my_rank.expect("view must be localized before derivation")];
    curr_view.my_subgroups.clear();
    subgroup_settings.clear();
    let mut num_received_offset = 0;

    let mut shard_views = std::mem::take(&mut curr_view.subgroup_shard_views);
    for (subgroup_id, shards) in shard_views.iter_mut().enumerate() {
        let mut max_shard_senders = 0;
        for (shard_num, shard_view) in shards.iter_mut().enumerate() {
            shard_view.validate()?;
            let shard_size = shard_view.members.len();
            if shard_view.num_senders() > max_shard_senders {
                max_shard_senders = shard_size;
            }
            shard_view.my_rank = shard_view.rank_of(my_id);
            if let Some(shard_rank) = shard_view.my_rank {
                curr_view
                    .my_subgroups
                    .insert(subgroup_id as SubgroupId, shard_num as ShardNum);
                subgroup_settings.insert(
                    subgroup_id as SubgroupId,
                    SubgroupSettings {
                        shard_num: shard_num as ShardNum,
                        shard_rank,
                        members: shard_view.members.clone(),
                        senders: shard_view.is_sender.clone(),
                        sender_rank: shard_view.sender_rank_of(shard_rank),
                        num_received_offset,
                        mode: shard_view.mode,
                    },
                );
            }
        }
        num_received_offset += max_shard_senders;
    }
    curr_view.subgroup_shard_views = shard_views;

    Ok(num_received_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::Endpoints;

    fn test_view(num_members: u32) -> View {
        let members: Vec<NodeId> = (0..num_members).map(NodeId::new).collect();
        let endpoints = members
            .iter()
            .map(|m| Endpoints {
                ip: "127.0.0.1".to_string(),
                gms_port: 23580 + m.int() as u16,
                rpc_port: 28366,
                sst_port: 37683,
                bulk_port: 31675,
            })
            .collect();
        let mut view = View::new(
            0,
            members,
            endpoints,
            vec![false; num_members as usize],
            vec![],
            vec![],
            0,
        );
        view.localize(NodeId::new(0));
        view
    }

    /// One subgroup per type, every member in one ordered shard.
    fn one_shard_info(min_members: usize) -> SubgroupInfo {
        SubgroupInfo::new(move |_, _, curr_view| {
            if curr_view.num_members() < min_members {
                return Err(GroupError::InadequatelyProvisioned);
            }
            Ok(vec![vec![SubView::new(
                DeliveryMode::Ordered,
                curr_view.members.clone(),
            )]])
        })
    }

    #[test]
    fn provisioning_fills_settings_and_offsets() {
        let info = one_shard_info(1);
        let types = vec![SubgroupType::stateful("cache"), SubgroupType::raw("events")];
        let mut view = test_view(3);
        let mut settings = BTreeMap::new();
        let width = make_subgroup_maps(&info, &types, None, &mut view, &mut settings).unwrap();
        assert!(view.is_adequately_provisioned);
        assert_eq!(width, 6);
        assert_eq!(view.subgroup_shard_views.len(), 2);
        assert_eq!(view.subgroup_ids_by_type_id, vec![vec![0], vec![1]]);
        assert_eq!(settings[&0].num_received_offset, 0);
        assert_eq!(settings[&1].num_received_offset, 3);
        assert_eq!(settings[&0].sender_rank, Some(0));
        assert_eq!(view.my_subgroups.len(), 2);
    }

    #[test]
    fn inadequate_layout_stalls_without_error() {
        let info = one_shard_info(5);
        let types = vec![SubgroupType::stateful("cache")];
        let mut view = test_view(3);
        let mut settings = BTreeMap::new();
        let width = make_subgroup_maps(&info, &types, None, &mut view, &mut settings).unwrap();
        assert_eq!(width, 0);
        assert!(!view.is_adequately_provisioned);
        assert!(view.subgroup_shard_views.is_empty());
        assert!(settings.is_empty());
    }

    #[test]
    fn shard_diffs_are_computed_against_previous_view() {
        let info = one_shard_info(1);
        let types = vec![SubgroupType::stateful("cache")];
        let mut prev = test_view(2);
        let mut settings = BTreeMap::new();
        make_subgroup_maps(&info, &types, None, &mut prev, &mut settings).unwrap();

        let mut next = test_view(3);
        next.vid = 1;
        make_subgroup_maps(&info, &types, Some(&prev), &mut next, &mut settings).unwrap();
        let shard = &next.subgroup_shard_views[0][0];
        assert_eq!(shard.joined, vec![NodeId::new(2)]);
        assert!(shard.departed.is_empty());
    }
}
