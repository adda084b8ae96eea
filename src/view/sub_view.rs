/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The membership snapshot of a single shard of a subgroup.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::GroupError;
use crate::types::basic::{DeliveryMode, NodeId};

/// One shard's slice of a [`View`](super::View): its members, which of them send, and the
/// delivery discipline. Immutable once the view is published.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct SubView {
    pub mode: DeliveryMode,
    pub members: Vec<NodeId>,
    /// Parallel to `members`: whether each member originates multicasts.
    pub is_sender: Vec<bool>,
    /// Members of this shard that were not in the same (type, index) shard of the previous view.
    pub joined: Vec<NodeId>,
    /// Members of the previous view's shard that are gone from this one.
    pub departed: Vec<NodeId>,
    /// The local node's rank within the shard. Derived locally, never trusted off the wire.
    #[borsh(skip)]
    pub my_rank: Option<usize>,
}

impl SubView {
    /// A shard in which every member sends.
    pub fn new(mode: DeliveryMode, members: Vec<NodeId>) -> SubView {
        let num_members = members.len();
        SubView {
            mode,
            members,
            is_sender: vec![true; num_members],
            joined: Vec::new(),
            departed: Vec::new(),
            my_rank: None,
        }
    }

    /// A shard with an explicit sender vector.
    pub fn with_senders(mode: DeliveryMode, members: Vec<NodeId>, is_sender: Vec<bool>) -> SubView {
        assert_eq!(members.len(), is_sender.len());
        SubView {
            mode,
            members,
            is_sender,
            joined: Vec::new(),
            departed: Vec::new(),
            my_rank: None,
        }
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == node)
    }

    /// The rank of a member among the shard's senders, or `None` if it is not a sender.
    pub fn sender_rank_of(&self, shard_rank: usize) -> Option<usize> {
        if !self.is_sender[shard_rank] {
            return None;
        }
        Some(self.is_sender[..shard_rank].iter().filter(|s| **s).count())
    }

    pub fn num_senders(&self) -> usize {
        self.is_sender.iter().filter(|s| **s).count()
    }

    /// A single-member shard skips bulk-group creation entirely, so it cannot host more than one
    /// sender. Checked once at view-construction time.
    pub fn validate(&self) -> Result<(), GroupError> {
        if self.members.len() == 1 && self.num_senders() > 1 {
            return Err(GroupError::InvariantViolation(
                "a single-member shard cannot have more than one sender".to_string(),
            ));
        }
        if self.members.len() != self.is_sender.len() {
            return Err(GroupError::InvariantViolation(
                "is_sender vector must parallel the member list".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[u32]) -> Vec<NodeId> {
        ids.iter().map(|i| NodeId::new(*i)).collect()
    }

    #[test]
    fn sender_ranks_skip_non_senders() {
        let sub_view = SubView::with_senders(
            DeliveryMode::Ordered,
            ids(&[5, 7, 9, 11]),
            vec![true, false, true, true],
        );
        assert_eq!(sub_view.num_senders(), 3);
        assert_eq!(sub_view.sender_rank_of(0), Some(0));
        assert_eq!(sub_view.sender_rank_of(1), None);
        assert_eq!(sub_view.sender_rank_of(2), Some(1));
        assert_eq!(sub_view.sender_rank_of(3), Some(2));
    }

    #[test]
    fn single_member_multi_sender_shard_is_rejected() {
        let mut sub_view = SubView::new(DeliveryMode::Ordered, ids(&[1]));
        assert!(sub_view.validate().is_ok());
        sub_view.is_sender = vec![true, true];
        assert!(sub_view.validate().is_err());
    }
}
