/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected but have no active behavior. [`NodeId`] and
//! [`Version`] follow the newtype pattern; the various internal index types are plain aliases so
//! they can be used directly as vector indices and counter values.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};

/// Id of an installed membership snapshot. Strictly increasing, gap-free at every surviving
/// member.
pub type ViewId = i32;

/// A message's per-shard sequence number, or a sender's per-subgroup message index. Starts at 0;
/// the value -1 means "nothing yet".
pub type MessageId = i32;

/// Internal id of a subgroup, assigned by the view manager in type-order during provisioning.
pub type SubgroupId = u32;

/// Numeric id of a subgroup type: its index in the ordered list of types the group was built
/// with.
pub type SubgroupTypeId = u32;

/// Index of a shard within a subgroup.
pub type ShardNum = u32;

/// The stable numeric identity of a node. Never reused while the id is a member of any live
/// view.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A 64-bit value packing `(vid, seq_num)`. Monotone across the lifetime of a subgroup, and
/// uniquely identifies a delivered message across the lifetime of the group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, BorshSerialize, BorshDeserialize)]
pub struct Version(i64);

impl Version {
    /// The version assigned to messages that never get one (unordered deliveries, undelivered
    /// messages).
    pub const INVALID: Version = Version(-1);

    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> i64 {
        self.0
    }

    /// Combine a view id and a sequence number into a version. The view id occupies the upper 32
    /// bits, so versions from a later view always compare greater.
    pub const fn pack(vid: ViewId, seq_num: MessageId) -> Version {
        Version(((vid as i64) << 32) | (seq_num as u32 as i64))
    }

    /// Recover the `(vid, seq_num)` pair this version was packed from.
    pub const fn unpack(&self) -> (ViewId, MessageId) {
        ((self.0 >> 32) as ViewId, self.0 as u32 as MessageId)
    }

    pub const fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A hybrid logical clock reading attached to each staged version: a real-time component in
/// microseconds and a logical counter to break ties.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct Hlc {
    pub rtc_us: u64,
    pub logical: u64,
}

impl Hlc {
    pub const fn new(rtc_us: u64, logical: u64) -> Self {
        Self { rtc_us, logical }
    }
}

/// The four endpoints a member listens on, together with its address. Exchanged during the join
/// protocol and carried in every [`View`](crate::view::View).
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Endpoints {
    pub ip: String,
    pub gms_port: u16,
    pub rpc_port: u16,
    pub sst_port: u16,
    pub bulk_port: u16,
}

impl Display for Endpoints {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:[gms={},rpc={},sst={},bulk={}]",
            self.ip, self.gms_port, self.rpc_port, self.sst_port, self.bulk_port
        )
    }
}

/// Delivery discipline of a subgroup.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum DeliveryMode {
    /// Messages are delivered in strictly increasing sequence order, without gaps, once globally
    /// stable.
    Ordered,
    /// Messages are delivered at the receive site as soon as they arrive. No cross-member
    /// ordering, no persistence.
    Unordered,
}

/// Topology used by the bulk transport to construct a multicast out of point-to-point block
/// transfers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum SendAlgorithm {
    BinomialSend,
    ChainSend,
    SequentialSend,
    TreeSend,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_pack_unpack_roundtrip() {
        for (vid, seq) in [(0, 0), (0, 99), (3, 89), (17, i32::MAX), (i32::MAX, 0)] {
            let version = Version::pack(vid, seq);
            assert_eq!(version.unpack(), (vid, seq));
            assert!(version.is_valid());
        }
    }

    #[test]
    fn versions_are_monotone_across_views() {
        // Every version of view v+1 must compare greater than every version of view v.
        let last_of_old = Version::pack(4, i32::MAX);
        let first_of_new = Version::pack(5, 0);
        assert!(first_of_new > last_of_old);
        assert!(Version::pack(5, 1) > first_of_new);
    }

    #[test]
    fn invalid_version_is_not_valid() {
        assert!(!Version::INVALID.is_valid());
        assert!(Version::pack(0, 0) > Version::INVALID);
    }
}
