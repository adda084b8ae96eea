/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The boundary to the external persistence backend: the [`ReplicatedObject`] trait the storage
//! layer implements per subgroup, the factories that create objects by subgroup type, and the
//! two files this library itself keeps per node: the latest installed `view` and one
//! `ragged_trim_<subgroup>_<shard>` per shard the node belongs to.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::GroupError;
use crate::types::basic::{MessageId, ShardNum, SubgroupId, SubgroupTypeId, Version, ViewId};
use crate::view::View;

/// The replicated state of one subgroup, owned by the external persistence backend. The view
/// manager drives it at view boundaries: truncation after a ragged trim, and state transfer to
/// joining members over TCP.
pub trait ReplicatedObject: Send {
    /// Whether the object keeps a persistent log. Objects without one are rebuilt from a peer on
    /// every restart and never force total-restart mode.
    fn is_persistent(&self) -> bool;

    /// Discard any logged versions newer than `latest`. Called after a ragged trim is agreed.
    fn truncate(&mut self, latest: Version);

    /// The newest version that is known persisted across every field of the object.
    fn minimum_latest_persisted_version(&self) -> Version;

    /// Announce the version about to be delivered, so reads during the delivery see a consistent
    /// version boundary.
    fn post_next_version(&mut self, version: Version);

    /// Versions at or below `earliest` may be omitted when the object is next serialized for
    /// state transfer; the receiver already has them.
    fn set_earliest_version_to_serialize(&mut self, earliest: Version);

    /// Serialize the full object state (and log tail) to a joining member.
    fn send_object(&mut self, stream: &mut TcpStream) -> io::Result<()>;

    /// Replace local state with what a shard leader serialized.
    fn receive_object(&mut self, stream: &mut TcpStream) -> io::Result<()>;
}

/// Creates the [`ReplicatedObject`] for a subgroup. Factories are registered per subgroup type
/// id; the view manager invokes them as subgroups are provisioned.
pub type ObjectFactory = Box<dyn Fn(SubgroupId) -> Box<dyn ReplicatedObject> + Send + Sync>;

/// The replicated objects of every subgroup the local node belongs to, keyed by subgroup id.
/// Shared with the multicast engine's delivery path through `post_next_version`.
pub type ObjectRegistry = Arc<Mutex<BTreeMap<SubgroupId, Box<dyn ReplicatedObject>>>>;

/// Factories keyed by numeric subgroup type id.
pub type FactoryMap = BTreeMap<SubgroupTypeId, ObjectFactory>;

/// The per-shard decision of how many messages from each sender are delivered in a dying view.
/// Logged to disk before the trim is applied, and exchanged during total restart.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RaggedTrim {
    pub subgroup_id: SubgroupId,
    pub shard_num: ShardNum,
    pub vid: ViewId,
    /// Id of the leader that approved this trim; `RESTART_LEADER_ID` when stamped by a restart
    /// leader.
    pub leader_id: i64,
    pub max_received_by_sender: Vec<MessageId>,
}

/// The `leader_id` a restart leader stamps onto trims it re-approves.
pub const RESTART_LEADER_ID: i64 = i64::MAX;

impl RaggedTrim {
    /// The highest version the trim lets survive: the latest sequence number any sender's cut
    /// implies, packed with the dying view's id.
    pub fn to_latest_version(&self) -> Version {
        ragged_trim_to_latest_version(self.vid, &self.max_received_by_sender)
    }
}

/// See [`RaggedTrim::to_latest_version`].
pub fn ragged_trim_to_latest_version(vid: ViewId, max_received_by_sender: &[MessageId]) -> Version {
    let num_senders = max_received_by_sender.len() as MessageId;
    let latest_seq = max_received_by_sender
        .iter()
        .enumerate()
        .filter(|(_, index)| **index >= 0)
        .map(|(sender, index)| *index * num_senders + sender as MessageId)
        .max();
    match latest_seq {
        Some(seq) => Version::pack(vid, seq),
        None => Version::INVALID,
    }
}

pub fn view_filename() -> &'static str {
    "view"
}

pub fn ragged_trim_filename(subgroup_id: SubgroupId, shard_num: ShardNum) -> String {
    format!("ragged_trim_{}_{}", subgroup_id, shard_num)
}

/// Persist the latest installed view. Written through a temporary file so a crash mid-write
/// leaves the previous view intact.
pub fn save_view(dir: &Path, view: &View) -> Result<(), GroupError> {
    fs::create_dir_all(dir)?;
    let bytes = borsh::to_vec(view).map_err(GroupError::Io)?;
    let tmp = dir.join(format!("{}.swap", view_filename()));
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, dir.join(view_filename()))?;
    Ok(())
}

/// Load the saved view, if one exists. A `view` file on disk is what forces total-restart mode.
pub fn load_view(dir: &Path) -> Option<View> {
    let bytes = fs::read(dir.join(view_filename())).ok()?;
    View::try_from_slice(&bytes).ok()
}

pub fn save_ragged_trim(dir: &Path, trim: &RaggedTrim) -> Result<(), GroupError> {
    fs::create_dir_all(dir)?;
    let bytes = borsh::to_vec(trim).map_err(GroupError::Io)?;
    let name = ragged_trim_filename(trim.subgroup_id, trim.shard_num);
    let tmp = dir.join(format!("{}.swap", name));
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

pub fn load_ragged_trim(dir: &Path, subgroup_id: SubgroupId, shard_num: ShardNum) -> Option<RaggedTrim> {
    let bytes = fs::read(dir.join(ragged_trim_filename(subgroup_id, shard_num))).ok()?;
    RaggedTrim::try_from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_version_takes_the_maximum_implied_sequence() {
        // Three senders, cuts at indices 2, 3, 1: sequences 6, 10, 5. The latest is 10.
        let version = ragged_trim_to_latest_version(4, &[2, 3, 1]);
        assert_eq!(version.unpack(), (4, 10));
    }

    #[test]
    fn latest_version_of_an_empty_log_is_invalid() {
        assert_eq!(ragged_trim_to_latest_version(4, &[-1, -1]), Version::INVALID);
        // One sender delivered nothing, the other delivered index 0 (sequence 1).
        assert_eq!(ragged_trim_to_latest_version(4, &[-1, 0]).unpack(), (4, 1));
    }
}
