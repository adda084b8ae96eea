/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The total-restart protocol. If a node finds a saved view on disk it refuses to start fresh:
//! the restart leader collects every rejoining node's latest view and ragged trims, picks the
//! highest-vid view as the base and the longest log in each shard as that shard's restart
//! leader, computes an adequately provisioned restart view, and two-phase commits it over TCP.

use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream};
use std::path::Path;

use crate::config::{GroupParams, NodeOptions};
use crate::error::GroupError;
use crate::persistence::{self, RaggedTrim, RESTART_LEADER_ID};
use crate::types::basic::{Endpoints, NodeId, ShardNum, SubgroupId, Version};
use crate::view::subgroup_info::{make_subgroup_maps, SubgroupInfo, SubgroupSettings, SubgroupType};
use crate::view::View;

use super::join::{self, JoinResponse, JoinResponseCode};

/// State a restarting node accumulates between reading its logs and rejoining a live view.
pub struct RestartState {
    /// The newest approved trim per (subgroup, shard), keyed by the base view's subgroup ids.
    pub logged_ragged_trim: BTreeMap<SubgroupId, BTreeMap<ShardNum, RaggedTrim>>,
    /// `restart_shard_leaders[subgroup_id][shard]` = node that must push object state, keyed by
    /// the restart view's subgroup ids.
    pub restart_shard_leaders: Vec<Vec<i64>>,
}

impl RestartState {
    /// Load the trims logged for every shard the saved view says this node belongs to.
    pub fn load_ragged_trim(view: &View, dir: &Path) -> RestartState {
        let mut logged_ragged_trim: BTreeMap<SubgroupId, BTreeMap<ShardNum, RaggedTrim>> =
            BTreeMap::new();
        for (subgroup_id, shard_num) in &view.my_subgroups {
            if let Some(trim) = persistence::load_ragged_trim(dir, *subgroup_id, *shard_num) {
                logged_ragged_trim
                    .entry(*subgroup_id)
                    .or_default()
                    .insert(*shard_num, trim);
            }
        }
        RestartState {
            logged_ragged_trim,
            restart_shard_leaders: Vec::new(),
        }
    }

    /// Record a trim if it is newer than the one already known for its shard.
    pub fn merge_trim(&mut self, trim: RaggedTrim) {
        let entry = self
            .logged_ragged_trim
            .entry(trim.subgroup_id)
            .or_default()
            .entry(trim.shard_num);
        match entry {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(trim);
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                if trim.to_latest_version() > slot.get().to_latest_version() {
                    slot.insert(trim);
                }
            }
        }
    }

    /// Stamp every collected trim with the restart leader's approval.
    pub fn approve_all_trims(&mut self) {
        for shard_map in self.logged_ragged_trim.values_mut() {
            for trim in shard_map.values_mut() {
                trim.leader_id = RESTART_LEADER_ID;
            }
        }
    }

    pub fn all_trims(&self) -> Vec<RaggedTrim> {
        self.logged_ragged_trim
            .values()
            .flat_map(|shard_map| shard_map.values().cloned())
            .collect()
    }
}

/// One rejoined node, as seen by the restart leader.
struct Rejoiner {
    socket: TcpStream,
    endpoints: Endpoints,
    /// Newest persisted version per (base-view subgroup, shard), taken from the node's trims.
    log_versions: BTreeMap<(SubgroupId, ShardNum), Version>,
}

/// The restart leader's side of the protocol, driven by `await_rejoining_nodes` in the view
/// manager.
pub struct RestartLeaderState {
    my_id: NodeId,
    my_endpoints: Endpoints,
    /// The highest-vid view any rejoiner (or this node) logged.
    base_view: View,
    rejoiners: BTreeMap<NodeId, Rejoiner>,
    restart_view: Option<View>,
    restart_settings: BTreeMap<SubgroupId, SubgroupSettings>,
    restart_num_received_size: usize,
    restart_shard_leaders: Vec<Vec<i64>>,
    my_log_versions: BTreeMap<(SubgroupId, ShardNum), Version>,
}

impl RestartLeaderState {
    pub fn new(base_view: View, my_id: NodeId, my_endpoints: Endpoints, restart_state: &RestartState) -> RestartLeaderState {
        let my_log_versions = log_versions_of(restart_state.all_trims());
        RestartLeaderState {
            my_id,
            my_endpoints,
            base_view,
            rejoiners: BTreeMap::new(),
            restart_view: None,
            restart_settings: BTreeMap::new(),
            restart_num_received_size: 0,
            restart_shard_leaders: Vec::new(),
            my_log_versions,
        }
    }

    /// Accept rejoining nodes until a quorum of the base view has reported in and the restart
    /// view they imply is adequately provisioned.
    pub fn await_quorum(
        &mut self,
        listener: &TcpListener,
        restart_state: &mut RestartState,
        type_order: &[SubgroupType],
        subgroup_info: &SubgroupInfo,
    ) -> Result<(), GroupError> {
        loop {
            let (mut socket, _) = listener.accept()?;
            let joiner_id: NodeId = match join::read_value(&mut socket) {
                Ok(id) => id,
                Err(_) => continue,
            };
            if joiner_id == self.my_id || self.rejoiners.contains_key(&joiner_id) {
                let _ = join::write_value(
                    &mut socket,
                    &JoinResponse { code: JoinResponseCode::IdInUse, leader_id: self.my_id },
                );
                continue;
            }
            if join::write_value(
                &mut socket,
                &JoinResponse { code: JoinResponseCode::TotalRestart, leader_id: self.my_id },
            )
            .is_err()
            {
                continue;
            }
            let Ok(logged_view) = join::read_frame::<View>(&mut socket) else { continue };
            log::debug!("Node {} rejoined with logged view {}", joiner_id, logged_view.vid);
            if logged_view.vid > self.base_view.vid {
                self.base_view = logged_view;
            }
            let Ok(trim_count) = join::read_value::<u64>(&mut socket) else { continue };
            let mut trims = Vec::new();
            let mut trims_ok = true;
            for _ in 0..trim_count {
                match join::read_frame::<RaggedTrim>(&mut socket) {
                    Ok(trim) => trims.push(trim),
                    Err(_) => {
                        trims_ok = false;
                        break;
                    }
                }
            }
            if !trims_ok {
                continue;
            }
            let log_versions = log_versions_of(trims.clone());
            for trim in trims {
                restart_state.merge_trim(trim);
            }
            let Ok(gms_port) = join::read_value::<u16>(&mut socket) else { continue };
            let Ok(rpc_port) = join::read_value::<u16>(&mut socket) else { continue };
            let Ok(sst_port) = join::read_value::<u16>(&mut socket) else { continue };
            let Ok(bulk_port) = join::read_value::<u16>(&mut socket) else { continue };
            let ip = socket
                .peer_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|_| "127.0.0.1".to_string());
            self.rejoiners.insert(
                joiner_id,
                Rejoiner {
                    socket,
                    endpoints: Endpoints { ip, gms_port, rpc_port, sst_port, bulk_port },
                    log_versions,
                },
            );

            if self.have_quorum() && self.compute_restart_view(type_order, subgroup_info)? {
                return Ok(());
            }
            log::debug!(
                "Still waiting for a quorum: {} of {} members of view {} have rejoined",
                self.num_rejoined_members(),
                self.base_view.num_members(),
                self.base_view.vid
            );
        }
    }

    fn num_rejoined_members(&self) -> usize {
        self.base_view
            .members
            .iter()
            .filter(|m| **m == self.my_id || self.rejoiners.contains_key(m))
            .count()
    }

    /// A majority of the last known view must rejoin before a restart view can be committed.
    fn have_quorum(&self) -> bool {
        self.num_rejoined_members() >= self.base_view.num_members() / 2 + 1
    }

    /// Build the restart view from the union of rejoiners and run the sharding function over
    /// it. Returns false (without error) if it is not adequately provisioned yet.
    pub fn compute_restart_view(
        &mut self,
        type_order: &[SubgroupType],
        subgroup_info: &SubgroupInfo,
    ) -> Result<bool, GroupError> {
        let mut members = vec![self.my_id];
        let mut endpoints = vec![self.my_endpoints.clone()];
        for (id, rejoiner) in &self.rejoiners {
            members.push(*id);
            endpoints.push(rejoiner.endpoints.clone());
        }
        let joined = members
            .iter()
            .filter(|m| self.base_view.rank_of(**m).is_none())
            .cloned()
            .collect();
        let departed = self
            .base_view
            .members
            .iter()
            .filter(|m| !members.contains(m))
            .cloned()
            .collect();
        let num_members = members.len();
        let mut view = View::new(
            self.base_view.vid + 1,
            members,
            endpoints,
            vec![false; num_members],
            joined,
            departed,
            0,
        );
        view.localize(self.my_id);
        let mut settings = BTreeMap::new();
        let num_received_size =
            make_subgroup_maps(subgroup_info, type_order, Some(&self.base_view), &mut view, &mut settings)?;
        if !view.is_adequately_provisioned {
            self.restart_view = None;
            return Ok(false);
        }
        self.restart_num_received_size = num_received_size;
        self.restart_settings = settings;
        self.restart_view = Some(view);
        self.compute_restart_shard_leaders();
        Ok(true)
    }

    /// For every shard of the restart view, pick the member with the longest log as the one that
    /// must push object state to the others.
    fn compute_restart_shard_leaders(&mut self) {
        let view = self.restart_view.as_ref().expect("restart view computed first");
        let mut leaders: Vec<Vec<i64>> = Vec::with_capacity(view.subgroup_shard_views.len());
        for (subgroup_id, shards) in view.subgroup_shard_views.iter().enumerate() {
            let mut shard_leaders = Vec::with_capacity(shards.len());
            for (shard_num, shard) in shards.iter().enumerate() {
                let key = (subgroup_id as SubgroupId, shard_num as ShardNum);
                let mut leader: i64 = -1;
                let mut longest = Version::INVALID;
                for member in &shard.members {
                    let version = if *member == self.my_id {
                        self.my_log_versions.get(&key).copied()
                    } else {
                        self.rejoiners
                            .get(member)
                            .and_then(|r| r.log_versions.get(&key).copied())
                    }
                    .unwrap_or(Version::INVALID);
                    if leader == -1 || version > longest {
                        leader = member.int() as i64;
                        longest = version;
                    }
                }
                shard_leaders.push(leader);
            }
            leaders.push(shard_leaders);
        }
        self.restart_shard_leaders = leaders;
    }

    pub fn restart_shard_leaders(&self) -> &Vec<Vec<i64>> {
        &self.restart_shard_leaders
    }

    /// Serialize the restart view, parameters, and the approved trims to every rejoiner.
    /// Returns the id of the first node whose socket died, if any.
    pub fn send_restart_view(
        &mut self,
        params: &GroupParams,
        restart_state: &RestartState,
    ) -> Option<NodeId> {
        let view = self.restart_view.clone().expect("restart view computed first");
        let trims = restart_state.all_trims();
        for (id, rejoiner) in self.rejoiners.iter_mut() {
            let send = (|| -> Result<(), GroupError> {
                join::write_frame(&mut rejoiner.socket, &view)?;
                join::write_frame(&mut rejoiner.socket, params)?;
                join::write_value(&mut rejoiner.socket, &(trims.len() as u64))?;
                for trim in &trims {
                    join::write_frame(&mut rejoiner.socket, trim)?;
                }
                Ok(())
            })();
            if send.is_err() {
                return Some(*id);
            }
        }
        None
    }

    /// Broadcast the commit (or abort) flag for the view just sent.
    pub fn confirm_restart_view(&mut self, commit: bool) {
        for rejoiner in self.rejoiners.values_mut() {
            let _ = join::write_value(&mut rejoiner.socket, &commit);
        }
    }

    /// After commit: send the restart-shard-leader vector so every node knows who pushes state.
    pub fn send_shard_leaders(&mut self) {
        let leaders = self.restart_shard_leaders.clone();
        for rejoiner in self.rejoiners.values_mut() {
            let _ = join::write_frame(&mut rejoiner.socket, &leaders);
        }
    }

    /// Drop a failed rejoiner so the restart view can be recomputed without it.
    pub fn remove_rejoiner(&mut self, id: NodeId) {
        self.rejoiners.remove(&id);
    }

    pub fn take_restart_view(&mut self) -> (View, BTreeMap<SubgroupId, SubgroupSettings>, usize) {
        (
            self.restart_view.take().expect("restart view computed first"),
            std::mem::take(&mut self.restart_settings),
            self.restart_num_received_size,
        )
    }

    pub fn log_longest_logs(&self) {
        for (subgroup_id, shards) in self.restart_shard_leaders.iter().enumerate() {
            for (shard_num, leader) in shards.iter().enumerate() {
                log::debug!(
                    "Restart shard leader for subgroup {} shard {}: node {}",
                    subgroup_id,
                    shard_num,
                    leader
                );
            }
        }
    }
}

/// Index a node's trims by (subgroup, shard), reduced to the latest version each implies.
fn log_versions_of(trims: Vec<RaggedTrim>) -> BTreeMap<(SubgroupId, ShardNum), Version> {
    trims
        .into_iter()
        .map(|trim| ((trim.subgroup_id, trim.shard_num), trim.to_latest_version()))
        .collect()
}

/// Truncate every local persistent log to the version its approved trim allows, and save the
/// trims to disk first so a crash mid-truncation finds them again.
pub fn apply_logged_trims(
    options: &NodeOptions,
    view: &View,
    restart_state: &RestartState,
    objects: &crate::persistence::ObjectRegistry,
) -> Result<(), GroupError> {
    for (subgroup_id, shard_map) in &restart_state.logged_ragged_trim {
        for trim in shard_map.values() {
            persistence::save_ragged_trim(&options.storage_dir, trim)?;
        }
        let Some(my_shard) = view.my_subgroups.get(subgroup_id) else { continue };
        let Some(trim) = shard_map.get(my_shard) else { continue };
        let latest = trim.to_latest_version();
        log::trace!("Truncating persistent log for subgroup {} to version {}", subgroup_id, latest);
        if let Some(object) = objects.lock().unwrap().get_mut(subgroup_id) {
            object.truncate(latest);
        }
    }
    Ok(())
}
