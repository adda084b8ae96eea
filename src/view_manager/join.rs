/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The TCP wire protocol of the join path. A joiner connects to the leader's GMS port, writes
//! its id, and reads a response code; on redirect it reconnects to the address provided and
//! retries. After the handshake it exchanges its ports and loops reading (View, parameters,
//! commit flag) until a view is committed, since a proposed view may be aborted and re-proposed.

use borsh::{BorshDeserialize, BorshSerialize};
use std::io::{Read, Write};
use std::net::TcpStream;

use crate::config::{GroupParams, NodeOptions};
use crate::error::GroupError;
use crate::persistence::{self, RaggedTrim};
use crate::types::basic::NodeId;
use crate::view::View;

#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum JoinResponseCode {
    Ok,
    IdInUse,
    LeaderRedirect,
    TotalRestart,
}

#[derive(Clone, Copy, Debug, BorshSerialize, BorshDeserialize)]
pub struct JoinResponse {
    pub code: JoinResponseCode,
    pub leader_id: NodeId,
}

/// Write a borsh value with a u64 little-endian length prefix.
pub fn write_frame<T: BorshSerialize>(stream: &mut TcpStream, value: &T) -> Result<(), GroupError> {
    let bytes = borsh::to_vec(value).map_err(GroupError::Io)?;
    stream.write_all(&(bytes.len() as u64).to_le_bytes())?;
    stream.write_all(&bytes)?;
    Ok(())
}

/// Read a length-prefixed borsh value.
pub fn read_frame<T: BorshDeserialize>(stream: &mut TcpStream) -> Result<T, GroupError> {
    let mut len_bytes = [0u8; 8];
    stream.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes)?;
    T::try_from_slice(&bytes).map_err(GroupError::Io)
}

/// Write a fixed-size borsh scalar without a length prefix.
pub fn write_value<T: BorshSerialize>(stream: &mut TcpStream, value: &T) -> Result<(), GroupError> {
    let bytes = borsh::to_vec(value).map_err(GroupError::Io)?;
    stream.write_all(&bytes)?;
    Ok(())
}

/// Read a fixed-size borsh scalar.
pub fn read_value<T: BorshDeserialize>(stream: &mut TcpStream) -> Result<T, GroupError> {
    T::deserialize_reader(stream).map_err(GroupError::Io)
}

/// Everything a follower learns from the leader during the join handshake.
pub struct ReceivedConfiguration {
    pub view: View,
    pub params: GroupParams,
    pub is_total_restart: bool,
    /// Trims collected by the restart leader, present in restart mode only.
    pub ragged_trims: Vec<RaggedTrim>,
    /// `old_shard_leaders[subgroup_id][shard_num]` = node to pull object state from (-1 = none).
    pub old_shard_leaders: Vec<Vec<i64>>,
}

/// The follower side of the join protocol: connect to the configured leader, follow redirects,
/// and loop until a view is committed. In restart mode the node's own saved view and trims are
/// shipped to the leader before the loop.
pub fn join_existing_group(options: &NodeOptions) -> Result<ReceivedConfiguration, GroupError> {
    let my_id = options.local_id;
    let mut stream = TcpStream::connect((options.leader_ip.as_str(), options.leader_gms_port))
        .map_err(|_| GroupError::LeaderCrashDuringJoin("could not reach the leader"))?;

    let response = loop {
        log::debug!("Socket connected to leader, exchanging ids");
        write_value(&mut stream, &my_id)
            .map_err(|_| GroupError::LeaderCrashDuringJoin("failed to exchange ids with the leader"))?;
        let response: JoinResponse = read_value(&mut stream)
            .map_err(|_| GroupError::LeaderCrashDuringJoin("failed to exchange ids with the leader"))?;
        match response.code {
            JoinResponseCode::IdInUse => {
                log::error!("Leader refused connection: id {} is already in use", my_id);
                return Err(GroupError::IdInUse(my_id));
            }
            JoinResponseCode::LeaderRedirect => {
                let leader_ip: String = read_value(&mut stream)?;
                let leader_gms_port: u16 = read_value(&mut stream)?;
                log::info!("That node was not the leader; redirecting to {}", leader_ip);
                stream = TcpStream::connect((leader_ip.as_str(), leader_gms_port))
                    .map_err(|_| GroupError::LeaderCrashDuringJoin("could not reach the redirect target"))?;
            }
            _ => break response,
        }
    };

    let is_total_restart = response.code == JoinResponseCode::TotalRestart;
    if is_total_restart {
        let saved_view = persistence::load_view(&options.storage_dir).ok_or_else(|| {
            GroupError::InvariantViolation(
                "the leader expects a restart but this node has no saved view".to_string(),
            )
        })?;
        log::debug!("In restart mode, sending view {} to leader", saved_view.vid);
        write_frame(&mut stream, &saved_view)
            .map_err(|_| GroupError::LeaderCrashDuringJoin("restart leader crashed during view exchange"))?;
        let mut trims = Vec::new();
        for (subgroup_id, shard_num) in &saved_view.my_subgroups {
            if let Some(trim) =
                persistence::load_ragged_trim(&options.storage_dir, *subgroup_id, *shard_num)
            {
                trims.push(trim);
            }
        }
        log::debug!("In restart mode, sending {} ragged trims to leader", trims.len());
        write_value(&mut stream, &(trims.len() as u64))?;
        for trim in &trims {
            write_frame(&mut stream, trim)
                .map_err(|_| GroupError::LeaderCrashDuringJoin("restart leader crashed during trim exchange"))?;
        }
    }

    write_value(&mut stream, &options.gms_port)?;
    write_value(&mut stream, &options.rpc_port)?;
    write_value(&mut stream, &options.sst_port)?;
    write_value(&mut stream, &options.bulk_port)?;

    // The view may be aborted and re-proposed, so loop until one is committed.
    loop {
        let view: View = read_frame(&mut stream)
            .map_err(|_| GroupError::LeaderCrashDuringJoin("leader crashed before sending the initial view"))?;
        let params: GroupParams = read_frame(&mut stream)
            .map_err(|_| GroupError::LeaderCrashDuringJoin("leader crashed before sending the parameters"))?;
        let mut ragged_trims = Vec::new();
        if is_total_restart {
            let count: u64 = read_value(&mut stream)?;
            for _ in 0..count {
                ragged_trims.push(read_frame::<RaggedTrim>(&mut stream)?);
            }
        }
        let confirmed: bool = read_value(&mut stream)
            .map_err(|_| GroupError::LeaderCrashDuringJoin("leader crashed before confirming the view"))?;
        log::debug!("Received view {} from leader, confirmed = {}", view.vid, confirmed);
        if confirmed {
            let old_shard_leaders: Vec<Vec<i64>> = read_frame(&mut stream)?;
            return Ok(ReceivedConfiguration {
                view,
                params,
                is_total_restart,
                ragged_trims,
                old_shard_leaders,
            });
        }
    }
}
