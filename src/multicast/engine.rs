/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The low-level mechanics of tracking multicasts within one view: transmitting through the bulk
//! transport or the shared slot ring, resolving receipt into contiguous counters, and issuing
//! delivery, versioning, and persistence upcalls in order. The engine does not know how to
//! handle failures; it is rebuilt by the view manager at every view boundary.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::config::GroupParams;
use crate::error::GroupError;
use crate::sst::ring::{self, SmcRing};
use crate::sst::{ColumnSet, PredicateHandle, PredicateMode, StatusTable};
use crate::types::basic::{
    DeliveryMode, Hlc, MessageId, NodeId, SendAlgorithm, SubgroupId, Version,
};
use crate::types::callbacks::{
    CallbackSet, FrontierStaleCallback, PersistenceManagerCallbacks, PostNextVersionCallback,
    RpcCallback,
};
use crate::view::subgroup_info::SubgroupSettings;

use super::intervals::IntervalSet;
use super::message::{BulkMessage, Header, MessageBuffer, RingMessage, HEADER_SIZE};
use super::transport::BulkTransport;

/// Wall clock in nanoseconds since the epoch; the timestamp carried in every message header.
fn get_time() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Messages of one subgroup that have finished sending or receiving but are not yet delivered,
/// keyed by sequence number.
#[derive(Default)]
struct StableMessages {
    bulk: BTreeMap<MessageId, BulkMessage>,
    ring: BTreeMap<MessageId, RingMessage>,
}

/// All mutable engine state, guarded by the single state mutex.
struct EngineState {
    free_message_buffers: BTreeMap<SubgroupId, Vec<MessageBuffer>>,
    /// Index to assign to the next message sent in each subgroup.
    future_message_indices: Vec<MessageId>,
    /// The bulk message reserved by an in-progress `send`, per subgroup.
    next_sends: Vec<Option<BulkMessage>>,
    /// Whether a ring send is reserved but not yet committed, per subgroup.
    pending_sst_sends: Vec<bool>,
    /// Bulk messages ready to go out, awaiting the sender thread.
    pending_sends: Vec<VecDeque<BulkMessage>>,
    /// The bulk message currently in flight per subgroup.
    current_sends: Vec<Option<BulkMessage>>,
    locally_stable: BTreeMap<SubgroupId, StableMessages>,
    /// Send timestamps of this node's messages that are not yet globally persisted.
    pending_message_timestamps: BTreeMap<SubgroupId, BTreeSet<u64>>,
    /// seq -> send timestamp for this node's delivered-but-unpersisted messages.
    pending_persistence: BTreeMap<SubgroupId, BTreeMap<MessageId, u64>>,
    /// One interval set per `num_received` column.
    received_intervals: Vec<IntervalSet>,
    /// Drives the per-subgroup sender predicate in ordered mode.
    next_message_to_deliver: Vec<MessageId>,
    /// Whether the last reserved send went to the bulk transport.
    last_transfer_medium: Vec<bool>,
    /// Send side of the slot ring, for subgroups where this node is a sender.
    rings: BTreeMap<SubgroupId, SmcRing>,
}

struct EngineShared {
    members: Vec<NodeId>,
    member_index: usize,
    node_id_to_sst_index: BTreeMap<NodeId, usize>,
    max_msg_size: usize,
    /// Largest message (header included) that travels through the slot ring.
    sst_max_msg_size: usize,
    block_size: u64,
    send_algorithm: SendAlgorithm,
    window_size: usize,
    sender_timeout: Duration,
    total_num_subgroups: usize,
    subgroup_settings: BTreeMap<SubgroupId, SubgroupSettings>,
    /// Which subgroups have a persistent replicated object. For the rest, the engine advances
    /// `persisted_num` itself at delivery time so persistence barriers and sender flow control
    /// see progress.
    persistent_subgroups: BTreeSet<SubgroupId>,
    callbacks: Arc<CallbackSet>,
    rpc_callback: RwLock<Option<RpcCallback>>,
    post_next_version: PostNextVersionCallback,
    frontier_stale_callback: FrontierStaleCallback,
    persistence_callbacks: Arc<PersistenceManagerCallbacks>,
    sst: Arc<StatusTable>,
    bulk: Arc<dyn BulkTransport>,
    state: Mutex<EngineState>,
    sender_cv: Condvar,
    thread_shutdown: AtomicBool,
    groups_created: AtomicBool,
    subgroup_to_bulk_group: Mutex<BTreeMap<SubgroupId, u16>>,
    num_bulk_groups: Mutex<u16>,
    pred_handles: Mutex<Vec<PredicateHandle>>,
}

/// The multicast engine for one view. Constructed by the view manager together with the view's
/// status table; wedged and rebuilt at every view transition.
pub struct MulticastEngine {
    shared: Arc<EngineShared>,
    sender_thread: Mutex<Option<JoinHandle<()>>>,
    timeout_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MulticastEngine {
    /// Standard constructor, for the first view this node participates in.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        members: Vec<NodeId>,
        my_node_id: NodeId,
        sst: Arc<StatusTable>,
        callbacks: Arc<CallbackSet>,
        total_num_subgroups: usize,
        subgroup_settings: BTreeMap<SubgroupId, SubgroupSettings>,
        persistent_subgroups: BTreeSet<SubgroupId>,
        params: &GroupParams,
        post_next_version: PostNextVersionCallback,
        frontier_stale_callback: FrontierStaleCallback,
        persistence_callbacks: Arc<PersistenceManagerCallbacks>,
        bulk: Arc<dyn BulkTransport>,
        already_failed: &[bool],
    ) -> MulticastEngine {
        assert!(params.window_size >= 1);
        let shared = Self::build_shared(
            members,
            my_node_id,
            sst,
            callbacks,
            total_num_subgroups,
            subgroup_settings,
            persistent_subgroups,
            params,
            post_next_version,
            frontier_stale_callback,
            persistence_callbacks,
            bulk,
        );
        Self::finish_construction(shared, already_failed)
    }

    /// Constructor used at a view transition: preserves the old engine's callbacks and buffer
    /// pool, and replays its unstable outgoing messages under fresh indices.
    #[allow(clippy::too_many_arguments)]
    pub fn from_old(
        old: MulticastEngine,
        members: Vec<NodeId>,
        my_node_id: NodeId,
        sst: Arc<StatusTable>,
        total_num_subgroups: usize,
        subgroup_settings: BTreeMap<SubgroupId, SubgroupSettings>,
        persistent_subgroups: BTreeSet<SubgroupId>,
        params: &GroupParams,
        post_next_version: PostNextVersionCallback,
        frontier_stale_callback: FrontierStaleCallback,
        bulk: Arc<dyn BulkTransport>,
        already_failed: &[bool],
    ) -> MulticastEngine {
        // Just in case the caller didn't.
        old.wedge();

        let shared = Self::build_shared(
            members,
            my_node_id,
            sst,
            old.shared.callbacks.clone(),
            total_num_subgroups,
            subgroup_settings,
            persistent_subgroups,
            params,
            post_next_version,
            frontier_stale_callback,
            old.shared.persistence_callbacks.clone(),
            bulk,
        );
        if let Some(handler) = old.shared.rpc_callback.write().unwrap().take() {
            *shared.rpc_callback.write().unwrap() = Some(handler);
        }

        {
            let mut old_state = old.shared.state.lock().unwrap();
            let mut state = shared.state.lock().unwrap();

            // Convert a message from the old view into one of ours: same bytes, fresh index.
            let my_id = shared.members[shared.member_index];
            let convert = |msg: &mut BulkMessage, subgroup: SubgroupId, state: &mut EngineState| {
                msg.sender_id = my_id;
                msg.index = state.future_message_indices[subgroup as usize];
                state.future_message_indices[subgroup as usize] += 1;
                let mut header = Header::decode(&msg.message_buffer.buffer);
                header.index = msg.index;
                header.encode_into(&mut msg.message_buffer.buffer);
            };

            let subgroups: Vec<SubgroupId> = shared.subgroup_settings.keys().copied().collect();
            for subgroup in subgroups {
                let num_shard_members = shared.subgroup_settings[&subgroup].members.len();
                // Reclaim the old pool, then top it up if the shard has grown.
                if let Some(old_pool) = old_state.free_message_buffers.get_mut(&subgroup) {
                    state
                        .free_message_buffers
                        .get_mut(&subgroup)
                        .unwrap()
                        .append(old_pool);
                }
                {
                    let pool = state.free_message_buffers.get_mut(&subgroup).unwrap();
                    while pool.len() < shared.window_size * num_shard_members {
                        pool.push(MessageBuffer::new(shared.max_msg_size));
                    }
                }

                // Messages that were locally stable but never delivered are presumed lost with
                // the old view: re-attempt our own in sequence order, discard the others. (The
                // ragged-edge cleanup already delivered everything that counted.)
                if let Some(stable) = old_state.locally_stable.remove(&subgroup) {
                    let mut replay: BTreeMap<MessageId, BulkMessage> = BTreeMap::new();
                    for (seq_num, msg) in stable.bulk {
                        if msg.sender_id == my_id {
                            replay.insert(seq_num, msg);
                        } else {
                            state
                                .free_message_buffers
                                .get_mut(&subgroup)
                                .unwrap()
                                .push(msg.message_buffer);
                        }
                    }
                    for (seq_num, msg) in stable.ring {
                        if msg.sender_id != my_id {
                            continue;
                        }
                        // A ring message replays through the bulk queue: same bytes, new index.
                        let mut buffer = state
                            .free_message_buffers
                            .get_mut(&subgroup)
                            .unwrap()
                            .pop()
                            .unwrap_or_else(|| MessageBuffer::new(shared.max_msg_size));
                        buffer.buffer[..msg.size].copy_from_slice(&msg.data[..msg.size]);
                        replay.insert(
                            seq_num,
                            BulkMessage {
                                sender_id: my_id,
                                index: msg.index,
                                size: msg.size,
                                message_buffer: buffer,
                            },
                        );
                    }
                    for (_, mut msg) in replay {
                        convert(&mut msg, subgroup, &mut state);
                        state.pending_sends[subgroup as usize].push_back(msg);
                    }
                }

                // Sends the old view never completed are re-attempted in order.
                if let Some(mut msg) = old_state.current_sends[subgroup as usize].take() {
                    convert(&mut msg, subgroup, &mut state);
                    state.pending_sends[subgroup as usize].push_back(msg);
                }
                while let Some(mut msg) = old_state.pending_sends[subgroup as usize].pop_front() {
                    convert(&mut msg, subgroup, &mut state);
                    state.pending_sends[subgroup as usize].push_back(msg);
                }
                if let Some(mut msg) = old_state.next_sends[subgroup as usize].take() {
                    convert(&mut msg, subgroup, &mut state);
                    state.pending_sends[subgroup as usize].push_back(msg);
                }
            }
            // Partial receives from the old view were aborted when it wedged; their buffers are
            // already back in the old pool.
        }

        Self::finish_construction(shared, already_failed)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_shared(
        members: Vec<NodeId>,
        my_node_id: NodeId,
        sst: Arc<StatusTable>,
        callbacks: Arc<CallbackSet>,
        total_num_subgroups: usize,
        subgroup_settings: BTreeMap<SubgroupId, SubgroupSettings>,
        persistent_subgroups: BTreeSet<SubgroupId>,
        params: &GroupParams,
        post_next_version: PostNextVersionCallback,
        frontier_stale_callback: FrontierStaleCallback,
        persistence_callbacks: Arc<PersistenceManagerCallbacks>,
        bulk: Arc<dyn BulkTransport>,
    ) -> Arc<EngineShared> {
        let member_index = members
            .iter()
            .position(|m| *m == my_node_id)
            .expect("local node must be a member of its engine's view");
        let node_id_to_sst_index = members
            .iter()
            .enumerate()
            .map(|(rank, id)| (*id, rank))
            .collect();
        let sst_max_msg_size = params.max_smc_payload_size as usize + HEADER_SIZE;
        let max_msg_size = Self::compute_max_msg_size(
            params.max_payload_size,
            params.block_size,
            params.max_payload_size > params.max_smc_payload_size,
        );
        let window_size = params.window_size as usize;

        let mut state = EngineState {
            free_message_buffers: BTreeMap::new(),
            future_message_indices: vec![0; total_num_subgroups],
            next_sends: (0..total_num_subgroups).map(|_| None).collect(),
            pending_sst_sends: vec![false; total_num_subgroups],
            pending_sends: (0..total_num_subgroups).map(|_| VecDeque::new()).collect(),
            current_sends: (0..total_num_subgroups).map(|_| None).collect(),
            locally_stable: BTreeMap::new(),
            pending_message_timestamps: BTreeMap::new(),
            pending_persistence: BTreeMap::new(),
            received_intervals: (0..sst.dims().num_received_width)
                .map(|_| IntervalSet::new())
                .collect(),
            next_message_to_deliver: vec![0; total_num_subgroups],
            last_transfer_medium: vec![false; total_num_subgroups],
            rings: BTreeMap::new(),
        };
        for (subgroup, settings) in &subgroup_settings {
            let pool = state.free_message_buffers.entry(*subgroup).or_default();
            while pool.len() < window_size * settings.members.len() {
                pool.push(MessageBuffer::new(max_msg_size));
            }
            state.locally_stable.insert(*subgroup, StableMessages::default());
            state.pending_message_timestamps.insert(*subgroup, BTreeSet::new());
            state.pending_persistence.insert(*subgroup, BTreeMap::new());
            if let Some(sender_rank) = settings.sender_rank {
                let member_ranks: Vec<usize> = settings
                    .members
                    .iter()
                    .map(|m| sst.rank_of(*m).expect("shard member missing from SST"))
                    .collect();
                state.rings.insert(
                    *subgroup,
                    SmcRing::new(
                        *subgroup,
                        window_size,
                        sst_max_msg_size,
                        member_ranks,
                        settings.num_received_offset + sender_rank,
                    ),
                );
            }
        }

        Arc::new(EngineShared {
            members,
            member_index,
            node_id_to_sst_index,
            max_msg_size,
            sst_max_msg_size,
            block_size: params.block_size,
            send_algorithm: params.send_algorithm,
            window_size,
            sender_timeout: Duration::from_millis(params.timeout_ms as u64),
            total_num_subgroups,
            subgroup_settings,
            persistent_subgroups,
            callbacks,
            rpc_callback: RwLock::new(None),
            post_next_version,
            frontier_stale_callback,
            persistence_callbacks,
            sst,
            bulk,
            state: Mutex::new(state),
            sender_cv: Condvar::new(),
            thread_shutdown: AtomicBool::new(false),
            groups_created: AtomicBool::new(false),
            subgroup_to_bulk_group: Mutex::new(BTreeMap::new()),
            num_bulk_groups: Mutex::new(0),
            pred_handles: Mutex::new(Vec::new()),
        })
    }

    fn finish_construction(shared: Arc<EngineShared>, already_failed: &[bool]) -> MulticastEngine {
        shared.initialize_sst_row();
        let no_member_failed = !already_failed.iter().any(|f| *f);
        if no_member_failed {
            let created = shared.create_bulk_groups();
            shared.groups_created.store(created, Ordering::Release);
        }
        shared.register_predicates();

        let sender_shared = shared.clone();
        let sender_thread = thread::Builder::new()
            .name("multicast_sender".to_string())
            .spawn(move || EngineShared::send_loop(sender_shared))
            .expect("failed to spawn the multicast sender thread");
        let timeout_shared = shared.clone();
        let timeout_thread = thread::Builder::new()
            .name("stability_frontier".to_string())
            .spawn(move || EngineShared::check_failures_loop(timeout_shared))
            .expect("failed to spawn the stability frontier thread");

        MulticastEngine {
            shared,
            sender_thread: Mutex::new(Some(sender_thread)),
            timeout_thread: Mutex::new(Some(timeout_thread)),
        }
    }

    /// Round a message size up to the bulk transport's block granularity.
    pub fn compute_max_msg_size(max_payload_size: u64, block_size: u64, using_bulk: bool) -> usize {
        let mut max_msg_size = max_payload_size + HEADER_SIZE as u64;
        if using_bulk && max_msg_size % block_size != 0 {
            max_msg_size = (max_msg_size / block_size + 1) * block_size;
        }
        max_msg_size as usize
    }

    /// Registers the function called upon receipt of a multicast RPC message.
    pub fn register_rpc_callback(&self, handler: RpcCallback) {
        *self.shared.rpc_callback.write().unwrap() = Some(handler);
    }

    /// Send a multicast in the given subgroup. `fill` is called exactly once with the payload
    /// area of the reserved buffer. Blocks while flow control holds the window shut; returns
    /// `Ok(false)` if the engine wedged before the message could be reserved (the caller retries
    /// in the next view).
    pub fn send(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        fill: impl FnOnce(&mut [u8]),
        cooked_send: bool,
    ) -> Result<bool, GroupError> {
        if !self.shared.groups_created.load(Ordering::Acquire) {
            return Ok(false);
        }
        let msg_size = payload_size + HEADER_SIZE;
        if msg_size > self.shared.max_msg_size {
            return Err(GroupError::InvariantViolation(format!(
                "cannot send a message of {} bytes; the maximum message size is {}",
                msg_size, self.shared.max_msg_size
            )));
        }
        let settings = self.shared.subgroup_settings.get(&subgroup).ok_or_else(|| {
            GroupError::InvariantViolation(format!(
                "this node is not a member of subgroup {}",
                subgroup
            ))
        })?;
        if settings.sender_rank.is_none() {
            return Err(GroupError::InvariantViolation(format!(
                "this node is not a sender in subgroup {}",
                subgroup
            )));
        }

        let mut fill = Some(fill);
        let mut state = self.shared.state.lock().unwrap();
        // Bounded wait: callers hold the view read lock, and a view change (which needs the
        // write lock) is exactly what un-wedges a stuck window, so give up periodically and let
        // the caller retry.
        let mut attempts = 0;
        loop {
            if self.shared.thread_shutdown.load(Ordering::Acquire) {
                return Ok(false);
            }
            if self
                .shared
                .try_reserve_and_fill(&mut state, subgroup, msg_size, &mut fill, cooked_send)
            {
                break;
            }
            attempts += 1;
            if attempts > 20 {
                return Ok(false);
            }
            let (guard, _) = self
                .shared
                .sender_cv
                .wait_timeout(state, Duration::from_millis(1))
                .unwrap();
            state = guard;
        }

        if state.last_transfer_medium[subgroup as usize] {
            let msg = state.next_sends[subgroup as usize]
                .take()
                .expect("a bulk send was just reserved");
            state.pending_sends[subgroup as usize].push_back(msg);
            drop(state);
            self.shared.sender_cv.notify_all();
        } else {
            let ring = state.rings.get_mut(&subgroup).expect("sender must have a ring");
            ring.commit(&self.shared.sst);
            state.pending_sst_sends[subgroup as usize] = false;
        }
        Ok(true)
    }

    /// Whether a reserved ring send has not yet been committed. The view manager drains these
    /// before terminating an epoch.
    pub fn check_pending_sst_sends(&self, subgroup: SubgroupId) -> bool {
        self.shared.state.lock().unwrap().pending_sst_sends[subgroup as usize]
    }

    /// True while the slot ring holds a complete message this node has not yet consumed.
    pub fn ring_receive_pending(&self, subgroup: SubgroupId) -> bool {
        let settings = &self.shared.subgroup_settings[&subgroup];
        self.shared.ring_receiver_predicate(subgroup, settings)
    }

    /// Run one batch of the ring receive handler for the subgroup.
    pub fn run_ring_receiver(&self, subgroup: SubgroupId) {
        let settings = self.shared.subgroup_settings[&subgroup].clone();
        self.shared.ring_receiver_function(subgroup, &settings);
    }

    /// Deliver every message with sequence number implied by `max_indices_for_senders`, in
    /// sequence order. Called by ragged-edge cleanup with the shard-agreed cut.
    pub fn deliver_messages_upto(
        &self,
        max_indices_for_senders: &[MessageId],
        subgroup: SubgroupId,
        num_shard_senders: usize,
    ) {
        assert_eq!(max_indices_for_senders.len(), num_shard_senders);
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        let curr_seq_num =
            shared.sst.read(|rows| rows[shared.member_index].delivered_num[subgroup as usize]);
        let mut max_seq_num = curr_seq_num;
        for (sender, max_index) in max_indices_for_senders.iter().enumerate() {
            max_seq_num =
                max_seq_num.max(*max_index * num_shard_senders as MessageId + sender as MessageId);
        }
        let mut non_null_delivered = false;
        let mut assigned_version = Version::INVALID;
        for seq_num in (curr_seq_num + 1)..=max_seq_num {
            // Sequence numbers past a sender's cut are skipped, not delivered.
            let index = seq_num / num_shard_senders as MessageId;
            let sender_rank = seq_num as usize % num_shard_senders;
            if index > max_indices_for_senders[sender_rank] {
                continue;
            }
            assigned_version = shared.version_for(seq_num);
            non_null_delivered |=
                shared.deliver_seq_num(&mut state, subgroup, seq_num, assigned_version);
        }
        drop(state);
        shared.write_delivered_num(subgroup, max_seq_num, non_null_delivered, assigned_version);
    }

    /// The minimum stability frontier across the shard: no message with a timestamp at or below
    /// it is still unstable anywhere.
    pub fn compute_global_stability_frontier(&self, subgroup: SubgroupId) -> u64 {
        let shared = &self.shared;
        let indices = self.get_shard_sst_indices(subgroup);
        shared.sst.read(|rows| {
            indices
                .iter()
                .map(|i| rows[*i].local_stability_frontier[subgroup as usize])
                .min()
                .unwrap_or(0)
        })
    }

    /// SST row indices of the members of this node's shard of the subgroup.
    pub fn get_shard_sst_indices(&self, subgroup: SubgroupId) -> Vec<usize> {
        self.shared.shard_sst_indices(subgroup)
    }

    /// The external persistence manager reports that everything up to `version` is on stable
    /// storage for the subgroup.
    pub fn report_persisted(&self, subgroup: SubgroupId, version: Version) {
        let shared = &self.shared;
        shared.sst.update_local(|row| {
            if row.persisted_num[subgroup as usize] < version {
                row.persisted_num[subgroup as usize] = version;
            }
        });
        shared.sst.put(ColumnSet::PERSISTED_NUM);
        if let Some(cb) = &shared.callbacks.local_persistence_callback {
            cb(subgroup, version);
        }
        shared.sender_cv.notify_all();
    }

    pub fn subgroup_settings(&self) -> &BTreeMap<SubgroupId, SubgroupSettings> {
        &self.shared.subgroup_settings
    }

    pub fn is_wedged(&self) -> bool {
        self.shared.thread_shutdown.load(Ordering::Acquire)
    }

    /// Stop all sending and receiving: deregister the engine's predicates, tear down the bulk
    /// groups, and join the sender thread. Idempotent.
    pub fn wedge(&self) {
        if self.shared.thread_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut handles = self.shared.pred_handles.lock().unwrap();
            for handle in handles.drain(..) {
                self.shared.sst.predicates.remove(&handle);
            }
        }
        let count = *self.shared.num_bulk_groups.lock().unwrap();
        for group_num in 0..count {
            self.shared.bulk.destroy_group(self.shared.sst.epoch(), group_num);
        }
        self.shared.sender_cv.notify_all();
        let handle = self.sender_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for MulticastEngine {
    fn drop(&mut self) {
        self.wedge();
        let handle = self.timeout_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl EngineShared {
    fn my_node_id(&self) -> NodeId {
        self.members[self.member_index]
    }

    fn shard_sst_indices(&self, subgroup: SubgroupId) -> Vec<usize> {
        self.subgroup_settings[&subgroup]
            .members
            .iter()
            .map(|m| self.node_id_to_sst_index[m])
            .collect()
    }

    /// The version the next delivery in this view assigns to `seq_num`.
    fn version_for(&self, seq_num: MessageId) -> Version {
        let vid = self.sst.read(|rows| rows[self.member_index].vid);
        Version::pack(vid, seq_num)
    }

    /// The sequence number a member has persisted up to, as seen from the current view: packed
    /// versions from an earlier view count as nothing, versions from this view unpack to their
    /// sequence number.
    fn persisted_seq(&self, row_persisted: Version, current_vid: i32) -> MessageId {
        if !row_persisted.is_valid() {
            return -1;
        }
        let (vid, seq) = row_persisted.unpack();
        match vid.cmp(&current_vid) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => seq,
            std::cmp::Ordering::Greater => MessageId::MAX,
        }
    }

    fn initialize_sst_row(&self) {
        // Rows start out zeroed by the table; the counters need their -1 sentinels. Peers' rows
        // arrive from the peers themselves.
        self.sst.update_local(|row| {
            for v in row.num_received.iter_mut() {
                *v = -1;
            }
            for v in row.num_received_sst.iter_mut() {
                *v = -1;
            }
            for v in row.seq_num.iter_mut() {
                *v = -1;
            }
            for v in row.delivered_num.iter_mut() {
                *v = -1;
            }
            for v in row.persisted_num.iter_mut() {
                *v = Version::INVALID;
            }
        });
        self.sst.put(ColumnSet::ALL);
        self.sst.sync_with_members(None);
    }

    /// One bulk group per (subgroup, sender), rotated so the sender is the group's root. Group
    /// numbers count up from zero within the view epoch, so every member derives the same
    /// identifiers. Single-member shards skip group creation; their sends complete through
    /// self-receipt in the send loop.
    fn create_bulk_groups(self: &Arc<Self>) -> bool {
        let epoch = self.sst.epoch();
        let mut group_num: u16 = 0;
        let mut group_map = BTreeMap::new();
        for (subgroup, settings) in &self.subgroup_settings {
            let num_shard_members = settings.members.len();
            if num_shard_members <= 1 {
                continue;
            }
            let shard_ranks = settings.shard_ranks_by_sender_rank();
            for (sender_rank, shard_rank) in shard_ranks.iter().enumerate() {
                let sender_id = settings.members[*shard_rank];
                let rotated: Vec<NodeId> = (0..num_shard_members)
                    .map(|k| settings.members[(shard_rank + k) % num_shard_members])
                    .collect();
                let weak = Arc::downgrade(self);
                let subgroup = *subgroup;
                let settings_clone = settings.clone();
                let on_receive: Box<dyn FnMut(&[u8]) + Send> = Box::new(move |data: &[u8]| {
                    if let Some(shared) = weak.upgrade() {
                        shared.bulk_receive_handler(
                            subgroup,
                            &settings_clone,
                            sender_rank,
                            sender_id,
                            data,
                        );
                    }
                });
                if !self.bulk.create_group(
                    epoch,
                    group_num,
                    &rotated,
                    self.block_size,
                    self.send_algorithm,
                    on_receive,
                ) {
                    return false;
                }
                if sender_id == self.my_node_id() {
                    group_map.insert(subgroup, group_num);
                }
                group_num += 1;
            }
        }
        *self.num_bulk_groups.lock().unwrap() = group_num;
        *self.subgroup_to_bulk_group.lock().unwrap() = group_map;
        true
    }

    /// Completion handler for the bulk transport, shared by remote receptions and the sender's
    /// own completions.
    fn bulk_receive_handler(
        self: &Arc<Self>,
        subgroup: SubgroupId,
        settings: &SubgroupSettings,
        sender_rank: usize,
        sender_id: NodeId,
        data: &[u8],
    ) {
        let num_shard_senders = settings.num_senders();
        let mut state = self.state.lock().unwrap();
        if self.thread_shutdown.load(Ordering::Acquire) {
            return;
        }
        let header = Header::decode(data);
        let index = header.index;
        let seq_num = index * num_shard_senders as MessageId + sender_rank as MessageId;
        log::trace!(
            "Locally received message in subgroup {}, sender rank {}, index {}",
            subgroup,
            sender_rank,
            index
        );

        if sender_id == self.my_node_id() {
            // Completion of our own send: the in-flight message becomes locally stable.
            let msg = state.current_sends[subgroup as usize]
                .take()
                .expect("bulk transport completed a send this node never made");
            state
                .locally_stable
                .get_mut(&subgroup)
                .unwrap()
                .bulk
                .insert(seq_num, msg);
        } else {
            let mut buffer = state
                .free_message_buffers
                .get_mut(&subgroup)
                .unwrap()
                .pop()
                .expect("message buffer pool exhausted; window accounting is broken");
            buffer.buffer[..data.len()].copy_from_slice(data);
            let msg = BulkMessage {
                sender_id,
                index,
                size: data.len(),
                message_buffer: buffer,
            };
            state
                .locally_stable
                .get_mut(&subgroup)
                .unwrap()
                .bulk
                .insert(seq_num, msg);
        }

        self.post_receive(&mut state, subgroup, settings, sender_rank, index, true);
        drop(state);
        // A completed send may unblock the next one.
        self.sender_cv.notify_all();
    }

    /// The part of the receive path common to both transports, run with the state lock held.
    /// `publish` is false when the caller batches the SST puts itself.
    fn post_receive(
        self: &Arc<Self>,
        state: &mut EngineState,
        subgroup: SubgroupId,
        settings: &SubgroupSettings,
        sender_rank: usize,
        index: MessageId,
        publish: bool,
    ) {
        let num_shard_senders = settings.num_senders();
        let column = settings.num_received_offset + sender_rank;
        let new_num_received = state.received_intervals[column].insert(index);

        /* NULL send scheme: if this node is also a sender in an ordered subgroup, it must keep
        its own index within one of every other sender's, or the shard's seq_num cannot advance
        past the gap it would leave. */
        if let Some(my_sender_rank) = settings.sender_rank {
            if settings.mode != DeliveryMode::Unordered {
                if my_sender_rank < sender_rank {
                    while state.future_message_indices[subgroup as usize] <= new_num_received {
                        self.send_auto_null(state, subgroup);
                    }
                } else if my_sender_rank > sender_rank {
                    while state.future_message_indices[subgroup as usize] < new_num_received {
                        self.send_auto_null(state, subgroup);
                    }
                }
            }
        }

        let prior_num_received =
            self.sst.read(|rows| rows[self.member_index].num_received[column]);

        if settings.mode == DeliveryMode::Unordered {
            // Deliver at the receive site, in receipt order for this sender, no global waiting.
            for i in (prior_num_received + 1)..=new_num_received {
                let seq_num = i * num_shard_senders as MessageId + sender_rank as MessageId;
                self.deliver_unordered(state, subgroup, seq_num);
            }
        }

        if new_num_received > prior_num_received {
            self.sst.update_local(|row| {
                row.num_received[column] = new_num_received;
            });
            if publish {
                self.recompute_seq_num(subgroup, settings);
                self.sst.put_to(
                    &self.shard_sst_indices(subgroup),
                    ColumnSet::NUM_RECEIVED | ColumnSet::SEQ_NUM,
                );
            }
        }
    }

    /// Unordered-mode delivery of one sequence number from whichever stable map holds it.
    fn deliver_unordered(&self, state: &mut EngineState, subgroup: SubgroupId, seq_num: MessageId) {
        if let Some(msg) = state
            .locally_stable
            .get_mut(&subgroup)
            .unwrap()
            .ring
            .remove(&seq_num)
        {
            let header = msg.header();
            if !msg.is_null() {
                if let Some(cb) = &self.callbacks.global_stability_callback {
                    cb(subgroup, msg.sender_id, msg.index, Some(msg.payload()), Version::INVALID);
                }
            }
            if msg.sender_id == self.my_node_id() {
                state
                    .pending_message_timestamps
                    .get_mut(&subgroup)
                    .unwrap()
                    .remove(&header.timestamp);
            }
        } else if let Some(msg) = state
            .locally_stable
            .get_mut(&subgroup)
            .unwrap()
            .bulk
            .remove(&seq_num)
        {
            let header = msg.header();
            if !msg.is_null() {
                if let Some(cb) = &self.callbacks.global_stability_callback {
                    cb(subgroup, msg.sender_id, msg.index, Some(msg.payload()), Version::INVALID);
                }
            }
            if msg.sender_id == self.my_node_id() {
                state
                    .pending_message_timestamps
                    .get_mut(&subgroup)
                    .unwrap()
                    .remove(&header.timestamp);
            }
            state
                .free_message_buffers
                .get_mut(&subgroup)
                .unwrap()
                .push(msg.message_buffer);
        }
        // A sequence number with no stable message yet is delivered when it arrives.
    }

    /// Recompute the highest globally contiguous sequence number for the subgroup from the local
    /// `num_received` columns.
    fn recompute_seq_num(&self, subgroup: SubgroupId, settings: &SubgroupSettings) {
        let num_shard_senders = settings.num_senders();
        self.sst.update_local(|row| {
            let columns = &row.num_received
                [settings.num_received_offset..settings.num_received_offset + num_shard_senders];
            let (min_index, min_received) = columns
                .iter()
                .enumerate()
                .min_by_key(|(i, v)| (**v, *i))
                .map(|(i, v)| (i, *v))
                .expect("a subgroup always has at least one sender column");
            let new_seq_num =
                (min_received + 1) * num_shard_senders as MessageId + min_index as MessageId - 1;
            if new_seq_num > row.seq_num[subgroup as usize] {
                log::trace!("Updating seq_num for subgroup {} to {}", subgroup, new_seq_num);
                row.seq_num[subgroup as usize] = new_seq_num;
            }
        });
    }

    /// Inject a header-only message so this sender's index catches up. Runs with the state lock
    /// held; short-circuits the usual flow-control checks because a message was just received.
    fn send_auto_null(self: &Arc<Self>, state: &mut EngineState, subgroup: SubgroupId) {
        let msg_size = HEADER_SIZE;
        let index = state.future_message_indices[subgroup as usize];
        let current_time = get_time();
        let header = Header {
            header_size: HEADER_SIZE as u32,
            index,
            timestamp: current_time,
            cooked_send: false,
        };
        if msg_size > self.sst_max_msg_size {
            let Some(mut buffer) = state.free_message_buffers.get_mut(&subgroup).unwrap().pop()
            else {
                log::warn!("Subgroup {}: no free buffer for a null send; deferring", subgroup);
                return;
            };
            header.encode_into(&mut buffer.buffer);
            state
                .pending_message_timestamps
                .get_mut(&subgroup)
                .unwrap()
                .insert(current_time);
            state.future_message_indices[subgroup as usize] += 1;
            state.pending_sends[subgroup as usize].push_back(BulkMessage {
                sender_id: self.my_node_id(),
                index,
                size: msg_size,
                message_buffer: buffer,
            });
            self.sender_cv.notify_all();
        } else {
            let ring = state.rings.get_mut(&subgroup).expect("null sends only happen at senders");
            if !ring.window_open(&self.sst) {
                // The ring can only be full if our own unconsumed backlog fills the window, in
                // which case the index is not lagging and no null is needed.
                log::warn!("Subgroup {}: ring full during null send; deferring", subgroup);
                return;
            }
            ring.fill_slot(&self.sst, msg_size, |buf| header.encode_into(buf));
            state
                .pending_message_timestamps
                .get_mut(&subgroup)
                .unwrap()
                .insert(current_time);
            state.future_message_indices[subgroup as usize] += 1;
            ring.commit(&self.sst);
        }
    }

    /// Try to reserve a buffer (bulk) or a ring slot (small) for an outgoing message and fill
    /// it. Returns false while flow control or resource exhaustion forbids the send; the fill
    /// closure is only consumed on success.
    fn try_reserve_and_fill<F: FnOnce(&mut [u8])>(
        &self,
        state: &mut EngineState,
        subgroup: SubgroupId,
        msg_size: usize,
        fill: &mut Option<F>,
        cooked_send: bool,
    ) -> bool {
        let settings = &self.subgroup_settings[&subgroup];
        let num_shard_senders = settings.num_senders();
        let my_sender_rank = settings.sender_rank.expect("checked by send");
        let future_index = state.future_message_indices[subgroup as usize];

        // Flow control: the send must stay within window_size of the slowest shard member.
        let window_floor = (future_index - self.window_size as MessageId)
            * num_shard_senders as MessageId
            + my_sender_rank as MessageId;
        let current_vid = self.sst.read(|rows| rows[self.member_index].vid);
        let clear = self.sst.read(|rows| {
            self.shard_sst_indices(subgroup).iter().all(|i| {
                let row = &rows[*i];
                if settings.mode != DeliveryMode::Unordered {
                    row.delivered_num[subgroup as usize] >= window_floor
                        && self.persisted_seq(row.persisted_num[subgroup as usize], current_vid)
                            >= window_floor
                } else {
                    row.num_received[settings.num_received_offset + my_sender_rank]
                        >= future_index - self.window_size as MessageId
                }
            })
        });
        if !clear {
            return false;
        }

        if state.pending_sst_sends[subgroup as usize] || state.next_sends[subgroup as usize].is_some()
        {
            return false;
        }

        let current_time = get_time();
        let header = Header {
            header_size: HEADER_SIZE as u32,
            index: future_index,
            timestamp: current_time,
            cooked_send,
        };

        if msg_size > self.sst_max_msg_size {
            let Some(mut buffer) = state.free_message_buffers.get_mut(&subgroup).unwrap().pop()
            else {
                return false;
            };
            header.encode_into(&mut buffer.buffer);
            (fill.take().expect("fill is consumed exactly once"))(
                &mut buffer.buffer[HEADER_SIZE..msg_size],
            );
            state.next_sends[subgroup as usize] = Some(BulkMessage {
                sender_id: self.my_node_id(),
                index: future_index,
                size: msg_size,
                message_buffer: buffer,
            });
            state.last_transfer_medium[subgroup as usize] = true;
        } else {
            let ring = state.rings.get_mut(&subgroup).expect("sender must have a ring");
            if !ring.window_open(&self.sst) {
                return false;
            }
            let fill_fn = fill.take().expect("fill is consumed exactly once");
            ring.fill_slot(&self.sst, msg_size, |buf| {
                header.encode_into(buf);
                fill_fn(&mut buf[HEADER_SIZE..msg_size]);
            });
            state.pending_sst_sends[subgroup as usize] = true;
            state.last_transfer_medium[subgroup as usize] = false;
        }
        state
            .pending_message_timestamps
            .get_mut(&subgroup)
            .unwrap()
            .insert(current_time);
        state.future_message_indices[subgroup as usize] += 1;
        true
    }

    /// The ring has a complete, unconsumed message for this node in the subgroup.
    fn ring_receiver_predicate(&self, subgroup: SubgroupId, settings: &SubgroupSettings) -> bool {
        let shard_ranks = settings.shard_ranks_by_sender_rank();
        self.sst.read(|rows| {
            (0..settings.num_senders()).any(|sender_rank| {
                let next = rows[self.member_index].num_received_sst
                    [settings.num_received_offset + sender_rank]
                    + 1;
                let sender_sst_rank =
                    self.node_id_to_sst_index[&settings.members[shard_ranks[sender_rank]]];
                let slot = ring::slot_index(subgroup, self.window_size, next as u64);
                rows[sender_sst_rank].slots[slot].tag
                    == ring::commit_tag(self.window_size, next as u64)
            })
        })
    }

    /// Consume up to half a window of ring messages per sender, then publish the receive
    /// counters and the recomputed sequence number in one batch.
    fn ring_receiver_function(self: &Arc<Self>, subgroup: SubgroupId, settings: &SubgroupSettings) {
        let num_shard_senders = settings.num_senders();
        let shard_ranks = settings.shard_ranks_by_sender_rank();
        let batch_size = (self.window_size / 2).max(1);
        let mut state = self.state.lock().unwrap();
        if self.thread_shutdown.load(Ordering::Acquire) {
            return;
        }
        for _ in 0..batch_size {
            for sender_rank in 0..num_shard_senders {
                let column = settings.num_received_offset + sender_rank;
                let next =
                    self.sst.read(|rows| rows[self.member_index].num_received_sst[column]) + 1;
                let sender_id = settings.members[shard_ranks[sender_rank]];
                let sender_sst_rank = self.node_id_to_sst_index[&sender_id];
                let slot = ring::slot_index(subgroup, self.window_size, next as u64);
                let expected_tag = ring::commit_tag(self.window_size, next as u64);
                let message = self.sst.read(|rows| {
                    let ring_slot = &rows[sender_sst_rank].slots[slot];
                    if ring_slot.tag == expected_tag {
                        Some((ring_slot.payload.clone(), ring_slot.size as usize))
                    } else {
                        None
                    }
                });
                let Some((data, size)) = message else { continue };
                log::trace!(
                    "Ring receive in subgroup {}: sender rank {}, ring index {}, slot {}",
                    subgroup,
                    sender_rank,
                    next,
                    slot
                );
                let header = Header::decode(&data);
                let seq_num =
                    header.index * num_shard_senders as MessageId + sender_rank as MessageId;
                state.locally_stable.get_mut(&subgroup).unwrap().ring.insert(
                    seq_num,
                    RingMessage {
                        sender_id,
                        index: header.index,
                        size,
                        data,
                    },
                );
                self.sst.update_local(|row| {
                    row.num_received_sst[column] = next;
                });
                self.post_receive(&mut state, subgroup, settings, sender_rank, header.index, false);
            }
        }
        self.recompute_seq_num(subgroup, settings);
        self.sst.put_to(
            &self.shard_sst_indices(subgroup),
            ColumnSet::NUM_RECEIVED | ColumnSet::NUM_RECEIVED_SST | ColumnSet::SEQ_NUM,
        );
        drop(state);
        self.sender_cv.notify_all();
    }

    /// Deliver one globally stable sequence number, invoking the RPC handler or the stability
    /// callback and staging a version for persistence. Returns true if the message was non-null.
    fn deliver_seq_num(
        &self,
        state: &mut EngineState,
        subgroup: SubgroupId,
        seq_num: MessageId,
        version: Version,
    ) -> bool {
        if let Some(msg) = state
            .locally_stable
            .get_mut(&subgroup)
            .unwrap()
            .bulk
            .remove(&seq_num)
        {
            let header = msg.header();
            self.invoke_delivery_callbacks(
                subgroup,
                msg.sender_id,
                msg.index,
                &header,
                msg.payload(),
                version,
            );
            let non_null = self.version_message(
                state,
                subgroup,
                seq_num,
                msg.sender_id,
                msg.size,
                &header,
                version,
            );
            state
                .free_message_buffers
                .get_mut(&subgroup)
                .unwrap()
                .push(msg.message_buffer);
            non_null
        } else if let Some(msg) = state
            .locally_stable
            .get_mut(&subgroup)
            .unwrap()
            .ring
            .remove(&seq_num)
        {
            let header = msg.header();
            self.invoke_delivery_callbacks(
                subgroup,
                msg.sender_id,
                msg.index,
                &header,
                msg.payload(),
                version,
            );
            self.version_message(state, subgroup, seq_num, msg.sender_id, msg.size, &header, version)
        } else {
            false
        }
    }

    fn invoke_delivery_callbacks(
        &self,
        subgroup: SubgroupId,
        sender_id: NodeId,
        index: MessageId,
        header: &Header,
        payload: &[u8],
        version: Version,
    ) {
        if header.cooked_send {
            (self.post_next_version)(subgroup, version);
            if let Some(rpc) = &*self.rpc_callback.read().unwrap() {
                rpc(subgroup, sender_id, payload);
            }
            if let Some(cb) = &self.callbacks.global_stability_callback {
                cb(subgroup, sender_id, index, None, version);
            }
        } else if !payload.is_empty() {
            if let Some(cb) = &self.callbacks.global_stability_callback {
                cb(subgroup, sender_id, index, Some(payload), version);
            }
        }
    }

    /// Stage a version for a delivered message with the persistence manager. Null messages are
    /// filtered here: they are never versioned.
    #[allow(clippy::too_many_arguments)]
    fn version_message(
        &self,
        state: &mut EngineState,
        subgroup: SubgroupId,
        seq_num: MessageId,
        sender_id: NodeId,
        size: usize,
        header: &Header,
        version: Version,
    ) -> bool {
        if size == header.header_size as usize {
            return false;
        }
        if sender_id == self.my_node_id() {
            state
                .pending_persistence
                .get_mut(&subgroup)
                .unwrap()
                .insert(seq_num, header.timestamp);
        }
        let mut msg_ts_us = header.timestamp / 1_000;
        if msg_ts_us == 0 {
            msg_ts_us = get_time() / 1_000;
        }
        (self.persistence_callbacks.make_version)(subgroup, version, Hlc::new(msg_ts_us, 0));
        true
    }

    /// Publish the new delivery watermark, advancing `persisted_num` alongside it for subgroups
    /// with no persistent object, and post the persistence request for the delivered batch.
    fn write_delivered_num(
        &self,
        subgroup: SubgroupId,
        seq_num: MessageId,
        non_null_delivered: bool,
        version: Version,
    ) {
        let persistent = self.persistent_subgroups.contains(&subgroup);
        self.sst.update_local(|row| {
            row.delivered_num[subgroup as usize] = seq_num;
            if !persistent && version.is_valid() && row.persisted_num[subgroup as usize] < version {
                row.persisted_num[subgroup as usize] = version;
            }
        });
        self.sst.put_to(
            &self.shard_sst_indices(subgroup),
            ColumnSet::DELIVERED_NUM | ColumnSet::PERSISTED_NUM,
        );
        if non_null_delivered {
            (self.persistence_callbacks.post_persist)(subgroup, version);
        }
    }

    /// The ordered-mode delivery pass: delivers every locally stable message whose sequence
    /// number every shard member has sequenced.
    fn delivery_trigger(&self, subgroup: SubgroupId) {
        let mut state = self.state.lock().unwrap();
        if self.thread_shutdown.load(Ordering::Acquire) {
            return;
        }
        let shard_indices = self.shard_sst_indices(subgroup);
        let min_stable_num = self.sst.read(|rows| {
            shard_indices
                .iter()
                .map(|i| rows[*i].seq_num[subgroup as usize])
                .min()
                .unwrap_or(-1)
        });

        let mut update_sst = false;
        let mut non_null_delivered = false;
        let mut assigned_version = Version::INVALID;
        let mut last_delivered = -1;
        loop {
            let stable = state.locally_stable.get_mut(&subgroup).unwrap();
            let least_bulk = stable.bulk.keys().next().copied().unwrap_or(MessageId::MAX);
            let least_ring = stable.ring.keys().next().copied().unwrap_or(MessageId::MAX);
            let least = least_bulk.min(least_ring);
            if least == MessageId::MAX || least > min_stable_num {
                break;
            }
            log::trace!(
                "Subgroup {}: delivering locally stable message, min_stable_num={} seq_num={}",
                subgroup,
                min_stable_num,
                least
            );
            assigned_version = self.version_for(least);
            non_null_delivered |= self.deliver_seq_num(&mut state, subgroup, least, assigned_version);
            last_delivered = least;
            update_sst = true;
        }
        drop(state);
        if update_sst {
            self.write_delivered_num(subgroup, last_delivered, non_null_delivered, assigned_version);
        }
    }

    fn register_predicates(self: &Arc<Self>) {
        let mut handles = self.pred_handles.lock().unwrap();
        for (subgroup, settings) in &self.subgroup_settings {
            let subgroup = *subgroup;

            // Ring receiver.
            {
                let pred_weak = Arc::downgrade(self);
                let pred_settings = settings.clone();
                let trig_weak = Arc::downgrade(self);
                let trig_settings = settings.clone();
                handles.push(self.sst.predicates.insert(
                    move |_| {
                        pred_weak
                            .upgrade()
                            .map(|shared| shared.ring_receiver_predicate(subgroup, &pred_settings))
                            .unwrap_or(false)
                    },
                    move |_| {
                        if let Some(shared) = trig_weak.upgrade() {
                            shared.ring_receiver_function(subgroup, &trig_settings);
                        }
                    },
                    PredicateMode::Recurrent,
                ));
            }

            if settings.mode != DeliveryMode::Unordered {
                // Delivery runs on every evaluation pass.
                {
                    let weak = Arc::downgrade(self);
                    handles.push(self.sst.predicates.insert(
                        |_| true,
                        move |_| {
                            if let Some(shared) = weak.upgrade() {
                                shared.delivery_trigger(subgroup);
                            }
                        },
                        PredicateMode::Recurrent,
                    ));
                }

                // Global persistence notification.
                {
                    let weak = Arc::downgrade(self);
                    let settings = settings.clone();
                    let mut version_seen = Version::INVALID;
                    handles.push(self.sst.predicates.insert(
                        |_| true,
                        move |_| {
                            let Some(shared) = weak.upgrade() else { return };
                            let min_persisted = shared.sst.read(|rows| {
                                settings
                                    .members
                                    .iter()
                                    .map(|m| {
                                        rows[shared.node_id_to_sst_index[m]].persisted_num
                                            [subgroup as usize]
                                    })
                                    .min()
                                    .unwrap_or(Version::INVALID)
                            });
                            if version_seen < min_persisted {
                                if let Some(cb) = &shared.callbacks.global_persistence_callback {
                                    cb(subgroup, min_persisted);
                                }
                                version_seen = min_persisted;
                            }
                        },
                        PredicateMode::Recurrent,
                    ));
                }

                if let Some(my_sender_rank) = settings.sender_rank {
                    // Wake blocked senders as the delivery and persistence watermarks advance.
                    let pred_weak = Arc::downgrade(self);
                    let pred_settings = settings.clone();
                    let num_shard_senders = settings.num_senders();
                    let trig_weak = Arc::downgrade(self);
                    handles.push(self.sst.predicates.insert(
                        move |_| {
                            let Some(shared) = pred_weak.upgrade() else { return false };
                            let next = {
                                let state = shared.state.lock().unwrap();
                                state.next_message_to_deliver[subgroup as usize]
                            };
                            let seq_num = next * num_shard_senders as MessageId
                                + my_sender_rank as MessageId;
                            let current_vid = shared.sst.read(|rows| rows[shared.member_index].vid);
                            shared.sst.read(|rows| {
                                pred_settings.members.iter().all(|m| {
                                    let row = &rows[shared.node_id_to_sst_index[m]];
                                    row.delivered_num[subgroup as usize] >= seq_num
                                        && shared.persisted_seq(
                                            row.persisted_num[subgroup as usize],
                                            current_vid,
                                        ) >= seq_num
                                })
                            })
                        },
                        move |_| {
                            let Some(shared) = trig_weak.upgrade() else { return };
                            shared.sender_cv.notify_all();
                            let mut state = shared.state.lock().unwrap();
                            state.next_message_to_deliver[subgroup as usize] += 1;
                        },
                        PredicateMode::Recurrent,
                    ));
                }
            } else if let Some(my_sender_rank) = settings.sender_rank {
                // Unordered mode: senders unblock on receipt progress alone.
                let pred_weak = Arc::downgrade(self);
                let pred_settings = settings.clone();
                let column = settings.num_received_offset + my_sender_rank;
                let trig_weak = Arc::downgrade(self);
                handles.push(self.sst.predicates.insert(
                    move |_| {
                        let Some(shared) = pred_weak.upgrade() else { return false };
                        let future_index = {
                            let state = shared.state.lock().unwrap();
                            state.future_message_indices[subgroup as usize]
                        };
                        let floor = future_index - 1 - shared.window_size as MessageId;
                        shared.sst.read(|rows| {
                            pred_settings.members.iter().all(|m| {
                                rows[shared.node_id_to_sst_index[m]].num_received[column] >= floor
                            })
                        })
                    },
                    move |_| {
                        if let Some(shared) = trig_weak.upgrade() {
                            shared.sender_cv.notify_all();
                        }
                    },
                    PredicateMode::Recurrent,
                ));
            }
        }
    }

    /// The sender thread: drains pending bulk sends round-robin across subgroups, dispatching
    /// each to the transport once flow control clears it.
    fn send_loop(shared: Arc<EngineShared>) {
        let mut subgroup_to_send: usize = 0;
        let mut state = shared.state.lock().unwrap();
        loop {
            if shared.thread_shutdown.load(Ordering::Acquire) {
                break;
            }
            let mut dispatched = false;
            for i in 1..=shared.total_num_subgroups {
                let candidate = (subgroup_to_send + i) % shared.total_num_subgroups;
                if !shared.should_send_to_subgroup(&state, candidate as SubgroupId) {
                    continue;
                }
                subgroup_to_send = candidate;
                let msg = state.pending_sends[candidate].pop_front().unwrap();
                log::trace!(
                    "Dispatching bulk send in subgroup {}: message {} from sender {}",
                    candidate,
                    msg.index,
                    msg.sender_id
                );
                let bytes = msg.message_buffer.buffer[..msg.size].to_vec();
                let single_member_settings = {
                    let settings = &shared.subgroup_settings[&(candidate as SubgroupId)];
                    (settings.members.len() <= 1).then(|| settings.clone())
                };
                state.current_sends[candidate] = Some(msg);
                match single_member_settings {
                    None => {
                        let group_num = shared.subgroup_to_bulk_group.lock().unwrap()
                            [&(candidate as SubgroupId)];
                        // The transport must not run completion callbacks synchronously here:
                        // the state lock is held.
                        if !shared.bulk.send(shared.sst.epoch(), group_num, &bytes) {
                            log::error!("Bulk transport rejected a send; wedging the engine");
                            shared.thread_shutdown.store(true, Ordering::Release);
                        }
                    }
                    Some(settings) => {
                        // A single-member shard has no bulk group: complete by self-receipt.
                        drop(state);
                        shared.bulk_receive_handler(
                            candidate as SubgroupId,
                            &settings,
                            settings
                                .sender_rank
                                .expect("a single-member shard's member is its sender"),
                            shared.my_node_id(),
                            &bytes,
                        );
                        state = shared.state.lock().unwrap();
                    }
                }
                dispatched = true;
                break;
            }
            if !dispatched {
                let (guard, _) = shared
                    .sender_cv
                    .wait_timeout(state, Duration::from_millis(10))
                    .unwrap();
                state = guard;
            }
        }
        log::debug!("Multicast sender thread shutting down");
    }

    fn should_send_to_subgroup(&self, state: &EngineState, subgroup: SubgroupId) -> bool {
        if !self.groups_created.load(Ordering::Acquire) {
            return false;
        }
        if state.current_sends[subgroup as usize].is_some() {
            return false;
        }
        let Some(msg) = state.pending_sends[subgroup as usize].front() else {
            return false;
        };
        let Some(settings) = self.subgroup_settings.get(&subgroup) else {
            return false;
        };
        let my_sender_rank = match settings.sender_rank {
            Some(rank) => rank,
            None => return false,
        };
        let num_shard_senders = settings.num_senders();

        // The previous message from this node must be locally stable before the next goes out.
        let self_received = self.sst.read(|rows| {
            rows[self.member_index].num_received[settings.num_received_offset + my_sender_rank]
        });
        if self_received < msg.index - 1 {
            return false;
        }

        let window_floor = (msg.index - self.window_size as MessageId)
            * num_shard_senders as MessageId
            + my_sender_rank as MessageId;
        let current_vid = self.sst.read(|rows| rows[self.member_index].vid);
        self.sst.read(|rows| {
            self.shard_sst_indices(subgroup).iter().all(|i| {
                let row = &rows[*i];
                if settings.mode != DeliveryMode::Unordered {
                    row.delivered_num[subgroup as usize] >= window_floor
                        && self.persisted_seq(row.persisted_num[subgroup as usize], current_vid)
                            >= window_floor
                } else {
                    let column = settings.num_received_offset + my_sender_rank;
                    row.num_received[column]
                        >= state.future_message_indices[subgroup as usize]
                            - 1
                            - self.window_size as MessageId
                }
            })
        })
    }

    /// The stability-frontier thread: wakes every `timeout_ms`, retires timestamps of persisted
    /// messages, publishes a frontier bounding this node's unstable messages, and reports the
    /// shard members holding stability back when that frontier goes stale.
    fn check_failures_loop(shared: Arc<EngineShared>) {
        'outer: loop {
            // Sleep in short slices so shutdown is prompt.
            let wake_at = Instant::now() + shared.sender_timeout;
            while Instant::now() < wake_at {
                if shared.thread_shutdown.load(Ordering::Acquire) {
                    break 'outer;
                }
                thread::sleep(Duration::from_millis(10));
            }
            let current_time = get_time();
            let mut stale_reports: Vec<(SubgroupId, Vec<NodeId>)> = Vec::new();
            {
                let mut state = shared.state.lock().unwrap();
                for (subgroup, settings) in &shared.subgroup_settings {
                    let shard_indices: Vec<usize> = settings
                        .members
                        .iter()
                        .map(|m| shared.node_id_to_sst_index[m])
                        .collect();
                    // Retire pending-persistence entries the whole shard has persisted.
                    let min_persisted = shared.sst.read(|rows| {
                        shard_indices
                            .iter()
                            .map(|i| rows[*i].persisted_num[*subgroup as usize])
                            .min()
                            .unwrap_or(Version::INVALID)
                    });
                    let min_persisted_seq = if min_persisted.is_valid() {
                        min_persisted.unpack().1
                    } else {
                        -1
                    };
                    let mut retired = Vec::new();
                    {
                        let pending = state.pending_persistence.get_mut(subgroup).unwrap();
                        while let Some((seq, _)) = pending.first_key_value() {
                            if *seq > min_persisted_seq {
                                break;
                            }
                            let (_, timestamp) = pending.pop_first().unwrap();
                            retired.push(timestamp);
                        }
                    }
                    let timestamps = state.pending_message_timestamps.get_mut(subgroup).unwrap();
                    for timestamp in retired {
                        timestamps.remove(&timestamp);
                    }
                    let frontier = match timestamps.first() {
                        Some(oldest) => current_time.min(*oldest),
                        None => current_time,
                    };
                    shared.sst.update_local(|row| {
                        row.local_stability_frontier[*subgroup as usize] = frontier;
                    });
                    let cutoff =
                        current_time.saturating_sub(shared.sender_timeout.as_nanos() as u64);
                    if frontier < cutoff {
                        // This node's messages have stayed unstable past the timeout. The
                        // members whose published frontiers lag the cutoff are the ones holding
                        // stability back.
                        let lagging: Vec<NodeId> = shared.sst.read(|rows| {
                            settings
                                .members
                                .iter()
                                .filter(|m| **m != shared.my_node_id())
                                .filter(|m| {
                                    rows[shared.node_id_to_sst_index[*m]].local_stability_frontier
                                        [*subgroup as usize]
                                        < cutoff
                                })
                                .copied()
                                .collect()
                        });
                        log::warn!(
                            "Subgroup {}: oldest unstable message exceeds the stability timeout",
                            subgroup
                        );
                        if !lagging.is_empty() {
                            stale_reports.push((*subgroup, lagging));
                        }
                    }
                }
            }
            shared.sst.put_with_completion(ColumnSet::FRONTIER);
            // Reported with the state lock released: the failure path may wedge this engine,
            // which joins the sender thread.
            for (subgroup, lagging) in stale_reports {
                (shared.frontier_stale_callback)(subgroup, &lagging);
            }
        }
        log::debug!("Stability frontier thread shutting down");
    }
}
