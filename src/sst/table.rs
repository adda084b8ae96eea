/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The status table proper: typed rows, publication of the local row to peers through a pluggable
//! [`RowTransport`], and per-member freezing.
//!
//! Only node r ever mutates row r. Updates from a single publisher are applied FIFO at every
//! peer; writes from different publishers are unordered unless sequenced through counters in the
//! table itself.

use borsh::{BorshDeserialize, BorshSerialize};
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, Weak};

use crate::types::basic::{Endpoints, MessageId, NodeId, Version, ViewId};

use super::predicates::Predicates;

/// Sizing information for one view's table, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct SstDimensions {
    /// Total number of subgroups in the view (not just the ones the local node belongs to).
    pub num_subgroups: usize,
    /// Total width of the per-sender receive-counter columns, summed across subgroups.
    pub num_received_width: usize,
    /// Flow-control window depth; also the number of ring slots per subgroup.
    pub window_size: usize,
    /// Capacity of each ring slot in bytes (header included).
    pub slot_size: usize,
    /// Capacity of the pending-changes list.
    pub changes_capacity: usize,
}

/// One slot of the small-message ring. The trailing `tag` doubles as the commit marker: writers
/// fill `payload` and `size` first and store `tag` last, readers poll `tag`.
#[derive(Clone, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct RingSlot {
    pub payload: Vec<u8>,
    pub size: u64,
    pub tag: u64,
}

/// A member's row of the table. Every cell is a plain value.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct SstRow {
    /// The last view id this member installed.
    pub vid: ViewId,
    /// `suspected[q]` = this member suspects member q of having failed.
    pub suspected: Vec<bool>,
    /// Set when the member leaves gracefully.
    pub rip: bool,
    /// Set when the member has quiesced its multicast engine for the current view.
    pub wedged: bool,
    /// Proposed membership changes, slot i = change number `num_installed + i`. The leader
    /// writes these; followers echo them.
    pub changes: Vec<Option<NodeId>>,
    /// Endpoints of proposed joiners, parallel to `changes` (`None` for departures).
    pub joiner_endpoints: Vec<Option<Endpoints>>,
    /// Total changes proposed, ever.
    pub num_changes: i32,
    /// Total changes committed by the leader.
    pub num_committed: i32,
    /// Total changes this member has acknowledged.
    pub num_acked: i32,
    /// Total changes applied through installed views.
    pub num_installed: i32,
    /// Highest contiguous message index received per (subgroup, sender) column, both transports
    /// combined. -1 = none.
    pub num_received: Vec<MessageId>,
    /// Receive counters for the small-message transport alone, kept separate so the two
    /// transports do not stomp on each other's progress.
    pub num_received_sst: Vec<MessageId>,
    /// Highest globally contiguous sequence number per subgroup, derived from `num_received`.
    pub seq_num: Vec<MessageId>,
    /// Highest delivered sequence number per subgroup.
    pub delivered_num: Vec<MessageId>,
    /// Highest persisted version per subgroup.
    pub persisted_num: Vec<Version>,
    /// The shard leader's ragged-trim decision, laid out like `num_received`.
    pub global_min: Vec<MessageId>,
    /// Whether `global_min` is ready to be read, per subgroup.
    pub global_min_ready: Vec<bool>,
    /// Wall-clock timestamp (ns) bounding this member's unstable messages, per subgroup.
    pub local_stability_frontier: Vec<u64>,
    /// The small-message ring, `window_size` slots per subgroup.
    pub slots: Vec<RingSlot>,
}

impl SstRow {
    pub fn new(num_members: usize, dims: &SstDimensions) -> SstRow {
        SstRow {
            vid: 0,
            suspected: vec![false; num_members],
            rip: false,
            wedged: false,
            changes: vec![None; dims.changes_capacity],
            joiner_endpoints: vec![None; dims.changes_capacity],
            num_changes: 0,
            num_committed: 0,
            num_acked: 0,
            num_installed: 0,
            num_received: vec![-1; dims.num_received_width],
            num_received_sst: vec![-1; dims.num_received_width],
            seq_num: vec![-1; dims.num_subgroups],
            delivered_num: vec![-1; dims.num_subgroups],
            persisted_num: vec![Version::INVALID; dims.num_subgroups],
            global_min: vec![0; dims.num_received_width],
            global_min_ready: vec![false; dims.num_subgroups],
            local_stability_frontier: vec![0; dims.num_subgroups],
            slots: vec![
                RingSlot {
                    payload: vec![0; dims.slot_size],
                    size: 0,
                    tag: 0,
                };
                dims.num_subgroups * dims.window_size
            ],
        }
    }
}

/// Names the column groups a [`StatusTable::put`] publishes. The groups correspond to the
/// contiguous field ranges of [`SstRow`]; a publisher that has only touched one group publishes
/// only that group.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ColumnSet(u32);

impl ColumnSet {
    pub const VID: ColumnSet = ColumnSet(1 << 0);
    pub const SUSPECTED: ColumnSet = ColumnSet(1 << 1);
    pub const RIP: ColumnSet = ColumnSet(1 << 2);
    pub const WEDGED: ColumnSet = ColumnSet(1 << 3);
    /// `changes`, `joiner_endpoints`, `num_changes`, `num_committed`.
    pub const PROPOSAL: ColumnSet = ColumnSet(1 << 4);
    pub const ACKED: ColumnSet = ColumnSet(1 << 5);
    pub const INSTALLED: ColumnSet = ColumnSet(1 << 6);
    pub const NUM_RECEIVED: ColumnSet = ColumnSet(1 << 7);
    pub const NUM_RECEIVED_SST: ColumnSet = ColumnSet(1 << 8);
    pub const SEQ_NUM: ColumnSet = ColumnSet(1 << 9);
    pub const DELIVERED_NUM: ColumnSet = ColumnSet(1 << 10);
    pub const PERSISTED_NUM: ColumnSet = ColumnSet(1 << 11);
    /// `global_min` and `global_min_ready`.
    pub const GLOBAL_MIN: ColumnSet = ColumnSet(1 << 12);
    pub const FRONTIER: ColumnSet = ColumnSet(1 << 13);
    pub const SLOTS: ColumnSet = ColumnSet(1 << 14);
    pub const ALL: ColumnSet = ColumnSet(u32::MAX);

    pub fn contains(&self, other: ColumnSet) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ColumnSet {
    type Output = ColumnSet;
    fn bitor(self, rhs: ColumnSet) -> ColumnSet {
        ColumnSet(self.0 | rhs.0)
    }
}

/// The unit shipped to peers on every `put`: the publisher's whole row plus the set of column
/// groups the receiver should apply from it.
#[derive(BorshSerialize, BorshDeserialize)]
pub struct RowUpdate {
    pub cols: ColumnSet,
    pub row: SstRow,
}

/// The callbacks a table registers with its [`RowTransport`]: where to deliver peer row updates,
/// and where to report connection loss.
pub struct RowSink {
    pub on_update: Box<dyn Fn(NodeId, &[u8]) + Send + Sync>,
    pub on_suspect: Box<dyn Fn(NodeId) + Send + Sync>,
}

/// The replication collaborator behind the table. Implementations must deliver each publisher's
/// updates FIFO, and must surface connection loss to a peer through the attached sink's
/// `on_suspect`.
///
/// A single transport instance serves every table epoch a node creates over its lifetime, so all
/// operations carry the publishing node's id and the epoch (the `vid` of the view the table
/// belongs to).
pub trait RowTransport: Send + Sync {
    /// Register the sink updates for `(local, epoch)` should be delivered to.
    fn attach(&self, local: NodeId, epoch: ViewId, sink: RowSink);
    fn detach(&self, local: NodeId, epoch: ViewId);
    /// Publish an encoded [`RowUpdate`] to `targets` (or to every attached peer of this epoch).
    /// When `blocking`, return only after the remote writes are acknowledged.
    fn publish(&self, from: NodeId, epoch: ViewId, targets: Option<&[NodeId]>, bytes: &[u8], blocking: bool);
    /// Barrier: return once every listed member (or every member) has seen everything this node
    /// has published so far in this epoch.
    fn sync_with_members(&self, from: NodeId, epoch: ViewId, members: Option<&[NodeId]>);
}

pub struct StatusTable {
    members: Vec<NodeId>,
    my_rank: usize,
    epoch: ViewId,
    dims: SstDimensions,
    rows: RwLock<Vec<SstRow>>,
    frozen: Vec<AtomicBool>,
    transport: Arc<dyn RowTransport>,
    pub predicates: Predicates,
}

impl StatusTable {
    /// Build the table for one view and attach it to the transport. `on_suspect` is invoked from
    /// transport threads whenever a peer connection is lost; the view manager routes it into the
    /// suspicion column.
    pub fn new(
        members: Vec<NodeId>,
        my_id: NodeId,
        epoch: ViewId,
        dims: SstDimensions,
        transport: Arc<dyn RowTransport>,
        on_suspect: Box<dyn Fn(NodeId) + Send + Sync>,
    ) -> Arc<StatusTable> {
        let num_members = members.len();
        let my_rank = members
            .iter()
            .position(|m| *m == my_id)
            .expect("local node must be a member of its own view");
        let table = Arc::new(StatusTable {
            members,
            my_rank,
            epoch,
            dims,
            rows: RwLock::new((0..num_members).map(|_| SstRow::new(num_members, &dims)).collect()),
            frozen: (0..num_members).map(|_| AtomicBool::new(false)).collect(),
            transport: transport.clone(),
            predicates: Predicates::new(),
        });
        let weak: Weak<StatusTable> = Arc::downgrade(&table);
        transport.attach(
            my_id,
            epoch,
            RowSink {
                on_update: Box::new(move |from: NodeId, bytes: &[u8]| {
                    if let Some(table) = weak.upgrade() {
                        table.apply_update(from, bytes);
                    }
                }),
                on_suspect,
            },
        );
        table
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn num_rows(&self) -> usize {
        self.members.len()
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn epoch(&self) -> ViewId {
        self.epoch
    }

    pub fn dims(&self) -> &SstDimensions {
        &self.dims
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == node)
    }

    /// Read access to all rows. The guard must not be held across a call that takes the write
    /// lock (`update_local`, `apply_update`).
    pub fn rows(&self) -> RwLockReadGuard<'_, Vec<SstRow>> {
        self.rows.read().unwrap()
    }

    /// Read the table under a closure.
    pub fn read<R>(&self, f: impl FnOnce(&[SstRow]) -> R) -> R {
        f(&self.rows.read().unwrap())
    }

    /// Mutate the local row. Does not publish; follow with [`put`](Self::put).
    pub fn update_local<R>(&self, f: impl FnOnce(&mut SstRow) -> R) -> R {
        let mut rows = self.rows.write().unwrap();
        let my_rank = self.my_rank;
        f(&mut rows[my_rank])
    }

    /// Combined access for aggregation steps that must read peer rows and write the local row
    /// atomically (suspicion gossip, proposal echo, trim computation). Callers must still only
    /// mutate their own row.
    pub fn with_rows_mut<R>(&self, f: impl FnOnce(&mut [SstRow], usize) -> R) -> R {
        let mut rows = self.rows.write().unwrap();
        let my_rank = self.my_rank;
        f(&mut rows, my_rank)
    }

    /// Publish the named column groups of the local row to all peers. Non-blocking; FIFO with
    /// respect to other puts from this node.
    pub fn put(&self, cols: ColumnSet) {
        self.put_internal(cols, None, false)
    }

    /// Publish to the subset of rows named by `target_ranks` only.
    pub fn put_to(&self, target_ranks: &[usize], cols: ColumnSet) {
        let targets: Vec<NodeId> = target_ranks.iter().map(|r| self.members[*r]).collect();
        self.put_internal(cols, Some(&targets), false)
    }

    /// Like [`put`](Self::put), but returns only after the remote writes are acknowledged.
    pub fn put_with_completion(&self, cols: ColumnSet) {
        self.put_internal(cols, None, true)
    }

    fn put_internal(&self, cols: ColumnSet, targets: Option<&[NodeId]>, blocking: bool) {
        let bytes = {
            let rows = self.rows.read().unwrap();
            let update = RowUpdate {
                cols,
                row: rows[self.my_rank].clone(),
            };
            borsh::to_vec(&update).expect("row serialization cannot fail")
        };
        self.transport
            .publish(self.members[self.my_rank], self.epoch, targets, &bytes, blocking);
    }

    /// Barrier across the given subset of rows (or all members): returns once every listed peer
    /// has seen everything this node has published so far.
    pub fn sync_with_members(&self, subset: Option<&[usize]>) {
        let targets: Option<Vec<NodeId>> =
            subset.map(|ranks| ranks.iter().map(|r| self.members[*r]).collect());
        self.transport
            .sync_with_members(self.members[self.my_rank], self.epoch, targets.as_deref());
    }

    /// Stop accepting updates from the given row. Subsequent reads see the last value applied
    /// before the freeze.
    pub fn freeze(&self, rank: usize) {
        self.frozen[rank].store(true, Ordering::Release);
    }

    pub fn is_frozen(&self, rank: usize) -> bool {
        self.frozen[rank].load(Ordering::Acquire)
    }

    fn apply_update(&self, from: NodeId, bytes: &[u8]) {
        let Some(rank) = self.rank_of(from) else {
            return;
        };
        if rank == self.my_rank || self.is_frozen(rank) {
            return;
        }
        let update = match RowUpdate::try_from_slice(bytes) {
            Ok(update) => update,
            Err(err) => {
                log::warn!("Dropping undecodable row update from node {}: {}", from, err);
                return;
            }
        };
        let mut rows = self.rows.write().unwrap();
        let row = &mut rows[rank];
        let new = update.row;
        let cols = update.cols;
        if cols.contains(ColumnSet::VID) {
            row.vid = new.vid;
        }
        if cols.contains(ColumnSet::SUSPECTED) {
            row.suspected = new.suspected;
        }
        if cols.contains(ColumnSet::RIP) {
            row.rip = new.rip;
        }
        if cols.contains(ColumnSet::WEDGED) {
            row.wedged = new.wedged;
        }
        if cols.contains(ColumnSet::PROPOSAL) {
            row.changes = new.changes;
            row.joiner_endpoints = new.joiner_endpoints;
            row.num_changes = new.num_changes;
            row.num_committed = new.num_committed;
        }
        if cols.contains(ColumnSet::ACKED) {
            row.num_acked = new.num_acked;
        }
        if cols.contains(ColumnSet::INSTALLED) {
            row.num_installed = new.num_installed;
        }
        if cols.contains(ColumnSet::NUM_RECEIVED) {
            row.num_received = new.num_received;
        }
        if cols.contains(ColumnSet::NUM_RECEIVED_SST) {
            row.num_received_sst = new.num_received_sst;
        }
        if cols.contains(ColumnSet::SEQ_NUM) {
            row.seq_num = new.seq_num;
        }
        if cols.contains(ColumnSet::DELIVERED_NUM) {
            row.delivered_num = new.delivered_num;
        }
        if cols.contains(ColumnSet::PERSISTED_NUM) {
            row.persisted_num = new.persisted_num;
        }
        if cols.contains(ColumnSet::GLOBAL_MIN) {
            row.global_min = new.global_min;
            row.global_min_ready = new.global_min_ready;
        }
        if cols.contains(ColumnSet::FRONTIER) {
            row.local_stability_frontier = new.local_stability_frontier;
        }
        if cols.contains(ColumnSet::SLOTS) {
            row.slots = new.slots;
        }
    }

    /// A node joining an existing group copies the leader's change-proposal columns into its own
    /// row before evaluation starts, so it does not mistake the standing proposal counts for a
    /// fresh proposal.
    pub fn init_local_change_proposals(&self, leader_rank: usize) {
        let mut rows = self.rows.write().unwrap();
        let leader = rows[leader_rank].clone();
        let row = &mut rows[self.my_rank];
        row.changes = leader.changes;
        row.joiner_endpoints = leader.joiner_endpoints;
        row.num_changes = leader.num_changes;
        row.num_committed = leader.num_committed;
        row.num_acked = leader.num_acked;
        row.num_installed = leader.num_installed;
    }

    /// Carry the change-protocol counters of the previous view's table into this one, advancing
    /// `num_installed` past the changes the new view just applied.
    pub fn init_local_row_from_previous(&self, prev: &StatusTable, changes_installed: i32) {
        let prev_rows = prev.rows.read().unwrap();
        let prev_row = &prev_rows[prev.my_rank];
        let mut rows = self.rows.write().unwrap();
        let row = &mut rows[self.my_rank];
        row.num_changes = prev_row.num_changes;
        row.num_committed = prev_row.num_committed;
        row.num_acked = prev_row.num_acked;
        row.num_installed = prev_row.num_installed + changes_installed;
        // Shift the uninstalled tail of the changes list to the front.
        let start = (row.num_installed - prev_row.num_installed) as usize;
        for i in 0..row.changes.len() {
            let src = start + i;
            row.changes[i] = prev_row.changes.get(src).cloned().flatten();
            row.joiner_endpoints[i] = prev_row.joiner_endpoints.get(src).cloned().flatten();
        }
    }

    /// Start the predicate evaluator thread for this table.
    pub fn start_predicate_evaluation(self: &Arc<Self>) {
        Predicates::start_evaluation(self);
    }

    /// Stop the evaluator and detach from the transport. Idempotent.
    pub fn retire(&self) {
        self.predicates.stop_evaluation();
        self.transport.detach(self.members[self.my_rank], self.epoch);
    }
}

impl Drop for StatusTable {
    fn drop(&mut self) {
        self.retire();
    }
}
