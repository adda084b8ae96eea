/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The small-message multicast ring. Each subgroup owns `window_size` slots in every member's
//! row; a sender cycles through its slots, and the trailing tag word of each slot doubles as the
//! commit marker. Writers fill the payload first and write the tag last; readers poll the tag.
//!
//! Ring positions are driven by the `num_received_sst` counters, which count only ring messages.
//! The index in a message's header is its subgroup-wide per-sender index and advances across both
//! transports.

use crate::types::basic::SubgroupId;

use super::table::{ColumnSet, StatusTable};

/// Slot index (into `SstRow::slots`) of the `n`-th ring message of a subgroup.
pub fn slot_index(subgroup: SubgroupId, window_size: usize, n: u64) -> usize {
    subgroup as usize * window_size + (n as usize % window_size)
}

/// The tag a sender writes to commit its `n`-th ring message. Increments on every wrap of the
/// ring, so a reader can distinguish a fresh message from a stale one in the same slot.
pub fn commit_tag(window_size: usize, n: u64) -> u64 {
    n / window_size as u64 + 1
}

/// Send side of one subgroup's ring.
pub struct SmcRing {
    subgroup: SubgroupId,
    window_size: usize,
    /// Capacity of each slot (header included).
    slot_size: usize,
    /// SST rank of every shard member.
    member_ranks: Vec<usize>,
    /// The `num_received_sst` column peers ack this sender's ring messages in.
    my_sender_column: usize,
    /// Ring messages sent so far.
    num_sent: u64,
}

impl SmcRing {
    pub fn new(
        subgroup: SubgroupId,
        window_size: usize,
        slot_size: usize,
        member_ranks: Vec<usize>,
        my_sender_column: usize,
    ) -> SmcRing {
        SmcRing {
            subgroup,
            window_size,
            slot_size,
            member_ranks,
            my_sender_column,
            num_sent: 0,
        }
    }

    /// Whether the next slot may be claimed: false while some shard member has not yet consumed
    /// the message that previously occupied it.
    pub fn window_open(&self, table: &StatusTable) -> bool {
        if self.num_sent < self.window_size as u64 {
            return true;
        }
        let oldest_unacked = self.num_sent - self.window_size as u64;
        table.read(|rows| {
            self.member_ranks.iter().all(|r| {
                rows[*r].num_received_sst[self.my_sender_column] as i64 >= oldest_unacked as i64
            })
        })
    }

    /// Fill the next slot under `fill`. The caller must have checked
    /// [`window_open`](Self::window_open); the slot is not visible to readers until
    /// [`commit`](Self::commit).
    pub fn fill_slot(&self, table: &StatusTable, msg_size: usize, fill: impl FnOnce(&mut [u8])) {
        assert!(msg_size <= self.slot_size);
        let slot = slot_index(self.subgroup, self.window_size, self.num_sent);
        table.update_local(|row| {
            let ring_slot = &mut row.slots[slot];
            fill(&mut ring_slot.payload[..msg_size]);
            ring_slot.size = msg_size as u64;
        });
    }

    /// Reserve and fill in one step, or return false if the window is full.
    pub fn try_fill(
        &self,
        table: &StatusTable,
        msg_size: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> bool {
        if !self.window_open(table) {
            return false;
        }
        self.fill_slot(table, msg_size, fill);
        true
    }

    /// Commit the slot filled by the last [`try_fill`](Self::try_fill) and publish it to the
    /// shard. Writing the tag is the only ordering-sensitive store in the ring: it must come
    /// after the payload, which the single mutator discipline of the local row guarantees here.
    pub fn commit(&mut self, table: &StatusTable) {
        let slot = slot_index(self.subgroup, self.window_size, self.num_sent);
        let tag = commit_tag(self.window_size, self.num_sent);
        table.update_local(|row| {
            row.slots[slot].tag = tag;
        });
        self.num_sent += 1;
        table.put_to(&self.member_ranks, ColumnSet::SLOTS);
    }

    pub fn member_ranks(&self) -> &[usize] {
        &self.member_ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_cycles_within_subgroup_region() {
        let window = 3;
        assert_eq!(slot_index(0, window, 0), 0);
        assert_eq!(slot_index(0, window, 2), 2);
        assert_eq!(slot_index(0, window, 3), 0);
        assert_eq!(slot_index(2, window, 0), 6);
        assert_eq!(slot_index(2, window, 4), 7);
    }

    #[test]
    fn tag_increments_on_every_wrap() {
        let window = 3;
        assert_eq!(commit_tag(window, 0), 1);
        assert_eq!(commit_tag(window, 2), 1);
        assert_eq!(commit_tag(window, 3), 2);
        assert_eq!(commit_tag(window, 6), 3);
    }
}
