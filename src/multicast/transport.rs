/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definition for the pluggable bulk multicast transport.
//!
//! The engine creates one transport group per (subgroup, sender): the sender-first rotated member
//! list identifies the group's root. Group numbers are scoped by the view epoch they belong to,
//! so every member of a view derives the same (epoch, group) identifiers independently and no
//! traffic leaks between views. Sends are asynchronous; every member of the group, the sender
//! included, observes completion of a message through the group's receive callback, in send
//! order. The self-delivery at the sender is what moves its in-flight message to locally stable.

use crate::types::basic::{NodeId, SendAlgorithm, ViewId};

/// Invoked on every completed reception (and on the sender's own completions). The slice is the
/// full message: header followed by payload. Must not be invoked synchronously from within
/// [`BulkTransport::send`]; the engine holds its state lock there.
pub type ReceiveCallback = Box<dyn FnMut(&[u8]) + Send>;

pub trait BulkTransport: Send + Sync {
    /// Create a multicast group. `members` is rotated so the sending member comes first.
    /// Returns false if the group could not be formed (e.g. a member is unreachable), in which
    /// case the engine stays quiescent until the next view change.
    fn create_group(
        &self,
        epoch: ViewId,
        group_num: u16,
        members: &[NodeId],
        block_size: u64,
        algorithm: SendAlgorithm,
        on_receive: ReceiveCallback,
    ) -> bool;

    /// Tear down a group created by [`create_group`](Self::create_group). Unknown groups are
    /// ignored.
    fn destroy_group(&self, epoch: ViewId, group_num: u16);

    /// Queue a message on the group rooted at the local node. Completion is reported through the
    /// group's receive callbacks. Returns false if the transport has failed; the caller treats
    /// that as fatal for the current view.
    fn send(&self, epoch: ViewId, group_num: u16, data: &[u8]) -> bool;

    /// Make a joining member reachable before its first view installs.
    fn add_node(&self, node: NodeId, ip: String, bulk_port: u16);

    /// Drop connections to a departed member.
    fn remove_node(&self, node: NodeId);
}
