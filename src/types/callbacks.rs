/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Boxed-closure aliases for the upcalls the library hands control back through, and the
//! [`CallbackSet`] bundle the user supplies at group construction.

use crate::types::basic::{Hlc, MessageId, NodeId, SubgroupId, Version};

/// Invoked for every delivered message with a payload. The payload slice is `None` for cooked
/// sends, whose bytes went to the RPC handler instead. The version is
/// [`Version::INVALID`] for unordered deliveries.
pub type MessageCallback =
    Box<dyn Fn(SubgroupId, NodeId, MessageId, Option<&[u8]>, Version) + Send + Sync>;

/// Invoked when a subgroup's persistence counter advances, with the highest version known
/// persisted.
pub type PersistenceCallback = Box<dyn Fn(SubgroupId, Version) + Send + Sync>;

/// Invoked on every delivered cooked message, with the serialized invocation bytes. This is the
/// hook the external RPC layer hangs off.
pub type RpcCallback = Box<dyn Fn(SubgroupId, NodeId, &[u8]) + Send + Sync>;

/// Invoked immediately before the RPC or stability callback for a versioned message, so the
/// receiving object knows which version it is about to handle.
pub type PostNextVersionCallback = Box<dyn Fn(SubgroupId, Version) + Send + Sync>;

/// Invoked by the stability-frontier thread when this node's messages in a subgroup have
/// remained unstable past the timeout, with the shard members whose published frontiers are
/// holding stability back. The view manager turns this into suspicions, aborting the node if
/// the partition rule is violated.
pub type FrontierStaleCallback = Box<dyn Fn(SubgroupId, &[NodeId]) + Send + Sync>;

/// Message delivery event callbacks, supplied by the client to respond to each message reaching
/// the corresponding level of stability.
#[derive(Default)]
pub struct CallbackSet {
    pub global_stability_callback: Option<MessageCallback>,
    pub local_persistence_callback: Option<PersistenceCallback>,
    pub global_persistence_callback: Option<PersistenceCallback>,
}

/// The pair of hooks into the external persistence manager: `make_version` stages a new version
/// for a delivered message, `post_persist` requests persistence of everything up to a version.
pub struct PersistenceManagerCallbacks {
    pub make_version: Box<dyn Fn(SubgroupId, Version, Hlc) + Send + Sync>,
    pub post_persist: Box<dyn Fn(SubgroupId, Version) + Send + Sync>,
}

impl Default for PersistenceManagerCallbacks {
    fn default() -> Self {
        Self {
            make_version: Box::new(|_, _, _| {}),
            post_persist: Box::new(|_, _| {}),
        }
    }
}
