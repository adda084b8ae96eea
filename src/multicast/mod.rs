/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The multicast engine: for each subgroup the local node belongs to, transmits outgoing
//! messages, receives incoming ones, and emits delivery and persistence callbacks in a
//! well-defined order.
//!
//! Two transports carry messages: a block-pipelined [bulk multicast](BulkTransport) for large
//! payloads, and the [shared slot ring](crate::sst::ring) in the status table for small ones. The
//! per-send decision is by size: `payload + header > max_smc_payload_size + header` goes bulk.

pub mod message;

pub mod transport;

pub mod intervals;

pub mod engine;

pub use engine::MulticastEngine;
pub use transport::BulkTransport;
