/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A virtually-synchronous group communication substrate. A set of processes forms a group that
//! installs a sequence of numbered [views](view::View) (membership snapshots), and within each
//! view delivers totally ordered multicasts to one or more subgroups, optionally persisting each
//! delivered version.
//!
//! The three core subsystems are:
//! 1. The [view manager](view_manager::ViewManager): a membership protocol that proposes,
//!    acknowledges, and commits joins and failures, wedges the old view, runs ragged-edge cleanup
//!    so that every surviving replica agrees on the prefix of messages delivered in the old view,
//!    and installs the next view.
//! 2. The [multicast engine](multicast::MulticastEngine): a per-subgroup delivery pipeline over
//!    two transports (a bulk block multicast for large payloads, and a shared slot ring for small
//!    payloads), tracking receipt, stability, and persistence counters in the shared status table.
//! 3. The [restart coordinator](view_manager::restart): the protocol that reconstructs a
//!    consistent cut from on-disk logs when the whole group restarts.
//!
//! Transports are pluggable: peers replicate status-table rows through an implementation of
//! [`sst::RowTransport`], and large messages travel through an implementation of
//! [`multicast::BulkTransport`]. The storage backend for replicated object state is likewise
//! pluggable through [`persistence::ReplicatedObject`].

pub mod config;

pub mod error;

pub mod types;

pub mod sst;

pub mod view;

pub mod multicast;

pub mod view_manager;

pub mod persistence;

// Re-exports
pub use error::GroupError;
pub use view_manager::ViewManager;
