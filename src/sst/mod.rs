/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Shared Status Table (SST): a matrix of per-member counters and flags, one row per view
//! member, replicated so that every member can read every row but mutate only its own. All
//! inter-node coordination in the group runs through this table, driven by predicates evaluated
//! on a single dedicated thread.

pub mod table;

pub mod predicates;

pub mod ring;

pub use predicates::{PredicateHandle, PredicateMode};
pub use table::{ColumnSet, RowSink, RowTransport, SstDimensions, SstRow, StatusTable};
