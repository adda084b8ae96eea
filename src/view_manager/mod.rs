/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The group membership service: drives the group through its sequence of views. Maintains
//! exactly one active [`View`](crate::view::View), one optional pending next view, and the
//! associated status table; proposes, acknowledges, and commits membership changes through the
//! table; and at every view boundary runs ragged-edge cleanup so all surviving members agree on
//! the delivered prefix before the next view installs.

pub mod join;

pub mod manager;

pub mod restart;

pub use manager::{FatalError, ViewManager, ViewManagerBuilder, ViewUpcall};
