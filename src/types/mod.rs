//! Types that are used across multiple components of the library.
//!
//! Types specific to single components live next to those components, e.g.
//! [`crate::multicast::message`].

pub mod basic;

pub mod callbacks;
