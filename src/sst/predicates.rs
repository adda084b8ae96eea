/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Predicate registration and evaluation. A predicate is a pure function from the table to bool;
//! a trigger is a side-effecting function from the table to unit. A single evaluator thread runs
//! every registered pair repeatedly: recurrent pairs stay registered, one-time pairs are removed
//! after firing.
//!
//! Because the evaluator is single-threaded, triggers are serialized with respect to each other
//! and may register further predicates. They may block on network I/O, but must not acquire
//! locks held by other triggers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::table::StatusTable;

/// Whether a (predicate, trigger) pair stays registered after its trigger fires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PredicateMode {
    OneTime,
    Recurrent,
}

/// Handle returned by [`Predicates::insert`]; pass it back to [`Predicates::remove`] to
/// deregister.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PredicateHandle {
    id: u64,
}

type Predicate = Box<dyn Fn(&StatusTable) -> bool + Send>;
type Trigger = Box<dyn FnMut(&StatusTable) + Send>;

struct Entry {
    id: u64,
    mode: PredicateMode,
    /// Marked instead of removed in place, so a trigger can deregister any entry (itself
    /// included) while the evaluator holds that entry's closure lock.
    dead: AtomicBool,
    fns: Mutex<EntryFns>,
}

struct EntryFns {
    predicate: Predicate,
    trigger: Trigger,
}

pub struct Predicates {
    entries: Mutex<Vec<Arc<Entry>>>,
    next_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
    evaluator: Mutex<Option<JoinHandle<()>>>,
}

impl Predicates {
    pub(crate) fn new() -> Predicates {
        Predicates {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            evaluator: Mutex::new(None),
        }
    }

    /// Register a (predicate, trigger) pair.
    pub fn insert(
        &self,
        predicate: impl Fn(&StatusTable) -> bool + Send + 'static,
        trigger: impl FnMut(&StatusTable) + Send + 'static,
        mode: PredicateMode,
    ) -> PredicateHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            mode,
            dead: AtomicBool::new(false),
            fns: Mutex::new(EntryFns {
                predicate: Box::new(predicate),
                trigger: Box::new(trigger),
            }),
        });
        self.entries.lock().unwrap().push(entry);
        PredicateHandle { id }
    }

    /// Deregister the pair the handle names. Safe to call from inside a trigger.
    pub fn remove(&self, handle: &PredicateHandle) {
        let entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter().find(|e| e.id == handle.id) {
            entry.dead.store(true, Ordering::Release);
        }
    }

    /// Deregister everything.
    pub fn clear(&self) {
        for entry in self.entries.lock().unwrap().iter() {
            entry.dead.store(true, Ordering::Release);
        }
    }

    /// Spawn the evaluator thread. The thread holds only a weak reference to the table, so
    /// dropping the table also ends evaluation.
    pub(crate) fn start_evaluation(table: &Arc<StatusTable>) {
        let weak: Weak<StatusTable> = Arc::downgrade(table);
        let shutdown = table.predicates.shutdown.clone();
        let handle = thread::Builder::new()
            .name("sst_predicates".to_string())
            .spawn(move || loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let Some(table) = weak.upgrade() else { break };
                table.predicates.evaluate_once(&table);
                drop(table);
                // The RDMA-backed table busy-polls here; over a channel transport a short sleep
                // keeps the loop from monopolizing a core.
                thread::sleep(Duration::from_micros(100));
            })
            .expect("failed to spawn the predicate evaluator thread");
        *table.predicates.evaluator.lock().unwrap() = Some(handle);
    }

    /// One pass over all live entries. Runs on the evaluator thread only.
    fn evaluate_once(&self, table: &StatusTable) {
        // Snapshot the list so triggers can insert or remove entries without deadlocking.
        let snapshot: Vec<Arc<Entry>> = self.entries.lock().unwrap().clone();
        for entry in snapshot {
            if entry.dead.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire) {
                continue;
            }
            let mut fns = entry.fns.lock().unwrap();
            if (fns.predicate)(table) {
                (fns.trigger)(table);
                if entry.mode == PredicateMode::OneTime {
                    entry.dead.store(true, Ordering::Release);
                }
            }
        }
        self.entries
            .lock()
            .unwrap()
            .retain(|entry| !entry.dead.load(Ordering::Acquire));
    }

    /// Stop and join the evaluator. A no-op when called from the evaluator thread itself (the
    /// loop exits on its next iteration).
    pub(crate) fn stop_evaluation(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handle = self.evaluator.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
