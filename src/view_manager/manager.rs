/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The view manager proper. A single leader (the lowest-ranked non-failed member) arbitrates
//! membership changes through four monotone counters in the status table; five recurrent
//! predicates drive the steady-state protocol and a one-time predicate chain runs epoch
//! termination: meta-wedge, next-view computation, small-transport drain, ragged-edge cleanup,
//! persistence barrier, install.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::{TcpListener, TcpStream};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{GroupParams, NodeOptions};
use crate::error::GroupError;
use crate::multicast::transport::BulkTransport;
use crate::multicast::MulticastEngine;
use crate::persistence::{self, FactoryMap, ObjectRegistry, RaggedTrim};
use crate::sst::{ColumnSet, PredicateHandle, PredicateMode, RowTransport, SstDimensions, StatusTable};
use crate::types::basic::{Endpoints, MessageId, NodeId, ShardNum, SubgroupId, Version};
use crate::types::callbacks::{
    CallbackSet, FrontierStaleCallback, PersistenceManagerCallbacks, RpcCallback,
};
use crate::view::subgroup_info::{
    derive_subgroup_settings, make_subgroup_maps, SubgroupInfo, SubgroupSettings, SubgroupType,
};
use crate::view::View;

use super::join::{self, JoinResponse, JoinResponseCode};
use super::restart::{self, RestartLeaderState, RestartState};

/// Called with every newly installed view.
pub type ViewUpcall = Box<dyn Fn(&View) + Send + Sync>;

/// Extra room in the pending-changes list beyond the member count, bounding how many joins can
/// be in flight at once.
const PENDING_CHANGES_MARGIN: usize = 8;

/// An unrecoverable protocol condition. The manager wedges and surfaces the error to callers of
/// [`ViewManager::send`] and [`ViewManager::fatal_error`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FatalError {
    /// The local node is no longer in the majority and must shut down.
    PartitionAbort,
    /// The committed changes remove the local node from the group.
    RemovedFromView(NodeId),
    /// A protocol invariant was violated; the table is presumed corrupt.
    ProtocolViolation(String),
}

impl FatalError {
    fn to_group_error(&self) -> GroupError {
        match self {
            FatalError::PartitionAbort => GroupError::PartitionAbort,
            FatalError::RemovedFromView(id) => GroupError::RemovedFromView(*id),
            FatalError::ProtocolViolation(msg) => GroupError::InvariantViolation(msg.clone()),
        }
    }
}

/// Everything tied to one installed view.
struct ViewState {
    view: View,
    sst: Arc<StatusTable>,
    engine: Option<MulticastEngine>,
    settings: BTreeMap<SubgroupId, SubgroupSettings>,
}

/// A view computed during epoch termination but not yet installed.
struct PendingView {
    view: View,
    settings: BTreeMap<SubgroupId, SubgroupSettings>,
    num_received_size: usize,
}

/// A retired view awaiting asynchronous reclamation.
struct RetiredView {
    #[allow(dead_code)]
    view: View,
    sst: Arc<StatusTable>,
}

/// Handles of the steady-state GMS predicates, so epoch termination can deregister them.
#[derive(Default)]
struct GmsHandles {
    suspected_changed: Option<PredicateHandle>,
    start_join: Option<PredicateHandle>,
    reject_join: Option<PredicateHandle>,
    change_commit_ready: Option<PredicateHandle>,
    leader_proposed: Option<PredicateHandle>,
    leader_committed: Option<PredicateHandle>,
}

struct VmShared {
    options: NodeOptions,
    params: GroupParams,
    type_order: Vec<SubgroupType>,
    subgroup_info: SubgroupInfo,
    callbacks: Arc<CallbackSet>,
    persistence_callbacks: Arc<PersistenceManagerCallbacks>,
    objects: ObjectRegistry,
    factories: FactoryMap,
    any_persistent_objects: bool,
    row_transport: Arc<dyn RowTransport>,
    bulk_transport: Arc<dyn BulkTransport>,
    curr: RwLock<Option<ViewState>>,
    next: Mutex<Option<PendingView>>,
    last_suspected: Mutex<Vec<bool>>,
    pending_join_sockets: Mutex<VecDeque<TcpStream>>,
    proposed_join_sockets: Mutex<VecDeque<(NodeId, TcpStream)>>,
    old_views: Mutex<VecDeque<RetiredView>>,
    old_views_cv: Condvar,
    thread_shutdown: AtomicBool,
    view_upcalls: Mutex<Vec<ViewUpcall>>,
    gms_handles: Mutex<GmsHandles>,
    restart_state: Mutex<Option<RestartState>>,
    fatal: Mutex<Option<FatalError>>,
    /// Bumped at every install; senders blocked across a view change wait on it.
    view_change_epoch: Mutex<u64>,
    view_change_cv: Condvar,
}

/// Spec for constructing a [`ViewManager`]. All the pluggable collaborators land here.
pub struct ViewManagerBuilder {
    pub options: NodeOptions,
    pub params: GroupParams,
    pub type_order: Vec<SubgroupType>,
    pub subgroup_info: SubgroupInfo,
    pub factories: FactoryMap,
    pub any_persistent_objects: bool,
    pub callbacks: CallbackSet,
    pub persistence_callbacks: PersistenceManagerCallbacks,
    pub row_transport: Arc<dyn RowTransport>,
    pub bulk_transport: Arc<dyn BulkTransport>,
    pub view_upcalls: Vec<ViewUpcall>,
}

impl ViewManagerBuilder {
    pub fn build(self) -> Result<ViewManager, GroupError> {
        ViewManager::new(self)
    }
}

pub struct ViewManager {
    shared: Arc<VmShared>,
    gms_listener: Arc<TcpListener>,
    transfer_listener: Arc<TcpListener>,
    client_listener_thread: Mutex<Option<JoinHandle<()>>>,
    old_view_cleanup_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Read guard over the current view.
pub struct ViewRef<'a> {
    guard: RwLockReadGuard<'a, Option<ViewState>>,
}

impl Deref for ViewRef<'_> {
    type Target = View;
    fn deref(&self) -> &View {
        &self.guard.as_ref().expect("a view is always installed").view
    }
}

impl ViewManager {
    /// Construct the manager and bring up the first view: the configured leader either awaits
    /// its first view (or runs total restart if a view is logged on disk), while every other
    /// node joins through the leader. On return a view is installed and the engine is live;
    /// call [`start`](Self::start) to begin predicate evaluation.
    pub fn new(builder: ViewManagerBuilder) -> Result<ViewManager, GroupError> {
        let gms_listener = Arc::new(TcpListener::bind((
            builder.options.local_ip.as_str(),
            builder.options.gms_port,
        ))?);
        let transfer_listener = Arc::new(TcpListener::bind((
            builder.options.local_ip.as_str(),
            builder.options.rpc_port,
        ))?);

        let shared = Arc::new(VmShared {
            options: builder.options,
            params: builder.params,
            type_order: builder.type_order,
            subgroup_info: builder.subgroup_info,
            callbacks: Arc::new(builder.callbacks),
            persistence_callbacks: Arc::new(builder.persistence_callbacks),
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            factories: builder.factories,
            any_persistent_objects: builder.any_persistent_objects,
            row_transport: builder.row_transport,
            bulk_transport: builder.bulk_transport,
            curr: RwLock::new(None),
            next: Mutex::new(None),
            last_suspected: Mutex::new(Vec::new()),
            pending_join_sockets: Mutex::new(VecDeque::new()),
            proposed_join_sockets: Mutex::new(VecDeque::new()),
            old_views: Mutex::new(VecDeque::new()),
            old_views_cv: Condvar::new(),
            thread_shutdown: AtomicBool::new(false),
            view_upcalls: Mutex::new(builder.view_upcalls),
            gms_handles: Mutex::new(GmsHandles::default()),
            restart_state: Mutex::new(None),
            fatal: Mutex::new(None),
            view_change_epoch: Mutex::new(0),
            view_change_cv: Condvar::new(),
        });

        let manager = ViewManager {
            shared: shared.clone(),
            gms_listener,
            transfer_listener,
            client_listener_thread: Mutex::new(None),
            old_view_cleanup_thread: Mutex::new(None),
        };

        let my_id = shared.options.local_id;
        if shared.options.is_group_leader() {
            let logged_view = persistence::load_view(&shared.options.storage_dir);
            match logged_view {
                Some(view) if shared.any_persistent_objects => {
                    log::info!("Logged view {} found on disk; restarting in recovery mode", view.vid);
                    manager.await_rejoining_nodes(view)?;
                }
                _ => {
                    manager.await_first_view()?;
                }
            }
        } else {
            manager.receive_configuration()?;
        }

        // Initial object setup: create replicated objects for this node's stateful subgroups,
        // push state for the shards this node leads, then pull state from the shard leaders.
        // Sends go first so that two nodes leading each other's shards cannot wait on each
        // other's accept loops.
        {
            let old_shard_leaders = shared
                .restart_state
                .lock()
                .unwrap()
                .as_ref()
                .map(|rs| rs.restart_shard_leaders.clone())
                .unwrap_or_default();
            let expected_transfers = {
                let curr = shared.curr.read().unwrap();
                let view_state = curr.as_ref().expect("a view was just installed");
                shared.create_subgroup_objects(&view_state.view, &old_shard_leaders)
            };
            shared.send_objects_as_shard_leader(&old_shard_leaders)?;
            shared.receive_subgroup_objects(expected_transfers, &manager.transfer_listener)?;
        }

        manager.finish_setup();
        log::debug!("Initial view installed at node {}", my_id);
        Ok(manager)
    }

    /// Start predicate evaluation. In restart mode this first logs the agreed ragged trims and
    /// truncates the local persistent logs to match.
    pub fn start(&self) -> Result<(), GroupError> {
        let restart_state = self.shared.restart_state.lock().unwrap().take();
        if let Some(restart_state) = restart_state {
            let curr = self.shared.curr.read().unwrap();
            let view_state = curr.as_ref().expect("a view is always installed");
            log::debug!("Truncating persistent logs to conform to the agreed ragged trim");
            restart::apply_logged_trims(
                &self.shared.options,
                &view_state.view,
                &restart_state,
                &self.shared.objects,
            )?;
        }
        log::debug!("Starting predicate evaluation");
        let curr = self.shared.curr.read().unwrap();
        curr.as_ref()
            .expect("a view is always installed")
            .sst
            .start_predicate_evaluation();
        Ok(())
    }

    /// Cleanly leave the group: announce the departure, stop originating multicasts, and let the
    /// surviving members run the view change without this node.
    pub fn leave(&self) {
        log::debug!("Cleanly leaving the group");
        let curr = self.shared.curr.read().unwrap();
        if let Some(view_state) = curr.as_ref() {
            if let Some(engine) = &view_state.engine {
                engine.wedge();
            }
            view_state.sst.predicates.clear();
            let my_rank = view_state.sst.my_rank();
            view_state.sst.update_local(|row| {
                row.suspected[my_rank] = true;
            });
            view_state.sst.put(ColumnSet::SUSPECTED);
            view_state.sst.update_local(|row| {
                row.rip = true;
            });
            view_state.sst.put_with_completion(ColumnSet::RIP);
        }
        drop(curr);
        self.shared.thread_shutdown.store(true, Ordering::Release);
        self.shared.old_views_cv.notify_all();
        self.shared.view_change_cv.notify_all();
    }

    /// Report that a peer is unreachable. Routed into the suspicion column; the view change does
    /// the rest.
    pub fn report_failure(&self, who: NodeId) -> Result<(), GroupError> {
        self.shared.report_failure(who).map_err(|fatal| {
            let err = fatal.to_group_error();
            self.shared.record_fatal(fatal);
            err
        })
    }

    /// Send a multicast in the subgroup. `fill` writes the payload; it may be invoked again if
    /// the view changes mid-send and the message must be re-queued in the next view.
    pub fn send(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        fill: impl Fn(&mut [u8]),
        cooked_send: bool,
    ) -> Result<(), GroupError> {
        loop {
            if let Some(fatal) = self.shared.fatal.lock().unwrap().as_ref() {
                return Err(fatal.to_group_error());
            }
            if self.shared.thread_shutdown.load(Ordering::Acquire) {
                return Err(GroupError::InvariantViolation(
                    "cannot send after leaving the group".to_string(),
                ));
            }
            let epoch = *self.shared.view_change_epoch.lock().unwrap();
            {
                let curr = self.shared.curr.read().unwrap();
                let view_state = curr.as_ref().expect("a view is always installed");
                let engine = view_state.engine.as_ref().expect("the engine lives as long as the view");
                if engine.send(subgroup, payload_size, |buf| fill(buf), cooked_send)? {
                    return Ok(());
                }
            }
            // The engine is wedged; wait for the next view to install and retry there.
            let guard = self.shared.view_change_epoch.lock().unwrap();
            let _ = self
                .shared
                .view_change_cv
                .wait_timeout_while(guard, Duration::from_millis(50), |e| *e == epoch)
                .unwrap();
        }
    }

    /// Read access to the current view.
    pub fn get_current_view(&self) -> ViewRef<'_> {
        ViewRef {
            guard: self.shared.curr.read().unwrap(),
        }
    }

    pub fn add_view_upcall(&self, upcall: ViewUpcall) {
        self.shared.view_upcalls.lock().unwrap().push(upcall);
    }

    pub fn get_members(&self) -> Vec<NodeId> {
        self.get_current_view().members.clone()
    }

    pub fn get_my_rank(&self) -> Option<usize> {
        self.get_current_view().my_rank
    }

    pub fn get_subgroup_members(&self, subgroup: SubgroupId) -> Vec<Vec<NodeId>> {
        self.get_current_view().subgroup_shard_views[subgroup as usize]
            .iter()
            .map(|shard| shard.members.clone())
            .collect()
    }

    pub fn get_my_shard(&self, subgroup: SubgroupId) -> Option<ShardNum> {
        self.get_current_view().my_subgroups.get(&subgroup).copied()
    }

    /// Barrier over the status table: returns once every member has seen everything this node
    /// published.
    pub fn barrier_sync(&self) {
        let curr = self.shared.curr.read().unwrap();
        if let Some(view_state) = curr.as_ref() {
            view_state.sst.sync_with_members(None);
        }
    }

    pub fn compute_global_stability_frontier(&self, subgroup: SubgroupId) -> u64 {
        let curr = self.shared.curr.read().unwrap();
        curr.as_ref()
            .and_then(|vs| vs.engine.as_ref())
            .map(|engine| engine.compute_global_stability_frontier(subgroup))
            .unwrap_or(0)
    }

    /// Forwarded to the engine: the persistence manager reports a persisted version.
    pub fn report_persisted(&self, subgroup: SubgroupId, version: Version) {
        let curr = self.shared.curr.read().unwrap();
        if let Some(engine) = curr.as_ref().and_then(|vs| vs.engine.as_ref()) {
            engine.report_persisted(subgroup, version);
        }
    }

    /// Forwarded to the engine: the RPC layer installs its delivery hook.
    pub fn register_rpc_callback(&self, handler: RpcCallback) {
        let curr = self.shared.curr.read().unwrap();
        if let Some(engine) = curr.as_ref().and_then(|vs| vs.engine.as_ref()) {
            engine.register_rpc_callback(handler);
        }
    }

    /// The fatal condition that wedged this node, if any.
    pub fn fatal_error(&self) -> Option<FatalError> {
        self.shared.fatal.lock().unwrap().clone()
    }

    /* ----------  Constructor components ---------- */

    /// Leader path, fresh start: accept joins one at a time, re-running the sharding function
    /// after each, until the view is adequately provisioned; then run a two-phase commit over
    /// TCP with all joiners. A joiner that disconnects mid-commit is dropped and the loop
    /// restarts.
    fn await_first_view(&self) -> Result<(), GroupError> {
        let shared = &self.shared;
        let my_id = shared.options.local_id;
        let mut view = View::singleton(my_id, shared.options.endpoints());
        view.localize(my_id);
        let mut settings = BTreeMap::new();
        let mut num_received_size =
            make_subgroup_maps(&shared.subgroup_info, &shared.type_order, None, &mut view, &mut settings)?;

        let mut waiting_join_sockets: BTreeMap<NodeId, TcpStream> = BTreeMap::new();
        let mut members_sent_view: BTreeSet<NodeId> = BTreeSet::new();
        loop {
            while !view.is_adequately_provisioned {
                let (mut socket, _) = self.gms_listener.accept()?;
                let joiner_id: NodeId = match join::read_value(&mut socket) {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                if view.rank_of(joiner_id).is_some() {
                    let _ = join::write_value(
                        &mut socket,
                        &JoinResponse { code: JoinResponseCode::IdInUse, leader_id: my_id },
                    );
                    continue;
                }
                if join::write_value(
                    &mut socket,
                    &JoinResponse { code: JoinResponseCode::Ok, leader_id: my_id },
                )
                .is_err()
                {
                    continue;
                }
                let Ok(gms_port) = join::read_value::<u16>(&mut socket) else { continue };
                let Ok(rpc_port) = join::read_value::<u16>(&mut socket) else { continue };
                let Ok(sst_port) = join::read_value::<u16>(&mut socket) else { continue };
                let Ok(bulk_port) = join::read_value::<u16>(&mut socket) else { continue };
                let joiner_ip = socket
                    .peer_addr()
                    .map(|a| a.ip().to_string())
                    .unwrap_or_else(|_| "127.0.0.1".to_string());
                log::debug!("Node {} connected from {} during group bootstrap", joiner_id, joiner_ip);
                // Append the joiner and re-provision. None of these intermediate views install.
                let mut members = view.members.clone();
                let mut endpoints = view.member_endpoints.clone();
                let mut joined = view.joined.clone();
                members.push(joiner_id);
                endpoints.push(Endpoints {
                    ip: joiner_ip,
                    gms_port,
                    rpc_port,
                    sst_port,
                    bulk_port,
                });
                joined.push(joiner_id);
                let num_members = members.len();
                view = View::new(0, members, endpoints, vec![false; num_members], joined, vec![], 0);
                view.localize(my_id);
                num_received_size = make_subgroup_maps(
                    &shared.subgroup_info,
                    &shared.type_order,
                    None,
                    &mut view,
                    &mut settings,
                )?;
                waiting_join_sockets.insert(joiner_id, socket);
            }

            // Send the proposed view to every waiting joiner.
            let mut failed_joiner: Option<NodeId> = None;
            for (joiner_id, socket) in waiting_join_sockets.iter_mut() {
                let sent = join::write_frame(socket, &view)
                    .and_then(|_| join::write_frame(socket, &shared.params));
                if sent.is_err() {
                    failed_joiner = Some(*joiner_id);
                    break;
                }
                members_sent_view.insert(*joiner_id);
            }

            match failed_joiner {
                None => {
                    // Tell each joiner to commit.
                    for member in &members_sent_view {
                        log::debug!("Sending view commit message to node {}", member);
                        let _ = join::write_value(waiting_join_sockets.get_mut(member).unwrap(), &true);
                    }
                    break;
                }
                Some(failed_id) => {
                    log::info!(
                        "Node {} failed after contacting the leader; removing it from the initial view",
                        failed_id
                    );
                    // Tell everyone who got the view to abort it, then recompute without the
                    // failed joiner.
                    for member in &members_sent_view {
                        let _ = join::write_value(waiting_join_sockets.get_mut(member).unwrap(), &false);
                    }
                    members_sent_view.clear();
                    waiting_join_sockets.remove(&failed_id);
                    let keep: Vec<usize> = (0..view.num_members())
                        .filter(|r| view.members[*r] != failed_id)
                        .collect();
                    let members: Vec<NodeId> = keep.iter().map(|r| view.members[*r]).collect();
                    let endpoints: Vec<Endpoints> =
                        keep.iter().map(|r| view.member_endpoints[*r].clone()).collect();
                    let joined: Vec<NodeId> =
                        view.joined.iter().filter(|j| **j != failed_id).cloned().collect();
                    let num_members = members.len();
                    view = View::new(0, members, endpoints, vec![false; num_members], joined, vec![], 0);
                    view.localize(my_id);
                    num_received_size = make_subgroup_maps(
                        &shared.subgroup_info,
                        &shared.type_order,
                        None,
                        &mut view,
                        &mut settings,
                    )?;
                }
            }
        }
        log::trace!("Decided on initial view: {}", view.debug_string());

        // No old shard leaders exist for an initial view.
        for (_, socket) in waiting_join_sockets.iter_mut() {
            let _ = join::write_frame(socket, &Vec::<Vec<i64>>::new());
        }
        drop(waiting_join_sockets);

        if shared.any_persistent_objects {
            persistence::save_view(&shared.options.storage_dir, &view)?;
        }
        shared.install_first_view(view, settings, num_received_size)
    }

    /// Leader path, total restart: collect rejoining nodes and their logs, compute a restart
    /// view, and two-phase commit it, retrying without any rejoiner that fails mid-broadcast.
    fn await_rejoining_nodes(&self, logged_view: View) -> Result<(), GroupError> {
        let shared = &self.shared;
        let my_id = shared.options.local_id;
        let mut logged_view = logged_view;
        logged_view.localize(my_id);
        let mut restart_state = RestartState::load_ragged_trim(&logged_view, &shared.options.storage_dir);
        let mut leader_state =
            RestartLeaderState::new(logged_view, my_id, shared.options.endpoints(), &restart_state);

        loop {
            leader_state.await_quorum(
                &self.gms_listener,
                &mut restart_state,
                &shared.type_order,
                &shared.subgroup_info,
            )?;
            // All collected trims get the restart leader's stamp of approval.
            restart_state.approve_all_trims();
            leader_state.log_longest_logs();

            match leader_state.send_restart_view(&shared.params, &restart_state) {
                None => {
                    break;
                }
                Some(failed_id) => {
                    log::info!("Node {} failed while waiting for the restart quorum", failed_id);
                    leader_state.confirm_restart_view(false);
                    leader_state.remove_rejoiner(failed_id);
                    // Retry with the remaining nodes while the view stays adequate; otherwise
                    // go back to waiting for more rejoiners.
                    let mut resend_failed = true;
                    while resend_failed
                        && leader_state.compute_restart_view(&shared.type_order, &shared.subgroup_info)?
                    {
                        match leader_state.send_restart_view(&shared.params, &restart_state) {
                            None => {
                                resend_failed = false;
                            }
                            Some(failed_id) => {
                                log::debug!(
                                    "Recomputed view was adequate but node {} failed while sending it",
                                    failed_id
                                );
                                leader_state.confirm_restart_view(false);
                                leader_state.remove_rejoiner(failed_id);
                            }
                        }
                    }
                    if !resend_failed {
                        break;
                    }
                }
            }
        }
        leader_state.confirm_restart_view(true);
        leader_state.send_shard_leaders();

        let (view, settings, num_received_size) = leader_state.take_restart_view();
        log::trace!("Decided on restart view: {}", view.debug_string());
        restart_state.restart_shard_leaders = leader_state.restart_shard_leaders().clone();
        *shared.restart_state.lock().unwrap() = Some(restart_state);
        if shared.any_persistent_objects {
            persistence::save_view(&shared.options.storage_dir, &view)?;
        }
        shared.install_first_view(view, settings, num_received_size)
    }

    /// Follower path: join through the leader (following redirects), then derive local settings
    /// from the received view.
    fn receive_configuration(&self) -> Result<(), GroupError> {
        let shared = &self.shared;
        let my_id = shared.options.local_id;
        if shared.any_persistent_objects && persistence::load_view(&shared.options.storage_dir).is_some() {
            log::info!("Logged view found on disk; this node must rejoin through the restart leader");
        }
        let config = join::join_existing_group(&shared.options)?;
        let mut view = config.view;
        view.localize(my_id);
        if view.my_rank.is_none() {
            return Err(GroupError::InvariantViolation(
                "the committed view does not contain this node".to_string(),
            ));
        }
        let mut settings = BTreeMap::new();
        let num_received_size = derive_subgroup_settings(&mut view, &mut settings)?;
        log::trace!("Received initial view: {}", view.debug_string());

        if config.is_total_restart {
            let mut restart_state = RestartState {
                logged_ragged_trim: BTreeMap::new(),
                restart_shard_leaders: config.old_shard_leaders.clone(),
            };
            for trim in config.ragged_trims {
                restart_state.merge_trim(trim);
            }
            *shared.restart_state.lock().unwrap() = Some(restart_state);
        } else if !config.old_shard_leaders.is_empty() {
            // A plain joiner still needs to know who to pull object state from.
            *shared.restart_state.lock().unwrap() = Some(RestartState {
                logged_ragged_trim: BTreeMap::new(),
                restart_shard_leaders: config.old_shard_leaders,
            });
        }

        // The follower uses the leader-supplied parameters from here on. They are identical to
        // the local configuration in a well-formed deployment; trust the leader's copy.
        if config.params != shared.params {
            log::warn!("Leader's group parameters differ from the local configuration; using the leader's");
        }

        if shared.any_persistent_objects {
            persistence::save_view(&shared.options.storage_dir, &view)?;
        }
        shared.install_first_view(view, settings, num_received_size)
    }

    /// Common tail of all three constructor paths: threads, predicates, upcalls.
    fn finish_setup(&self) {
        let shared = &self.shared;
        {
            let curr = shared.curr.read().unwrap();
            let view_state = curr.as_ref().expect("a view was just installed");
            view_state.sst.put(ColumnSet::ALL);
            view_state.sst.sync_with_members(None);
            log::debug!("Done setting up the initial table and multicast engine");

            if view_state.view.vid != 0 && !view_state.view.i_am_leader() {
                // A node joining an existing group copies the leader's proposal counters, or it
                // would immediately mistake the standing counts for a fresh proposal.
                view_state.sst.init_local_change_proposals(view_state.view.rank_of_leader());
                view_state.sst.put(ColumnSet::PROPOSAL | ColumnSet::ACKED | ColumnSet::INSTALLED);
                log::debug!("Joining node initialized its row from the leader");
            }
            *shared.last_suspected.lock().unwrap() = vec![false; view_state.view.num_members()];
        }
        self.create_threads();
        shared.register_gms_predicates(true);

        let curr = shared.curr.read().unwrap();
        let view_state = curr.as_ref().expect("a view was just installed");
        for upcall in shared.view_upcalls.lock().unwrap().iter() {
            upcall(&view_state.view);
        }
    }

    /// The join listener and old-view cleanup threads.
    fn create_threads(&self) {
        let shared = self.shared.clone();
        let listener = self.gms_listener.clone();
        let handle = thread::Builder::new()
            .name("client_thread".to_string())
            .spawn(move || {
                while !shared.thread_shutdown.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((socket, addr)) => {
                            if shared.thread_shutdown.load(Ordering::Acquire) {
                                break;
                            }
                            log::debug!("Background thread got a client connection from {}", addr);
                            shared.pending_join_sockets.lock().unwrap().push_back(socket);
                        }
                        Err(_) => break,
                    }
                }
                log::debug!("Connection listener thread shutting down");
            })
            .expect("failed to spawn the join listener thread");
        *self.client_listener_thread.lock().unwrap() = Some(handle);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("old_view".to_string())
            .spawn(move || {
                loop {
                    let retired = {
                        let mut old_views = shared.old_views.lock().unwrap();
                        while old_views.is_empty() && !shared.thread_shutdown.load(Ordering::Acquire)
                        {
                            old_views = shared.old_views_cv.wait(old_views).unwrap();
                        }
                        if shared.thread_shutdown.load(Ordering::Acquire) && old_views.is_empty() {
                            break;
                        }
                        old_views.pop_front()
                    };
                    drop(retired);
                }
                log::debug!("Old view cleanup thread shutting down");
            })
            .expect("failed to spawn the old view cleanup thread");
        *self.old_view_cleanup_thread.lock().unwrap() = Some(handle);
    }
}

impl Drop for ViewManager {
    fn drop(&mut self) {
        self.shared.thread_shutdown.store(true, Ordering::Release);
        // Force the blocking accept to return.
        let _ = TcpStream::connect((self.shared.options.local_ip.as_str(), self.shared.options.gms_port));
        if let Some(handle) = self.client_listener_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.old_views_cv.notify_all();
        if let Some(handle) = self.old_view_cleanup_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        // Stop evaluation before the engine and table go away. The evaluator may be blocked on
        // the view lock, so it must be joined with the lock released.
        let sst = {
            let curr = self.shared.curr.read().unwrap();
            curr.as_ref().map(|view_state| {
                if let Some(engine) = &view_state.engine {
                    engine.wedge();
                }
                view_state.sst.clone()
            })
        };
        if let Some(sst) = sst {
            sst.retire();
        }
    }
}

impl VmShared {
    fn my_id(&self) -> NodeId {
        self.options.local_id
    }

    fn record_fatal(&self, fatal: FatalError) {
        log::error!("Fatal group condition: {:?}", fatal);
        let mut slot = self.fatal.lock().unwrap();
        if slot.is_none() {
            *slot = Some(fatal);
        }
        drop(slot);
        let curr = self.curr.read().unwrap();
        if let Some(engine) = curr.as_ref().and_then(|vs| vs.engine.as_ref()) {
            engine.wedge();
        }
        self.view_change_cv.notify_all();
    }

    /// Build the status table and multicast engine for a freshly computed first view and store
    /// it as the current view.
    fn install_first_view(
        self: &Arc<Self>,
        view: View,
        settings: BTreeMap<SubgroupId, SubgroupSettings>,
        num_received_size: usize,
    ) -> Result<(), GroupError> {
        let sst = self.make_status_table(&view, num_received_size);
        let engine = self.make_first_engine(&view, &sst, settings.clone());
        sst.update_local(|row| row.vid = view.vid);
        *self.curr.write().unwrap() = Some(ViewState {
            view,
            sst,
            engine: Some(engine),
            settings,
        });
        Ok(())
    }

    fn make_status_table(self: &Arc<Self>, view: &View, num_received_size: usize) -> Arc<StatusTable> {
        let dims = SstDimensions {
            num_subgroups: view.subgroup_shard_views.len(),
            num_received_width: num_received_size,
            window_size: self.params.window_size as usize,
            slot_size: self.params.max_smc_payload_size as usize
                + crate::multicast::message::HEADER_SIZE,
            changes_capacity: view.num_members() + PENDING_CHANGES_MARGIN,
        };
        let weak: Weak<VmShared> = Arc::downgrade(self);
        StatusTable::new(
            view.members.clone(),
            self.my_id(),
            view.vid,
            dims,
            self.row_transport.clone(),
            Box::new(move |failed_node| {
                if let Some(shared) = weak.upgrade() {
                    if let Err(fatal) = shared.report_failure(failed_node) {
                        shared.record_fatal(fatal);
                    }
                }
            }),
        )
    }

    fn persistent_subgroups_of(&self, view: &View) -> BTreeSet<SubgroupId> {
        if !self.any_persistent_objects {
            return BTreeSet::new();
        }
        view.my_subgroups
            .keys()
            .filter(|subgroup| {
                self.type_of_subgroup(view, **subgroup)
                    .map(|type_id| self.type_order[type_id as usize].stateful)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    fn type_of_subgroup(&self, view: &View, subgroup: SubgroupId) -> Option<u32> {
        view.subgroup_ids_by_type_id
            .iter()
            .position(|ids| ids.contains(&subgroup))
            .map(|type_id| type_id as u32)
    }

    fn make_post_next_version(&self) -> Box<dyn Fn(SubgroupId, Version) + Send + Sync> {
        let objects = self.objects.clone();
        Box::new(move |subgroup, version| {
            if let Some(object) = objects.lock().unwrap().get_mut(&subgroup) {
                object.post_next_version(version);
            }
        })
    }

    /// The stability-frontier thread reports that this node's messages in a subgroup stayed
    /// unstable past the timeout. The members holding stability back get suspected, which aborts
    /// the node if the partition rule is violated and otherwise drives a view change.
    fn make_frontier_stale_callback(self: &Arc<Self>) -> FrontierStaleCallback {
        let weak: Weak<VmShared> = Arc::downgrade(self);
        Box::new(move |subgroup, stale_members: &[NodeId]| {
            let Some(shared) = weak.upgrade() else { return };
            log::warn!(
                "Subgroup {}: messages unstable past the timeout; suspecting members {:?}",
                subgroup,
                stale_members.iter().map(|m| m.int()).collect::<Vec<_>>()
            );
            for member in stale_members {
                if let Err(fatal) = shared.report_failure(*member) {
                    shared.record_fatal(fatal);
                    return;
                }
            }
        })
    }

    fn make_first_engine(
        self: &Arc<Self>,
        view: &View,
        sst: &Arc<StatusTable>,
        settings: BTreeMap<SubgroupId, SubgroupSettings>,
    ) -> MulticastEngine {
        MulticastEngine::new(
            view.members.clone(),
            self.my_id(),
            sst.clone(),
            self.callbacks.clone(),
            view.subgroup_shard_views.len(),
            settings,
            self.persistent_subgroups_of(view),
            &self.params,
            self.make_post_next_version(),
            self.make_frontier_stale_callback(),
            self.persistence_callbacks.clone(),
            self.bulk_transport.clone(),
            &view.failed,
        )
    }

    /* ----------  Steady-state predicates and triggers ---------- */

    fn register_gms_predicates(self: &Arc<Self>, include_leader_committed: bool) {
        let curr = self.curr.read().unwrap();
        let view_state = curr.as_ref().expect("a view is always installed");
        let sst = &view_state.sst;
        let mut handles = self.gms_handles.lock().unwrap();

        if handles.suspected_changed.is_none() {
            let pred_weak = Arc::downgrade(self);
            let trig_weak = Arc::downgrade(self);
            handles.suspected_changed = Some(sst.predicates.insert(
                move |table| {
                    pred_weak
                        .upgrade()
                        .map(|shared| {
                            let last = shared.last_suspected.lock().unwrap();
                            table.read(|rows| {
                                rows.iter().any(|row| {
                                    row.suspected
                                        .iter()
                                        .enumerate()
                                        .any(|(who, s)| *s && !last.get(who).copied().unwrap_or(false))
                                })
                            })
                        })
                        .unwrap_or(false)
                },
                move |table| {
                    if let Some(shared) = trig_weak.upgrade() {
                        shared.new_suspicion(table);
                    }
                },
                PredicateMode::Recurrent,
            ));
        }
        if handles.start_join.is_none() {
            let pred_weak = Arc::downgrade(self);
            let trig_weak = Arc::downgrade(self);
            handles.start_join = Some(sst.predicates.insert(
                move |_| {
                    pred_weak
                        .upgrade()
                        .map(|shared| {
                            shared.i_am_leader() && !shared.pending_join_sockets.lock().unwrap().is_empty()
                        })
                        .unwrap_or(false)
                },
                move |_| {
                    if let Some(shared) = trig_weak.upgrade() {
                        shared.leader_start_join();
                    }
                },
                PredicateMode::Recurrent,
            ));
        }
        if handles.reject_join.is_none() {
            let pred_weak = Arc::downgrade(self);
            let trig_weak = Arc::downgrade(self);
            handles.reject_join = Some(sst.predicates.insert(
                move |_| {
                    pred_weak
                        .upgrade()
                        .map(|shared| {
                            !shared.i_am_leader() && !shared.pending_join_sockets.lock().unwrap().is_empty()
                        })
                        .unwrap_or(false)
                },
                move |_| {
                    if let Some(shared) = trig_weak.upgrade() {
                        shared.redirect_join_attempt();
                    }
                },
                PredicateMode::Recurrent,
            ));
        }
        if handles.change_commit_ready.is_none() {
            let pred_weak = Arc::downgrade(self);
            let trig_weak = Arc::downgrade(self);
            handles.change_commit_ready = Some(sst.predicates.insert(
                move |table| {
                    pred_weak
                        .upgrade()
                        .map(|shared| {
                            shared.i_am_leader()
                                && shared.min_acked(table)
                                    > table.read(|rows| rows[table.my_rank()].num_committed)
                        })
                        .unwrap_or(false)
                },
                move |table| {
                    if let Some(shared) = trig_weak.upgrade() {
                        shared.leader_commit_change(table);
                    }
                },
                PredicateMode::Recurrent,
            ));
        }
        if handles.leader_proposed.is_none() {
            let pred_weak = Arc::downgrade(self);
            let trig_weak = Arc::downgrade(self);
            handles.leader_proposed = Some(sst.predicates.insert(
                move |table| {
                    pred_weak
                        .upgrade()
                        .map(|shared| {
                            let leader_rank = shared.leader_rank();
                            table.read(|rows| {
                                rows[leader_rank].num_changes > rows[table.my_rank()].num_acked
                            })
                        })
                        .unwrap_or(false)
                },
                move |table| {
                    if let Some(shared) = trig_weak.upgrade() {
                        shared.acknowledge_proposed_change(table);
                    }
                },
                PredicateMode::Recurrent,
            ));
        }
        if include_leader_committed && handles.leader_committed.is_none() {
            let pred_weak = Arc::downgrade(self);
            let trig_weak = Arc::downgrade(self);
            handles.leader_committed = Some(sst.predicates.insert(
                move |table| {
                    pred_weak
                        .upgrade()
                        .map(|shared| {
                            let leader_rank = shared.leader_rank();
                            table.read(|rows| {
                                rows[leader_rank].num_committed > rows[table.my_rank()].num_installed
                            })
                        })
                        .unwrap_or(false)
                },
                move |table| {
                    if let Some(shared) = trig_weak.upgrade() {
                        shared.start_meta_wedge(table);
                    }
                },
                PredicateMode::OneTime,
            ));
        }
    }

    fn i_am_leader(&self) -> bool {
        self.curr
            .read()
            .unwrap()
            .as_ref()
            .map(|vs| vs.view.i_am_leader())
            .unwrap_or(false)
    }

    fn leader_rank(&self) -> usize {
        self.curr
            .read()
            .unwrap()
            .as_ref()
            .map(|vs| vs.view.rank_of_leader())
            .unwrap_or(0)
    }

    fn min_acked(&self, table: &StatusTable) -> i32 {
        let curr = self.curr.read().unwrap();
        let failed = curr.as_ref().map(|vs| vs.view.failed.clone()).unwrap_or_default();
        table.read(|rows| {
            rows.iter()
                .enumerate()
                .filter(|(rank, _)| !failed.get(*rank).copied().unwrap_or(false))
                .map(|(_, row)| row.num_acked)
                .min()
                .unwrap_or(0)
        })
    }

    /// A member's row in `changes[]` already proposes removing `who`.
    fn changes_contains(&self, table: &StatusTable, who: NodeId) -> bool {
        table.read(|rows| {
            let row = &rows[table.my_rank()];
            let pending = (row.num_changes - row.num_installed) as usize;
            row.changes[..pending.min(row.changes.len())]
                .iter()
                .any(|c| *c == Some(who))
        })
    }

    /// Trigger: some row's suspicions changed. Aggregate them, freeze and mark the newly
    /// suspected members, wedge, and (as leader) propose their removal.
    fn new_suspicion(self: &Arc<Self>, table: &StatusTable) {
        log::debug!("Suspected[] changed");
        let mut curr = self.curr.write().unwrap();
        let Some(view_state) = curr.as_mut() else { return };

        // Aggregate everyone's suspicions into our own row, and count graceful leavers.
        let mut num_left = 0;
        let (newly_suspected, rip_self) = table.with_rows_mut(|rows, my| {
            let num_rows = rows.len();
            let mut aggregated = rows[my].suspected.clone();
            for r in 0..num_rows {
                for who in 0..num_rows {
                    if rows[r].suspected[who] {
                        aggregated[who] = true;
                    }
                }
                if rows[r].rip {
                    num_left += 1;
                }
            }
            rows[my].suspected = aggregated.clone();
            (aggregated, rows[my].rip)
        });

        let mut last_suspected = self.last_suspected.lock().unwrap();
        for q in 0..view_state.view.num_members() {
            if !newly_suspected[q] || last_suspected[q] {
                continue;
            }
            last_suspected[q] = true;
            log::debug!("Marking node {} failed", view_state.view.members[q]);

            if !rip_self && self.violates_partition_rule(&view_state.view, num_left) {
                self.record_fatal_locked(FatalError::PartitionAbort);
                return;
            }

            log::debug!("Freezing row {}", q);
            table.freeze(q);
            if let Some(engine) = &view_state.engine {
                engine.wedge();
            }
            table.update_local(|row| row.wedged = true);
            view_state.view.mark_failed(q);

            if !rip_self && self.violates_partition_rule(&view_state.view, num_left) {
                self.record_fatal_locked(FatalError::PartitionAbort);
                return;
            }

            table.put(ColumnSet::SUSPECTED | ColumnSet::WEDGED);

            if view_state.view.i_am_leader() && !self.changes_contains(table, view_state.view.members[q]) {
                let overflow = table.with_rows_mut(|rows, my| {
                    let next_change_index = (rows[my].num_changes - rows[my].num_installed) as usize;
                    if next_change_index == rows[my].changes.len() {
                        return true;
                    }
                    rows[my].changes[next_change_index] = Some(view_state.view.members[q]);
                    rows[my].joiner_endpoints[next_change_index] = None;
                    rows[my].num_changes += 1;
                    false
                });
                if overflow {
                    self.record_fatal_locked(FatalError::ProtocolViolation(
                        "ran out of room in the pending changes list".to_string(),
                    ));
                    return;
                }
                log::debug!(
                    "Leader proposed a change to remove failed node {}",
                    view_state.view.members[q]
                );
                table.put(ColumnSet::PROPOSAL);
            }
        }
    }

    /// The original's partition rule, preserved: the failure count is compared against a
    /// majority of `num_members - num_left`, not of the full membership.
    fn violates_partition_rule(&self, view: &View, num_left: usize) -> bool {
        let num_failed = view.num_failed as i64;
        let num_left = num_left as i64;
        let num_members = view.num_members() as i64;
        num_failed != 0 && (num_failed - num_left >= (num_members - num_left + 1) / 2)
    }

    /// `record_fatal` without re-wedging under the curr write lock (the caller holds it).
    fn record_fatal_locked(&self, fatal: FatalError) {
        log::error!("Fatal group condition: {:?}", fatal);
        let mut slot = self.fatal.lock().unwrap();
        if slot.is_none() {
            *slot = Some(fatal);
        }
        drop(slot);
        self.view_change_cv.notify_all();
    }

    fn report_failure(&self, who: NodeId) -> Result<(), FatalError> {
        let curr = self.curr.read().unwrap();
        let Some(view_state) = curr.as_ref() else { return Ok(()) };
        let Some(rank) = view_state.view.rank_of(who) else { return Ok(()) };
        log::debug!("Node {} failure reported; marking suspected[{}]", who, rank);
        let table = &view_state.sst;
        let (failed_count, rip_count, rip_self) = table.with_rows_mut(|rows, my| {
            rows[my].suspected[rank] = true;
            let mut failed_count = 0;
            let mut rip_count = 0;
            for (r, row) in rows.iter().enumerate() {
                if row.rip {
                    rip_count += 1;
                } else if rows[my].suspected.get(r).copied().unwrap_or(false) {
                    failed_count += 1;
                }
            }
            (failed_count, rip_count, rows[my].rip)
        });
        if !rip_self
            && failed_count != 0
            && failed_count >= (view_state.view.num_members() as i64 - rip_count + 1) / 2
        {
            return Err(FatalError::PartitionAbort);
        }
        table.put(ColumnSet::SUSPECTED);
        Ok(())
    }

    /// Trigger (leader): a join connection is queued. Read the joiner's identity and propose the
    /// change.
    fn leader_start_join(self: &Arc<Self>) {
        log::debug!("GMS handling a new client connection");
        let Some(socket) = self.pending_join_sockets.lock().unwrap().pop_front() else { return };
        self.receive_join(socket);
    }

    fn receive_join(self: &Arc<Self>, mut socket: TcpStream) {
        let curr = self.curr.read().unwrap();
        let Some(view_state) = curr.as_ref() else { return };
        let table = &view_state.sst;
        let my_id = self.my_id();

        // Back-pressure: refuse to accept the join while the changes list is full, leaving the
        // connection queued until committed changes free capacity.
        let at_capacity = table.read(|rows| {
            let row = &rows[table.my_rank()];
            (row.num_changes - row.num_committed) as usize == row.changes.len()
        });
        if at_capacity {
            log::debug!("Too many pending changes; deferring the join");
            self.pending_join_sockets.lock().unwrap().push_back(socket);
            return;
        }

        let joiner_id: NodeId = match join::read_value(&mut socket) {
            Ok(id) => id,
            Err(_) => return,
        };
        if view_state.view.rank_of(joiner_id).is_some() {
            log::warn!(
                "Joining node announced id {}, which is already in the view",
                joiner_id
            );
            let _ = join::write_value(
                &mut socket,
                &JoinResponse { code: JoinResponseCode::IdInUse, leader_id: my_id },
            );
            return;
        }
        if join::write_value(
            &mut socket,
            &JoinResponse { code: JoinResponseCode::Ok, leader_id: my_id },
        )
        .is_err()
        {
            return;
        }
        let Ok(gms_port) = join::read_value::<u16>(&mut socket) else { return };
        let Ok(rpc_port) = join::read_value::<u16>(&mut socket) else { return };
        let Ok(sst_port) = join::read_value::<u16>(&mut socket) else { return };
        let Ok(bulk_port) = join::read_value::<u16>(&mut socket) else { return };
        let joiner_ip = socket
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string());

        log::debug!("Proposing change to add node {}", joiner_id);
        table.with_rows_mut(|rows, my| {
            let next_change = (rows[my].num_changes - rows[my].num_installed) as usize;
            rows[my].changes[next_change] = Some(joiner_id);
            rows[my].joiner_endpoints[next_change] = Some(Endpoints {
                ip: joiner_ip,
                gms_port,
                rpc_port,
                sst_port,
                bulk_port,
            });
            rows[my].num_changes += 1;
        });
        self.proposed_join_sockets.lock().unwrap().push_back((joiner_id, socket));

        log::debug!("Wedging view {}", view_state.view.vid);
        self.wedge_view(view_state);
        table.put(ColumnSet::PROPOSAL);
    }

    /// Trigger (non-leader): redirect a join attempt at the current leader.
    fn redirect_join_attempt(&self) {
        let Some(mut socket) = self.pending_join_sockets.lock().unwrap().pop_front() else { return };
        let curr = self.curr.read().unwrap();
        let Some(view_state) = curr.as_ref() else { return };
        let _joiner_id: NodeId = match join::read_value(&mut socket) {
            Ok(id) => id,
            Err(_) => return,
        };
        let leader_rank = view_state.view.rank_of_leader();
        let leader_endpoints = &view_state.view.member_endpoints[leader_rank];
        let _ = join::write_value(
            &mut socket,
            &JoinResponse {
                code: JoinResponseCode::LeaderRedirect,
                leader_id: self.my_id(),
            },
        );
        let _ = join::write_value(&mut socket, &leader_endpoints.ip);
        let _ = join::write_value(&mut socket, &leader_endpoints.gms_port);
    }

    /// Trigger (leader): enough acknowledgements arrived; commit up to the minimum acked count.
    fn leader_commit_change(&self, table: &StatusTable) {
        let committed = self.min_acked(table);
        table.update_local(|row| {
            row.num_committed = committed;
        });
        log::debug!("Leader committing change proposal #{}", committed);
        table.put(ColumnSet::PROPOSAL);
    }

    /// Trigger (followers): echo the leader's proposal columns and acknowledge them, then wedge.
    fn acknowledge_proposed_change(self: &Arc<Self>, table: &StatusTable) {
        let leader_rank = self.leader_rank();
        let my_rank = table.my_rank();
        table.with_rows_mut(|rows, my| {
            if my != leader_rank {
                let leader_row = rows[leader_rank].clone();
                rows[my].changes = leader_row.changes;
                rows[my].joiner_endpoints = leader_row.joiner_endpoints;
                rows[my].num_changes = leader_row.num_changes;
                rows[my].num_committed = leader_row.num_committed;
            }
            rows[my].num_acked = rows[my].num_changes;
        });
        log::debug!(
            "Detected that the leader proposed change #{}; acknowledging",
            table.read(|rows| rows[my_rank].num_changes)
        );
        table.put(ColumnSet::PROPOSAL | ColumnSet::ACKED | ColumnSet::INSTALLED);

        log::debug!("Wedging current view");
        let curr = self.curr.read().unwrap();
        if let Some(view_state) = curr.as_ref() {
            self.wedge_view(view_state);
        }
        log::debug!("Done wedging current view");
    }

    /// Halt the engine and raise the wedged flag for the current view.
    fn wedge_view(&self, view_state: &ViewState) {
        if let Some(engine) = &view_state.engine {
            engine.wedge();
        }
        view_state.sst.update_local(|row| row.wedged = true);
        view_state.sst.put(ColumnSet::WEDGED);
    }

    /* ----------  Epoch termination ---------- */

    /// Trigger (one-time): the leader committed changes this node has not installed. Wedge
    /// everything and wait for the rest of the group to do the same.
    fn start_meta_wedge(self: &Arc<Self>, table: &StatusTable) {
        let vid = self.curr.read().unwrap().as_ref().map(|vs| vs.view.vid).unwrap_or(-1);
        log::debug!("Meta-wedging view {}", vid);
        // Disable the other predicates except suspected-changed and the one registered below.
        {
            let mut handles = self.gms_handles.lock().unwrap();
            for handle in [
                handles.start_join.take(),
                handles.reject_join.take(),
                handles.change_commit_ready.take(),
                handles.leader_proposed.take(),
            ]
            .into_iter()
            .flatten()
            {
                table.predicates.remove(&handle);
            }
            // The one-time leader-committed predicate has already consumed itself.
            handles.leader_committed = None;
        }
        {
            let curr = self.curr.read().unwrap();
            if let Some(view_state) = curr.as_ref() {
                self.wedge_view(view_state);
            }
        }

        let pred_weak = Arc::downgrade(self);
        let trig_weak = Arc::downgrade(self);
        table.predicates.insert(
            move |table| {
                pred_weak
                    .upgrade()
                    .map(|shared| {
                        let curr = shared.curr.read().unwrap();
                        let Some(view_state) = curr.as_ref() else { return false };
                        table.read(|rows| {
                            rows.iter()
                                .enumerate()
                                .all(|(n, row)| view_state.view.failed[n] || row.wedged)
                        })
                    })
                    .unwrap_or(false)
            },
            move |table| {
                if let Some(shared) = trig_weak.upgrade() {
                    shared.terminate_epoch(table);
                }
            },
            PredicateMode::OneTime,
        );
    }

    /// Compute the next view and, if it is adequately provisioned, drain the small-message
    /// transport and start ragged-edge cleanup. Re-invoked (through a fresh predicate) whenever
    /// more changes commit while the proposed view is inadequate.
    fn terminate_epoch(self: &Arc<Self>, table: &StatusTable) {
        log::debug!("Meta-wedged is true; continuing epoch termination");
        let first_call = self.next.lock().unwrap().is_none();
        {
            let curr = self.curr.read().unwrap();
            let Some(view_state) = curr.as_ref() else { return };
            let next_view = match self.make_next_view(view_state, table) {
                Ok(view) => view,
                Err(fatal) => {
                    self.record_fatal(fatal);
                    return;
                }
            };
            let mut next_view = next_view;
            log::debug!("Checking provisioning of view {}", next_view.vid);
            let mut next_settings = BTreeMap::new();
            let next_num_received_size = match make_subgroup_maps(
                &self.subgroup_info,
                &self.type_order,
                Some(&view_state.view),
                &mut next_view,
                &mut next_settings,
            ) {
                Ok(size) => size,
                Err(err) => {
                    self.record_fatal(FatalError::ProtocolViolation(err.to_string()));
                    return;
                }
            };

            if !next_view.is_adequately_provisioned {
                log::debug!("Next view would not be adequately provisioned; waiting for more joins");
                drop(curr);
                if first_call {
                    // Re-register the predicates for accepting and acknowledging joins, but not
                    // the one that starts meta-wedge: the retry predicate below replaces it.
                    self.register_gms_predicates(false);
                }
                let committed_now = table.read(|rows| rows[self.leader_rank()].num_committed);
                let pred_weak = Arc::downgrade(self);
                let trig_weak = Arc::downgrade(self);
                table.predicates.insert(
                    move |table| {
                        pred_weak
                            .upgrade()
                            .map(|shared| {
                                table.read(|rows| rows[shared.leader_rank()].num_committed)
                                    > committed_now
                            })
                            .unwrap_or(false)
                    },
                    move |table| {
                        if let Some(shared) = trig_weak.upgrade() {
                            shared.terminate_epoch(table);
                        }
                    },
                    PredicateMode::OneTime,
                );
                return;
            }

            *self.next.lock().unwrap() = Some(PendingView {
                view: next_view,
                settings: next_settings,
                num_received_size: next_num_received_size,
            });

            // Drain the small-message transport: consume every complete ring slot so all members
            // agree on what was received through it.
            if let Some(engine) = &view_state.engine {
                let subgroups: Vec<SubgroupId> = view_state.settings.keys().copied().collect();
                for subgroup in &subgroups {
                    while engine.check_pending_sst_sends(*subgroup) {
                        thread::yield_now();
                    }
                    table.put_with_completion(ColumnSet::ALL);
                    table.sync_with_members(Some(&engine.get_shard_sst_indices(*subgroup)));
                    while engine.ring_receive_pending(*subgroup) {
                        engine.run_ring_receiver(*subgroup);
                    }
                }
            }
            table.put_with_completion(ColumnSet::ALL);
            table.sync_with_members(None);

            // Ragged-edge cleanup: act as leader for the shards this node leads, and note the
            // shards to follow.
            let mut follower_subgroups_and_shards: BTreeMap<SubgroupId, ShardNum> = BTreeMap::new();
            for (subgroup, settings) in &view_state.settings {
                let shard_num = settings.shard_num;
                let shard_view =
                    &view_state.view.subgroup_shard_views[*subgroup as usize][shard_num as usize];
                let num_shard_senders = shard_view.num_senders();
                if num_shard_senders == 0 {
                    continue;
                }
                let leader_rank = view_state
                    .view
                    .subview_rank_of_shard_leader(*subgroup, shard_num);
                if shard_view.my_rank == leader_rank {
                    self.leader_ragged_edge_cleanup(
                        view_state,
                        *subgroup,
                        settings.num_received_offset,
                        &settings.members,
                        num_shard_senders,
                    );
                } else {
                    follower_subgroups_and_shards.insert(*subgroup, shard_num);
                }
            }

            // Wait for the leaders of the shards we don't lead to post their trims.
            let followers = Arc::new(follower_subgroups_and_shards);
            let pred_followers = followers.clone();
            let pred_weak = Arc::downgrade(self);
            let trig_weak = Arc::downgrade(self);
            table.predicates.insert(
                move |table| {
                    pred_weak
                        .upgrade()
                        .map(|shared| {
                            let curr = shared.curr.read().unwrap();
                            let Some(view_state) = curr.as_ref() else { return false };
                            pred_followers.iter().all(|(subgroup, shard_num)| {
                                let Some(leader_rank) = view_state
                                    .view
                                    .subview_rank_of_shard_leader(*subgroup, *shard_num)
                                else {
                                    return false;
                                };
                                let leader_id = view_state.view.subgroup_shard_views
                                    [*subgroup as usize][*shard_num as usize]
                                    .members[leader_rank];
                                let Some(leader_row) = view_state.view.rank_of(leader_id) else {
                                    return false;
                                };
                                table.read(|rows| {
                                    rows[leader_row].global_min_ready[*subgroup as usize]
                                })
                            })
                        })
                        .unwrap_or(false)
                },
                move |table| {
                    if let Some(shared) = trig_weak.upgrade() {
                        shared.global_min_ready_continuation(table, &followers);
                    }
                },
                PredicateMode::OneTime,
            );
        }
    }

    /// Apply the committed joins and leaves to produce the next view.
    fn make_next_view(&self, view_state: &ViewState, table: &StatusTable) -> Result<View, FatalError> {
        let view = &view_state.view;
        let my_rank = table.my_rank();
        let leader_rank = view.rank_of_leader();
        let (committed_count, changes, joiner_endpoints) = table.read(|rows| {
            (
                rows[leader_rank].num_committed - rows[leader_rank].num_installed,
                rows[my_rank].changes.clone(),
                rows[my_rank].joiner_endpoints.clone(),
            )
        });

        let mut leave_ranks: BTreeSet<usize> = BTreeSet::new();
        let mut join_indexes: Vec<usize> = Vec::new();
        for change_index in 0..committed_count as usize {
            let Some(change_id) = changes[change_index] else { continue };
            match view.rank_of(change_id) {
                Some(rank) => {
                    leave_ranks.insert(rank);
                }
                None => join_indexes.push(change_index),
            }
        }

        let next_num_members = view.num_members() - leave_ranks.len() + join_indexes.len();
        let mut members: Vec<NodeId> = Vec::with_capacity(next_num_members);
        let mut endpoints: Vec<Endpoints> = Vec::with_capacity(next_num_members);
        let mut failed: Vec<bool> = Vec::with_capacity(next_num_members);
        let mut joined: Vec<NodeId> = Vec::new();
        let mut departed: Vec<NodeId> = Vec::new();
        let mut next_unassigned_rank = view.next_unassigned_rank;

        // Surviving members keep their relative order.
        for old_rank in 0..view.num_members() {
            if !leave_ranks.contains(&old_rank) {
                members.push(view.members[old_rank]);
                endpoints.push(view.member_endpoints[old_rank].clone());
                failed.push(view.failed[old_rank]);
            }
        }
        for leaver_rank in &leave_ranks {
            departed.push(view.members[*leaver_rank]);
            // Failures of already-assigned members shift the allocation high-water mark down.
            if (*leaver_rank as i32) <= view.next_unassigned_rank {
                next_unassigned_rank -= 1;
            }
        }
        // New members go at the end of the members list.
        for join_index in join_indexes {
            let joiner_id = changes[join_index].expect("join indexes name non-empty changes");
            let joiner_endpoints = joiner_endpoints[join_index]
                .clone()
                .ok_or_else(|| {
                    FatalError::ProtocolViolation(format!(
                        "joiner {} has no endpoints in the proposal",
                        joiner_id
                    ))
                })?;
            log::debug!("Next view will add new member with id {}", joiner_id);
            joined.push(joiner_id);
            members.push(joiner_id);
            endpoints.push(joiner_endpoints);
            failed.push(false);
        }
        log::debug!("Next view will exclude {} failed members", leave_ranks.len());

        let my_id = self.my_id();
        if !members.contains(&my_id) {
            return Err(FatalError::RemovedFromView(my_id));
        }

        let mut next_view = View::new(
            view.vid + 1,
            members,
            endpoints,
            failed,
            joined,
            departed,
            next_unassigned_rank,
        );
        next_view.localize(my_id);
        Ok(next_view)
    }

    /* ----------  Ragged-edge cleanup ---------- */

    /// Leader algorithm: inherit an already-decided trim if any member published one, otherwise
    /// compute the per-sender minimum of `num_received` over non-failed shard members.
    fn leader_ragged_edge_cleanup(
        &self,
        view_state: &ViewState,
        subgroup: SubgroupId,
        num_received_offset: usize,
        shard_members: &[NodeId],
        num_shard_senders: usize,
    ) {
        log::debug!("Running leader ragged-edge cleanup for subgroup {}", subgroup);
        let table = &view_state.sst;
        let view = &view_state.view;
        let shard_ranks: Vec<usize> = shard_members
            .iter()
            .filter_map(|m| view.rank_of(*m))
            .collect();
        table.with_rows_mut(|rows, my| {
            let decided = shard_ranks
                .iter()
                .find(|r| !view.failed[**r] && rows[**r].global_min_ready[subgroup as usize])
                .copied();
            match decided {
                Some(source) => {
                    for s in 0..num_shard_senders {
                        rows[my].global_min[num_received_offset + s] =
                            rows[source].global_min[num_received_offset + s];
                    }
                }
                None => {
                    for s in 0..num_shard_senders {
                        let min = shard_ranks
                            .iter()
                            .filter(|r| !view.failed[**r])
                            .map(|r| rows[*r].num_received[num_received_offset + s])
                            .chain(std::iter::once(rows[my].num_received[num_received_offset + s]))
                            .min()
                            .unwrap_or(-1);
                        rows[my].global_min[num_received_offset + s] = min;
                    }
                }
            }
            rows[my].global_min_ready[subgroup as usize] = true;
        });
        log::debug!("Shard leader for subgroup {} finished computing global_min", subgroup);
        let shard_sst_indices: Vec<usize> = shard_ranks.clone();
        table.put_to(&shard_sst_indices, ColumnSet::GLOBAL_MIN);

        self.deliver_in_order(view_state, table.my_rank(), subgroup, num_received_offset, num_shard_senders);
        log::debug!("Done with ragged-edge cleanup for subgroup {}", subgroup);
    }

    /// Follower algorithm: echo the leader's trim, publish it, then deliver the same cut.
    fn follower_ragged_edge_cleanup(
        &self,
        view_state: &ViewState,
        subgroup: SubgroupId,
        shard_leader_rank: usize,
        num_received_offset: usize,
        shard_members: &[NodeId],
        num_shard_senders: usize,
    ) {
        log::debug!(
            "Running follower ragged-edge cleanup for subgroup {}; echoing the leader's global_min",
            subgroup
        );
        let table = &view_state.sst;
        table.with_rows_mut(|rows, my| {
            for s in 0..num_shard_senders {
                rows[my].global_min[num_received_offset + s] =
                    rows[shard_leader_rank].global_min[num_received_offset + s];
            }
            rows[my].global_min_ready[subgroup as usize] = true;
        });
        let shard_sst_indices: Vec<usize> = shard_members
            .iter()
            .filter_map(|m| view_state.view.rank_of(*m))
            .collect();
        table.put_to(&shard_sst_indices, ColumnSet::GLOBAL_MIN);
        self.deliver_in_order(view_state, shard_leader_rank, subgroup, num_received_offset, num_shard_senders);
        log::debug!("Done with ragged-edge cleanup for subgroup {}", subgroup);
    }

    /// Deliver the dying view's final cut in the implied order, logging the trim to disk first
    /// when any persistent object exists.
    fn deliver_in_order(
        &self,
        view_state: &ViewState,
        decided_rank: usize,
        subgroup: SubgroupId,
        num_received_offset: usize,
        num_shard_senders: usize,
    ) {
        let table = &view_state.sst;
        let max_received_indices: Vec<MessageId> = table.read(|rows| {
            (0..num_shard_senders)
                .map(|s| rows[decided_rank].global_min[num_received_offset + s])
                .collect()
        });
        let shard_num = view_state.view.my_subgroups[&subgroup];
        if self.any_persistent_objects {
            let trim = RaggedTrim {
                subgroup_id: subgroup,
                shard_num,
                vid: view_state.view.vid,
                leader_id: view_state.view.members[view_state.view.rank_of_leader()].int() as i64,
                max_received_by_sender: max_received_indices.clone(),
            };
            log::debug!("Logging ragged trim to disk");
            if let Err(err) = persistence::save_ragged_trim(&self.options.storage_dir, &trim) {
                log::error!("Failed to log the ragged trim: {}", err);
            }
        }
        log::debug!(
            "Delivering ragged-edge messages in order for subgroup {}: {:?}",
            subgroup,
            max_received_indices
        );
        if let Some(engine) = &view_state.engine {
            engine.deliver_messages_upto(&max_received_indices, subgroup, num_shard_senders);
        }
    }

    /// Continuation once every followed shard leader posted its trim: finish cleanup for those
    /// shards, then wait for the persistence barrier before installing the next view.
    fn global_min_ready_continuation(
        self: &Arc<Self>,
        table: &StatusTable,
        followers: &BTreeMap<SubgroupId, ShardNum>,
    ) {
        log::debug!(
            "Global_min is ready for all {} shard leaders this node was waiting on",
            followers.len()
        );
        {
            let curr = self.curr.read().unwrap();
            let Some(view_state) = curr.as_ref() else { return };
            for (subgroup, shard_num) in followers {
                let shard_view =
                    &view_state.view.subgroup_shard_views[*subgroup as usize][*shard_num as usize];
                let num_shard_senders = shard_view.num_senders();
                let Some(leader_rank) = view_state
                    .view
                    .subview_rank_of_shard_leader(*subgroup, *shard_num)
                else {
                    continue;
                };
                let leader_id = shard_view.members[leader_rank];
                let Some(leader_row) = view_state.view.rank_of(leader_id) else { continue };
                let settings = &view_state.settings[subgroup];
                self.follower_ragged_edge_cleanup(
                    view_state,
                    *subgroup,
                    leader_row,
                    settings.num_received_offset,
                    &settings.members,
                    num_shard_senders,
                );
            }
        }

        // Persistence barrier: every non-failed shard member must persist up to the ragged trim
        // before the old view's state can be retired.
        let pred_weak = Arc::downgrade(self);
        let trig_weak = Arc::downgrade(self);
        table.predicates.insert(
            move |table| {
                pred_weak
                    .upgrade()
                    .map(|shared| shared.persistence_barrier_reached(table))
                    .unwrap_or(false)
            },
            move |table| {
                if let Some(shared) = trig_weak.upgrade() {
                    shared.finish_view_change(table);
                }
            },
            PredicateMode::OneTime,
        );
    }

    fn persistence_barrier_reached(&self, table: &StatusTable) -> bool {
        let curr = self.curr.read().unwrap();
        let Some(view_state) = curr.as_ref() else { return false };
        let view = &view_state.view;
        table.read(|rows| {
            view_state.settings.iter().all(|(subgroup, settings)| {
                if settings.mode == crate::types::basic::DeliveryMode::Unordered {
                    // Unordered subgroups never persist.
                    return true;
                }
                let last_delivered = rows[table.my_rank()].delivered_num[*subgroup as usize];
                settings.members.iter().all(|member| {
                    let Some(member_rank) = view.rank_of(*member) else { return true };
                    if view.failed[member_rank] {
                        return true;
                    }
                    let persisted = rows[member_rank].persisted_num[*subgroup as usize];
                    let persisted_seq = if !persisted.is_valid() {
                        -1
                    } else {
                        let (vid, seq) = persisted.unpack();
                        match vid.cmp(&view.vid) {
                            std::cmp::Ordering::Less => -1,
                            std::cmp::Ordering::Equal => seq,
                            std::cmp::Ordering::Greater => MessageId::MAX,
                        }
                    };
                    persisted_seq >= last_delivered
                })
            })
        })
    }

    /* ----------  Install ---------- */

    fn finish_view_change(self: &Arc<Self>, table: &StatusTable) {
        let mut curr_guard = self.curr.write().unwrap();
        let Some(mut view_state) = curr_guard.take() else { return };
        let Some(pending) = self.next.lock().unwrap().take() else {
            *curr_guard = Some(view_state);
            return;
        };

        // Deregister whatever steady-state predicates remain on the old table.
        {
            let mut handles = self.gms_handles.lock().unwrap();
            for handle in [
                handles.suspected_changed.take(),
                handles.start_join.take(),
                handles.reject_join.take(),
                handles.change_commit_ready.take(),
                handles.leader_proposed.take(),
                handles.leader_committed.take(),
            ]
            .into_iter()
            .flatten()
            {
                table.predicates.remove(&handle);
            }
        }

        let next_view = pending.view;
        let next_settings = pending.settings;
        let i_am_leader = view_state.view.i_am_leader();

        // Commit the joins over TCP before table setup, so joiners can build their tables too.
        let mut joiner_sockets: Vec<(NodeId, TcpStream)> = Vec::new();
        if i_am_leader && !next_view.joined.is_empty() {
            let mut proposed = self.proposed_join_sockets.lock().unwrap();
            for _ in 0..next_view.joined.len() {
                let Some((joiner_id, mut socket)) = proposed.pop_front() else { break };
                log::debug!("Sending node {} the new view", joiner_id);
                let committed = join::write_frame(&mut socket, &next_view)
                    .and_then(|_| join::write_frame(&mut socket, &self.params))
                    .and_then(|_| join::write_value(&mut socket, &true));
                if committed.is_ok() {
                    joiner_sockets.push((joiner_id, socket));
                }
            }
        }

        log::debug!("Starting creation of the new table and engine for view {}", next_view.vid);
        for departed in &next_view.departed {
            log::debug!("Removing transport connections for departed node {}", departed);
            self.bulk_transport.remove_node(*departed);
        }
        for (i, joined) in next_view.joined.iter().enumerate() {
            let joiner_rank = next_view.num_members() - next_view.joined.len() + i;
            let endpoints = &next_view.member_endpoints[joiner_rank];
            log::debug!("Adding transport connection to node {} at {}", joined, endpoints);
            self.bulk_transport
                .add_node(*joined, endpoints.ip.clone(), endpoints.bulk_port);
        }

        let next_sst = self.make_status_table(&next_view, pending.num_received_size);
        let changes_installed = (next_view.joined.len() + next_view.departed.len()) as i32;
        next_sst.init_local_row_from_previous(&view_state.sst, changes_installed);
        next_sst.update_local(|row| row.vid = next_view.vid);

        let old_engine = view_state.engine.take().expect("the old view still owns its engine");
        let next_engine = MulticastEngine::from_old(
            old_engine,
            next_view.members.clone(),
            self.my_id(),
            next_sst.clone(),
            next_view.subgroup_shard_views.len(),
            next_settings.clone(),
            self.persistent_subgroups_of(&next_view),
            &self.params,
            self.make_post_next_version(),
            self.make_frontier_stale_callback(),
            self.bulk_transport.clone(),
            &next_view.failed,
        );

        // Determine the old shard leaders, re-indexed by the new view's subgroup ids, and tell
        // each joiner who to pull object state from.
        let old_shard_leaders = self.old_shard_leaders_by_new_ids(&view_state.view, &next_view);
        for (joiner_id, mut socket) in joiner_sockets {
            log::debug!("Sending node {} the old shard leaders", joiner_id);
            let _ = join::write_frame(&mut socket, &old_shard_leaders);
        }

        next_sst.put(ColumnSet::ALL);
        next_sst.sync_with_members(None);
        log::debug!("Done setting up the table and engine for view {}", next_view.vid);

        // Retire the old view asynchronously; its evaluator stops on its own.
        view_state.sst.retire();
        {
            let mut old_views = self.old_views.lock().unwrap();
            old_views.push_back(RetiredView {
                view: view_state.view.clone(),
                sst: view_state.sst.clone(),
            });
            self.old_views_cv.notify_all();
        }

        let installed_view = next_view.clone();
        *curr_guard = Some(ViewState {
            view: next_view,
            sst: next_sst.clone(),
            engine: Some(next_engine),
            settings: next_settings,
        });
        drop(curr_guard);

        if self.any_persistent_objects {
            if let Err(err) = persistence::save_view(&self.options.storage_dir, &installed_view) {
                log::error!("Failed to save the new view: {}", err);
            }
        }

        *self.last_suspected.lock().unwrap() = vec![false; installed_view.num_members()];
        self.register_gms_predicates(true);

        // Announce the new view to the application.
        for upcall in self.view_upcalls.lock().unwrap().iter() {
            upcall(&installed_view);
        }

        // Shard leaders push replicated-object state to the members that just joined their
        // shards, and this node re-keys (or receives) its own objects.
        if let Err(err) = self.send_objects_to_new_members(&installed_view, &old_shard_leaders) {
            log::error!("Failed to send object state to new members: {}", err);
        }

        log::debug!("Initializing local replicated objects");
        next_sst.start_predicate_evaluation();

        {
            let mut epoch = self.view_change_epoch.lock().unwrap();
            *epoch += 1;
        }
        self.view_change_cv.notify_all();
    }

    /// For every (type, shard) pair, the new view inherits the lowest-ranked non-failed member
    /// of the old shard as its state source. Stateless (raw) subgroup types have none.
    fn old_shard_leaders_by_new_ids(&self, curr_view: &View, next_view: &View) -> Vec<Vec<i64>> {
        let mut old_shard_leaders = vec![Vec::new(); next_view.subgroup_shard_views.len()];
        for (type_id, old_ids) in curr_view.subgroup_ids_by_type_id.iter().enumerate() {
            for (subgroup_index, old_subgroup_id) in old_ids.iter().enumerate() {
                let Some(new_subgroup_id) = next_view
                    .subgroup_ids_by_type_id
                    .get(type_id)
                    .and_then(|ids| ids.get(subgroup_index))
                else {
                    continue;
                };
                let new_num_shards =
                    next_view.subgroup_shard_views[*new_subgroup_id as usize].len();
                let mut leaders = vec![-1i64; new_num_shards];
                if self.type_order[type_id].stateful {
                    for (shard_num, leader) in leaders.iter_mut().enumerate() {
                        if let Some(leader_rank) = curr_view
                            .subgroup_shard_views
                            .get(*old_subgroup_id as usize)
                            .and_then(|shards| shards.get(shard_num))
                            .and_then(|_| {
                                curr_view.subview_rank_of_shard_leader(
                                    *old_subgroup_id,
                                    shard_num as ShardNum,
                                )
                            })
                        {
                            *leader = curr_view.subgroup_shard_views[*old_subgroup_id as usize]
                                [shard_num]
                                .members[leader_rank]
                                .int() as i64;
                        }
                    }
                }
                old_shard_leaders[*new_subgroup_id as usize] = leaders;
            }
        }
        old_shard_leaders
    }

    /* ----------  Replicated-object state transfer ---------- */

    /// If this node was the old leader of a shard, push object state to the shard's new
    /// members.
    fn send_objects_to_new_members(
        &self,
        view: &View,
        old_shard_leaders: &[Vec<i64>],
    ) -> Result<(), GroupError> {
        let my_id = self.my_id();
        for (subgroup_id, shards) in old_shard_leaders.iter().enumerate() {
            for (shard_num, leader) in shards.iter().enumerate() {
                if *leader != my_id.int() as i64 {
                    continue;
                }
                let shard_view = &view.subgroup_shard_views[subgroup_id][shard_num];
                for joiner in &shard_view.joined {
                    if *joiner != my_id {
                        self.send_subgroup_object(view, subgroup_id as SubgroupId, *joiner)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// A restart shard leader pushes object state to every other member of its shards.
    fn send_objects_as_shard_leader(&self, shard_leaders: &[Vec<i64>]) -> Result<(), GroupError> {
        let my_id = self.my_id();
        let curr = self.curr.read().unwrap();
        let Some(view_state) = curr.as_ref() else { return Ok(()) };
        if shard_leaders.is_empty() {
            return Ok(());
        }
        for (subgroup_id, shards) in shard_leaders.iter().enumerate() {
            for (shard_num, leader) in shards.iter().enumerate() {
                if *leader != my_id.int() as i64 {
                    continue;
                }
                log::debug!(
                    "This node is the restart shard leader for subgroup {} shard {}; sending object data",
                    subgroup_id,
                    shard_num
                );
                let members = view_state.view.subgroup_shard_views[subgroup_id][shard_num]
                    .members
                    .clone();
                for member in members {
                    if member != my_id {
                        self.send_subgroup_object(&view_state.view, subgroup_id as SubgroupId, member)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Push one subgroup's object over TCP. The receiver first sends its log tail length so the
    /// serializer can skip versions the receiver already has.
    fn send_subgroup_object(
        &self,
        view: &View,
        subgroup: SubgroupId,
        target: NodeId,
    ) -> Result<(), GroupError> {
        let target_rank = view.rank_of(target).ok_or_else(|| {
            GroupError::InvariantViolation(format!("node {} is not in the view", target))
        })?;
        let endpoints = &view.member_endpoints[target_rank];
        let mut socket = TcpStream::connect((endpoints.ip.as_str(), endpoints.rpc_port))?;
        join::write_value(&mut socket, &subgroup)?;
        let mut objects = self.objects.lock().unwrap();
        let Some(object) = objects.get_mut(&subgroup) else { return Ok(()) };
        if object.is_persistent() {
            let log_tail: Version = join::read_value(&mut socket)?;
            log::debug!("Got log tail version {} from node {}", log_tail, target);
            object.set_earliest_version_to_serialize(log_tail);
        }
        log::debug!("Sending replicated object state for subgroup {} to node {}", subgroup, target);
        object.send_object(&mut socket)?;
        Ok(())
    }

    /// Create this node's replicated objects for the given view, returning the subgroups whose
    /// state must be pulled from a shard leader.
    fn create_subgroup_objects(&self, view: &View, shard_leaders: &[Vec<i64>]) -> BTreeSet<SubgroupId> {
        let my_id = self.my_id();
        let mut expected_transfers: BTreeSet<SubgroupId> = BTreeSet::new();
        let mut objects = self.objects.lock().unwrap();
        for (subgroup, shard_num) in &view.my_subgroups {
            let Some(type_id) = self.type_of_subgroup(view, *subgroup) else { continue };
            if !self.type_order[type_id as usize].stateful {
                continue;
            }
            if !objects.contains_key(subgroup) {
                if let Some(factory) = self.factories.get(&type_id) {
                    objects.insert(*subgroup, factory(*subgroup));
                } else {
                    continue;
                }
            }
            let leader = shard_leaders
                .get(*subgroup as usize)
                .and_then(|shards| shards.get(*shard_num as usize))
                .copied()
                .unwrap_or(-1);
            if leader >= 0 && leader != my_id.int() as i64 {
                expected_transfers.insert(*subgroup);
            }
        }
        expected_transfers
    }

    /// Receive state for each expected shard, dispatching by the subgroup id the sender writes
    /// first.
    fn receive_subgroup_objects(
        &self,
        mut expected_transfers: BTreeSet<SubgroupId>,
        transfer_listener: &TcpListener,
    ) -> Result<(), GroupError> {
        while !expected_transfers.is_empty() {
            let (mut socket, _) = transfer_listener.accept()?;
            let subgroup: SubgroupId = match join::read_value(&mut socket) {
                Ok(sg) => sg,
                Err(_) => continue,
            };
            if !expected_transfers.remove(&subgroup) {
                continue;
            }
            let mut objects = self.objects.lock().unwrap();
            let Some(object) = objects.get_mut(&subgroup) else { continue };
            if object.is_persistent() {
                let log_tail = object.minimum_latest_persisted_version();
                join::write_value(&mut socket, &log_tail)?;
            }
            log::debug!("Receiving replicated object state for subgroup {}", subgroup);
            object.receive_object(&mut socket)?;
        }
        Ok(())
    }
}

