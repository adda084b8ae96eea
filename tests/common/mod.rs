//! Shared test infrastructure: an in-memory row-replication hub and bulk-multicast hub standing
//! in for the RDMA transports, a replicated test object, and node-assembly helpers.
//!
//! The hubs emulate the shared-memory nature of the real transports: every update is retained,
//! and a table or group that attaches late is first brought up to date with everything its peers
//! already published.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use groupcast::config::{GroupParams, NodeOptions};
use groupcast::error::GroupError;
use groupcast::multicast::transport::{BulkTransport, ReceiveCallback};
use groupcast::persistence::{FactoryMap, ObjectFactory, ReplicatedObject};
use groupcast::sst::{RowSink, RowTransport};
use groupcast::types::basic::{
    DeliveryMode, MessageId, NodeId, SendAlgorithm, SubgroupId, SubgroupTypeId, Version, ViewId,
};
use groupcast::types::callbacks::{CallbackSet, PersistenceManagerCallbacks};
use groupcast::view::subgroup_info::{SubgroupInfo, SubgroupType};
use groupcast::view::SubView;
use groupcast::view_manager::{ViewManager, ViewManagerBuilder, ViewUpcall};

static LOGGER_INIT: Once = Once::new();

/// Set up a logger that prints all messages at `level` and above.
pub fn setup_logger(level: log::LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    message
                ))
            })
            .level(level)
            .chain(std::io::stdout())
            .apply()
            .unwrap();
    })
}

/* ----------  Row replication hub ---------- */

struct RowHubInner {
    /// Sinks keyed by (node, table epoch).
    sinks: BTreeMap<(NodeId, ViewId), Arc<RowSink>>,
    /// Every update ever published, per (publisher, epoch), replayed to late attachers.
    history: BTreeMap<(NodeId, ViewId), Vec<Vec<u8>>>,
    /// Nodes whose traffic is discarded (killed by the test).
    dead: BTreeSet<NodeId>,
    /// Partition groups: nodes in different groups cannot reach each other.
    partition: BTreeMap<NodeId, u32>,
}

impl RowHubInner {
    fn reachable(&self, a: NodeId, b: NodeId) -> bool {
        if self.dead.contains(&a) || self.dead.contains(&b) {
            return false;
        }
        match (self.partition.get(&a), self.partition.get(&b)) {
            (Some(ga), Some(gb)) => ga == gb,
            _ => true,
        }
    }
}

/// The in-memory [`RowTransport`]: delivers row updates synchronously under one hub lock, which
/// both preserves FIFO per publisher and totally orders updates with attach-time replay.
pub struct MemRowHub {
    inner: Mutex<RowHubInner>,
}

impl MemRowHub {
    pub fn new() -> Arc<MemRowHub> {
        Arc::new(MemRowHub {
            inner: Mutex::new(RowHubInner {
                sinks: BTreeMap::new(),
                history: BTreeMap::new(),
                dead: BTreeSet::new(),
                partition: BTreeMap::new(),
            }),
        })
    }

    /// Simulate a node crash: its traffic stops and every other node suspects it.
    pub fn kill(&self, node: NodeId) {
        let sinks: Vec<Arc<RowSink>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.dead.insert(node);
            inner
                .sinks
                .iter()
                .filter(|((n, _), _)| *n != node)
                .map(|(_, sink)| sink.clone())
                .collect()
        };
        for sink in sinks {
            (sink.on_suspect)(node);
        }
    }

    /// Split the membership into reachability groups and have both sides suspect the other.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut suspicions: Vec<(Arc<RowSink>, NodeId)> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.partition.clear();
            for (group_index, group) in groups.iter().enumerate() {
                for node in *group {
                    inner.partition.insert(*node, group_index as u32);
                }
            }
            for ((node, _), sink) in inner.sinks.iter() {
                for (group_index, group) in groups.iter().enumerate() {
                    if inner.partition.get(node) != Some(&(group_index as u32)) {
                        for other in *group {
                            suspicions.push((sink.clone(), *other));
                        }
                    }
                }
            }
        }
        for (sink, suspect) in suspicions {
            (sink.on_suspect)(suspect);
        }
    }
}

impl RowTransport for MemRowHub {
    fn attach(&self, local: NodeId, epoch: ViewId, sink: RowSink) {
        let mut inner = self.inner.lock().unwrap();
        let sink = Arc::new(sink);
        // Bring the late attacher up to date with everything already published in this epoch.
        let replays: Vec<(NodeId, Vec<Vec<u8>>)> = inner
            .history
            .iter()
            .filter(|((publisher, e), _)| *e == epoch && *publisher != local)
            .map(|((publisher, _), updates)| (*publisher, updates.clone()))
            .collect();
        for (publisher, updates) in replays {
            if inner.reachable(publisher, local) {
                for update in updates {
                    (sink.on_update)(publisher, &update);
                }
            }
        }
        inner.sinks.insert((local, epoch), sink);
    }

    fn detach(&self, local: NodeId, epoch: ViewId) {
        self.inner.lock().unwrap().sinks.remove(&(local, epoch));
    }

    fn publish(&self, from: NodeId, epoch: ViewId, targets: Option<&[NodeId]>, bytes: &[u8], _blocking: bool) {
        let inner = &mut *self.inner.lock().unwrap();
        if inner.dead.contains(&from) {
            return;
        }
        inner
            .history
            .entry((from, epoch))
            .or_default()
            .push(bytes.to_vec());
        for ((node, e), sink) in inner.sinks.iter() {
            if *e != epoch || *node == from {
                continue;
            }
            if let Some(targets) = targets {
                if !targets.contains(node) {
                    continue;
                }
            }
            if inner.reachable(from, *node) {
                (sink.on_update)(from, bytes);
            }
        }
    }

    fn sync_with_members(&self, _from: NodeId, _epoch: ViewId, _members: Option<&[NodeId]>) {
        // Delivery is synchronous; the barrier holds trivially.
    }
}

/* ----------  Bulk multicast hub ---------- */

enum BulkOp {
    Register {
        registrant: NodeId,
        epoch: ViewId,
        root: NodeId,
        group_num: u16,
        callback: Mutex<ReceiveCallback>,
    },
    Send {
        epoch: ViewId,
        root: NodeId,
        group_num: u16,
        bytes: Vec<u8>,
    },
    Destroy {
        registrant: NodeId,
        epoch: ViewId,
        group_num: u16,
    },
}

struct BulkGroupEntry {
    registrant: NodeId,
    epoch: ViewId,
    root: NodeId,
    group_num: u16,
    callback: Mutex<ReceiveCallback>,
}

struct BulkHubState {
    entries: Vec<BulkGroupEntry>,
    /// Messages already sent per (epoch, root, group), replayed to members that register late.
    history: BTreeMap<(ViewId, NodeId, u16), Vec<Vec<u8>>>,
    dead: BTreeSet<NodeId>,
    partition: BTreeMap<NodeId, u32>,
}

impl BulkHubState {
    fn reachable(&self, a: NodeId, b: NodeId) -> bool {
        if self.dead.contains(&a) || self.dead.contains(&b) {
            return false;
        }
        match (self.partition.get(&a), self.partition.get(&b)) {
            (Some(ga), Some(gb)) => ga == gb,
            _ => true,
        }
    }
}

/// The in-memory bulk transport hub. A single dispatcher thread delivers completed messages in
/// send order to every registered group member (the sender included), which is exactly the
/// completion discipline the engine expects.
pub struct MemBulkHub {
    sender: Mutex<Sender<BulkOp>>,
    state: Arc<Mutex<BulkHubState>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl MemBulkHub {
    pub fn new() -> Arc<MemBulkHub> {
        let (tx, rx) = mpsc::channel::<BulkOp>();
        let state = Arc::new(Mutex::new(BulkHubState {
            entries: Vec::new(),
            history: BTreeMap::new(),
            dead: BTreeSet::new(),
            partition: BTreeMap::new(),
        }));
        let dispatcher_state = state.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let dispatcher_shutdown = shutdown.clone();
        let dispatcher = thread::Builder::new()
            .name("mem_bulk_dispatcher".to_string())
            .spawn(move || {
                while let Ok(op) = rx.recv() {
                    if dispatcher_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let mut state = dispatcher_state.lock().unwrap();
                    match op {
                        BulkOp::Register { registrant, epoch, root, group_num, callback } => {
                            if state.reachable(root, registrant) {
                                if let Some(history) = state.history.get(&(epoch, root, group_num)) {
                                    let replay = history.clone();
                                    let mut cb = callback.lock().unwrap();
                                    for bytes in &replay {
                                        (cb)(bytes);
                                    }
                                }
                            }
                            state.entries.push(BulkGroupEntry {
                                registrant,
                                epoch,
                                root,
                                group_num,
                                callback,
                            });
                        }
                        BulkOp::Send { epoch, root, group_num, bytes } => {
                            if state.dead.contains(&root) {
                                continue;
                            }
                            state
                                .history
                                .entry((epoch, root, group_num))
                                .or_default()
                                .push(bytes.clone());
                            let targets: Vec<usize> = state
                                .entries
                                .iter()
                                .enumerate()
                                .filter(|(_, e)| {
                                    e.epoch == epoch && e.root == root && e.group_num == group_num
                                })
                                .map(|(i, _)| i)
                                .collect();
                            for i in targets {
                                let registrant = state.entries[i].registrant;
                                if state.reachable(root, registrant) {
                                    let mut cb = state.entries[i].callback.lock().unwrap();
                                    (cb)(&bytes);
                                }
                            }
                        }
                        BulkOp::Destroy { registrant, epoch, group_num } => {
                            state.entries.retain(|e| {
                                !(e.registrant == registrant
                                    && e.epoch == epoch
                                    && e.group_num == group_num)
                            });
                        }
                    }
                }
            })
            .expect("failed to spawn the bulk dispatcher");
        Arc::new(MemBulkHub {
            sender: Mutex::new(tx),
            state,
            dispatcher: Mutex::new(Some(dispatcher)),
            shutdown,
        })
    }

    pub fn kill(&self, node: NodeId) {
        let mut state = self.state.lock().unwrap();
        state.dead.insert(node);
        state.entries.retain(|e| e.registrant != node);
    }

    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut state = self.state.lock().unwrap();
        state.partition.clear();
        for (group_index, group) in groups.iter().enumerate() {
            for node in *group {
                state.partition.insert(*node, group_index as u32);
            }
        }
    }

    /// The per-node transport facade handed to a [`ViewManagerBuilder`].
    pub fn for_node(self: &Arc<Self>, node: NodeId) -> Arc<MemBulkTransport> {
        Arc::new(MemBulkTransport {
            hub: self.clone(),
            local: node,
        })
    }
}

impl Drop for MemBulkHub {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Unblock the dispatcher with a no-op.
        let _ = self.sender.lock().unwrap().send(BulkOp::Destroy {
            registrant: NodeId::new(u32::MAX),
            epoch: -1,
            group_num: u16::MAX,
        });
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

pub struct MemBulkTransport {
    hub: Arc<MemBulkHub>,
    local: NodeId,
}

impl BulkTransport for MemBulkTransport {
    fn create_group(
        &self,
        epoch: ViewId,
        group_num: u16,
        members: &[NodeId],
        _block_size: u64,
        _algorithm: SendAlgorithm,
        on_receive: ReceiveCallback,
    ) -> bool {
        let root = members[0];
        self.hub
            .sender
            .lock()
            .unwrap()
            .send(BulkOp::Register {
                registrant: self.local,
                epoch,
                root,
                group_num,
                callback: Mutex::new(on_receive),
            })
            .is_ok()
    }

    fn destroy_group(&self, epoch: ViewId, group_num: u16) {
        let _ = self.hub.sender.lock().unwrap().send(BulkOp::Destroy {
            registrant: self.local,
            epoch,
            group_num,
        });
    }

    fn send(&self, epoch: ViewId, group_num: u16, data: &[u8]) -> bool {
        self.hub
            .sender
            .lock()
            .unwrap()
            .send(BulkOp::Send {
                epoch,
                root: self.local,
                group_num,
                bytes: data.to_vec(),
            })
            .is_ok()
    }

    fn add_node(&self, _node: NodeId, _ip: String, _bulk_port: u16) {}

    fn remove_node(&self, _node: NodeId) {}
}

/* ----------  Replicated test object ---------- */

/// A replicated object that logs every staged version, with state observable from the test.
#[derive(Default)]
pub struct TestObjectState {
    pub versions: Vec<Version>,
    pub next_version: Option<Version>,
    pub truncated_to: Option<Version>,
}

pub struct TestObject {
    pub state: Arc<Mutex<TestObjectState>>,
    pub persistent: bool,
}

impl ReplicatedObject for TestObject {
    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn truncate(&mut self, latest: Version) {
        let mut state = self.state.lock().unwrap();
        state.versions.retain(|v| *v <= latest);
        state.truncated_to = Some(latest);
    }

    fn minimum_latest_persisted_version(&self) -> Version {
        self.state
            .lock()
            .unwrap()
            .versions
            .last()
            .copied()
            .unwrap_or(Version::INVALID)
    }

    fn post_next_version(&mut self, version: Version) {
        self.state.lock().unwrap().next_version = Some(version);
    }

    fn set_earliest_version_to_serialize(&mut self, _earliest: Version) {}

    fn send_object(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        let versions: Vec<i64> = self
            .state
            .lock()
            .unwrap()
            .versions
            .iter()
            .map(|v| v.int())
            .collect();
        let bytes = borsh::to_vec(&versions)?;
        stream.write_all(&(bytes.len() as u64).to_le_bytes())?;
        stream.write_all(&bytes)
    }

    fn receive_object(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut len_bytes = [0u8; 8];
        stream.read_exact(&mut len_bytes)?;
        let mut bytes = vec![0u8; u64::from_le_bytes(len_bytes) as usize];
        stream.read_exact(&mut bytes)?;
        let versions: Vec<i64> = borsh::from_slice(&bytes)?;
        self.state.lock().unwrap().versions = versions.into_iter().map(Version::new).collect();
        Ok(())
    }
}

/* ----------  Node assembly ---------- */

/// One delivered message as observed through the stability callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub subgroup: SubgroupId,
    pub sender: NodeId,
    pub index: MessageId,
    pub payload: Option<Vec<u8>>,
    pub version: Version,
}

#[derive(Default)]
pub struct NodeObservations {
    pub delivered: Mutex<Vec<Delivered>>,
    pub rpc_calls: Mutex<Vec<(SubgroupId, NodeId, Vec<u8>)>>,
    pub persisted: Mutex<Vec<(SubgroupId, Version)>>,
}

impl NodeObservations {
    pub fn delivered_len(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn delivered_clone(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub manager: Arc<ViewManager>,
    pub observations: Arc<NodeObservations>,
    pub object_state: Arc<Mutex<TestObjectState>>,
    pub storage_dir: PathBuf,
}

pub struct NodeSpec {
    pub id: u32,
    pub base_port: u16,
    pub leader_port: u16,
    pub params: GroupParams,
    pub type_order: Vec<SubgroupType>,
    pub subgroup_info: SubgroupInfo,
    pub persistent_object: bool,
    /// Versions the node's replicated object holds before startup, standing in for the state it
    /// recovered from its own log.
    pub initial_object_versions: Vec<Version>,
    pub storage_dir: PathBuf,
    pub row_hub: Arc<MemRowHub>,
    pub bulk_hub: Arc<MemBulkHub>,
}

/// A membership function that puts every member of the view into one shard of one subgroup, and
/// signals inadequacy below `min_members`.
pub fn one_shard_for_all(mode: DeliveryMode, min_members: usize) -> SubgroupInfo {
    SubgroupInfo::new(move |_type_id: SubgroupTypeId, _prev, curr| {
        if curr.num_members() < min_members {
            return Err(GroupError::InadequatelyProvisioned);
        }
        Ok(vec![vec![SubView::new(mode, curr.members.clone())]])
    })
}

pub fn small_params() -> GroupParams {
    GroupParams {
        max_payload_size: 2048,
        max_smc_payload_size: 128,
        block_size: 256,
        window_size: 3,
        // Generous relative to in-memory delivery latency, so the frontier failure check only
        // fires on stalls a test provokes deliberately.
        timeout_ms: 2000,
        send_algorithm: SendAlgorithm::BinomialSend,
    }
}

/// Build and start one node. Blocks until the node's first view has installed, so the leader
/// must be spawned on its own thread before the followers are built.
pub fn start_node(spec: NodeSpec) -> Result<TestNode, GroupError> {
    let id = NodeId::new(spec.id);
    let options = NodeOptions {
        local_id: id,
        local_ip: "127.0.0.1".to_string(),
        leader_ip: "127.0.0.1".to_string(),
        leader_gms_port: spec.leader_port,
        gms_port: spec.base_port,
        rpc_port: spec.base_port + 1,
        sst_port: spec.base_port + 2,
        bulk_port: spec.base_port + 3,
        storage_dir: spec.storage_dir.clone(),
    };

    let observations = Arc::new(NodeObservations::default());
    let object_state = Arc::new(Mutex::new(TestObjectState {
        versions: spec.initial_object_versions.clone(),
        next_version: None,
        truncated_to: None,
    }));

    let stability_observations = observations.clone();
    let persistence_observations = observations.clone();
    let callbacks = CallbackSet {
        global_stability_callback: Some(Box::new(
            move |subgroup, sender, index, payload: Option<&[u8]>, version| {
                stability_observations.delivered.lock().unwrap().push(Delivered {
                    subgroup,
                    sender,
                    index,
                    payload: payload.map(|p| p.to_vec()),
                    version,
                });
            },
        )),
        local_persistence_callback: None,
        global_persistence_callback: Some(Box::new(move |subgroup, version| {
            persistence_observations.persisted.lock().unwrap().push((subgroup, version));
        })),
    };

    // The test "persistence manager" stages versions straight into the test object and reports
    // them persisted immediately through the manager handle bound after construction. The slot
    // holds a weak handle so the callbacks don't keep the manager alive.
    let manager_slot: Arc<Mutex<Option<std::sync::Weak<ViewManager>>>> = Arc::new(Mutex::new(None));
    let version_log = object_state.clone();
    let post_persist_slot = manager_slot.clone();
    let persistence_callbacks = PersistenceManagerCallbacks {
        make_version: Box::new(move |_subgroup, version, _hlc| {
            version_log.lock().unwrap().versions.push(version);
        }),
        post_persist: Box::new(move |subgroup, version| {
            let manager = post_persist_slot.lock().unwrap().as_ref().and_then(|w| w.upgrade());
            if let Some(manager) = manager {
                manager.report_persisted(subgroup, version);
            }
        }),
    };

    let mut factories: FactoryMap = BTreeMap::new();
    let factory_state = object_state.clone();
    let persistent = spec.persistent_object;
    let factory: ObjectFactory = Box::new(move |_subgroup| {
        Box::new(TestObject {
            state: factory_state.clone(),
            persistent,
        })
    });
    factories.insert(0, factory);

    let view_upcalls: Vec<ViewUpcall> = vec![Box::new(|view: &groupcast::view::View| {
        log::info!("View upcall: {}", view.debug_string());
    })];

    let manager = Arc::new(
        ViewManagerBuilder {
            options,
            params: spec.params,
            type_order: spec.type_order,
            subgroup_info: spec.subgroup_info,
            factories,
            any_persistent_objects: spec.persistent_object,
            callbacks,
            persistence_callbacks,
            row_transport: spec.row_hub.clone(),
            bulk_transport: spec.bulk_hub.for_node(id),
            view_upcalls,
        }
        .build()?,
    );
    *manager_slot.lock().unwrap() = Some(Arc::downgrade(&manager));
    manager.start()?;

    Ok(TestNode {
        id,
        manager,
        observations,
        object_state,
        storage_dir: spec.storage_dir,
    })
}

/// Poll `condition` until it holds or the deadline passes.
pub fn wait_until(timeout: Duration, what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for: {}", what);
}

/// Run a closure on its own thread and hand back the join handle; used to start leaders and
/// followers concurrently.
pub fn spawn_named<T: Send + 'static>(
    name: &str,
    f: impl FnOnce() -> T + Send + 'static,
) -> JoinHandle<T> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("failed to spawn test thread")
}

/// Queue of per-test unique port bases, so parallel tests never collide.
pub fn unique_ports(file_base: u16, count: usize) -> VecDeque<u16> {
    use std::sync::atomic::AtomicU16;
    static NEXT_BLOCK: AtomicU16 = AtomicU16::new(0);
    let block = NEXT_BLOCK.fetch_add(1, Ordering::Relaxed);
    (0..count as u16)
        .map(|i| file_base + block * 64 + i * 8)
        .collect()
}
