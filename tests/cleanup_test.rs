//! View changes under churn: a failure mid-view must leave every survivor with the identical
//! delivered prefix fixed by ragged-edge cleanup, a node joining during traffic must deliver
//! only messages of the view it joined in, and a partitioned minority must abort.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use groupcast::error::GroupError;
use groupcast::types::basic::{DeliveryMode, NodeId};
use groupcast::view::subgroup_info::{SubgroupInfo, SubgroupType};
use groupcast::view::SubView;
use groupcast::view_manager::FatalError;
use log::LevelFilter;

/// One ordered shard over all members, with a minimum the test can lower before provoking a
/// view change.
fn adjustable_shard_info(min_members: Arc<AtomicUsize>) -> SubgroupInfo {
    SubgroupInfo::new(move |_type_id, _prev, curr| {
        if curr.num_members() < min_members.load(Ordering::SeqCst) {
            return Err(GroupError::InadequatelyProvisioned);
        }
        Ok(vec![vec![SubView::new(DeliveryMode::Ordered, curr.members.clone())]])
    })
}

fn spec(
    id: u32,
    base_port: u16,
    leader_port: u16,
    min_members: Arc<AtomicUsize>,
    row_hub: &Arc<MemRowHub>,
    bulk_hub: &Arc<MemBulkHub>,
    dir: &tempfile::TempDir,
) -> NodeSpec {
    NodeSpec {
        id,
        base_port,
        leader_port,
        params: small_params(),
        type_order: vec![SubgroupType::raw("events")],
        subgroup_info: adjustable_shard_info(min_members),
        persistent_object: false,
        initial_object_versions: Vec::new(),
        storage_dir: dir.path().to_path_buf(),
        row_hub: row_hub.clone(),
        bulk_hub: bulk_hub.clone(),
    }
}

#[test]
fn failure_mid_view_trims_to_an_identical_cut() {
    setup_logger(LevelFilter::Info);
    let row_hub = MemRowHub::new();
    let bulk_hub = MemBulkHub::new();
    let dirs: Vec<tempfile::TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let mut ports = unique_ports(28000, 3);
    let leader_port = ports[0];
    let min_members = Arc::new(AtomicUsize::new(3));

    let leader_spec = spec(0, ports.pop_front().unwrap(), leader_port, min_members.clone(), &row_hub, &bulk_hub, &dirs[0]);
    let leader_thread = spawn_named("leader", move || start_node(leader_spec).unwrap());
    std::thread::sleep(Duration::from_millis(200));
    let follower_threads: Vec<_> = (1..3)
        .map(|id| {
            let s = spec(id, ports.pop_front().unwrap(), leader_port, min_members.clone(), &row_hub, &bulk_hub, &dirs[id as usize]);
            spawn_named("follower", move || start_node(s).unwrap())
        })
        .collect();
    let leader = leader_thread.join().unwrap();
    let mut followers: Vec<TestNode> = follower_threads.into_iter().map(|t| t.join().unwrap()).collect();

    // The next view only needs two members.
    min_members.store(2, Ordering::SeqCst);

    // One sender streams messages while a non-leader receiver dies mid-stream.
    let total_messages = 100u32;
    let sender_manager = leader.manager.clone();
    let sender_thread = spawn_named("stream", move || {
        for i in 0..total_messages {
            sender_manager
                .send(0, 4, |buf| buf.copy_from_slice(&i.to_le_bytes()), false)
                .unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
    });

    wait_until(Duration::from_secs(60), "half the stream delivered", || {
        leader.observations.delivered_len() >= 50
    });

    let victim = followers.pop().unwrap();
    let survivor = followers.pop().unwrap();
    row_hub.kill(victim.id);
    bulk_hub.kill(victim.id);

    // The survivors must agree on a two-member view.
    for node in [&leader, &survivor] {
        wait_until(Duration::from_secs(60), "two-member view installed", || {
            let view = node.manager.get_current_view();
            view.vid >= 1 && view.num_members() == 2
        });
    }

    sender_thread.join().unwrap();
    for node in [&leader, &survivor] {
        wait_until(Duration::from_secs(60), "the whole stream delivered", || {
            node.observations.delivered_len() >= total_messages as usize
        });
    }

    let leader_deliveries = leader.observations.delivered_clone();
    let survivor_deliveries = survivor.observations.delivered_clone();

    // Every payload message arrives exactly once, in payload order, at both survivors.
    for deliveries in [&leader_deliveries, &survivor_deliveries] {
        assert_eq!(deliveries.len(), total_messages as usize);
        for (k, message) in deliveries.iter().enumerate() {
            assert_eq!(message.sender, NodeId::new(0));
            assert_eq!(
                message.payload.as_deref(),
                Some((k as u32).to_le_bytes().as_slice())
            );
        }
    }

    // The cut fixed at cleanup time is identical: both survivors deliver the same messages in
    // the dying view, and the remainder carries the new view's id.
    let leader_old_view: Vec<_> = leader_deliveries.iter().filter(|d| d.version.unpack().0 == 0).collect();
    let survivor_old_view: Vec<_> =
        survivor_deliveries.iter().filter(|d| d.version.unpack().0 == 0).collect();
    assert_eq!(leader_old_view, survivor_old_view);
    assert!(leader_deliveries
        .iter()
        .skip(leader_old_view.len())
        .all(|d| d.version.unpack().0 >= 1));

    leader.manager.leave();
    survivor.manager.leave();
    drop(victim);
}

#[test]
fn a_node_joining_during_traffic_delivers_only_the_new_view() {
    setup_logger(LevelFilter::Info);
    let row_hub = MemRowHub::new();
    let bulk_hub = MemBulkHub::new();
    let dirs: Vec<tempfile::TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let mut ports = unique_ports(28600, 3);
    let leader_port = ports[0];
    let min_members = Arc::new(AtomicUsize::new(2));

    let leader_spec = spec(0, ports.pop_front().unwrap(), leader_port, min_members.clone(), &row_hub, &bulk_hub, &dirs[0]);
    let leader_thread = spawn_named("leader", move || start_node(leader_spec).unwrap());
    std::thread::sleep(Duration::from_millis(200));
    let follower_spec = spec(1, ports.pop_front().unwrap(), leader_port, min_members.clone(), &row_hub, &bulk_hub, &dirs[1]);
    let follower = start_node(follower_spec).unwrap();
    let leader = leader_thread.join().unwrap();

    for i in 0..50u32 {
        leader
            .manager
            .send(0, 4, |buf| buf.copy_from_slice(&i.to_le_bytes()), false)
            .unwrap();
    }
    wait_until(Duration::from_secs(60), "pre-join traffic delivered", || {
        leader.observations.delivered_len() >= 50 && follower.observations.delivered_len() >= 50
    });

    // The third node joins through the live leader; the steady-state join path runs a full view
    // change around it.
    let joiner_spec = spec(2, ports.pop_front().unwrap(), leader_port, min_members.clone(), &row_hub, &bulk_hub, &dirs[2]);
    let joiner = start_node(joiner_spec).unwrap();

    for node in [&leader, &follower, &joiner] {
        wait_until(Duration::from_secs(60), "three-member view installed", || {
            let view = node.manager.get_current_view();
            view.vid >= 1 && view.num_members() == 3
        });
    }

    for i in 50..60u32 {
        leader
            .manager
            .send(0, 4, |buf| buf.copy_from_slice(&i.to_le_bytes()), false)
            .unwrap();
    }
    wait_until(Duration::from_secs(60), "post-join traffic delivered everywhere", || {
        [&leader, &follower, &joiner].iter().all(|n| {
            n.observations
                .delivered_clone()
                .iter()
                .any(|d| d.payload.as_deref() == Some(59u32.to_le_bytes().as_slice()))
        })
    });

    // The joiner saw nothing from the old view.
    let joiner_deliveries = joiner.observations.delivered_clone();
    assert!(!joiner_deliveries.is_empty());
    assert!(joiner_deliveries.iter().all(|d| d.version.unpack().0 >= 1));

    leader.manager.leave();
    follower.manager.leave();
    joiner.manager.leave();
}

#[test]
fn a_partitioned_minority_aborts_and_the_majority_reforms() {
    setup_logger(LevelFilter::Info);
    let row_hub = MemRowHub::new();
    let bulk_hub = MemBulkHub::new();
    let dirs: Vec<tempfile::TempDir> = (0..5).map(|_| tempfile::tempdir().unwrap()).collect();
    let mut ports = unique_ports(29200, 5);
    let leader_port = ports[0];
    let min_members = Arc::new(AtomicUsize::new(5));

    let leader_spec = spec(0, ports.pop_front().unwrap(), leader_port, min_members.clone(), &row_hub, &bulk_hub, &dirs[0]);
    let leader_thread = spawn_named("leader", move || start_node(leader_spec).unwrap());
    std::thread::sleep(Duration::from_millis(200));
    let follower_threads: Vec<_> = (1..5)
        .map(|id| {
            let s = spec(id, ports.pop_front().unwrap(), leader_port, min_members.clone(), &row_hub, &bulk_hub, &dirs[id as usize]);
            spawn_named("follower", move || start_node(s).unwrap())
        })
        .collect();
    let leader = leader_thread.join().unwrap();
    let followers: Vec<TestNode> = follower_threads.into_iter().map(|t| t.join().unwrap()).collect();

    min_members.store(3, Ordering::SeqCst);

    // Sever nodes 3 and 4 from the leader's side.
    let majority: Vec<NodeId> = vec![NodeId::new(0), NodeId::new(1), NodeId::new(2)];
    let minority: Vec<NodeId> = vec![NodeId::new(3), NodeId::new(4)];
    row_hub.partition(&[&majority, &minority]);
    bulk_hub.partition(&[&majority, &minority]);

    // The two-node side is no longer in the majority and must raise the partition exception.
    for node in followers.iter().filter(|n| minority.contains(&n.id)) {
        wait_until(Duration::from_secs(60), "minority partition abort", || {
            node.manager.fatal_error() == Some(FatalError::PartitionAbort)
        });
    }

    // The three-node side completes a view change excluding the severed members.
    for node in std::iter::once(&leader).chain(followers.iter().filter(|n| majority.contains(&n.id))) {
        wait_until(Duration::from_secs(60), "majority view change", || {
            let view = node.manager.get_current_view();
            view.vid >= 1 && view.num_members() == 3
        });
        assert!(node.manager.fatal_error().is_none());
    }

    leader.manager.leave();
    drop(followers);
}
