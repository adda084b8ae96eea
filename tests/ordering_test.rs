//! Multi-sender total order: three interleaved senders must deliver in lexicographic
//! `(index, sender_rank)` order at every member, and large payloads must arrive through the bulk
//! transport with null messages keeping the non-senders' indices aligned.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use groupcast::types::basic::{DeliveryMode, NodeId, Version};
use groupcast::view::subgroup_info::SubgroupType;
use log::LevelFilter;

const MESSAGES_PER_SENDER: i32 = 30;

fn spec(id: u32, base_port: u16, leader_port: u16, min_members: usize, row_hub: &Arc<MemRowHub>, bulk_hub: &Arc<MemBulkHub>, dir: &tempfile::TempDir) -> NodeSpec {
    NodeSpec {
        id,
        base_port,
        leader_port,
        params: small_params(),
        type_order: vec![SubgroupType::raw("events")],
        subgroup_info: one_shard_for_all(DeliveryMode::Ordered, min_members),
        persistent_object: false,
        initial_object_versions: Vec::new(),
        storage_dir: dir.path().to_path_buf(),
        row_hub: row_hub.clone(),
        bulk_hub: bulk_hub.clone(),
    }
}

#[test]
fn three_senders_deliver_in_lexicographic_order() {
    setup_logger(LevelFilter::Info);
    let row_hub = MemRowHub::new();
    let bulk_hub = MemBulkHub::new();
    let dirs: Vec<tempfile::TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let mut ports = unique_ports(26000, 3);
    let leader_port = ports[0];

    let leader_spec = spec(0, ports.pop_front().unwrap(), leader_port, 3, &row_hub, &bulk_hub, &dirs[0]);
    let leader_thread = spawn_named("leader", move || start_node(leader_spec).unwrap());
    std::thread::sleep(Duration::from_millis(200));
    let follower_specs: Vec<NodeSpec> = (1..3)
        .map(|id| spec(id, ports.pop_front().unwrap(), leader_port, 3, &row_hub, &bulk_hub, &dirs[id as usize]))
        .collect();
    let follower_threads: Vec<_> = follower_specs
        .into_iter()
        .map(|s| spawn_named("follower", move || start_node(s).unwrap()))
        .collect();

    let mut nodes = vec![leader_thread.join().unwrap()];
    for t in follower_threads {
        nodes.push(t.join().unwrap());
    }

    // Member order decides sender ranks; it may differ from node-id order if the joiners raced.
    let members: Vec<NodeId> = nodes[0].manager.get_members();
    assert_eq!(members.len(), 3);
    let nodes: Arc<Vec<TestNode>> = Arc::new(nodes);

    // Round-robin in strict token order: sender rank r sends its k-th message only after
    // observing the delivery of its predecessor, which keeps every sender's next index at most
    // one ahead of its peers and therefore keeps null messages out of the stream.
    let mut sender_threads = Vec::new();
    for (rank, member) in members.iter().enumerate() {
        let nodes = nodes.clone();
        let members = members.clone();
        let member = *member;
        sender_threads.push(spawn_named("sender", move || {
            let node = nodes.iter().find(|n| n.id == member).unwrap();
            for k in 0..MESSAGES_PER_SENDER {
                let (predecessor, predecessor_index) = if rank == 0 {
                    if k == 0 {
                        (None, 0)
                    } else {
                        (Some(members[2]), k - 1)
                    }
                } else {
                    (Some(members[rank - 1]), k)
                };
                if let Some(predecessor) = predecessor {
                    wait_until(Duration::from_secs(60), "predecessor delivery", || {
                        node.observations
                            .delivered_clone()
                            .iter()
                            .any(|d| d.sender == predecessor && d.index == predecessor_index)
                    });
                }
                let payload = (member.int() * 1000 + k as u32).to_le_bytes();
                node.manager
                    .send(0, 4, |buf| buf.copy_from_slice(&payload), false)
                    .unwrap();
            }
        }));
    }
    for t in sender_threads {
        t.join().unwrap();
    }

    let total = (MESSAGES_PER_SENDER * 3) as usize;
    for node in nodes.iter() {
        wait_until(Duration::from_secs(60), "all 90 deliveries", || {
            node.observations.delivered_len() >= total
        });
    }

    for node in nodes.iter() {
        let delivered = node.observations.delivered_clone();
        assert_eq!(delivered.len(), total);
        for (n, message) in delivered.iter().enumerate() {
            let expected_index = (n / 3) as i32;
            let expected_sender = members[n % 3];
            assert_eq!(message.index, expected_index, "at node {} position {}", node.id, n);
            assert_eq!(message.sender, expected_sender, "at node {} position {}", node.id, n);
            assert_eq!(message.version, Version::pack(0, n as i32));
        }
        // The final sequence number of the run.
        assert_eq!(delivered.last().unwrap().version.unpack(), (0, 89));
    }

    for node in nodes.iter() {
        node.manager.leave();
    }
}

#[test]
fn large_payloads_travel_through_the_bulk_transport() {
    setup_logger(LevelFilter::Info);
    let row_hub = MemRowHub::new();
    let bulk_hub = MemBulkHub::new();
    let dirs: Vec<tempfile::TempDir> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
    let mut ports = unique_ports(27000, 2);
    let leader_port = ports[0];

    let leader_spec = spec(0, ports.pop_front().unwrap(), leader_port, 2, &row_hub, &bulk_hub, &dirs[0]);
    let leader_thread = spawn_named("leader", move || start_node(leader_spec).unwrap());
    std::thread::sleep(Duration::from_millis(200));
    let follower_spec = spec(1, ports.pop_front().unwrap(), leader_port, 2, &row_hub, &bulk_hub, &dirs[1]);
    let follower = start_node(follower_spec).unwrap();
    let leader = leader_thread.join().unwrap();

    // 512-byte payloads exceed the small-message threshold (128), forcing the bulk path. The
    // idle second member catches up through null messages, which never reach the callbacks.
    let num_messages = 10i32;
    for i in 0..num_messages {
        leader
            .manager
            .send(0, 512, |buf| buf.fill(i as u8), false)
            .unwrap();
    }

    for node in [&leader, &follower] {
        wait_until(Duration::from_secs(60), "10 bulk deliveries", || {
            node.observations.delivered_len() >= num_messages as usize
        });
        let delivered = node.observations.delivered_clone();
        assert_eq!(delivered.len(), num_messages as usize);
        for (k, message) in delivered.iter().enumerate() {
            assert_eq!(message.sender, NodeId::new(0));
            assert_eq!(message.index, k as i32);
            assert_eq!(message.payload.as_ref().map(|p| p.len()), Some(512));
            assert!(message.payload.as_ref().unwrap().iter().all(|b| *b == k as u8));
        }
        // Versions are monotone even though null messages occupy the odd sequence numbers.
        let versions: Vec<Version> = delivered.iter().map(|d| d.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
    }

    leader.manager.leave();
    follower.manager.leave();
}
