//! A single node starts a group alone, sends messages, and observes in-order delivery with
//! monotone versions through both the stability and RPC delivery paths.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use groupcast::types::basic::{DeliveryMode, NodeId, Version};
use groupcast::view::subgroup_info::SubgroupType;
use log::LevelFilter;

fn node_spec(base_port: u16, mode: DeliveryMode, row_hub: &Arc<MemRowHub>, bulk_hub: &Arc<MemBulkHub>, dir: &tempfile::TempDir) -> NodeSpec {
    NodeSpec {
        id: 0,
        base_port,
        leader_port: base_port,
        params: small_params(),
        type_order: vec![SubgroupType::raw("events")],
        subgroup_info: one_shard_for_all(mode, 1),
        persistent_object: false,
        initial_object_versions: Vec::new(),
        storage_dir: dir.path().to_path_buf(),
        row_hub: row_hub.clone(),
        bulk_hub: bulk_hub.clone(),
    }
}

#[test]
fn single_node_delivers_one_hundred_messages_in_index_order() {
    setup_logger(LevelFilter::Info);
    let row_hub = MemRowHub::new();
    let bulk_hub = MemBulkHub::new();
    let dir = tempfile::tempdir().unwrap();
    let mut ports = unique_ports(25000, 1);
    let node = start_node(node_spec(
        ports.pop_front().unwrap(),
        DeliveryMode::Ordered,
        &row_hub,
        &bulk_hub,
        &dir,
    ))
    .unwrap();

    for i in 0..100u32 {
        node.manager
            .send(0, 4, |buf| buf.copy_from_slice(&i.to_le_bytes()), false)
            .unwrap();
    }

    wait_until(Duration::from_secs(30), "100 deliveries", || {
        node.observations.delivered_len() == 100
    });

    let delivered = node.observations.delivered_clone();
    for (k, message) in delivered.iter().enumerate() {
        assert_eq!(message.sender, NodeId::new(0));
        assert_eq!(message.index, k as i32);
        assert_eq!(
            message.payload.as_deref(),
            Some((k as u32).to_le_bytes().as_slice())
        );
        // With a single sender, the sequence number equals the index; all in view 0.
        assert_eq!(message.version, Version::pack(0, k as i32));
    }
    // The delivery watermark reached exactly the last sequence number.
    assert_eq!(delivered.last().unwrap().version.unpack(), (0, 99));
    assert!(node.observations.rpc_calls.lock().unwrap().is_empty());

    node.manager.leave();
}

#[test]
fn cooked_sends_go_to_the_rpc_handler() {
    setup_logger(LevelFilter::Info);
    let row_hub = MemRowHub::new();
    let bulk_hub = MemBulkHub::new();
    let dir = tempfile::tempdir().unwrap();
    let mut ports = unique_ports(25300, 1);
    let node = start_node(node_spec(
        ports.pop_front().unwrap(),
        DeliveryMode::Ordered,
        &row_hub,
        &bulk_hub,
        &dir,
    ))
    .unwrap();

    let rpc_observations = node.observations.clone();
    node.manager.register_rpc_callback(Box::new(move |subgroup, sender, payload: &[u8]| {
        rpc_observations
            .rpc_calls
            .lock()
            .unwrap()
            .push((subgroup, sender, payload.to_vec()));
    }));

    node.manager
        .send(0, 5, |buf| buf.copy_from_slice(b"hello"), true)
        .unwrap();
    node.manager
        .send(0, 5, |buf| buf.copy_from_slice(b"world"), false)
        .unwrap();

    wait_until(Duration::from_secs(30), "both deliveries", || {
        node.observations.delivered_len() == 2
    });

    // The cooked message's bytes went to the RPC handler; its stability callback saw no payload.
    let rpc_calls = node.observations.rpc_calls.lock().unwrap().clone();
    assert_eq!(rpc_calls.len(), 1);
    assert_eq!(rpc_calls[0].2, b"hello");
    let delivered = node.observations.delivered_clone();
    assert_eq!(delivered[0].payload, None);
    assert_eq!(delivered[1].payload.as_deref(), Some(b"world".as_slice()));

    node.manager.leave();
}

#[test]
fn unordered_mode_delivers_immediately_without_versions() {
    setup_logger(LevelFilter::Info);
    let row_hub = MemRowHub::new();
    let bulk_hub = MemBulkHub::new();
    let dir = tempfile::tempdir().unwrap();
    let mut ports = unique_ports(25600, 1);
    let node = start_node(node_spec(
        ports.pop_front().unwrap(),
        DeliveryMode::Unordered,
        &row_hub,
        &bulk_hub,
        &dir,
    ))
    .unwrap();

    for i in 0..10u32 {
        node.manager
            .send(0, 4, |buf| buf.copy_from_slice(&i.to_le_bytes()), false)
            .unwrap();
    }

    wait_until(Duration::from_secs(30), "10 unordered deliveries", || {
        node.observations.delivered_len() == 10
    });

    for message in node.observations.delivered_clone() {
        assert_eq!(message.version, Version::INVALID);
    }

    node.manager.leave();
}
