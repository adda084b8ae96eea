//! Cold restart: a group with persistent state is killed outright, then restarted from its
//! on-disk views. The restart leader must refuse to start fresh, reconstruct a consistent cut,
//! and push the longest log to the other shard members before traffic resumes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use groupcast::types::basic::{DeliveryMode, Version};
use groupcast::view::subgroup_info::SubgroupType;
use log::LevelFilter;

fn spec(
    id: u32,
    base_port: u16,
    leader_port: u16,
    initial_object_versions: Vec<Version>,
    row_hub: &Arc<MemRowHub>,
    bulk_hub: &Arc<MemBulkHub>,
    dir: &std::path::Path,
) -> NodeSpec {
    NodeSpec {
        id,
        base_port,
        leader_port,
        params: small_params(),
        type_order: vec![SubgroupType::stateful("log")],
        subgroup_info: one_shard_for_all(DeliveryMode::Ordered, 2),
        persistent_object: true,
        initial_object_versions,
        storage_dir: dir.to_path_buf(),
        row_hub: row_hub.clone(),
        bulk_hub: bulk_hub.clone(),
    }
}

#[test]
fn cold_restart_rebuilds_a_consistent_cut_from_disk() {
    setup_logger(LevelFilter::Info);
    let dirs: Vec<tempfile::TempDir> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();

    // Phase 1: a two-node group with a persistent object delivers a stream of versions, then
    // dies without warning.
    let phase1_versions: Vec<Vec<Version>>;
    {
        let row_hub = MemRowHub::new();
        let bulk_hub = MemBulkHub::new();
        let mut ports = unique_ports(31000, 2);
        let leader_port = ports[0];
        let leader_spec = spec(0, ports.pop_front().unwrap(), leader_port, Vec::new(), &row_hub, &bulk_hub, dirs[0].path());
        let leader_thread = spawn_named("leader", move || start_node(leader_spec).unwrap());
        std::thread::sleep(Duration::from_millis(200));
        let follower_spec = spec(1, ports.pop_front().unwrap(), leader_port, Vec::new(), &row_hub, &bulk_hub, dirs[1].path());
        let follower = start_node(follower_spec).unwrap();
        let leader = leader_thread.join().unwrap();

        let num_messages = 20u32;
        for i in 0..num_messages {
            leader
                .manager
                .send(0, 4, |buf| buf.copy_from_slice(&i.to_le_bytes()), false)
                .unwrap();
        }
        for node in [&leader, &follower] {
            wait_until(Duration::from_secs(60), "phase-1 stream delivered", || {
                node.observations.delivered_len() >= num_messages as usize
            });
        }
        phase1_versions = vec![
            leader.object_state.lock().unwrap().versions.clone(),
            follower.object_state.lock().unwrap().versions.clone(),
        ];
        assert!(!phase1_versions[0].is_empty());
        // Both replicas staged the same versions before the crash.
        assert_eq!(phase1_versions[0], phase1_versions[1]);
        // Hard crash: no leave, no view change. The saved `view` files remain.
        drop(leader);
        drop(follower);
    }

    // Phase 2: both nodes restart over fresh transports and ports. The leader finds its view on
    // disk and enters recovery mode; the follower rejoins through it. The follower's log is
    // missing its tail, which the restart leader (longest log) pushes back.
    let row_hub = MemRowHub::new();
    let bulk_hub = MemBulkHub::new();
    let mut ports = unique_ports(31500, 2);
    let leader_port = ports[0];
    let mut follower_log = phase1_versions[1].clone();
    follower_log.truncate(follower_log.len() - 3);
    let leader_spec = spec(0, ports.pop_front().unwrap(), leader_port, phase1_versions[0].clone(), &row_hub, &bulk_hub, dirs[0].path());
    let leader_thread = spawn_named("restart_leader", move || start_node(leader_spec).unwrap());
    std::thread::sleep(Duration::from_millis(200));
    let follower_spec = spec(1, ports.pop_front().unwrap(), leader_port, follower_log, &row_hub, &bulk_hub, dirs[1].path());
    let follower = start_node(follower_spec).unwrap();
    let leader = leader_thread.join().unwrap();

    // The restart view succeeds the last installed one.
    for node in [&leader, &follower] {
        let view = node.manager.get_current_view();
        assert!(view.vid >= 1, "restart view must succeed the logged view");
        assert_eq!(view.num_members(), 2);
    }

    // State transfer restored the shard to the longest log.
    let leader_log = leader.object_state.lock().unwrap().versions.clone();
    let follower_log = follower.object_state.lock().unwrap().versions.clone();
    assert_eq!(leader_log, follower_log);
    assert_eq!(leader_log, phase1_versions[0]);

    // Traffic resumes in the restart view with versions above everything recovered.
    let resume_watermark = *leader_log.last().unwrap();
    for i in 0..5u32 {
        leader
            .manager
            .send(0, 4, |buf| buf.copy_from_slice(&i.to_le_bytes()), false)
            .unwrap();
    }
    for node in [&leader, &follower] {
        wait_until(Duration::from_secs(60), "post-restart deliveries", || {
            node.observations.delivered_len() >= 5
        });
        for message in node.observations.delivered_clone() {
            assert!(message.version > resume_watermark);
        }
    }

    leader.manager.leave();
    follower.manager.leave();
}
